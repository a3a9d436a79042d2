use std::env;
use std::process::Command;

// CPU features the kernels can use
#[derive(PartialEq, Eq, Debug)]
struct CpuFeature {
    name: &'static str,
    // every token must be reported by the host
    requires: &'static [&'static str],
    cfg_flag: &'static str,
    detected: bool,
}

impl CpuFeature {
    fn features() -> Vec<CpuFeature> {
        vec![CpuFeature {
            name: "avx2+fma",
            requires: &["avx2", "fma"],
            cfg_flag: "avx2",
            detected: false,
        }]
    }
}

// Feature detection trait to make implementations more modular
trait CpuFeatureDetector {
    fn detect_features(&self, features: &mut [CpuFeature]);
    fn is_applicable(&self) -> bool;
}

// Linux CPU feature detector
struct LinuxDetector;
impl CpuFeatureDetector for LinuxDetector {
    fn detect_features(&self, features: &mut [CpuFeature]) {
        if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
            let flags: Vec<String> = cpuinfo
                .lines()
                .filter(|line| line.starts_with("flags"))
                .flat_map(|line| line.split_whitespace().map(str::to_lowercase))
                .collect();
            for feature in features.iter_mut() {
                feature.detected = feature.requires.iter().all(|r| flags.iter().any(|f| f == r));
            }
        }
    }

    fn is_applicable(&self) -> bool {
        cfg!(target_os = "linux")
    }
}

// macOS CPU feature detector
struct MacOSDetector;
impl CpuFeatureDetector for MacOSDetector {
    fn detect_features(&self, features: &mut [CpuFeature]) {
        let output = Command::new("sysctl").args(["-a"]).output();

        if let Ok(output) = output {
            let contents = String::from_utf8_lossy(&output.stdout).to_lowercase();

            for feature in features.iter_mut() {
                feature.detected = feature.requires.iter().all(|r| match *r {
                    "avx2" => contents.contains("hw.optional.avx2_0: 1"),
                    "fma" => contents.contains("hw.optional.fma: 1"),
                    _ => false,
                });
            }
        }
    }

    fn is_applicable(&self) -> bool {
        cfg!(target_os = "macos")
    }
}

// No windows detector for now
// TODO: Develop a Windows detector (Access to a windows machine needed)

struct PlatformDetector;
impl PlatformDetector {
    fn cpu_features_detectors() -> Vec<Box<dyn CpuFeatureDetector>> {
        vec![Box::new(LinuxDetector), Box::new(MacOSDetector)]
    }

    fn detect_cpu_features(features: &mut [CpuFeature]) {
        for detector in Self::cpu_features_detectors() {
            if detector.is_applicable() {
                detector.detect_features(features);
                break;
            }
        }
    }

    fn apply(features: &[CpuFeature]) {
        // kernels enable their target features per function, so only the
        // cfg flag is emitted here
        let cfg_flag = features
            .iter()
            .find(|cpu_feature| cpu_feature.detected)
            .map(|cpu_feature| {
                println!("detected: {}", cpu_feature.name);
                cpu_feature.cfg_flag
            })
            .unwrap_or("fallback");

        println!("applying: {cfg_flag}");

        println!("cargo:rustc-cfg={cfg_flag}");

        println!("cargo::rustc-check-cfg=cfg(avx2)");
        println!("cargo::rustc-check-cfg=cfg(fallback)");
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let mut features = CpuFeature::features();

    // Determine if we're cross-compiling
    let host = env::var("HOST").unwrap_or_default();
    let target = env::var("TARGET").unwrap_or_default();

    // Only run CPU detection for native x86_64 builds
    if host == target && target.starts_with("x86_64") {
        PlatformDetector::detect_cpu_features(&mut features);
    }

    PlatformDetector::apply(&features);
}
