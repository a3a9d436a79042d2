//! AVX2/FMA kernels for `f32`.
//!
//! Rows {6, 4, 2, 1} × columns {16, 8}; the remaining shapes of the family
//! keep their reference kernels. Accumulators live in `MR × NV` YMM
//! registers (NV = NR / 8). B rows are loaded directly when contiguous and
//! gathered through the stack otherwise; row-stored C without post-ops is
//! updated in registers, every other output goes through a stack tile.

use std::arch::x86_64::*;
use std::sync::Arc;

use crate::{
    postop::{PostOpAttr, PostOpList},
    Result,
};

use super::{KernelArgs, KernelRegistry, MicroKernel};

const LANES: usize = 8;

/// `MR × (NV * 8)` AVX2 kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Avx2Kernel<const MR: usize, const NV: usize>;

impl<const MR: usize, const NV: usize> MicroKernel<f32> for Avx2Kernel<MR, NV> {
    fn mr(&self) -> usize {
        MR
    }

    fn nr(&self) -> usize {
        NV * LANES
    }

    fn name(&self) -> &'static str {
        "avx2"
    }

    unsafe fn run(&self, args: &KernelArgs<f32>, post_ops: &PostOpList<f32>, attr: &PostOpAttr) {
        kernel::<MR, NV>(args, post_ops, attr)
    }
}

#[target_feature(enable = "avx2,fma")]
unsafe fn kernel<const MR: usize, const NV: usize>(
    args: &KernelArgs<f32>,
    post_ops: &PostOpList<f32>,
    attr: &PostOpAttr,
) {
    let mut acc = [[_mm256_setzero_ps(); NV]; MR];
    let mut b_row = [_mm256_setzero_ps(); NV];
    let mut gather = [0.0f32; 2 * LANES];

    for p in 0..args.k {
        let bp = args.b.add(p * args.rs_b);
        if args.cs_b == 1 {
            for (v, b) in b_row.iter_mut().enumerate() {
                *b = _mm256_loadu_ps(bp.add(v * LANES));
            }
        } else {
            for (j, g) in gather.iter_mut().take(NV * LANES).enumerate() {
                *g = *bp.add(j * args.cs_b);
            }
            for (v, b) in b_row.iter_mut().enumerate() {
                *b = _mm256_loadu_ps(gather.as_ptr().add(v * LANES));
            }
        }

        let ap = args.a.add(p * args.cs_a);
        for (i, row) in acc.iter_mut().enumerate() {
            let a = _mm256_set1_ps(*ap.add(i * args.rs_a));
            for (c, &b) in row.iter_mut().zip(b_row.iter()) {
                *c = _mm256_fmadd_ps(a, b, *c);
            }
        }
    }

    let alpha = _mm256_set1_ps(args.alpha);
    for row in acc.iter_mut() {
        for c in row.iter_mut() {
            *c = _mm256_mul_ps(alpha, *c);
        }
    }

    let beta_zero = args.beta == 0.0;
    let fuse = attr.is_last_k && !post_ops.is_empty();

    if args.cs_c == 1 && !fuse {
        let beta = _mm256_set1_ps(args.beta);
        for (i, row) in acc.iter().enumerate() {
            let cp = args.c.add(i * args.rs_c);
            for (v, &r) in row.iter().enumerate() {
                let dst = cp.add(v * LANES);
                let out = if beta_zero {
                    r
                } else {
                    _mm256_fmadd_ps(beta, _mm256_loadu_ps(dst), r)
                };
                _mm256_storeu_ps(dst, out);
            }
        }
        return;
    }

    // column-stored C or fused post-ops
    let mut tile = [[0.0f32; 2 * LANES]; MR];
    for (row, regs) in tile.iter_mut().zip(acc.iter()) {
        for (v, &r) in regs.iter().enumerate() {
            _mm256_storeu_ps(row.as_mut_ptr().add(v * LANES), r);
        }
    }
    for (i, row) in tile.iter().enumerate() {
        for (j, &t) in row.iter().take(NV * LANES).enumerate() {
            let dst = args.c.add(i * args.rs_c + j * args.cs_c);
            let mut out = t;
            if !beta_zero {
                out = args.beta.mul_add(*dst, out);
            }
            if fuse {
                out = post_ops.apply(out, attr.post_op_c_i + i, attr.post_op_c_j + j);
            }
            *dst = out;
        }
    }
}

/// Installs the AVX2 kernels when the running CPU has AVX2 and FMA.
pub(crate) fn register(registry: &mut KernelRegistry<f32>) -> Result<()> {
    if !(is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")) {
        return Ok(());
    }
    let kernels: [Arc<dyn MicroKernel<f32>>; 8] = [
        Arc::new(Avx2Kernel::<6, 2>),
        Arc::new(Avx2Kernel::<6, 1>),
        Arc::new(Avx2Kernel::<4, 2>),
        Arc::new(Avx2Kernel::<4, 1>),
        Arc::new(Avx2Kernel::<2, 2>),
        Arc::new(Avx2Kernel::<2, 1>),
        Arc::new(Avx2Kernel::<1, 2>),
        Arc::new(Avx2Kernel::<1, 1>),
    ];
    for kernel in kernels {
        registry.replace(kernel)?;
    }
    Ok(())
}
