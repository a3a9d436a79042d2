//! Cache-blocking parameters.
//!
//! The values are offline-tuned constants per (architecture, element type).
//! MR×NR is fixed by the kernel family of each type; MC, NC and KC may be
//! overridden through [`crate::ContextBuilder`] as long as the tiling
//! invariants hold.

use crate::{element::Dtype, error::invalid_block_sizes, Result};

/// Target microarchitecture of the kernel and block-size tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// x86_64 with AVX2 and FMA.
    Haswell,
    /// Anything else; reference kernels only.
    Generic,
}

impl Arch {
    /// Detects the best architecture this process can run.
    pub fn detect() -> Arch {
        #[cfg(all(avx2, target_arch = "x86_64"))]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return Arch::Haswell;
            }
        }
        Arch::Generic
    }
}

/// The block-size set of one element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizes {
    /// Micro-tile rows.
    pub mr: usize,
    /// Micro-tile columns.
    pub nr: usize,
    /// Row block (L2).
    pub mc: usize,
    /// Column block (L3).
    pub nc: usize,
    /// Depth block (L1).
    pub kc: usize,
}

impl BlockSizes {
    pub const fn new(mr: usize, nr: usize, mc: usize, nc: usize, kc: usize) -> Self {
        BlockSizes { mr, nr, mc, nc, kc }
    }

    /// Checks that packed panels tile the macro-blocks exactly.
    pub fn validate(&self) -> Result<()> {
        let BlockSizes { mr, nr, mc, nc, kc } = *self;
        if mr == 0 || nr == 0 || mc == 0 || nc == 0 || kc == 0 {
            return Err(invalid_block_sizes(format!("all entries must be non-zero: {self:?}")));
        }
        if mc % mr != 0 {
            return Err(invalid_block_sizes(format!("MC {mc} is not a multiple of MR {mr}")));
        }
        if nc % nr != 0 {
            return Err(invalid_block_sizes(format!("NC {nc} is not a multiple of NR {nr}")));
        }
        Ok(())
    }

    /// Returns a copy with new macro-block sizes; the micro-tile is kept.
    pub fn with_macro(self, mc: usize, nc: usize, kc: usize) -> Self {
        BlockSizes { mc, nc, kc, ..self }
    }
}

/// Rounds `x` up to a multiple of `unit`.
#[inline(always)]
pub(crate) fn round_up(x: usize, unit: usize) -> usize {
    x.div_ceil(unit) * unit
}

/// Tuned defaults for `dtype` on `arch`.
pub fn default_block_sizes(arch: Arch, dtype: Dtype) -> BlockSizes {
    match (arch, dtype) {
        (Arch::Haswell, Dtype::F32) => BlockSizes::new(6, 16, 168, 4080, 256),
        (Arch::Haswell, Dtype::F64) => BlockSizes::new(6, 8, 72, 4080, 256),
        (Arch::Haswell, Dtype::C32) => BlockSizes::new(3, 8, 72, 4080, 256),
        (Arch::Haswell, Dtype::C64) => BlockSizes::new(3, 4, 36, 4080, 256),
        (Arch::Generic, Dtype::F32) => BlockSizes::new(6, 16, 96, 4080, 128),
        (Arch::Generic, Dtype::F64) => BlockSizes::new(6, 8, 72, 4080, 128),
        (Arch::Generic, Dtype::C32) => BlockSizes::new(3, 8, 48, 4080, 128),
        (Arch::Generic, Dtype::C64) => BlockSizes::new(3, 4, 36, 4080, 128),
    }
}

/// Per-type block-size table held by a [`crate::Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeTable {
    s: BlockSizes,
    d: BlockSizes,
    c: BlockSizes,
    z: BlockSizes,
}

impl BlockSizeTable {
    pub fn for_arch(arch: Arch) -> Self {
        BlockSizeTable {
            s: default_block_sizes(arch, Dtype::F32),
            d: default_block_sizes(arch, Dtype::F64),
            c: default_block_sizes(arch, Dtype::C32),
            z: default_block_sizes(arch, Dtype::C64),
        }
    }

    pub fn get(&self, dtype: Dtype) -> BlockSizes {
        match dtype {
            Dtype::F32 => self.s,
            Dtype::F64 => self.d,
            Dtype::C32 => self.c,
            Dtype::C64 => self.z,
        }
    }

    /// Replaces MC/NC/KC of `dtype`; MR/NR stay those of the kernel family.
    pub fn set_macro(&mut self, dtype: Dtype, mc: usize, nc: usize, kc: usize) -> Result<()> {
        let slot = match dtype {
            Dtype::F32 => &mut self.s,
            Dtype::F64 => &mut self.d,
            Dtype::C32 => &mut self.c,
            Dtype::C64 => &mut self.z,
        };
        let updated = slot.with_macro(mc, nc, kc);
        updated.validate()?;
        *slot = updated;
        Ok(())
    }
}
