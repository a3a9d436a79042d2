//! Micro-kernel call contract and size-keyed dispatch.
//!
//! Every kernel computes one exactly-sized `mr × nr` tile:
//!
//! ```text
//! C := alpha * op(A) * op(B) + beta * C      (beta == 0: C is never read)
//! C := post_ops(C)                           (last K slice only)
//! ```
//!
//! A [`KernelRegistry`] holds one kernel per (rows, cols) pair of its family
//! and covers any edge tile by greedy decomposition: for each dimension
//! independently, the largest supported size not exceeding what is left.

use std::fmt;
use std::sync::Arc;

use crate::{
    blocksize::Arch,
    element::{c32, c64, Dtype, Element},
    error::validation_error,
    postop::{PostOpAttr, PostOpList},
    Result,
};

pub mod reference;

#[cfg(all(avx2, target_arch = "x86_64"))]
pub mod avx2;

pub use reference::RefKernel;

/// Operands of one kernel invocation.
///
/// Element `(i, p)` of A is at `a + i * rs_a + p * cs_a`, `(p, j)` of B at
/// `b + p * rs_b + j * cs_b` and `(i, j)` of C at `c + i * rs_c + j * cs_c`.
#[derive(Debug, Clone, Copy)]
pub struct KernelArgs<T> {
    pub k: usize,
    pub a: *const T,
    pub rs_a: usize,
    pub cs_a: usize,
    pub b: *const T,
    pub rs_b: usize,
    pub cs_b: usize,
    pub c: *mut T,
    pub rs_c: usize,
    pub cs_c: usize,
    pub alpha: T,
    pub beta: T,
    pub conj_a: bool,
    pub conj_b: bool,
}

impl<T: Element> KernelArgs<T> {
    /// The same call moved to the sub-tile at `(i, j)`.
    #[inline]
    fn offset(&self, i: usize, j: usize) -> Self {
        KernelArgs {
            a: self.a.wrapping_add(i * self.rs_a),
            b: self.b.wrapping_add(j * self.cs_b),
            c: self.c.wrapping_add(i * self.rs_c + j * self.cs_c),
            ..*self
        }
    }
}

/// A fixed-shape tile kernel.
pub trait MicroKernel<T>: Send + Sync {
    fn mr(&self) -> usize;

    fn nr(&self) -> usize;

    fn name(&self) -> &'static str;

    /// Computes the `mr × nr` tile described by `args`.
    ///
    /// # Safety
    ///
    /// The A, B and C footprints implied by `args` and the kernel shape must
    /// be valid, and C must not be read or written concurrently.
    unsafe fn run(&self, args: &KernelArgs<T>, post_ops: &PostOpList<T>, attr: &PostOpAttr);
}

/// Successive `(offset, size index)` steps covering `extent` greedily.
struct Greedy<'a> {
    sizes: &'a [usize],
    offset: usize,
    remaining: usize,
}

impl Iterator for Greedy<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.sizes.iter().position(|&s| s <= self.remaining)?;
        let step = (self.offset, idx);
        self.offset += self.sizes[idx];
        self.remaining -= self.sizes[idx];
        Some(step)
    }
}

/// A piece of an edge tile: offset and exact kernel shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePiece {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

/// Kernels of one family keyed by (rows, cols).
pub struct KernelRegistry<T> {
    rows: Vec<usize>,
    cols: Vec<usize>,
    // table[row index][col index]
    table: Vec<Vec<Arc<dyn MicroKernel<T>>>>,
}

impl<T: Element> fmt::Debug for KernelRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("max", &self.table[0][0].name())
            .finish()
    }
}

impl<T: Element> KernelRegistry<T> {
    /// Builds a registry over `rows × cols`, asking `make` for each kernel.
    ///
    /// Both lists must be strictly descending and end in 1, so that any
    /// extent has a greedy cover.
    pub fn new(
        rows: &[usize],
        cols: &[usize],
        mut make: impl FnMut(usize, usize) -> Arc<dyn MicroKernel<T>>,
    ) -> Result<Self> {
        for (what, list) in [("row", rows), ("column", cols)] {
            if list.last() != Some(&1) || list.windows(2).any(|w| w[0] <= w[1]) {
                return Err(validation_error(format!(
                    "{what} sizes {list:?} must be strictly descending and end in 1"
                )));
            }
        }

        let mut table = Vec::with_capacity(rows.len());
        for &r in rows {
            let mut line = Vec::with_capacity(cols.len());
            for &c in cols {
                let kernel = make(r, c);
                if kernel.mr() != r || kernel.nr() != c {
                    return Err(validation_error(format!(
                        "kernel {} is {}x{}, registered as {r}x{c}",
                        kernel.name(),
                        kernel.mr(),
                        kernel.nr()
                    )));
                }
                line.push(kernel);
            }
            table.push(line);
        }

        Ok(KernelRegistry {
            rows: rows.to_vec(),
            cols: cols.to_vec(),
            table,
        })
    }

    /// A registry of reference kernels for the family of `T`.
    pub fn reference() -> Result<Self> {
        let (rows, cols) = family_sizes(T::DTYPE);
        Self::new(rows, cols, reference::make::<T>)
    }

    /// Largest row size; the MR of the family.
    pub fn mr(&self) -> usize {
        self.rows[0]
    }

    /// Largest column size; the NR of the family.
    pub fn nr(&self) -> usize {
        self.cols[0]
    }

    /// The kernel registered for exactly `rows × cols`.
    pub fn get(&self, rows: usize, cols: usize) -> Option<&Arc<dyn MicroKernel<T>>> {
        let ri = self.rows.iter().position(|&r| r == rows)?;
        let ci = self.cols.iter().position(|&c| c == cols)?;
        Some(&self.table[ri][ci])
    }

    /// Replaces the kernel of its shape.
    pub fn replace(&mut self, kernel: Arc<dyn MicroKernel<T>>) -> Result<()> {
        let shape = (kernel.mr(), kernel.nr());
        let ri = self.rows.iter().position(|&r| r == shape.0);
        let ci = self.cols.iter().position(|&c| c == shape.1);
        match (ri, ci) {
            (Some(ri), Some(ci)) => {
                self.table[ri][ci] = kernel;
                Ok(())
            }
            _ => Err(validation_error(format!(
                "{}x{} is not a shape of this family",
                shape.0, shape.1
            ))),
        }
    }

    fn greedy<'a>(sizes: &'a [usize], extent: usize) -> Greedy<'a> {
        Greedy {
            sizes,
            offset: 0,
            remaining: extent,
        }
    }

    /// The deterministic cover of an `m0 × n0` tile by exact kernel shapes.
    pub fn decompose(&self, m0: usize, n0: usize) -> Vec<TilePiece> {
        let mut pieces = Vec::new();
        for (row, ri) in Self::greedy(&self.rows, m0) {
            for (col, ci) in Self::greedy(&self.cols, n0) {
                pieces.push(TilePiece {
                    row,
                    col,
                    rows: self.rows[ri],
                    cols: self.cols[ci],
                });
            }
        }
        pieces
    }

    /// Runs a tile of at most MR rows and any number of columns.
    ///
    /// # Safety
    ///
    /// As for [`MicroKernel::run`] over the whole `m0 × n0` tile.
    #[inline]
    pub unsafe fn run_edge(
        &self,
        m0: usize,
        n0: usize,
        args: &KernelArgs<T>,
        post_ops: &PostOpList<T>,
        attr: &PostOpAttr,
    ) {
        for (row, ri) in Self::greedy(&self.rows, m0) {
            let line = &self.table[ri];
            for (col, ci) in Self::greedy(&self.cols, n0) {
                line[ci].run(&args.offset(row, col), post_ops, &attr.offset(row, col));
            }
        }
    }

    /// Runs an `m0 × n0` block whose A rows are stored in MR-row panels
    /// `ps_a` elements apart; row `i` of A is at
    /// `a + (i / MR) * ps_a + (i % MR) * rs_a`.
    ///
    /// # Safety
    ///
    /// As for [`MicroKernel::run`] over every panel of the block.
    pub unsafe fn run_block(
        &self,
        m0: usize,
        n0: usize,
        args: &KernelArgs<T>,
        ps_a: usize,
        post_ops: &PostOpList<T>,
        attr: &PostOpAttr,
    ) {
        let mr = self.mr();
        let mut panel = *args;
        for ir in (0..m0).step_by(mr) {
            self.run_edge(mr.min(m0 - ir), n0, &panel, post_ops, &attr.offset(ir, 0));
            panel.a = panel.a.wrapping_add(ps_a);
            panel.c = panel.c.wrapping_add(mr * args.rs_c);
        }
    }
}

const REAL_ROWS: &[usize] = &[6, 4, 2, 1];
const COMPLEX_ROWS: &[usize] = &[3, 2, 1];
const S_COLS: &[usize] = &[16, 12, 8, 4, 2, 1];
const D_COLS: &[usize] = &[8, 4, 2, 1];
const C_COLS: &[usize] = &[8, 4, 2, 1];
const Z_COLS: &[usize] = &[4, 2, 1];

/// Descending (rows, cols) supported by the family of `dtype`.
pub fn family_sizes(dtype: Dtype) -> (&'static [usize], &'static [usize]) {
    match dtype {
        Dtype::F32 => (REAL_ROWS, S_COLS),
        Dtype::F64 => (REAL_ROWS, D_COLS),
        Dtype::C32 => (COMPLEX_ROWS, C_COLS),
        Dtype::C64 => (COMPLEX_ROWS, Z_COLS),
    }
}

/// Kernel registries of all four element types.
#[derive(Debug)]
pub struct KernelTables {
    pub s: KernelRegistry<f32>,
    pub d: KernelRegistry<f64>,
    pub c: KernelRegistry<c32>,
    pub z: KernelRegistry<c64>,
}

impl KernelTables {
    pub fn for_arch(arch: Arch) -> Result<Self> {
        #[allow(unused_mut)]
        let mut s = KernelRegistry::<f32>::reference()?;

        #[cfg(all(avx2, target_arch = "x86_64"))]
        {
            if arch == Arch::Haswell {
                avx2::register(&mut s)?;
            }
        }
        #[cfg(not(all(avx2, target_arch = "x86_64")))]
        let _ = arch;

        Ok(KernelTables {
            s,
            d: KernelRegistry::reference()?,
            c: KernelRegistry::reference()?,
            z: KernelRegistry::reference()?,
        })
    }
}
