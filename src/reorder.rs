//! Ahead-of-time reordered operands and the offset arithmetic that navigates
//! them.
//!
//! A reordered operand is packed once, stored contiguously, and reused by many
//! calls. The two layouts below are produced by [`reorder_a`] and
//! [`reorder_b`]; [`a_block_offset`] and [`locate_b`] are their exact inverses
//! as seen from the driver's loop coordinates.
//!
//! A (`m × k`, MR-row panels). For each KC slice `pc` the slice starts at
//! `pc * round_up(m, MR)`; row panel `ic / MR` of the slice starts at
//! `ic * kc0` within it.
//!
//! B (`k × n`, NR-column panels). For each NC column block starting at `jb`
//! the block starts at `jb * k` and has padded width `w = NC`, or
//! `round_up(n - jb, NR)` for the last block. KC slice `pc` of the block
//! starts at `w * pc`; column `j` of the slice (a multiple of NR) starts at
//! `j * kc0`.

use std::cmp::min;

use tracing::debug;

use crate::{
    blocksize::{round_up, BlockSizes},
    context::Context,
    element::Element,
    error::{reorder_mismatch, validation_error},
    pack::{pack_panels, PackSchema},
    view::MatRef,
    Result,
};

/// A persistently packed operand.
#[derive(Debug, Clone)]
pub struct Reordered<T> {
    data: Vec<T>,
    schema: PackSchema,
    rows: usize,
    cols: usize,
    extent: usize,
    kc: usize,
    nc: usize,
}

impl<T: Element> Reordered<T> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn schema(&self) -> PackSchema {
        self.schema
    }

    /// The packed storage.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub(crate) fn as_ptr(&self) -> *const T {
        self.data.as_ptr()
    }

    /// Rejects use under block sizes other than the ones it was packed with.
    pub fn check_layout(&self, schema: PackSchema, bs: &BlockSizes) -> Result<()> {
        if self.schema != schema {
            return Err(reorder_mismatch(format!(
                "operand packed as {:?}, used as {schema:?}",
                self.schema
            )));
        }
        let (extent, nc) = match schema {
            PackSchema::RowPanels => (bs.mr, self.nc),
            PackSchema::ColPanels => (bs.nr, bs.nc),
        };
        if self.extent != extent || self.kc != bs.kc || self.nc != nc {
            return Err(reorder_mismatch(format!(
                "packed with extent {} KC {} NC {}, context uses extent {extent} KC {} NC {nc}",
                self.extent, self.kc, self.nc, bs.kc
            )));
        }
        Ok(())
    }
}

/// Element count of the reordered form of a `rows × cols` operand.
pub fn reorder_buf_len(bs: &BlockSizes, schema: PackSchema, rows: usize, cols: usize) -> usize {
    match schema {
        PackSchema::RowPanels => round_up(rows, bs.mr) * cols,
        PackSchema::ColPanels => {
            let (k, n) = (rows, cols);
            if n == 0 {
                return 0;
            }
            let last = (n - 1) / bs.nc * bs.nc;
            (last + round_up(n - last, bs.nr)) * k
        }
    }
}

/// Packs `a` (`m × k`) into the reordered A layout of `ctx`.
pub fn reorder_a<T: Element>(ctx: &Context, a: MatRef<'_, T>) -> Result<Reordered<T>> {
    let bs = ctx.block_sizes::<T>();
    let (m, k) = (a.rows(), a.cols());
    let mp = round_up(m, bs.mr);
    let mut data = try_zeroed::<T>(reorder_buf_len(&bs, PackSchema::RowPanels, m, k))?;

    for pc in (0..k).step_by(bs.kc) {
        let kc0 = min(bs.kc, k - pc);
        // SAFETY: slice pc spans mp * kc0 elements starting at pc * mp.
        unsafe {
            pack_panels(
                data.as_mut_ptr().add(pc * mp),
                a.offset_ptr(0, pc),
                m,
                kc0,
                a.rs(),
                a.cs(),
                bs.mr,
                a.is_conj(),
                T::one(),
            );
        }
    }

    debug!(m, k, len = data.len(), "reordered A");
    Ok(Reordered {
        data,
        schema: PackSchema::RowPanels,
        rows: m,
        cols: k,
        extent: bs.mr,
        kc: bs.kc,
        nc: 0,
    })
}

/// Packs `b` (`k × n`) into the reordered B layout of `ctx`.
pub fn reorder_b<T: Element>(ctx: &Context, b: MatRef<'_, T>) -> Result<Reordered<T>> {
    let bs = ctx.block_sizes::<T>();
    let (k, n) = (b.rows(), b.cols());
    let mut data = try_zeroed::<T>(reorder_buf_len(&bs, PackSchema::ColPanels, k, n))?;

    for jb in (0..n).step_by(bs.nc) {
        let nb = min(bs.nc, n - jb);
        let width = round_up(nb, bs.nr);
        for pc in (0..k).step_by(bs.kc) {
            let kc0 = min(bs.kc, k - pc);
            // SAFETY: the slice spans width * kc0 elements at jb * k + width * pc.
            unsafe {
                pack_panels(
                    data.as_mut_ptr().add(jb * k + width * pc),
                    b.offset_ptr(pc, jb),
                    nb,
                    kc0,
                    b.cs(),
                    b.rs(),
                    bs.nr,
                    b.is_conj(),
                    T::one(),
                );
            }
        }
    }

    debug!(k, n, len = data.len(), "reordered B");
    Ok(Reordered {
        data,
        schema: PackSchema::ColPanels,
        rows: k,
        cols: n,
        extent: bs.nr,
        kc: bs.kc,
        nc: bs.nc,
    })
}

fn try_zeroed<T: Element>(len: usize) -> Result<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| {
        crate::error::allocation_error(len * std::mem::size_of::<T>(), std::mem::align_of::<T>(), e.to_string())
    })?;
    data.resize(len, T::zero());
    Ok(data)
}

// === Navigation ===

/// Offset of row block `ic` of KC slice `pc` in a reordered A of `m` rows.
#[inline]
pub fn a_block_offset(ic: usize, pc: usize, m: usize, mr: usize, kc0: usize) -> usize {
    debug_assert_eq!(ic % mr, 0);
    pc * round_up(m, mr) + ic * kc0
}

/// Where a thread's column block lands in a reordered B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BPanelLocation {
    /// First column of the NC block containing `jc`.
    pub panel_start: usize,
    /// Columns between `panel_start` and `jc`.
    pub offset: usize,
    /// Width the thread may process before crossing into the next NC block.
    pub nc0: usize,
    /// Padded width of the NC block, the stride between its KC slices.
    pub kdim_stride: usize,
}

impl BPanelLocation {
    /// Offset of KC slice `pc` (depth `kc0`) for a `k`-deep operand.
    #[inline]
    pub fn slice_offset(&self, k: usize, pc: usize, kc0: usize) -> usize {
        self.panel_start * k + self.kdim_stride * pc + self.offset * kc0
    }
}

/// Locates the block of `nc0` columns starting at `jc` in a reordered B with
/// `n` columns.
///
/// A thread's column range need not start on an NC boundary, so the block may
/// start mid-panel and must stop at the end of the NC block that contains
/// `jc`; the caller advances by the returned `nc0`.
pub fn locate_b(jc: usize, nc0: usize, n: usize, nc: usize, nr: usize) -> BPanelLocation {
    let panel_start = (jc / nc) * nc;
    let offset = jc - panel_start;
    let nc0 = if jc + nc0 > panel_start + nc { nc - offset } else { nc0 };
    let kdim_stride = if panel_start + nc > n {
        round_up(n - panel_start, nr)
    } else {
        nc
    };
    BPanelLocation {
        panel_start,
        offset,
        nc0,
        kdim_stride,
    }
}

/// Checks an operand's schema against the slot it is passed in.
pub(crate) fn check_reordered<T: Element>(r: &Reordered<T>, schema: PackSchema, bs: &BlockSizes) -> Result<()> {
    r.check_layout(schema, bs)?;
    if r.data.len() != reorder_buf_len(bs, schema, r.rows, r.cols) {
        return Err(validation_error("reordered buffer length does not match its shape"));
    }
    Ok(())
}
