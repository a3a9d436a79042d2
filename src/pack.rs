//! Packing of operand slices into micro-panels.
//!
//! One routine serves both schemas. A slice of `mn × k` elements (where `mn`
//! runs along the panel dimension) is cut into panels of `extent` consecutive
//! `mn` indices; each panel is stored k-major, so element `(i, p)` of panel
//! `q` lands at `q * extent * k + p * extent + i`. The final partial panel is
//! zero-padded up to `extent`.
//!
//! - [`PackSchema::RowPanels`]: A operand, panels of MR rows, `k` = columns.
//! - [`PackSchema::ColPanels`]: B operand, panels of NR columns, `k` = rows.

use std::cmp::min;

use tracing::trace;

use crate::{
    blocksize::round_up,
    element::Element,
    error::validation_error,
    view::MatRef,
    Result,
};

/// Panel layout of a packed operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackSchema {
    /// MR-row panels, used for A.
    RowPanels,
    /// NR-column panels, used for B.
    ColPanels,
}

impl PackSchema {
    /// `(panel dimension, depth)` of a `rows × cols` operand.
    pub fn dims(self, rows: usize, cols: usize) -> (usize, usize) {
        match self {
            PackSchema::RowPanels => (rows, cols),
            PackSchema::ColPanels => (cols, rows),
        }
    }
}

/// Elements needed to pack `mn` panel-dimension indices at depth `k`.
#[inline]
pub fn packed_len(mn: usize, k: usize, extent: usize) -> usize {
    round_up(mn, extent) * k
}

/// Packs `mn × k` elements read from `src` into panels at `dst`.
///
/// `inc_mn` and `inc_k` are the source strides along the panel dimension and
/// the depth. `kappa` scales every element and is skipped when it is one.
///
/// # Safety
///
/// `src` must be readable at `i * inc_mn + p * inc_k` for `i < mn`, `p < k`,
/// and `dst` writable for `packed_len(mn, k, extent)` elements.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn pack_panels<T: Element>(
    dst: *mut T,
    src: *const T,
    mn: usize,
    k: usize,
    inc_mn: usize,
    inc_k: usize,
    extent: usize,
    conj: bool,
    kappa: T,
) {
    let scale = kappa != T::one();
    let load = |i: usize, p: usize| {
        let mut v = *src.add(i * inc_mn + p * inc_k);
        if conj {
            v = v.conj();
        }
        if scale {
            v = kappa * v;
        }
        v
    };

    let mut panel = dst;
    for q in (0..mn).step_by(extent) {
        let rem = min(extent, mn - q);
        if rem == extent && inc_mn == 1 && !conj && !scale {
            // contiguous along the panel: straight copies
            for p in 0..k {
                std::ptr::copy_nonoverlapping(src.add(q + p * inc_k), panel.add(p * extent), extent);
            }
        } else {
            for p in 0..k {
                let row = panel.add(p * extent);
                for i in 0..rem {
                    *row.add(i) = load(q + i, p);
                }
                for i in rem..extent {
                    *row.add(i) = T::zero();
                }
            }
        }
        panel = panel.add(extent * k);
    }
}

/// Packs `src` into `dst` following `schema`.
///
/// `dst` must hold exactly [`packed_len`] elements for the operand's panel
/// dimension and depth. Conjugated views are conjugated while packing.
pub fn pack<T: Element>(dst: &mut [T], src: MatRef<'_, T>, schema: PackSchema, extent: usize) -> Result<()> {
    if extent == 0 {
        return Err(validation_error("micro-tile extent must be non-zero"));
    }
    let (mn, k) = schema.dims(src.rows(), src.cols());
    let needed = packed_len(mn, k, extent);
    if dst.len() != needed {
        return Err(validation_error(format!(
            "packed buffer holds {} elements, {needed} needed",
            dst.len()
        )));
    }
    let (inc_mn, inc_k) = match schema {
        PackSchema::RowPanels => (src.rs(), src.cs()),
        PackSchema::ColPanels => (src.cs(), src.rs()),
    };
    if needed == 0 {
        return Ok(());
    }

    trace!(?schema, mn, k, extent, "pack");
    // SAFETY: the view's footprint was validated when it was built and dst
    // has exactly the packed length.
    unsafe {
        pack_panels(
            dst.as_mut_ptr(),
            src.as_ptr(),
            mn,
            k,
            inc_mn,
            inc_k,
            extent,
            src.is_conj(),
            T::one(),
        );
    }
    Ok(())
}
