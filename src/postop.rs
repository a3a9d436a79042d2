//! Fused output operations.
//!
//! A [`PostOpList`] is an ordered sequence of element-wise operations that the
//! micro-kernels apply to each output value after alpha/beta scaling, on the
//! last K slice only. The engine never inspects the list; it forwards it to the
//! kernels together with a per-tile [`PostOpAttr`].

use std::fmt::Debug;
use std::sync::Arc;

use crate::{element::Element, error::validation_error, Result};

/// An element-wise operation on the finished value of `C[row][col]`.
///
/// `row` and `col` are global coordinates in the caller's C.
pub trait PostOp<T>: Send + Sync + Debug {
    fn apply(&self, value: T, row: usize, col: usize) -> T;

    /// Checks that the operation can serve an `m × n` output.
    fn validate(&self, _m: usize, _n: usize) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of post-ops.
#[derive(Debug, Clone)]
pub struct PostOpList<T> {
    ops: Vec<Arc<dyn PostOp<T>>>,
    transposed: bool,
}

impl<T> Default for PostOpList<T> {
    fn default() -> Self {
        PostOpList {
            ops: Vec::new(),
            transposed: false,
        }
    }
}

impl<T: Element> PostOpList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `op`; operations run in insertion order.
    pub fn push(mut self, op: impl PostOp<T> + 'static) -> Self {
        self.ops.push(Arc::new(op));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Runs every operation on `value`.
    #[inline]
    pub fn apply(&self, mut value: T, row: usize, col: usize) -> T {
        let (row, col) = if self.transposed { (col, row) } else { (row, col) };
        for op in &self.ops {
            value = op.apply(value, row, col);
        }
        value
    }

    pub fn validate(&self, m: usize, n: usize) -> Result<()> {
        self.ops.iter().try_for_each(|op| op.validate(m, n))
    }

    /// The same list seen from the transposed output, where the engine's
    /// (row, col) is the caller's (col, row).
    pub(crate) fn transposed(&self) -> Self {
        PostOpList {
            ops: self.ops.clone(),
            transposed: !self.transposed,
        }
    }
}

/// Coordinates and K-position of the tile handed to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostOpAttr {
    /// Global row of the tile's first element.
    pub post_op_c_i: usize,
    /// Global column of the tile's first element.
    pub post_op_c_j: usize,
    pub is_first_k: bool,
    pub is_last_k: bool,
}

impl PostOpAttr {
    /// The attributes of the sub-tile at offset `(i, j)` of this tile.
    #[inline]
    pub fn offset(&self, i: usize, j: usize) -> Self {
        PostOpAttr {
            post_op_c_i: self.post_op_c_i + i,
            post_op_c_j: self.post_op_c_j + j,
            ..*self
        }
    }
}

// === Operations ===

/// Adds `bias[col]` to every element of column `col`.
#[derive(Debug, Clone)]
pub struct BiasAdd<T> {
    bias: Vec<T>,
}

impl<T> BiasAdd<T> {
    pub fn new(bias: Vec<T>) -> Self {
        BiasAdd { bias }
    }
}

impl<T: Element> PostOp<T> for BiasAdd<T> {
    #[inline]
    fn apply(&self, value: T, _row: usize, col: usize) -> T {
        value + self.bias[col]
    }

    fn validate(&self, _m: usize, n: usize) -> Result<()> {
        if self.bias.len() < n {
            return Err(validation_error(format!(
                "bias has {} entries, output has {n} columns",
                self.bias.len()
            )));
        }
        Ok(())
    }
}

/// `max(value, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl<T: Element + PartialOrd> PostOp<T> for Relu {
    #[inline]
    fn apply(&self, value: T, _row: usize, _col: usize) -> T {
        if value < T::zero() {
            T::zero()
        } else {
            value
        }
    }
}

/// Clamps into `[lo, hi]`.
#[derive(Debug, Clone, Copy)]
pub struct Clip<T> {
    lo: T,
    hi: T,
}

impl<T: Element + PartialOrd> Clip<T> {
    pub fn new(lo: T, hi: T) -> Result<Self> {
        if !(lo <= hi) {
            return Err(validation_error(format!("clip bounds {lo:?} > {hi:?}")));
        }
        Ok(Clip { lo, hi })
    }
}

impl<T: Element + PartialOrd> PostOp<T> for Clip<T> {
    #[inline]
    fn apply(&self, value: T, _row: usize, _col: usize) -> T {
        if value < self.lo {
            self.lo
        } else if value > self.hi {
            self.hi
        } else {
            value
        }
    }
}
