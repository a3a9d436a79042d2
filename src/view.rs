//! Strided operand views.
//!
//! A [`MatRef`] is the resolved form of an input operand: base pointer, shape,
//! row stride, column stride and a conjugation flag. Transposition is a stride
//! swap, so `op(A)` never copies. [`MatMut`] is the output accumulator C.
//!
//! Views are built from slices (footprint checked against the slice length) or
//! from `ndarray` views. Element `(i, j)` lives at `ptr + i * rs + j * cs`.

use std::marker::PhantomData;

use ndarray::{ArrayView2, ArrayViewMut2};

use crate::{
    element::Element,
    error::{unsupported_layout, validation_error},
    reorder::Reordered,
    Result,
};

/// Number of elements spanned by a strided `rows × cols` footprint.
fn footprint(rows: usize, cols: usize, rs: usize, cs: usize) -> Result<usize> {
    if rows == 0 || cols == 0 {
        return Ok(0);
    }
    (rows - 1)
        .checked_mul(rs)
        .and_then(|r| (cols - 1).checked_mul(cs).and_then(|c| r.checked_add(c)))
        .and_then(|last| last.checked_add(1))
        .ok_or_else(|| unsupported_layout(format!("strides ({rs}, {cs}) overflow for {rows}x{cols}")))
}

fn check_footprint(len: usize, rows: usize, cols: usize, rs: usize, cs: usize) -> Result<()> {
    let needed = footprint(rows, cols, rs, cs)?;
    if needed > len {
        return Err(validation_error(format!(
            "{rows}x{cols} view with strides ({rs}, {cs}) needs {needed} elements, slice has {len}"
        )));
    }
    Ok(())
}

fn ndarray_strides(strides: &[isize]) -> Result<(usize, usize)> {
    let rs = usize::try_from(strides[0]).map_err(|_| unsupported_layout("negative row stride"))?;
    let cs = usize::try_from(strides[1]).map_err(|_| unsupported_layout("negative column stride"))?;
    Ok((rs, cs))
}

/// Read-only strided view of an input operand.
#[derive(Clone, Copy, Debug)]
pub struct MatRef<'a, T> {
    ptr: *const T,
    rows: usize,
    cols: usize,
    rs: usize,
    cs: usize,
    conj: bool,
    _marker: PhantomData<&'a [T]>,
}

// SAFETY: a MatRef is a shared borrow of T values.
unsafe impl<T: Sync> Send for MatRef<'_, T> {}
unsafe impl<T: Sync> Sync for MatRef<'_, T> {}

impl<'a, T: Element> MatRef<'a, T> {
    pub fn new(data: &'a [T], rows: usize, cols: usize, rs: usize, cs: usize) -> Result<Self> {
        check_footprint(data.len(), rows, cols, rs, cs)?;
        Ok(MatRef {
            ptr: data.as_ptr(),
            rows,
            cols,
            rs,
            cs,
            conj: false,
            _marker: PhantomData,
        })
    }

    pub fn row_major(data: &'a [T], rows: usize, cols: usize) -> Result<Self> {
        Self::new(data, rows, cols, cols.max(1), 1)
    }

    pub fn col_major(data: &'a [T], rows: usize, cols: usize) -> Result<Self> {
        Self::new(data, rows, cols, 1, rows.max(1))
    }

    /// Transposed view.
    pub fn t(self) -> Self {
        MatRef {
            rows: self.cols,
            cols: self.rows,
            rs: self.cs,
            cs: self.rs,
            ..self
        }
    }

    /// Conjugated view; a no-op for real element types.
    pub fn conj(self) -> Self {
        MatRef {
            conj: !self.conj,
            ..self
        }
    }

    /// Conjugate transpose.
    pub fn h(self) -> Self {
        self.t().conj()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rs(&self) -> usize {
        self.rs
    }

    pub fn cs(&self) -> usize {
        self.cs
    }

    pub fn is_conj(&self) -> bool {
        self.conj
    }

    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }

    /// Element `(i, j)` with the conjugation flag applied.
    pub fn get(&self, i: usize, j: usize) -> T {
        assert!(i < self.rows && j < self.cols, "({i}, {j}) out of bounds");
        // SAFETY: in bounds of the footprint validated at construction.
        let v = unsafe { *self.ptr.add(i * self.rs + j * self.cs) };
        if self.conj {
            v.conj()
        } else {
            v
        }
    }

    /// Sub-view starting at `(i, j)`.
    pub(crate) fn offset_ptr(&self, i: usize, j: usize) -> *const T {
        self.ptr.wrapping_add(i * self.rs + j * self.cs)
    }
}

impl<'a, T: Element> TryFrom<ArrayView2<'a, T>> for MatRef<'a, T> {
    type Error = crate::GemmError;

    fn try_from(view: ArrayView2<'a, T>) -> Result<Self> {
        let (rs, cs) = ndarray_strides(view.strides())?;
        Ok(MatRef {
            ptr: view.as_ptr(),
            rows: view.nrows(),
            cols: view.ncols(),
            rs,
            cs,
            conj: false,
            _marker: PhantomData,
        })
    }
}

/// Mutable strided view of the accumulator C.
#[derive(Debug)]
pub struct MatMut<'a, T> {
    ptr: *mut T,
    rows: usize,
    cols: usize,
    rs: usize,
    cs: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: a MatMut is a unique borrow of T values.
unsafe impl<T: Send> Send for MatMut<'_, T> {}
unsafe impl<T: Sync> Sync for MatMut<'_, T> {}

impl<'a, T: Element> MatMut<'a, T> {
    pub fn new(data: &'a mut [T], rows: usize, cols: usize, rs: usize, cs: usize) -> Result<Self> {
        check_footprint(data.len(), rows, cols, rs, cs)?;
        check_no_self_overlap(rows, cols, rs, cs)?;
        Ok(MatMut {
            ptr: data.as_mut_ptr(),
            rows,
            cols,
            rs,
            cs,
            _marker: PhantomData,
        })
    }

    pub fn row_major(data: &'a mut [T], rows: usize, cols: usize) -> Result<Self> {
        Self::new(data, rows, cols, cols.max(1), 1)
    }

    pub fn col_major(data: &'a mut [T], rows: usize, cols: usize) -> Result<Self> {
        Self::new(data, rows, cols, 1, rows.max(1))
    }

    /// Transposed view over the same storage.
    pub fn t(self) -> Self {
        MatMut {
            ptr: self.ptr,
            rows: self.cols,
            cols: self.rows,
            rs: self.cs,
            cs: self.rs,
            _marker: PhantomData,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rs(&self) -> usize {
        self.rs
    }

    pub fn cs(&self) -> usize {
        self.cs
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr
    }

    pub fn get(&self, i: usize, j: usize) -> T {
        assert!(i < self.rows && j < self.cols, "({i}, {j}) out of bounds");
        // SAFETY: in bounds of the validated footprint.
        unsafe { *self.ptr.add(i * self.rs + j * self.cs) }
    }
}

/// Two distinct elements of C must never share an address.
///
/// A vector needs a non-zero stride; a matrix needs one stride to step over
/// the whole span of the other.
fn check_no_self_overlap(rows: usize, cols: usize, rs: usize, cs: usize) -> Result<()> {
    let disjoint = match (rows > 1, cols > 1) {
        (false, false) => true,
        (true, false) => rs != 0,
        (false, true) => cs != 0,
        (true, true) => {
            let spans = |outer: usize, inner_len: usize, inner: usize| {
                inner != 0 && inner_len.checked_mul(inner).is_some_and(|span| outer >= span)
            };
            spans(rs, cols, cs) || spans(cs, rows, rs)
        }
    };
    if !disjoint {
        return Err(unsupported_layout(format!(
            "output strides ({rs}, {cs}) alias distinct elements of a {rows}x{cols} view"
        )));
    }
    Ok(())
}

impl<'a, T: Element> TryFrom<ArrayViewMut2<'a, T>> for MatMut<'a, T> {
    type Error = crate::GemmError;

    fn try_from(mut view: ArrayViewMut2<'a, T>) -> Result<Self> {
        let (rs, cs) = ndarray_strides(view.strides())?;
        let (rows, cols) = (view.nrows(), view.ncols());
        check_no_self_overlap(rows, cols, rs, cs)?;
        Ok(MatMut {
            ptr: view.as_mut_ptr(),
            rows,
            cols,
            rs,
            cs,
            _marker: PhantomData,
        })
    }
}

/// How the engine must treat an input operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandTag {
    /// Used in place through its strides.
    Native,
    /// Packed into a scratch panel by the call.
    Pack,
    /// Packed ahead of time, navigated by offset arithmetic.
    Reordered,
}

/// An input operand together with its tag.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a, T> {
    Native(MatRef<'a, T>),
    Pack(MatRef<'a, T>),
    Reordered(&'a Reordered<T>),
}

impl<'a, T: Element> Operand<'a, T> {
    pub fn tag(&self) -> OperandTag {
        match self {
            Operand::Native(_) => OperandTag::Native,
            Operand::Pack(_) => OperandTag::Pack,
            Operand::Reordered(_) => OperandTag::Reordered,
        }
    }

    /// Logical `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Operand::Native(v) | Operand::Pack(v) => (v.rows(), v.cols()),
            Operand::Reordered(r) => (r.rows(), r.cols()),
        }
    }
}

impl<'a, T> From<MatRef<'a, T>> for Operand<'a, T> {
    fn from(view: MatRef<'a, T>) -> Self {
        Operand::Native(view)
    }
}
