//! Public entry points.
//!
//! `C := alpha * op(A) * op(B) + beta * C`, with `op` already applied to the
//! views (see [`MatRef::t`], [`MatRef::h`]). Everything is validated before
//! any thread starts; a call either completes or returns an error with C
//! untouched.
//!
//! The engine computes on row-stored C. A column-stored C (unit row stride)
//! is handled as its transpose, `Cᵀ = op(B)ᵀ * op(A)ᵀ`.

use tracing::debug;

use crate::{
    context::Context,
    driver::{self, Problem, SyncPtr},
    element::Element,
    error::{unsupported_layout, validation_error},
    pack::PackSchema,
    postop::PostOpList,
    reorder::check_reordered,
    view::{MatMut, MatRef, Operand},
    Result,
};

/// Which triangle of C a [`gemmt`] call updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uplo {
    /// `i <= j`
    Upper,
    /// `i >= j`
    Lower,
}

impl Uplo {
    /// The triangle seen from the transposed matrix.
    pub fn flip(self) -> Self {
        match self {
            Uplo::Upper => Uplo::Lower,
            Uplo::Lower => Uplo::Upper,
        }
    }
}

/// General matrix multiply.
///
/// # Example
///
/// ```
/// use gemmly::{gemm, Context, MatMut, MatRef, Operand};
///
/// let ctx = Context::new().unwrap();
/// let a = vec![1.0f32; 6 * 4];
/// let b = vec![1.0f32; 4 * 16];
/// let mut c = vec![f32::NAN; 6 * 16];
///
/// gemm(
///     &ctx,
///     1.0,
///     MatRef::row_major(&a, 6, 4).unwrap().into(),
///     Operand::Pack(MatRef::row_major(&b, 4, 16).unwrap()),
///     0.0,
///     MatMut::row_major(&mut c, 6, 16).unwrap(),
/// )
/// .unwrap();
/// assert!(c.iter().all(|&x| x == 4.0));
/// ```
pub fn gemm<T: Element>(
    ctx: &Context,
    alpha: T,
    a: Operand<'_, T>,
    b: Operand<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
) -> Result<()> {
    gemm_with_post_ops(ctx, alpha, a, b, beta, c, &PostOpList::new())
}

/// [`gemm`] followed by `post_ops` on every element of C.
pub fn gemm_with_post_ops<T: Element>(
    ctx: &Context,
    alpha: T,
    a: Operand<'_, T>,
    b: Operand<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
    post_ops: &PostOpList<T>,
) -> Result<()> {
    let (m, n) = check_shapes(&a, &b, &c)?;
    post_ops.validate(m, n)?;
    dispatch(ctx, alpha, a, b, beta, c, post_ops, None)
}

/// Triangular update: like [`gemm`] on a square C, but only the `uplo`
/// triangle (diagonal included) is read or written.
pub fn gemmt<T: Element>(
    ctx: &Context,
    uplo: Uplo,
    alpha: T,
    a: Operand<'_, T>,
    b: Operand<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
) -> Result<()> {
    let (m, n) = check_shapes(&a, &b, &c)?;
    if m != n {
        return Err(validation_error(format!("gemmt needs a square C, got {m}x{n}")));
    }
    dispatch(ctx, alpha, a, b, beta, c, &PostOpList::new(), Some(uplo))
}

fn check_shapes<T: Element>(a: &Operand<'_, T>, b: &Operand<'_, T>, c: &MatMut<'_, T>) -> Result<(usize, usize)> {
    let (m, k) = a.shape();
    let (kb, n) = b.shape();
    if k != kb {
        return Err(validation_error(format!("op(A) is {m}x{k} but op(B) is {kb}x{n}")));
    }
    if (c.rows(), c.cols()) != (m, n) {
        return Err(validation_error(format!(
            "C is {}x{}, product is {m}x{n}",
            c.rows(),
            c.cols()
        )));
    }
    Ok((m, n))
}

fn transpose<'a, T: Element>(op: Operand<'a, T>) -> Result<Operand<'a, T>> {
    match op {
        Operand::Native(v) => Ok(Operand::Native(v.t())),
        Operand::Pack(v) => Ok(Operand::Pack(v.t())),
        Operand::Reordered(_) => Err(unsupported_layout("reordered operands need a row-stored C")),
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch<T: Element>(
    ctx: &Context,
    alpha: T,
    a: Operand<'_, T>,
    b: Operand<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
    post_ops: &PostOpList<T>,
    uplo: Option<Uplo>,
) -> Result<()> {
    let (m, n) = (c.rows(), c.cols());
    if c.cs() == 1 || n <= 1 {
        launch(ctx, alpha, a, b, beta, c, post_ops, uplo)
    } else if c.rs() == 1 || m <= 1 {
        let (at, bt) = (transpose(b)?, transpose(a)?);
        launch(ctx, alpha, at, bt, beta, c.t(), &post_ops.transposed(), uplo.map(Uplo::flip))
    } else {
        Err(unsupported_layout(format!(
            "C strides ({}, {}) have no unit stride",
            c.rs(),
            c.cs()
        )))
    }
}

#[allow(clippy::too_many_arguments)]
fn launch<T: Element>(
    ctx: &Context,
    alpha: T,
    a: Operand<'_, T>,
    b: Operand<'_, T>,
    beta: T,
    mut c: MatMut<'_, T>,
    post_ops: &PostOpList<T>,
    uplo: Option<Uplo>,
) -> Result<()> {
    let bs = ctx.block_sizes::<T>();
    if let Operand::Reordered(r) = a {
        check_reordered(r, PackSchema::RowPanels, &bs)?;
    }
    if let Operand::Reordered(r) = b {
        check_reordered(r, PackSchema::ColPanels, &bs)?;
    }

    let (m, k) = a.shape();
    let n = b.shape().1;
    let threading = ctx.threading_for(m, n);
    debug!(
        dtype = ?T::DTYPE,
        m,
        n,
        k,
        a = ?a.tag(),
        b = ?b.tag(),
        jc_ways = threading.jc_ways,
        ic_ways = threading.ic_ways,
        ?uplo,
        "gemm"
    );

    if m == 0 || n == 0 {
        return Ok(());
    }
    if k == 0 {
        scale(&mut c, beta, post_ops, uplo);
        return Ok(());
    }

    let problem = Problem {
        m,
        n,
        k,
        alpha,
        beta,
        a,
        b,
        rs_c: c.rs(),
        cs_c: c.cs(),
        c: SyncPtr(c.as_mut_ptr()),
        post_ops,
        uplo,
    };
    driver::run(ctx, &problem, threading)
}

/// `C := post_ops(beta * C)`, the whole product being empty.
fn scale<T: Element>(c: &mut MatMut<'_, T>, beta: T, post_ops: &PostOpList<T>, uplo: Option<Uplo>) {
    let (rs, cs) = (c.rs(), c.cs());
    let ptr = c.as_mut_ptr();
    for i in 0..c.rows() {
        for j in 0..c.cols() {
            let kept = match uplo {
                Some(Uplo::Lower) => i >= j,
                Some(Uplo::Upper) => i <= j,
                None => true,
            };
            if !kept {
                continue;
            }
            // SAFETY: (i, j) is inside the validated footprint of C.
            unsafe {
                let dst = ptr.add(i * rs + j * cs);
                let mut v = if beta == T::zero() {
                    T::zero()
                } else {
                    beta.mul_add(*dst, T::zero())
                };
                if !post_ops.is_empty() {
                    v = post_ops.apply(v, i, j);
                }
                *dst = v;
            }
        }
    }
}

/// Convenience: `op(A) * op(B)` into a fresh row-major buffer.
pub fn matmul<T: Element>(ctx: &Context, a: MatRef<'_, T>, b: MatRef<'_, T>) -> Result<Vec<T>> {
    let (m, n) = (a.rows(), b.cols());
    let mut c = vec![T::zero(); m * n];
    gemm(
        ctx,
        T::one(),
        Operand::Pack(a),
        Operand::Pack(b),
        T::zero(),
        MatMut::row_major(&mut c, m, n)?,
    )?;
    Ok(c)
}
