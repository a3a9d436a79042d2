//! Blocked, multi-threaded dense matrix multiplication.
//!
//! `gemmly` computes `C := alpha * op(A) * op(B) + beta * C` for `f32`, `f64`,
//! `Complex<f32>` and `Complex<f64>` with the five-loop BLIS algorithm:
//! cache blocking over (NC, KC, MC), packing of operands into micro-panels,
//! size-keyed micro-kernel dispatch with greedy edge decomposition, and a
//! two-level thread hierarchy that shares packed B panels within each group.
//!
//! Operands are passed as [`Operand`]s: used in place (`Native`), packed by
//! the call (`Pack`), or packed once ahead of time with [`reorder_a`] /
//! [`reorder_b`] and reused across calls (`Reordered`).
//!
//! ```
//! use gemmly::{gemm, Context, MatMut, MatRef};
//!
//! let ctx = Context::new().unwrap();
//! let (a, b) = ([3.0f64], [2.0f64]);
//! let mut c = [5.0f64];
//! gemm(
//!     &ctx,
//!     2.0,
//!     MatRef::row_major(&a, 1, 1).unwrap().into(),
//!     MatRef::row_major(&b, 1, 1).unwrap().into(),
//!     1.0,
//!     MatMut::row_major(&mut c, 1, 1).unwrap(),
//! )
//! .unwrap();
//! assert_eq!(c, [17.0]);
//! ```

pub mod blocksize;
pub mod comm;
pub mod context;
mod driver;
pub mod element;
pub mod error;
pub mod gemm;
pub mod kernels;
pub mod pack;
pub mod partition;
pub mod pool;
pub mod postop;
pub mod reorder;
pub mod view;

pub use blocksize::{Arch, BlockSizes};
pub use context::{Context, ContextBuilder};
pub use element::{c32, c64, Dtype, Element};
pub use error::{GemmError, Result};
pub use gemm::{gemm, gemm_with_post_ops, gemmt, matmul, Uplo};
pub use pack::PackSchema;
pub use partition::Threading;
pub use postop::{BiasAdd, Clip, PostOp, PostOpAttr, PostOpList, Relu};
pub use reorder::{reorder_a, reorder_b, reorder_buf_len, Reordered};
pub use view::{MatMut, MatRef, Operand, OperandTag};
