//! GEMM Demonstration
//!
//! Walks through the main entry points: a plain product, packed and reordered
//! operands, post-ops, a triangular update and the errors a call can report.
//!
//! ```bash
//! RUST_LOG=gemmly=debug cargo run --release --example gemm_demo
//! ```

use gemmly::{
    gemm, gemm_with_post_ops, gemmt, matmul, reorder_a, reorder_b, BiasAdd, Context, GemmError, MatMut, MatRef,
    Operand, PostOpList, Relu, Threading, Uplo,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> gemmly::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context::builder().threading(Threading::new(2, 2)?).build()?;
    info!(arch = ?ctx.arch(), "context ready");

    // Example 1: C := 2 * A * B + C
    println!("Example 1: 2 x 3 times 3 x 2");
    let a = [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0];
    let b = [7.0f64, 8.0, 9.0, 10.0, 11.0, 12.0];
    let mut c = [1.0f64; 4];
    gemm(
        &ctx,
        2.0,
        MatRef::row_major(&a, 2, 3)?.into(),
        MatRef::row_major(&b, 3, 2)?.into(),
        1.0,
        MatMut::row_major(&mut c, 2, 2)?,
    )?;
    println!("   C = {c:?}\n");

    // Example 2: reorder once, multiply many times
    println!("Example 2: reordered operands");
    let (m, k, n) = (64, 48, 80);
    let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 - 3.0).collect();
    let b: Vec<f32> = (0..k * n).map(|i| (i % 5) as f32 * 0.5).collect();
    let ra = reorder_a(&ctx, MatRef::row_major(&a, m, k)?)?;
    let rb = reorder_b(&ctx, MatRef::row_major(&b, k, n)?)?;
    let mut c = vec![0.0f32; m * n];
    for round in 0..3 {
        gemm(
            &ctx,
            1.0,
            Operand::Reordered(&ra),
            Operand::Reordered(&rb),
            1.0,
            MatMut::row_major(&mut c, m, n)?,
        )?;
        println!("   round {round}: C[0][0] = {}", c[0]);
    }
    let reference = matmul(&ctx, MatRef::row_major(&a, m, k)?, MatRef::row_major(&b, k, n)?)?;
    println!("   3 * A * B matches: {}\n", c.iter().zip(&reference).all(|(x, y)| *x == 3.0 * y));

    // Example 3: bias and ReLU fused into the last K slice
    println!("Example 3: post-ops");
    let ops = PostOpList::new()
        .push(BiasAdd::new((0..n).map(|j| -(j as f32)).collect()))
        .push(Relu);
    let mut c = vec![0.0f32; m * n];
    gemm_with_post_ops(
        &ctx,
        1.0,
        Operand::Pack(MatRef::row_major(&a, m, k)?),
        Operand::Pack(MatRef::row_major(&b, k, n)?),
        0.0,
        MatMut::row_major(&mut c, m, n)?,
        &ops,
    )?;
    let zeros = c.iter().filter(|&&x| x == 0.0).count();
    println!("   {zeros} of {} outputs clipped to zero\n", m * n);

    // Example 4: lower triangle of A * A^T
    println!("Example 4: triangular update");
    let x = [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0];
    let xv = MatRef::row_major(&x, 3, 2)?;
    let mut s = [f64::NAN; 9];
    gemmt(&ctx, Uplo::Lower, 1.0, xv.into(), xv.t().into(), 0.0, MatMut::row_major(&mut s, 3, 3)?)?;
    for row in s.chunks(3) {
        println!("   {row:?}");
    }
    println!();

    // Example 5: errors are returned before C is touched
    println!("Example 5: error handling");
    let mut out = [0.0f64; 4];
    match gemm(
        &ctx,
        1.0,
        MatRef::row_major(&x, 3, 2)?.into(),
        MatRef::row_major(&x, 3, 2)?.into(),
        0.0,
        MatMut::row_major(&mut out, 2, 2)?,
    ) {
        Ok(()) => println!("   unexpected success"),
        Err(GemmError::ValidationError { message }) => println!("   validation error: {message}"),
        Err(e) => println!("   other error: {e}"),
    }

    let starved = Context::builder().pool_limit(0).build()?;
    match matmul(&starved, MatRef::row_major(&x, 3, 2)?, MatRef::row_major(&x, 2, 3)?) {
        Ok(_) => println!("   unexpected success"),
        Err(e @ GemmError::AllocationError { .. }) => println!("   allocation error: {e}"),
        Err(e) => println!("   other error: {e}"),
    }

    Ok(())
}
