mod common;

use common::{rng, small_ctx, Dense};
use gemmly::{
    gemm, gemm_with_post_ops, reorder_a, reorder_b, Arch, BiasAdd, Clip, ContextBuilder, Dtype, GemmError,
    MatMut, MatRef, Operand, PostOpList, Threading,
};

fn limited_ctx(threading: Threading, limit: usize) -> gemmly::Context {
    ContextBuilder::new()
        .arch(Arch::Generic)
        .macro_block_sizes(Dtype::F64, 12, 16, 5)
        .threading(threading)
        .pool_limit(limit)
        .build()
        .unwrap()
}

#[test]
fn test_allocation_failure_leaves_c_untouched() {
    let mut rng = rng();
    let a = Dense::<f64>::random(30, 20, false, &mut rng);
    let b = Dense::<f64>::random(20, 30, false, &mut rng);

    for threading in [Threading::single(), Threading::new(2, 2).unwrap(), Threading::new(1, 3).unwrap()] {
        // room for some scratch blocks but never for all of them
        for limit in [0, 8 * 12 * 5] {
            let ctx = limited_ctx(threading, limit);
            let mut c = Dense::<f64>::random(30, 30, false, &mut rng);
            let before = c.data.clone();
            let err = gemm(&ctx, 1.0, Operand::Pack(a.view()), Operand::Pack(b.view()), 1.0, c.view_mut()).unwrap_err();
            assert!(matches!(err, GemmError::AllocationError { .. }), "{err}");
            assert_eq!(c.data, before, "{threading:?} limit {limit}");
            assert_eq!(ctx.pool().in_use_bytes(), 0);
        }
    }
}

#[test]
fn test_native_operands_need_no_scratch() {
    let mut rng = rng();
    let ctx = limited_ctx(Threading::new(2, 1).unwrap(), 0);
    let a = Dense::<f64>::random(9, 7, false, &mut rng);
    let b = Dense::<f64>::random(7, 11, true, &mut rng);
    let mut c = Dense::filled(9, 11, 0.0, false);
    gemm(&ctx, 1.0, Operand::Native(a.view()), Operand::Native(b.view()), 0.0, c.view_mut()).unwrap();
    assert!(c.data.iter().any(|&x| x != 0.0));
}

#[test]
fn test_inner_dimension_mismatch() {
    let ctx = small_ctx(Threading::single());
    let a = vec![1.0f32; 6];
    let b = vec![1.0f32; 8];
    let mut c = vec![3.0f32; 8];
    let err = gemm(
        &ctx,
        1.0,
        MatRef::row_major(&a, 2, 3).unwrap().into(),
        MatRef::row_major(&b, 2, 4).unwrap().into(),
        0.0,
        MatMut::row_major(&mut c, 2, 4).unwrap(),
    )
    .unwrap_err();
    assert!(matches!(err, GemmError::ValidationError { .. }));
    assert!(err.to_string().contains("2x3"));
    assert_eq!(c, vec![3.0; 8]);
}

#[test]
fn test_output_shape_mismatch() {
    let ctx = small_ctx(Threading::single());
    let a = vec![1.0f32; 6];
    let mut c = vec![0.0f32; 6];
    let err = gemm(
        &ctx,
        1.0,
        MatRef::row_major(&a, 2, 3).unwrap().into(),
        MatRef::row_major(&a, 3, 2).unwrap().into(),
        0.0,
        MatMut::row_major(&mut c, 3, 2).unwrap(),
    )
    .unwrap_err();
    assert!(matches!(err, GemmError::ValidationError { .. }));
}

#[test]
fn test_short_buffers_are_rejected() {
    let data = vec![0.0f64; 5];
    assert!(matches!(
        MatRef::row_major(&data, 2, 3),
        Err(GemmError::ValidationError { .. })
    ));
    let mut out = vec![0.0f64; 5];
    assert!(MatMut::col_major(&mut out, 3, 2).is_err());
}

#[test]
fn test_aliasing_output_strides_are_rejected() {
    let mut out = vec![0.0f32; 16];
    assert!(MatMut::new(&mut out, 4, 4, 0, 1).is_err());

    // unit strides in both directions put (0, 1) and (1, 0) on one element
    let mut small = vec![0.0f32; 3];
    let err = MatMut::new(&mut small, 2, 2, 1, 1).unwrap_err();
    assert!(matches!(err, GemmError::UnsupportedLayout { .. }), "{err}");

    // rows that overlap their neighbours
    let mut out = vec![0.0f64; 20];
    assert!(matches!(
        MatMut::new(&mut out, 4, 5, 3, 1),
        Err(GemmError::UnsupportedLayout { .. })
    ));
    assert!(MatMut::new(&mut out, 4, 5, 5, 1).is_ok());
    assert!(MatMut::new(&mut out, 4, 5, 1, 4).is_ok());
}

#[test]
fn test_reordered_with_other_block_sizes() {
    let mut rng = rng();
    let a = Dense::<f64>::random(10, 8, false, &mut rng);
    let b = Dense::<f64>::random(8, 10, false, &mut rng);
    let packer = small_ctx(Threading::single());
    let ra = reorder_a(&packer, a.view()).unwrap();
    let rb = reorder_b(&packer, b.view()).unwrap();

    let other = ContextBuilder::new()
        .arch(Arch::Generic)
        .macro_block_sizes(Dtype::F64, 12, 16, 7)
        .threading(Threading::single())
        .build()
        .unwrap();
    let mut c = Dense::filled(10, 10, 1.0, false);

    let err = gemm(&other, 1.0, Operand::Reordered(&ra), Operand::Native(b.view()), 0.0, c.view_mut()).unwrap_err();
    assert!(matches!(err, GemmError::ReorderMismatch { .. }), "{err}");
    let err = gemm(&other, 1.0, Operand::Native(a.view()), Operand::Reordered(&rb), 0.0, c.view_mut()).unwrap_err();
    assert!(matches!(err, GemmError::ReorderMismatch { .. }), "{err}");
    assert!(c.data.iter().all(|&x| x == 1.0));

    // same context, wrong side
    let square = Dense::<f64>::random(8, 8, false, &mut rng);
    let rsq = reorder_b(&packer, square.view()).unwrap();
    let mut c = Dense::filled(8, 8, 1.0, false);
    let err = gemm(&packer, 1.0, Operand::Reordered(&rsq), Operand::Native(square.view()), 0.0, c.view_mut()).unwrap_err();
    assert!(matches!(err, GemmError::ReorderMismatch { .. }), "{err}");
}

#[test]
fn test_reordered_needs_row_stored_c() {
    let mut rng = rng();
    let ctx = small_ctx(Threading::single());
    let a = Dense::<f32>::random(7, 5, false, &mut rng);
    let b = Dense::<f32>::random(5, 9, false, &mut rng);
    let rb = reorder_b(&ctx, b.view()).unwrap();
    let mut c = Dense::filled(7, 9, 0.0f32, true);
    let err = gemm(&ctx, 1.0, Operand::Pack(a.view()), Operand::Reordered(&rb), 0.0, c.view_mut()).unwrap_err();
    assert!(matches!(err, GemmError::UnsupportedLayout { .. }), "{err}");
}

#[test]
fn test_post_op_validation() {
    let ctx = small_ctx(Threading::single());
    let a = vec![1.0f32; 4];
    let mut c = vec![0.0f32; 4];
    let short_bias = PostOpList::new().push(BiasAdd::new(vec![1.0f32]));
    let err = gemm_with_post_ops(
        &ctx,
        1.0,
        MatRef::row_major(&a, 2, 2).unwrap().into(),
        MatRef::row_major(&a, 2, 2).unwrap().into(),
        0.0,
        MatMut::row_major(&mut c, 2, 2).unwrap(),
        &short_bias,
    )
    .unwrap_err();
    assert!(matches!(err, GemmError::ValidationError { .. }));

    assert!(Clip::new(1.0f32, -1.0).is_err());
    assert!(Clip::new(f32::NAN, 1.0).is_err());
}

#[test]
fn test_invalid_thread_shape() {
    assert!(matches!(Threading::new(0, 2), Err(GemmError::ValidationError { .. })));
}

#[test]
fn test_invalid_block_sizes() {
    // MC not a multiple of MR
    let err = ContextBuilder::new()
        .arch(Arch::Generic)
        .macro_block_sizes(Dtype::F64, 13, 16, 5)
        .build()
        .unwrap_err();
    assert!(matches!(err, GemmError::InvalidBlockSizes { .. }), "{err}");
}
