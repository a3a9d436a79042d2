mod common;

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Duration;

use common::{assert_close, naive, rng, small_ctx, Dense};
use gemmly::{
    c32, c64, gemm, gemm_with_post_ops, gemmt, reorder_a, reorder_b, BiasAdd, Context, Element, Operand, PostOp,
    PostOpList, Relu, Threading, Uplo,
};

const SHAPES: [(usize, usize); 6] = [(1, 1), (2, 1), (1, 3), (2, 2), (3, 2), (4, 1)];

fn pick<T: Element>(d: &Dense<T>, packed: bool) -> Operand<'_, T> {
    if packed {
        Operand::Pack(d.view())
    } else {
        Operand::Native(d.view())
    }
}

/// Runs the same call under `threading` and returns C.
fn run<T: Element>(
    threading: Threading,
    a: &Dense<T>,
    b: &Dense<T>,
    c: &Dense<T>,
    (a_packed, b_packed): (bool, bool),
) -> Vec<T> {
    let ctx = small_ctx(threading);
    let mut c = c.clone();
    gemm(
        &ctx,
        T::from_parts(1.5, 0.5),
        pick(a, a_packed),
        pick(b, b_packed),
        T::from_parts(-0.5, 1.0),
        c.view_mut(),
    )
    .unwrap();
    c.data
}

#[test]
fn test_thread_shapes_are_bitwise_identical() {
    let mut rng = rng();
    // odd sizes leave partial micro-tiles at every split
    let (m, n, k) = (47, 61, 23);
    let a = Dense::<f32>::random(m, k, false, &mut rng);
    let b = Dense::<f32>::random(k, n, true, &mut rng);
    let c = Dense::<f32>::random(m, n, false, &mut rng);

    for tags in [(true, true), (false, false), (false, true)] {
        let serial = run(Threading::single(), &a, &b, &c, tags);
        for (jc, ic) in SHAPES {
            let threaded = run(Threading::new(jc, ic).unwrap(), &a, &b, &c, tags);
            assert_eq!(serial, threaded, "threading {jc}x{ic}, packed {tags:?}");
        }
    }
}

#[test]
fn test_threaded_complex_matches_naive() {
    let mut rng = rng();
    let (m, n, k) = (19, 26, 12);
    let a = Dense::<c64>::random(m, k, true, &mut rng);
    let b = Dense::<c64>::random(k, n, false, &mut rng);
    let c = Dense::<c64>::random(m, n, true, &mut rng);
    let (expected, scale) = naive(c64::new(1.5, 0.5), a.view(), b.view(), c64::new(-0.5, 1.0), &c);

    let out = Dense {
        data: run(Threading::new(2, 3).unwrap(), &a, &b, &c, (true, true)),
        ..c.clone()
    };
    assert_close(&out.to_row_major(), &expected, &scale, k, "c64 2x3");
}

#[test]
fn test_more_threads_than_tiles() {
    let mut rng = rng();
    // a single micro-tile: most threads own an empty range
    let (m, n, k) = (3, 5, 9);
    let a = Dense::<f64>::random(m, k, false, &mut rng);
    let b = Dense::<f64>::random(k, n, false, &mut rng);
    let c = Dense::<f64>::random(m, n, false, &mut rng);

    let serial = run(Threading::single(), &a, &b, &c, (true, true));
    let crowded = run(Threading::new(3, 4).unwrap(), &a, &b, &c, (true, true));
    assert_eq!(serial, crowded);
}

#[test]
fn test_reordered_operands_split_across_threads() {
    let mut rng = rng();
    // n spans several NC blocks whose widths the column split cuts mid-block
    let (m, n, k) = (29, 75, 13);
    let a = Dense::<f32>::random(m, k, false, &mut rng);
    let b = Dense::<f32>::random(k, n, false, &mut rng);
    let c = Dense::<f32>::random(m, n, false, &mut rng);
    let serial = run(Threading::single(), &a, &b, &c, (true, true));

    for (jc, ic) in SHAPES {
        let ctx = small_ctx(Threading::new(jc, ic).unwrap());
        let ra = reorder_a(&ctx, a.view()).unwrap();
        let rb = reorder_b(&ctx, b.view()).unwrap();
        let mut out = c.clone();
        gemm(&ctx, 1.5, Operand::Reordered(&ra), Operand::Reordered(&rb), -0.5, out.view_mut()).unwrap();
        assert_eq!(serial, out.data, "threading {jc}x{ic}");
    }
}

#[test]
fn test_threaded_gemmt_matches_serial() {
    let mut rng = rng();
    let n = 37;
    let k = 11;
    let a = Dense::<f64>::random(n, k, false, &mut rng);
    let b = Dense::<f64>::random(k, n, false, &mut rng);
    let c = Dense::<f64>::random(n, n, false, &mut rng);

    for uplo in [Uplo::Lower, Uplo::Upper] {
        let results: Vec<Vec<f64>> = [Threading::single(), Threading::new(2, 2).unwrap(), Threading::new(1, 3).unwrap()]
            .into_iter()
            .map(|threading| {
                let ctx = small_ctx(threading);
                let mut out = c.clone();
                gemmt(&ctx, uplo, 0.5, Operand::Pack(a.view()), Operand::Pack(b.view()), 2.0, out.view_mut()).unwrap();
                out.data
            })
            .collect();
        assert_eq!(results[0], results[1], "{uplo:?}");
        assert_eq!(results[0], results[2], "{uplo:?}");
    }
}

#[test]
fn test_context_is_shared_between_threads() {
    let ctx = small_ctx(Threading::new(2, 1).unwrap());
    let mut rng = rng();
    let a = Dense::<f32>::random(20, 8, false, &mut rng);
    let b = Dense::<f32>::random(8, 20, false, &mut rng);

    let outputs: Vec<Vec<f32>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                s.spawn(|| {
                    let mut c = Dense::filled(20, 20, 0.0f32, false);
                    gemm(&ctx, 1.0, Operand::Pack(a.view()), Operand::Pack(b.view()), 0.0, c.view_mut()).unwrap();
                    c.data
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(outputs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(ctx.pool().in_use_bytes(), 0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Native,
    Pack,
    Reordered,
}

/// Runs a post-op call with operands prepared as `tags` under `threading`.
fn run_tagged<T: Element>(
    threading: Threading,
    a: &Dense<T>,
    b: &Dense<T>,
    c: &Dense<T>,
    (a_tag, b_tag): (Tag, Tag),
    ops: &PostOpList<T>,
) -> Vec<T> {
    let ctx = small_ctx(threading);
    let ra = (a_tag == Tag::Reordered).then(|| reorder_a(&ctx, a.view()).unwrap());
    let rb = (b_tag == Tag::Reordered).then(|| reorder_b(&ctx, b.view()).unwrap());
    let a_op = match (a_tag, &ra) {
        (Tag::Reordered, Some(r)) => Operand::Reordered(r),
        (Tag::Pack, _) => Operand::Pack(a.view()),
        _ => Operand::Native(a.view()),
    };
    let b_op = match (b_tag, &rb) {
        (Tag::Reordered, Some(r)) => Operand::Reordered(r),
        (Tag::Pack, _) => Operand::Pack(b.view()),
        _ => Operand::Native(b.view()),
    };

    let mut out = c.clone();
    gemm_with_post_ops(
        &ctx,
        T::from_parts(0.75, -0.25),
        a_op,
        b_op,
        T::from_parts(1.25, 0.5),
        out.view_mut(),
        ops,
    )
    .unwrap();
    out.data
}

#[test]
fn test_threaded_post_ops_with_column_stored_c() {
    let mut rng = rng();
    // n crosses two NC blocks and k three KC slices
    let (m, n, k) = (31, 45, 13);
    let a = Dense::<f32>::random(m, k, true, &mut rng);
    let b = Dense::<f32>::random(k, n, false, &mut rng);
    let bias: Vec<f32> = (0..n).map(|j| (j as f32 - 20.0) * 0.05).collect();
    let ops = PostOpList::new().push(BiasAdd::new(bias)).push(Relu);

    for c_col_major in [true, false] {
        let c = Dense::<f32>::random(m, n, c_col_major, &mut rng);
        for tags in [(Tag::Pack, Tag::Pack), (Tag::Native, Tag::Pack), (Tag::Pack, Tag::Native)] {
            let serial = run_tagged(Threading::single(), &a, &b, &c, tags, &ops);
            for (jc, ic) in SHAPES {
                let threaded = run_tagged(Threading::new(jc, ic).unwrap(), &a, &b, &c, tags, &ops);
                assert_eq!(serial, threaded, "col-major C {c_col_major}, {tags:?}, threading {jc}x{ic}");
            }
        }
    }
}

#[test]
fn test_threaded_mixed_operand_tags() {
    let mut rng = rng();
    let (m, n, k) = (26, 70, 12);
    let a = Dense::<f64>::random(m, k, false, &mut rng);
    let b = Dense::<f64>::random(k, n, true, &mut rng);
    let c = Dense::<f64>::random(m, n, false, &mut rng);
    let ops = PostOpList::new().push(BiasAdd::new(vec![0.5; n]));

    for tags in [
        (Tag::Reordered, Tag::Native),
        (Tag::Reordered, Tag::Pack),
        (Tag::Pack, Tag::Reordered),
        (Tag::Native, Tag::Reordered),
    ] {
        let serial = run_tagged(Threading::single(), &a, &b, &c, tags, &ops);
        for (jc, ic) in SHAPES {
            let threaded = run_tagged(Threading::new(jc, ic).unwrap(), &a, &b, &c, tags, &ops);
            assert_eq!(serial, threaded, "{tags:?}, threading {jc}x{ic}");
        }
    }
}

#[test]
fn test_threaded_complex_reordered_operands() {
    let mut rng = rng();
    let (m, n, k) = (14, 29, 11);
    let tags = (Tag::Reordered, Tag::Reordered);

    let a = Dense::<c32>::random(m, k, false, &mut rng);
    let b = Dense::<c32>::random(k, n, false, &mut rng);
    let c = Dense::<c32>::random(m, n, false, &mut rng);
    let ops = PostOpList::new().push(BiasAdd::new(vec![c32::new(0.5, -1.0); n]));
    let serial = run_tagged(Threading::single(), &a, &b, &c, tags, &ops);
    for (jc, ic) in SHAPES {
        let threaded = run_tagged(Threading::new(jc, ic).unwrap(), &a, &b, &c, tags, &ops);
        assert_eq!(serial, threaded, "c32 threading {jc}x{ic}");
    }

    let a = Dense::<c64>::random(m, k, true, &mut rng);
    let b = Dense::<c64>::random(k, n, true, &mut rng);
    let c = Dense::<c64>::random(m, n, false, &mut rng);
    let ops = PostOpList::new();
    let serial = run_tagged(Threading::single(), &a, &b, &c, tags, &ops);
    for (jc, ic) in SHAPES {
        let threaded = run_tagged(Threading::new(jc, ic).unwrap(), &a, &b, &c, tags, &ops);
        assert_eq!(serial, threaded, "c64 threading {jc}x{ic}");
    }
}

#[derive(Debug)]
struct FailOnRow(usize);

impl PostOp<f32> for FailOnRow {
    fn apply(&self, value: f32, row: usize, _col: usize) -> f32 {
        if row == self.0 {
            panic!("post-op failed on row {row}");
        }
        value
    }
}

#[test]
fn test_panicking_post_op_unwinds_to_caller() {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut rng = rng();
        let (m, n, k) = (30, 40, 13);
        let a = Dense::<f32>::random(m, k, false, &mut rng);
        let b = Dense::<f32>::random(k, n, false, &mut rng);
        let ops = PostOpList::new().push(FailOnRow(0));

        for (jc, ic) in [(1, 1), (1, 2), (2, 2), (3, 1)] {
            let ctx = small_ctx(Threading::new(jc, ic).unwrap());
            let mut c = Dense::filled(m, n, 0.0f32, false);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                gemm_with_post_ops(&ctx, 1.0, Operand::Pack(a.view()), Operand::Pack(b.view()), 0.0, c.view_mut(), &ops)
            }));
            let in_use = ctx.pool().in_use_bytes();

            // the same context keeps working
            let mut c = Dense::filled(m, n, 0.0f32, false);
            let again = gemm(&ctx, 1.0, Operand::Pack(a.view()), Operand::Pack(b.view()), 0.0, c.view_mut());
            tx.send(((jc, ic), outcome.is_err(), in_use, again.is_ok())).unwrap();
        }
    });

    for _ in 0..4 {
        let (shape, panicked, in_use, again) = rx
            .recv_timeout(Duration::from_secs(60))
            .expect("gemm did not return after a worker panic");
        assert!(panicked, "{shape:?}");
        assert_eq!(in_use, 0, "{shape:?}");
        assert!(again, "{shape:?}");
    }
}

#[allow(dead_code)]
fn assert_context_is_sync() {
    fn is_sync<T: Sync + Send>() {}
    is_sync::<Context>();
}
