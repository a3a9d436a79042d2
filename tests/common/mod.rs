//! Shared helpers for the integration tests.
#![allow(dead_code)]

use gemmly::{Arch, Context, ContextBuilder, Dtype, Element, MatMut, MatRef, Threading};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

pub fn random_vec<T: Element>(len: usize, rng: &mut StdRng) -> Vec<T> {
    (0..len)
        .map(|_| T::from_parts(rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)))
        .collect()
}

/// A dense test matrix stored row- or column-major.
#[derive(Debug, Clone)]
pub struct Dense<T> {
    pub data: Vec<T>,
    pub rows: usize,
    pub cols: usize,
    pub col_major: bool,
}

impl<T: Element> Dense<T> {
    pub fn random(rows: usize, cols: usize, col_major: bool, rng: &mut StdRng) -> Self {
        Dense {
            data: random_vec(rows * cols, rng),
            rows,
            cols,
            col_major,
        }
    }

    pub fn filled(rows: usize, cols: usize, value: T, col_major: bool) -> Self {
        Dense {
            data: vec![value; rows * cols],
            rows,
            cols,
            col_major,
        }
    }

    fn index(&self, i: usize, j: usize) -> usize {
        if self.col_major {
            j * self.rows + i
        } else {
            i * self.cols + j
        }
    }

    pub fn get(&self, i: usize, j: usize) -> T {
        self.data[self.index(i, j)]
    }

    pub fn view(&self) -> MatRef<'_, T> {
        if self.col_major {
            MatRef::col_major(&self.data, self.rows, self.cols).unwrap()
        } else {
            MatRef::row_major(&self.data, self.rows, self.cols).unwrap()
        }
    }

    pub fn view_mut(&mut self) -> MatMut<'_, T> {
        let (rows, cols) = (self.rows, self.cols);
        if self.col_major {
            MatMut::col_major(&mut self.data, rows, cols).unwrap()
        } else {
            MatMut::row_major(&mut self.data, rows, cols).unwrap()
        }
    }

    /// Row-major copy of the logical contents.
    pub fn to_row_major(&self) -> Vec<T> {
        (0..self.rows)
            .flat_map(|i| (0..self.cols).map(move |j| (i, j)))
            .map(|(i, j)| self.get(i, j))
            .collect()
    }
}

/// Triple-loop reference; returns the row-major result and a per-element
/// error scale `|alpha| * sum |a||b| + |beta| * |c|`.
pub fn naive<T: Element>(alpha: T, a: MatRef<'_, T>, b: MatRef<'_, T>, beta: T, c: &Dense<T>) -> (Vec<T>, Vec<f64>) {
    let (m, k, n) = (a.rows(), a.cols(), b.cols());
    let mut out = Vec::with_capacity(m * n);
    let mut scale = Vec::with_capacity(m * n);
    for i in 0..m {
        for j in 0..n {
            let mut acc = T::zero();
            let mut mag = 0.0;
            for p in 0..k {
                acc = acc + a.get(i, p) * b.get(p, j);
                mag += a.get(i, p).magnitude() * b.get(p, j).magnitude();
            }
            let mut v = alpha * acc;
            mag *= alpha.magnitude();
            if beta != T::zero() {
                v = v + beta * c.get(i, j);
                mag += beta.magnitude() * c.get(i, j).magnitude();
            }
            out.push(v);
            scale.push(mag);
        }
    }
    (out, scale)
}

/// Asserts `actual` matches `expected` within `K × epsilon` accumulation error.
pub fn assert_close<T: Element>(actual: &[T], expected: &[T], scale: &[f64], k: usize, context: &str) {
    assert_eq!(actual.len(), expected.len(), "{context}");
    let neg_one = T::from_parts(-1.0, 0.0);
    for (idx, ((&x, &y), &s)) in actual.iter().zip(expected).zip(scale).enumerate() {
        let err = (x + neg_one * y).magnitude();
        let tol = 4.0 * (k as f64 + 2.0) * T::EPSILON * s + T::EPSILON;
        assert!(err <= tol, "{context}: element {idx}: {x:?} vs {y:?} (err {err:e}, tol {tol:e})");
    }
}

/// Generic-arch context with small blocks so that modest shapes cross every
/// block boundary.
pub fn small_ctx(threading: Threading) -> Context {
    ContextBuilder::new()
        .arch(Arch::Generic)
        .macro_block_sizes(Dtype::F32, 12, 32, 5)
        .macro_block_sizes(Dtype::F64, 12, 16, 5)
        .macro_block_sizes(Dtype::C32, 6, 16, 5)
        .macro_block_sizes(Dtype::C64, 6, 8, 5)
        .threading(threading)
        .build()
        .unwrap()
}

/// Detected-arch context with small blocks.
pub fn native_small_ctx(threading: Threading) -> Context {
    ContextBuilder::new()
        .macro_block_sizes(Dtype::F32, 12, 32, 5)
        .threading(threading)
        .build()
        .unwrap()
}
