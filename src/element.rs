//! Numeric element types served by the engine.
//!
//! One driver body serves every type through the [`Element`] trait; the
//! per-type specialization (block sizes, kernel family) hangs off
//! [`Element::DTYPE`] and [`Element::kernels`].

use std::fmt::Debug;
use std::ops::{Add, Mul};

use num::traits::{One, Zero};
use num::Complex;

use crate::kernels::{KernelRegistry, KernelTables};

/// Single-precision complex.
#[allow(non_camel_case_types)]
pub type c32 = Complex<f32>;

/// Double-precision complex.
#[allow(non_camel_case_types)]
pub type c64 = Complex<f64>;

/// Runtime tag of an [`Element`] type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F32,
    F64,
    C32,
    C64,
}

/// Scalar type the GEMM engine can multiply.
pub trait Element:
    Copy + Send + Sync + Debug + PartialEq + Zero + One + Add<Output = Self> + Mul<Output = Self> + 'static
{
    const DTYPE: Dtype;

    /// Machine epsilon of the underlying real type.
    const EPSILON: f64;

    /// Complex conjugate; identity for real types.
    fn conj(self) -> Self;

    /// `self * a + b`, with a single rounding for real types.
    fn mul_add(self, a: Self, b: Self) -> Self;

    /// Builds a value from real and imaginary parts (imaginary part ignored for real types).
    fn from_parts(re: f64, im: f64) -> Self;

    /// Modulus as `f64`, used for tolerance checks.
    fn magnitude(self) -> f64;

    /// The kernel registry of this type's family.
    fn kernels(tables: &KernelTables) -> &KernelRegistry<Self>;
}

impl Element for f32 {
    const DTYPE: Dtype = Dtype::F32;
    const EPSILON: f64 = f32::EPSILON as f64;

    #[inline(always)]
    fn conj(self) -> Self {
        self
    }

    #[inline(always)]
    fn mul_add(self, a: Self, b: Self) -> Self {
        f32::mul_add(self, a, b)
    }

    fn from_parts(re: f64, _im: f64) -> Self {
        re as f32
    }

    fn magnitude(self) -> f64 {
        self.abs() as f64
    }

    fn kernels(tables: &KernelTables) -> &KernelRegistry<Self> {
        &tables.s
    }
}

impl Element for f64 {
    const DTYPE: Dtype = Dtype::F64;
    const EPSILON: f64 = f64::EPSILON;

    #[inline(always)]
    fn conj(self) -> Self {
        self
    }

    #[inline(always)]
    fn mul_add(self, a: Self, b: Self) -> Self {
        f64::mul_add(self, a, b)
    }

    fn from_parts(re: f64, _im: f64) -> Self {
        re
    }

    fn magnitude(self) -> f64 {
        self.abs()
    }

    fn kernels(tables: &KernelTables) -> &KernelRegistry<Self> {
        &tables.d
    }
}

impl Element for c32 {
    const DTYPE: Dtype = Dtype::C32;
    const EPSILON: f64 = f32::EPSILON as f64;

    #[inline(always)]
    fn conj(self) -> Self {
        Complex::conj(&self)
    }

    #[inline(always)]
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }

    fn from_parts(re: f64, im: f64) -> Self {
        Complex::new(re as f32, im as f32)
    }

    fn magnitude(self) -> f64 {
        self.norm() as f64
    }

    fn kernels(tables: &KernelTables) -> &KernelRegistry<Self> {
        &tables.c
    }
}

impl Element for c64 {
    const DTYPE: Dtype = Dtype::C64;
    const EPSILON: f64 = f64::EPSILON;

    #[inline(always)]
    fn conj(self) -> Self {
        Complex::conj(&self)
    }

    #[inline(always)]
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }

    fn from_parts(re: f64, im: f64) -> Self {
        Complex::new(re, im)
    }

    fn magnitude(self) -> f64 {
        self.norm()
    }

    fn kernels(tables: &KernelTables) -> &KernelRegistry<Self> {
        &tables.z
    }
}
