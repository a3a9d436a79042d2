//! Portable kernels for every element type.

use std::sync::Arc;

use crate::{
    element::Element,
    postop::{PostOpAttr, PostOpList},
};

use super::{KernelArgs, MicroKernel};

/// Scalar `MR × NR` kernel.
///
/// Accumulates each output with `mul_add` in k order, scales by alpha, then
/// folds in `beta * C`; SIMD kernels of the same family follow the same
/// sequence of roundings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefKernel<const MR: usize, const NR: usize>;

impl<T: Element, const MR: usize, const NR: usize> MicroKernel<T> for RefKernel<MR, NR> {
    fn mr(&self) -> usize {
        MR
    }

    fn nr(&self) -> usize {
        NR
    }

    fn name(&self) -> &'static str {
        "ref"
    }

    unsafe fn run(&self, args: &KernelArgs<T>, post_ops: &PostOpList<T>, attr: &PostOpAttr) {
        let mut acc = [[T::zero(); NR]; MR];

        for p in 0..args.k {
            let mut b = [T::zero(); NR];
            for (j, bj) in b.iter_mut().enumerate() {
                let v = *args.b.add(p * args.rs_b + j * args.cs_b);
                *bj = if args.conj_b { v.conj() } else { v };
            }
            for (i, row) in acc.iter_mut().enumerate() {
                let mut a = *args.a.add(i * args.rs_a + p * args.cs_a);
                if args.conj_a {
                    a = a.conj();
                }
                for (acc_ij, &bj) in row.iter_mut().zip(b.iter()) {
                    *acc_ij = a.mul_add(bj, *acc_ij);
                }
            }
        }

        let beta_zero = args.beta == T::zero();
        let fuse = attr.is_last_k && !post_ops.is_empty();
        for (i, row) in acc.iter().enumerate() {
            for (j, &acc_ij) in row.iter().enumerate() {
                let dst = args.c.add(i * args.rs_c + j * args.cs_c);
                let mut v = args.alpha * acc_ij;
                if !beta_zero {
                    v = args.beta.mul_add(*dst, v);
                }
                if fuse {
                    v = post_ops.apply(v, attr.post_op_c_i + i, attr.post_op_c_j + j);
                }
                *dst = v;
            }
        }
    }
}

macro_rules! ref_row {
    ($mr:literal, $nr:expr) => {
        match $nr {
            1 => Arc::new(RefKernel::<$mr, 1>) as Arc<dyn MicroKernel<T>>,
            2 => Arc::new(RefKernel::<$mr, 2>),
            4 => Arc::new(RefKernel::<$mr, 4>),
            8 => Arc::new(RefKernel::<$mr, 8>),
            12 => Arc::new(RefKernel::<$mr, 12>),
            16 => Arc::new(RefKernel::<$mr, 16>),
            _ => Arc::new(RefKernel::<1, 1>),
        }
    };
}

/// The reference kernel of shape `mr × nr`.
///
/// Shapes outside the supported families fall back to the 1×1 kernel, which
/// the registry rejects as a shape mismatch.
pub fn make<T: Element>(mr: usize, nr: usize) -> Arc<dyn MicroKernel<T>> {
    match mr {
        1 => ref_row!(1, nr),
        2 => ref_row!(2, nr),
        3 => ref_row!(3, nr),
        4 => ref_row!(4, nr),
        6 => ref_row!(6, nr),
        _ => Arc::new(RefKernel::<1, 1>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::c32;
    use crate::postop::{BiasAdd, Relu};

    #[allow(clippy::too_many_arguments)]
    fn args<T: Element>(
        k: usize,
        a: &[T],
        b: &[T],
        c: &mut [T],
        _mr: usize,
        nr: usize,
        alpha: T,
        beta: T,
    ) -> KernelArgs<T> {
        // A row-major mr x k, B row-major k x nr, C row-major mr x nr
        KernelArgs {
            k,
            a: a.as_ptr(),
            rs_a: k,
            cs_a: 1,
            b: b.as_ptr(),
            rs_b: nr,
            cs_b: 1,
            c: c.as_mut_ptr(),
            rs_c: nr,
            cs_c: 1,
            alpha,
            beta,
            conj_a: false,
            conj_b: false,
        }
    }

    #[test]
    fn test_all_ones_tile() {
        let a = vec![1.0f32; 6 * 4];
        let b = vec![1.0f32; 4 * 16];
        let mut c = vec![f32::NAN; 6 * 16];
        let kargs = args(4, &a, &b, &mut c, 6, 16, 1.0, 0.0);
        let kernel = make::<f32>(6, 16);
        unsafe { kernel.run(&kargs, &PostOpList::new(), &PostOpAttr::default()) };
        assert!(c.iter().all(|&x| x == 4.0));
    }

    #[test]
    fn test_alpha_beta() {
        let (a, b, mut c) = ([3.0f64], [2.0f64], [5.0f64]);
        let kargs = args(1, &a, &b, &mut c, 1, 1, 2.0, 1.0);
        unsafe { make::<f64>(1, 1).run(&kargs, &PostOpList::new(), &PostOpAttr::default()) };
        assert_eq!(c, [17.0]);
    }

    #[test]
    fn test_column_stored_output() {
        // 2x2 product written column-major
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [1.0f32, 0.0, 0.0, 1.0];
        let mut c = [0.0f32; 4];
        let mut kargs = args(2, &a, &b, &mut c, 2, 2, 1.0, 0.0);
        kargs.rs_c = 1;
        kargs.cs_c = 2;
        unsafe { make::<f32>(2, 2).run(&kargs, &PostOpList::new(), &PostOpAttr::default()) };
        assert_eq!(c, [1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_conjugated_complex_operands() {
        let a = [c32::new(1.0, 1.0)];
        let b = [c32::new(2.0, -1.0)];
        let mut c = [c32::new(0.0, 0.0)];
        let mut kargs = args(1, &a, &b, &mut c, 1, 1, c32::new(1.0, 0.0), c32::new(0.0, 0.0));
        kargs.conj_a = true;
        unsafe { make::<c32>(1, 1).run(&kargs, &PostOpList::new(), &PostOpAttr::default()) };
        // (1 - i)(2 - i) = 1 - 3i
        assert_eq!(c[0], c32::new(1.0, -3.0));
    }

    #[test]
    fn test_post_ops_only_on_last_k() {
        let a = [1.0f32, 1.0];
        let b = [-1.0f32, 1.0];
        let ops = PostOpList::new().push(BiasAdd::new(vec![0.0, 0.0, 10.0])).push(Relu);

        let mut c = [0.0f32; 2];
        let mut kargs = args(1, &a, &b, &mut c, 2, 1, 1.0, 0.0);
        kargs.rs_a = 1;
        kargs.rs_b = 1;
        kargs.rs_c = 1;
        let mut attr = PostOpAttr {
            post_op_c_i: 0,
            post_op_c_j: 2,
            is_first_k: true,
            is_last_k: false,
        };
        unsafe { make::<f32>(2, 1).run(&kargs, &ops, &attr) };
        assert_eq!(c, [-1.0, -1.0]);

        attr.is_last_k = true;
        unsafe { make::<f32>(2, 1).run(&kargs, &ops, &attr) };
        assert_eq!(c, [9.0, 9.0]);
    }

    #[test]
    fn test_unsupported_shape_falls_back() {
        assert_eq!(make::<f32>(7, 16).mr(), 1);
        assert_eq!(make::<f64>(5, 8).nr(), 1);
    }
}
