//! The five-loop driver.
//!
//! ```text
//! jc: column blocks of NC      (outer thread group splits the columns)
//!   pc: K slices of KC         (sequential; never split)
//!     [pack B: whole inner group, chief-owned buffer]
//!     ic: row blocks of MC     (inner thread group splits the rows)
//!       [pack A: private buffer]
//!       jr: micro-columns of NR
//!         kernel over the MC rows, MR at a time
//! ```
//!
//! Every thread first acquires its scratch memory, then all threads meet at a
//! call-wide barrier. If any acquisition failed, every thread skips the
//! compute phase, so a failed call never writes to C.
//!
//! Barrier discipline: members of an inner group share the same column range
//! and therefore run the same jc/pc iterations; members whose row range is
//! empty still take part in the packing of B and in every barrier.
//!
//! A panic inside the compute phase (a post-op is user code) aborts every
//! group barrier so the other members stop at their next synchronization
//! point. All threads still meet at the retire barrier before scratch is
//! released, and the panic resumes on the calling thread.

use std::any::Any;
use std::cmp::min;
use std::mem::size_of;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    blocksize::{round_up, BlockSizes},
    comm::{AbortableBarrier, GroupComm},
    context::Context,
    element::Element,
    gemm::Uplo,
    kernels::{KernelArgs, KernelRegistry},
    pack::pack_panels,
    partition::{range_for, Edge, ThreadInfo, Threading},
    pool::{MemBlock, PoolTag},
    postop::{PostOpAttr, PostOpList},
    reorder::{a_block_offset, locate_b},
    view::Operand,
    GemmError, Result,
};

/// A raw pointer that may cross threads.
///
/// Used for C, whose tiles are written by disjoint threads, and for the
/// address of a shared B panel published by a group chief.
pub(crate) struct SyncPtr<T>(pub *mut T);

impl<T> Clone for SyncPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SyncPtr<T> {}

// SAFETY: the driver's partitioning keeps concurrent accesses disjoint, and
// reads of a shared panel are ordered after its writes by group barriers.
unsafe impl<T> Send for SyncPtr<T> {}
unsafe impl<T> Sync for SyncPtr<T> {}

/// One fully validated call, in the row-stored orientation.
pub(crate) struct Problem<'a, T> {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: T,
    pub beta: T,
    pub a: Operand<'a, T>,
    pub b: Operand<'a, T>,
    pub c: SyncPtr<T>,
    pub rs_c: usize,
    pub cs_c: usize,
    pub post_ops: &'a PostOpList<T>,
    pub uplo: Option<Uplo>,
}

struct Shared<T> {
    groups: Vec<GroupComm<SyncPtr<T>>>,
    setup: AbortableBarrier,
    failed: AtomicBool,
    error: Mutex<Option<GemmError>>,
    aborted: AtomicBool,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

struct Driver<'a, T> {
    ctx: &'a Context,
    problem: &'a Problem<'a, T>,
    bs: BlockSizes,
    kernels: &'a KernelRegistry<T>,
    threading: Threading,
    shared: &'a Shared<T>,
}

/// Operand pointers of the current A block.
struct ABlock<T> {
    ptr: *const T,
    rs: usize,
    cs: usize,
    // distance between MR-row panels
    ps: usize,
    conj: bool,
}

/// Operand pointers of the current B block.
struct BBlock<T> {
    ptr: *const T,
    rs: usize,
    cs: usize,
    // advance per column of the jr loop
    jr_inc: usize,
    conj: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TileMask {
    Full,
    Partial,
    Skip,
}

/// How rows `r0..r1` × columns `c0..c1` relate to the stored triangle.
fn classify(uplo: Uplo, r0: usize, r1: usize, c0: usize, c1: usize) -> TileMask {
    let (r_last, c_last) = (r1 - 1, c1 - 1);
    match uplo {
        Uplo::Lower if r0 >= c_last => TileMask::Full,
        Uplo::Lower if r_last < c0 => TileMask::Skip,
        Uplo::Upper if r_last <= c0 => TileMask::Full,
        Uplo::Upper if r0 > c_last => TileMask::Skip,
        _ => TileMask::Partial,
    }
}

#[inline]
fn keeps(uplo: Uplo, i: usize, j: usize) -> bool {
    match uplo {
        Uplo::Lower => i >= j,
        Uplo::Upper => i <= j,
    }
}

/// Runs `problem` on `threading.num_threads()` threads.
pub(crate) fn run<T: Element>(ctx: &Context, problem: &Problem<'_, T>, threading: Threading) -> Result<()> {
    let num_threads = threading.num_threads();
    let shared = Shared {
        groups: (0..threading.jc_ways)
            .map(|_| GroupComm::new(threading.ic_ways))
            .collect(),
        setup: AbortableBarrier::new(num_threads),
        failed: AtomicBool::new(false),
        error: Mutex::new(None),
        aborted: AtomicBool::new(false),
        panic: Mutex::new(None),
    };
    let driver = Driver {
        ctx,
        problem,
        bs: ctx.block_sizes::<T>(),
        kernels: ctx.kernels::<T>(),
        threading,
        shared: &shared,
    };

    if num_threads == 1 {
        driver.thread_main(0);
    } else {
        // all members must be resident at once for the barriers
        let workers = ctx.workers(num_threads)?;
        workers.broadcast(|tid| driver.thread_main(tid));
    }

    if let Some(payload) = shared.panic.into_inner() {
        panic::resume_unwind(payload);
    }
    match shared.error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl<T: Element> Driver<'_, T> {
    fn fail(&self, error: GemmError) {
        warn!(%error, "aborting gemm before compute");
        self.shared.failed.store(true, Ordering::Release);
        let mut slot = self.shared.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn abort(&self, payload: Box<dyn Any + Send>) {
        warn!("gemm worker panicked, aborting the call");
        self.shared.aborted.store(true, Ordering::Release);
        {
            let mut slot = self.shared.panic.lock();
            if slot.is_none() {
                *slot = Some(payload);
            }
        }
        for group in &self.shared.groups {
            group.abort();
        }
        self.shared.setup.abort();
    }

    fn thread_main(&self, tid: usize) {
        let p = self.problem;
        let bs = self.bs;
        let pool = self.ctx.pool();
        let (thread_jc, thread_ic) = self.threading.thread_infos(tid);
        let comm = &self.shared.groups[thread_jc.work_id];
        let kc_max = min(bs.kc, p.k);

        // === Scratch acquisition ===

        let mut a_block = MemBlock::unallocated(PoolTag::APanel);
        if let Operand::Pack(_) = p.a {
            let len = min(bs.mc, round_up(p.m, bs.mr)) * kc_max;
            match pool.acquire(len * size_of::<T>(), PoolTag::APanel) {
                Ok(block) => a_block = block,
                Err(e) => self.fail(e),
            }
        }

        let packs_b = matches!(p.b, Operand::Pack(_));
        let mut b_block = MemBlock::unallocated(PoolTag::BPanel);
        let b_buf = if packs_b {
            comm.handoff(&thread_ic, || {
                let bytes = min(bs.nc, round_up(p.n, bs.nr)) * kc_max * size_of::<T>();
                match pool.acquire(bytes, PoolTag::BPanel) {
                    Ok(block) => {
                        debug!(group = thread_jc.work_id, bytes, "chief acquired B panel");
                        let ptr = SyncPtr(block.as_mut_ptr().cast::<T>());
                        b_block = block;
                        Some(ptr)
                    }
                    Err(e) => {
                        self.fail(e);
                        None
                    }
                }
            })
        } else {
            None
        };

        let mut tri_tile = match p.uplo {
            Some(_) => vec![T::zero(); bs.mr * bs.nr],
            None => Vec::new(),
        };

        let ready = self.shared.setup.wait();

        if ready && !self.shared.failed.load(Ordering::Acquire) {
            let a_buf = a_block.as_mut_ptr().cast::<T>();
            let b_buf = b_buf.map_or(std::ptr::null_mut(), |ptr| ptr.0);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.compute(&thread_jc, &thread_ic, comm, a_buf, b_buf, &mut tri_tile)
            }));
            if let Err(payload) = outcome {
                self.abort(payload);
            }
        }

        // === Release ===

        if packs_b {
            comm.retire(&thread_ic, |_| pool.release(&mut b_block));
        }
        pool.release(&mut a_block);
    }

    fn compute(
        &self,
        thread_jc: &ThreadInfo,
        thread_ic: &ThreadInfo,
        comm: &GroupComm<SyncPtr<T>>,
        a_buf: *mut T,
        b_buf: *mut T,
        tri_tile: &mut [T],
    ) {
        let p = self.problem;
        let BlockSizes { mr, nr, mc, nc, kc } = self.bs;

        let (jc_start, jc_end) = range_for(thread_jc, p.n, nr, Edge::High);
        let (ic_start, ic_end) = range_for(thread_ic, p.m, mr, Edge::High);

        let mut jc = jc_start;
        while jc < jc_end {
            let mut nc0 = min(jc_end - jc, nc);
            if let Operand::Reordered(_) = p.b {
                // stop at the end of the stored NC block
                nc0 = locate_b(jc, nc0, p.n, nc, nr).nc0;
            }

            let mut pc = 0;
            while pc < p.k {
                if self.shared.aborted.load(Ordering::Acquire) {
                    return;
                }
                let kc0 = min(p.k - pc, kc);
                let is_first_k = pc == 0;
                let is_last_k = pc + kc >= p.k;
                let beta0 = if is_first_k { p.beta } else { T::one() };

                let b = match p.b {
                    Operand::Native(v) => BBlock {
                        ptr: v.offset_ptr(pc, jc),
                        rs: v.rs(),
                        cs: v.cs(),
                        jr_inc: v.cs(),
                        conj: v.is_conj(),
                    },
                    Operand::Pack(v) => {
                        // previous slice fully consumed
                        if !comm.barrier() {
                            return;
                        }
                        let (js, je) = range_for(thread_ic, nc0, nr, Edge::High);
                        if js < je {
                            // SAFETY: the chief's buffer holds round_up(nc0, NR) * kc0
                            // elements and each member writes its own panels.
                            unsafe {
                                pack_panels(
                                    b_buf.add(js * kc0),
                                    v.offset_ptr(pc, jc + js),
                                    je - js,
                                    kc0,
                                    v.cs(),
                                    v.rs(),
                                    nr,
                                    v.is_conj(),
                                    T::one(),
                                );
                            }
                            trace!(jc, pc, js, je, "packed B");
                        }
                        if !comm.barrier() {
                            return;
                        }
                        BBlock {
                            ptr: b_buf,
                            rs: nr,
                            cs: 1,
                            jr_inc: kc0,
                            conj: false,
                        }
                    }
                    Operand::Reordered(r) => {
                        let loc = locate_b(jc, nc0, p.n, nc, nr);
                        BBlock {
                            ptr: r.as_ptr().wrapping_add(loc.slice_offset(p.k, pc, kc0)),
                            rs: nr,
                            cs: 1,
                            jr_inc: kc0,
                            conj: false,
                        }
                    }
                };

                let mut ic = ic_start;
                while ic < ic_end {
                    let mc0 = min(ic_end - ic, mc);

                    let a = match p.a {
                        Operand::Native(v) => ABlock {
                            ptr: v.offset_ptr(ic, pc),
                            rs: v.rs(),
                            cs: v.cs(),
                            ps: mr * v.rs(),
                            conj: v.is_conj(),
                        },
                        Operand::Pack(v) => {
                            // SAFETY: the private buffer holds round_up(MC, MR) * KC elements.
                            unsafe {
                                pack_panels(a_buf, v.offset_ptr(ic, pc), mc0, kc0, v.rs(), v.cs(), mr, v.is_conj(), T::one());
                            }
                            trace!(ic, pc, mc0, kc0, "packed A");
                            ABlock {
                                ptr: a_buf,
                                rs: 1,
                                cs: mr,
                                ps: mr * kc0,
                                conj: false,
                            }
                        }
                        Operand::Reordered(r) => ABlock {
                            ptr: r.as_ptr().wrapping_add(a_block_offset(ic, pc, p.m, mr, kc0)),
                            rs: 1,
                            cs: mr,
                            ps: mr * kc0,
                            conj: false,
                        },
                    };

                    for jr in (0..nc0).step_by(nr) {
                        let nr0 = min(nc0 - jr, nr);
                        let args = KernelArgs {
                            k: kc0,
                            a: a.ptr,
                            rs_a: a.rs,
                            cs_a: a.cs,
                            b: b.ptr.wrapping_add(jr * b.jr_inc),
                            rs_b: b.rs,
                            cs_b: b.cs,
                            c: p.c.0.wrapping_add(ic * p.rs_c + (jc + jr) * p.cs_c),
                            rs_c: p.rs_c,
                            cs_c: p.cs_c,
                            alpha: p.alpha,
                            beta: beta0,
                            conj_a: a.conj,
                            conj_b: b.conj,
                        };
                        let attr = PostOpAttr {
                            post_op_c_i: ic,
                            post_op_c_j: jc + jr,
                            is_first_k,
                            is_last_k,
                        };

                        // SAFETY: operand footprints were validated at entry and
                        // this thread owns rows ic..ic+mc0 of columns jc..jc+nc0.
                        unsafe {
                            match p.uplo {
                                None => self.kernels.run_block(mc0, nr0, &args, a.ps, p.post_ops, &attr),
                                Some(uplo) => self.run_triangular(uplo, mc0, nr0, &args, a.ps, &attr, tri_tile),
                            }
                        }
                    }
                    ic += mc0;
                }
                pc += kc0;
            }
            jc += nc0;
        }
    }

    /// Like [`KernelRegistry::run_block`], touching only the `uplo` triangle.
    ///
    /// Panels straddling the diagonal are computed into `tile` with beta = 0
    /// and merged element-wise with the same `beta * C + value` rounding the
    /// kernels use.
    #[allow(clippy::too_many_arguments)]
    unsafe fn run_triangular(
        &self,
        uplo: Uplo,
        mc0: usize,
        nr0: usize,
        args: &KernelArgs<T>,
        ps_a: usize,
        attr: &PostOpAttr,
        tile: &mut [T],
    ) {
        let (mr, nr) = (self.bs.mr, self.bs.nr);
        let c0 = attr.post_op_c_j;

        for ir in (0..mc0).step_by(mr) {
            let m_rem = min(mr, mc0 - ir);
            let r0 = attr.post_op_c_i + ir;
            let panel = KernelArgs {
                a: args.a.wrapping_add((ir / mr) * ps_a),
                c: args.c.wrapping_add(ir * args.rs_c),
                ..*args
            };
            let panel_attr = attr.offset(ir, 0);

            match classify(uplo, r0, r0 + m_rem, c0, c0 + nr0) {
                TileMask::Skip => {}
                TileMask::Full => {
                    self.kernels.run_edge(m_rem, nr0, &panel, self.problem.post_ops, &panel_attr);
                }
                TileMask::Partial => {
                    let scratch = KernelArgs {
                        c: tile.as_mut_ptr(),
                        rs_c: nr,
                        cs_c: 1,
                        beta: T::zero(),
                        ..panel
                    };
                    self.kernels.run_edge(m_rem, nr0, &scratch, self.problem.post_ops, &panel_attr);

                    let beta_zero = panel.beta == T::zero();
                    for i in 0..m_rem {
                        for j in (0..nr0).filter(|&j| keeps(uplo, r0 + i, c0 + j)) {
                            let dst = panel.c.add(i * panel.rs_c + j * panel.cs_c);
                            let value = tile[i * nr + j];
                            *dst = if beta_zero {
                                value
                            } else {
                                panel.beta.mul_add(*dst, value)
                            };
                        }
                    }
                }
            }
        }
    }
}
