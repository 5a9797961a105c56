//! Centella: CPU Tensor Kernels for Neural-Network Workloads
//!
//! **Centella** (Spanish: "spark") provides the arithmetic-heavy kernels a
//! neural-network framework delegates to native code:
//!
//! 1. **MatMul** - cache-tiled `C += A*B` over strided views
//! 2. **Conv2D** - forward and backward, direct loops or im2col + GEMM
//! 3. **MaxPool** - windowed-max forward, argmax-rediscovery backward
//!
//! # Design Principles
//!
//! - **Caller-owned buffers**: kernels read and accumulate through flat
//!   `f32` slices plus shape/stride metadata; the only allocation is an
//!   ephemeral patch-transform scratch
//! - **Accumulate, never overwrite**: every gradient kernel is `+=`, so
//!   gradients compose across micro-batches; zeroing is the caller's job
//! - **Lock-free parallelism**: every parallel loop partitions its
//!   iteration space into disjoint destination regions
//! - **Explicit engine handle**: thread count and execution policy live in a
//!   [`CpuEngine`] value, not in process-wide mutable state
//!
//! # Quick Start
//!
//! ```rust
//! use centella::{CpuEngine, MatMulDims, MatView};
//!
//! let engine = CpuEngine::new();
//! let a = [1.0, 2.0, 3.0, 4.0];
//! let b = [5.0, 6.0, 7.0, 8.0];
//! let mut c = [0.0; 4];
//!
//! engine
//!     .matmul(
//!         &a,
//!         MatView::contiguous(2),
//!         &b,
//!         MatView::contiguous(2),
//!         &mut c,
//!         MatView::contiguous(2),
//!         MatMulDims { m: 2, k: 2, n: 2 },
//!     )
//!     .unwrap();
//! assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
//! ```

pub mod conv2d;
pub mod error;
pub mod im2col;
pub mod matmul;
pub mod maxpool;
pub mod view;

pub use conv2d::{forward_strategy, weight_grad_strategy, ConvStrategy};
pub use error::{KernelError, Result};
pub use view::{ConvShape, MatMulDims, MatView, PatchShape, PoolShape};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// The CPU kernel engine.
///
/// An engine value is the execution context every kernel call runs under.
/// [`CpuEngine::new`] shares the process-global worker pool;
/// [`CpuEngine::with_threads`] owns a dedicated pool of the requested size
/// (clamped to at least 1). Engines hold no other state: every call is pure
/// given its buffers, and results are deterministic for a fixed worker
/// count and partitioning (floating-point accumulation order is not
/// guaranteed identical across different pool sizes).
#[derive(Debug)]
pub struct CpuEngine {
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl CpuEngine {
    /// Engine backed by the default worker pool (size derived from
    /// available hardware concurrency).
    pub fn new() -> Self {
        CpuEngine {
            #[cfg(feature = "parallel")]
            pool: None,
        }
    }

    /// Engine backed by a dedicated pool of `threads` workers.
    ///
    /// A request for zero threads is clamped to one. Without the `parallel`
    /// feature the kernels run sequentially and the count is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ThreadPool`] if the pool cannot be built.
    pub fn with_threads(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| KernelError::ThreadPool(e.to_string()))?;
            Ok(CpuEngine { pool: Some(pool) })
        }
        #[cfg(not(feature = "parallel"))]
        {
            let _ = threads;
            Ok(CpuEngine {})
        }
    }

    /// Run a kernel on this engine's pool (or inline when there is none).
    fn run<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        #[cfg(feature = "parallel")]
        {
            match &self.pool {
                Some(pool) => pool.install(op),
                None => op(),
            }
        }
        #[cfg(not(feature = "parallel"))]
        {
            op()
        }
    }

    /// Tiled matrix multiply-accumulate: `C += A*B`.
    ///
    /// A is `m x k`, B is `k x n`, C is `m x n`, each addressed through its
    /// [`MatView`]. When all three views are unit-stride with no offset the
    /// contiguous fast path runs; any strided or offset view takes the
    /// generic path with identical tiling.
    ///
    /// The destination view must map distinct (row, column) pairs to
    /// distinct flat indices; C must not alias A or B.
    ///
    /// # Errors
    ///
    /// Returns an error if any dimension is zero or any view addresses an
    /// element outside its buffer.
    #[cfg_attr(
        feature = "tracing",
        instrument(skip_all, fields(m = dims.m, k = dims.k, n = dims.n))
    )]
    #[allow(clippy::too_many_arguments)]
    pub fn matmul(
        &self,
        a: &[f32],
        av: MatView,
        b: &[f32],
        bv: MatView,
        c: &mut [f32],
        cv: MatView,
        dims: MatMulDims,
    ) -> Result<()> {
        av.validate(dims.m, dims.k, a.len())?;
        bv.validate(dims.k, dims.n, b.len())?;
        cv.validate(dims.m, dims.n, c.len())?;

        self.run(|| matmul::gemm(a, av, b, bv, c, cv, dims));
        Ok(())
    }

    /// Forward 2D convolution with automatic strategy selection
    /// ([`forward_strategy`]).
    ///
    /// `y` (`batch x filters x outH x outW`) is initialized to the bias (or
    /// zero) and then accumulated; its prior contents are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape is invalid or any buffer is too short.
    #[cfg_attr(
        feature = "tracing",
        instrument(skip_all, fields(batch = shape.batch, filters = shape.filters))
    )]
    pub fn conv2d_forward(
        &self,
        x: &[f32],
        k: &[f32],
        bias: Option<&[f32]>,
        y: &mut [f32],
        shape: &ConvShape,
    ) -> Result<()> {
        self.conv2d_forward_with_strategy(x, k, bias, y, shape, forward_strategy(shape))
    }

    /// Forward 2D convolution with a forced strategy. Used to validate path
    /// equivalence; [`conv2d_forward`](Self::conv2d_forward) is the normal
    /// entry.
    pub fn conv2d_forward_with_strategy(
        &self,
        x: &[f32],
        k: &[f32],
        bias: Option<&[f32]>,
        y: &mut [f32],
        shape: &ConvShape,
        strategy: ConvStrategy,
    ) -> Result<()> {
        shape.validate()?;
        check_len(x.len(), shape.input_len())?;
        check_len(k.len(), shape.weights_len())?;
        check_len(y.len(), shape.output_len())?;
        if let Some(b) = bias {
            check_len(b.len(), shape.filters)?;
        }

        self.run(|| conv2d::forward(x, k, bias, y, shape, strategy));
        Ok(())
    }

    /// Backward 2D convolution with automatic weight-gradient strategy
    /// selection ([`weight_grad_strategy`]).
    ///
    /// Accumulates the weight gradient into `gk`, the input gradient into
    /// `ge` and, when present, the bias gradient into `gb`. All three are
    /// `+=` targets: zero them before a fresh accumulation pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape is invalid or any buffer is too short.
    #[cfg_attr(
        feature = "tracing",
        instrument(skip_all, fields(batch = shape.batch, filters = shape.filters))
    )]
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d_backward(
        &self,
        x: &[f32],
        k: &[f32],
        gs: &[f32],
        gk: &mut [f32],
        ge: &mut [f32],
        gb: Option<&mut [f32]>,
        shape: &ConvShape,
    ) -> Result<()> {
        self.conv2d_backward_with_strategy(x, k, gs, gk, ge, gb, shape, weight_grad_strategy(shape))
    }

    /// Backward 2D convolution with a forced weight-gradient strategy.
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d_backward_with_strategy(
        &self,
        x: &[f32],
        k: &[f32],
        gs: &[f32],
        gk: &mut [f32],
        ge: &mut [f32],
        gb: Option<&mut [f32]>,
        shape: &ConvShape,
        gk_strategy: ConvStrategy,
    ) -> Result<()> {
        shape.validate()?;
        check_len(x.len(), shape.input_len())?;
        check_len(k.len(), shape.weights_len())?;
        check_len(gs.len(), shape.output_len())?;
        check_len(gk.len(), shape.weights_len())?;
        check_len(ge.len(), shape.input_len())?;
        if let Some(ref b) = gb {
            check_len(b.len(), shape.filters)?;
        }

        self.run(move || conv2d::backward(x, k, gs, gk, ge, gb, shape, gk_strategy));
        Ok(())
    }

    /// Forward 2D max-pooling: writes the window maximum for every output
    /// position of every (batch, channel) plane.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape is invalid or any buffer is too short.
    #[cfg_attr(
        feature = "tracing",
        instrument(skip_all, fields(batch = shape.batch, channels = shape.channels))
    )]
    pub fn maxpool2d_forward(&self, x: &[f32], y: &mut [f32], shape: &PoolShape) -> Result<()> {
        shape.validate()?;
        check_len(x.len(), shape.input_len())?;
        check_len(y.len(), shape.output_len())?;

        self.run(|| maxpool::forward(x, y, shape));
        Ok(())
    }

    /// Backward 2D max-pooling: re-derives each window's argmax from the
    /// forward input `x` and accumulates the upstream gradient `gs` into
    /// `ge` at that position.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape is invalid or any buffer is too short.
    #[cfg_attr(
        feature = "tracing",
        instrument(skip_all, fields(batch = shape.batch, channels = shape.channels))
    )]
    pub fn maxpool2d_backward(
        &self,
        x: &[f32],
        gs: &[f32],
        ge: &mut [f32],
        shape: &PoolShape,
    ) -> Result<()> {
        shape.validate()?;
        check_len(x.len(), shape.input_len())?;
        check_len(gs.len(), shape.output_len())?;
        check_len(ge.len(), shape.input_len())?;

        self.run(|| maxpool::backward(x, gs, ge, shape));
        Ok(())
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn check_len(actual: usize, expected: usize) -> Result<()> {
    if actual < expected {
        return Err(KernelError::SizeMismatch { expected, actual });
    }
    Ok(())
}
