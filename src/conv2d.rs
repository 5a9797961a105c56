//! 2D convolution, forward and backward
//!
//! Each pass offers two strategies: a direct sliding-window accumulation
//! with clamped index ranges (no per-pixel bounds checks), and a
//! patch-transform + GEMM formulation that materializes the im2col matrix
//! and rides the matmul fast path. A pure cost estimator picks between them;
//! `*_with_strategy` entries on [`CpuEngine`](crate::CpuEngine) force a path
//! so both can be validated against each other.
//!
//! Gradient buffers (`gk`, `gb`, `ge`) are accumulated into, never
//! overwritten; the forward output is initialized to the bias (or zero) and
//! then accumulated.

use crate::im2col::{im2col, im2col_transposed};
use crate::matmul;
use crate::view::{ConvShape, MatMulDims, MatView};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Strategy tag returned by the cost estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    /// Direct sliding-window accumulation over clamped index ranges
    DirectLoop,
    /// im2col (or its transpose) followed by a single GEMM per batch element
    PatchTransformGemm,
}

/// Estimated multiply-accumulate count above which the forward
/// patch-transform pays for its scratch materialization.
const FORWARD_MAC_THRESHOLD: u64 = 10_000_000;

/// Weight-sized workload above which the weight-gradient transform path is
/// preferred.
const WEIGHT_GRAD_THRESHOLD: u64 = 1_000_000;

/// Pick the forward strategy for a shape.
///
/// The transform path amortizes its O(patch-matrix) cost only when the GEMM
/// it enables is large enough to dominate: it needs at least 16 filters, a
/// kernel of at least 3 on one spatial axis, an output area of at least 64,
/// and an estimated MAC count above [`FORWARD_MAC_THRESHOLD`]. Smaller
/// problems have better cache locality in the direct loops and skip the
/// scratch allocation.
pub fn forward_strategy(shape: &ConvShape) -> ConvStrategy {
    if shape.filters < 16 {
        return ConvStrategy::DirectLoop;
    }
    if shape.kernel_h < 3 && shape.kernel_w < 3 {
        return ConvStrategy::DirectLoop;
    }
    if shape.output_area() < 64 {
        return ConvStrategy::DirectLoop;
    }

    let macs = 2u64
        .saturating_mul(shape.batch as u64)
        .saturating_mul(shape.filters as u64)
        .saturating_mul(shape.output_area() as u64)
        .saturating_mul(shape.channels as u64)
        .saturating_mul(shape.kernel_area() as u64);
    if macs > FORWARD_MAC_THRESHOLD {
        ConvStrategy::PatchTransformGemm
    } else {
        ConvStrategy::DirectLoop
    }
}

/// Pick the weight-gradient strategy for a shape.
///
/// Asymmetric with [`forward_strategy`] on purpose: a channel count of 4 or
/// fewer forces the transform path regardless of problem size, because the
/// transform's per-call overhead is amortized by the cost of iterating the
/// channel-major correlation. The threshold is a candidate for empirical
/// re-tuning.
pub fn weight_grad_strategy(shape: &ConvShape) -> ConvStrategy {
    if shape.channels <= 4 {
        return ConvStrategy::PatchTransformGemm;
    }

    let load = (shape.filters as u64)
        .saturating_mul(shape.channels as u64)
        .saturating_mul(shape.kernel_area() as u64)
        .saturating_mul(shape.input_area() as u64);
    if load > WEIGHT_GRAD_THRESHOLD {
        ConvStrategy::PatchTransformGemm
    } else {
        ConvStrategy::DirectLoop
    }
}

/// Forward convolution with a pre-selected strategy. Validated entry points
/// live on [`CpuEngine`](crate::CpuEngine).
pub(crate) fn forward(
    x: &[f32],
    k: &[f32],
    bias: Option<&[f32]>,
    y: &mut [f32],
    shape: &ConvShape,
    strategy: ConvStrategy,
) {
    match strategy {
        ConvStrategy::DirectLoop => forward_direct(x, k, bias, y, shape),
        ConvStrategy::PatchTransformGemm => forward_gemm(x, k, bias, y, shape),
    }
}

/// Direct path: every (batch, filter) output slice is an independent work
/// item. The slice is set to the bias, then each (channel, kh, kw) triple
/// accumulates a scalar-weighted shifted input window into the clamped
/// valid output range.
fn forward_direct(x: &[f32], k: &[f32], bias: Option<&[f32]>, y: &mut [f32], shape: &ConvShape) {
    let (out_h, out_w) = (shape.out_h(), shape.out_w());
    let out_area = out_h * out_w;
    let area_x = shape.input_area();
    let area_k = shape.kernel_area();

    #[cfg(feature = "parallel")]
    let slices = y.par_chunks_mut(out_area);
    #[cfg(not(feature = "parallel"))]
    let slices = y.chunks_mut(out_area);

    slices.enumerate().for_each(|(bf, dst)| {
        let l = bf / shape.filters;
        let f = bf % shape.filters;

        dst.fill(bias.map_or(0.0, |b| b[f]));

        for c in 0..shape.channels {
            let xc = &x[(l * shape.channels + c) * area_x..][..area_x];
            let kc = &k[(f * shape.channels + c) * area_k..][..area_k];

            for kh in 0..shape.kernel_h {
                for kw in 0..shape.kernel_w {
                    let val_k = kc[kh * shape.kernel_w + kw];
                    let i_min = shape.pad_h.saturating_sub(kh);
                    let i_max = (shape.height + shape.pad_h).saturating_sub(kh).min(out_h);
                    let j_min = shape.pad_w.saturating_sub(kw);
                    let j_max = (shape.width + shape.pad_w).saturating_sub(kw).min(out_w);

                    for i in i_min..i_max {
                        let in_y = i + kh - shape.pad_h;
                        let x_row = &xc[in_y * shape.width..][..shape.width];
                        let dst_row = &mut dst[i * out_w..][..out_w];
                        for j in j_min..j_max {
                            dst_row[j] += x_row[j + kw - shape.pad_w] * val_k;
                        }
                    }
                }
            }
        }
    });
}

/// Transform path: per batch element, bias-fill the output slice, build the
/// patch matrix, then one GEMM `Y_slice += K_matrix * col` with the weights
/// viewed as `filters x (channels*kH*kW)`.
fn forward_gemm(x: &[f32], k: &[f32], bias: Option<&[f32]>, y: &mut [f32], shape: &ConvShape) {
    let patch = shape.patch_shape();
    let kdim = patch.patch_len();
    let ndim = patch.out_area();
    let area_x = shape.channels * shape.input_area();

    // scratch is private to this call and freed on return; im2col refills
    // every row, so reuse across batch elements is sound
    let mut col = vec![0.0f32; kdim * ndim];

    for l in 0..shape.batch {
        let x_slice = &x[l * area_x..][..area_x];
        let y_slice = &mut y[l * shape.filters * ndim..][..shape.filters * ndim];

        for f in 0..shape.filters {
            y_slice[f * ndim..(f + 1) * ndim].fill(bias.map_or(0.0, |b| b[f]));
        }

        im2col(x_slice, &mut col, &patch);

        matmul::gemm(
            k,
            MatView::contiguous(kdim),
            &col,
            MatView::contiguous(ndim),
            y_slice,
            MatView::contiguous(ndim),
            MatMulDims {
                m: shape.filters,
                k: kdim,
                n: ndim,
            },
        );
    }
}

/// Backward convolution: accumulates the bias, weight and input gradients.
/// The weight-gradient strategy is pre-selected by the caller.
pub(crate) fn backward(
    x: &[f32],
    k: &[f32],
    gs: &[f32],
    gk: &mut [f32],
    ge: &mut [f32],
    gb: Option<&mut [f32]>,
    shape: &ConvShape,
    gk_strategy: ConvStrategy,
) {
    if let Some(gb) = gb {
        bias_grad(gs, gb, shape);
    }

    match gk_strategy {
        ConvStrategy::DirectLoop => weight_grad_direct(x, gs, gk, shape),
        ConvStrategy::PatchTransformGemm => weight_grad_gemm(x, gs, gk, shape),
    }

    input_grad(k, gs, ge, shape);
}

/// Per-filter sum of the upstream gradient over batch and space. Each worker
/// owns one filter's accumulator slot, so the reduction needs no shared
/// state.
fn bias_grad(gs: &[f32], gb: &mut [f32], shape: &ConvShape) {
    let out_area = shape.output_area();

    #[cfg(feature = "parallel")]
    let slots = gb.par_iter_mut();
    #[cfg(not(feature = "parallel"))]
    let slots = gb.iter_mut();

    slots.enumerate().for_each(|(f, slot)| {
        let mut sum = 0.0f32;
        for l in 0..shape.batch {
            let base = (l * shape.filters + f) * out_area;
            sum += gs[base..base + out_area].iter().sum::<f32>();
        }
        *slot += sum;
    });
}

/// Direct weight gradient: for each (filter, channel, kh, kw), the clamped
/// correlation of the input with the upstream gradient, summed over the
/// batch. Parallel over (filter, channel) pairs, each owning one kernel
/// plane of `gk`.
fn weight_grad_direct(x: &[f32], gs: &[f32], gk: &mut [f32], shape: &ConvShape) {
    let (out_h, out_w) = (shape.out_h(), shape.out_w());
    let out_area = out_h * out_w;
    let area_x = shape.input_area();
    let area_k = shape.kernel_area();

    #[cfg(feature = "parallel")]
    let planes = gk.par_chunks_mut(area_k);
    #[cfg(not(feature = "parallel"))]
    let planes = gk.chunks_mut(area_k);

    planes.enumerate().for_each(|(fc, plane)| {
        let f = fc / shape.channels;
        let c = fc % shape.channels;

        for kh in 0..shape.kernel_h {
            for kw in 0..shape.kernel_w {
                let i_min = shape.pad_h.saturating_sub(kh);
                let i_max = (shape.height + shape.pad_h).saturating_sub(kh).min(out_h);
                let j_min = shape.pad_w.saturating_sub(kw);
                let j_max = (shape.width + shape.pad_w).saturating_sub(kw).min(out_w);

                let mut sum = 0.0f32;
                for l in 0..shape.batch {
                    let gs_base = (l * shape.filters + f) * out_area;
                    let x_base = (l * shape.channels + c) * area_x;

                    for i in i_min..i_max {
                        let in_y = i + kh - shape.pad_h;
                        let gs_row = &gs[gs_base + i * out_w..][..out_w];
                        let x_row = &x[x_base + in_y * shape.width..][..shape.width];
                        for j in j_min..j_max {
                            sum += gs_row[j] * x_row[j + kw - shape.pad_w];
                        }
                    }
                }
                plane[kh * shape.kernel_w + kw] += sum;
            }
        }
    });
}

/// Transform weight gradient: per batch element, build the transposed patch
/// matrix and run `GK += GS_slice * colT` as one GEMM. The transposed layout
/// keeps all three operands unit-stride, landing on the matmul fast path.
fn weight_grad_gemm(x: &[f32], gs: &[f32], gk: &mut [f32], shape: &ConvShape) {
    let patch = shape.patch_shape();
    let kdim = patch.patch_len();
    let ndim = patch.out_area();
    let area_x = shape.channels * shape.input_area();

    let mut col_t = vec![0.0f32; ndim * kdim];

    for l in 0..shape.batch {
        let x_slice = &x[l * area_x..][..area_x];
        let gs_slice = &gs[l * shape.filters * ndim..][..shape.filters * ndim];

        im2col_transposed(x_slice, &mut col_t, &patch);

        matmul::gemm(
            gs_slice,
            MatView::contiguous(ndim),
            &col_t,
            MatView::contiguous(kdim),
            gk,
            MatView::contiguous(kdim),
            MatMulDims {
                m: shape.filters,
                k: ndim,
                n: kdim,
            },
        );
    }
}

/// Input gradient: full correlation of the upstream gradient with the
/// spatially-flipped weights, accumulated into the un-padded input
/// positions. Parallel over (batch, channel) planes; every filter
/// contributes to the same plane sequentially within one worker.
fn input_grad(k: &[f32], gs: &[f32], ge: &mut [f32], shape: &ConvShape) {
    let (out_h, out_w) = (shape.out_h(), shape.out_w());
    let out_area = out_h * out_w;
    let area_x = shape.input_area();
    let area_k = shape.kernel_area();

    #[cfg(feature = "parallel")]
    let planes = ge.par_chunks_mut(area_x);
    #[cfg(not(feature = "parallel"))]
    let planes = ge.chunks_mut(area_x);

    planes.enumerate().for_each(|(lc, plane)| {
        let l = lc / shape.channels;
        let c = lc % shape.channels;

        for f in 0..shape.filters {
            let gs_base = (l * shape.filters + f) * out_area;
            let kc = &k[(f * shape.channels + c) * area_k..][..area_k];

            for kh in 0..shape.kernel_h {
                for kw in 0..shape.kernel_w {
                    let val_k = kc[kh * shape.kernel_w + kw];
                    let i_min = shape.pad_h.saturating_sub(kh);
                    let i_max = (shape.height + shape.pad_h).saturating_sub(kh).min(out_h);
                    let j_min = shape.pad_w.saturating_sub(kw);
                    let j_max = (shape.width + shape.pad_w).saturating_sub(kw).min(out_w);

                    for i in i_min..i_max {
                        let in_y = i + kh - shape.pad_h;
                        let gs_row = &gs[gs_base + i * out_w..][..out_w];
                        let ge_row = &mut plane[in_y * shape.width..][..shape.width];
                        for j in j_min..j_max {
                            ge_row[j + kw - shape.pad_w] += gs_row[j] * val_k;
                        }
                    }
                }
            }
        }
    });
}
