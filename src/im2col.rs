//! Patch transform: im2col, its transpose, and the col2im scatter-add
//!
//! `im2col` rearranges one padded `channels x H x W` tensor into a
//! `(channels*kH*kW) x (outH*outW)` matrix where each column is the
//! flattened receptive-field patch of one output position, turning
//! convolution into a single GEMM. `im2col_transposed` produces the
//! `(outH*outW) x (channels*kH*kW)` layout, which keeps the weight-gradient
//! GEMM on the contiguous fast path. `col2im` is the exact inverse
//! scatter-add, used to fold patch-space gradients back into tensor space.
//!
//! Padding positions always read as zero: the populate loops walk only
//! in-bounds source rows (clamped index ranges, no per-pixel checks) and the
//! remainder of each destination row is zero-filled up front.

use crate::view::PatchShape;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Build the `(channels*kH*kW) x (outH*outW)` patch matrix for one tensor.
///
/// `col` must hold `shape.patch_len() * shape.out_area()` elements; its prior
/// contents are ignored.
pub fn im2col(x: &[f32], col: &mut [f32], shape: &PatchShape) {
    let out_area = shape.out_area();
    debug_assert_eq!(col.len(), shape.patch_len() * out_area);
    debug_assert!(x.len() >= shape.channels * shape.height * shape.width);

    // One worker per patch row; rows are disjoint, contiguous chunks.
    #[cfg(feature = "parallel")]
    let rows = col.par_chunks_mut(out_area);
    #[cfg(not(feature = "parallel"))]
    let rows = col.chunks_mut(out_area);

    rows.enumerate().for_each(|(row, chunk)| {
        let kw = row % shape.kernel_w;
        let kh = (row / shape.kernel_w) % shape.kernel_h;
        let c = row / (shape.kernel_w * shape.kernel_h);
        populate_row(x, chunk, shape, c, kh, kw);
    });
}

/// One row of the patch matrix: the input window for kernel offset (kh, kw)
/// of channel c, shifted over every output position.
fn populate_row(x: &[f32], row: &mut [f32], shape: &PatchShape, c: usize, kh: usize, kw: usize) {
    let out_h = shape.out_h();
    let out_w = shape.out_w();

    row.fill(0.0);

    let h_min = shape.pad_h.saturating_sub(kh);
    let h_max = (shape.height + shape.pad_h).saturating_sub(kh).min(out_h);
    let w_min = shape.pad_w.saturating_sub(kw);
    let w_max = (shape.width + shape.pad_w).saturating_sub(kw).min(out_w);
    if w_min >= w_max {
        return;
    }

    for i in h_min..h_max {
        let in_y = i + kh - shape.pad_h;
        let src_base = (c * shape.height + in_y) * shape.width;
        let in_x = w_min + kw - shape.pad_w;
        let run = w_max - w_min;
        row[i * out_w + w_min..i * out_w + w_min + run]
            .copy_from_slice(&x[src_base + in_x..src_base + in_x + run]);
    }
}

/// Build the transposed patch matrix, `(outH*outW) x (channels*kH*kW)`.
///
/// Each row holds the flattened receptive field of one output position.
pub fn im2col_transposed(x: &[f32], col_t: &mut [f32], shape: &PatchShape) {
    let patch_len = shape.patch_len();
    debug_assert_eq!(col_t.len(), patch_len * shape.out_area());
    debug_assert!(x.len() >= shape.channels * shape.height * shape.width);

    let out_w = shape.out_w();

    #[cfg(feature = "parallel")]
    let rows = col_t.par_chunks_mut(patch_len);
    #[cfg(not(feature = "parallel"))]
    let rows = col_t.chunks_mut(patch_len);

    rows.enumerate().for_each(|(pos, chunk)| {
        let i = pos / out_w;
        let j = pos % out_w;
        chunk.fill(0.0);

        let kw_min = shape.pad_w.saturating_sub(j);
        let kw_max = (shape.width + shape.pad_w)
            .saturating_sub(j)
            .min(shape.kernel_w);
        if kw_min >= kw_max {
            return;
        }

        for c in 0..shape.channels {
            for kh in 0..shape.kernel_h {
                let in_y = i + kh;
                if in_y < shape.pad_h || in_y >= shape.height + shape.pad_h {
                    continue;
                }
                let src_base = (c * shape.height + (in_y - shape.pad_h)) * shape.width;
                let in_x = j + kw_min - shape.pad_w;
                let dst_base = (c * shape.kernel_h + kh) * shape.kernel_w;
                let run = kw_max - kw_min;
                chunk[dst_base + kw_min..dst_base + kw_min + run]
                    .copy_from_slice(&x[src_base + in_x..src_base + in_x + run]);
            }
        }
    });
}

/// Scatter-add the patch matrix back into tensor space: the inverse of
/// [`im2col`]. Every column element maps to exactly one
/// (channel, kernel-offset, output-position) triple and is accumulated at
/// the input position the forward transform read it from; positions that
/// fell inside the padding are skipped.
///
/// `x_grad` is accumulated into, never overwritten.
pub fn col2im(col: &[f32], x_grad: &mut [f32], shape: &PatchShape) {
    let out_h = shape.out_h();
    let out_w = shape.out_w();
    let out_area = out_h * out_w;
    let plane = shape.height * shape.width;
    debug_assert_eq!(col.len(), shape.patch_len() * out_area);
    debug_assert!(x_grad.len() >= shape.channels * plane);

    // One worker per channel; each channel's destination plane is disjoint.
    #[cfg(feature = "parallel")]
    let planes = x_grad.par_chunks_mut(plane);
    #[cfg(not(feature = "parallel"))]
    let planes = x_grad.chunks_mut(plane);

    planes.enumerate().for_each(|(c, dst)| {
        for kh in 0..shape.kernel_h {
            for kw in 0..shape.kernel_w {
                let row = (c * shape.kernel_h + kh) * shape.kernel_w + kw;
                let src = &col[row * out_area..(row + 1) * out_area];

                let h_min = shape.pad_h.saturating_sub(kh);
                let h_max = (shape.height + shape.pad_h).saturating_sub(kh).min(out_h);
                let w_min = shape.pad_w.saturating_sub(kw);
                let w_max = (shape.width + shape.pad_w).saturating_sub(kw).min(out_w);

                for i in h_min..h_max {
                    let in_y = i + kh - shape.pad_h;
                    for j in w_min..w_max {
                        let in_x = j + kw - shape.pad_w;
                        dst[in_y * shape.width + in_x] += src[i * out_w + j];
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(
        channels: usize,
        height: usize,
        width: usize,
        kernel: usize,
        pad: usize,
    ) -> PatchShape {
        PatchShape {
            channels,
            height,
            width,
            kernel_h: kernel,
            kernel_w: kernel,
            pad_h: pad,
            pad_w: pad,
        }
    }

    #[test]
    fn test_im2col_no_padding() {
        // 3x3 input, 2x2 kernel -> 4 patch rows x 4 output positions
        let x: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let s = shape(1, 3, 3, 2, 0);
        let mut col = vec![0.0; s.patch_len() * s.out_area()];
        im2col(&x, &mut col, &s);

        // Row r holds kernel offset (kh, kw) over the 2x2 output grid
        assert_eq!(&col[0..4], &[1.0, 2.0, 4.0, 5.0]); // (0,0)
        assert_eq!(&col[4..8], &[2.0, 3.0, 5.0, 6.0]); // (0,1)
        assert_eq!(&col[8..12], &[4.0, 5.0, 7.0, 8.0]); // (1,0)
        assert_eq!(&col[12..16], &[5.0, 6.0, 8.0, 9.0]); // (1,1)
    }

    #[test]
    fn test_im2col_padding_reads_zero() {
        // 2x2 input, 3x3 kernel, pad 1 -> 2x2 output; scratch pre-filled
        // with a sentinel to prove padding positions are zeroed, not skipped
        let x = [1.0, 2.0, 3.0, 4.0];
        let s = shape(1, 2, 2, 3, 1);
        let mut col = vec![77.0; s.patch_len() * s.out_area()];
        im2col(&x, &mut col, &s);

        // Kernel offset (0,0): only output position (1,1) lands in bounds
        assert_eq!(&col[0..4], &[0.0, 0.0, 0.0, 1.0]);
        // Center offset (1,1) sees the whole input
        let center = 4 * s.out_area();
        assert_eq!(&col[center..center + 4], &[1.0, 2.0, 3.0, 4.0]);
        // Offset (2,2): only output position (0,0) lands in bounds
        let last = 8 * s.out_area();
        assert_eq!(&col[last..last + 4], &[4.0, 0.0, 0.0, 0.0]);
        assert!(col.iter().all(|v| *v != 77.0));
    }

    #[test]
    fn test_transposed_matches_im2col() {
        let s = shape(2, 4, 5, 3, 1);
        let x: Vec<f32> = (0..2 * 4 * 5).map(|v| v as f32 * 0.5 - 3.0).collect();

        let mut col = vec![0.0; s.patch_len() * s.out_area()];
        let mut col_t = vec![0.0; s.patch_len() * s.out_area()];
        im2col(&x, &mut col, &s);
        im2col_transposed(&x, &mut col_t, &s);

        let (rows, cols) = (s.patch_len(), s.out_area());
        for r in 0..rows {
            for p in 0..cols {
                assert_eq!(col[r * cols + p], col_t[p * rows + r], "({r},{p})");
            }
        }
    }

    #[test]
    fn test_col2im_overlap_counts() {
        // All-ones patch matrix scattered back: each input position receives
        // one contribution per (window, kernel-offset) pair that maps onto
        // it, i.e. its window-overlap count.
        let s = shape(1, 4, 4, 3, 0);
        let col = vec![1.0; s.patch_len() * s.out_area()];
        let mut grad = vec![0.0; 16];
        col2im(&col, &mut grad, &s);

        let mut reference = [0.0f32; 16];
        for i in 0..2 {
            for j in 0..2 {
                for kh in 0..3 {
                    for kw in 0..3 {
                        reference[(i + kh) * 4 + (j + kw)] += 1.0;
                    }
                }
            }
        }
        assert_eq!(grad, reference);
    }

    #[test]
    fn test_col2im_accumulates() {
        let s = shape(1, 3, 3, 2, 0);
        let col = vec![1.0; s.patch_len() * s.out_area()];
        let mut grad = vec![0.0; 9];
        col2im(&col, &mut grad, &s);
        let first = grad.clone();
        col2im(&col, &mut grad, &s);
        for (a, b) in grad.iter().zip(first.iter()) {
            assert_eq!(*a, 2.0 * b);
        }
    }
}
