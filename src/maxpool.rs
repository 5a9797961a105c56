//! 2D max-pooling, forward and backward
//!
//! Forward writes the window maximum for every output position; ties are
//! resolved by strictly-greater replacement, so the first maximum in
//! row-major scan order wins. No index mask is retained: backward re-scans
//! the same window over the forward input to recover the argmax (same scan
//! order, same tie rule) and scatter-adds the upstream gradient at that
//! single position. Overlapping windows accumulate via `+=`.
//!
//! Both passes parallelize over independent (batch, channel) planes.

use crate::view::PoolShape;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Windowed-max forward reduction. Validated entry points live on
/// [`CpuEngine`](crate::CpuEngine).
pub(crate) fn forward(x: &[f32], y: &mut [f32], shape: &PoolShape) {
    let (out_h, out_w) = (shape.out_h(), shape.out_w());
    let out_area = out_h * out_w;
    let area_x = shape.input_area();

    #[cfg(feature = "parallel")]
    let planes = y.par_chunks_mut(out_area);
    #[cfg(not(feature = "parallel"))]
    let planes = y.chunks_mut(out_area);

    planes.enumerate().for_each(|(bc, dst)| {
        let xc = &x[bc * area_x..][..area_x];

        for i in 0..out_h {
            let base_y = i * shape.stride_h;
            for j in 0..out_w {
                let base_x = j * shape.stride_w;

                let mut max = f32::NEG_INFINITY;
                for ph in 0..shape.pool_h {
                    let row = &xc[(base_y + ph) * shape.width + base_x..][..shape.pool_w];
                    for &v in row {
                        if v > max {
                            max = v;
                        }
                    }
                }
                dst[i * out_w + j] = max;
            }
        }
    });
}

/// Argmax-rediscovery backward scatter. For every output position the
/// forward window is re-scanned over `x`; the upstream gradient is
/// accumulated at the first-encountered maximum.
///
/// `ge` is accumulated into, never overwritten.
pub(crate) fn backward(x: &[f32], gs: &[f32], ge: &mut [f32], shape: &PoolShape) {
    let (out_h, out_w) = (shape.out_h(), shape.out_w());
    let out_area = out_h * out_w;
    let area_x = shape.input_area();

    #[cfg(feature = "parallel")]
    let planes = ge.par_chunks_mut(area_x);
    #[cfg(not(feature = "parallel"))]
    let planes = ge.chunks_mut(area_x);

    planes.enumerate().for_each(|(bc, dst)| {
        let xc = &x[bc * area_x..][..area_x];
        let gs_base = bc * out_area;

        for i in 0..out_h {
            let row_start = i * shape.stride_h;
            let row_end = (row_start + shape.pool_h).min(shape.height);

            for j in 0..out_w {
                let col_start = j * shape.stride_w;
                let col_end = (col_start + shape.pool_w).min(shape.width);

                let mut max = f32::NEG_INFINITY;
                let mut row_max = row_start;
                let mut col_max = col_start;
                for y in row_start..row_end {
                    let row = y * shape.width;
                    for xp in col_start..col_end {
                        let v = xc[row + xp];
                        if v > max {
                            max = v;
                            row_max = y;
                            col_max = xp;
                        }
                    }
                }

                dst[row_max * shape.width + col_max] += gs[gs_base + i * out_w + j];
            }
        }
    });
}
