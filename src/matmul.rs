//! Cache-tiled dense matrix multiplication
//!
//! Computes `C += A*B` over flat buffers described by [`MatView`]s. Two code
//! paths share one tiling structure: a fast path for operands that are
//! unit-stride on their trailing axis with no outer offset, and a generic
//! path that addresses every element through its full stride expression.
//!
//! The (row-block x column-block) tile grid is distributed across worker
//! threads; each tile owns a disjoint destination region, so the kernel
//! needs no locks. Accumulation order is deterministic for a fixed
//! partitioning but is not guaranteed bit-identical across different
//! thread-pool sizes.

use crate::view::{MatMulDims, MatView};

// Tile sizes, matched to L1/L2 working sets: a 32x64 A-panel plus a 64x64
// B-panel in f32 stays under 32 KiB.
const ROW_BLOCK: usize = 32;
const K_BLOCK: usize = 64;
const COL_BLOCK: usize = 64;

/// Destination pointer shared across tile workers.
///
/// Tiles partition the (row, column) index space of C, so no two workers
/// write the same element; the pointer exists only to let disjoint tiles
/// run in parallel without splitting a strided destination into borrows.
struct DstPtr(*mut f32);

unsafe impl Send for DstPtr {}
unsafe impl Sync for DstPtr {}

/// `C += A*B` with validated inputs. Callers go through
/// [`CpuEngine::matmul`](crate::CpuEngine::matmul), which checks every view
/// against its buffer before landing here.
pub(crate) fn gemm(
    a: &[f32],
    av: MatView,
    b: &[f32],
    bv: MatView,
    c: &mut [f32],
    cv: MatView,
    dims: MatMulDims,
) {
    debug_assert!(av.max_index(dims.m, dims.k) < a.len());
    debug_assert!(bv.max_index(dims.k, dims.n) < b.len());
    debug_assert!(cv.max_index(dims.m, dims.n) < c.len());

    let fastpath = av.is_unit() && bv.is_unit() && cv.is_unit();
    let dst = DstPtr(c.as_mut_ptr());

    let row_blocks = dims.m.div_ceil(ROW_BLOCK);
    let col_blocks = dims.n.div_ceil(COL_BLOCK);

    let run_tile = |tile: usize| {
        let ii = (tile / col_blocks) * ROW_BLOCK;
        let jj = (tile % col_blocks) * COL_BLOCK;
        if fastpath {
            fast_tile(a, av.row_stride, b, bv.row_stride, &dst, cv.row_stride, dims, ii, jj);
        } else {
            generic_tile(a, av, b, bv, &dst, cv, dims, ii, jj);
        }
    };

    // SAFETY: tile (ii, jj) writes only C elements with row in [ii, ii+ROW_BLOCK)
    // and column in [jj, jj+COL_BLOCK); tiles partition that index space, and
    // the destination view maps distinct (row, column) pairs to distinct flat
    // indices (a caller precondition). All workers finish before gemm returns.
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        (0..row_blocks * col_blocks).into_par_iter().for_each(run_tile);
    }
    #[cfg(not(feature = "parallel"))]
    {
        (0..row_blocks * col_blocks).for_each(run_tile);
    }
}

/// One tile of the contiguous fast path. A local accumulator strip keeps the
/// partial sums in registers/L1 and is added into C exactly once per
/// (row, k-block) pass.
#[allow(clippy::too_many_arguments)]
fn fast_tile(
    a: &[f32],
    a_rs: usize,
    b: &[f32],
    b_rs: usize,
    dst: &DstPtr,
    c_rs: usize,
    dims: MatMulDims,
    ii: usize,
    jj: usize,
) {
    let i_max = (ii + ROW_BLOCK).min(dims.m);
    let j_max = (jj + COL_BLOCK).min(dims.n);
    let width = j_max - jj;

    for kk in (0..dims.k).step_by(K_BLOCK) {
        let k_max = (kk + K_BLOCK).min(dims.k);

        for i in ii..i_max {
            let base_a = i * a_rs;
            let base_c = i * c_rs;
            let mut acc = [0.0f32; COL_BLOCK];

            for kx in kk..k_max {
                let val_a = a[base_a + kx];
                let base_b = kx * b_rs + jj;
                let b_row = &b[base_b..base_b + width];
                for (t, &bv) in b_row.iter().enumerate() {
                    acc[t] += val_a * bv;
                }
            }

            // single read-modify-write of the destination strip
            for (t, &av) in acc[..width].iter().enumerate() {
                unsafe { *dst.0.add(base_c + jj + t) += av };
            }
        }
    }
}

/// One tile of the generic strided path: same blocking, full stride
/// expressions for every element.
#[allow(clippy::too_many_arguments)]
fn generic_tile(
    a: &[f32],
    av: MatView,
    b: &[f32],
    bv: MatView,
    dst: &DstPtr,
    cv: MatView,
    dims: MatMulDims,
    ii: usize,
    jj: usize,
) {
    let i_max = (ii + ROW_BLOCK).min(dims.m);
    let j_max = (jj + COL_BLOCK).min(dims.n);
    let width = j_max - jj;

    for kk in (0..dims.k).step_by(K_BLOCK) {
        let k_max = (kk + K_BLOCK).min(dims.k);

        for i in ii..i_max {
            let base_a = av.offset + i * av.row_stride;
            let base_c = cv.offset + i * cv.row_stride;
            let mut acc = [0.0f32; COL_BLOCK];

            for kx in kk..k_max {
                let val_a = a[base_a + kx * av.col_stride];
                let base_b = bv.offset + kx * bv.row_stride + jj * bv.col_stride;
                for (t, slot) in acc[..width].iter_mut().enumerate() {
                    *slot += val_a * b[base_b + t * bv.col_stride];
                }
            }

            for (t, &av_acc) in acc[..width].iter().enumerate() {
                unsafe { *dst.0.add(base_c + (jj + t) * cv.col_stride) += av_acc };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference triple loop: `C += A*B` through arbitrary views
    fn naive_gemm(
        a: &[f32],
        av: MatView,
        b: &[f32],
        bv: MatView,
        c: &mut [f32],
        cv: MatView,
        dims: MatMulDims,
    ) {
        for i in 0..dims.m {
            for j in 0..dims.n {
                let mut sum = 0.0;
                for kx in 0..dims.k {
                    sum += a[av.index(i, kx)] * b[bv.index(kx, j)];
                }
                c[cv.index(i, j)] += sum;
            }
        }
    }

    /// Deterministic pseudo-random fill
    fn fill(buf: &mut [f32], mut seed: u32) {
        for v in buf.iter_mut() {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            *v = ((seed >> 8) as f32 / (1 << 24) as f32) * 2.0 - 1.0;
        }
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!(
                (x - y).abs() <= tol * (1.0 + y.abs()),
                "mismatch at {i}: {x} vs {y}"
            );
        }
    }

    #[test]
    fn test_fast_path_small() {
        // [2x3] @ [3x2], exact values
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut c = [0.0; 4];
        let dims = MatMulDims { m: 2, k: 3, n: 2 };
        gemm(
            &a,
            MatView::contiguous(3),
            &b,
            MatView::contiguous(2),
            &mut c,
            MatView::contiguous(2),
            dims,
        );
        assert_eq!(c, [22.0, 28.0, 49.0, 64.0]);
    }

    #[test]
    fn test_fast_path_matches_naive_across_tile_boundaries() {
        // Dimensions straddle the 32/64/64 tile sizes
        for (m, k, n) in [(33, 65, 70), (64, 64, 64), (7, 130, 5), (100, 3, 100)] {
            let dims = MatMulDims { m, k, n };
            let mut a = vec![0.0; m * k];
            let mut b = vec![0.0; k * n];
            fill(&mut a, 1);
            fill(&mut b, 2);

            let mut c = vec![0.0; m * n];
            let mut expected = vec![0.0; m * n];
            gemm(
                &a,
                MatView::contiguous(k),
                &b,
                MatView::contiguous(n),
                &mut c,
                MatView::contiguous(n),
                dims,
            );
            naive_gemm(
                &a,
                MatView::contiguous(k),
                &b,
                MatView::contiguous(n),
                &mut expected,
                MatView::contiguous(n),
                dims,
            );
            assert_close(&c, &expected, 1e-4);
        }
    }

    #[test]
    fn test_generic_path_transposed_b() {
        // B stored column-major: logical (k x n) over an (n x k) buffer
        let (m, k, n) = (20, 35, 17);
        let dims = MatMulDims { m, k, n };
        let mut a = vec![0.0; m * k];
        let mut b = vec![0.0; k * n];
        fill(&mut a, 3);
        fill(&mut b, 4);

        let bt = MatView {
            offset: 0,
            row_stride: 1,
            col_stride: k,
        };
        let mut c = vec![0.0; m * n];
        let mut expected = vec![0.0; m * n];
        gemm(
            &a,
            MatView::contiguous(k),
            &b,
            bt,
            &mut c,
            MatView::contiguous(n),
            dims,
        );
        naive_gemm(
            &a,
            MatView::contiguous(k),
            &b,
            bt,
            &mut expected,
            MatView::contiguous(n),
            dims,
        );
        assert_close(&c, &expected, 1e-4);
    }

    #[test]
    fn test_generic_path_offset_subview() {
        // Operate on the lower-right 3x3 of a 5x5 buffer, write into the
        // upper-left 3x3 of a 4x4 destination
        let dims = MatMulDims { m: 3, k: 3, n: 3 };
        let mut a = vec![0.0; 25];
        let mut b = vec![0.0; 9];
        fill(&mut a, 5);
        fill(&mut b, 6);

        let av = MatView {
            offset: 2 * 5 + 2,
            row_stride: 5,
            col_stride: 1,
        };
        let cv = MatView {
            offset: 0,
            row_stride: 4,
            col_stride: 1,
        };
        let mut c = vec![0.0; 16];
        let mut expected = vec![0.0; 16];
        gemm(&a, av, &b, MatView::contiguous(3), &mut c, cv, dims);
        naive_gemm(&a, av, &b, MatView::contiguous(3), &mut expected, cv, dims);
        assert_close(&c, &expected, 1e-5);
        // Untouched destination elements stay zero
        assert_eq!(c[3], 0.0);
        assert_eq!(c[15], 0.0);
    }

    #[test]
    fn test_fast_and_generic_agree_on_same_operands() {
        // Same logical operands, generic path forced via a one-element
        // leading pad on A
        let (m, k, n) = (40, 50, 60);
        let dims = MatMulDims { m, k, n };
        let mut a = vec![0.0; m * k];
        let mut b = vec![0.0; k * n];
        fill(&mut a, 7);
        fill(&mut b, 8);

        let mut fast = vec![0.0; m * n];
        gemm(
            &a,
            MatView::contiguous(k),
            &b,
            MatView::contiguous(n),
            &mut fast,
            MatView::contiguous(n),
            dims,
        );

        let mut padded_a = vec![0.0; m * k + 1];
        padded_a[1..].copy_from_slice(&a);
        let av = MatView {
            offset: 1,
            row_stride: k,
            col_stride: 1,
        };
        let mut generic = vec![0.0; m * n];
        gemm(
            &padded_a,
            av,
            &b,
            MatView::contiguous(n),
            &mut generic,
            MatView::contiguous(n),
            dims,
        );
        assert_close(&fast, &generic, 1e-5);
    }

    #[test]
    fn test_accumulates_into_destination() {
        let a = [1.0, 1.0, 1.0, 1.0];
        let b = [2.0, 0.0, 0.0, 2.0];
        let dims = MatMulDims { m: 2, k: 2, n: 2 };
        let mut c = [0.0; 4];
        for _ in 0..2 {
            gemm(
                &a,
                MatView::contiguous(2),
                &b,
                MatView::contiguous(2),
                &mut c,
                MatView::contiguous(2),
                dims,
            );
        }
        // Two passes without zeroing double the result
        assert_eq!(c, [4.0, 4.0, 4.0, 4.0]);
    }
}
