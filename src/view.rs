//! Shape and view vocabulary shared by every kernel
//!
//! All kernels operate on caller-owned flat `f32` buffers. The types here
//! describe how a logical multi-dimensional array maps onto such a buffer:
//! an offset plus per-axis element strides for matmul operands, and dense
//! `batch x channels x height x width` descriptors for the spatial kernels.

use crate::error::{KernelError, Result};

/// View of a 2D operand over a flat buffer: `offset + i*row_stride + j*col_stride`.
///
/// The same matmul kernel serves row-major, column-major and sub-view slices
/// through this description, with no copying.
///
/// # Example
///
/// ```
/// use centella::MatView;
///
/// // A 3x4 row-major matrix embedded at offset 2 of a larger buffer
/// let v = MatView { offset: 2, row_stride: 4, col_stride: 1 };
/// assert_eq!(v.index(1, 2), 2 + 4 + 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatView {
    /// Element offset of the (0, 0) element in the flat buffer
    pub offset: usize,
    /// Elements to advance one logical row
    pub row_stride: usize,
    /// Elements to advance one logical column
    pub col_stride: usize,
}

impl MatView {
    /// Dense row-major view at offset zero with the given leading stride
    pub fn contiguous(row_stride: usize) -> Self {
        MatView {
            offset: 0,
            row_stride,
            col_stride: 1,
        }
    }

    /// Flat index of logical element (i, j)
    #[inline]
    pub fn index(&self, i: usize, j: usize) -> usize {
        self.offset + i * self.row_stride + j * self.col_stride
    }

    /// True when the trailing axis is unit-stride and there is no outer
    /// offset; all three operands passing this check puts the matmul on its
    /// contiguous fast path.
    #[inline]
    pub fn is_unit(&self) -> bool {
        self.offset == 0 && self.col_stride == 1
    }

    /// Highest flat index addressed by a `rows x cols` operand through this
    /// view. Used for boundary validation only.
    pub(crate) fn max_index(&self, rows: usize, cols: usize) -> usize {
        self.index(rows - 1, cols - 1)
    }

    pub(crate) fn validate(&self, rows: usize, cols: usize, buf_len: usize) -> Result<()> {
        if rows == 0 || cols == 0 {
            return Err(KernelError::InvalidShape(format!(
                "matmul operand has zero dimension ({rows}x{cols})"
            )));
        }
        let needed = self.max_index(rows, cols) + 1;
        if buf_len < needed {
            return Err(KernelError::SizeMismatch {
                expected: needed,
                actual: buf_len,
            });
        }
        Ok(())
    }
}

/// Dimensions of a `C += A*B` call: A is MxK, B is KxN, C is MxN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

/// Shape of a 2D convolution: activations, weights and symmetric padding.
///
/// Output spatial size is `input + 2*pad - kernel + 1` along each axis; the
/// shape is valid only when that is at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    /// Batch count
    pub batch: usize,
    /// Input channel count
    pub channels: usize,
    /// Input height
    pub height: usize,
    /// Input width
    pub width: usize,
    /// Filter count (output channels)
    pub filters: usize,
    /// Kernel height
    pub kernel_h: usize,
    /// Kernel width
    pub kernel_w: usize,
    /// Symmetric padding along the height axis
    pub pad_h: usize,
    /// Symmetric padding along the width axis
    pub pad_w: usize,
}

impl ConvShape {
    /// Output height: `H + 2*pad_h - kernel_h + 1`
    #[inline]
    pub fn out_h(&self) -> usize {
        debug_assert!(self.kernel_h <= self.height + 2 * self.pad_h);
        self.height + 2 * self.pad_h + 1 - self.kernel_h
    }

    /// Output width: `W + 2*pad_w - kernel_w + 1`
    #[inline]
    pub fn out_w(&self) -> usize {
        debug_assert!(self.kernel_w <= self.width + 2 * self.pad_w);
        self.width + 2 * self.pad_w + 1 - self.kernel_w
    }

    /// Elements in one input plane
    #[inline]
    pub fn input_area(&self) -> usize {
        self.height * self.width
    }

    /// Elements in one kernel plane
    #[inline]
    pub fn kernel_area(&self) -> usize {
        self.kernel_h * self.kernel_w
    }

    /// Elements in one output plane
    #[inline]
    pub fn output_area(&self) -> usize {
        self.out_h() * self.out_w()
    }

    /// Required input buffer length
    pub fn input_len(&self) -> usize {
        self.batch * self.channels * self.input_area()
    }

    /// Required weight buffer length
    pub fn weights_len(&self) -> usize {
        self.filters * self.channels * self.kernel_area()
    }

    /// Required output buffer length
    pub fn output_len(&self) -> usize {
        self.batch * self.filters * self.output_area()
    }

    /// Per-batch-element patch-transform shape
    pub fn patch_shape(&self) -> PatchShape {
        PatchShape {
            channels: self.channels,
            height: self.height,
            width: self.width,
            kernel_h: self.kernel_h,
            kernel_w: self.kernel_w,
            pad_h: self.pad_h,
            pad_w: self.pad_w,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch == 0
            || self.channels == 0
            || self.height == 0
            || self.width == 0
            || self.filters == 0
            || self.kernel_h == 0
            || self.kernel_w == 0
        {
            return Err(KernelError::InvalidShape(format!(
                "conv2d shape has a zero dimension: {self:?}"
            )));
        }
        if self.kernel_h > self.height + 2 * self.pad_h
            || self.kernel_w > self.width + 2 * self.pad_w
        {
            return Err(KernelError::InvalidShape(format!(
                "kernel {}x{} larger than padded input {}x{}",
                self.kernel_h,
                self.kernel_w,
                self.height + 2 * self.pad_h,
                self.width + 2 * self.pad_w
            )));
        }
        Ok(())
    }
}

/// Shape of a single-tensor patch transform (one batch element)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
}

impl PatchShape {
    #[inline]
    pub fn out_h(&self) -> usize {
        self.height + 2 * self.pad_h + 1 - self.kernel_h
    }

    #[inline]
    pub fn out_w(&self) -> usize {
        self.width + 2 * self.pad_w + 1 - self.kernel_w
    }

    /// Rows of the patch matrix: `channels * kernel_h * kernel_w`
    #[inline]
    pub fn patch_len(&self) -> usize {
        self.channels * self.kernel_h * self.kernel_w
    }

    /// Columns of the patch matrix: `out_h * out_w`
    #[inline]
    pub fn out_area(&self) -> usize {
        self.out_h() * self.out_w()
    }
}

/// Shape of a 2D max-pooling pass: window and stride are independent per
/// axis, there is no padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShape {
    /// Batch count
    pub batch: usize,
    /// Channel count
    pub channels: usize,
    /// Input height
    pub height: usize,
    /// Input width
    pub width: usize,
    /// Pooling window height
    pub pool_h: usize,
    /// Pooling window width
    pub pool_w: usize,
    /// Vertical stride
    pub stride_h: usize,
    /// Horizontal stride
    pub stride_w: usize,
}

impl PoolShape {
    /// Output height: `(H - pool_h) / stride_h + 1`
    #[inline]
    pub fn out_h(&self) -> usize {
        debug_assert!(self.pool_h <= self.height);
        (self.height - self.pool_h) / self.stride_h + 1
    }

    /// Output width: `(W - pool_w) / stride_w + 1`
    #[inline]
    pub fn out_w(&self) -> usize {
        debug_assert!(self.pool_w <= self.width);
        (self.width - self.pool_w) / self.stride_w + 1
    }

    #[inline]
    pub fn input_area(&self) -> usize {
        self.height * self.width
    }

    #[inline]
    pub fn output_area(&self) -> usize {
        self.out_h() * self.out_w()
    }

    /// Required input buffer length
    pub fn input_len(&self) -> usize {
        self.batch * self.channels * self.input_area()
    }

    /// Required output buffer length
    pub fn output_len(&self) -> usize {
        self.batch * self.channels * self.output_area()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch == 0
            || self.channels == 0
            || self.height == 0
            || self.width == 0
            || self.pool_h == 0
            || self.pool_w == 0
            || self.stride_h == 0
            || self.stride_w == 0
        {
            return Err(KernelError::InvalidShape(format!(
                "maxpool shape has a zero dimension: {self:?}"
            )));
        }
        if self.pool_h > self.height || self.pool_w > self.width {
            return Err(KernelError::InvalidShape(format!(
                "pool window {}x{} larger than input {}x{}",
                self.pool_h, self.pool_w, self.height, self.width
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mat_view_index() {
        // Row-major 3x4
        let v = MatView::contiguous(4);
        assert_eq!(v.index(0, 0), 0);
        assert_eq!(v.index(2, 3), 11);
        assert!(v.is_unit());

        // Column-major 3x4 over a 3x4 buffer
        let t = MatView {
            offset: 0,
            row_stride: 1,
            col_stride: 3,
        };
        assert_eq!(t.index(2, 3), 11);
        assert!(!t.is_unit());

        // Sub-view with offset leaves the fast path
        let s = MatView {
            offset: 5,
            row_stride: 8,
            col_stride: 1,
        };
        assert!(!s.is_unit());
    }

    #[test]
    fn test_mat_view_validate() {
        let v = MatView::contiguous(4);
        assert!(v.validate(3, 4, 12).is_ok());
        assert_eq!(
            v.validate(3, 4, 11),
            Err(KernelError::SizeMismatch {
                expected: 12,
                actual: 11
            })
        );
        assert!(v.validate(0, 4, 12).is_err());
    }

    #[test]
    fn test_conv_shape_output_dims() {
        let shape = ConvShape {
            batch: 2,
            channels: 3,
            height: 8,
            width: 10,
            filters: 4,
            kernel_h: 3,
            kernel_w: 3,
            pad_h: 1,
            pad_w: 0,
        };
        assert_eq!(shape.out_h(), 8); // 8 + 2 - 3 + 1
        assert_eq!(shape.out_w(), 8); // 10 + 0 - 3 + 1
        assert_eq!(shape.input_len(), 2 * 3 * 80);
        assert_eq!(shape.weights_len(), 4 * 3 * 9);
        assert_eq!(shape.output_len(), 2 * 4 * 64);
        assert!(shape.validate().is_ok());
    }

    #[test]
    fn test_conv_shape_kernel_too_large() {
        let shape = ConvShape {
            batch: 1,
            channels: 1,
            height: 2,
            width: 2,
            filters: 1,
            kernel_h: 5,
            kernel_w: 2,
            pad_h: 1,
            pad_w: 0,
        };
        // padded height is 4, kernel height 5
        assert!(shape.validate().is_err());
    }

    #[test]
    fn test_patch_shape_dims() {
        let p = PatchShape {
            channels: 3,
            height: 5,
            width: 5,
            kernel_h: 3,
            kernel_w: 3,
            pad_h: 1,
            pad_w: 1,
        };
        assert_eq!(p.out_h(), 5);
        assert_eq!(p.out_w(), 5);
        assert_eq!(p.patch_len(), 27);
        assert_eq!(p.out_area(), 25);
    }

    #[test]
    fn test_pool_shape_dims() {
        let shape = PoolShape {
            batch: 1,
            channels: 2,
            height: 6,
            width: 7,
            pool_h: 2,
            pool_w: 3,
            stride_h: 2,
            stride_w: 2,
        };
        assert_eq!(shape.out_h(), 3); // (6-2)/2 + 1
        assert_eq!(shape.out_w(), 3); // (7-3)/2 + 1
        assert!(shape.validate().is_ok());

        let bad = PoolShape {
            pool_h: 8,
            ..shape
        };
        assert!(bad.validate().is_err());
    }
}
