//! 全片图像 (whole-slide image) 的读取抽象.
//!
//! 专有切片格式 (金字塔 TIFF 等) 的解码不在本 crate 职责内,
//! 统一通过 [`Slide`] trait 接入: 流水线只需要 "读一个矩形区域"
//! 和 "读一张降采样缩略图" 两种访问方式, 从不要求整幅图像驻留内存.
//!
//! [`MemorySlide`] 是该 trait 的内存实现, 供测试与中小图像使用.

use crate::error::ConfigError;
use crate::geom::FullResRect;
use crate::{morph, Idx2d};
use ndarray::{s, Array2, Array3, Axis};

/// 像素的物理尺寸 (米/像素).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PixelSize {
    /// 横向 (列方向) 分辨率.
    pub x_m: f64,

    /// 纵向 (行方向) 分辨率.
    pub y_m: f64,
}

impl PixelSize {
    /// 构造并校验: 两个分量都必须是正有限数.
    pub fn new(x_m: f64, y_m: f64) -> Result<Self, ConfigError> {
        if !(x_m.is_finite() && y_m.is_finite() && x_m > 0.0 && y_m > 0.0) {
            return Err(ConfigError::BadPixelSize { x_m, y_m });
        }
        Ok(Self { x_m, y_m })
    }

    /// 单个像素的物理面积 (平方微米).
    #[inline]
    pub fn pixel_area_um2(&self) -> f64 {
        (self.x_m * 1e6) * (self.y_m * 1e6)
    }
}

/// 全片图像的只读访问接口.
///
/// 实现约定:
///
/// 1. 所有返回的像素都是 8-bit RGB (区域读取) 或 8-bit 灰度 (缩略图);
/// 2. `read_region` 的矩形保证落在 [`Self::shape`] 以内, 实现无需再检查;
/// 3. 同一矩形的多次读取必须返回相同数据 (确定性).
pub trait Slide {
    /// 全分辨率图像的形状 (高, 宽).
    fn shape(&self) -> Idx2d;

    /// 像素物理尺寸.
    fn pixel_size(&self) -> PixelSize;

    /// 读取一个全分辨率矩形区域, 返回 `(高, 宽, 3)` 的 RGB 数组.
    fn read_region(&self, rect: &FullResRect) -> Array3<u8>;

    /// 读取按 `factor` 降采样的灰度缩略图.
    ///
    /// 缩略图形状为 `(ceil(H / factor), ceil(W / factor))`.
    /// 要求 `factor >= 1.0`.
    fn thumbnail(&self, factor: f64) -> Array2<u8>;
}

/// 整幅驻留内存的 [`Slide`] 实现.
#[derive(Clone, Debug)]
pub struct MemorySlide {
    data: Array3<u8>,
    pixel_size: PixelSize,
}

impl MemorySlide {
    /// 从 `(高, 宽, 3)` 的 RGB 数组构造. 要求第三维为 3 且图像非空,
    /// 否则 panic.
    pub fn new(data: Array3<u8>, pixel_size: PixelSize) -> Self {
        let (h, w, c) = data.dim();
        assert!(h > 0 && w > 0, "不允许空图像");
        assert_eq!(c, 3, "只接受 RGB 图像");
        Self { data, pixel_size }
    }

    /// 灰度化 (ITU-R BT.601 加权), 用于缩略图.
    fn to_luma(&self) -> Array2<u8> {
        self.data.map_axis(Axis(2), |rgb| {
            let (r, g, b) = (rgb[0] as f32, rgb[1] as f32, rgb[2] as f32);
            (0.299 * r + 0.587 * g + 0.114 * b).round() as u8
        })
    }
}

impl Slide for MemorySlide {
    fn shape(&self) -> Idx2d {
        let (h, w, _) = self.data.dim();
        (h, w)
    }

    fn pixel_size(&self) -> PixelSize {
        self.pixel_size
    }

    fn read_region(&self, rect: &FullResRect) -> Array3<u8> {
        self.data
            .slice(s![
                rect.first_row..rect.last_row,
                rect.first_col..rect.last_col,
                ..
            ])
            .to_owned()
    }

    fn thumbnail(&self, factor: f64) -> Array2<u8> {
        assert!(factor >= 1.0);
        let (h, w) = self.shape();
        let oh = (h as f64 / factor).ceil() as usize;
        let ow = (w as f64 / factor).ceil() as usize;
        morph::resize_nearest_u8(self.to_luma().view(), (oh, ow))
    }
}
