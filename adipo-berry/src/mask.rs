//! 粗组织掩膜 (coarse tissue mask).
//!
//! 掩膜是整个调度的唯一状态: 1 表示 "该低分辨率像素仍有组织待处理",
//! 0 表示 "背景或已处理". 调度器每处理一个 tile 就清零对应区域,
//! 非零像素数随之单调下降, 流水线以掩膜清空为终止条件.

use crate::consts::bin;
use crate::error::ConfigError;
use crate::geom::LoResRect;
use crate::{morph, Idx2d};
use ndarray::{s, Array2, ArrayView2};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// 粗组织掩膜的构建参数.
///
/// 默认值按 10 倍物镜、约 0.45 微米/像素的全片扫描标定.
#[derive(Clone, Debug, PartialEq)]
pub struct CoarseMaskParams {
    /// 全分辨率到掩膜网格的降采样因子. 必须是不小于 1 的有限数.
    pub downsample_factor: f64,

    /// 阈值化后的膨胀半径 (低分辨率像素), 用于弥合细小的组织裂隙.
    pub dilation_radius: usize,

    /// 连通区域的最小保留面积 (低分辨率像素). 更小的区域视为碎屑删除.
    pub min_component_size: usize,

    /// 填充的最大空洞面积 (低分辨率像素). 更大的空洞保留为背景.
    pub max_hole_size: usize,
}

impl Default for CoarseMaskParams {
    fn default() -> Self {
        Self {
            downsample_factor: 8.0,
            dilation_radius: 25,
            min_component_size: 15_625, // 对应全分辨率约 1e6 像素
            max_hole_size: 8_000,
        }
    }
}

impl CoarseMaskParams {
    /// 校验参数合法性.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.downsample_factor.is_finite() || self.downsample_factor < 1.0 {
            return Err(ConfigError::BadDownsampleFactor(self.downsample_factor));
        }
        Ok(())
    }
}

/// 从降采样缩略图构建粗组织掩膜.
///
/// 步骤: Otsu 阈值化 (组织比载玻片背景更暗, 暗类判为组织),
/// 圆盘膨胀, 删除小连通区域, 填充小空洞.
///
/// 要求缩略图非空, 否则 panic. 对全背景的缩略图仅产生一条警告日志,
/// 返回全零掩膜, 由上层据此走空流水线.
pub fn rough_foreground_mask(thumb: ArrayView2<u8>, params: &CoarseMaskParams) -> TissueMask {
    let (h, w) = thumb.dim();
    assert!(h > 0 && w > 0, "不允许空缩略图");

    // 没有灰度对比的缩略图 (空白载玻片) 不存在组织,
    // Otsu 在这种输入上无意义.
    let (lo, hi) = thumb
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &p| (lo.min(p), hi.max(p)));
    if lo == hi {
        log::warn!("缩略图无灰度对比, 粗组织掩膜为全背景, 全片将被跳过");
        return TissueMask {
            data: Array2::zeros((h, w)),
        };
    }

    let threshold = otsu_tissue_threshold(thumb);
    let mut data = thumb.mapv(|p| if p <= threshold { bin::ON } else { bin::OFF });

    data = morph::binary_dilate(data.view(), params.dilation_radius);
    morph::remove_small_components(&mut data, params.min_component_size);
    morph::fill_small_holes(&mut data, params.max_hole_size);

    if data.iter().all(|&p| !bin::is_on(p)) {
        log::warn!("粗组织掩膜为全背景, 全片将被跳过");
    }
    TissueMask { data }
}

/// 对缩略图计算 "组织 / 背景" 分界阈值 (`pix <= t` 判为组织).
#[inline]
fn otsu_tissue_threshold(thumb: ArrayView2<u8>) -> u8 {
    morph::otsu_threshold(thumb)
}

/// 粗组织掩膜. 低分辨率空间中的 0/1 图, 调度器的全部可变状态.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TissueMask {
    data: Array2<u8>,
}

impl TissueMask {
    /// 从现成的 0/1 数组构造掩膜. 要求数组只含 0/1 值, 否则 panic.
    pub fn from_raw(data: Array2<u8>) -> Self {
        assert!(data.iter().all(|&p| p == bin::OFF || p == bin::ON));
        Self { data }
    }

    /// 直接获得底层数据.
    #[inline]
    pub fn into_raw(self) -> Array2<u8> {
        self.data
    }

    /// 掩膜的形状 (高, 宽).
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.data.dim()
    }

    /// 底层数据的只读视图.
    #[inline]
    pub fn view(&self) -> ArrayView2<'_, u8> {
        self.data.view()
    }

    /// 掩膜中组织像素 (非零) 的个数.
    pub fn count_remaining(&self) -> usize {
        self.data.iter().filter(|&&p| bin::is_on(p)).count()
    }

    /// 指定位置是否仍是组织?
    #[inline]
    pub fn is_tissue(&self, pos: Idx2d) -> bool {
        bin::is_on(self.data[pos])
    }

    /// 获得矩形区域的只读视图. 要求矩形落在掩膜内, 否则 panic.
    pub fn region(&self, rect: &LoResRect) -> ArrayView2<'_, u8> {
        self.data
            .slice(s![rect.first_row..rect.last_row, rect.first_col..rect.last_col])
    }

    /// 将单个像素写为 `value` (0 或 1).
    #[inline]
    pub fn set(&mut self, pos: Idx2d, value: u8) {
        assert!(value == bin::OFF || value == bin::ON);
        self.data[pos] = value;
    }

    /// 将矩形区域整体写为 `value` (0 或 1). 要求矩形落在掩膜内, 否则 panic.
    pub fn fill_region(&mut self, rect: &LoResRect, value: u8) {
        assert!(value == bin::OFF || value == bin::ON);
        self.data
            .slice_mut(s![rect.first_row..rect.last_row, rect.first_col..rect.last_col])
            .fill(value);
    }

    /// 压缩数据.
    pub fn compress(&self) -> CompactTissueMask {
        let buf = self
            .data
            .as_slice()
            .expect("掩膜必须是标准行优先布局");
        let mut e = ZlibEncoder::new(Vec::with_capacity(8), Compression::best());
        e.write_all(buf).expect("Compression error");
        CompactTissueMask {
            buf: e.finish().expect("Compression error"),
            sh: self.shape(),
        }
    }
}

/// 压缩存储的 [`TissueMask`]; 不透明类型.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CompactTissueMask {
    /// 压缩的不透明字节流.
    buf: Vec<u8>,

    /// 形状.
    sh: Idx2d,
}

impl CompactTissueMask {
    /// 解压缩数据.
    pub fn decompress(self) -> TissueMask {
        let Self { buf, sh: (h, w) } = self;
        let mut d = ZlibDecoder::new(buf.as_slice());
        let mut buf = Vec::with_capacity(h * w);
        d.read_to_end(&mut buf).expect("Decompression error");
        debug_assert_eq!(buf.len(), h * w);
        let data = Array2::<u8>::from_shape_vec((h, w), buf).unwrap();
        TissueMask { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn small_params() -> CoarseMaskParams {
        CoarseMaskParams {
            downsample_factor: 8.0,
            dilation_radius: 1,
            min_component_size: 4,
            max_hole_size: 16,
        }
    }

    #[test]
    fn test_rough_mask_dark_is_tissue() {
        // 亮背景 (230) 上一块暗组织 (40).
        let mut thumb = Array2::<u8>::from_elem((20, 20), 230);
        thumb.slice_mut(s![5..15, 5..15]).fill(40);
        let mask = rough_foreground_mask(thumb.view(), &small_params());
        assert!(mask.is_tissue((10, 10)));
        assert!(!mask.is_tissue((0, 0)));
        // 膨胀半径 1: 组织块向外扩一圈.
        assert!(mask.is_tissue((4, 10)));
    }

    #[test]
    fn test_rough_mask_drops_specks_fills_holes() {
        let mut thumb = Array2::<u8>::from_elem((30, 30), 230);
        thumb.slice_mut(s![5..20, 5..20]).fill(40);
        thumb[(10, 10)] = 230; // 组织内的小空洞
        thumb[(27, 27)] = 40; // 孤立碎屑
        let params = CoarseMaskParams {
            dilation_radius: 0,
            ..small_params()
        };
        let mask = rough_foreground_mask(thumb.view(), &params);
        assert!(mask.is_tissue((10, 10)));
        assert!(!mask.is_tissue((27, 27)));
    }

    #[test]
    fn test_blank_thumbnail_yields_empty_mask() {
        let thumb = Array2::<u8>::from_elem((12, 12), 240);
        let mask = rough_foreground_mask(thumb.view(), &small_params());
        assert_eq!(mask.count_remaining(), 0);
    }

    #[test]
    fn test_fill_region_and_count() {
        let mut mask = TissueMask::from_raw(Array2::from_elem((10, 10), 1));
        assert_eq!(mask.count_remaining(), 100);
        mask.fill_region(&LoResRect::new(0, 0, 5, 10), 0);
        assert_eq!(mask.count_remaining(), 50);
        assert!(!mask.is_tissue((4, 9)));
        assert!(mask.is_tissue((5, 0)));
    }

    #[test]
    fn test_compress_roundtrip() {
        let mut data = Array2::<u8>::zeros((17, 23));
        data[(3, 4)] = 1;
        data[(16, 22)] = 1;
        let mask = TissueMask::from_raw(data);
        let back = mask.clone().compress().decompress();
        assert_eq!(back, mask);
    }

    #[test]
    fn test_params_validate() {
        assert!(CoarseMaskParams::default().validate().is_ok());
        let bad = CoarseMaskParams {
            downsample_factor: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
