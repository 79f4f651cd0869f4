//! 合成切片与合成模型 (phantom).
//!
//! 真实的全片图像动辄数十 GB, CNN 权重也不属于本 crate.
//! 这里提供一套几何上可验证的替身: 亮背景上的圆形 "细胞"
//! (深色细胞壁 + 中灰胞体), 以及四个从图像内容直接算出
//! 理想预测的 [`PixelModel`] 实现. 端到端测试与示例都跑在它上面,
//! 结果可以按圆的面积公式人工核对.

use crate::cascade::{InferenceContext, PixelModel};
use crate::error::ModelError;
use crate::morph;
use crate::slide::{MemorySlide, PixelSize};
use crate::{Idx2d, Idx2dF};
use ndarray::{s, Array2, Array3, Array4, ArrayView4};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

/// 背景 (载玻片) 的灰度.
pub const BACKGROUND_GRAY: u8 = 240;

/// 胞体内部的灰度.
pub const INTERIOR_GRAY: u8 = 128;

/// 细胞壁的灰度.
pub const WALL_GRAY: u8 = 32;

/// 组织/背景的灰度分界: 低于它算组织.
const TISSUE_GRAY: f32 = 180.0;

/// 圆形合成细胞.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Cell {
    /// 圆心 (行, 列).
    pub center: Idx2dF,

    /// 半径 (像素).
    pub radius: f64,
}

/// 生成一张合成切片: 亮背景上若干圆形细胞, 细胞壁宽 1.5 像素.
///
/// 细胞允许越出图像边界 (用于构造跨 tile 的测试场景).
pub fn cells_slide(shape: Idx2d, cells: &[Cell], pixel_size: PixelSize) -> MemorySlide {
    let (h, w) = shape;
    let mut rgb = Array3::<u8>::from_elem((h, w, 3), BACKGROUND_GRAY);
    for ph in 0..h {
        for pw in 0..w {
            let mut gray = None;
            for cell in cells {
                let dist = ((ph as f64 - cell.center.0).powi(2)
                    + (pw as f64 - cell.center.1).powi(2))
                .sqrt();
                if dist < cell.radius - 1.5 {
                    gray = Some(INTERIOR_GRAY);
                } else if dist < cell.radius {
                    // 细胞壁优先于相邻细胞的胞体.
                    gray = Some(WALL_GRAY);
                    break;
                }
            }
            if let Some(g) = gray {
                rgb.slice_mut(s![ph, pw, ..]).fill(g);
            }
        }
    }
    MemorySlide::new(rgb, pixel_size)
}

/// 按亮度把 batch 里的每个样本二值化为组织掩膜.
fn tissue_of(batch: ArrayView4<f32>, sample: usize) -> Array2<u8> {
    let (_, h, w, _) = batch.dim();
    Array2::from_shape_fn((h, w), |(ph, pw)| {
        let gray = 255.0
            * (0.299 * batch[(sample, ph, pw, 0)]
                + 0.587 * batch[(sample, ph, pw, 1)]
                + 0.114 * batch[(sample, ph, pw, 2)]);
        u8::from(gray < TISSUE_GRAY)
    })
}

/// 逐样本计算组织掩膜的距离变换. 样本之间并行 (batch 内部并行
/// 对流水线透明, 不改变 tile 顺序).
#[cfg(feature = "rayon")]
fn batch_chamfer(batch: ArrayView4<f32>) -> Vec<Array2<f32>> {
    let n = batch.dim().0;
    (0..n)
        .into_par_iter()
        .map(|i| morph::chamfer_distance(tissue_of(batch, i).view()))
        .collect()
}

/// 逐样本计算组织掩膜的距离变换.
#[cfg(not(feature = "rayon"))]
fn batch_chamfer(batch: ArrayView4<f32>) -> Vec<Array2<f32>> {
    let n = batch.dim().0;
    (0..n)
        .map(|i| morph::chamfer_distance(tissue_of(batch, i).view()))
        .collect()
}

/// dmap 回归替身: 组织掩膜的倒角距离变换.
pub struct PhantomDmap;

impl PixelModel for PhantomDmap {
    fn input_channels(&self) -> usize {
        3
    }

    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let (n, h, w, _) = batch.dim();
        let mut out = Array4::zeros((n, h, w, 1));
        for (i, dist) in batch_chamfer(batch).into_iter().enumerate() {
            out.slice_mut(s![i, .., .., 0]).assign(&dist);
        }
        Ok(out)
    }
}

/// 轮廓判别替身: dmap 越小越像分界, `p = 1 / (1 + d)`.
pub struct PhantomContour;

impl PixelModel for PhantomContour {
    fn input_channels(&self) -> usize {
        1
    }

    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        Ok(batch.mapv(|d| 1.0 / (1.0 + d.max(0.0))))
    }
}

/// 组织分类替身: 组织像素即脂肪细胞.
pub struct PhantomClassifier;

impl PixelModel for PhantomClassifier {
    fn input_channels(&self) -> usize {
        3
    }

    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let (n, h, w, _) = batch.dim();
        let mut out = Array4::zeros((n, h, w, 1));
        for i in 0..n {
            let tissue = tissue_of(batch, i).mapv(|p| p as f32);
            out.slice_mut(s![i, .., .., 0]).assign(&tissue);
        }
        Ok(out)
    }
}

/// 分割修正替身: 全零符号图, 即 "分割已经正确".
pub struct PhantomCorrection;

impl PixelModel for PhantomCorrection {
    fn input_channels(&self) -> usize {
        4
    }

    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let (n, h, w, _) = batch.dim();
        Ok(Array4::zeros((n, h, w, 1)))
    }
}

/// 组装一套完整的合成推理上下文.
pub fn context() -> InferenceContext {
    InferenceContext {
        dmap: Box::new(PhantomDmap),
        contour: Box::new(PhantomContour),
        classifier: Box::new(PhantomClassifier),
        correction: Some(Box::new(PhantomCorrection)),
    }
}
