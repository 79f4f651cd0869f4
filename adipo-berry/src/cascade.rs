//! 模型级联 (model cascade).
//!
//! 四个 CNN 均以 [`PixelModel`] trait 的形式接入, 本模块不关心
//! 推理后端是什么. 级联的固定依赖顺序:
//!
//! 1. **dmap 回归**: 输入原始 tile 图像, 输出到细胞边界的距离图;
//! 2. **轮廓判别**: 输入上一步 *预测出的* dmap (而非原图),
//!    输出逐像素的 "这是细胞分界" 概率;
//! 3. **组织分类**: 输入原始 tile 图像, 输出逐像素的脂肪细胞概率
//!    (独立分支, 与前两级无数据依赖).
//!
//! 第四个模型 (分割修正) 不在级联内, 由 [`crate::correct`] 单独驱动.
//!
//! 长时间跑片时推理后端的会话状态会持续累积,
//! [`InferenceContext::release_all`] 是 tile 之间的显式资源释放点.

use crate::consts::class;
use crate::error::ModelError;
use crate::Idx2d;
use ndarray::{s, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis};

/// 逐像素推理模型. 所有模型的张量布局统一为 NHWC.
///
/// 实现约定:
///
/// 1. `predict` 对相同输入必须返回相同输出 (确定性);
/// 2. 输出的 batch 大小与空间形状必须与输入一致 (通道数可不同);
/// 3. [`PixelModel::adapt_input_shape`] 在不重训的前提下把输入层
///    重塑到给定空间形状, 随后的 `predict` 接受该形状的输入.
pub trait PixelModel {
    /// 模型期望的输入通道数.
    fn input_channels(&self) -> usize;

    /// 把模型输入层重塑到空间形状 `shape`. 默认实现为无操作
    /// (模型本身是全卷积、形状无关的).
    fn adapt_input_shape(&mut self, shape: Idx2d) -> Result<(), ModelError> {
        let _ = shape;
        Ok(())
    }

    /// 对一个 NHWC batch 做推理.
    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ModelError>;

    /// 释放推理后端的会话状态. 默认实现为无操作.
    fn release(&mut self) {}
}

/// 级联一次推理的输出. 三张图的空间形状都等于输入 tile.
#[derive(Clone, Debug)]
pub struct CascadePrediction {
    /// 到细胞边界的距离图 (值越大越靠近细胞内部).
    pub dmap: Array2<f32>,

    /// 细胞分界概率图.
    pub contour: Array2<f32>,

    /// 脂肪细胞类别概率图.
    pub class_prob: Array2<f32>,
}

/// 推理上下文: 级联三模型 + 可选的分割修正模型.
pub struct InferenceContext {
    /// dmap 回归模型.
    pub dmap: Box<dyn PixelModel>,

    /// 轮廓判别模型 (以 dmap 为输入).
    pub contour: Box<dyn PixelModel>,

    /// 组织分类模型.
    pub classifier: Box<dyn PixelModel>,

    /// 分割修正模型. `None` 时跳过边界修正.
    pub correction: Option<Box<dyn PixelModel>>,
}

impl InferenceContext {
    /// 对单个 tile 运行三级级联.
    ///
    /// `rgb` 是 `(高, 宽, 3)` 的原始 tile 图像. 推理前会对三个模型
    /// 各做一次 [`PixelModel::adapt_input_shape`].
    pub fn run_cascade(&mut self, rgb: ArrayView3<u8>) -> Result<CascadePrediction, ModelError> {
        let (h, w, c) = rgb.dim();
        if self.dmap.input_channels() != c {
            return Err(ModelError::ChannelMismatch {
                expected: self.dmap.input_channels(),
                got: c,
            });
        }
        self.dmap.adapt_input_shape((h, w))?;
        self.contour.adapt_input_shape((h, w))?;
        self.classifier.adapt_input_shape((h, w))?;

        let img = normalize_rgb(rgb);

        let dmap = single_channel(run_single(self.dmap.as_mut(), img.view(), (h, w))?, 0);

        // 轮廓模型吃的是预测 dmap, 不是原图.
        let dmap_in = dmap
            .clone()
            .into_shape((1, h, w, 1))
            .expect("dmap 形状与 tile 一致");
        if self.contour.input_channels() != 1 {
            return Err(ModelError::ChannelMismatch {
                expected: self.contour.input_channels(),
                got: 1,
            });
        }
        let contour = single_channel(
            run_single(self.contour.as_mut(), dmap_in.view(), (h, w))?,
            0,
        );

        let class_out = run_single(self.classifier.as_mut(), img.view(), (h, w))?;
        let class_channel = if class_out.dim().3 > 1 {
            class::CELL as usize
        } else {
            0
        };
        let class_prob = single_channel(class_out, class_channel);

        Ok(CascadePrediction {
            dmap,
            contour,
            class_prob,
        })
    }

    /// tile 之间的显式资源释放点: 释放所有模型的会话状态.
    pub fn release_all(&mut self) {
        self.dmap.release();
        self.contour.release();
        self.classifier.release();
        if let Some(correction) = self.correction.as_mut() {
            correction.release();
        }
    }
}

/// 把 8-bit RGB tile 归一化为 `(1, 高, 宽, 3)` 的 f32 batch.
pub fn normalize_rgb(rgb: ArrayView3<u8>) -> Array4<f32> {
    let (h, w, c) = rgb.dim();
    let float: Array3<f32> = rgb.mapv(|p| p as f32 / 255.0);
    float
        .into_shape((1, h, w, c))
        .expect("插入 batch 维不改变元素个数")
}

/// 跑单样本推理并校验输出的空间形状.
fn run_single(
    model: &mut dyn PixelModel,
    input: ArrayView4<f32>,
    expected: Idx2d,
) -> Result<Array4<f32>, ModelError> {
    let out = model.predict(input)?;
    let (n, oh, ow, _) = out.dim();
    if n != 1 || (oh, ow) != expected {
        return Err(ModelError::ShapeMismatch {
            expected,
            got: (oh, ow),
        });
    }
    Ok(out)
}

/// 从 `(1, 高, 宽, C)` 中抽出一个通道.
fn single_channel(batch: Array4<f32>, channel: usize) -> Array2<f32> {
    batch
        .index_axis(Axis(0), 0)
        .slice(s![.., .., channel])
        .to_owned()
}
