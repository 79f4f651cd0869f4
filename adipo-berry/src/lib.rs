#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 提供全切片 (whole-slide) 脂肪组织学图像的 tile 化推理调度、
//! 模型级联 (cascade) 驱动与脂肪细胞实例分割的装配算法.
//!
//! 该 crate 不包含任何神经网络的定义与训练: 四个 CNN (dmap 回归、
//! 轮廓判别、组织分类、分割修正) 通过 [`cascade::PixelModel`] trait
//! 以纯函数的形式接入. 同理, 专有切片格式的读取通过 [`Slide`] trait 接入.
//! 本 crate 负责的是确定性的 tile 调度与几何装配问题本身:
//! 多 GB 级图像上哪些区域尚未处理、如何截取有界窗口、
//! 如何把逐像素预测转换为互不重叠的细胞实例、
//! 以及如何把各 tile 的结果无重复地合并回全片.
//!
//! # 注意
//!
//! 1. 在非期望情况下 (调用者违反文档约定), 程序会直接 panic,
//!    而不会导致内存错误. As what Rust promises.
//! 2. 运行时可预期的失败 (配置错误、调度死角、模型失败)
//!    以 [`PipelineError`] 的形式返回.
//!
//! # 开发计划
//!
//! ### 粗组织掩膜 (coarse tissue mask) ✅
//!
//! 降采样 + Otsu 阈值 + 形态学清理. 实现位于 `adipo-berry/src/mask.rs`.
//!
//! ### Tile 调度器 ✅
//!
//! 线核相关检测锚点, 收缩窗口, 加 border, 坐标换算.
//! 保证有限步终止. 实现位于 `adipo-berry/src/tile.rs`.
//!
//! ### 模型级联 ✅
//!
//! dmap -> contour (以 dmap 为输入) -> classifier 三级推理,
//! 显式的 [`cascade::InferenceContext`] 资源释放点.
//! 实现位于 `adipo-berry/src/cascade.rs`.
//!
//! ### 实例提取 (marker watershed) ✅
//!
//! dmap 局部极大值做种子, contour 概率做高程, 优先队列泛洪.
//! 实现位于 `adipo-berry/src/instance.rs`.
//!
//! ### 分割清理 ✅
//!
//! 边缘延迟规则 / 面积规则 / 掩膜重叠规则 / 类别规则 / phagocytosis.
//! 实现位于 `adipo-berry/src/clean.rs`.
//!
//! ### 边界修正 ✅
//!
//! 逐实例定长窗口 + 符号修正图 + 形态学平滑, 按 batch 推理.
//! 实现位于 `adipo-berry/src/correct.rs`.
//!
//! ### 全片驱动循环与断点续跑 ✅
//!
//! 实现位于 `adipo-berry/src/pipeline.rs` 和 `adipo-berry/src/persist.rs`.

/// 二维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 高精度通用索引 / 向量.
pub type Idx2dF = (f64, f64);

type Area2d = Vec<Idx2d>;
type Areas2d = Vec<Area2d>;

pub mod consts;

mod error;

pub use error::{ConfigError, ModelError, NoValidTileError, PipelineError, PipelineResult};

pub mod geom;

pub mod morph;

mod mask;

pub use mask::{rough_foreground_mask, CoarseMaskParams, CompactTissueMask, TissueMask};

mod slide;

pub use slide::{MemorySlide, PixelSize, Slide};

mod tile;

pub use tile::{Tile, TileParams, TileScheduler};

pub mod cascade;

mod instance;

pub use instance::{extract, ExtractParams, InstanceStat, LabelMap};

mod clean;

pub use clean::{clean, CleanParams, RemovalStats};

mod correct;

pub use correct::{correct, CorrectionParams};

pub mod phantom;

mod pipeline;

pub use pipeline::{
    segment_slide, segment_slide_with_mask, PipelineParams, SlideInstance, SlideOutcome,
    StepReport,
};

#[cfg(feature = "serde")]
pub mod persist;

mod save;

pub use save::{ImgWriteRaw, ImgWriteVis};

pub mod prelude;
