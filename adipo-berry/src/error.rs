//! 运行时错误.
//!
//! 错误分类遵循以下约定:
//!
//! 1. 配置错误 ([`ConfigError`]): 在处理任何 tile 之前快速失败;
//! 2. 调度错误 ([`NoValidTileError`]): 对当前切片致命, 不自动重试;
//! 3. 模型推理错误 ([`ModelError`]): 致命, 不存在有意义的兜底预测;
//! 4. 数据质量淘汰 (实例未通过面积/重叠/类别规则): **不是错误**,
//!    以计数指标的形式记录在 [`crate::RemovalStats`] 中.

use crate::Idx2d;
use std::fmt;

/// 配置参数错误. 所有变体都会在流水线启动前被检出.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// 必须为正数的参数 (面积上下限、修正窗口边长等) 被配置为 0.
    NonPositiveArea {
        /// 出错的参数名.
        which: &'static str,
    },

    /// 面积下限不小于上限.
    AreaBoundsInverted {
        /// 配置的下限 (像素).
        min: usize,
        /// 配置的上限 (像素).
        max: usize,
    },

    /// 比例参数必须落在 `[0, 1]` 闭区间内.
    FractionOutOfRange {
        /// 出错的参数名.
        which: &'static str,
        /// 实际配置值.
        value: f64,
    },

    /// 窗口必须严格大于 2 倍 border, 否则窗口核心区域为空.
    WindowTooSmall {
        /// 配置的最大窗口 (高, 宽), 全分辨率单位.
        window: Idx2d,
        /// 感受野决定的 border (高, 宽), 全分辨率单位.
        border: Idx2d,
    },

    /// 降采样因子必须是不小于 1 的有限数.
    BadDownsampleFactor(f64),

    /// 像素物理尺寸必须为正有限数, 且横纵单位一致.
    BadPixelSize {
        /// 横向分辨率 (米/像素).
        x_m: f64,
        /// 纵向分辨率 (米/像素).
        y_m: f64,
    },

    /// 平滑核大小必须是正奇数.
    BadSmoothing(usize),

    /// batch 大小必须为正.
    ZeroBatchSize,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NonPositiveArea { which } => {
                write!(f, "参数 `{which}` 必须为正数")
            }
            ConfigError::AreaBoundsInverted { min, max } => {
                write!(f, "面积下限 {min} 不小于上限 {max}")
            }
            ConfigError::FractionOutOfRange { which, value } => {
                write!(f, "比例参数 `{which}` = {value} 超出 [0, 1]")
            }
            ConfigError::WindowTooSmall { window, border } => {
                write!(f, "最大窗口 {window:?} 不大于 2 倍 border {border:?}")
            }
            ConfigError::BadDownsampleFactor(v) => {
                write!(f, "非法降采样因子 {v}")
            }
            ConfigError::BadPixelSize { x_m, y_m } => {
                write!(f, "非法像素物理尺寸 ({x_m}, {y_m})")
            }
            ConfigError::BadSmoothing(v) => {
                write!(f, "平滑核大小 {v} 不是正奇数")
            }
            ConfigError::ZeroBatchSize => f.write_str("batch 大小不能为 0"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// 调度死角: 掩膜仍有组织像素, 但找不到任何合法锚点.
///
/// 这是设计上的边界情况 (如掩膜状态损坏). 与其无限循环,
/// 调度器会立即以该错误中止, 并携带残余组织像素数以供诊断.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoValidTileError {
    /// 掩膜中残余的组织像素个数 (低分辨率单位).
    pub remaining: usize,
}

impl fmt::Display for NoValidTileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "掩膜仍有 {} 个组织像素, 但无法锚定任何 tile",
            self.remaining
        )
    }
}

impl std::error::Error for NoValidTileError {}

/// 模型推理错误.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// 模型输出的空间形状与输入 tile 不符.
    ShapeMismatch {
        /// 期望的空间形状 (高, 宽).
        expected: Idx2d,
        /// 实际得到的空间形状 (高, 宽).
        got: Idx2d,
    },

    /// 输入通道数与模型期望不符.
    ChannelMismatch {
        /// 模型期望的通道数.
        expected: usize,
        /// 实际提供的通道数.
        got: usize,
    },

    /// 底层推理后端报告的错误 (如模型文件缺失).
    Backend(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::ShapeMismatch { expected, got } => {
                write!(f, "模型输出形状 {got:?} 与期望 {expected:?} 不符")
            }
            ModelError::ChannelMismatch { expected, got } => {
                write!(f, "模型输入通道数 {got} 与期望 {expected} 不符")
            }
            ModelError::Backend(msg) => write!(f, "推理后端错误: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

/// 全片流水线的聚合错误类型.
#[derive(Debug)]
pub enum PipelineError {
    /// 配置错误 (启动前检出).
    Config(ConfigError),

    /// 调度错误.
    Scheduling(NoValidTileError),

    /// 模型推理错误.
    Model(ModelError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "{e}"),
            PipelineError::Scheduling(e) => write!(f, "{e}"),
            PipelineError::Model(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Config(e) => Some(e),
            PipelineError::Scheduling(e) => Some(e),
            PipelineError::Model(e) => Some(e),
        }
    }
}

impl From<ConfigError> for PipelineError {
    #[inline]
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<NoValidTileError> for PipelineError {
    #[inline]
    fn from(value: NoValidTileError) -> Self {
        Self::Scheduling(value)
    }
}

impl From<ModelError> for PipelineError {
    #[inline]
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

/// 流水线通用结果类型.
pub type PipelineResult<T> = Result<T, PipelineError>;
