//! 通用常量.

/// 实例标签图的像素值约定.
pub mod label {
    /// 实例标签图中, 背景的标签值.
    pub const BACKGROUND: u32 = 0;

    /// 标签是否是背景?
    #[inline]
    pub const fn is_background(p: u32) -> bool {
        p == BACKGROUND
    }

    /// 标签是否是某个实例?
    #[inline]
    pub const fn is_instance(p: u32) -> bool {
        p != BACKGROUND
    }
}

/// 组织分类器输出的离散类别.
pub mod class {
    /// "其它" (非脂肪细胞) 类别.
    pub const OTHER: u8 = 0;

    /// 脂肪细胞类别.
    pub const CELL: u8 = 1;
}

/// 二值掩膜的像素值约定. 掩膜统一以 `u8` 的 0/1 存储.
pub mod bin {
    /// 假 (背景 / 已处理).
    pub const OFF: u8 = 0;

    /// 真 (组织 / 待处理).
    pub const ON: u8 = 1;

    /// 像素是否为真?
    #[inline]
    pub const fn is_on(p: u8) -> bool {
        p != OFF
    }
}

/// 软概率图判定为正类的默认阈值.
pub const PROB_THRESHOLD: f32 = 0.5;

/// 修正模型符号图中, "分割过度扩张" 的判定阈值 (含).
pub const OVERGROWN_THRESHOLD: f32 = 0.5;

/// 修正模型符号图中, "分割扩张不足" 的判定阈值 (含).
pub const UNDERGROWN_THRESHOLD: f32 = -0.5;
