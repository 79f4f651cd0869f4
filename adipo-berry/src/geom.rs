//! 坐标空间换算.
//!
//! 流水线同时存在三个坐标空间:
//!
//! 1. **低分辨率空间** (lores): 粗组织掩膜所在的降采样网格;
//! 2. **全分辨率空间** (fullres): 切片原始像素网格;
//! 3. **tile 局部空间** (local): 单个 tile 内部, 以 tile 左上角为原点.
//!
//! 原型实现在每一步临时换算并四舍五入, 是 tile 边界 off-by-one
//! 错误的温床. 这里将三个空间的矩形各自固化为独立类型,
//! 并把舍入方向约定收敛到唯一一处:
//!
//! - lores -> fullres: 各坐标按 `round(x * factor)` 换算;
//! - 浮点 lores 区间落整: 上边界向下取整, 下边界向上取整
//!   (保证落整后的区域覆盖原浮点区域, 写回 to-do 掩膜时不遗漏).
//!
//! 所有矩形均为半开区间 `[first, last)`.

use crate::{Idx2d, Idx2dF};

/// 低分辨率空间中的矩形 (半开区间).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoResRect {
    /// 首行 (含).
    pub first_row: usize,
    /// 首列 (含).
    pub first_col: usize,
    /// 尾行 (不含).
    pub last_row: usize,
    /// 尾列 (不含).
    pub last_col: usize,
}

/// 全分辨率空间中的矩形 (半开区间).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FullResRect {
    /// 首行 (含).
    pub first_row: usize,
    /// 首列 (含).
    pub first_col: usize,
    /// 尾行 (不含).
    pub last_row: usize,
    /// 尾列 (不含).
    pub last_col: usize,
}

/// tile 局部空间中的矩形 (半开区间), 以 tile 左上角为原点.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TileLocalRect {
    /// 首行 (含).
    pub first_row: usize,
    /// 首列 (含).
    pub first_col: usize,
    /// 尾行 (不含).
    pub last_row: usize,
    /// 尾列 (不含).
    pub last_col: usize,
}

/// 矩形四条边的子集.
///
/// 两种用途共用一个类型: 描述一个实例接触了哪些 tile 边,
/// 以及描述 tile 的哪些边是 "开放" 的 (边外还有未处理的组织).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EdgeSet {
    /// 上边 (首行).
    pub top: bool,

    /// 下边 (尾行).
    pub bottom: bool,

    /// 左边 (首列).
    pub left: bool,

    /// 右边 (尾列).
    pub right: bool,
}

impl EdgeSet {
    /// 全部四条边.
    pub const ALL: Self = Self {
        top: true,
        bottom: true,
        left: true,
        right: true,
    };

    /// 是否至少含一条边?
    #[inline]
    pub fn any(&self) -> bool {
        self.top || self.bottom || self.left || self.right
    }

    /// 两个边集合是否有公共边?
    #[inline]
    pub fn intersects(&self, other: &EdgeSet) -> bool {
        (self.top && other.top)
            || (self.bottom && other.bottom)
            || (self.left && other.left)
            || (self.right && other.right)
    }
}

macro_rules! impl_rect_common {
    ($($rect: ty),+) => {
        $(
            impl $rect {
                /// 直接从四个边界构造. 要求 `first <= last`, 否则 panic.
                pub fn new(first_row: usize, first_col: usize, last_row: usize, last_col: usize) -> Self {
                    assert!(first_row <= last_row && first_col <= last_col);
                    Self { first_row, first_col, last_row, last_col }
                }

                /// 矩形的形状 (高, 宽).
                #[inline]
                pub fn shape(&self) -> Idx2d {
                    (self.last_row - self.first_row, self.last_col - self.first_col)
                }

                /// 矩形的高.
                #[inline]
                pub fn height(&self) -> usize {
                    self.last_row - self.first_row
                }

                /// 矩形的宽.
                #[inline]
                pub fn width(&self) -> usize {
                    self.last_col - self.first_col
                }

                /// 矩形是否为空?
                #[inline]
                pub fn is_empty(&self) -> bool {
                    self.first_row == self.last_row || self.first_col == self.last_col
                }

                /// 矩形包含的像素个数.
                #[inline]
                pub fn size(&self) -> usize {
                    self.height() * self.width()
                }

                /// 判断全局索引 `pos` 是否落在矩形内.
                #[inline]
                pub fn contains(&self, (h, w): Idx2d) -> bool {
                    (self.first_row..self.last_row).contains(&h)
                        && (self.first_col..self.last_col).contains(&w)
                }

                /// 将全局索引换算为以本矩形左上角为原点的局部索引.
                ///
                /// 要求 `pos` 落在矩形内, 否则 panic.
                #[inline]
                pub fn to_local(&self, (h, w): Idx2d) -> Idx2d {
                    assert!(self.contains((h, w)));
                    (h - self.first_row, w - self.first_col)
                }

                /// 将局部索引换算回全局索引.
                ///
                /// 要求结果仍落在矩形内, 否则 panic.
                #[inline]
                pub fn to_global(&self, (h, w): Idx2d) -> Idx2d {
                    let pos = (self.first_row + h, self.first_col + w);
                    assert!(self.contains(pos));
                    pos
                }
            }
        )+
    };
}

impl_rect_common!(LoResRect, FullResRect, TileLocalRect);

impl LoResRect {
    /// 从浮点边界落整. 上边界 (first) 向下取整, 下边界 (last) 向上取整,
    /// 然后裁剪到 `bounds` (高, 宽) 以内.
    ///
    /// 要求所有输入非负且 `first <= last`, 否则 panic.
    pub fn from_f64(
        (first_row, first_col): Idx2dF,
        (last_row, last_col): Idx2dF,
        bounds: Idx2d,
    ) -> Self {
        assert!(first_row >= 0.0 && first_col >= 0.0);
        assert!(first_row <= last_row && first_col <= last_col);
        Self {
            first_row: (first_row.floor() as usize).min(bounds.0),
            first_col: (first_col.floor() as usize).min(bounds.1),
            last_row: (last_row.ceil() as usize).min(bounds.0),
            last_col: (last_col.ceil() as usize).min(bounds.1),
        }
    }

    /// 按降采样因子换算到全分辨率空间. 各坐标按 `round(x * factor)`.
    ///
    /// 要求 `factor >= 1.0`.
    pub fn to_fullres(&self, factor: f64) -> FullResRect {
        assert!(factor >= 1.0);
        let scale = |v: usize| (v as f64 * factor).round() as usize;
        FullResRect {
            first_row: scale(self.first_row),
            first_col: scale(self.first_col),
            last_row: scale(self.last_row),
            last_col: scale(self.last_col),
        }
    }
}

impl FullResRect {
    /// 以整幅图像 (高, 宽) 构造覆盖全图的矩形.
    #[inline]
    pub fn whole((h, w): Idx2d) -> Self {
        Self {
            first_row: 0,
            first_col: 0,
            last_row: h,
            last_col: w,
        }
    }

    /// 将矩形整体裁剪到 `bounds` (高, 宽) 以内.
    pub fn clip(&self, bounds: Idx2d) -> Self {
        Self {
            first_row: self.first_row.min(bounds.0),
            first_col: self.first_col.min(bounds.1),
            last_row: self.last_row.min(bounds.0),
            last_col: self.last_col.min(bounds.1),
        }
    }

    /// 向四周扩展 `(dh, dw)` 像素, 下界饱和于 0, 上界裁剪到 `bounds`.
    pub fn dilate(&self, (dh, dw): Idx2d, bounds: Idx2d) -> Self {
        Self {
            first_row: self.first_row.saturating_sub(dh),
            first_col: self.first_col.saturating_sub(dw),
            last_row: (self.last_row + dh).min(bounds.0),
            last_col: (self.last_col + dw).min(bounds.1),
        }
    }
}
