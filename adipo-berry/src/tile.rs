//! Tile 调度器.
//!
//! 调度器是一个两状态的状态机: 只要粗组织掩膜还有非零像素,
//! 就处于 `HAS_TISSUE` 状态并能产出下一个 tile; 掩膜清空后进入
//! 终态 `DONE`. 每个 tile 的选取分四步:
//!
//! 1. **锚点检测**: 对掩膜分别做水平线核与垂直线核的滑窗求和
//!    (核长 = 最大可用窗口 / 降采样因子, 低分辨率单位),
//!    两个和同时非零的位置才是合法锚点;
//! 2. **行优先取首**: 在合法锚点中按行优先序取第一个,
//!    并要求以它为左上角的候选窗口核心确实含有组织;
//! 3. **收缩**: 把窗口的下/右边界收缩到核心内最后一个含组织的行/列;
//! 4. **加 border**: 四周扩展感受野半径对应的 border, 裁剪到掩膜边界,
//!    再按降采样因子换算回全分辨率坐标.
//!
//! 原型实现用 FFT 做第 1 步的相关运算, 浮点舍入导致 "非零" 判定
//! 依赖平台. 这里改用精确的整数滑窗求和, 判定谓词完全一致且逐位确定.

use crate::consts::bin;
use crate::error::{ConfigError, NoValidTileError};
use crate::geom::{FullResRect, LoResRect};
use crate::mask::TissueMask;
use crate::Idx2d;
use ndarray::{Array2, ArrayView2};

/// 调度参数 (全分辨率单位).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileParams {
    /// tile 的最大窗口 (高, 宽), 含 border.
    pub max_window_size: Idx2d,

    /// 级联网络的感受野 (高, 宽). border 取其一半 (整除).
    pub receptive_field: Idx2d,
}

impl Default for TileParams {
    fn default() -> Self {
        Self {
            max_window_size: (2751, 2751),
            receptive_field: (131, 131),
        }
    }
}

impl TileParams {
    /// border 宽度 (高, 宽), 全分辨率单位.
    #[inline]
    pub fn border(&self) -> Idx2d {
        (self.receptive_field.0 / 2, self.receptive_field.1 / 2)
    }

    /// 校验参数合法性: 窗口必须严格大于 2 倍 border.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let border = self.border();
        if self.max_window_size.0 <= 2 * border.0 || self.max_window_size.1 <= 2 * border.1 {
            return Err(ConfigError::WindowTooSmall {
                window: self.max_window_size,
                border,
            });
        }
        Ok(())
    }
}

/// 单个待处理的矩形区域. 创建后只读.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tile {
    /// 全分辨率坐标下的区域 (含 border).
    pub fullres: FullResRect,

    /// 低分辨率 (掩膜网格) 坐标下的同一区域.
    pub lores: LoResRect,

    /// 区域四周 border 的宽度 (高, 宽), 全分辨率单位.
    pub border: Idx2d,
}

/// Tile 调度器. 独占持有粗组织掩膜作为其全部可变状态.
pub struct TileScheduler {
    mask: TissueMask,
    factor: f64,
    fullres_shape: Idx2d,
    border: Idx2d,

    /// 线核长度 (高, 宽), 低分辨率单位.
    kernel: Idx2d,
}

impl TileScheduler {
    /// 构造调度器并校验参数.
    ///
    /// `fullres_shape` 是全分辨率图像的 (高, 宽).
    pub fn new(
        mask: TissueMask,
        params: &TileParams,
        downsample_factor: f64,
        fullres_shape: Idx2d,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        if !downsample_factor.is_finite() || downsample_factor < 1.0 {
            return Err(ConfigError::BadDownsampleFactor(downsample_factor));
        }
        let border = params.border();
        let core = (
            params.max_window_size.0 - 2 * border.0,
            params.max_window_size.1 - 2 * border.1,
        );
        let to_lores = |v: usize| ((v as f64 / downsample_factor).round() as usize).max(1);
        Ok(Self {
            mask,
            factor: downsample_factor,
            fullres_shape,
            border,
            kernel: (to_lores(core.0), to_lores(core.1)),
        })
    }

    /// 掩膜中残余组织像素个数 (低分辨率单位). 为 0 即 `DONE`.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.mask.count_remaining()
    }

    /// 调度是否已结束?
    #[inline]
    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// 当前掩膜的只读视图.
    #[inline]
    pub fn mask(&self) -> &TissueMask {
        &self.mask
    }

    /// 交还掩膜, 结束调度.
    #[inline]
    pub fn into_mask(self) -> TissueMask {
        self.mask
    }

    /// 产出下一个 tile.
    ///
    /// 返回 `Ok(None)` 表示进入终态 `DONE`;
    /// 返回 [`NoValidTileError`] 表示掩膜非空但无法锚定任何 tile.
    pub fn next_tile(&mut self) -> Result<Option<Tile>, NoValidTileError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let (mh, mw) = self.mask.shape();
        let (kh, kw) = self.kernel;
        let hsum = centered_row_sums(self.mask.view(), kw);
        let vsum = centered_col_sums(self.mask.view(), kh);

        for anchor_r in 0..mh {
            for anchor_c in 0..mw {
                if hsum[(anchor_r, anchor_c)] == 0 || vsum[(anchor_r, anchor_c)] == 0 {
                    continue;
                }
                let core = LoResRect::new(
                    anchor_r,
                    anchor_c,
                    (anchor_r + kh).min(mh),
                    (anchor_c + kw).min(mw),
                );
                if let Some(shrunk) = self.shrink_to_tissue(&core) {
                    return Ok(Some(self.finish_tile(shrunk)));
                }
            }
        }
        Err(NoValidTileError { remaining })
    }

    /// 把候选窗口的下/右边界收缩到最后一个含组织的行/列.
    /// 核心不含组织时返回 `None` (锚点作废).
    fn shrink_to_tissue(&self, core: &LoResRect) -> Option<LoResRect> {
        let region = self.mask.region(core);
        let mut last_row = None;
        let mut last_col = None;
        for ((h, w), &pix) in region.indexed_iter() {
            if bin::is_on(pix) {
                last_row = Some(last_row.map_or(h, |v: usize| v.max(h)));
                last_col = Some(last_col.map_or(w, |v: usize| v.max(w)));
            }
        }
        let (last_row, last_col) = (last_row?, last_col?);
        Some(LoResRect::new(
            core.first_row,
            core.first_col,
            core.first_row + last_row + 1,
            core.first_col + last_col + 1,
        ))
    }

    /// 四周加 border, 换算到全分辨率并裁剪.
    fn finish_tile(&self, shrunk: LoResRect) -> Tile {
        let to_lores = |v: usize| (v as f64 / self.factor).round() as usize;
        let border_lores = (to_lores(self.border.0), to_lores(self.border.1));
        let bounds = self.mask.shape();
        let lores = LoResRect::new(
            shrunk.first_row.saturating_sub(border_lores.0),
            shrunk.first_col.saturating_sub(border_lores.1),
            (shrunk.last_row + border_lores.0).min(bounds.0),
            (shrunk.last_col + border_lores.1).min(bounds.1),
        );
        let fullres = lores.to_fullres(self.factor).clip(self.fullres_shape);
        Tile {
            fullres,
            lores,
            border: self.border,
        }
    }

    /// 宣告 tile 处理完成, 把结果写回掩膜.
    ///
    /// `todo_lores` 是 tile 低分辨率区域内仍需处理的像素 (0/1),
    /// 形状必须等于 `tile.lores.shape()`, 否则 panic.
    /// tile 区域先整体清零, 再把 to-do 像素与处理前的掩膜取交后写回
    /// (处理前已是背景的格子不会被重新点亮),
    /// 因此掩膜非零像素数在每次调用后单调不增.
    pub fn complete_tile(&mut self, tile: &Tile, todo_lores: ArrayView2<u8>) {
        assert_eq!(todo_lores.dim(), tile.lores.shape());
        let before = self.mask.count_remaining();

        let was_on = self.mask.region(&tile.lores).to_owned();
        self.mask.fill_region(&tile.lores, bin::OFF);
        for ((h, w), &todo) in todo_lores.indexed_iter() {
            if bin::is_on(todo) && bin::is_on(was_on[(h, w)]) {
                self.mask.set(tile.lores.to_global((h, w)), bin::ON);
            }
        }

        debug_assert!(self.mask.count_remaining() <= before);
    }
}

/// 每个位置上, 以它为中心的长度 `k` 水平线段内的掩膜和.
fn centered_row_sums(mask: ArrayView2<u8>, k: usize) -> Array2<u32> {
    let (h, w) = mask.dim();
    let lo = k / 2;
    let hi = k - 1 - lo;
    let mut out = Array2::<u32>::zeros((h, w));
    for r in 0..h {
        // 行内前缀和
        let mut prefix = Vec::with_capacity(w + 1);
        prefix.push(0u32);
        for c in 0..w {
            prefix.push(prefix[c] + mask[(r, c)] as u32);
        }
        for c in 0..w {
            let first = c.saturating_sub(lo);
            let last = (c + hi + 1).min(w);
            out[(r, c)] = prefix[last] - prefix[first];
        }
    }
    out
}

/// 每个位置上, 以它为中心的长度 `k` 垂直线段内的掩膜和.
fn centered_col_sums(mask: ArrayView2<u8>, k: usize) -> Array2<u32> {
    let (h, w) = mask.dim();
    let lo = k / 2;
    let hi = k - 1 - lo;
    let mut out = Array2::<u32>::zeros((h, w));
    for c in 0..w {
        let mut prefix = Vec::with_capacity(h + 1);
        prefix.push(0u32);
        for r in 0..h {
            prefix.push(prefix[r] + mask[(r, c)] as u32);
        }
        for r in 0..h {
            let first = r.saturating_sub(lo);
            let last = (r + hi + 1).min(h);
            out[(r, c)] = prefix[last] - prefix[first];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn scheduler_for(mask: Array2<u8>, window: usize, rf: usize, factor: f64) -> TileScheduler {
        let (mh, mw) = mask.dim();
        let fullres = (
            (mh as f64 * factor) as usize,
            (mw as f64 * factor) as usize,
        );
        TileScheduler::new(
            TissueMask::from_raw(mask),
            &TileParams {
                max_window_size: (window, window),
                receptive_field: (rf, rf),
            },
            factor,
            fullres,
        )
        .unwrap()
    }

    #[test]
    fn test_params_validate() {
        assert!(TileParams::default().validate().is_ok());
        let bad = TileParams {
            max_window_size: (100, 100),
            receptive_field: (131, 131),
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::WindowTooSmall { .. })
        ));
    }

    #[test]
    fn test_empty_mask_is_done() {
        let mut sched = scheduler_for(Array2::zeros((10, 10)), 64, 9, 8.0);
        assert!(sched.is_done());
        assert_eq!(sched.next_tile().unwrap(), None);
    }

    #[test]
    fn test_single_pixel_anchoring() {
        let mut mask = Array2::<u8>::zeros((32, 32));
        mask[(10, 12)] = 1;
        // 窗口 64, 感受野 9 -> border 4, 核心 56 -> 核长 round(56/8) = 7.
        let mut sched = scheduler_for(mask, 64, 9, 8.0);
        let tile = sched.next_tile().unwrap().unwrap();

        // 收缩后低分辨率核心是 [10, 11) x [12, 13), border 低分辨率为
        // round(4/8) = 1, 因此 tile 是 [9, 12) x [11, 14).
        assert_eq!(tile.lores, LoResRect::new(9, 11, 12, 14));
        assert_eq!(tile.fullres, FullResRect::new(72, 88, 96, 112));
        assert_eq!(tile.border, (4, 4));

        // 全部处理完: 写回空 to-do 后终止.
        sched.complete_tile(&tile, Array2::zeros(tile.lores.shape()).view());
        assert!(sched.is_done());
    }

    #[test]
    fn test_shrink_to_last_tissue() {
        let mut mask = Array2::<u8>::zeros((32, 32));
        mask[(2, 2)] = 1;
        mask[(5, 4)] = 1; // 同一核心窗口内更靠下的组织
        let mut sched = scheduler_for(mask, 64, 1, 8.0); // border 0
        let tile = sched.next_tile().unwrap().unwrap();
        // 锚点 (2, 2), 核心 8x8, 最后组织行/列是 (5, 4).
        assert_eq!(tile.lores, LoResRect::new(2, 2, 6, 5));
    }

    #[test]
    fn test_coverage_termination() {
        // 任意掩膜 + "全部标为完成" 的归约器在有限步内清空掩膜.
        let mut mask = Array2::<u8>::zeros((40, 40));
        for r in 0..40 {
            for c in 0..40 {
                if (r * 7 + c * 3) % 5 == 0 {
                    mask[(r, c)] = 1;
                }
            }
        }
        let mut sched = scheduler_for(mask, 64, 9, 8.0);
        let mut steps = 0;
        while let Some(tile) = sched.next_tile().unwrap() {
            sched.complete_tile(&tile, Array2::zeros(tile.lores.shape()).view());
            steps += 1;
            assert!(steps <= 40 * 40, "调度未终止");
        }
        assert!(sched.is_done());
    }

    #[test]
    fn test_monotonic_remaining() {
        let mut mask = Array2::<u8>::zeros((24, 24));
        mask.slice_mut(ndarray::s![4..20, 4..20]).fill(1);
        let mut sched = scheduler_for(mask, 64, 9, 8.0);
        let mut prev = sched.remaining();
        while let Some(tile) = sched.next_tile().unwrap() {
            // 写回一个非空 to-do (边缘行), 残余数仍须单调不增.
            let mut todo = Array2::<u8>::zeros(tile.lores.shape());
            if prev > tile.lores.size() {
                todo.row_mut(0).fill(1);
            }
            sched.complete_tile(&tile, todo.view());
            let now = sched.remaining();
            assert!(now <= prev);
            assert!(now < prev, "每步必须有净进展");
            prev = now;
        }
    }

    #[test]
    fn test_todo_writeback_intersects_with_previous_mask() {
        let mut mask = Array2::<u8>::zeros((16, 16));
        mask[(4, 4)] = 1;
        let mut sched = scheduler_for(mask, 64, 1, 8.0);
        let tile = sched.next_tile().unwrap().unwrap();
        // to-do 全 1, 但只有处理前就是组织的格子会被重新点亮.
        let todo = Array2::<u8>::ones(tile.lores.shape());
        sched.complete_tile(&tile, todo.view());
        assert_eq!(sched.remaining(), 1);
        assert!(sched.mask().is_tissue((4, 4)));
    }

    #[test]
    fn test_centered_sums() {
        let mut mask = Array2::<u8>::zeros((5, 5));
        mask[(2, 2)] = 1;
        let h = centered_row_sums(mask.view(), 3);
        assert_eq!(h[(2, 1)], 1);
        assert_eq!(h[(2, 3)], 1);
        assert_eq!(h[(2, 4)], 0);
        assert_eq!(h[(1, 2)], 0);
        let v = centered_col_sums(mask.view(), 5);
        assert_eq!(v[(0, 2)], 1);
        assert_eq!(v[(4, 2)], 1);
        assert_eq!(v[(0, 1)], 0);
    }
}
