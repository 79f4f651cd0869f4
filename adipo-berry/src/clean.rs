//! 分割清理: 按固定顺序的规则逐实例过滤 watershed 的输出.
//!
//! 规则顺序是语义的一部分:
//!
//! 1. **边缘规则**: 触及 *开放* tile 边的实例被移除, 其像素记入
//!    to-do 掩膜 (延迟处理, 等调度器重访相邻区域时再完整提取).
//!    与全片物理边界重合的 tile 边是封闭边: 边界外不存在可并入的
//!    组织, 只触封闭边的实例按余下规则正常定稿, 否则这样的实例会
//!    被无限延迟, 调度永不终止;
//! 2. **面积规则**: 过小/过大的实例永久丢弃;
//! 3. **掩膜重叠规则**: 落在组织掩膜内的像素占比过低的实例丢弃;
//! 4. **类别规则**: "脂肪细胞" 类像素占比过低的实例丢弃;
//! 5. **phagocytosis**: 被 2~4 规则腾空的像素中, 被唯一幸存实例
//!    完全包围的连通块并入该实例, 避免实例内出现空洞.
//!
//! 边缘规则必须先行: 它产生的是延迟状态而非永久拒绝,
//! 后续规则只对非边缘实例适用.
//!
//! 规则淘汰不是错误, 以 [`RemovalStats`] 计数返回并记入日志.

use crate::consts::{bin, class, label};
use crate::error::ConfigError;
use crate::geom::EdgeSet;
use crate::instance::LabelMap;
use crate::morph;
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeSet;

/// 清理参数.
#[derive(Clone, Debug, PartialEq)]
pub struct CleanParams {
    /// 实例最小面积 (像素, 含).
    pub min_cell_area: usize,

    /// 实例最大面积 (像素, 含).
    pub max_cell_area: usize,

    /// 实例落在组织掩膜内的最低像素占比.
    pub min_mask_overlap: f64,

    /// 是否启用 phagocytosis 填充.
    pub phagocytosis: bool,

    /// 实例内 "脂肪细胞" 类像素的最低占比.
    pub min_class_prop: f64,
}

impl Default for CleanParams {
    fn default() -> Self {
        Self {
            min_cell_area: 1_500,
            max_cell_area: 100_000,
            min_mask_overlap: 0.8,
            phagocytosis: true,
            min_class_prop: 0.5,
        }
    }
}

impl CleanParams {
    /// 校验参数合法性.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_cell_area == 0 {
            return Err(ConfigError::NonPositiveArea {
                which: "min_cell_area",
            });
        }
        if self.max_cell_area == 0 {
            return Err(ConfigError::NonPositiveArea {
                which: "max_cell_area",
            });
        }
        if self.min_cell_area >= self.max_cell_area {
            return Err(ConfigError::AreaBoundsInverted {
                min: self.min_cell_area,
                max: self.max_cell_area,
            });
        }
        for (which, value) in [
            ("min_mask_overlap", self.min_mask_overlap),
            ("min_class_prop", self.min_class_prop),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::FractionOutOfRange { which, value });
            }
        }
        Ok(())
    }
}

/// 各规则的淘汰计数. 不是错误, 是观测指标.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemovalStats {
    /// 边缘规则延迟的实例数.
    pub edge: usize,

    /// 面积过小而丢弃的实例数.
    pub too_small: usize,

    /// 面积过大而丢弃的实例数.
    pub too_big: usize,

    /// 掩膜重叠不足而丢弃的实例数.
    pub low_mask_overlap: usize,

    /// 类别占比不足而丢弃的实例数.
    pub low_class_prop: usize,

    /// phagocytosis 并入幸存实例的像素数.
    pub phagocytosed_px: usize,
}

impl RemovalStats {
    /// 累加另一份计数 (用于跨 tile 汇总).
    pub fn absorb(&mut self, other: &RemovalStats) {
        self.edge += other.edge;
        self.too_small += other.too_small;
        self.too_big += other.too_big;
        self.low_mask_overlap += other.low_mask_overlap;
        self.low_class_prop += other.low_class_prop;
        self.phagocytosed_px += other.phagocytosed_px;
    }
}

/// 就地清理标签图.
///
/// `mask` 是 tile 局部的组织掩膜; `class_map` 是逐像素类别图
/// (取值见 [`crate::consts::class`]), `None` 时跳过类别规则.
/// 形状必须与标签图一致, 否则 panic.
///
/// `open_edges` 是 tile 的开放边集合: 只有触及开放边的实例才被
/// 边缘规则延迟. 单 tile 处理 (tile 即全图) 时传
/// [`EdgeSet::default`], 让所有触边实例照常定稿;
/// 调度场景下由驱动循环按 tile 与全片边界的重合情况给出.
///
/// 返回 to-do 掩膜 (边缘实例的像素) 与淘汰计数.
pub fn clean(
    labels: &mut LabelMap,
    mask: ArrayView2<u8>,
    class_map: Option<ArrayView2<u8>>,
    open_edges: EdgeSet,
    params: &CleanParams,
) -> (Array2<u8>, RemovalStats) {
    assert_eq!(labels.shape(), mask.dim());
    if let Some(cm) = class_map {
        assert_eq!(labels.shape(), cm.dim());
    }

    let mut todo_edge = Array2::<u8>::zeros(labels.shape());
    let mut vacated = Array2::<u8>::zeros(labels.shape());
    let mut stats = RemovalStats::default();

    for stat in labels.stats() {
        // 1. 边缘规则: 延迟, 不参与后续规则. 只有开放边才可延迟.
        if stat.edges.intersects(&open_edges) {
            for pos in labels.remove(stat.id) {
                todo_edge[pos] = bin::ON;
            }
            stats.edge += 1;
            continue;
        }

        // 2. 面积规则.
        let discard = if stat.area_px < params.min_cell_area {
            stats.too_small += 1;
            true
        } else if stat.area_px > params.max_cell_area {
            stats.too_big += 1;
            true
        } else if mask_overlap(labels, mask, stat.id, stat.area_px) < params.min_mask_overlap {
            // 3. 掩膜重叠规则.
            stats.low_mask_overlap += 1;
            true
        } else if let Some(cm) = class_map {
            // 4. 类别规则.
            if class_proportion(labels, cm, stat.id, stat.area_px) < params.min_class_prop {
                stats.low_class_prop += 1;
                true
            } else {
                false
            }
        } else {
            false
        };

        if discard {
            for pos in labels.remove(stat.id) {
                vacated[pos] = bin::ON;
            }
        }
    }

    // 5. phagocytosis.
    if params.phagocytosis {
        stats.phagocytosed_px = phagocytose(labels, vacated.view());
    }

    log::debug!(
        "清理: 延迟 {} 个边缘实例, 丢弃 {}/{}/{}/{} (过小/过大/低重叠/低类别占比), 填充 {} 像素",
        stats.edge,
        stats.too_small,
        stats.too_big,
        stats.low_mask_overlap,
        stats.low_class_prop,
        stats.phagocytosed_px
    );
    (todo_edge, stats)
}

/// 实例落在组织掩膜内的像素占比.
fn mask_overlap(labels: &LabelMap, mask: ArrayView2<u8>, id: u32, area: usize) -> f64 {
    let inside = labels
        .pixels_of(id)
        .into_iter()
        .filter(|&pos| bin::is_on(mask[pos]))
        .count();
    inside as f64 / area as f64
}

/// 实例内 "脂肪细胞" 类像素的占比. 定稿时也据此决定实例的类别标签.
pub(crate) fn class_proportion(
    labels: &LabelMap,
    class_map: ArrayView2<u8>,
    id: u32,
    area: usize,
) -> f64 {
    let cell = labels
        .pixels_of(id)
        .into_iter()
        .filter(|&pos| class_map[pos] == class::CELL)
        .count();
    cell as f64 / area as f64
}

/// 把被唯一幸存实例完全包围的腾空连通块并入该实例.
///
/// 连通块只要有一个像素与背景或图像边界相邻, 或与两个及以上不同
/// 实例相邻, 就保持背景. 返回并入的像素总数.
fn phagocytose(labels: &mut LabelMap, vacated: ArrayView2<u8>) -> usize {
    let (h, w) = labels.shape();
    let mut filled = 0usize;

    for component in morph::connected_components(vacated) {
        let mut neighbors: BTreeSet<u32> = BTreeSet::new();
        let mut sealed = true;

        'comp: for &(ph, pw) in component.iter() {
            if ph == 0 || pw == 0 || ph + 1 == h || pw + 1 == w {
                sealed = false;
                break;
            }
            for (nh, nw) in [(ph - 1, pw), (ph + 1, pw), (ph, pw - 1), (ph, pw + 1)] {
                if bin::is_on(vacated[(nh, nw)]) {
                    continue; // 同一腾空区域
                }
                let neighbor = labels.label_at((nh, nw));
                if label::is_background(neighbor) {
                    sealed = false;
                    break 'comp;
                }
                neighbors.insert(neighbor);
                if neighbors.len() > 1 {
                    sealed = false;
                    break 'comp;
                }
            }
        }

        if sealed && neighbors.len() == 1 {
            let id = *neighbors.iter().next().unwrap();
            filled += component.len();
            for pos in component {
                labels.set_label(pos, id);
            }
        }
    }
    filled
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn params() -> CleanParams {
        CleanParams {
            min_cell_area: 3,
            max_cell_area: 50,
            min_mask_overlap: 0.8,
            phagocytosis: false,
            min_class_prop: 0.5,
        }
    }

    fn square(labels: &mut LabelMap, id: u32, (fh, fw): (usize, usize), side: usize) {
        for ph in fh..fh + side {
            for pw in fw..fw + side {
                labels.set_label((ph, pw), id);
            }
        }
    }

    #[test]
    fn test_validate() {
        assert!(CleanParams::default().validate().is_ok());
        assert!(CleanParams {
            min_cell_area: 0,
            ..params()
        }
        .validate()
        .is_err());
        assert!(CleanParams {
            min_cell_area: 60,
            ..params()
        }
        .validate()
        .is_err());
        assert!(CleanParams {
            min_mask_overlap: 1.5,
            ..params()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_edge_rule_defers_not_discards() {
        let mut labels = LabelMap::new_background((10, 10));
        square(&mut labels, 1, (0, 3), 2); // 触上边界, 面积 4 本身合格
        square(&mut labels, 2, (4, 4), 3);
        let mask = Array2::<u8>::ones((10, 10));
        let (todo, stats) = clean(&mut labels, mask.view(), None, EdgeSet::ALL, &params());
        assert_eq!(stats.edge, 1);
        assert_eq!(labels.ids(), vec![2]);
        assert_eq!(todo.iter().filter(|&&p| p == 1).count(), 4);
        assert_eq!(todo[(0, 3)], 1);
    }

    #[test]
    fn test_closed_edge_does_not_defer() {
        // tile 上边与全片物理边界重合 (封闭边): 触上边的实例不延迟,
        // 按余下规则正常定稿.
        let mut labels = LabelMap::new_background((10, 10));
        square(&mut labels, 1, (0, 3), 2);
        let mask = Array2::<u8>::ones((10, 10));
        let open = EdgeSet {
            top: false,
            ..EdgeSet::ALL
        };
        let (todo, stats) = clean(&mut labels, mask.view(), None, open, &params());
        assert_eq!(stats.edge, 0);
        assert_eq!(labels.ids(), vec![1]);
        assert!(todo.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_two_large_discs_full_scale() {
        // 1000x1000 tile 上两个半径 50 的圆: 两个实例,
        // 面积都接近 pi * 50^2 (约 7854 像素).
        let shape = (1000, 1000);
        let mut dmap = Array2::<f32>::zeros(shape);
        for (ch, cw) in [(300.0, 300.0), (300.0, 700.0)] {
            for ((ph, pw), v) in dmap.indexed_iter_mut() {
                let dist = ((ph as f64 - ch).powi(2) + (pw as f64 - cw).powi(2)).sqrt();
                if dist < 50.0 {
                    *v = v.max((50.0 - dist) as f32);
                }
            }
        }
        let contour = dmap.mapv(|v| 1.0 / (1.0 + v));
        let mask = dmap.mapv(|v| u8::from(v > 0.0));

        let mut labels = crate::extract(
            dmap.view(),
            contour.view(),
            mask.view(),
            &crate::ExtractParams::default(),
        );
        let p = CleanParams {
            min_cell_area: 1_500,
            ..CleanParams::default()
        };
        let (_, stats) = clean(&mut labels, mask.view(), None, EdgeSet::ALL, &p);
        assert_eq!(stats, RemovalStats::default());

        let stats = labels.stats();
        assert_eq!(stats.len(), 2);
        let expected = std::f64::consts::PI * 50.0 * 50.0;
        for stat in &stats {
            let err = (stat.area_px as f64 - expected).abs();
            assert!(err < 200.0, "面积 {} 偏离 {expected}", stat.area_px);
        }
    }

    #[test]
    fn test_size_rule() {
        let mut labels = LabelMap::new_background((16, 16));
        square(&mut labels, 1, (2, 2), 1); // 面积 1 < 3
        square(&mut labels, 2, (2, 6), 8); // 面积 64 > 50
        square(&mut labels, 3, (12, 2), 3); // 合格
        let mask = Array2::<u8>::ones((16, 16));
        let (todo, stats) = clean(&mut labels, mask.view(), None, EdgeSet::ALL, &params());
        assert_eq!((stats.too_small, stats.too_big), (1, 1));
        assert_eq!(labels.ids(), vec![3]);
        // 面积淘汰是永久丢弃, 不进 to-do.
        assert!(todo.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_mask_overlap_rule() {
        let mut labels = LabelMap::new_background((10, 10));
        square(&mut labels, 1, (2, 2), 3);
        let mut mask = Array2::<u8>::ones((10, 10));
        // 9 像素中 5 个落在掩膜外: 重叠 4/9 < 0.8.
        for &pos in &[(2, 2), (2, 3), (2, 4), (3, 2), (3, 3)] {
            mask[pos] = 0;
        }
        let (_, stats) = clean(&mut labels, mask.view(), None, EdgeSet::ALL, &params());
        assert_eq!(stats.low_mask_overlap, 1);
        assert!(labels.ids().is_empty());
    }

    #[test]
    fn test_class_rule() {
        let mut labels = LabelMap::new_background((10, 10));
        square(&mut labels, 1, (2, 2), 3);
        let mask = Array2::<u8>::ones((10, 10));
        let mut cm = Array2::<u8>::from_elem((10, 10), class::OTHER);
        cm[(2, 2)] = class::CELL; // 1/9 < 0.5
        let (_, stats) = clean(&mut labels, mask.view(), Some(cm.view()), EdgeSet::ALL, &params());
        assert_eq!(stats.low_class_prop, 1);
        assert!(labels.ids().is_empty());

        // class_map 缺省时跳过类别规则.
        let mut labels = LabelMap::new_background((10, 10));
        square(&mut labels, 1, (2, 2), 3);
        let (_, stats) = clean(&mut labels, mask.view(), None, EdgeSet::ALL, &params());
        assert_eq!(stats.low_class_prop, 0);
        assert_eq!(labels.ids(), vec![1]);
    }

    #[test]
    fn test_phagocytosis_fills_enclosed_hole() {
        // 实例 1 是 5x5 环, 中心 1x1 是被丢弃实例 9 腾空的像素.
        let mut labels = LabelMap::new_background((9, 9));
        square(&mut labels, 1, (2, 2), 5);
        labels.set_label((4, 4), 9); // 面积 1, 会被面积规则丢弃
        let mask = Array2::<u8>::ones((9, 9));
        let p = CleanParams {
            phagocytosis: true,
            min_cell_area: 3,
            ..params()
        };
        let (_, stats) = clean(&mut labels, mask.view(), None, EdgeSet::ALL, &p);
        assert_eq!(stats.too_small, 1);
        assert_eq!(stats.phagocytosed_px, 1);
        assert_eq!(labels.label_at((4, 4)), 1);
    }

    #[test]
    fn test_phagocytosis_leaves_open_components() {
        // 腾空块与背景连通: 不填充.
        let mut labels = LabelMap::new_background((9, 9));
        square(&mut labels, 1, (2, 2), 4);
        labels.set_label((2, 2), 9);
        labels.set_label((2, 3), 9);
        // 9 在环的角上, 其上方是背景.
        let mut m = labels.clone();
        let mask = Array2::<u8>::ones((9, 9));
        let p = CleanParams {
            phagocytosis: true,
            min_cell_area: 3,
            max_cell_area: 50,
            ..params()
        };
        let (_, stats) = clean(&mut m, mask.view(), None, EdgeSet::ALL, &p);
        assert_eq!(stats.phagocytosed_px, 0);
        assert!(label::is_background(m.label_at((2, 2))));
    }

    #[test]
    fn test_small_extra_disc_is_cleaned_away() {
        // 两个正常细胞加一个过小的圆斑: watershed 会如实提取三个实例,
        // 面积规则随后删去小圆斑, 正常细胞不受影响.
        let shape = (40, 80);
        let mut dmap = Array2::<f32>::zeros(shape);
        for (ch, cw, r) in [(20.0, 20.0, 12.0), (20.0, 58.0, 12.0), (30.0, 44.0, 4.0)] {
            for ((ph, pw), v) in dmap.indexed_iter_mut() {
                let dist = ((ph as f64 - ch).powi(2) + (pw as f64 - cw).powi(2)).sqrt();
                if dist < r {
                    *v = v.max((r - dist) as f32);
                }
            }
        }
        let contour = dmap.mapv(|v| 1.0 / (1.0 + v));
        let mask = dmap.mapv(|v| u8::from(v > 0.0));

        let mut labels = crate::extract(
            dmap.view(),
            contour.view(),
            mask.view(),
            &crate::ExtractParams::default(),
        );
        assert_eq!(labels.ids().len(), 3);

        let p = CleanParams {
            min_cell_area: 100,
            max_cell_area: 5_000,
            min_mask_overlap: 0.8,
            phagocytosis: false,
            min_class_prop: 0.5,
        };
        let (_, stats) = clean(&mut labels, mask.view(), None, EdgeSet::ALL, &p);
        assert_eq!(stats.too_small, 1);
        assert_eq!(labels.ids().len(), 2);
    }

    #[test]
    fn test_clean_is_idempotent_on_clean_input() {
        let mut labels = LabelMap::new_background((16, 16));
        square(&mut labels, 1, (4, 4), 4);
        let mask = Array2::<u8>::ones((16, 16));
        let (_, s1) = clean(&mut labels, mask.view(), None, EdgeSet::ALL, &params());
        let snapshot = labels.clone();
        let (_, s2) = clean(&mut labels, mask.view(), None, EdgeSet::ALL, &params());
        assert_eq!(s1, RemovalStats::default());
        assert_eq!(s2, RemovalStats::default());
        assert_eq!(labels, snapshot);
    }
}
