//! 全片驱动循环.
//!
//! 把六个阶段按固定顺序串成单线程的顺序流水线:
//! 粗掩膜 -> (调度 -> 级联推理 -> 实例提取 -> 清理 -> 边界修正
//! -> 合并) 循环 -> 汇总. 不存在 tile 级并行: 每个 tile 的调度
//! 决策依赖上一个 tile 写回后的掩膜, 这是显式的数据依赖链.
//! 模型内部怎么并行是推理后端的事, 不影响 tile 顺序.
//!
//! 跨 tile 的全局不变式由三条机制共同保证:
//!
//! 1. 非边缘实例接受后, 其所在低分辨率区域被调度器清零,
//!    后续 tile 的组织掩膜不再包含它 (掩膜重叠规则会拒绝重提取);
//! 2. 边缘实例延迟, 其像素写回 to-do 掩膜, 由包含完整实例的
//!    后续 tile 重新提取. 与全片物理边界重合的 tile 边不算
//!    边缘: 贴着全片边界的实例永远无法被 "更完整" 地重提取,
//!    延迟它会让调度反复选中同一 tile 而不终止;
//! 3. 实例标签由全局单调计数器分配, 跨 tile 不重复.

use crate::cascade::InferenceContext;
use crate::clean::{clean, CleanParams, RemovalStats};
use crate::consts::{bin, class, PROB_THRESHOLD};
use crate::correct::{correct, CorrectionParams};
use crate::error::{ConfigError, PipelineResult};
use crate::geom::EdgeSet;
use crate::instance::{extract, ExtractParams};
use crate::mask::{rough_foreground_mask, CoarseMaskParams, TissueMask};
use crate::morph;
use crate::slide::Slide;
use crate::tile::{Tile, TileParams, TileScheduler};
use crate::Idx2d;
use ndarray::Array2;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 流水线全部参数.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineParams {
    /// 粗组织掩膜参数.
    pub coarse: CoarseMaskParams,

    /// tile 调度参数.
    pub tile: TileParams,

    /// 实例提取参数.
    pub extract: ExtractParams,

    /// 分割清理参数.
    pub clean: CleanParams,

    /// 边界修正参数.
    pub correction: CorrectionParams,
}

impl PipelineParams {
    /// 校验所有参数. 任何 tile 开始处理之前的快速失败点.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coarse.validate()?;
        self.tile.validate()?;
        self.clean.validate()?;
        self.correction.validate()?;
        Ok(())
    }
}

/// 一个已定稿的细胞实例 (全片坐标).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SlideInstance {
    /// 全片唯一的实例编号.
    pub id: u32,

    /// 面积 (全分辨率像素).
    pub area_px: usize,

    /// 物理面积 (平方微米).
    pub area_um2: f64,

    /// 有序轮廓多边形, 全片全分辨率坐标.
    pub contour: Vec<Idx2d>,

    /// 类别 (见 [`crate::consts::class`]).
    pub class_label: u8,
}

/// 每处理完一个 tile 的进度汇报.
pub struct StepReport<'a> {
    /// tile 序号 (从 0 起).
    pub tile_index: usize,

    /// 刚处理完的 tile.
    pub tile: Tile,

    /// 写回后掩膜的残余组织像素数.
    pub remaining: usize,

    /// 本 tile 的淘汰计数.
    pub removal: RemovalStats,

    /// 本 tile 新定稿的实例.
    pub new_instances: &'a [SlideInstance],

    /// 写回后的掩膜 (断点续跑的持久化素材).
    pub mask: &'a TissueMask,
}

/// 全片处理结果.
#[derive(Clone, Debug, PartialEq)]
pub struct SlideOutcome {
    /// 所有定稿实例, 按编号升序.
    pub instances: Vec<SlideInstance>,

    /// 处理过的 tile 数.
    pub tiles_processed: usize,

    /// 全片累计的淘汰计数.
    pub removal: RemovalStats,
}

/// 从头分割一张全片图像.
///
/// `on_step` 在每个 tile 写回之后调用一次, 可用于打日志、
/// 汇报进度或写断点 (见 [`crate::persist`]).
pub fn segment_slide<S: Slide>(
    slide: &S,
    ctx: &mut InferenceContext,
    params: &PipelineParams,
    on_step: impl FnMut(&StepReport<'_>),
) -> PipelineResult<SlideOutcome> {
    params.validate()?;
    let thumb = slide.thumbnail(params.coarse.downsample_factor);
    let mask = rough_foreground_mask(thumb.view(), &params.coarse);
    segment_slide_with_mask(slide, ctx, params, mask, 1, on_step)
}

/// 从给定掩膜状态开始分割 (断点续跑入口).
///
/// `first_instance_id` 是分配给下一个定稿实例的编号,
/// 续跑时取断点里记录的值以保持全片编号连续.
/// 掩膜形状必须与切片按降采样因子的缩略图一致, 否则 panic.
pub fn segment_slide_with_mask<S: Slide>(
    slide: &S,
    ctx: &mut InferenceContext,
    params: &PipelineParams,
    mask: TissueMask,
    first_instance_id: u32,
    mut on_step: impl FnMut(&StepReport<'_>),
) -> PipelineResult<SlideOutcome> {
    params.validate()?;
    let factor = params.coarse.downsample_factor;
    let (sh, sw) = slide.shape();
    let expected = (
        (sh as f64 / factor).ceil() as usize,
        (sw as f64 / factor).ceil() as usize,
    );
    assert_eq!(mask.shape(), expected, "掩膜形状与切片不符");

    let pixel_area = slide.pixel_size().pixel_area_um2();
    let mut scheduler = TileScheduler::new(mask, &params.tile, factor, (sh, sw))?;

    let mut instances: Vec<SlideInstance> = Vec::new();
    let mut next_id = first_instance_id;
    let mut total_removal = RemovalStats::default();
    let mut tile_index = 0usize;

    while let Some(tile) = scheduler.next_tile()? {
        log::debug!(
            "tile #{tile_index}: 全分辨率 {:?}, 残余组织 {} 像素",
            tile.fullres,
            scheduler.remaining()
        );

        let rgb = slide.read_region(&tile.fullres);
        let pred = ctx.run_cascade(rgb.view())?;

        // tile 局部的全分辨率组织掩膜: 低分辨率区域的最近邻放大.
        let tile_mask = morph::resize_nearest_u8(
            scheduler.mask().region(&tile.lores),
            tile.fullres.shape(),
        );

        let mut labels = extract(
            pred.dmap.view(),
            pred.contour.view(),
            tile_mask.view(),
            &params.extract,
        );

        let class_map = pred.class_prob.mapv(|p| {
            if p >= PROB_THRESHOLD {
                class::CELL
            } else {
                class::OTHER
            }
        });
        let (todo_edge, removal) = clean(
            &mut labels,
            tile_mask.view(),
            Some(class_map.view()),
            open_edges(&tile, (sh, sw)),
            &params.clean,
        );

        if let Some(model) = ctx.correction.as_mut() {
            correct(rgb.view(), &mut labels, model.as_mut(), &params.correction)?;
        }

        // 定稿: 局部实例换算到全片坐标, 分配全局编号, 类别取多数.
        let first_new = instances.len();
        for stat in labels.stats() {
            let contour = labels
                .trace_contour(stat.id)
                .into_iter()
                .map(|pos| tile.fullres.to_global(pos))
                .collect();
            let cell_prop =
                crate::clean::class_proportion(&labels, class_map.view(), stat.id, stat.area_px);
            instances.push(SlideInstance {
                id: next_id,
                area_px: stat.area_px,
                area_um2: stat.area_px as f64 * pixel_area,
                contour,
                class_label: if cell_prop >= 0.5 {
                    class::CELL
                } else {
                    class::OTHER
                },
            });
            next_id += 1;
        }

        scheduler.complete_tile(&tile, downsample_todo(&todo_edge, &tile, factor).view());
        ctx.release_all();
        total_removal.absorb(&removal);

        on_step(&StepReport {
            tile_index,
            tile,
            remaining: scheduler.remaining(),
            removal,
            new_instances: &instances[first_new..],
            mask: scheduler.mask(),
        });
        tile_index += 1;
    }

    log::info!(
        "全片完成: {} 个 tile, {} 个实例, 延迟 {} 次边缘实例",
        tile_index,
        instances.len(),
        total_removal.edge
    );
    Ok(SlideOutcome {
        instances,
        tiles_processed: tile_index,
        removal: total_removal,
    })
}

/// tile 的开放边集合: 不与全片物理边界重合的边才是开放边.
fn open_edges(tile: &Tile, slide_shape: Idx2d) -> EdgeSet {
    EdgeSet {
        top: tile.fullres.first_row > 0,
        bottom: tile.fullres.last_row < slide_shape.0,
        left: tile.fullres.first_col > 0,
        right: tile.fullres.last_col < slide_shape.1,
    }
}

/// 把 tile 局部的全分辨率 to-do 掩膜降到低分辨率网格:
/// 低分辨率格子只要盖住任何一个 to-do 像素就置 1.
fn downsample_todo(todo: &Array2<u8>, tile: &Tile, factor: f64) -> Array2<u8> {
    debug_assert_eq!(todo.dim(), tile.fullres.shape());
    let mut out = Array2::<u8>::zeros(tile.lores.shape());
    for (pos, &p) in todo.indexed_iter() {
        if !bin::is_on(p) {
            continue;
        }
        let global = tile.fullres.to_global(pos);
        let lores = (
            (global.0 as f64 / factor).floor() as usize,
            (global.1 as f64 / factor).floor() as usize,
        );
        if tile.lores.contains(lores) {
            out[tile.lores.to_local(lores)] = bin::ON;
        }
    }
    out
}
