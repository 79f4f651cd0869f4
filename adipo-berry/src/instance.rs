//! 实例提取: 从逐像素预测到互不重叠的细胞实例.
//!
//! 算法是 marker watershed: dmap 的局部极大值做种子 (每个种子一个
//! 实例标签), 轮廓概率做高程面, 以优先队列从低到高泛洪, 直到掩膜内
//! 所有像素都归属某个种子. 轮廓概率高的位置泛洪得晚, 自然形成实例
//! 之间的分水岭.
//!
//! 浮点输入相同则输出逐位相同; 高程相等时按入堆顺序决出先后,
//! 这是实现选择而非数学性质 (种子顺序改变会改变平局结果).

use crate::consts::{bin, label, PROB_THRESHOLD};
use crate::geom::{EdgeSet, TileLocalRect};
use crate::{morph, Idx2d};
use binary_heap_plus::BinaryHeap;
use ndarray::{Array2, ArrayView2};
use ordered_float::NotNan;
use std::collections::BTreeMap;

/// 实例提取参数.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractParams {
    /// 种子的最低 dmap 值 (不含). 低于它的局部极大值不做种子.
    pub fg_threshold: f32,

    /// 分界脊的膨胀半径 (像素). 增大它偏向欠分割, 减小偏向过分割.
    pub border_dilation: usize,
}

impl Default for ExtractParams {
    fn default() -> Self {
        Self {
            fg_threshold: PROB_THRESHOLD,
            border_dilation: 0,
        }
    }
}

/// 实例标签图. `0` 是背景, 正数是实例标签.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMap {
    data: Array2<u32>,
}

/// 单个实例的汇总统计.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceStat {
    /// 实例标签.
    pub id: u32,

    /// 面积 (像素).
    pub area_px: usize,

    /// 外接矩形 (tile 局部坐标, 半开区间).
    pub bbox: TileLocalRect,

    /// 实例接触的 tile 边集合.
    pub edges: EdgeSet,
}

impl LabelMap {
    /// 构造全背景的标签图.
    pub fn new_background(shape: Idx2d) -> Self {
        Self {
            data: Array2::from_elem(shape, label::BACKGROUND),
        }
    }

    /// 从现成的标签数组构造.
    #[inline]
    pub fn from_raw(data: Array2<u32>) -> Self {
        Self { data }
    }

    /// 直接获得底层数据.
    #[inline]
    pub fn into_raw(self) -> Array2<u32> {
        self.data
    }

    /// 标签图的形状 (高, 宽).
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.data.dim()
    }

    /// 底层数据的只读视图.
    #[inline]
    pub fn view(&self) -> ArrayView2<'_, u32> {
        self.data.view()
    }

    /// 指定位置的标签.
    #[inline]
    pub fn label_at(&self, pos: Idx2d) -> u32 {
        self.data[pos]
    }

    /// 写入指定位置的标签.
    #[inline]
    pub fn set_label(&mut self, pos: Idx2d, id: u32) {
        self.data[pos] = id;
    }

    /// 所有实例标签, 升序.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .data
            .iter()
            .copied()
            .filter(|&p| label::is_instance(p))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// 指定实例的所有像素, 行优先序.
    pub fn pixels_of(&self, id: u32) -> Vec<Idx2d> {
        assert!(label::is_instance(id));
        self.data
            .indexed_iter()
            .filter_map(|(pos, &p)| (p == id).then_some(pos))
            .collect()
    }

    /// 删除指定实例, 返回腾空的像素 (行优先序).
    pub fn remove(&mut self, id: u32) -> Vec<Idx2d> {
        let pixels = self.pixels_of(id);
        for &pos in pixels.iter() {
            self.data[pos] = label::BACKGROUND;
        }
        pixels
    }

    /// 一趟扫描得出所有实例的汇总统计, 按标签升序.
    pub fn stats(&self) -> Vec<InstanceStat> {
        let (h, w) = self.shape();
        struct Acc {
            area: usize,
            first: Idx2d,
            last: Idx2d,
            edges: EdgeSet,
        }
        let mut accs: BTreeMap<u32, Acc> = BTreeMap::new();
        for ((ph, pw), &p) in self.data.indexed_iter() {
            if label::is_background(p) {
                continue;
            }
            let acc = accs.entry(p).or_insert(Acc {
                area: 0,
                first: (ph, pw),
                last: (ph, pw),
                edges: EdgeSet::default(),
            });
            acc.area += 1;
            acc.first = (acc.first.0.min(ph), acc.first.1.min(pw));
            acc.last = (acc.last.0.max(ph), acc.last.1.max(pw));
            acc.edges.top |= ph == 0;
            acc.edges.bottom |= ph + 1 == h;
            acc.edges.left |= pw == 0;
            acc.edges.right |= pw + 1 == w;
        }
        accs.into_iter()
            .map(|(id, acc)| InstanceStat {
                id,
                area_px: acc.area,
                bbox: TileLocalRect::new(acc.first.0, acc.first.1, acc.last.0 + 1, acc.last.1 + 1),
                edges: acc.edges,
            })
            .collect()
    }

    /// Moore 邻域边界跟踪, 返回实例的有序轮廓多边形 (闭合, 不重复首点).
    ///
    /// 实例不存在时返回空向量. 要求 `id` 是实例标签, 否则 panic.
    pub fn trace_contour(&self, id: u32) -> Vec<Idx2d> {
        assert!(label::is_instance(id));
        // 顺时针 8 方向: N, NE, E, SE, S, SW, W, NW.
        const DIRS: [(isize, isize); 8] = [
            (-1, 0),
            (-1, 1),
            (0, 1),
            (1, 1),
            (1, 0),
            (1, -1),
            (0, -1),
            (-1, -1),
        ];
        let (h, w) = self.shape();
        let step = |(ph, pw): Idx2d, d: usize| -> Option<Idx2d> {
            let nh = ph as isize + DIRS[d].0;
            let nw = pw as isize + DIRS[d].1;
            (nh >= 0 && nw >= 0 && (nh as usize) < h && (nw as usize) < w)
                .then_some((nh as usize, nw as usize))
        };

        let Some(start) = self
            .data
            .indexed_iter()
            .find_map(|(pos, &p)| (p == id).then_some(pos))
        else {
            return Vec::new();
        };

        let area = self.data.iter().filter(|&&p| p == id).count();
        let mut contour = vec![start];
        let mut cur = start;
        // 行优先首像素的西侧必为背景, 从西侧回溯开始扫描.
        let mut backtrack = 6usize;
        let mut first_move: Option<(Idx2d, usize)> = None;

        for _ in 0..4 * area + 8 {
            let mut next = None;
            for i in 1..=8 {
                let d = (backtrack + i) % 8;
                if let Some(n) = step(cur, d) {
                    if self.data[n] == id {
                        next = Some((n, d));
                        break;
                    }
                }
            }
            let Some((n, d)) = next else {
                break; // 孤立单像素
            };
            if cur == start {
                match first_move {
                    None => first_move = Some((n, d)),
                    Some(fm) if fm == (n, d) => break,
                    _ => {}
                }
            }
            if n != start {
                contour.push(n);
            }
            backtrack = (d + 4) % 8;
            cur = n;
        }
        contour
    }
}

/// marker watershed 实例提取.
///
/// 三个输入的形状必须一致, 否则 panic. 掩膜外的像素保持背景.
pub fn extract(
    dmap: ArrayView2<f32>,
    contour: ArrayView2<f32>,
    mask: ArrayView2<u8>,
    params: &ExtractParams,
) -> LabelMap {
    assert_eq!(dmap.dim(), contour.dim());
    assert_eq!(dmap.dim(), mask.dim());
    let (h, w) = dmap.dim();

    // 分界脊: 高轮廓概率的像素, 可选膨胀. 脊上高程抬升 1,
    // 保证泛洪最后才越过分界.
    let ridge_raw = contour.mapv(|p| if p >= PROB_THRESHOLD { bin::ON } else { bin::OFF });
    let ridge = morph::binary_dilate(ridge_raw.view(), params.border_dilation);
    let elevation = |pos: Idx2d| -> NotNan<f32> {
        let boost = if bin::is_on(ridge[pos]) { 1.0 } else { 0.0 };
        NotNan::new(contour[pos] + boost).expect("轮廓概率不含 NaN")
    };

    // 种子: 掩膜内 dmap 的 8-邻域局部极大值, 等值平台只留行优先首像素.
    let mut candidate = Array2::<u8>::zeros((h, w));
    for ((ph, pw), &v) in dmap.indexed_iter() {
        if !bin::is_on(mask[(ph, pw)]) || v <= params.fg_threshold {
            continue;
        }
        let mut is_max = true;
        'scan: for dh in -1isize..=1 {
            for dw in -1isize..=1 {
                if dh == 0 && dw == 0 {
                    continue;
                }
                let nh = ph as isize + dh;
                let nw = pw as isize + dw;
                if nh >= 0 && nw >= 0 && (nh as usize) < h && (nw as usize) < w {
                    let n = (nh as usize, nw as usize);
                    if bin::is_on(mask[n]) && dmap[n] > v {
                        is_max = false;
                        break 'scan;
                    }
                }
            }
        }
        if is_max {
            candidate[(ph, pw)] = bin::ON;
        }
    }

    let mut labels = LabelMap::new_background((h, w));
    type Item = (NotNan<f32>, u64, Idx2d, u32);
    let mut heap: BinaryHeap<Item, _> =
        BinaryHeap::new_by(|a: &Item, b: &Item| (b.0, b.1).cmp(&(a.0, a.1)));
    let mut seq = 0u64;

    for (idx, plateau) in morph::connected_components(candidate.view())
        .into_iter()
        .enumerate()
    {
        let id = idx as u32 + 1;
        let seed = plateau[0]; // 行优先首像素
        heap.push((elevation(seed), seq, seed, id));
        seq += 1;
    }

    while let Some((_, _, pos, id)) = heap.pop() {
        if label::is_instance(labels.label_at(pos)) {
            continue;
        }
        labels.set_label(pos, id);

        let (ph, pw) = pos;
        let mut push = |n: Idx2d, heap: &mut BinaryHeap<Item, _>| {
            if bin::is_on(mask[n]) && label::is_background(labels.label_at(n)) {
                heap.push((elevation(n), seq, n, id));
                seq += 1;
            }
        };
        if ph > 0 {
            push((ph - 1, pw), &mut heap);
        }
        if ph + 1 < h {
            push((ph + 1, pw), &mut heap);
        }
        if pw > 0 {
            push((ph, pw - 1), &mut heap);
        }
        if pw + 1 < w {
            push((ph, pw + 1), &mut heap);
        }
    }
    labels
}
