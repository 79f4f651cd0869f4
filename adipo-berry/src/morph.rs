//! 二值图像的形态学与基础图像操作.
//!
//! 掩膜统一以 `Array2<u8>` 的 0/1 存储 (见 [`crate::consts::bin`]).
//! 所有算法都是确定性的: 相同输入产生相同输出.

use crate::consts::bin;
use crate::{Area2d, Areas2d, Idx2d};
use itertools::iproduct;
use ndarray::{Array2, ArrayView2};
use std::collections::VecDeque;

/// 生成半径为 `radius` 的圆盘结构元的偏移集合 (含圆心).
///
/// 偏移按行优先顺序排列.
pub fn disk_offsets(radius: usize) -> Vec<(isize, isize)> {
    let r = radius as isize;
    let r2 = r * r;
    let mut ans = Vec::with_capacity((2 * radius + 1).pow(2));
    for (dh, dw) in iproduct!(-r..=r, -r..=r) {
        if dh * dh + dw * dw <= r2 {
            ans.push((dh, dw));
        }
    }
    ans
}

/// 以半径为 `radius` 的圆盘结构元膨胀二值掩膜.
///
/// `radius == 0` 时原样返回拷贝.
pub fn binary_dilate(mask: ArrayView2<u8>, radius: usize) -> Array2<u8> {
    if radius == 0 {
        return mask.to_owned();
    }
    let (h, w) = mask.dim();
    let offsets = disk_offsets(radius);
    let mut out = Array2::<u8>::zeros((h, w));
    for ((ph, pw), &pix) in mask.indexed_iter() {
        if !bin::is_on(pix) {
            continue;
        }
        for &(dh, dw) in offsets.iter() {
            let nh = ph as isize + dh;
            let nw = pw as isize + dw;
            if nh >= 0 && nw >= 0 && (nh as usize) < h && (nw as usize) < w {
                out[(nh as usize, nw as usize)] = bin::ON;
            }
        }
    }
    out
}

/// 以半径为 `radius` 的圆盘结构元腐蚀二值掩膜.
///
/// 图像边界以外视为背景 (即边界像素会被腐蚀).
pub fn binary_erode(mask: ArrayView2<u8>, radius: usize) -> Array2<u8> {
    if radius == 0 {
        return mask.to_owned();
    }
    let (h, w) = mask.dim();
    let offsets = disk_offsets(radius);
    let mut out = Array2::<u8>::zeros((h, w));
    for ((ph, pw), &pix) in mask.indexed_iter() {
        if !bin::is_on(pix) {
            continue;
        }
        let keep = offsets.iter().all(|&(dh, dw)| {
            let nh = ph as isize + dh;
            let nw = pw as isize + dw;
            nh >= 0
                && nw >= 0
                && (nh as usize) < h
                && (nw as usize) < w
                && bin::is_on(mask[(nh as usize, nw as usize)])
        });
        if keep {
            out[(ph, pw)] = bin::ON;
        }
    }
    out
}

/// 按照 4-相邻规则获取掩膜中所有非零连通区域.
///
/// 区域按其首像素 (行优先序) 的先后排列, 区域内像素亦按发现顺序排列.
pub fn connected_components(mask: ArrayView2<u8>) -> Areas2d {
    let (h, w) = mask.dim();
    let mut visited = Array2::<u8>::zeros((h, w));
    let mut ans = Areas2d::with_capacity(1);
    let mut bfs_q: VecDeque<Idx2d> = VecDeque::with_capacity(4);

    for (pos, &pix) in mask.indexed_iter() {
        if !bin::is_on(pix) || bin::is_on(visited[pos]) {
            continue;
        }
        let mut this_area = Area2d::with_capacity(1);
        visited[pos] = bin::ON;
        bfs_q.push_back(pos);
        while let Some((ch, cw)) = bfs_q.pop_front() {
            this_area.push((ch, cw));

            // bfs
            if ch > 0 && bin::is_on(mask[(ch - 1, cw)]) && !bin::is_on(visited[(ch - 1, cw)]) {
                visited[(ch - 1, cw)] = bin::ON;
                bfs_q.push_back((ch - 1, cw));
            }
            if ch + 1 < h && bin::is_on(mask[(ch + 1, cw)]) && !bin::is_on(visited[(ch + 1, cw)]) {
                visited[(ch + 1, cw)] = bin::ON;
                bfs_q.push_back((ch + 1, cw));
            }
            if cw > 0 && bin::is_on(mask[(ch, cw - 1)]) && !bin::is_on(visited[(ch, cw - 1)]) {
                visited[(ch, cw - 1)] = bin::ON;
                bfs_q.push_back((ch, cw - 1));
            }
            if cw + 1 < w && bin::is_on(mask[(ch, cw + 1)]) && !bin::is_on(visited[(ch, cw + 1)]) {
                visited[(ch, cw + 1)] = bin::ON;
                bfs_q.push_back((ch, cw + 1));
            }
        }
        ans.push(this_area);
    }
    ans
}

/// 就地删除掩膜中面积小于 `min_size` 的非零连通区域.
///
/// 返回被删除的区域个数.
pub fn remove_small_components(mask: &mut Array2<u8>, min_size: usize) -> usize {
    let mut removed = 0usize;
    for area in connected_components(mask.view()) {
        if area.len() < min_size {
            removed += 1;
            for pos in area {
                mask[pos] = bin::OFF;
            }
        }
    }
    removed
}

/// 就地填充掩膜中面积小于 `max_size` 的背景空洞.
///
/// 空洞的定义: 不与图像边界相接的零值连通区域. 返回被填充的空洞个数.
pub fn fill_small_holes(mask: &mut Array2<u8>, max_size: usize) -> usize {
    let (h, w) = mask.dim();
    let inverted = mask.mapv(|p| if bin::is_on(p) { bin::OFF } else { bin::ON });
    let mut filled = 0usize;
    for area in connected_components(inverted.view()) {
        if area.len() >= max_size {
            continue;
        }
        let at_border = area
            .iter()
            .any(|&(ph, pw)| ph == 0 || pw == 0 || ph + 1 == h || pw + 1 == w);
        if at_border {
            continue;
        }
        filled += 1;
        for pos in area {
            mask[pos] = bin::ON;
        }
    }
    filled
}

/// 对 8-bit 灰度图计算 Otsu 阈值 (最大化类间方差).
///
/// 返回的阈值 `t` 的使用约定为: `pix <= t` 判为暗类, `pix > t` 判为亮类.
/// 对全同图像返回该唯一灰度值.
pub fn otsu_threshold(gray: ArrayView2<u8>) -> u8 {
    let mut hist = [0u64; 256];
    for &p in gray.iter() {
        hist[p as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    assert!(total > 0, "不允许空图像");

    let sum_all: f64 = hist
        .iter()
        .enumerate()
        .map(|(v, &c)| v as f64 * c as f64)
        .sum();

    let mut best_t = 0u8;
    let mut best_var = -1.0f64;
    let mut w0 = 0u64;
    let mut sum0 = 0.0f64;
    for t in 0..256usize {
        w0 += hist[t];
        if w0 == 0 {
            continue;
        }
        sum0 += t as f64 * hist[t] as f64;
        let w1 = total - w0;
        if w1 == 0 {
            // 全部像素都已落入暗类: 全同图像, 唯一灰度值即阈值.
            if best_var < 0.0 {
                best_t = t as u8;
            }
            break;
        }
        let mean0 = sum0 / w0 as f64;
        let mean1 = (sum_all - sum0) / w1 as f64;
        let var = w0 as f64 * w1 as f64 * (mean0 - mean1).powi(2);
        if var > best_var {
            best_var = var;
            best_t = t as u8;
        }
    }
    best_t
}

/// 两趟 3-4 倒角 (chamfer) 距离变换.
///
/// 返回每个非零像素到最近零值像素的近似欧氏距离 (单位: 像素),
/// 零值像素处为 0. 图像边界以外视为背景.
pub fn chamfer_distance(mask: ArrayView2<u8>) -> Array2<f32> {
    const STRAIGHT: f32 = 3.0;
    const DIAGONAL: f32 = 4.0;
    let (h, w) = mask.dim();
    let big = ((h + w) as f32) * DIAGONAL;
    let mut d = Array2::<f32>::from_elem((h, w), big);

    for ((ph, pw), &pix) in mask.indexed_iter() {
        if !bin::is_on(pix) || ph == 0 || pw == 0 || ph + 1 == h || pw + 1 == w {
            if !bin::is_on(pix) {
                d[(ph, pw)] = 0.0;
            } else {
                // 边界上的前景像素: 图像外视为背景.
                d[(ph, pw)] = STRAIGHT;
            }
        }
    }

    // 前向趟
    for ph in 0..h {
        for pw in 0..w {
            let mut v = d[(ph, pw)];
            if ph > 0 {
                v = v.min(d[(ph - 1, pw)] + STRAIGHT);
                if pw > 0 {
                    v = v.min(d[(ph - 1, pw - 1)] + DIAGONAL);
                }
                if pw + 1 < w {
                    v = v.min(d[(ph - 1, pw + 1)] + DIAGONAL);
                }
            }
            if pw > 0 {
                v = v.min(d[(ph, pw - 1)] + STRAIGHT);
            }
            d[(ph, pw)] = v;
        }
    }

    // 后向趟
    for ph in (0..h).rev() {
        for pw in (0..w).rev() {
            let mut v = d[(ph, pw)];
            if ph + 1 < h {
                v = v.min(d[(ph + 1, pw)] + STRAIGHT);
                if pw > 0 {
                    v = v.min(d[(ph + 1, pw - 1)] + DIAGONAL);
                }
                if pw + 1 < w {
                    v = v.min(d[(ph + 1, pw + 1)] + DIAGONAL);
                }
            }
            if pw + 1 < w {
                v = v.min(d[(ph, pw + 1)] + STRAIGHT);
            }
            d[(ph, pw)] = v;
        }
    }

    d.mapv_inplace(|v| v / STRAIGHT);
    d
}

/// 最近邻缩放 (u8).
///
/// 要求源图像与目标形状都非空, 否则 panic.
pub fn resize_nearest_u8(src: ArrayView2<u8>, (oh, ow): Idx2d) -> Array2<u8> {
    let (sh, sw) = src.dim();
    assert!(sh > 0 && sw > 0 && oh > 0 && ow > 0);
    Array2::from_shape_fn((oh, ow), |(ph, pw)| {
        let nh = ((ph * sh) / oh).min(sh - 1);
        let nw = ((pw * sw) / ow).min(sw - 1);
        src[(nh, nw)]
    })
}

/// 最近邻缩放 (f32).
///
/// 要求源图像与目标形状都非空, 否则 panic.
pub fn resize_nearest_f32(src: ArrayView2<f32>, (oh, ow): Idx2d) -> Array2<f32> {
    let (sh, sw) = src.dim();
    assert!(sh > 0 && sw > 0 && oh > 0 && ow > 0);
    Array2::from_shape_fn((oh, ow), |(ph, pw)| {
        let nh = ((ph * sh) / oh).min(sh - 1);
        let nw = ((pw * sw) / ow).min(sw - 1);
        src[(nh, nw)]
    })
}

/// 二值多数表决平滑. `k` 必须是正奇数.
///
/// 以 `k x k` 方窗为邻域, 窗内多数值胜出 (图像外视为背景票).
/// 平局时判为背景.
pub fn majority_filter(mask: ArrayView2<u8>, k: usize) -> Array2<u8> {
    assert!(k % 2 == 1 && k > 0, "平滑核必须是正奇数");
    if k == 1 {
        return mask.to_owned();
    }
    let (h, w) = mask.dim();
    let r = (k / 2) as isize;
    let half = (k * k) as u32 / 2;
    let mut out = Array2::<u8>::zeros((h, w));
    for (ph, pw) in iproduct!(0..h, 0..w) {
        let mut votes = 0u32;
        for (dh, dw) in iproduct!(-r..=r, -r..=r) {
            let nh = ph as isize + dh;
            let nw = pw as isize + dw;
            if nh >= 0
                && nw >= 0
                && (nh as usize) < h
                && (nw as usize) < w
                && bin::is_on(mask[(nh as usize, nw as usize)])
            {
                votes += 1;
            }
        }
        if votes > half {
            out[(ph, pw)] = bin::ON;
        }
    }
    out
}
