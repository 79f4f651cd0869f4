//! 边界修正: 用第四个 CNN 微调已接受实例的轮廓.
//!
//! 对每个实例截取以其外接矩形为中心的定长窗口, 把窗口图像
//! 掩蔽到该实例 (实例外一律置零, 附加一个掩膜通道), 交给修正模型
//! 预测带符号的逐像素图: 值不低于 [`crate::consts::OVERGROWN_THRESHOLD`]
//! 表示 "分割在此过度扩张" (腐蚀), 不高于
//! [`crate::consts::UNDERGROWN_THRESHOLD`] 表示 "扩张不足" (膨胀,
//! 只允许长到背景上, 不侵占其它实例). 调整后的掩膜再做一次多数表决
//! 平滑.
//!
//! 多个实例按窗口形状分组、按 `batch_size` 合批推理. 每个实例的
//! 输入只含自己的像素, 合批不会让实例之间互相泄漏.

use crate::cascade::PixelModel;
use crate::consts::{bin, label, OVERGROWN_THRESHOLD, UNDERGROWN_THRESHOLD};
use crate::error::{ConfigError, ModelError};
use crate::geom::TileLocalRect;
use crate::instance::LabelMap;
use crate::{morph, Idx2d};
use ndarray::{s, Array2, Array4, ArrayView2, ArrayView3};
use std::collections::BTreeMap;

/// 修正通道数: RGB + 实例掩膜.
const INPUT_CHANNELS: usize = 4;

/// 边界修正参数.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrectionParams {
    /// 修正窗口的边长 (像素).
    pub window_len: usize,

    /// 多数表决平滑核的边长. 必须是正奇数, 取 1 则不平滑.
    pub smoothing: usize,

    /// 合批推理的 batch 大小.
    pub batch_size: usize,
}

impl Default for CorrectionParams {
    fn default() -> Self {
        Self {
            window_len: 401,
            smoothing: 11,
            batch_size: 16,
        }
    }
}

impl CorrectionParams {
    /// 校验参数合法性.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_len == 0 {
            return Err(ConfigError::NonPositiveArea {
                which: "correction_window_len",
            });
        }
        if self.smoothing % 2 == 0 {
            return Err(ConfigError::BadSmoothing(self.smoothing));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}

/// 就地修正标签图中所有实例的边界.
///
/// `image` 是 tile 的 `(高, 宽, 3)` RGB 图像, 形状必须与标签图一致,
/// 否则 panic. 修正模型的输入通道数必须是 4 (RGB + 掩膜).
pub fn correct(
    image: ArrayView3<u8>,
    labels: &mut LabelMap,
    model: &mut dyn PixelModel,
    params: &CorrectionParams,
) -> Result<(), ModelError> {
    let (h, w, _) = image.dim();
    assert_eq!((h, w), labels.shape());
    if model.input_channels() != INPUT_CHANNELS {
        return Err(ModelError::ChannelMismatch {
            expected: INPUT_CHANNELS,
            got: model.input_channels(),
        });
    }

    // 按窗口形状分组 (图像边缘附近的窗口可能被裁小).
    let mut groups: BTreeMap<Idx2d, Vec<(u32, TileLocalRect)>> = BTreeMap::new();
    for stat in labels.stats() {
        let window = window_rect(&stat.bbox, params.window_len, (h, w));
        groups.entry(window.shape()).or_default().push((stat.id, window));
    }

    for (shape, members) in groups {
        model.adapt_input_shape(shape)?;
        for chunk in members.chunks(params.batch_size) {
            let batch = build_batch(image, labels, chunk, shape);
            let out = model.predict(batch.view())?;
            let (n, oh, ow, _) = out.dim();
            if n != chunk.len() || (oh, ow) != shape {
                return Err(ModelError::ShapeMismatch {
                    expected: shape,
                    got: (oh, ow),
                });
            }
            for (i, &(id, window)) in chunk.iter().enumerate() {
                let signed = out.slice(s![i, .., .., 0]);
                apply_correction(labels, id, &window, signed, params.smoothing);
            }
        }
    }
    Ok(())
}

/// 以外接矩形为中心的 `len x len` 窗口, 整体平移 (而非裁剪) 以落在
/// 图像内; 图像比窗口还小时才退化为整幅图像.
fn window_rect(bbox: &TileLocalRect, len: usize, (h, w): Idx2d) -> TileLocalRect {
    let place = |first: usize, last: usize, bound: usize| -> (usize, usize) {
        if bound <= len {
            return (0, bound);
        }
        let center = (first + last) / 2;
        let lo = center.saturating_sub(len / 2).min(bound - len);
        (lo, lo + len)
    };
    let (fr, lr) = place(bbox.first_row, bbox.last_row, h);
    let (fc, lc) = place(bbox.first_col, bbox.last_col, w);
    TileLocalRect::new(fr, fc, lr, lc)
}

/// 组装一个 batch: 每个样本是窗口内掩蔽到自身实例的 RGB + 掩膜通道.
fn build_batch(
    image: ArrayView3<u8>,
    labels: &LabelMap,
    chunk: &[(u32, TileLocalRect)],
    (wh, ww): Idx2d,
) -> Array4<f32> {
    let mut batch = Array4::<f32>::zeros((chunk.len(), wh, ww, INPUT_CHANNELS));
    for (i, &(id, window)) in chunk.iter().enumerate() {
        for lh in 0..wh {
            for lw in 0..ww {
                let pos = window.to_global((lh, lw));
                if labels.label_at(pos) != id {
                    continue;
                }
                for c in 0..3 {
                    batch[(i, lh, lw, c)] = image[(pos.0, pos.1, c)] as f32 / 255.0;
                }
                batch[(i, lh, lw, 3)] = 1.0;
            }
        }
    }
    batch
}

/// 把带符号修正图套用到单个实例上.
fn apply_correction(
    labels: &mut LabelMap,
    id: u32,
    window: &TileLocalRect,
    signed: ArrayView2<f32>,
    smoothing: usize,
) {
    let (wh, ww) = window.shape();
    debug_assert_eq!(signed.dim(), (wh, ww));

    // 窗口局部的调整后掩膜.
    let mut adjusted = Array2::<u8>::zeros((wh, ww));
    for lh in 0..wh {
        for lw in 0..ww {
            let pos = window.to_global((lh, lw));
            let here = labels.label_at(pos);
            let v = signed[(lh, lw)];
            let keep = if here == id {
                v < OVERGROWN_THRESHOLD // 过度扩张处腐蚀
            } else {
                // 扩张不足处膨胀, 只长到背景上.
                label::is_background(here) && v <= UNDERGROWN_THRESHOLD
            };
            if keep {
                adjusted[(lh, lw)] = bin::ON;
            }
        }
    }
    let smoothed = morph::majority_filter(adjusted.view(), smoothing);

    for lh in 0..wh {
        for lw in 0..ww {
            let pos = window.to_global((lh, lw));
            let here = labels.label_at(pos);
            if bin::is_on(smoothed[(lh, lw)]) {
                if label::is_background(here) {
                    labels.set_label(pos, id);
                }
            } else if here == id {
                labels.set_label(pos, label::BACKGROUND);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, ArrayView4};

    /// 输出常数符号图的修正模型.
    struct ConstCorrection(f32);

    impl PixelModel for ConstCorrection {
        fn input_channels(&self) -> usize {
            INPUT_CHANNELS
        }

        fn predict(&mut self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
            let (n, h, w, _) = batch.dim();
            Ok(Array4::from_elem((n, h, w, 1), self.0))
        }
    }

    /// 对实例掩膜通道取负的修正模型: 实例内 +1 (腐蚀), 实例外 0.
    struct ShrinkToNothing;

    impl PixelModel for ShrinkToNothing {
        fn input_channels(&self) -> usize {
            INPUT_CHANNELS
        }

        fn predict(&mut self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
            let (n, h, w, _) = batch.dim();
            let mut out = Array4::zeros((n, h, w, 1));
            for i in 0..n {
                for lh in 0..h {
                    for lw in 0..w {
                        out[(i, lh, lw, 0)] = batch[(i, lh, lw, 3)];
                    }
                }
            }
            Ok(out)
        }
    }

    fn no_smoothing() -> CorrectionParams {
        CorrectionParams {
            window_len: 8,
            smoothing: 1,
            batch_size: 4,
        }
    }

    fn labels_with_square(shape: Idx2d, id: u32, (fh, fw): Idx2d, side: usize) -> LabelMap {
        let mut labels = LabelMap::new_background(shape);
        for ph in fh..fh + side {
            for pw in fw..fw + side {
                labels.set_label((ph, pw), id);
            }
        }
        labels
    }

    #[test]
    fn test_validate() {
        assert!(CorrectionParams::default().validate().is_ok());
        assert!(CorrectionParams {
            smoothing: 4,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(CorrectionParams {
            batch_size: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(CorrectionParams {
            window_len: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_zero_map_is_identity_without_smoothing() {
        let image = Array3::<u8>::from_elem((16, 16, 3), 200);
        let mut labels = labels_with_square((16, 16), 1, (5, 5), 4);
        let snapshot = labels.clone();
        correct(
            image.view(),
            &mut labels,
            &mut ConstCorrection(0.0),
            &no_smoothing(),
        )
        .unwrap();
        assert_eq!(labels, snapshot);
    }

    #[test]
    fn test_undergrown_grows_onto_background_only() {
        let image = Array3::<u8>::from_elem((16, 16, 3), 200);
        let mut labels = labels_with_square((16, 16), 1, (5, 5), 2);
        // 相邻窗口内放另一个实例, 它的像素不可被侵占.
        labels.set_label((6, 8), 2);
        correct(
            image.view(),
            &mut labels,
            &mut ConstCorrection(-1.0),
            &no_smoothing(),
        )
        .unwrap();
        // 实例 1 的窗口整个长满背景.
        assert!(labels.stats()[0].area_px > 4);
        assert_eq!(labels.label_at((6, 8)), 2);
    }

    #[test]
    fn test_overgrown_erodes_instance() {
        let image = Array3::<u8>::from_elem((16, 16, 3), 200);
        let mut labels = labels_with_square((16, 16), 1, (5, 5), 4);
        correct(
            image.view(),
            &mut labels,
            &mut ShrinkToNothing,
            &no_smoothing(),
        )
        .unwrap();
        // 全实例被判为过度扩张: 实例消失.
        assert!(labels.ids().is_empty());
    }

    #[test]
    fn test_channel_mismatch() {
        struct ThreeChannels;
        impl PixelModel for ThreeChannels {
            fn input_channels(&self) -> usize {
                3
            }
            fn predict(&mut self, _: ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
                unreachable!()
            }
        }
        let image = Array3::<u8>::zeros((8, 8, 3));
        let mut labels = LabelMap::new_background((8, 8));
        assert!(matches!(
            correct(
                image.view(),
                &mut labels,
                &mut ThreeChannels,
                &no_smoothing()
            ),
            Err(ModelError::ChannelMismatch { .. })
        ));
    }

    #[test]
    fn test_window_rect_clamps() {
        // 靠角的实例: 窗口平移而不是越界.
        let bbox = TileLocalRect::new(0, 0, 2, 2);
        let win = window_rect(&bbox, 8, (16, 16));
        assert_eq!(win, TileLocalRect::new(0, 0, 8, 8));

        // 图像比窗口小: 退化为整幅.
        let win = window_rect(&bbox, 8, (5, 16));
        assert_eq!((win.first_row, win.last_row), (0, 5));

        // 居中.
        let bbox = TileLocalRect::new(7, 7, 9, 9);
        let win = window_rect(&bbox, 4, (16, 16));
        assert_eq!(win, TileLocalRect::new(6, 6, 10, 10));
    }
}
