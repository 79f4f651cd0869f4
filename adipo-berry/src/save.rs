//! 图像的持久化存储 (调试与质检用途).

use crate::consts::{bin, label};
use crate::instance::LabelMap;
use crate::mask::TissueMask;
use image::ImageResult;
use std::path::Path;

/// 表明一个可以通过 **可视化友好** 模式持久化存储的图像对象.
///
/// `ImgWriteVis` trait 的意图是, 图像将以 "可视化友好" 的方式保存,
/// 而不是 "as is" 的方式. 对于 [`TissueMask`] 这类 0/1 图像,
/// 保存时映射为黑白; 对于 [`LabelMap`], 每个实例标签映射为一个
/// 确定性的彩色, 相邻标签颜色差异明显.
pub trait ImgWriteVis {
    /// 按照一定的可视化规则将图片保存到 `path` 路径.
    fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()>;
}

/// 表明一个可以通过 **按原样** 模式持久化存储的图像对象.
///
/// `ImgWriteRaw` trait 的额外意图是, 图像将按原样保存. 0/1 的掩膜
/// 可以如此存储; 标签图的 `u32` 标签超出 8-bit 灰度的表达能力,
/// 只提供可视化模式.
pub trait ImgWriteRaw {
    /// 按原样将图片保存到 `path` 路径.
    fn save_raw<P: AsRef<Path>>(&self, path: P) -> ImageResult<()>;
}

impl ImgWriteVis for TissueMask {
    fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
        let (height, width) = self.shape();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        for ((h, w), &pix) in self.view().indexed_iter() {
            let gray = if bin::is_on(pix) { u8::MAX } else { u8::MIN };
            buf.put_pixel(w as u32, h as u32, image::Luma([gray]));
        }
        buf.save(path)
    }
}

impl ImgWriteRaw for TissueMask {
    fn save_raw<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
        let (height, width) = self.shape();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        for ((h, w), &pix) in self.view().indexed_iter() {
            buf.put_pixel(w as u32, h as u32, image::Luma([pix]));
        }
        buf.save(path)
    }
}

/// 实例标签到可视化颜色的确定性映射. 背景为黑色.
#[inline]
pub(crate) fn pretty(id: u32) -> [u8; 3] {
    if label::is_background(id) {
        return [0, 0, 0];
    }
    // 乘以大奇数打散相邻标签, 三个通道各取一段字节并抬高下限,
    // 避免与黑色背景混淆.
    let mixed = id.wrapping_mul(0x9E37_79B1);
    let channel = |shift: u32| 64 + ((mixed >> shift) % 192) as u8;
    [channel(0), channel(8), channel(16)]
}

impl ImgWriteVis for LabelMap {
    fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
        let (height, width) = self.shape();
        let mut buf = image::RgbImage::new(width as u32, height as u32);
        for ((h, w), &pix) in self.view().indexed_iter() {
            buf.put_pixel(w as u32, h as u32, image::Rgb(pretty(pix)));
        }
        buf.save(path)
    }
}
