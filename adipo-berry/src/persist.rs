//! 结果持久化与断点续跑 (`serde` feature).
//!
//! 两种产物:
//!
//! 1. **结果流**: 定稿实例按 tile 追加写入 (append-only) 的 bincode
//!    帧序列, 中断后已写入的帧仍然可读;
//! 2. **断点**: 压缩的粗组织掩膜 + 下一个实例编号. 进程被打断后,
//!    以断点掩膜调用 [`crate::segment_slide_with_mask`] 即可跳过
//!    已完成的 tile 继续跑, 不会重复产出实例.
//!
//! 重试路径是手动的 (重新拉起进程并指定断点), 不做自动恢复.

use crate::mask::{CompactTissueMask, TissueMask};
use crate::pipeline::SlideInstance;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// 持久化错误.
#[derive(Debug)]
pub enum PersistError {
    /// 底层 I/O 错误.
    Io(std::io::Error),

    /// 编解码错误.
    Codec(bincode::Error),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "I/O 错误: {e}"),
            PersistError::Codec(e) => write!(f, "编解码错误: {e}"),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::Io(e) => Some(e),
            PersistError::Codec(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for PersistError {
    #[inline]
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<bincode::Error> for PersistError {
    #[inline]
    fn from(value: bincode::Error) -> Self {
        Self::Codec(value)
    }
}

/// 定稿实例的追加写入器. 每个实例一帧, 逐 tile 刷盘.
pub struct ResultsWriter {
    file: BufWriter<File>,
}

impl ResultsWriter {
    /// 以追加模式打开 (不存在则创建) 结果文件.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: BufWriter::new(file),
        })
    }

    /// 追加一批实例并刷盘.
    pub fn append(&mut self, records: &[SlideInstance]) -> Result<(), PersistError> {
        for record in records {
            bincode::serialize_into(&mut self.file, record)?;
        }
        self.file.flush()?;
        Ok(())
    }
}

/// 读回结果文件中的所有实例, 按写入顺序.
pub fn read_results<P: AsRef<Path>>(path: P) -> Result<Vec<SlideInstance>, PersistError> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let mut records = Vec::new();
    loop {
        match bincode::deserialize_from::<_, SlideInstance>(&mut reader) {
            Ok(record) => records.push(record),
            Err(e) => {
                if let bincode::ErrorKind::Io(io) = e.as_ref() {
                    if io.kind() == std::io::ErrorKind::UnexpectedEof {
                        break;
                    }
                }
                return Err(PersistError::Codec(e));
            }
        }
    }
    Ok(records)
}

/// 断点: 恢复调度所需的全部状态.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 压缩的粗组织掩膜 (最近一次 tile 写回后的状态).
    mask: CompactTissueMask,

    /// 分配给下一个定稿实例的编号.
    next_instance_id: u32,

    /// 已处理的 tile 数 (诊断用).
    tiles_processed: usize,
}

impl Checkpoint {
    /// 从当前掩膜状态建立断点.
    pub fn new(mask: &TissueMask, next_instance_id: u32, tiles_processed: usize) -> Self {
        Self {
            mask: mask.compress(),
            next_instance_id,
            tiles_processed,
        }
    }

    /// 下一个实例编号.
    #[inline]
    pub fn next_instance_id(&self) -> u32 {
        self.next_instance_id
    }

    /// 已处理的 tile 数.
    #[inline]
    pub fn tiles_processed(&self) -> usize {
        self.tiles_processed
    }

    /// 解出掩膜, 交给 [`crate::segment_slide_with_mask`].
    #[inline]
    pub fn into_mask(self) -> TissueMask {
        self.mask.decompress()
    }

    /// 写入断点文件 (整体覆盖).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PersistError> {
        let mut file = BufWriter::new(File::create(path.as_ref())?);
        bincode::serialize_into(&mut file, self)?;
        file.flush()?;
        Ok(())
    }

    /// 读取断点文件.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::class;
    use ndarray::Array2;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("adipo-berry-{}-{name}", std::process::id()));
        p
    }

    fn sample_instance(id: u32) -> SlideInstance {
        SlideInstance {
            id,
            area_px: 640,
            area_um2: 160.0,
            contour: vec![(10, 10), (10, 11), (11, 11)],
            class_label: class::CELL,
        }
    }

    #[test]
    fn test_results_roundtrip_and_append() {
        let path = temp_path("results.bin");
        let _ = std::fs::remove_file(&path);

        let mut writer = ResultsWriter::open(&path).unwrap();
        writer.append(&[sample_instance(1), sample_instance(2)]).unwrap();
        writer.append(&[sample_instance(3)]).unwrap();
        drop(writer);

        // 再次打开继续追加.
        let mut writer = ResultsWriter::open(&path).unwrap();
        writer.append(&[sample_instance(4)]).unwrap();
        drop(writer);

        let records = read_results(&path).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(records[0], sample_instance(1));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let path = temp_path("checkpoint.bin");
        let _ = std::fs::remove_file(&path);

        let mut data = Array2::<u8>::zeros((6, 9));
        data[(2, 3)] = 1;
        let mask = TissueMask::from_raw(data);
        Checkpoint::new(&mask, 17, 5).save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.next_instance_id(), 17);
        assert_eq!(loaded.tiles_processed(), 5);
        assert_eq!(loaded.into_mask(), mask);

        let _ = std::fs::remove_file(&path);
    }
}
