//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx2dF};

pub use crate::cascade::{CascadePrediction, InferenceContext, PixelModel};
pub use crate::geom::{EdgeSet, FullResRect, LoResRect, TileLocalRect};
pub use crate::{rough_foreground_mask, CoarseMaskParams, CompactTissueMask, TissueMask};
pub use crate::{clean, CleanParams, RemovalStats};
pub use crate::{correct, CorrectionParams};
pub use crate::{extract, ExtractParams, InstanceStat, LabelMap};
pub use crate::{ImgWriteRaw, ImgWriteVis};
pub use crate::{MemorySlide, PixelSize, Slide};
pub use crate::{
    segment_slide, segment_slide_with_mask, PipelineParams, SlideInstance, SlideOutcome,
    StepReport,
};
pub use crate::{Tile, TileParams, TileScheduler};

pub use crate::consts::{OVERGROWN_THRESHOLD, PROB_THRESHOLD, UNDERGROWN_THRESHOLD};

pub use crate::error::{
    ConfigError, ModelError, NoValidTileError, PipelineError, PipelineResult,
};

#[cfg(feature = "serde")]
pub use crate::persist::{read_results, Checkpoint, PersistError, ResultsWriter};
