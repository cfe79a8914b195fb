mod assigner;
mod manager;
mod store;
mod watermark;

pub use assigner::WindowAssigner;
pub use manager::{
    CorrectionState, Emission, EmissionId, Epoch, EpochGuard, IngestReport, StateSnapshot,
    WindowManager,
};
pub use store::{
    KeyedStateStore, MergeOutcome, RetiredPosition, WindowSlot, WindowState, WindowStatus,
};
pub use watermark::WatermarkTracker;
