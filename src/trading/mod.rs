//! Trading logic: transfer detection, position sizing, order execution.

mod config;
mod detector;
mod executor;
mod position_sizer;

pub use config::SizingConfig;
pub use detector::{PollDetector, PushDetector, PushEvent};
pub use executor::ExecutionCoordinator;
pub use position_sizer::{PositionSizer, SizingDecision};
