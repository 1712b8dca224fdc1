//! Wyoming protocol: framing codec and typed message set

pub mod event;
pub mod types;

pub use event::{read_event, write_event, Event};
pub use types::{satellite_info, Message, PipelineStage, RunPipeline, TimerInfo};
