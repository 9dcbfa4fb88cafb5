//! Event loop and frame routing

pub mod control;
pub mod pump;
pub mod scheduler;
pub mod stats;

pub use control::{ControlInput, ControlTrigger};
pub use pump::{FramePump, PumpBuilder};
pub use scheduler::{Dispatch, EventScheduler, Source, StopHandle};
pub use stats::{Sample, Throughput};
