//! Persistent flight data recorder for the Nova flight computer.
//!
//! Sensor samples arrive on bounded queues and are encoded into page buffers by a single logging
//! task. Full pages are written to NOR flash while the other buffer keeps filling. After a reset
//! the end of the log is found by scanning for the first erased page, and the flight phase is
//! restored from a separate, checksummed config region.

pub mod arbiter;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod flash;
pub mod page;
pub mod queue;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod task;

pub use novafc_config_format as config_format;
pub use novafc_data_format as data_format;

pub use config::{FlashLayout, RecorderConfig};
pub use error::{Error, Result};
pub use flash::{Flash, PageArena, PageIndex, SharedFlash, SimFlash};
pub use stats::{RecorderStats, StatsSnapshot};
pub use store::PhaseHandle;
pub use supervisor::{BootReport, Supervisor, SupervisorState};
