//! Error types for the recorder.
//!
//! Each layer gets its own enum so callers can match on the failures they can actually handle.
//! [`Error`] wraps all of them for code that only needs to report.

use thiserror::Error;

use crate::page::BufferStatus;
use crate::supervisor::SupervisorState;

pub use novafc_config_format::FormatError;
pub use novafc_data_format::CodecError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("access of {len} bytes at {address:#x} is outside the device")]
    OutOfBounds { address: u32, len: usize },

    #[error("program failed at {address:#x}")]
    ProgramFailed { address: u32 },

    /// NOR flash can only clear bits. Programming a 1 over a 0 needs an erase first.
    #[error("program at {address:#x} would set cleared bits")]
    NotErased { address: u32 },

    #[error("read failed at {address:#x}")]
    ReadFailed { address: u32 },

    #[error("erase of sector {address:#x} failed")]
    EraseFailed { address: u32 },

    #[error("read back at {address:#x} does not match what was programmed")]
    VerifyMismatch { address: u32 },

    #[error("address {address:#x} is not aligned to {alignment} bytes")]
    Misaligned { address: u32, alignment: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("log region is full after {pages} pages")]
    FlashFull { pages: u32 },

    #[error("page write at {address:#x} failed {attempts} times, last error: {last}")]
    RetriesExhausted {
        address: u32,
        attempts: u32,
        last: FlashError,
    },

    #[error("append engine is degraded")]
    Degraded,

    #[error(transparent)]
    Flash(#[from] FlashError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no valid configuration record for this device")]
    NotFound,

    #[error("no erased configuration slot could be claimed")]
    NoSpace,

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Format(#[from] FormatError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("page buffer is {status:?}, expected {expected:?}")]
    WrongStatus {
        status: BufferStatus,
        expected: BufferStatus,
    },

    #[error("record of {len} bytes can never fit in a page buffer")]
    RecordTooLarge { len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArbiterError {
    /// The buffer that would become the append target still holds an unflushed page.
    #[error("other buffer is still flushing")]
    Overrun,

    #[error("buffers are degraded")]
    Degraded,

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("log region needs at least one page")]
    NoLogPages,

    #[error("sector size {sector_size} must be a non-zero multiple of the page size")]
    BadSectorSize { sector_size: u32 },

    #[error("config region at {config_base:#x} overlaps the log region ending at {log_end:#x}")]
    Overlap { config_base: u32, log_end: u32 },

    #[error("config region at {config_base:#x} is not sector aligned")]
    Misaligned { config_base: u32 },

    #[error("layout needs {required} bytes of flash, device has {capacity}")]
    DeviceTooSmall { required: u64, capacity: u32 },

    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("supervisor is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SupervisorState,
        actual: SupervisorState,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("boot scan failed: {0}")]
    Engine(#[from] EngineError),

    #[error("config store failed: {0}")]
    Store(#[from] StoreError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Any error produced by the recorder
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Arbiter(#[from] ArbiterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Startup(#[from] StartupError),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
