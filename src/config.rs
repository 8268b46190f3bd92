//! Runtime configuration for the recorder and the layout of the flash device.

use std::time::Duration;

use novafc_config_format::{DEFAULT_DEVICE_ID, DEFAULT_SAMPLING_RATE_HZ, SLOT_SIZE};
use novafc_data_format::PAGE_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Depth of each producer queue
pub const DEFAULT_QUEUE_DEPTH: usize = 10;

/// Extra attempts made to program a page before the engine gives up
pub const DEFAULT_FLUSH_RETRIES: u8 = 3;

/// How many flushed pages pass between write cursor checkpoints
pub const DEFAULT_CHECKPOINT_INTERVAL_PAGES: u32 = 16;

/// 1 MiB of log
pub const DEFAULT_LOG_PAGES: u32 = 4096;

pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10;

pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 50;

const PAGE_BYTES: u32 = PAGE_SIZE as u32;

/// Where the log and config regions live on the device.
///
/// The log region always starts at address 0 and spans `log_pages` pages. The config region is
/// two erase sectors starting at `config_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashLayout {
    pub log_pages: u32,
    pub config_base: u32,
    pub sector_size: u32,
}

impl FlashLayout {
    /// Places the config region at the first sector boundary after the log
    pub const fn new(log_pages: u32, sector_size: u32) -> Self {
        // Saturates so an oversized layout fails `validate` instead of wrapping
        let log_end = log_pages.saturating_mul(PAGE_BYTES);
        let config_base = if sector_size == 0 {
            log_end
        } else {
            log_end.div_ceil(sector_size).saturating_mul(sector_size)
        };
        Self {
            log_pages,
            config_base,
            sector_size,
        }
    }

    pub const fn log_end(&self) -> u32 {
        self.log_pages.saturating_mul(PAGE_BYTES)
    }

    pub const fn config_len(&self) -> u32 {
        self.sector_size.saturating_mul(2)
    }

    /// Bytes of flash the layout touches
    pub const fn required_capacity(&self) -> u64 {
        self.config_base as u64 + self.config_len() as u64
    }

    pub const fn slots_per_sector(&self) -> u32 {
        self.sector_size / SLOT_SIZE as u32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_pages == 0 {
            return Err(ConfigError::NoLogPages);
        }
        if self.sector_size == 0 || self.sector_size % PAGE_BYTES != 0 {
            return Err(ConfigError::BadSectorSize {
                sector_size: self.sector_size,
            });
        }
        let log_end = u64::from(self.log_pages) * u64::from(PAGE_BYTES);
        if u64::from(self.config_base) < log_end {
            return Err(ConfigError::Overlap {
                config_base: self.config_base,
                log_end: log_end.min(u64::from(u32::MAX)) as u32,
            });
        }
        if self.config_base % self.sector_size != 0 {
            return Err(ConfigError::Misaligned {
                config_base: self.config_base,
            });
        }
        Ok(())
    }

    /// Checks the layout against a device of `capacity` bytes
    pub fn validate_for(&self, capacity: u32) -> Result<(), ConfigError> {
        self.validate()?;
        let required = self.required_capacity();
        if required > u64::from(capacity) {
            return Err(ConfigError::DeviceTooSmall { required, capacity });
        }
        Ok(())
    }
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_PAGES, DEFAULT_SECTOR_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Identity written into, and expected from, the config record
    pub device_id: u32,

    /// Rate at which the sample clock ticks. One tick is one time index step
    pub sampling_rate_hz: u16,

    pub queue_depth: usize,

    /// How long a producer waits for queue space before dropping its sample
    pub send_timeout_ms: u64,

    /// How long the logging task waits on its queues before checking for a stop request
    pub recv_timeout_ms: u64,

    pub flush_retries: u8,

    pub checkpoint_interval_pages: u32,

    pub layout: FlashLayout,
}

impl RecorderConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling_rate_hz == 0 {
            return Err(ConfigError::Zero {
                field: "sampling_rate_hz",
            });
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Zero {
                field: "queue_depth",
            });
        }
        if self.checkpoint_interval_pages == 0 {
            return Err(ConfigError::Zero {
                field: "checkpoint_interval_pages",
            });
        }
        self.layout.validate()
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID,
            sampling_rate_hz: DEFAULT_SAMPLING_RATE_HZ,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            flush_retries: DEFAULT_FLUSH_RETRIES,
            checkpoint_interval_pages: DEFAULT_CHECKPOINT_INTERVAL_PAGES,
            layout: FlashLayout::default(),
        }
    }
}
