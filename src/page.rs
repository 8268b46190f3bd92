//! A single page worth of encoded records waiting to be written to flash.

use novafc_data_format::{Record, MAX_RECORD_LEN, PAGE_PAYLOAD_LEN};
use serde::{Deserialize, Serialize};

use crate::error::BufferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferStatus {
    /// Accepting appends
    Filling,
    /// Handed to the append engine and not yet released
    Flushing,
    /// Flushed and waiting to be reset
    Idle,
    /// A flush failed for good. Never leaves this state
    Degraded,
}

/// Result of [`PageBuffer::append`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Append {
    Appended,
    /// The record did not fit and was not written. The buffer needs to be flushed
    Full,
}

/// Records are packed back to back. A record is either fully inside the buffer or not in it at
/// all.
#[derive(Debug, Clone)]
pub struct PageBuffer {
    bytes: [u8; PAGE_PAYLOAD_LEN],
    len: usize,
    records: u32,
    status: BufferStatus,
}

impl PageBuffer {
    pub const CAPACITY: usize = PAGE_PAYLOAD_LEN;

    /// A new, idle buffer. Call [`reset`](Self::reset) before appending
    pub const fn new() -> Self {
        Self {
            bytes: [0; PAGE_PAYLOAD_LEN],
            len: 0,
            records: 0,
            status: BufferStatus::Idle,
        }
    }

    pub fn append(&mut self, record: &Record) -> Result<Append, BufferError> {
        self.expect_status(BufferStatus::Filling)?;
        let len = record.len();
        if len > Self::CAPACITY {
            return Err(BufferError::RecordTooLarge { len });
        }
        if self.len + len > Self::CAPACITY {
            return Ok(Append::Full);
        }

        let mut encoded = [0u8; MAX_RECORD_LEN];
        // Can't fail, `encoded` is sized for the largest record
        let written = record
            .encode_into(&mut encoded)
            .map_err(|_| BufferError::RecordTooLarge { len })?;
        self.bytes[self.len..self.len + written].copy_from_slice(&encoded[..written]);
        self.len += written;
        self.records += 1;
        Ok(Append::Appended)
    }

    /// Empties the buffer and starts filling it again
    pub fn reset(&mut self) {
        self.len = 0;
        self.records = 0;
        self.status = BufferStatus::Filling;
    }

    pub fn begin_flush(&mut self) -> Result<(), BufferError> {
        self.expect_status(BufferStatus::Filling)?;
        self.status = BufferStatus::Flushing;
        Ok(())
    }

    pub fn finish_flush(&mut self) -> Result<(), BufferError> {
        self.expect_status(BufferStatus::Flushing)?;
        self.status = BufferStatus::Idle;
        Ok(())
    }

    pub fn degrade(&mut self) {
        self.status = BufferStatus::Degraded;
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        Self::CAPACITY - self.len
    }

    pub fn record_count(&self) -> u32 {
        self.records
    }

    pub fn status(&self) -> BufferStatus {
        self.status
    }

    fn expect_status(&self, expected: BufferStatus) -> Result<(), BufferError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(BufferError::WrongStatus {
                status: self.status,
                expected,
            })
        }
    }
}

impl Default for PageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use novafc_data_format::{PageReader, Reading, TimeIndex};

    use super::*;

    fn accel(t: u32) -> Record {
        Record::new(TimeIndex::from_ticks(t), Reading::Accel([1, -2, 3])).unwrap()
    }

    fn pressure(t: u32) -> Record {
        Record::new(TimeIndex::from_ticks(t), Reading::Pressure(-70_000)).unwrap()
    }

    #[test]
    fn fills_to_capacity() {
        let mut buffer = PageBuffer::new();
        buffer.reset();

        // 31 accel records use 248 of 252 bytes
        for t in 0..31 {
            assert_eq!(buffer.append(&accel(t)).unwrap(), Append::Appended);
        }
        assert_eq!(buffer.remaining(), 4);
        assert_eq!(buffer.append(&accel(31)).unwrap(), Append::Full);
        assert_eq!(buffer.len(), 248);

        assert_eq!(buffer.append(&pressure(31)).unwrap(), Append::Full);
        assert_eq!(buffer.record_count(), 31);
    }

    #[test]
    fn exact_fit_is_accepted() {
        let mut buffer = PageBuffer::new();
        buffer.reset();
        let mut appended = 0;
        while buffer.append(&pressure(appended)).unwrap() == Append::Appended {
            appended += 1;
        }
        // 252 / 5 = 50 records, 2 bytes left
        assert_eq!(appended, 50);
        assert_eq!(buffer.remaining(), 2);
        assert_eq!(buffer.record_count(), 50);
    }

    #[test]
    fn contents_decode() {
        let mut buffer = PageBuffer::new();
        buffer.reset();
        assert_eq!(buffer.append(&accel(1)).unwrap(), Append::Appended);
        assert_eq!(buffer.append(&pressure(2)).unwrap(), Append::Appended);

        let records: Vec<_> = PageReader::new(buffer.data())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records, vec![accel(1), pressure(2)]);
    }

    #[test]
    fn status_transitions() {
        let mut buffer = PageBuffer::new();
        assert_eq!(buffer.status(), BufferStatus::Idle);
        assert!(buffer.append(&accel(0)).is_err());
        assert!(buffer.begin_flush().is_err());

        buffer.reset();
        assert_eq!(buffer.append(&accel(0)).unwrap(), Append::Appended);
        buffer.begin_flush().unwrap();
        assert_eq!(buffer.status(), BufferStatus::Flushing);
        assert_eq!(
            buffer.append(&accel(1)),
            Err(BufferError::WrongStatus {
                status: BufferStatus::Flushing,
                expected: BufferStatus::Filling
            })
        );
        assert!(buffer.begin_flush().is_err());
        assert_eq!(buffer.len(), 8);

        buffer.finish_flush().unwrap();
        assert_eq!(buffer.status(), BufferStatus::Idle);
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.status(), BufferStatus::Filling);

        buffer.degrade();
        assert!(buffer.append(&accel(2)).is_err());
    }
}
