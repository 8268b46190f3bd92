//! The flight computer -> flash data logging format.
//!
//! This format is what the data recorder writes to the log region of the flash chip, and what
//! the extraction tools read back after a flight.
//!
//! # Overview
//! Flight computer data is a stream of records. Each record carries one sensor reading along with
//! the time index of the sampling tick it was taken on.
//!
//! Records are packed back to back into flash pages. A page is never split: if a record does not
//! fit in the space that is left on a page, the page is closed and the record starts the next one.
//!
//! # Records
//!
//! Every record starts with a 2 byte big endian header:
//!
//! ```text
//!  15    12 11                     0
//! +--------+------------------------+
//! |  tag   |       time index       |
//! +--------+------------------------+
//! ```
//!
//! The tag is exactly one of [`Tag::Accel`] (`0x8`), [`Tag::Gyro`] (`0x4`),
//! [`Tag::Pressure`] (`0x2`) or [`Tag::Temperature`] (`0x1`). The time index counts sampling
//! ticks and wraps every 4096 ticks, so decoders that need absolute time must count the wraps
//! themselves.
//!
//! The header is followed by a payload whose length is fixed by the tag. Payloads are big endian
//! two's complement with no padding between fields:
//!
//! | Tag           | Payload                     | Record length |
//! |---------------|-----------------------------|---------------|
//! | `Accel`       | x, y, z as `i16`            | 8 bytes       |
//! | `Gyro`        | x, y, z as `i16`            | 8 bytes       |
//! | `Pressure`    | 24 bit signed raw pressure  | 5 bytes       |
//! | `Temperature` | 24 bit signed raw temp      | 5 bytes       |
//!
//! Two tag values are reserved and end the records of a page when they are seen:
//! 1. `0x0` is padding, written by devices that can only program whole pages.
//! 2. `0xF` is the erased state of the flash chip, seen when only the used part of a page was
//!    programmed.
//!
//! # Pages
//!
//! A page is [`PAGE_SIZE`] bytes. The first [`PAGE_PAYLOAD_LEN`] bytes hold records, and the last
//! [`PAGE_TRAILER_LEN`] bytes hold a little endian CRC-32 of the payload area exactly as it reads
//! back from flash (including any erased or padding bytes after the last record). A trailer that
//! is still erased means the page was torn by a reset between programming the records and the
//! trailer; its records are still readable but unverified.
#![cfg_attr(not(feature = "std"), no_std)]

use serde::{Deserialize, Serialize};

/// Size of a flash page, the unit the recorder flushes in
pub const PAGE_SIZE: usize = 256;

/// Bytes at the end of every page reserved for the page checksum
pub const PAGE_TRAILER_LEN: usize = 4;

/// Bytes of every page available for records
pub const PAGE_PAYLOAD_LEN: usize = PAGE_SIZE - PAGE_TRAILER_LEN;

/// Length of a record header
pub const HEADER_LEN: usize = 2;

/// Upper bound on the serialized size of any record.
///
/// Every record produced by [`encode`] is checked against this at compile time.
pub const MAX_RECORD_LEN: usize = 20;

/// The time index wraps back to zero after this many ticks
pub const TIME_INDEX_MODULUS: u32 = 1 << 12;

/// Smallest value a 24 bit payload can hold
pub const I24_MIN: i32 = -(1 << 23);

/// Largest value a 24 bit payload can hold
pub const I24_MAX: i32 = (1 << 23) - 1;

/// The value of a byte of erased flash
pub const ERASED_BYTE: u8 = 0xFF;

const PADDING_NIBBLE: u8 = 0x0;
const ERASED_NIBBLE: u8 = 0xF;
const TIME_INDEX_MASK: u16 = 0x0FFF;

const _: () = assert!(Tag::Accel.record_len() <= MAX_RECORD_LEN);
const _: () = assert!(Tag::Gyro.record_len() <= MAX_RECORD_LEN);

/// Errors produced while encoding or decoding records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CodecError {
    /// A sample carried a value that cannot be represented on flash
    #[error("sample value {value} does not fit in a 24 bit payload")]
    InvalidSample { value: i32 },

    /// Fewer bytes remain than the record's tag requires
    #[error("truncated {tag:?} record: needed {needed} bytes but only {available} remain")]
    TruncatedRecord {
        tag: Tag,
        needed: usize,
        available: usize,
    },

    /// The header's top 4 bits are not a known tag
    #[error("unknown record tag {nibble:#x}")]
    UnknownTag { nibble: u8 },

    /// The output buffer passed to an encoder was too small
    #[error("buffer too small: needed {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// The kind of reading stored in a record. Stored in the top 4 bits of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tag {
    Accel = 0x8,
    Gyro = 0x4,
    Pressure = 0x2,
    Temperature = 0x1,
}

impl Tag {
    pub const ALL: [Tag; 4] = [Tag::Accel, Tag::Gyro, Tag::Pressure, Tag::Temperature];

    /// The 4 bit value of this tag as it appears in the header
    #[inline]
    pub const fn nibble(self) -> u8 {
        self as u8
    }

    /// Number of payload bytes following the header
    pub const fn payload_len(self) -> usize {
        match self {
            Tag::Accel | Tag::Gyro => 6,
            Tag::Pressure | Tag::Temperature => 3,
        }
    }

    /// Total length of a record with this tag, header included
    #[inline]
    pub const fn record_len(self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    /// Looks up the tag for a header nibble.
    ///
    /// Returns `None` for the reserved padding and erased nibbles, which are not errors.
    fn from_nibble(nibble: u8) -> Result<Option<Tag>, CodecError> {
        match nibble {
            0x8 => Ok(Some(Tag::Accel)),
            0x4 => Ok(Some(Tag::Gyro)),
            0x2 => Ok(Some(Tag::Pressure)),
            0x1 => Ok(Some(Tag::Temperature)),
            PADDING_NIBBLE | ERASED_NIBBLE => Ok(None),
            nibble => Err(CodecError::UnknownTag { nibble }),
        }
    }
}

/// The sampling tick a record was taken on, modulo [`TIME_INDEX_MODULUS`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeIndex(u16);

impl TimeIndex {
    /// Creates a time index from a raw tick count, wrapping it into 12 bits
    #[inline]
    pub const fn from_ticks(ticks: u32) -> Self {
        Self((ticks % TIME_INDEX_MODULUS) as u16)
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// The time index one tick later
    #[inline]
    pub const fn next(self) -> Self {
        Self::from_ticks(self.0 as u32 + 1)
    }
}

/// A single reading as it is stored in one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reading {
    Accel([i16; 3]),
    Gyro([i16; 3]),
    /// Raw 24 bit barometer pressure
    Pressure(i32),
    /// Raw 24 bit barometer temperature
    Temperature(i32),
}

impl Reading {
    pub const fn tag(&self) -> Tag {
        match self {
            Reading::Accel(_) => Tag::Accel,
            Reading::Gyro(_) => Tag::Gyro,
            Reading::Pressure(_) => Tag::Pressure,
            Reading::Temperature(_) => Tag::Temperature,
        }
    }

    fn validate(&self) -> Result<(), CodecError> {
        match *self {
            Reading::Pressure(value) | Reading::Temperature(value) => check_i24(value),
            Reading::Accel(_) | Reading::Gyro(_) => Ok(()),
        }
    }
}

/// One encoded sensor reading, the atomic unit of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub time_index: TimeIndex,
    pub reading: Reading,
}

impl Record {
    /// Creates a record, checking that the reading can be stored in its payload
    pub fn new(time_index: TimeIndex, reading: Reading) -> Result<Self, CodecError> {
        reading.validate()?;
        Ok(Self {
            time_index,
            reading,
        })
    }

    #[inline]
    pub const fn tag(&self) -> Tag {
        self.reading.tag()
    }

    /// Length of this record on flash, header included
    #[inline]
    pub const fn len(&self) -> usize {
        self.tag().record_len()
    }

    /// The 16 bit header: tag in the top 4 bits, time index in the bottom 12
    #[inline]
    pub const fn header(&self) -> u16 {
        ((self.tag().nibble() as u16) << 12) | (self.time_index.get() & TIME_INDEX_MASK)
    }

    /// Writes this record to the start of `buf`, returning the number of bytes written
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let len = self.len();
        if buf.len() < len {
            return Err(CodecError::BufferTooSmall {
                needed: len,
                available: buf.len(),
            });
        }
        buf[..HEADER_LEN].copy_from_slice(&self.header().to_be_bytes());
        let payload = &mut buf[HEADER_LEN..len];
        match self.reading {
            Reading::Accel(axes) | Reading::Gyro(axes) => {
                for (dst, axis) in payload.chunks_exact_mut(2).zip(axes) {
                    dst.copy_from_slice(&axis.to_be_bytes());
                }
            }
            Reading::Pressure(value) | Reading::Temperature(value) => {
                check_i24(value)?;
                payload.copy_from_slice(&value.to_be_bytes()[1..]);
            }
        }
        Ok(len)
    }

    /// Returns the bytes of this record as they are written to flash
    pub fn to_bytes(&self) -> Result<heapless::Vec<u8, MAX_RECORD_LEN>, CodecError> {
        let mut bytes = heapless::Vec::new();
        // `len` is bounded by `MAX_RECORD_LEN` via the compile time asserts above
        bytes
            .resize(self.len(), 0)
            .map_err(|_| CodecError::BufferTooSmall {
                needed: self.len(),
                available: MAX_RECORD_LEN,
            })?;
        self.encode_into(&mut bytes)?;
        Ok(bytes)
    }
}

/// A sample from a sensor producer, before it is split into records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorSample {
    /// Accelerometer and gyroscope read on the same tick
    Inertial { accel: [i16; 3], gyro: [i16; 3] },
    /// Accelerometer on its own, for IMUs that run the two sensors at different rates
    Accelerometer { accel: [i16; 3] },
    /// Gyroscope on its own
    Gyroscope { gyro: [i16; 3] },
    Pressure { pressure: i32 },
    Temperature { temp: i32 },
}

/// The records produced by encoding a single [`SensorSample`]
pub type Records = heapless::Vec<Record, 2>;

/// Encodes a sample taken at `time_index` into the records that represent it on flash.
///
/// [`SensorSample::Inertial`] produces an accelerometer record followed by a gyroscope record
/// sharing the same time index, every other sample produces exactly one record.
pub fn encode(sample: &SensorSample, time_index: TimeIndex) -> Result<Records, CodecError> {
    let mut records = Records::new();
    let mut push = |reading: Reading| -> Result<(), CodecError> {
        let record = Record::new(time_index, reading)?;
        // At most two records are ever pushed
        let _ = records.push(record);
        Ok(())
    };
    match *sample {
        SensorSample::Inertial { accel, gyro } => {
            push(Reading::Accel(accel))?;
            push(Reading::Gyro(gyro))?;
        }
        SensorSample::Accelerometer { accel } => push(Reading::Accel(accel))?,
        SensorSample::Gyroscope { gyro } => push(Reading::Gyro(gyro))?,
        SensorSample::Pressure { pressure } => push(Reading::Pressure(pressure))?,
        SensorSample::Temperature { temp } => push(Reading::Temperature(temp))?,
    }
    Ok(records)
}

/// The result of decoding the bytes at the current position of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// A record was decoded from the first `len` bytes
    Record { record: Record, len: usize },
    /// Padding or erased flash was found, there are no more records on this page
    EndOfPage,
}

/// Decodes the record at the start of `bytes`.
///
/// An empty slice, or a trailing byte that is padding or erased, is treated as the end of the
/// page.
pub fn decode(bytes: &[u8]) -> Result<Decoded, CodecError> {
    let Some(&first) = bytes.first() else {
        return Ok(Decoded::EndOfPage);
    };
    let Some(tag) = Tag::from_nibble(first >> 4)? else {
        return Ok(Decoded::EndOfPage);
    };
    let needed = tag.record_len();
    if bytes.len() < needed {
        return Err(CodecError::TruncatedRecord {
            tag,
            needed,
            available: bytes.len(),
        });
    }

    let header = u16::from_be_bytes([bytes[0], bytes[1]]);
    let time_index = TimeIndex(header & TIME_INDEX_MASK);
    let payload = &bytes[HEADER_LEN..needed];
    let reading = match tag {
        Tag::Accel => Reading::Accel(read_axes(payload)),
        Tag::Gyro => Reading::Gyro(read_axes(payload)),
        Tag::Pressure => Reading::Pressure(read_i24(payload)),
        Tag::Temperature => Reading::Temperature(read_i24(payload)),
    };
    Ok(Decoded::Record {
        record: Record {
            time_index,
            reading,
        },
        len: needed,
    })
}

fn check_i24(value: i32) -> Result<(), CodecError> {
    if (I24_MIN..=I24_MAX).contains(&value) {
        Ok(())
    } else {
        Err(CodecError::InvalidSample { value })
    }
}

fn read_axes(payload: &[u8]) -> [i16; 3] {
    let mut axes = [0i16; 3];
    for (axis, src) in axes.iter_mut().zip(payload.chunks_exact(2)) {
        *axis = i16::from_be_bytes([src[0], src[1]]);
    }
    axes
}

fn read_i24(payload: &[u8]) -> i32 {
    // Shift into the top of an i32 then arithmetic shift back down to sign extend
    i32::from_be_bytes([payload[0], payload[1], payload[2], 0]) >> 8
}

/// The integrity of a page as read back from flash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageChecksum {
    Valid,
    /// The trailer is still erased. The page was torn before the trailer was programmed
    Missing,
    Mismatch { stored: u32, computed: u32 },
}

/// Computes the checksum of a page payload area
#[inline]
pub fn payload_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Returns the trailer bytes for a page whose payload area reads back as `payload`
pub fn trailer_for(payload: &[u8]) -> [u8; PAGE_TRAILER_LEN] {
    payload_checksum(payload).to_le_bytes()
}

/// Checks the trailer of a full page read back from flash
pub fn check_page(page: &[u8; PAGE_SIZE]) -> PageChecksum {
    let (payload, trailer) = page.split_at(PAGE_PAYLOAD_LEN);
    if is_erased(trailer) {
        return PageChecksum::Missing;
    }
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = payload_checksum(payload);
    if stored == computed {
        PageChecksum::Valid
    } else {
        PageChecksum::Mismatch { stored, computed }
    }
}

/// Returns true if every byte in `bytes` is in the erased state
#[inline]
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == ERASED_BYTE)
}

/// Iterates over the records in a page payload area.
///
/// Iteration ends at the first padding or erased header, or after the first decode error, which
/// is yielded once so the caller can report a partial page.
pub struct PageReader<'a> {
    payload: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> PageReader<'a> {
    /// Creates a reader over a page payload area. A whole page may be passed, in which case the
    /// trailer is ignored
    pub fn new(page: &'a [u8]) -> Self {
        let end = page.len().min(PAGE_PAYLOAD_LEN);
        Self {
            payload: &page[..end],
            offset: 0,
            done: false,
        }
    }

    /// Number of payload bytes consumed by the records read so far
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for PageReader<'a> {
    type Item = Result<Record, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match decode(&self.payload[self.offset..]) {
            Ok(Decoded::Record { record, len }) => {
                self.offset += len;
                Some(Ok(record))
            }
            Ok(Decoded::EndOfPage) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
