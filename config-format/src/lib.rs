//! Persistent configuration format used by the Nova Flight Computer.
//!
//! The configuration record is the small piece of state that must survive a reset in flight: who
//! the device is, which recovery milestones have already happened, and where the data log ends.
//!
//! # Flight phase flags
//!
//! The flight phase is stored as independent flags rather than a single enum value. The flags are
//! only ever set in one order: [`PhaseFlags::IN_FLIGHT`], then [`PhaseFlags::DROGUE_DEPLOYED`],
//! then [`PhaseFlags::MAIN_DEPLOYED`]. Any combination that is not a prefix of that order can only
//! come from a torn or corrupted write, and is resolved to the least progressed phase that is
//! consistent with it (see [`PhaseFlags::phase`]). Reading "not deployed yet" when a deploy did
//! happen costs a redundant deploy check, reading "deployed" when it did not would skip recovery.
//!
//! # Slots
//!
//! Records are written into fixed size slots of [`SLOT_SIZE`] bytes:
//!
//! ```text
//! 0        4          8     9                       60        64
//! +--------+----------+-----+-----------------------+---------+
//! | magic  | sequence | len | postcard(ConfigRecord)| crc32   |
//! +--------+----------+-----+-----------------------+---------+
//! ```
//!
//! All integers are little endian. The CRC covers bytes `0..60`, and unused payload bytes are
//! left erased (`0xFF`) so that writing a slot only programs the bytes it needs. The valid slot
//! with the highest sequence number is the authoritative record.
#![cfg_attr(not(feature = "std"), no_std)]

use serde::{Deserialize, Serialize};

/// Size of one configuration slot on flash
pub const SLOT_SIZE: usize = 64;

/// Marks a slot as holding a configuration record. Spells "NOVA" in ASCII
pub const SLOT_MAGIC: u32 = 0x4156_4F4E;

/// Identity written by a device that was never given one
pub const DEFAULT_DEVICE_ID: u32 = 0x2019_0409;

/// Sampling rate used when no configuration has been written yet
pub const DEFAULT_SAMPLING_RATE_HZ: u16 = 100;

const SLOT_HEADER_LEN: usize = 9;
const SLOT_CRC_OFFSET: usize = SLOT_SIZE - 4;

/// Largest serialized [`ConfigRecord`] that fits in a slot
pub const MAX_RECORD_LEN: usize = SLOT_CRC_OFFSET - SLOT_HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("config record needs {len} bytes, a slot holds {}", MAX_RECORD_LEN)]
    RecordTooLarge { len: usize },

    #[error("failed to serialize config record: {0}")]
    Serialize(postcard::Error),

    #[error("slot must be {} bytes, got {len}", SLOT_SIZE)]
    WrongLength { len: usize },
}

/// The recovery milestones that have been reached, stored as independent bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseFlags(u8);

impl PhaseFlags {
    /// Launch was detected
    pub const IN_FLIGHT: PhaseFlags = PhaseFlags(1 << 0);
    /// The drogue parachute was deployed
    pub const DROGUE_DEPLOYED: PhaseFlags = PhaseFlags(1 << 1);
    /// The main parachute was deployed
    pub const MAIN_DEPLOYED: PhaseFlags = PhaseFlags(1 << 2);

    const KNOWN: u8 = 0b111;

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from raw bits, keeping bits that have no meaning yet
    #[inline]
    pub const fn from_bits_retain(bits: u8) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: PhaseFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: PhaseFlags) -> Self {
        Self(self.0 | other.0)
    }

    /// The flags that are set by the time `phase` is reached
    pub const fn for_phase(phase: FlightPhase) -> Self {
        match phase {
            FlightPhase::Launchpad => Self::empty(),
            FlightPhase::PreApogee => Self::IN_FLIGHT,
            FlightPhase::PostDrogue => Self::IN_FLIGHT.union(Self::DROGUE_DEPLOYED),
            FlightPhase::PostMain => Self::IN_FLIGHT
                .union(Self::DROGUE_DEPLOYED)
                .union(Self::MAIN_DEPLOYED),
        }
    }

    /// Returns the least progressed phase consistent with these flags.
    ///
    /// Milestones only count if every earlier milestone is also set, so a main deployment flag
    /// without the drogue flag reads as "drogue not yet deployed".
    pub const fn phase(self) -> FlightPhase {
        if !self.contains(Self::IN_FLIGHT) {
            FlightPhase::Launchpad
        } else if !self.contains(Self::DROGUE_DEPLOYED) {
            FlightPhase::PreApogee
        } else if !self.contains(Self::MAIN_DEPLOYED) {
            FlightPhase::PostDrogue
        } else {
            FlightPhase::PostMain
        }
    }

    /// Returns true if these flags are exactly what some phase would have written
    #[inline]
    pub const fn is_consistent(self) -> bool {
        self.0 == Self::for_phase(self.phase()).0
    }

    /// Returns true if bits outside the known milestones are set
    #[inline]
    pub const fn has_unknown_bits(self) -> bool {
        self.0 & !Self::KNOWN != 0
    }

    /// Returns the flags of the phase these flags resolve to
    #[inline]
    pub const fn normalized(self) -> Self {
        Self::for_phase(self.phase())
    }
}

/// The flight phase, ordered from least to most progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FlightPhase {
    /// Waiting on the pad for launch
    Launchpad,
    /// In flight, drogue not yet deployed
    PreApogee,
    /// Drogue deployed, main not yet deployed
    PostDrogue,
    /// Main deployed
    PostMain,
}

impl FlightPhase {
    #[inline]
    pub const fn flags(self) -> PhaseFlags {
        PhaseFlags::for_phase(self)
    }
}

/// The persistent configuration and state of the flight computer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Identity of the device that wrote this record
    pub device_id: u32,
    pub flags: PhaseFlags,
    /// Last checkpointed log write cursor (a byte address). Never ahead of the real end of the log
    pub write_cursor: u32,
    pub sampling_rate_hz: u16,
    /// How many times the flight computer has booted since this record was first written
    pub boot_count: u32,
}

impl ConfigRecord {
    /// The record written on first boot, on the launchpad with an empty log
    pub const fn initial(device_id: u32, sampling_rate_hz: u16) -> Self {
        Self {
            device_id,
            flags: PhaseFlags::empty(),
            write_cursor: 0,
            sampling_rate_hz,
            boot_count: 0,
        }
    }

    #[inline]
    pub const fn phase(&self) -> FlightPhase {
        self.flags.phase()
    }
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self::initial(DEFAULT_DEVICE_ID, DEFAULT_SAMPLING_RATE_HZ)
    }
}

/// What a slot read back from flash contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotContents {
    /// Never written since the last erase
    Erased,
    /// A complete record
    Valid { sequence: u32, record: ConfigRecord },
    /// Partially written, or damaged. Must be skipped, never written over
    Corrupt,
}

/// Serializes `record` into a slot image tagged with `sequence`
pub fn encode_slot(sequence: u32, record: &ConfigRecord) -> Result<[u8; SLOT_SIZE], FormatError> {
    let mut slot = [0xFFu8; SLOT_SIZE];
    let len = {
        let payload = &mut slot[SLOT_HEADER_LEN..SLOT_CRC_OFFSET];
        let used = postcard::to_slice(record, payload).map_err(|err| match err {
            postcard::Error::SerializeBufferFull => FormatError::RecordTooLarge {
                len: MAX_RECORD_LEN + 1,
            },
            err => FormatError::Serialize(err),
        })?;
        used.len()
    };
    slot[0..4].copy_from_slice(&SLOT_MAGIC.to_le_bytes());
    slot[4..8].copy_from_slice(&sequence.to_le_bytes());
    // `len` is at most `MAX_RECORD_LEN`, which fits in a byte
    slot[8] = len as u8;
    let crc = crc32fast::hash(&slot[..SLOT_CRC_OFFSET]);
    slot[SLOT_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    Ok(slot)
}

/// Interprets a slot read back from flash
pub fn decode_slot(slot: &[u8]) -> Result<SlotContents, FormatError> {
    if slot.len() != SLOT_SIZE {
        return Err(FormatError::WrongLength { len: slot.len() });
    }
    if slot.iter().all(|&b| b == 0xFF) {
        return Ok(SlotContents::Erased);
    }

    let magic = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
    let stored_crc = u32::from_le_bytes([slot[60], slot[61], slot[62], slot[63]]);
    if magic != SLOT_MAGIC || stored_crc != crc32fast::hash(&slot[..SLOT_CRC_OFFSET]) {
        return Ok(SlotContents::Corrupt);
    }

    let sequence = u32::from_le_bytes([slot[4], slot[5], slot[6], slot[7]]);
    let len = slot[8] as usize;
    if len > MAX_RECORD_LEN {
        return Ok(SlotContents::Corrupt);
    }
    match postcard::from_bytes(&slot[SLOT_HEADER_LEN..SLOT_HEADER_LEN + len]) {
        Ok(record) => Ok(SlotContents::Valid { sequence, record }),
        Err(_) => Ok(SlotContents::Corrupt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConfigRecord {
        ConfigRecord {
            device_id: 0xDEAD_BEEF,
            flags: FlightPhase::PostDrogue.flags(),
            write_cursor: 256 * 1000,
            sampling_rate_hz: 500,
            boot_count: 7,
        }
    }

    #[test]
    fn consistent_flags_round_trip_their_phase() {
        for phase in [
            FlightPhase::Launchpad,
            FlightPhase::PreApogee,
            FlightPhase::PostDrogue,
            FlightPhase::PostMain,
        ] {
            let flags = phase.flags();
            assert!(flags.is_consistent());
            assert_eq!(flags.phase(), phase);
        }
    }

    #[test]
    fn ambiguous_flags_never_read_as_more_progressed() {
        for bits in 0..=u8::MAX {
            let flags = PhaseFlags::from_bits_retain(bits);
            let phase = flags.phase();

            // Every milestone the chosen phase claims must actually be set
            assert!(flags.contains(phase.flags()), "bits {bits:#010b} gave {phase:?}");

            // And no consistent phase below the resolved one can explain the flags better
            let most_progressed_set = if flags.contains(PhaseFlags::MAIN_DEPLOYED) {
                FlightPhase::PostMain
            } else if flags.contains(PhaseFlags::DROGUE_DEPLOYED) {
                FlightPhase::PostDrogue
            } else if flags.contains(PhaseFlags::IN_FLIGHT) {
                FlightPhase::PreApogee
            } else {
                FlightPhase::Launchpad
            };
            assert!(phase <= most_progressed_set);
        }
    }

    #[test]
    fn specific_ambiguities() {
        let drogue_only = PhaseFlags::DROGUE_DEPLOYED;
        assert_eq!(drogue_only.phase(), FlightPhase::Launchpad);
        assert!(!drogue_only.is_consistent());

        let main_without_drogue = PhaseFlags::IN_FLIGHT.union(PhaseFlags::MAIN_DEPLOYED);
        assert_eq!(main_without_drogue.phase(), FlightPhase::PreApogee);
        assert_eq!(main_without_drogue.normalized(), PhaseFlags::IN_FLIGHT);

        let unknown = PhaseFlags::from_bits_retain(0b1000_0011);
        assert!(unknown.has_unknown_bits());
        assert_eq!(unknown.phase(), FlightPhase::PostDrogue);
        assert!(!unknown.is_consistent());
    }

    #[test]
    fn slot_round_trip() {
        let slot = encode_slot(42, &record()).unwrap();
        assert_eq!(
            decode_slot(&slot),
            Ok(SlotContents::Valid {
                sequence: 42,
                record: record()
            })
        );
    }

    #[test]
    fn erased_and_corrupt_slots() {
        assert_eq!(decode_slot(&[0xFF; SLOT_SIZE]), Ok(SlotContents::Erased));

        let mut slot = encode_slot(1, &record()).unwrap();
        slot[12] ^= 0x40;
        assert_eq!(decode_slot(&slot), Ok(SlotContents::Corrupt));

        // A reset part way through programming leaves the tail erased
        let full = encode_slot(2, &record()).unwrap();
        let mut torn = [0xFFu8; SLOT_SIZE];
        torn[..20].copy_from_slice(&full[..20]);
        assert_eq!(decode_slot(&torn), Ok(SlotContents::Corrupt));

        assert_eq!(
            decode_slot(&full[..10]),
            Err(FormatError::WrongLength { len: 10 })
        );
    }

    #[test]
    fn record_fits_in_slot() {
        let worst = ConfigRecord {
            device_id: u32::MAX,
            flags: PhaseFlags::from_bits_retain(u8::MAX),
            write_cursor: u32::MAX,
            sampling_rate_hz: u16::MAX,
            boot_count: u32::MAX,
        };
        let slot = encode_slot(u32::MAX - 1, &worst).unwrap();
        assert!(matches!(
            decode_slot(&slot),
            Ok(SlotContents::Valid { record, .. }) if record == worst
        ));
    }
}
