//! Persistent configuration and flight phase, kept in two erase sectors of 64 byte slots.
//!
//! Every save goes to a fresh slot with a higher sequence number, the newest valid slot wins on
//! load. When a sector runs out of slots the other sector is erased and writing continues there,
//! so the newest record is never erased before its replacement is durable.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info, warn};
use novafc_config_format::{
    decode_slot, encode_slot, ConfigRecord, FlightPhase, PhaseFlags, SlotContents, SLOT_SIZE,
};
use parking_lot::Mutex;

use crate::config::FlashLayout;
use crate::error::{FlashError, StoreError};
use crate::flash::{Flash, SharedFlash};
use crate::stats::{bump, RecorderStats};

/// The store shared between the logging task's checkpoints and the flight phase logic
pub type StoreHandle<F> = Arc<Mutex<ConfigStore<F>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotPos {
    sector: u32,
    slot: u32,
}

impl SlotPos {
    const FIRST: SlotPos = SlotPos { sector: 0, slot: 0 };

    fn next(self) -> Self {
        Self {
            sector: self.sector,
            slot: self.slot + 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Latest {
    sequence: u32,
    pos: SlotPos,
    record: ConfigRecord,
}

pub struct ConfigStore<F: Flash> {
    flash: SharedFlash<F>,
    base: u32,
    sector_size: u32,
    slots_per_sector: u32,
    device_id: u32,
    sampling_rate_hz: u16,
    stats: Arc<RecorderStats>,
    latest: Option<Latest>,
    /// First slot to try on the next save
    next: SlotPos,
    /// The record as last loaded or saved, with fail-safe flags applied
    current: Option<ConfigRecord>,
    corrupt_seen: u32,
}

impl<F: Flash> ConfigStore<F> {
    /// Opens the store in the config region of `layout` and scans its slots
    pub fn open(
        flash: SharedFlash<F>,
        layout: &FlashLayout,
        device_id: u32,
        sampling_rate_hz: u16,
        stats: Arc<RecorderStats>,
    ) -> Result<Self, StoreError> {
        let mut store = Self {
            flash,
            base: layout.config_base,
            sector_size: layout.sector_size,
            slots_per_sector: layout.slots_per_sector(),
            device_id,
            sampling_rate_hz,
            stats,
            latest: None,
            next: SlotPos::FIRST,
            current: None,
            corrupt_seen: 0,
        };
        store.scan()?;
        Ok(store)
    }

    pub fn into_handle(self) -> StoreHandle<F> {
        Arc::new(Mutex::new(self))
    }

    /// Reads the newest valid record for this device.
    ///
    /// Inconsistent phase flags are resolved to the least progressed phase they could mean.
    pub fn load(&mut self) -> Result<ConfigRecord, StoreError> {
        self.scan()?;
        let latest = self.latest.ok_or(StoreError::NotFound)?;
        if latest.record.device_id != self.device_id {
            warn!(
                "config record belongs to device {:#x}, expected {:#x}",
                latest.record.device_id, self.device_id
            );
            return Err(StoreError::NotFound);
        }
        let record = self.fail_safe(latest.record);
        self.current = Some(record);
        Ok(record)
    }

    /// Loads the stored record, or writes and returns the initial one if there is none.
    ///
    /// The flag is true when an existing record was restored.
    pub fn load_or_init(&mut self) -> Result<(ConfigRecord, bool), StoreError> {
        match self.load() {
            Ok(record) => Ok((record, true)),
            Err(StoreError::NotFound) => {
                let record = ConfigRecord::initial(self.device_id, self.sampling_rate_hz);
                info!("no config record found, writing defaults");
                self.save(&record)?;
                Ok((record, false))
            }
            Err(err) => Err(err),
        }
    }

    /// Writes `record` to the next free slot and verifies it
    pub fn save(&mut self, record: &ConfigRecord) -> Result<(), StoreError> {
        let sequence = self.latest.map_or(1, |latest| latest.sequence.wrapping_add(1));
        let image = encode_slot(sequence, record)?;

        // A slot that fails to program is left as garbage and skipped, give it one more go in a
        // fresh slot before reporting the failure
        let mut last_err = None;
        for _ in 0..2 {
            let pos = self.claim_slot()?;
            let address = self.slot_address(pos);
            self.next = pos.next();
            match self.write_slot(address, &image) {
                Ok(()) => {
                    debug!("saved config record {sequence} at {address:#x}");
                    self.latest = Some(Latest {
                        sequence,
                        pos,
                        record: *record,
                    });
                    self.current = Some(*record);
                    return Ok(());
                }
                Err(err) => {
                    warn!("config slot write at {address:#x} failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.map_or(StoreError::NoSpace, StoreError::Flash))
    }

    /// Applies `change` to the current record and saves the result
    pub fn update(
        &mut self,
        change: impl FnOnce(&mut ConfigRecord),
    ) -> Result<ConfigRecord, StoreError> {
        let mut record = match self.current {
            Some(record) => record,
            None => self.load_or_init()?.0,
        };
        change(&mut record);
        self.save(&record)?;
        Ok(record)
    }

    /// Records how far the log has been written.
    ///
    /// Returns false, without touching flash, if `write_cursor` is already the stored value.
    pub fn checkpoint_cursor(&mut self, write_cursor: u32) -> Result<bool, StoreError> {
        if self.current.is_some_and(|record| record.write_cursor == write_cursor) {
            return Ok(false);
        }
        self.update(|record| record.write_cursor = write_cursor)?;
        Ok(true)
    }

    /// The record as last loaded or saved, without touching flash
    pub fn current(&self) -> Option<ConfigRecord> {
        self.current
    }

    fn fail_safe(&self, mut record: ConfigRecord) -> ConfigRecord {
        if !record.flags.is_consistent() {
            let resolved = record.flags.normalized();
            warn!(
                "inconsistent phase flags {:#05b}, assuming {:?}",
                record.flags.bits(),
                resolved.phase()
            );
            bump(&self.stats.config_ambiguities);
            record.flags = resolved;
        }
        record
    }

    fn slot_address(&self, pos: SlotPos) -> u32 {
        self.base + pos.sector * self.sector_size + pos.slot * SLOT_SIZE as u32
    }

    fn sector_address(&self, sector: u32) -> u32 {
        self.base + sector * self.sector_size
    }

    fn scan(&mut self) -> Result<(), StoreError> {
        let mut latest: Option<Latest> = None;
        let mut corrupt = 0;
        {
            let mut flash = self.flash.lock();
            let mut slot = [0u8; SLOT_SIZE];
            for sector in 0..2 {
                for index in 0..self.slots_per_sector {
                    let pos = SlotPos {
                        sector,
                        slot: index,
                    };
                    flash.read(self.slot_address(pos), &mut slot)?;
                    match decode_slot(&slot)? {
                        SlotContents::Valid { sequence, record } => {
                            if latest.map_or(true, |latest| sequence > latest.sequence) {
                                latest = Some(Latest {
                                    sequence,
                                    pos,
                                    record,
                                });
                            }
                        }
                        SlotContents::Corrupt => corrupt += 1,
                        SlotContents::Erased => {}
                    }
                }
            }
        }

        if corrupt > self.corrupt_seen {
            warn!("{corrupt} corrupt config slots skipped");
            self.stats
                .corrupt_config_slots
                .fetch_add(u64::from(corrupt - self.corrupt_seen), Ordering::Relaxed);
        }
        self.corrupt_seen = corrupt;
        self.latest = latest;
        self.next = latest.map_or(SlotPos::FIRST, |latest| latest.pos.next());
        Ok(())
    }

    /// Finds an erased slot at or after `next`, erasing the other sector if this one is used up
    fn claim_slot(&mut self) -> Result<SlotPos, StoreError> {
        let mut flash = self.flash.lock();
        let mut pos = self.next;
        while pos.slot < self.slots_per_sector {
            if flash.is_erased(self.slot_address(pos), SLOT_SIZE)? {
                return Ok(pos);
            }
            pos = pos.next();
        }

        let other = 1 - pos.sector;
        debug!("config sector {} full, erasing sector {other}", pos.sector);
        flash.erase_sector(self.sector_address(other))?;
        Ok(SlotPos {
            sector: other,
            slot: 0,
        })
    }

    fn write_slot(&self, address: u32, image: &[u8; SLOT_SIZE]) -> Result<(), FlashError> {
        let mut flash = self.flash.lock();
        flash.program(address, image)?;
        let mut readback = [0u8; SLOT_SIZE];
        flash.read(address, &mut readback)?;
        if readback != *image {
            return Err(FlashError::VerifyMismatch { address });
        }
        Ok(())
    }
}

/// What the flight phase logic uses to read and persist recovery milestones.
///
/// Cheap to clone, every clone talks to the same store.
pub struct PhaseHandle<F: Flash> {
    store: StoreHandle<F>,
}

impl<F: Flash> Clone for PhaseHandle<F> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<F: Flash> PhaseHandle<F> {
    pub fn new(store: StoreHandle<F>) -> Self {
        Self { store }
    }

    /// Reloads the record from flash
    pub fn load(&self) -> Result<ConfigRecord, StoreError> {
        self.store.lock().load()
    }

    pub fn phase(&self) -> Result<FlightPhase, StoreError> {
        self.load().map(|record| record.phase())
    }

    pub fn save_flags(&self, flags: PhaseFlags) -> Result<ConfigRecord, StoreError> {
        self.store.lock().update(|record| record.flags = flags)
    }

    pub fn save_phase(&self, phase: FlightPhase) -> Result<ConfigRecord, StoreError> {
        info!("entering flight phase {phase:?}");
        self.save_flags(phase.flags())
    }
}
