//! An in-memory NOR flash with fault injection, for tests and the host simulation.

use std::ops::Range;

use novafc_data_format::{ERASED_BYTE, PAGE_SIZE};
use serde::Serialize;

use super::{shared, Flash, SharedFlash};
use crate::config::FlashLayout;
use crate::error::FlashError;

/// Operation counts, so tests can check what actually reached the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimFlashStats {
    pub reads: u64,
    pub programs: u64,
    pub failed_programs: u64,
    pub bytes_programmed: u64,
    pub erases: u64,
}

#[derive(Debug, Clone, Default)]
struct Faults {
    /// Programs touching this range fail and leave the device unchanged
    fail_range: Option<Range<u32>>,

    /// The next program writes only this many bytes, then fails
    tear_next: Option<usize>,

    /// Once this many programs have succeeded every further one fails
    fail_after: Option<u64>,
}

pub struct SimFlash {
    memory: Vec<u8>,
    sector_size: u32,
    full_page_program: bool,
    faults: Faults,
    stats: SimFlashStats,
    /// Programs that wrote to the device, counted separately from `stats` for `fail_after`
    successful_programs: u64,
}

impl SimFlash {
    /// An erased device of `capacity` bytes
    pub fn new(capacity: u32, sector_size: u32) -> Self {
        Self {
            memory: vec![ERASED_BYTE; capacity as usize],
            sector_size,
            full_page_program: false,
            faults: Faults::default(),
            stats: SimFlashStats::default(),
            successful_programs: 0,
        }
    }

    /// An erased device just big enough for `layout`
    pub fn for_layout(layout: &FlashLayout) -> Self {
        let capacity = layout.required_capacity().min(u64::from(u32::MAX)) as u32;
        Self::new(capacity, layout.sector_size)
    }

    /// Only accept programs of exactly one aligned page
    pub fn with_full_page_program(mut self, enabled: bool) -> Self {
        self.full_page_program = enabled;
        self
    }

    pub fn into_shared(self) -> SharedFlash<Self> {
        shared(self)
    }

    pub fn fail_programs_in(&mut self, range: Range<u32>) {
        self.faults.fail_range = Some(range);
    }

    /// Simulates a power cut during the next program: only `keep` bytes land
    pub fn tear_next_program(&mut self, keep: usize) {
        self.faults.tear_next = Some(keep);
    }

    pub fn fail_programs_after(&mut self, count: u64) {
        self.faults.fail_after = Some(self.successful_programs + count);
    }

    pub fn clear_faults(&mut self) {
        self.faults = Faults::default();
    }

    pub fn stats(&self) -> SimFlashStats {
        self.stats
    }

    pub fn bytes(&self) -> &[u8] {
        &self.memory
    }

    /// Overwrites memory directly, ignoring NOR rules. For corrupting data in tests
    pub fn poke(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
    }

    fn range(&self, address: u32, len: usize) -> Result<Range<usize>, FlashError> {
        let start = address as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.memory.len() => Ok(start..end),
            _ => Err(FlashError::OutOfBounds { address, len }),
        }
    }

    fn program_fault(&self, address: u32, len: usize) -> bool {
        let end = address.saturating_add(len as u32);
        let in_range = self
            .faults
            .fail_range
            .as_ref()
            .is_some_and(|range| address < range.end && range.start < end);
        let exhausted = self
            .faults
            .fail_after
            .is_some_and(|limit| self.successful_programs >= limit);
        in_range || exhausted
    }
}

impl Flash for SimFlash {
    fn capacity(&self) -> u32 {
        self.memory.len() as u32
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn requires_full_page_program(&self) -> bool {
        self.full_page_program
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(address, buf.len())?;
        self.stats.reads += 1;
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = self.range(address, data.len())?;
        if self.full_page_program
            && (address as usize % PAGE_SIZE != 0 || data.len() != PAGE_SIZE)
        {
            return Err(FlashError::Misaligned {
                address,
                alignment: PAGE_SIZE as u32,
            });
        }

        let current = &self.memory[range.clone()];
        if let Some(offset) = current
            .iter()
            .zip(data)
            .position(|(old, new)| new & !old != 0)
        {
            return Err(FlashError::NotErased {
                address: address + offset as u32,
            });
        }

        if self.program_fault(address, data.len()) {
            self.stats.failed_programs += 1;
            return Err(FlashError::ProgramFailed { address });
        }

        let keep = match self.faults.tear_next.take() {
            Some(keep) => keep.min(data.len()),
            None => data.len(),
        };
        for (cell, byte) in self.memory[range].iter_mut().zip(&data[..keep]) {
            *cell &= byte;
        }
        self.stats.bytes_programmed += keep as u64;

        if keep < data.len() {
            self.stats.failed_programs += 1;
            return Err(FlashError::ProgramFailed {
                address: address + keep as u32,
            });
        }
        self.stats.programs += 1;
        self.successful_programs += 1;
        Ok(())
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        if self.sector_size == 0 || address % self.sector_size != 0 {
            return Err(FlashError::Misaligned {
                address,
                alignment: self.sector_size,
            });
        }
        let range = self.range(address, self.sector_size as usize)?;
        self.memory[range].fill(ERASED_BYTE);
        self.stats.erases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_only_clears_bits() {
        let mut flash = SimFlash::new(512, 256);
        flash.program(10, &[0xF0, 0x0F]).unwrap();
        flash.program(10, &[0xF0, 0x0F]).unwrap();
        flash.program(10, &[0x30, 0x0F]).unwrap();

        let mut buf = [0u8; 2];
        flash.read(10, &mut buf).unwrap();
        assert_eq!(buf, [0x30, 0x0F]);

        assert_eq!(
            flash.program(11, &[0xFF]),
            Err(FlashError::NotErased { address: 11 })
        );
        assert_eq!(flash.stats().programs, 3);
    }

    #[test]
    fn erase_restores_sector() {
        let mut flash = SimFlash::new(512, 256);
        flash.program(256, &[0u8; 16]).unwrap();
        assert_eq!(
            flash.erase_sector(100),
            Err(FlashError::Misaligned {
                address: 100,
                alignment: 256
            })
        );
        flash.erase_sector(256).unwrap();
        assert!(flash.bytes().iter().all(|b| *b == ERASED_BYTE));
        assert_eq!(flash.stats().erases, 1);
    }

    #[test]
    fn out_of_bounds() {
        let mut flash = SimFlash::new(512, 256);
        let mut buf = [0u8; 8];
        assert_eq!(
            flash.read(508, &mut buf),
            Err(FlashError::OutOfBounds {
                address: 508,
                len: 8
            })
        );
        assert!(flash.program(u32::MAX, &[0]).is_err());
    }

    #[test]
    fn failing_range_leaves_memory_untouched() {
        let mut flash = SimFlash::new(1024, 256);
        flash.fail_programs_in(256..512);
        assert_eq!(
            flash.program(500, &[0u8; 20]),
            Err(FlashError::ProgramFailed { address: 500 })
        );
        assert!(flash.bytes()[500..520].iter().all(|b| *b == ERASED_BYTE));
        flash.program(512, &[0u8; 20]).unwrap();
        assert_eq!(flash.stats().failed_programs, 1);

        flash.clear_faults();
        flash.program(500, &[0u8; 4]).unwrap();
    }

    #[test]
    fn torn_program_keeps_prefix() {
        let mut flash = SimFlash::new(512, 256);
        flash.tear_next_program(3);
        assert_eq!(
            flash.program(0, &[1, 2, 3, 4, 5]),
            Err(FlashError::ProgramFailed { address: 3 })
        );
        assert_eq!(&flash.bytes()[..6], &[1, 2, 3, 0xFF, 0xFF, 0xFF]);

        // Only the next program is torn, and re-programming the same bytes completes it
        flash.program(0, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(&flash.bytes()[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn fails_after_count() {
        let mut flash = SimFlash::new(512, 256);
        flash.program(0, &[0]).unwrap();
        flash.fail_programs_after(2);
        flash.program(1, &[0]).unwrap();
        flash.program(2, &[0]).unwrap();
        assert!(flash.program(3, &[0]).is_err());
        assert!(flash.program(4, &[0]).is_err());
        assert_eq!(flash.stats().programs, 3);
        assert_eq!(flash.stats().failed_programs, 2);
    }

    #[test]
    fn full_page_devices_reject_partial_programs() {
        let mut flash = SimFlash::new(1024, 256).with_full_page_program(true);
        assert!(flash.requires_full_page_program());
        assert!(matches!(
            flash.program(0, &[0u8; 10]),
            Err(FlashError::Misaligned { .. })
        ));
        assert!(matches!(
            flash.program(10, &[0u8; 256]),
            Err(FlashError::Misaligned { .. })
        ));
        flash.program(256, &[0u8; 256]).unwrap();
    }

    #[test]
    fn sized_for_layout() {
        let layout = FlashLayout::new(16, 4096);
        let flash = SimFlash::for_layout(&layout);
        assert_eq!(flash.capacity(), 3 * 4096);
        assert_eq!(flash.sector_size(), 4096);
    }
}
