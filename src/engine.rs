//! Writes full page buffers to the log region and finds where the log ends after a reset.

use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use novafc_data_format::{trailer_for, ERASED_BYTE, PAGE_PAYLOAD_LEN, PAGE_SIZE};

use crate::config::RecorderConfig;
use crate::error::{EngineError, FlashError};
use crate::flash::{Flash, PageArena, PageIndex, SharedFlash, WriteCursor};
use crate::page::PageBuffer;
use crate::stats::{bump, RecorderStats};
use crate::store::StoreHandle;

/// Builds the bytes a page should read back as once `data` is flushed.
///
/// The gap between the records and the trailer is left erased, or zeroed on devices that must
/// program whole pages. Either way the decoder reads it as the end of the page.
pub fn page_image(data: &[u8], full_page: bool) -> [u8; PAGE_SIZE] {
    let fill = if full_page { 0x00 } else { ERASED_BYTE };
    let mut image = [fill; PAGE_SIZE];
    let len = data.len().min(PAGE_PAYLOAD_LEN);
    image[..len].copy_from_slice(&data[..len]);
    let trailer = trailer_for(&image[..PAGE_PAYLOAD_LEN]);
    image[PAGE_PAYLOAD_LEN..].copy_from_slice(&trailer);
    image
}

pub struct FlashAppendEngine<F: Flash> {
    flash: SharedFlash<F>,
    cursor: WriteCursor,
    flush_retries: u8,
    checkpoint_interval: u32,
    since_checkpoint: u32,
    store: Option<StoreHandle<F>>,
    stats: Arc<RecorderStats>,
    degraded: bool,
}

impl<F: Flash> FlashAppendEngine<F> {
    /// An engine whose cursor sits at the start of `arena` until [`boot_scan`](Self::boot_scan)
    /// runs
    pub fn new(
        flash: SharedFlash<F>,
        arena: PageArena,
        config: &RecorderConfig,
        stats: Arc<RecorderStats>,
    ) -> Self {
        Self {
            flash,
            cursor: WriteCursor::new(arena),
            flush_retries: config.flush_retries,
            checkpoint_interval: config.checkpoint_interval_pages.max(1),
            since_checkpoint: 0,
            store: None,
            stats,
            degraded: false,
        }
    }

    /// Periodically records the write cursor in `store`
    pub fn with_checkpoints(mut self, store: StoreHandle<F>) -> Self {
        self.store = Some(store);
        self
    }

    /// Address the next page will be written to
    pub fn write_cursor(&self) -> u32 {
        self.cursor.address()
    }

    pub fn cursor(&self) -> WriteCursor {
        self.cursor
    }

    pub fn arena(&self) -> PageArena {
        self.cursor.arena()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Finds the first erased page of the log and moves the cursor there.
    ///
    /// `hint` is a checkpointed cursor. It is only trusted as a place to start looking, never as
    /// the answer.
    pub fn boot_scan(&mut self, hint: Option<u32>) -> Result<u32, EngineError> {
        let arena = self.cursor.arena();
        let mut flash = self.flash.lock();
        let start = scan_start(&mut *flash, arena, hint)?;

        let mut found = None;
        for page in arena.pages_from(start) {
            if flash.is_erased(page.address(), PAGE_SIZE)? {
                found = Some(page);
                break;
            }
        }
        drop(flash);

        let Some(cursor) = found.and_then(|page| WriteCursor::at(arena, page)) else {
            self.cursor = WriteCursor::at(arena, arena.end()).unwrap_or(self.cursor);
            return Err(EngineError::FlashFull { pages: arena.len() });
        };
        self.cursor = cursor;

        let address = cursor.address();
        match hint {
            Some(hint) if hint != address => {
                info!("checkpointed cursor {hint:#x} is stale, log ends at {address:#x}")
            }
            _ => debug!("log ends at {address:#x}"),
        }
        Ok(address)
    }

    /// Writes `buffer` as the next page of the log, returning the address it was written to.
    ///
    /// Failed attempts are retried at the same address. Once the retries run out the engine is
    /// degraded and refuses every further flush.
    pub fn flush(&mut self, buffer: &PageBuffer) -> Result<u32, EngineError> {
        if self.degraded {
            return Err(EngineError::Degraded);
        }
        if self.cursor.is_full() {
            return Err(EngineError::FlashFull {
                pages: self.cursor.pages_written(),
            });
        }

        let address = self.cursor.address();
        let attempts = u32::from(self.flush_retries) + 1;
        let result = {
            let mut flash = self.flash.lock();
            let full_page = flash.requires_full_page_program();
            let image = page_image(buffer.data(), full_page);

            let mut attempt = 1;
            loop {
                match write_page(&mut *flash, address, &image, buffer.len(), full_page) {
                    Ok(()) => break Ok(()),
                    Err(err) if attempt < attempts => {
                        bump(&self.stats.flush_retries);
                        warn!(
                            "page write at {address:#x} failed: {err}, retry {attempt} of {}",
                            self.flush_retries
                        );
                        attempt += 1;
                    }
                    Err(err) => break Err(err),
                }
            }
        };

        if let Err(last) = result {
            self.degraded = true;
            bump(&self.stats.failed_flushes);
            error!("giving up on page write at {address:#x} after {attempts} attempts: {last}");
            return Err(EngineError::RetriesExhausted {
                address,
                attempts,
                last,
            });
        }

        self.cursor.advance();
        bump(&self.stats.pages_flushed);
        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.checkpoint_interval {
            self.checkpoint();
        }
        Ok(address)
    }

    /// Saves the write cursor to the config store now, if one is attached.
    ///
    /// A failure is counted but not returned, the boot scan recovers the real cursor anyway.
    pub fn checkpoint(&mut self) {
        self.since_checkpoint = 0;
        let Some(store) = &self.store else {
            return;
        };
        let cursor = self.cursor.address();
        match store.lock().checkpoint_cursor(cursor) {
            Ok(true) => {
                bump(&self.stats.checkpoints);
                debug!("checkpointed write cursor {cursor:#x}");
            }
            Ok(false) => trace!("write cursor {cursor:#x} already checkpointed"),
            Err(err) => {
                bump(&self.stats.checkpoint_failures);
                warn!("failed to checkpoint write cursor {cursor:#x}: {err}");
            }
        }
    }
}

/// Where the boot scan starts: the hint if it is believable, otherwise the start of the arena
fn scan_start<F: Flash>(
    flash: &mut F,
    arena: PageArena,
    hint: Option<u32>,
) -> Result<PageIndex, FlashError> {
    let Some(address) = hint else {
        return Ok(arena.start());
    };
    let Some(page) = PageIndex::from_address(address) else {
        warn!("ignoring unaligned cursor hint {address:#x}");
        return Ok(arena.start());
    };
    if page != arena.end() && !arena.contains(page) {
        warn!("ignoring cursor hint {address:#x} outside of the log");
        return Ok(arena.start());
    }
    match page.prev() {
        Some(prev) if arena.contains(prev) => {
            if flash.is_erased(prev.address(), PAGE_SIZE)? {
                warn!("cursor hint {address:#x} is past the end of the log, scanning from the start");
                Ok(arena.start())
            } else {
                Ok(page)
            }
        }
        _ => Ok(arena.start()),
    }
}

/// Programs one page image and checks it reads back intact
fn write_page<F: Flash>(
    flash: &mut F,
    address: u32,
    image: &[u8; PAGE_SIZE],
    data_len: usize,
    full_page: bool,
) -> Result<(), FlashError> {
    if full_page {
        flash.program(address, image)?;
    } else {
        if data_len > 0 {
            flash.program(address, &image[..data_len])?;
        }
        flash.program(address + PAGE_PAYLOAD_LEN as u32, &image[PAGE_PAYLOAD_LEN..])?;
    }

    let mut readback = [0u8; PAGE_SIZE];
    flash.read(address, &mut readback)?;
    if readback != *image {
        return Err(FlashError::VerifyMismatch { address });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use novafc_config_format::DEFAULT_DEVICE_ID;
    use novafc_data_format::{check_page, PageChecksum, PageReader, Reading, Record, TimeIndex};

    use super::*;
    use crate::config::FlashLayout;
    use crate::flash::SimFlash;
    use crate::store::ConfigStore;

    const LAYOUT: FlashLayout = FlashLayout::new(8, 1024);

    struct Rig {
        flash: SharedFlash<SimFlash>,
        stats: Arc<RecorderStats>,
        engine: FlashAppendEngine<SimFlash>,
    }

    fn rig(config: RecorderConfig) -> Rig {
        let flash = SimFlash::for_layout(&LAYOUT).into_shared();
        let stats = Arc::new(RecorderStats::new());
        let engine = FlashAppendEngine::new(
            Arc::clone(&flash),
            PageArena::log(&LAYOUT),
            &config,
            Arc::clone(&stats),
        );
        Rig {
            flash,
            stats,
            engine,
        }
    }

    fn config() -> RecorderConfig {
        RecorderConfig {
            layout: LAYOUT,
            ..Default::default()
        }
    }

    fn filled_buffer(records: u32) -> PageBuffer {
        let mut buffer = PageBuffer::new();
        buffer.reset();
        for t in 0..records {
            let record =
                Record::new(TimeIndex::from_ticks(t), Reading::Gyro([t as i16, 1, -1])).unwrap();
            let _ = buffer.append(&record).unwrap();
        }
        buffer
    }

    fn page(flash: &SharedFlash<SimFlash>, address: u32) -> [u8; PAGE_SIZE] {
        let start = address as usize;
        let mut page = [0u8; PAGE_SIZE];
        page.copy_from_slice(&flash.lock().bytes()[start..start + PAGE_SIZE]);
        page
    }

    #[test]
    fn image_layout() {
        let image = page_image(&[0x81, 0x02, 0x03], false);
        assert_eq!(&image[..3], &[0x81, 0x02, 0x03]);
        assert!(image[3..PAGE_PAYLOAD_LEN].iter().all(|b| *b == ERASED_BYTE));
        assert_eq!(check_page(&image), PageChecksum::Valid);

        let zeroed = page_image(&[0x81], true);
        assert!(zeroed[1..PAGE_PAYLOAD_LEN].iter().all(|b| *b == 0));
        assert_eq!(check_page(&zeroed), PageChecksum::Valid);
    }

    #[test]
    fn flush_writes_consecutive_pages() {
        let mut rig = rig(config());
        let buffer = filled_buffer(10);
        assert_eq!(rig.engine.flush(&buffer).unwrap(), 0);
        assert_eq!(rig.engine.flush(&buffer).unwrap(), 256);
        assert_eq!(rig.engine.write_cursor(), 512);

        let written = page(&rig.flash, 256);
        assert_eq!(check_page(&written), PageChecksum::Valid);
        assert_eq!(PageReader::new(&written).count(), 10);
        assert_eq!(rig.stats.snapshot().pages_flushed, 2);
        // Data then trailer, per page
        assert_eq!(rig.flash.lock().stats().programs, 4);
    }

    #[test]
    fn full_page_device_gets_one_program() {
        let flash = SimFlash::for_layout(&LAYOUT)
            .with_full_page_program(true)
            .into_shared();
        let mut engine = FlashAppendEngine::new(
            Arc::clone(&flash),
            PageArena::log(&LAYOUT),
            &config(),
            Arc::new(RecorderStats::new()),
        );
        engine.flush(&filled_buffer(3)).unwrap();
        assert_eq!(flash.lock().stats().programs, 1);

        let written = page(&flash, 0);
        assert_eq!(written[24], 0);
        assert_eq!(PageReader::new(&written).count(), 3);
    }

    #[test]
    fn torn_write_is_retried() {
        let mut rig = rig(config());
        rig.flash.lock().tear_next_program(100);
        assert_eq!(rig.engine.flush(&filled_buffer(31)).unwrap(), 0);
        assert_eq!(rig.stats.snapshot().flush_retries, 1);
        assert_eq!(check_page(&page(&rig.flash, 0)), PageChecksum::Valid);
        assert!(!rig.engine.is_degraded());
    }

    #[test]
    fn persistent_fault_degrades() {
        let mut rig = rig(config());
        rig.flash.lock().fail_programs_in(0..256);

        let err = rig.engine.flush(&filled_buffer(5)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::RetriesExhausted {
                address: 0,
                attempts: 4,
                ..
            }
        ));
        assert!(rig.engine.is_degraded());
        let snapshot = rig.stats.snapshot();
        assert_eq!(snapshot.flush_retries, 3);
        assert_eq!(snapshot.failed_flushes, 1);

        rig.flash.lock().clear_faults();
        let programs = rig.flash.lock().stats().failed_programs;
        assert_eq!(rig.engine.flush(&filled_buffer(5)), Err(EngineError::Degraded));
        assert_eq!(rig.flash.lock().stats().failed_programs, programs);
        assert_eq!(rig.flash.lock().stats().programs, 0);
        assert_eq!(rig.engine.write_cursor(), 0);
    }

    #[test]
    fn refuses_past_end_of_arena() {
        let mut rig = rig(config());
        let buffer = filled_buffer(1);
        for _ in 0..LAYOUT.log_pages {
            rig.engine.flush(&buffer).unwrap();
        }
        let programs = rig.flash.lock().stats().programs;
        assert_eq!(
            rig.engine.flush(&buffer),
            Err(EngineError::FlashFull { pages: 8 })
        );
        assert_eq!(rig.flash.lock().stats().programs, programs);
    }

    #[test]
    fn scan_finds_end_of_log() {
        let mut rig = rig(config());
        assert_eq!(rig.engine.boot_scan(None).unwrap(), 0);

        let buffer = filled_buffer(2);
        for _ in 0..3 {
            rig.engine.flush(&buffer).unwrap();
        }

        let mut fresh = FlashAppendEngine::new(
            Arc::clone(&rig.flash),
            PageArena::log(&LAYOUT),
            &config(),
            Arc::clone(&rig.stats),
        );
        assert_eq!(fresh.boot_scan(None).unwrap(), 768);
        assert_eq!(fresh.boot_scan(None).unwrap(), 768);
        assert_eq!(fresh.write_cursor(), 768);
    }

    #[test]
    fn scan_hints() {
        let mut rig = rig(config());
        let buffer = filled_buffer(2);
        for _ in 0..3 {
            rig.engine.flush(&buffer).unwrap();
        }

        // Behind, ahead, unaligned, outside and exact hints all land on the real end
        for hint in [256, 512, 768, 1024, 1792, 300, 1 << 20] {
            assert_eq!(rig.engine.boot_scan(Some(hint)).unwrap(), 768, "hint {hint:#x}");
        }

        // A hint ahead of the log only starts the scan there if the page before it was written
        let reads_before = rig.flash.lock().stats().reads;
        rig.engine.boot_scan(Some(768)).unwrap();
        let reads = rig.flash.lock().stats().reads - reads_before;
        assert_eq!(reads, 2);
    }

    #[test]
    fn scan_of_full_log() {
        let mut rig = rig(config());
        let buffer = filled_buffer(1);
        for _ in 0..LAYOUT.log_pages {
            rig.engine.flush(&buffer).unwrap();
        }
        assert_eq!(
            rig.engine.boot_scan(None),
            Err(EngineError::FlashFull { pages: 8 })
        );
        assert_eq!(
            rig.engine.boot_scan(Some(8 * 256)),
            Err(EngineError::FlashFull { pages: 8 })
        );
    }

    #[test]
    fn checkpoints_every_interval() {
        let config = RecorderConfig {
            checkpoint_interval_pages: 2,
            ..config()
        };
        let rig = rig(config.clone());
        let mut store = ConfigStore::open(
            Arc::clone(&rig.flash),
            &LAYOUT,
            DEFAULT_DEVICE_ID,
            100,
            Arc::clone(&rig.stats),
        )
        .unwrap();
        store.load_or_init().unwrap();
        let store = store.into_handle();
        let mut engine = rig.engine.with_checkpoints(Arc::clone(&store));
        let buffer = filled_buffer(1);

        engine.flush(&buffer).unwrap();
        assert_eq!(store.lock().current().unwrap().write_cursor, 0);
        engine.flush(&buffer).unwrap();
        assert_eq!(store.lock().current().unwrap().write_cursor, 512);
        engine.flush(&buffer).unwrap();
        assert_eq!(store.lock().load().unwrap().write_cursor, 512);
        assert_eq!(rig.stats.snapshot().checkpoints, 1);

        // Checkpointing an unchanged cursor writes nothing and isn't counted
        engine.checkpoint();
        assert_eq!(store.lock().current().unwrap().write_cursor, 768);
        assert_eq!(rig.stats.snapshot().checkpoints, 2);
        let programs = rig.flash.lock().stats().programs;
        engine.checkpoint();
        assert_eq!(rig.flash.lock().stats().programs, programs);
        assert_eq!(rig.stats.snapshot().checkpoints, 2);

        // Checkpoint failures are absorbed
        rig.flash
            .lock()
            .fail_programs_in(LAYOUT.config_base..LAYOUT.config_base + 2 * 1024);
        engine.flush(&buffer).unwrap();
        engine.flush(&buffer).unwrap();
        assert_eq!(engine.write_cursor(), 1280);
        assert_eq!(rig.stats.snapshot().checkpoint_failures, 1);
    }
}
