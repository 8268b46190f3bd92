//! Reads the log back out of flash after a flight.

use log::warn;
use novafc_data_format::{
    check_page, CodecError, PageChecksum, PageReader, Record, Tag, PAGE_PAYLOAD_LEN, PAGE_SIZE,
};
use serde::Serialize;

use crate::error::FlashError;
use crate::flash::{Flash, PageArena};
use crate::stats::{bump, RecorderStats};

/// Most records a page can hold, all of the smallest kind
pub const MAX_RECORDS_PER_PAGE: usize = PAGE_PAYLOAD_LEN / Tag::Pressure.record_len();

/// Everything recovered from one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageReport {
    pub address: u32,
    pub records: heapless::Vec<Record, MAX_RECORDS_PER_PAGE>,
    pub checksum: PageChecksum,
    /// The decode error that ended this page early, if any
    pub error: Option<CodecError>,
}

impl PageReport {
    pub fn is_intact(&self) -> bool {
        self.checksum == PageChecksum::Valid && self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogReport {
    pub pages: Vec<PageReport>,
}

impl LogReport {
    /// Every record, in log order
    pub fn records(&self) -> impl Iterator<Item = &Record> + '_ {
        self.pages.iter().flat_map(|page| page.records.iter())
    }

    pub fn record_count(&self) -> usize {
        self.pages.iter().map(|page| page.records.len()).sum()
    }

    /// Pages with a bad checksum or a decode error
    pub fn damaged_pages(&self) -> impl Iterator<Item = &PageReport> + '_ {
        self.pages.iter().filter(|page| !page.is_intact())
    }
}

/// Decodes every page of `arena` below `end`.
///
/// A page that fails to decode or checksum is still reported, along with whatever records came
/// before the damage. Reading carries on with the next page.
pub fn read_log<F: Flash>(
    flash: &mut F,
    arena: PageArena,
    end: u32,
    stats: &RecorderStats,
) -> Result<LogReport, FlashError> {
    let end = end.min(arena.end_address());
    let mut report = LogReport::default();
    let mut page = [0u8; PAGE_SIZE];

    for index in arena.pages_from(arena.start()) {
        let address = index.address();
        if address >= end {
            break;
        }
        flash.read(address, &mut page)?;

        let mut records = heapless::Vec::new();
        let mut error = None;
        for record in PageReader::new(&page) {
            match record {
                // Can't overflow, no page holds more than `MAX_RECORDS_PER_PAGE`
                Ok(record) => {
                    let _ = records.push(record);
                }
                Err(err) => error = Some(err),
            }
        }
        if let Some(err) = &error {
            warn!("page {address:#x}: {err} after {} records", records.len());
            bump(&stats.decode_errors);
        }

        let checksum = check_page(&page);
        if checksum != PageChecksum::Valid {
            warn!("page {address:#x}: checksum {checksum:?}");
            bump(&stats.checksum_failures);
        }

        report.pages.push(PageReport {
            address,
            records,
            checksum,
            error,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use novafc_data_format::{Reading, TimeIndex};

    use super::*;
    use crate::engine::page_image;
    use crate::flash::{PageIndex, SimFlash};

    fn record(t: u32) -> Record {
        Record::new(TimeIndex::from_ticks(t), Reading::Temperature(t as i32 - 40)).unwrap()
    }

    fn write_page(flash: &mut SimFlash, address: u32, records: &[Record]) {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&record.to_bytes().unwrap());
        }
        flash.program(address, &page_image(&data, false)).unwrap();
    }

    #[test]
    fn reads_each_page() {
        let mut flash = SimFlash::new(4096, 4096);
        let arena = PageArena::new(PageIndex::new(0), 16);
        write_page(&mut flash, 0, &[record(0), record(1)]);
        write_page(&mut flash, 256, &[record(2)]);

        let stats = RecorderStats::new();
        let report = read_log(&mut flash, arena, 512, &stats).unwrap();
        assert_eq!(report.pages.len(), 2);
        assert_eq!(report.record_count(), 3);
        assert_eq!(
            report.records().copied().collect::<Vec<_>>(),
            vec![record(0), record(1), record(2)]
        );
        assert_eq!(report.damaged_pages().count(), 0);
        assert_eq!(stats.snapshot().checksum_failures, 0);
    }

    #[test]
    fn decode_error_stops_only_that_page() {
        let mut flash = SimFlash::new(4096, 4096);
        let arena = PageArena::new(PageIndex::new(0), 16);
        write_page(&mut flash, 0, &[record(0), record(1)]);
        write_page(&mut flash, 256, &[record(2)]);
        // Turn the second record's tag into an unknown nibble
        flash.poke(5, &[0x3F]);

        let stats = RecorderStats::new();
        let report = read_log(&mut flash, arena, 512, &stats).unwrap();
        let first = &report.pages[0];
        assert_eq!(&first.records[..], &[record(0)]);
        assert_eq!(first.error, Some(CodecError::UnknownTag { nibble: 0x3 }));
        assert!(matches!(first.checksum, PageChecksum::Mismatch { .. }));
        assert!(report.pages[1].is_intact());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.checksum_failures, 1);
    }

    #[test]
    fn torn_trailer_is_reported() {
        let mut flash = SimFlash::new(4096, 4096);
        let arena = PageArena::new(PageIndex::new(0), 16);
        let data = record(9).to_bytes().unwrap();
        flash.program(0, &data).unwrap();

        let stats = RecorderStats::new();
        let report = read_log(&mut flash, arena, 256, &stats).unwrap();
        assert_eq!(&report.pages[0].records[..], &[record(9)]);
        assert_eq!(report.pages[0].checksum, PageChecksum::Missing);
        assert_eq!(report.damaged_pages().count(), 1);
    }

    #[test]
    fn end_is_clamped_to_arena() {
        let mut flash = SimFlash::new(4096, 4096);
        let arena = PageArena::new(PageIndex::new(0), 2);
        let report = read_log(&mut flash, arena, u32::MAX, &RecorderStats::new()).unwrap();
        assert_eq!(report.pages.len(), 2);
        assert_eq!(report.record_count(), 0);
    }

    #[test]
    fn report_serializes() {
        let mut flash = SimFlash::new(4096, 4096);
        let arena = PageArena::new(PageIndex::new(0), 1);
        write_page(&mut flash, 0, &[record(1)]);
        let report = read_log(&mut flash, arena, 256, &RecorderStats::new()).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["pages"][0]["checksum"], "Valid");
        assert_eq!(json["pages"][0]["records"].as_array().unwrap().len(), 1);
    }
}
