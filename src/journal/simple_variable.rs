//! Reference variable-length record format.
//!
//! On-medium layout of a sector:
//!
//! ```text
//! +0   u32 LE  magic      caller-supplied identifier
//! +4   u32 LE  sequence   ring ordering, wrap-aware
//! +8   records...
//!      each: u16 LE size_field; u8[size_field & 0x7FFF] payload
//!      size_field == 0xFFFF   empty slot, end of sector
//!      size_field &  0x8000   unfinished or bad
//!      size_field &  0x7FFF   payload length
//! ```
//!
//! The commit step exploits AND-only programming: writing `0x7FFF` over the
//! size field clears bit 15 in place and leaves the length bits untouched.
//! Devices program whole bytes atomically, so a torn commit leaves the record
//! unfinished, never half-valid.

use crate::constants::ERASED;
use crate::journal::format::{JournalFormat, RecordInfo, RecordState, SectorInfo, SectorState};
use crate::storage::{ByteStorage, StorageSpan};

/// Sector header: magic then sequence, both little-endian.
pub const PAGE_HEADER_LEN: usize = 8;

/// Record header: one little-endian `u16` size field.
pub const RECORD_HEADER_LEN: usize = 2;

const RECORD_EMPTY: u16 = 0xFFFF;
const RECORD_UNFINISHED: u16 = 0x8000;
const RECORD_SIZE_MASK: u16 = 0x7FFF;

/// Largest payload a single record can carry.
pub const RECORD_PAYLOAD_MAX: usize = RECORD_SIZE_MASK as usize;

/// [`JournalFormat`] with variable-length records and a `u16` size-field
/// header carrying the unfinished bit.
pub struct SimpleVariableJournalFormat {
    magic: u32,
}

impl SimpleVariableJournalFormat {
    /// Creates a format stamping sectors with the given magic identifier.
    pub fn new(magic: u32) -> Self {
        Self { magic }
    }
}

impl JournalFormat for SimpleVariableJournalFormat {
    async fn scan_sector<S: ByteStorage>(
        &self,
        sector: StorageSpan<'_, S>,
        info: &mut SectorInfo,
        following: Option<&SectorInfo>,
    ) {
        let mut header = [0u8; PAGE_HEADER_LEN];
        sector.read(0, &mut header).await;

        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let sequence = u32::from_le_bytes(header[4..8].try_into().unwrap());

        info.first_record = PAGE_HEADER_LEN as u16;
        info.fixed_record_size = 0;
        info.sequence = sequence;
        info.state = if header.iter().all(|&b| b == ERASED) {
            SectorState::Empty
        } else if magic != self.magic {
            SectorState::Bad
        } else if following.is_some_and(|f| sequence.wrapping_add(1) == f.sequence) {
            SectorState::ValidPreceding
        } else {
            SectorState::Valid
        };
    }

    async fn scan_record<S: ByteStorage>(
        &self,
        sector_remaining: StorageSpan<'_, S>,
        _sector_info: &SectorInfo,
        info: &mut RecordInfo,
    ) -> usize {
        // A tail shorter than the header reads as erased filler, so a clamped
        // read cannot fabricate a record out of one stray byte.
        let mut header = [ERASED; RECORD_HEADER_LEN];
        sector_remaining.read(0, &mut header).await;
        let size = u16::from_le_bytes(header);

        info.payload = size & RECORD_SIZE_MASK;
        info.next_record = info.payload + RECORD_HEADER_LEN as u16;
        info.state = if size == RECORD_EMPTY {
            RecordState::Empty
        } else if info.next_record as usize > sector_remaining.len() {
            // Records never cross a sector boundary, so a size field pointing
            // past the sector end is corruption. Unskippable: the real record
            // boundary is unknowable.
            info.payload = 0;
            info.next_record = 0;
            RecordState::Bad
        } else if size & RECORD_UNFINISHED != 0 {
            RecordState::Bad
        } else {
            RecordState::Valid
        };

        RECORD_HEADER_LEN
    }

    async fn init_sector<S: ByteStorage>(&self, sector: StorageSpan<'_, S>, info: &mut SectorInfo) {
        info.sequence = if info.is_valid() {
            info.sequence.wrapping_add(1)
        } else {
            1
        };

        // Sequence first: a sector whose magic is present always carries a
        // complete header.
        sector.write(4, &info.sequence.to_le_bytes()).await;
        sector.write(0, &self.magic.to_le_bytes()).await;

        info.first_record = PAGE_HEADER_LEN as u16;
        info.fixed_record_size = 0;
        info.state = SectorState::Valid;
    }

    async fn init_record<S: ByteStorage>(
        &self,
        sector_remaining: StorageSpan<'_, S>,
        info: &mut RecordInfo,
        payload: usize,
    ) -> usize {
        let mut size = payload.min(RECORD_PAYLOAD_MAX);

        let at_first_record = sector_remaining.offset()
            & sector_remaining.storage().sector_mask()
            == PAGE_HEADER_LEN as u32;
        if at_first_record {
            // A record starting right after the sector header can never fit
            // more than the sector holds, so clamp instead of refusing.
            size = size.min(sector_remaining.len().saturating_sub(RECORD_HEADER_LEN));
        }

        if RECORD_HEADER_LEN + size > sector_remaining.len() {
            info.payload = 0;
            info.next_record = 0;
            info.state = RecordState::Bad;
            return 0;
        }

        let header = (size as u16) | RECORD_UNFINISHED;
        sector_remaining.write(0, &header.to_le_bytes()).await;

        info.payload = size as u16;
        info.next_record = (RECORD_HEADER_LEN + size) as u16;
        info.state = RecordState::Valid;

        RECORD_HEADER_LEN
    }

    async fn commit_record<S: ByteStorage>(&self, payload: StorageSpan<'_, S>) {
        let storage = payload.storage();
        let header_addr = payload.offset() - RECORD_HEADER_LEN as u32;
        assert!(storage.is_same_sector(payload.offset(), header_addr));

        // One programming step: AND clears bit 15, preserving the length.
        storage
            .write(header_addr, &RECORD_SIZE_MASK.to_le_bytes())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn format() -> SimpleVariableJournalFormat {
        SimpleVariableJournalFormat::new(u32::from_le_bytes(*b"TEST"))
    }

    #[tokio::test]
    async fn erased_sector_scans_empty() {
        let store = MemStorage::new(8192, 1024);
        let mut info = SectorInfo::default();

        format().scan_sector(store.sector_span(0), &mut info, None).await;
        assert!(info.is_empty());
    }

    #[tokio::test]
    async fn init_then_scan_round_trips_sequence() {
        let store = MemStorage::new(8192, 1024);
        let fmt = format();

        let mut info = SectorInfo::default();
        fmt.init_sector(store.sector_span(0), &mut info).await;
        assert!(info.is_valid());
        assert_eq!(info.sequence, 1);
        assert_eq!(info.first_record, PAGE_HEADER_LEN as u16);

        let mut again = info;
        fmt.init_sector(store.sector_span(1024), &mut again).await;
        assert_eq!(again.sequence, 2);

        let mut scanned = SectorInfo::default();
        fmt.scan_sector(store.sector_span(1024), &mut scanned, None).await;
        assert!(scanned.is_valid());
        assert_eq!(scanned.sequence, 2);
    }

    #[tokio::test]
    async fn scan_reports_preceding_on_adjacent_sequence() {
        let store = MemStorage::new(8192, 1024);
        let fmt = format();

        let mut first = SectorInfo::default();
        fmt.init_sector(store.sector_span(0), &mut first).await;
        let mut second = first;
        fmt.init_sector(store.sector_span(1024), &mut second).await;

        let mut scanned = SectorInfo::default();
        fmt.scan_sector(store.sector_span(0), &mut scanned, Some(&second)).await;
        assert!(scanned.is_preceding());

        fmt.scan_sector(store.sector_span(0), &mut scanned, Some(&first)).await;
        assert!(scanned.is_valid());
        assert!(!scanned.is_preceding());
    }

    #[tokio::test]
    async fn wrong_magic_scans_bad() {
        let store = MemStorage::new(8192, 1024);
        let fmt = format();

        let mut info = SectorInfo::default();
        fmt.init_sector(store.sector_span(0), &mut info).await;

        let other = SimpleVariableJournalFormat::new(0x4F54_4845);
        let mut scanned = SectorInfo::default();
        other.scan_sector(store.sector_span(0), &mut scanned, None).await;
        assert!(scanned.is_bad());
    }

    #[tokio::test]
    async fn uncommitted_record_scans_bad_but_skippable() {
        let store = MemStorage::new(8192, 1024);
        let fmt = format();

        let mut sector = SectorInfo::default();
        fmt.init_sector(store.sector_span(0), &mut sector).await;

        let mut record = RecordInfo::default();
        let offset = fmt
            .init_record(store.rest_of_sector_span(PAGE_HEADER_LEN as u32), &mut record, 16)
            .await;
        assert_eq!(offset, RECORD_HEADER_LEN);
        assert!(record.is_valid());
        assert_eq!(record.payload, 16);

        let mut scanned = RecordInfo::default();
        fmt.scan_record(store.rest_of_sector_span(PAGE_HEADER_LEN as u32), &sector, &mut scanned)
            .await;
        assert!(scanned.is_bad());
        assert_eq!(scanned.next_record_offset(), RECORD_HEADER_LEN + 16);
    }

    #[tokio::test]
    async fn commit_flips_only_the_unfinished_bit() {
        let store = MemStorage::new(8192, 1024);
        let fmt = format();

        let mut sector = SectorInfo::default();
        fmt.init_sector(store.sector_span(0), &mut sector).await;

        let mut record = RecordInfo::default();
        let offset = fmt
            .init_record(store.rest_of_sector_span(PAGE_HEADER_LEN as u32), &mut record, 5)
            .await;
        let payload =
            store.span(PAGE_HEADER_LEN as u32 + offset as u32, record.payload_len());
        fmt.commit_record(payload).await;

        let mut scanned = RecordInfo::default();
        fmt.scan_record(store.rest_of_sector_span(PAGE_HEADER_LEN as u32), &sector, &mut scanned)
            .await;
        assert!(scanned.is_valid());
        assert_eq!(scanned.payload_len(), 5);
    }

    #[tokio::test]
    async fn first_record_request_is_clamped_to_sector_capacity() {
        let store = MemStorage::new(8192, 1024);
        let fmt = format();

        let mut sector = SectorInfo::default();
        fmt.init_sector(store.sector_span(0), &mut sector).await;

        let mut record = RecordInfo::default();
        fmt.init_record(store.rest_of_sector_span(PAGE_HEADER_LEN as u32), &mut record, 4096)
            .await;
        assert!(record.is_valid());
        assert_eq!(
            record.payload_len(),
            1024 - PAGE_HEADER_LEN - RECORD_HEADER_LEN
        );
    }

    #[tokio::test]
    async fn mid_sector_overflow_reports_bad_unskippable() {
        let store = MemStorage::new(8192, 1024);
        let fmt = format();

        let mut sector = SectorInfo::default();
        fmt.init_sector(store.sector_span(0), &mut sector).await;

        // 100 bytes left in the sector, record needs 102.
        let tail = store.rest_of_sector_span(1024 - 100);
        let mut record = RecordInfo::default();
        fmt.init_record(tail, &mut record, 100).await;
        assert!(record.is_bad());
        assert_eq!(record.next_record_offset(), 0);
    }

    #[tokio::test]
    async fn empty_slot_scans_empty() {
        let store = MemStorage::new(8192, 1024);
        let fmt = format();

        let mut sector = SectorInfo::default();
        fmt.init_sector(store.sector_span(0), &mut sector).await;

        let mut scanned = RecordInfo::default();
        fmt.scan_record(store.rest_of_sector_span(PAGE_HEADER_LEN as u32), &sector, &mut scanned)
            .await;
        assert!(scanned.is_empty());
    }

    #[tokio::test]
    async fn sub_header_tail_scans_empty() {
        let store = MemStorage::new(8192, 1024);
        let fmt = format();

        let mut sector = SectorInfo::default();
        fmt.init_sector(store.sector_span(0), &mut sector).await;

        // One erased byte left before the sector boundary.
        let tail = store.rest_of_sector_span(1023);
        let mut scanned = RecordInfo::default();
        fmt.scan_record(tail, &sector, &mut scanned).await;
        assert!(scanned.is_empty());
    }
}
