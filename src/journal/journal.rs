//! Ring journal engine over a [`ByteStorage`].
//!
//! The engine turns a sectored, erase-before-write medium into an append-only
//! stream of variable-length records. Sectors are consumed in ring order, each
//! stamped by the [`JournalFormat`] with a wrap-aware sequence number; when
//! the ring is full the oldest sector is erased and reused. Recovery is a pure
//! function of the medium: [`Journal::scan`] rebuilds all in-memory state from
//! the sector headers alone.
//!
//! # Write protocol
//!
//! Writing is two-phase. [`Journal::begin_write`] reserves space and stamps an
//! *unfinished* record header; the caller programs the payload through the
//! returned [`RecordWriter`]; [`Journal::end_write`] commits with a single
//! programming step. A crash anywhere in between leaves a record the next scan
//! classifies as bad, which readers skip — an uncommitted record never
//! existed.
//!
//! # Concurrency
//!
//! Single writer, single thread. Every storage call is a suspension point;
//! the engine holds no state across those points that another journal
//! operation could observe inconsistently, because there is no other
//! operation.

use core::ops::Deref;

use tokio::task::yield_now;
use tracing::{debug, trace};

use crate::journal::format::{JournalFormat, RecordInfo, SectorInfo};
use crate::journal::sequence_newer;
use crate::storage::{ByteStorage, StorageSpan};

/// Address marker for a cursor that is not positioned on any sector.
const UNPOSITIONED: u32 = u32::MAX;

/// Address of a sector that holds (or held) journal data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub(crate) addr: u32,
}

impl Sector {
    /// Byte address of the sector's first byte.
    #[inline]
    pub fn address(self) -> u32 {
        self.addr
    }
}

/// Walks the valid sectors of the ring, oldest-first or newest-first.
///
/// Create with [`Journal::enumerate_sectors`], advance with
/// [`Journal::next_sector`] or [`Journal::previous_sector`]. A cursor that has
/// finished (or not started) iteration is unpositioned.
#[derive(Debug, Clone, Copy)]
pub struct SectorCursor {
    addr: u32,
}

impl SectorCursor {
    fn new() -> Self {
        Self { addr: UNPOSITIONED }
    }

    /// Returns the sector the cursor is positioned on, if any.
    #[inline]
    pub fn sector(&self) -> Option<Sector> {
        (self.addr != UNPOSITIONED).then_some(Sector { addr: self.addr })
    }
}

/// Walks the records of one sector front to back.
///
/// Create with [`Journal::enumerate_records`], advance with
/// [`Journal::next_record`], read the current record with
/// [`Journal::read_record`].
#[derive(Debug, Clone, Copy)]
pub struct RecordCursor {
    /// Current position: a record header before scanning, the current
    /// record's payload after a successful [`Journal::next_record`].
    r: u32,
    /// Position of the next record header. `r - 1` is the poison marker left
    /// behind by a non-skippable bad record.
    r_next: u32,
    /// Payload length of the current record.
    len: usize,
    /// Containing sector's info; default (bad) until the first advance scans
    /// the sector header.
    si: SectorInfo,
}

impl RecordCursor {
    fn new(sector: Sector) -> Self {
        Self {
            r: sector.addr,
            r_next: sector.addr,
            len: 0,
            si: SectorInfo::default(),
        }
    }

    /// Returns whether enumeration stopped at reusable free space, rather
    /// than at a full or corrupted tail.
    #[inline]
    pub fn at_free_space(&self) -> bool {
        self.r == self.r_next
    }

    /// Storage address of the current position.
    #[inline]
    pub fn address(&self) -> u32 {
        self.r
    }

    /// Payload length of the current record.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Handle to a reserved, not yet committed record.
///
/// Dereferences to the payload [`StorageSpan`]; program the payload through
/// it, then pass the writer to [`Journal::end_write`]. A writer must not be
/// used after the journal advances to another sector or reserves another
/// record.
pub struct RecordWriter<'a, S: ByteStorage> {
    span: StorageSpan<'a, S>,
}

impl<'a, S: ByteStorage> Deref for RecordWriter<'a, S> {
    type Target = StorageSpan<'a, S>;

    fn deref(&self) -> &Self::Target {
        &self.span
    }
}

/// The ring journal engine. Borrows its storage and format; owns neither.
pub struct Journal<'a, S: ByteStorage, F: JournalFormat> {
    storage: &'a S,
    format: &'a F,

    /// Info of the most recently initialized (or scanned newest) sector.
    last: SectorInfo,
    /// Oldest sector still in the ring. Equals `last_sector` when the ring
    /// holds at most one valid sector.
    first_sector: u32,
    /// Sector currently accepting records.
    last_sector: u32,
    /// Offset within `last_sector` where the next record header goes; 0 or
    /// `sector_size` mean "advance before writing".
    free_offset: u32,
    /// Hint: the largest payload the last reservation attempt left room for.
    max_record: usize,
}

impl<'a, S: ByteStorage, F: JournalFormat> Journal<'a, S, F> {
    /// Creates an engine over `storage` using `format` for the on-medium
    /// layout. Call [`scan`](Self::scan) before writing or enumerating.
    pub fn new(storage: &'a S, format: &'a F) -> Self {
        assert!(storage.sector_size().is_power_of_two());
        assert!(storage.size() % storage.sector_size() == 0);
        assert!(storage.sector_count() >= 1);

        Self {
            storage,
            format,
            last: SectorInfo::default(),
            first_sector: 0,
            last_sector: 0,
            free_offset: 0,
            max_record: 0,
        }
    }

    /// Byte address of the sector currently accepting records.
    #[inline]
    pub fn last_sector_address(&self) -> u32 {
        self.last_sector
    }

    /// Info of the newest sector.
    #[inline]
    pub fn last_sector_info(&self) -> &SectorInfo {
        &self.last
    }

    /// The largest payload the last reservation attempt left room for in the
    /// current sector. Purely informational.
    #[inline]
    pub fn maximum_record(&self) -> usize {
        self.max_record
    }

    // ─────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────

    /// Rebuilds the engine state from the medium.
    ///
    /// Finds the newest valid sector by wrap-aware sequence comparison,
    /// locates the free space at its tail, then extends the ring backward
    /// while sector sequences stay contiguous. Safe to call at any time; the
    /// journal continues appending where the scan left off.
    pub async fn scan(&mut self) {
        debug!("scanning storage sectors");

        let mut newest: Option<u32> = None;
        let mut si_newest = SectorInfo::default();
        // The first valid sequence seen anchors the comparison, so a ring
        // that crossed the sequence wrap more than once (corruption or a
        // bug) cannot make an older sector look newest.
        let mut base_seq = 0u32;
        let mut free_sectors = 0u32;
        let mut bad_sectors = 0u32;

        let mut addr = 0u32;
        while addr < self.storage.size() {
            let mut si = SectorInfo::default();
            self.format
                .scan_sector(self.storage.sector_span(addr), &mut si, None)
                .await;
            yield_now().await;

            if si.is_empty() {
                trace!(addr, "scanned sector: empty");
                free_sectors += 1;
            } else if !si.is_valid() {
                trace!(addr, "scanned sector: bad");
                bad_sectors += 1;
            } else {
                trace!(addr, sequence = si.sequence, "scanned sector: valid");
                let newer = match newest {
                    None => {
                        base_seq = si.sequence;
                        true
                    }
                    Some(_) => {
                        sequence_newer(si.sequence, si_newest.sequence)
                            && sequence_newer(si.sequence, base_seq)
                    }
                };
                if newer {
                    newest = Some(addr);
                    si_newest = si;
                }
            }

            addr += self.storage.sector_size();
        }

        debug!(
            free_sectors,
            bad_sectors,
            total = self.storage.sector_count(),
            "sector scan complete"
        );

        let Some(last_sector) = newest else {
            debug!("storage is empty");
            self.first_sector = 0;
            self.last_sector = 0;
            self.free_offset = 0;
            self.last = SectorInfo::default();
            return;
        };

        self.last_sector = last_sector;
        debug!(
            addr = last_sector,
            sequence = si_newest.sequence,
            "newest sector found"
        );

        // Walk the newest sector's records to find where free space starts.
        let mut cursor = RecordCursor::new(Sector { addr: last_sector });
        while self.next_record(&mut cursor).await.is_some() {}

        if cursor.at_free_space() {
            self.free_offset = cursor.r - last_sector;
            trace!(
                free_offset = self.free_offset,
                "newest sector has free space"
            );
        } else {
            // Full or corrupted tail: force an advance on the next write.
            // (0 would mean "initialize last_sector in place" and erase the
            // newest records.)
            self.free_offset = self.storage.sector_size();
            trace!("newest sector is full or corrupted");
        }

        // Extend backward while sequence numbers stay contiguous.
        let mut si_first = si_newest;
        self.first_sector = last_sector;
        let mut addr = self.previous_ring(last_sector);
        while addr != last_sector {
            let mut si = SectorInfo::default();
            self.format
                .scan_sector(self.storage.sector_span(addr), &mut si, Some(&si_first))
                .await;
            yield_now().await;

            if !si.is_preceding() {
                if si.is_valid() {
                    debug!(addr, sequence = si.sequence, "unexpected sector sequence");
                }
                break;
            }
            self.first_sector = addr;
            si_first = si;
            addr = self.previous_ring(addr);
        }

        debug!(
            first_sequence = si_first.sequence,
            last_sequence = si_newest.sequence,
            first_sector = self.first_sector,
            last_sector = self.last_sector,
            "journal recovered"
        );
        self.last = si_newest;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Enumeration
    // ─────────────────────────────────────────────────────────────────────

    /// Returns a fresh sector cursor.
    pub fn enumerate_sectors(&self) -> SectorCursor {
        SectorCursor::new()
    }

    /// Advances toward the newest sector, skipping non-valid sectors.
    ///
    /// An unpositioned cursor starts at the oldest sector. Returns `None`
    /// once the newest sector has been visited; the cursor is then
    /// unpositioned again.
    pub async fn next_sector(&self, cursor: &mut SectorCursor) -> Option<Sector> {
        loop {
            if cursor.addr == self.last_sector {
                cursor.addr = UNPOSITIONED;
                return None;
            }

            cursor.addr = if cursor.addr == UNPOSITIONED {
                self.first_sector
            } else {
                self.next_ring(cursor.addr)
            };

            let mut si = SectorInfo::default();
            self.format
                .scan_sector(self.storage.sector_span(cursor.addr), &mut si, None)
                .await;
            if si.is_valid() {
                return Some(Sector { addr: cursor.addr });
            }
        }
    }

    /// Advances toward the oldest sector, skipping non-valid sectors.
    ///
    /// An unpositioned cursor starts at the newest sector. Returns `None`
    /// once the oldest sector has been visited.
    pub async fn previous_sector(&self, cursor: &mut SectorCursor) -> Option<Sector> {
        loop {
            if cursor.addr == self.first_sector {
                cursor.addr = UNPOSITIONED;
                return None;
            }

            cursor.addr = if cursor.addr == UNPOSITIONED {
                self.last_sector
            } else {
                self.previous_ring(cursor.addr)
            };

            let mut si = SectorInfo::default();
            self.format
                .scan_sector(self.storage.sector_span(cursor.addr), &mut si, None)
                .await;
            if si.is_valid() {
                return Some(Sector { addr: cursor.addr });
            }
        }
    }

    /// Reads part of a sector, header included, at the cursor's position.
    /// Returns the bytes read, clamped to the sector; 0 if the cursor is
    /// unpositioned.
    pub async fn read_sector_header(
        &self,
        cursor: &SectorCursor,
        buf: &mut [u8],
        offset: usize,
    ) -> usize {
        let sector_size = self.storage.sector_size() as usize;
        let Some(sector) = cursor.sector() else {
            return 0;
        };
        if offset >= sector_size {
            return 0;
        }

        let n = buf.len().min(sector_size - offset);
        self.storage.read(sector.addr + offset as u32, &mut buf[..n]).await;
        n
    }

    /// Returns a record cursor at the start of `sector`.
    pub fn enumerate_records(&self, sector: Sector) -> RecordCursor {
        RecordCursor::new(sector)
    }

    /// Advances to the next valid record, skipping bad ones where the format
    /// allows. Returns the payload length, or `None` when the sector is
    /// exhausted (free space, full, or unskippable corruption).
    pub async fn next_record(&self, cursor: &mut RecordCursor) -> Option<usize> {
        // A poisoned cursor stays exhausted.
        if cursor.r_next == cursor.r.wrapping_sub(1) {
            return None;
        }

        if cursor.r == cursor.r_next && cursor.si.is_bad() {
            // First advance: the sector header tells us where records start.
            self.format
                .scan_sector(self.storage.sector_span(cursor.r), &mut cursor.si, None)
                .await;
            cursor.r_next = cursor.r + cursor.si.first_record as u32;
        }

        if !cursor.si.is_valid() {
            return None;
        }

        while self.storage.is_same_sector(cursor.r, cursor.r_next) {
            cursor.r = cursor.r_next;

            let mut ri = RecordInfo::default();
            let payload_offset = self
                .format
                .scan_record(
                    self.storage.rest_of_sector_span(cursor.r),
                    &cursor.si,
                    &mut ri,
                )
                .await;

            if ri.is_empty() {
                return None;
            }

            cursor.r_next = cursor.r + ri.next_record as u32;
            if ri.is_bad() {
                if cursor.r_next != cursor.r {
                    // The format knows the reserved length; skip over it.
                    continue;
                }
                // Unskippable: poison the cursor and stop.
                cursor.r_next = cursor.r.wrapping_sub(1);
                return None;
            }

            cursor.r += payload_offset as u32;
            cursor.len = ri.payload_len();
            return Some(ri.payload_len());
        }

        trace!(
            next = cursor.r_next,
            "record enumeration reached sector end"
        );
        None
    }

    /// Reads part of the current record's payload. Returns the bytes read,
    /// clamped to the record; 0 before the first [`next_record`](Self::next_record).
    pub async fn read_record(&self, cursor: &RecordCursor, buf: &mut [u8], offset: usize) -> usize {
        if !cursor.si.is_valid() || offset >= cursor.len {
            return 0;
        }

        let n = buf.len().min(cursor.len - offset);
        self.storage.read(cursor.r + offset as u32, &mut buf[..n]).await;
        n
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────

    /// Reserves space for a record of up to `length` payload bytes.
    ///
    /// The granted payload may be shorter than requested (format ceiling,
    /// remaining sector space). Returns `None` only when the ring cannot make
    /// progress, i.e. no sector on the medium accepts initialization.
    pub async fn begin_write(&mut self, length: usize) -> Option<RecordWriter<'a, S>> {
        let storage = self.storage;
        let sector_size = storage.sector_size();

        loop {
            if self.free_offset == 0 || self.free_offset >= sector_size {
                if !self.new_sector().await {
                    return None;
                }
                assert!(self.free_offset > 0 && self.free_offset < sector_size);
            }

            let mut ri = RecordInfo::default();
            let payload_offset = self
                .format
                .init_record(
                    storage.rest_of_sector_span(self.last_sector + self.free_offset),
                    &mut ri,
                    length,
                )
                .await;

            self.free_offset += ri.next_record as u32;
            self.max_record = (sector_size as i64
                - self.free_offset as i64
                - payload_offset as i64)
                .max(0) as usize;

            if ri.is_valid() {
                let payload_addr = self.last_sector + self.free_offset
                    - ri.next_record as u32
                    + payload_offset as u32;
                return Some(RecordWriter {
                    span: storage.span(payload_addr, ri.payload_len()),
                });
            }

            if !(ri.is_bad() && ri.next_record != 0) {
                // Cannot even skip forward; force a sector advance.
                self.free_offset = sector_size;
            }
        }
    }

    /// Commits a reserved record. The payload must be durable on the medium
    /// before this is called.
    pub async fn end_write(&self, writer: RecordWriter<'a, S>) {
        self.format.commit_record(writer.span).await;
    }

    /// Reserves, programs, and commits `data` as one record.
    ///
    /// Returns `false` when the ring cannot make progress. The stored payload
    /// is truncated if `data` exceeds what a record can carry; callers that
    /// need to know ask [`maximum_record`](Self::maximum_record) or use
    /// [`begin_write`](Self::begin_write) directly.
    pub async fn write(&mut self, data: &[u8]) -> bool {
        let Some(writer) = self.begin_write(data.len()).await else {
            return false;
        };
        writer.write(0, data).await;
        self.end_write(writer).await;
        true
    }

    /// Forces the next write into a freshly initialized sector.
    pub async fn close_sector(&mut self) {
        if self.free_offset != 0 {
            self.advance_sector().await;
        }
    }

    /// Moves `last_sector` to its ring successor, pushing `first_sector`
    /// ahead of it when the ring is about to eat its own tail.
    async fn advance_sector(&mut self) {
        self.last_sector = self.next_ring(self.last_sector);
        self.free_offset = 0;
        trace!(addr = self.last_sector, "advancing to next sector");

        if self.last_sector != self.first_sector {
            return;
        }

        // The oldest sector is about to be overwritten; move first_sector to
        // the next valid one.
        let mut addr = self.next_ring(self.first_sector);
        while addr != self.last_sector {
            let mut si = SectorInfo::default();
            self.format
                .scan_sector(self.storage.sector_span(addr), &mut si, None)
                .await;
            yield_now().await;

            if si.is_valid() {
                self.first_sector = addr;
                debug!(
                    addr,
                    sequence = si.sequence,
                    "moved first sector ahead of overwrite"
                );
                return;
            }
            addr = self.next_ring(addr);
        }

        // No other valid sector; the ring shrinks to the one being rewritten.
        trace!(addr = self.first_sector, "keeping first sector at last");
    }

    /// Erases and initializes the next sector, skipping sectors the format
    /// refuses. Returns `false` after every sector on the medium has refused
    /// once.
    async fn new_sector(&mut self) -> bool {
        if self.free_offset != 0 {
            self.advance_sector().await;
        }

        let sector_size = self.storage.sector_size();
        let mut failures = 0;
        loop {
            if !self
                .storage
                .is_empty(self.last_sector, sector_size as usize)
                .await
            {
                trace!(addr = self.last_sector, "erasing sector");
                self.storage.erase(self.last_sector, sector_size).await;
            }

            self.format
                .init_sector(self.storage.sector_span(self.last_sector), &mut self.last)
                .await;

            if self.last.is_valid() {
                self.free_offset = self.last.first_record as u32;
                trace!(
                    addr = self.last_sector,
                    sequence = self.last.sequence,
                    "initialized new sector"
                );
                return true;
            }

            debug!(addr = self.last_sector, "failed to initialize sector");
            failures += 1;
            if failures >= self.storage.sector_count() {
                return false;
            }
            self.advance_sector().await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ring arithmetic
    // ─────────────────────────────────────────────────────────────────────

    fn previous_ring(&self, addr: u32) -> u32 {
        let base = if addr == 0 { self.storage.size() } else { addr };
        base - self.storage.sector_size()
    }

    fn next_ring(&self, addr: u32) -> u32 {
        let next = addr + self.storage.sector_size();
        if next == self.storage.size() { 0 } else { next }
    }
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod journal_tests;
