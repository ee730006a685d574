//! The pluggable sector/record layout behind the journal engine.
//!
//! [`JournalFormat`] is the seam between the ring engine and the bytes it
//! stamps onto the medium. The engine never sees a format's header types;
//! [`SectorInfo`] and [`RecordInfo`] are the only shared vocabulary. A format
//! decides what a sector or record header looks like, whether existing bytes
//! are valid, and how a reserved record is atomically promoted to a committed
//! one.

use crate::storage::{ByteStorage, StorageSpan};

/// Classification of a whole sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SectorState {
    /// Header present but unusable (wrong magic, torn header, corruption).
    #[default]
    Bad,
    /// Fully erased, ready for initialization.
    Empty,
    /// Carries a valid header and possibly records.
    Valid,
    /// Valid, and its sequence immediately precedes the reference sector
    /// passed to the scan.
    ValidPreceding,
}

/// Classification of one record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    /// Header present but the record never committed, or is corrupt.
    #[default]
    Bad,
    /// Erased bytes; marks the free space at the end of a sector.
    Empty,
    /// Committed record with a readable payload.
    Valid,
}

/// What a format reports about a sector.
///
/// `sequence`, `first_record` and `fixed_record_size` are meaningful only when
/// the state is valid. The default is `Bad` with zeroed fields, which doubles
/// as the "not yet scanned" marker in cursors.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectorInfo {
    /// Monotone per-sector sequence number, compared wrap-aware.
    pub sequence: u32,
    /// Byte offset from the sector start to the first record header.
    pub first_record: u16,
    /// 0 for variable-length sectors, else the fixed record stride.
    pub fixed_record_size: u8,
    /// Sector classification.
    pub state: SectorState,
}

impl SectorInfo {
    #[inline]
    pub fn is_bad(&self) -> bool {
        self.state == SectorState::Bad
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state == SectorState::Empty
    }

    /// True for both `Valid` and `ValidPreceding`.
    #[inline]
    pub fn is_valid(&self) -> bool {
        matches!(self.state, SectorState::Valid | SectorState::ValidPreceding)
    }

    #[inline]
    pub fn is_preceding(&self) -> bool {
        self.state == SectorState::ValidPreceding
    }
}

/// What a format reports about a record slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordInfo {
    /// Payload length in bytes; meaningful when the record is valid.
    pub payload: u16,
    /// Offset from the start of the scanned remaining-of-sector span to the
    /// next record header. Set when valid; may be set for a bad record to
    /// allow skipping over it, and left 0 when the bad record cannot be
    /// skipped.
    pub next_record: u16,
    /// Record classification.
    pub state: RecordState,
}

impl RecordInfo {
    #[inline]
    pub fn is_bad(&self) -> bool {
        self.state == RecordState::Bad
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state == RecordState::Empty
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.state == RecordState::Valid
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload as usize
    }

    #[inline]
    pub fn next_record_offset(&self) -> usize {
        self.next_record as usize
    }
}

/// Strategy object that stamps and inspects sectors and records.
///
/// All spans handed to a format are bounded: `sector` spans cover exactly one
/// sector, `sector_remaining` spans run from a record position to the end of
/// its sector. A format must never touch bytes outside the span it is given.
#[allow(async_fn_in_trait)]
pub trait JournalFormat {
    /// Classifies a sector.
    ///
    /// When `following` is supplied, a valid sector whose sequence is exactly
    /// one less (wrap-aware) than `following.sequence` is reported
    /// [`SectorState::ValidPreceding`] instead of plain `Valid`. On any valid
    /// outcome, `info.sequence`, `info.first_record` and
    /// `info.fixed_record_size` are filled in.
    async fn scan_sector<S: ByteStorage>(
        &self,
        sector: StorageSpan<'_, S>,
        info: &mut SectorInfo,
        following: Option<&SectorInfo>,
    );

    /// Inspects the record header at the start of `sector_remaining`.
    ///
    /// `sector_info` is the result of [`scan_sector`](Self::scan_sector) for
    /// the containing sector. Returns the byte offset from the start of
    /// `sector_remaining` to the payload.
    async fn scan_record<S: ByteStorage>(
        &self,
        sector_remaining: StorageSpan<'_, S>,
        sector_info: &SectorInfo,
        info: &mut RecordInfo,
    ) -> usize;

    /// Writes a fresh header into an erased sector.
    ///
    /// On entry `info` holds the most recent sector's info; the format assigns
    /// `info.sequence = previous + 1` when that info was valid, else starts at
    /// 1. On success the state is `Valid` and `first_record` /
    /// `fixed_record_size` are filled; on failure the state is `Bad`.
    async fn init_sector<S: ByteStorage>(&self, sector: StorageSpan<'_, S>, info: &mut SectorInfo);

    /// Reserves space for a record of up to `payload` bytes.
    ///
    /// The format clamps the request to what fits (and to its own ceiling),
    /// writes the header in unfinished form, and reports the granted payload
    /// length and the offset of the next record. Returns the byte offset from
    /// the start of `sector_remaining` to the payload. When nothing fits the
    /// state is `Bad` and `next_record` is 0, telling the engine to advance
    /// to a new sector.
    async fn init_record<S: ByteStorage>(
        &self,
        sector_remaining: StorageSpan<'_, S>,
        info: &mut RecordInfo,
        payload: usize,
    ) -> usize;

    /// Promotes a reserved record to a committed one.
    ///
    /// `payload` is the span returned by the reservation. The promotion must
    /// be a single programming step that cannot be observed half-applied as a
    /// valid record: after a crash the record is either valid or still
    /// unfinished.
    async fn commit_record<S: ByteStorage>(&self, payload: StorageSpan<'_, S>);
}
