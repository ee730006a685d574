//! Contract for erase-before-write byte-addressable storage.
//!
//! [`ByteStorage`] models NOR-flash-like media: the medium is divided into
//! fixed-size sectors, erasing a sector sets every byte to `0xFF`, and
//! programming can only clear bits (each written byte is AND-ed into the
//! existing content). Flipping a `0` back to a `1` requires erasing the whole
//! sector that contains it.
//!
//! Every medium-touching method is `async`: awaiting it is a suspension point
//! at which the backing driver may poll a busy device, wait for a bus, or
//! simply yield to other tasks. Implementations are single-writer and take
//! `&self`; a shared bus below the trait serialises itself.
//!
//! # Address model
//!
//! Addresses are `u32` byte offsets from the start of the medium. `size` must
//! be a multiple of `sector_size`, and `sector_size` must be a power of two,
//! so sector `i` covers `[i * sector_size, (i + 1) * sector_size)`.

use core::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{ERASED, PROGRAM_PAGE_SIZE};
use crate::storage::span::StorageSpan;

/// Bound on how long a streaming operation may wait for its pipe peer.
///
/// Timeouts apply per transferred chunk, not to the whole operation; a slow
/// but live peer never trips them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait for the peer indefinitely.
    Infinite,
    /// Give up on the current chunk after this long.
    After(Duration),
}

impl Timeout {
    /// Runs `fut` under this timeout. `None` means the deadline elapsed.
    pub(crate) async fn bound<F: Future>(self, fut: F) -> Option<F::Output> {
        match self {
            Timeout::Infinite => Some(fut.await),
            Timeout::After(limit) => tokio::time::timeout(limit, fut).await.ok(),
        }
    }
}

/// Byte-addressable storage that can be erased only by whole sectors.
///
/// Out-of-range access is a programmer error and panics; implementations
/// assert every address range against [`size`](ByteStorage::size).
#[allow(async_fn_in_trait)]
pub trait ByteStorage {
    /// Total size of the medium in bytes. Multiple of the sector size.
    fn size(&self) -> u32;

    /// Sector (erase unit) size in bytes. Power of two.
    fn sector_size(&self) -> u32;

    /// Reads `buf.len()` bytes starting at `addr`.
    async fn read(&self, addr: u32, buf: &mut [u8]);

    /// Programs `data` at `addr`, AND-ing each byte into the current content.
    ///
    /// Writing to bytes that are not erased (or otherwise AND-compatible with
    /// `data`) silently loses the set bits; callers that need the exact value
    /// back must program erased bytes only.
    async fn write(&self, addr: u32, data: &[u8]);

    /// ANDs `value` into every byte of `[addr, addr + length)`.
    async fn fill(&self, addr: u32, value: u8, length: usize);

    /// Returns whether every byte of `[addr, addr + length)` equals `value`.
    /// An empty range is trivially uniform.
    async fn is_all(&self, addr: u32, value: u8, length: usize) -> bool;

    /// Erases one sector at the front of the (sector-rounded) range.
    ///
    /// Returns the address just past the erased sector, i.e. where the caller
    /// should continue, or `addr` unchanged if nothing could be erased. This
    /// lets callers erase large ranges cooperatively, yielding between
    /// sectors.
    async fn erase_first(&self, addr: u32, length: u32) -> u32;

    /// Resolves once all previously submitted programming has drained to the
    /// medium.
    async fn sync(&self);

    /// Returns whether `[addr, addr + length)` is fully erased.
    async fn is_empty(&self, addr: u32, length: usize) -> bool {
        self.is_all(addr, ERASED, length).await
    }

    /// Erases every sector overlapping `[addr, addr + length)`.
    ///
    /// Returns `false` if any sector refused to erase; sectors before the
    /// failure point stay erased.
    async fn erase(&self, addr: u32, length: u32) -> bool {
        let mask = self.sector_mask();
        let mut start = addr & !mask;
        let end = ((addr as u64 + length as u64 + mask as u64) & !(mask as u64)) as u32;
        assert!(end as u64 <= self.size() as u64);

        while start < end {
            let next = self.erase_first(start, end - start).await;
            if next == start {
                return false;
            }
            start = next;
        }
        true
    }

    /// Streams `length` bytes starting at `addr` into a hardware register.
    ///
    /// Every byte is written to the same address through a volatile store, as
    /// a memory-mapped peripheral FIFO expects.
    ///
    /// # Safety
    ///
    /// `reg` must be valid for volatile single-byte writes for the whole call.
    async unsafe fn read_to_register(&self, addr: u32, reg: *mut u8, length: usize) {
        assert!(addr as u64 + length as u64 <= self.size() as u64);

        let mut buf = [0u8; PROGRAM_PAGE_SIZE];
        let mut done = 0;
        while done < length {
            let chunk = (length - done).min(PROGRAM_PAGE_SIZE);
            self.read(addr + done as u32, &mut buf[..chunk]).await;
            for &byte in &buf[..chunk] {
                // SAFETY: caller guarantees `reg` is valid for volatile writes.
                unsafe { core::ptr::write_volatile(reg, byte) };
            }
            done += chunk;
        }
    }

    /// Streams `length` bytes starting at `addr` into `pipe`.
    ///
    /// Transfers one program page at a time; returns the number of bytes
    /// delivered, which is less than `length` if the pipe closed or a chunk
    /// timed out.
    async fn read_to_pipe<W>(
        &self,
        pipe: &mut W,
        addr: u32,
        length: usize,
        timeout: Timeout,
    ) -> usize
    where
        W: AsyncWrite + Unpin,
        Self: Sized,
    {
        assert!(addr as u64 + length as u64 <= self.size() as u64);

        let mut buf = [0u8; PROGRAM_PAGE_SIZE];
        let mut done = 0;
        while done < length {
            let chunk = (length - done).min(PROGRAM_PAGE_SIZE);
            self.read(addr + done as u32, &mut buf[..chunk]).await;
            match timeout.bound(pipe.write_all(&buf[..chunk])).await {
                Some(Ok(())) => done += chunk,
                Some(Err(_)) | None => break,
            }
        }
        done
    }

    /// Programs `length` bytes starting at `addr` from `pipe`.
    ///
    /// Returns the number of bytes programmed; short if the pipe closed or a
    /// chunk timed out before `length` bytes arrived.
    async fn write_from_pipe<R>(
        &self,
        pipe: &mut R,
        addr: u32,
        length: usize,
        timeout: Timeout,
    ) -> usize
    where
        R: AsyncRead + Unpin,
        Self: Sized,
    {
        assert!(addr as u64 + length as u64 <= self.size() as u64);

        let mut buf = [0u8; PROGRAM_PAGE_SIZE];
        let mut done = 0;
        while done < length {
            let want = (length - done).min(PROGRAM_PAGE_SIZE);
            match timeout.bound(pipe.read(&mut buf[..want])).await {
                Some(Ok(0)) | Some(Err(_)) | None => break,
                Some(Ok(got)) => {
                    self.write(addr + done as u32, &buf[..got]).await;
                    done += got;
                }
            }
        }
        done
    }

    // ─────────────────────────────────────────────────────────────────────
    // Geometry helpers
    // ─────────────────────────────────────────────────────────────────────

    /// `sector_size - 1`; the low bits of an address within its sector.
    #[inline]
    fn sector_mask(&self) -> u32 {
        self.sector_size() - 1
    }

    /// Address of the first byte of the sector containing `addr`.
    #[inline]
    fn sector_address(&self, addr: u32) -> u32 {
        addr & !self.sector_mask()
    }

    /// Returns whether `a` and `b` fall in the same sector.
    #[inline]
    fn is_same_sector(&self, a: u32, b: u32) -> bool {
        ((a ^ b) & !self.sector_mask()) == 0
    }

    /// Bytes from `addr` to the end of its sector, inclusive of `addr`.
    #[inline]
    fn sector_remaining(&self, addr: u32) -> usize {
        ((!addr & self.sector_mask()) + 1) as usize
    }

    /// Number of sectors on the medium.
    #[inline]
    fn sector_count(&self) -> u32 {
        self.size() / self.sector_size()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Span constructors
    // ─────────────────────────────────────────────────────────────────────

    /// Returns a sub-range view. Panics if the range exceeds the medium.
    fn span(&self, addr: u32, length: usize) -> StorageSpan<'_, Self>
    where
        Self: Sized,
    {
        StorageSpan::new(self, addr, length)
    }

    /// Returns the span of the whole sector containing `addr`.
    fn sector_span(&self, addr: u32) -> StorageSpan<'_, Self>
    where
        Self: Sized,
    {
        assert!(addr < self.size());
        StorageSpan::new(self, self.sector_address(addr), self.sector_size() as usize)
    }

    /// Returns the span from `addr` to the end of its sector.
    fn rest_of_sector_span(&self, addr: u32) -> StorageSpan<'_, Self>
    where
        Self: Sized,
    {
        assert!(addr < self.size());
        StorageSpan::new(self, addr, self.sector_remaining(addr))
    }
}
