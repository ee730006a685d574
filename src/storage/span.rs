//! Bounded sub-range views over a [`ByteStorage`].
//!
//! A [`StorageSpan`] is a copyable `(storage, base, length)` value; every
//! operation adds the base offset and clamps the length to the span, so code
//! holding a span cannot touch bytes outside it. The span borrows the storage,
//! which keeps it from outliving the medium.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::storage::byte_storage::{ByteStorage, Timeout};

/// A clamped view of a contiguous byte range of one storage.
///
/// Obtained from [`ByteStorage::span`], [`ByteStorage::sector_span`], or
/// [`ByteStorage::rest_of_sector_span`]; construction asserts that the range
/// lies inside the medium.
#[derive(Debug)]
pub struct StorageSpan<'a, S: ByteStorage> {
    storage: &'a S,
    addr: u32,
    length: usize,
}

impl<S: ByteStorage> Clone for StorageSpan<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: ByteStorage> Copy for StorageSpan<'_, S> {}

impl<'a, S: ByteStorage> StorageSpan<'a, S> {
    pub(crate) fn new(storage: &'a S, addr: u32, length: usize) -> Self {
        assert!(addr as u64 + length as u64 <= storage.size() as u64);
        Self {
            storage,
            addr,
            length,
        }
    }

    /// Offset of the span's first byte within the underlying storage.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.addr
    }

    /// Length of the span in bytes.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.length
    }

    /// The storage this span is a view of.
    #[inline]
    pub fn storage(&self) -> &'a S {
        self.storage
    }

    /// Bytes actually covered by `(offset, length)` after clamping.
    #[inline]
    fn limit(&self, offset: usize, length: usize) -> usize {
        self.length.saturating_sub(offset).min(length)
    }

    /// Reads into `buf`, clamped to the span. Returns the bytes read.
    pub async fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        let n = self.limit(offset, buf.len());
        if n == 0 {
            return 0;
        }
        self.storage.read(self.addr + offset as u32, &mut buf[..n]).await;
        n
    }

    /// Programs `data`, clamped to the span. Returns the bytes written.
    pub async fn write(&self, offset: usize, data: &[u8]) -> usize {
        let n = self.limit(offset, data.len());
        if n == 0 {
            return 0;
        }
        self.storage.write(self.addr + offset as u32, &data[..n]).await;
        n
    }

    /// ANDs `value` into the clamped range.
    pub async fn fill(&self, offset: usize, value: u8, length: usize) -> usize {
        let n = self.limit(offset, length);
        if n == 0 {
            return 0;
        }
        self.storage.fill(self.addr + offset as u32, value, n).await;
        n
    }

    /// Returns whether every byte of the clamped range equals `value`.
    pub async fn is_all(&self, offset: usize, value: u8, length: usize) -> bool {
        let n = self.limit(offset, length);
        if n == 0 {
            return true;
        }
        self.storage.is_all(self.addr + offset as u32, value, n).await
    }

    /// Returns whether the whole span is erased.
    pub async fn is_erased(&self) -> bool {
        self.is_all(0, crate::constants::ERASED, self.length).await
    }

    /// Streams the clamped range into `pipe`; returns bytes delivered.
    pub async fn read_to_pipe<W>(
        &self,
        pipe: &mut W,
        offset: usize,
        length: usize,
        timeout: Timeout,
    ) -> usize
    where
        W: AsyncWrite + Unpin,
    {
        let n = self.limit(offset, length);
        if n == 0 {
            return 0;
        }
        self.storage
            .read_to_pipe(pipe, self.addr + offset as u32, n, timeout)
            .await
    }

    /// Programs the clamped range from `pipe`; returns bytes written.
    pub async fn write_from_pipe<R>(
        &self,
        pipe: &mut R,
        offset: usize,
        length: usize,
        timeout: Timeout,
    ) -> usize
    where
        R: AsyncRead + Unpin,
    {
        let n = self.limit(offset, length);
        if n == 0 {
            return 0;
        }
        self.storage
            .write_from_pipe(pipe, self.addr + offset as u32, n, timeout)
            .await
    }
}
