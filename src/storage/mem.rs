//! In-memory NOR flash simulation.
//!
//! [`MemStorage`] backs every test and bench in the crate. It honours the full
//! erase-before-write contract: the medium starts erased, programming ANDs
//! into existing bytes, and only whole-sector erases restore set bits. Work is
//! split at program-page boundaries with a cooperative yield per chunk, so the
//! suspension behaviour of a real driver is exercised even in tests.
//!
//! Power loss is simulated with a *write fuse*: once armed with a byte count,
//! programming silently stops after that many bytes have landed, exactly as a
//! device that lost power mid-operation leaves a prefix of the bytes
//! programmed.
//! Single-byte corruption can be injected directly, bypassing AND semantics.
//!
//! Interior mutability makes the type `!Sync`; it is strictly single-threaded,
//! matching the journal's single-writer model.

use std::cell::{Cell, RefCell};

use tokio::task::yield_now;

use crate::constants::{ERASED, PROGRAM_PAGE_SIZE, SECTOR_SIZE_MAX, SECTOR_SIZE_MIN};
use crate::storage::byte_storage::ByteStorage;

/// Simulated byte storage held in a heap buffer.
pub struct MemStorage {
    data: RefCell<Box<[u8]>>,
    sector_size: u32,
    /// Total bytes programmed (landed on the medium) so far.
    programmed: Cell<u64>,
    /// Remaining programmable bytes before simulated power loss; `None` when
    /// disarmed.
    fuse: Cell<Option<u64>>,
}

impl MemStorage {
    /// Creates an erased medium of `size` bytes with the given sector size.
    ///
    /// # Panics
    ///
    /// - `sector_size` not a power of two or outside the supported bounds
    /// - `size` zero or not a multiple of `sector_size`
    pub fn new(size: u32, sector_size: u32) -> Self {
        assert!(sector_size.is_power_of_two());
        assert!((SECTOR_SIZE_MIN..=SECTOR_SIZE_MAX).contains(&sector_size));
        assert!(size > 0);
        assert!(size % sector_size == 0);

        Self {
            data: RefCell::new(vec![ERASED; size as usize].into_boxed_slice()),
            sector_size,
            programmed: Cell::new(0),
            fuse: Cell::new(None),
        }
    }

    /// Arms the write fuse: after `bytes` more programmed bytes, all further
    /// programming and erasing is silently dropped.
    pub fn arm_write_fuse(&self, bytes: u64) {
        self.fuse.set(Some(bytes));
    }

    /// Disarms the write fuse, restoring normal programming.
    pub fn disarm_write_fuse(&self) {
        self.fuse.set(None);
    }

    /// Bytes programmed onto the medium so far. Lets a test replay a run and
    /// cut it at every possible prefix.
    pub fn programmed_bytes(&self) -> u64 {
        self.programmed.get()
    }

    /// XORs `mask` into the byte at `addr`, bypassing program semantics.
    pub fn corrupt(&self, addr: u32, mask: u8) {
        assert!(addr < self.size());
        self.data.borrow_mut()[addr as usize] ^= mask;
    }

    fn check_range(&self, addr: u32, length: usize) {
        assert!(addr as u64 + length as u64 <= self.size() as u64);
    }

    fn page_remaining(addr: u32) -> usize {
        PROGRAM_PAGE_SIZE - (addr as usize & (PROGRAM_PAGE_SIZE - 1))
    }

    /// Programs `length` bytes at `addr`, sourcing byte `i` from `src(i)`,
    /// honouring the write fuse.
    fn program(&self, addr: u32, length: usize, src: impl Fn(usize) -> u8) {
        let allowed = match self.fuse.get() {
            None => length,
            Some(remaining) => {
                let allowed = length.min(remaining as usize);
                self.fuse.set(Some(remaining - allowed as u64));
                allowed
            }
        };

        let mut data = self.data.borrow_mut();
        for i in 0..allowed {
            data[addr as usize + i] &= src(i);
        }
        self.programmed.set(self.programmed.get() + allowed as u64);
    }
}

impl ByteStorage for MemStorage {
    fn size(&self) -> u32 {
        self.data.borrow().len() as u32
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    async fn read(&self, addr: u32, buf: &mut [u8]) {
        self.check_range(addr, buf.len());

        let mut done = 0;
        while done < buf.len() {
            yield_now().await;
            let chunk = (buf.len() - done).min(PROGRAM_PAGE_SIZE);
            let data = self.data.borrow();
            buf[done..done + chunk]
                .copy_from_slice(&data[addr as usize + done..addr as usize + done + chunk]);
            done += chunk;
        }
    }

    async fn write(&self, addr: u32, data: &[u8]) {
        self.check_range(addr, data.len());

        let mut done = 0;
        while done < data.len() {
            let chunk = (data.len() - done).min(Self::page_remaining(addr + done as u32));
            yield_now().await;
            self.program(addr + done as u32, chunk, |i| data[done + i]);
            done += chunk;
        }
    }

    async fn fill(&self, addr: u32, value: u8, length: usize) {
        self.check_range(addr, length);

        let mut done = 0;
        while done < length {
            let chunk = (length - done).min(Self::page_remaining(addr + done as u32));
            yield_now().await;
            self.program(addr + done as u32, chunk, |_| value);
            done += chunk;
        }
    }

    async fn is_all(&self, addr: u32, value: u8, length: usize) -> bool {
        self.check_range(addr, length);

        let mut done = 0;
        while done < length {
            yield_now().await;
            let chunk = (length - done).min(PROGRAM_PAGE_SIZE);
            let data = self.data.borrow();
            if data[addr as usize + done..addr as usize + done + chunk]
                .iter()
                .any(|&b| b != value)
            {
                return false;
            }
            done += chunk;
        }
        true
    }

    async fn erase_first(&self, addr: u32, length: u32) -> u32 {
        self.check_range(addr, length as usize);

        let mask = self.sector_mask();
        let start = addr & !mask;
        let end = ((addr as u64 + length as u64 + mask as u64) & !(mask as u64)) as u32;

        if start as u64 + self.sector_size as u64 > end as u64 {
            tracing::trace!(start, end, "invalid erase range");
            return addr;
        }

        yield_now().await;
        if self.fuse.get() != Some(0) {
            let sector = start as usize..(start + self.sector_size) as usize;
            self.data.borrow_mut()[sector].fill(ERASED);
        }
        start + self.sector_size
    }

    async fn sync(&self) {
        yield_now().await;
    }
}
