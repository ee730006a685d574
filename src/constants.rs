//! Crate-wide geometry constants and compile-time design checks.
//!
//! Size constants use `u32` for addresses (byte-addressable NOR parts top out
//! well below 4 GiB) and `usize` for in-memory lengths.

/// Smallest sector (erase unit) size a backing medium may report.
pub const SECTOR_SIZE_MIN: u32 = 256;

/// Typical NOR flash sector size.
pub const SECTOR_SIZE_DEFAULT: u32 = 4096;

/// Largest supported sector size (large-block devices).
pub const SECTOR_SIZE_MAX: u32 = 65536;

/// Program-page granularity used when chunking streamed I/O.
///
/// SPI-NOR devices program at most one 256-byte page per operation; the
/// default pipe/register streaming paths and the in-memory backing split
/// their work at this granularity so every chunk is a suspension point.
pub const PROGRAM_PAGE_SIZE: usize = 256;

/// Byte value of erased storage.
pub const ERASED: u8 = 0xFF;

// Compile-time proof that u32 -> usize is safe on this platform.
const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

const _: () = {
    assert!(SECTOR_SIZE_MIN.is_power_of_two());
    assert!(SECTOR_SIZE_DEFAULT.is_power_of_two());
    assert!(SECTOR_SIZE_MAX.is_power_of_two());
    assert!(SECTOR_SIZE_MIN <= SECTOR_SIZE_DEFAULT);
    assert!(SECTOR_SIZE_DEFAULT <= SECTOR_SIZE_MAX);

    assert!(PROGRAM_PAGE_SIZE.is_power_of_two());
    assert!(PROGRAM_PAGE_SIZE <= SECTOR_SIZE_MIN as usize);
};
