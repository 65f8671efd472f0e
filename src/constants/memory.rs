//! Physical and virtual memory layout.
//!
//! These values are part of the translation format rather than tunables:
//! a two-level page structure of 1024 four-byte entries per level, 4 KiB
//! pages, the directory's last slot mapping the directory onto itself, and
//! the kernel owning directory slots 0..256.

pub const PAGE_SIZE: u32 = 4096;
pub const FRAME_SIZE: u32 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Entries per page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;
/// Bytes per directory/table entry.
pub const ENTRY_SIZE: u32 = 4;

/// Directory slots 0..KERNEL_DIR_ENTRIES mirror the kernel's directory in
/// every address space.
pub const KERNEL_DIR_ENTRIES: usize = 256;
/// Directory slot holding the self-referencing entry.
pub const SELF_MAP_INDEX: usize = 1023;

/// Ceiling on tracked physical memory: 1 GiB of 4 KiB frames.
pub const RAM_MAX_PAGES: usize = 0x4_0000;
pub const BITMAP_ENTRY_BITS: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = u64::MAX;

/// Physical address of the kernel page directory.
pub const KERNEL_DIRECTORY: u32 = 0x0000_1000;
/// First kernel 4 MiB page, identity mapped (kernel code and data).
pub const KERNEL_PAGE_0: u32 = 0x0000_0000;
/// Second kernel 4 MiB page, identity mapped; also holds the pre-built
/// kernel page tables for directory slots 2..1023.
pub const KERNEL_PAGE_1: u32 = 0x0040_0000;
/// Frames below this address belong to the kernel image and its tables.
pub const KERNEL_RESERVED_END: u32 = 0x0080_0000;

/// Kernel heap window, grown page-by-page on demand.
pub const HEAP_START: u32 = 0x0080_0000;
pub const HEAP_LIMIT: u32 = 0x1000_0000;

/// Kernel page heap: single pages handed out from the free-VM list.
pub const PAGE_HEAP_START: u32 = 0x1000_0000;
pub const PAGE_HEAP_LIMIT: u32 = 0x4000_0000;

/// First user-space virtual address (directory slot 256).
pub const USER_OFFSET: u32 = 0x4000_0000;

/// Virtual address of the directory itself through the self-map.
pub const RECURSIVE_DIR_BASE: u32 = 0xFFFF_F000;
/// Base of the recursive page-table window.
pub const RECURSIVE_TABLE_BASE: u32 = 0xFFC0_0000;

/// Smallest heap record: header plus enough payload that splitting a chunk
/// always leaves both halves usable.
pub const MIN_CHUNK_SIZE: u32 = 16;
/// Bytes of chunk header preceding each heap payload.
pub const CHUNK_HEADER_SIZE: u32 = 4;
