//! The kernel heap.
//!
//! A boundary-tag free-list allocator over the kernel heap window. Chunks
//! are laid out back to back with no gaps, each introduced by one header
//! word (bit 31 = used, low bits = total record size), so the next chunk
//! always starts at the current address plus the current size. The region
//! grows a page at a time through the frame allocator and the shared
//! kernel tables.

use alloc::vec::Vec;

use crate::constants::memory::{
    CHUNK_HEADER_SIZE, HEAP_LIMIT, HEAP_START, MIN_CHUNK_SIZE, PAGE_SIZE,
};
use crate::fatal;
use crate::kernel::Kernel;
use crate::memory::address::VirtAddr;
use crate::memory::paging::PageFlags;

const USED_FLAG: u32 = 1 << 31;
const SIZE_MASK: u32 = USED_FLAG - 1;

#[derive(Debug, Clone, Copy)]
struct ChunkHeader {
    size: u32,
    used: bool,
}

impl Kernel {
    fn read_chunk(&self, at: VirtAddr) -> ChunkHeader {
        let word = self.virt_read_u32(at);
        ChunkHeader {
            size: word & SIZE_MASK,
            used: word & USED_FLAG != 0,
        }
    }

    fn write_chunk(&mut self, at: VirtAddr, header: ChunkHeader) {
        let word = header.size | if header.used { USED_FLAG } else { 0 };
        self.virt_write_u32(at, word);
    }

    /// Extends the heap by `pages` freshly mapped pages and stamps the new
    /// region as one free chunk at the old break.
    pub(crate) fn ksbrk(&mut self, pages: u32) -> VirtAddr {
        let chunk_at = self.heap_break;
        let new_break = chunk_at.as_u32() as u64 + pages as u64 * PAGE_SIZE as u64;
        if new_break > HEAP_LIMIT as u64 {
            fatal!("no virtual memory left for the kernel heap");
        }
        for _ in 0..pages {
            let frame = match self.frames.allocate_frame() {
                Some(frame) => frame,
                None => fatal!("no free page frame available for the kernel heap"),
            };
            if let Err(err) = self.map_kernel(self.heap_break, frame, PageFlags::empty()) {
                fatal!("kernel heap mapping failed: {}", err);
            }
            self.heap_break = self.heap_break.add(PAGE_SIZE);
        }
        self.write_chunk(
            chunk_at,
            ChunkHeader {
                size: pages * PAGE_SIZE,
                used: false,
            },
        );
        chunk_at
    }

    /// Allocates `size` bytes from the kernel heap.
    ///
    /// Requests are padded to the minimum record size, satisfied by the
    /// first fitting free chunk (splitting it unless the leftover would be
    /// unusably small), and the heap is grown when the scan reaches the
    /// break. Returns `None` only for a zero-size request; failure to grow
    /// is unrecoverable.
    pub fn kmalloc(&mut self, size: u32) -> Option<VirtAddr> {
        if size == 0 {
            return None;
        }
        let record_size = match size.checked_add(CHUNK_HEADER_SIZE) {
            Some(record_size) => record_size.max(MIN_CHUNK_SIZE),
            None => fatal!("kernel heap request of {} bytes overflows", size),
        };

        let mut chunk_at = VirtAddr::new(HEAP_START);
        let chunk = loop {
            if chunk_at == self.heap_break {
                self.ksbrk(record_size.div_ceil(PAGE_SIZE) + 1);
            } else if chunk_at > self.heap_break {
                fatal!(
                    "corrupted kernel heap: chunk at {} while the break is {}",
                    chunk_at,
                    self.heap_break
                );
            }
            let chunk = self.read_chunk(chunk_at);
            if chunk.size == 0 {
                fatal!("corrupted kernel heap: chunk at {} with null size", chunk_at);
            }
            if !chunk.used && chunk.size >= record_size {
                break chunk;
            }
            chunk_at = chunk_at.add(chunk.size);
        };

        // Splitting only pays off when the remainder can hold a minimum
        // chunk of its own.
        let used_size = if chunk.size - record_size < MIN_CHUNK_SIZE {
            self.write_chunk(
                chunk_at,
                ChunkHeader {
                    size: chunk.size,
                    used: true,
                },
            );
            chunk.size
        } else {
            self.write_chunk(
                chunk_at.add(record_size),
                ChunkHeader {
                    size: chunk.size - record_size,
                    used: false,
                },
            );
            self.write_chunk(
                chunk_at,
                ChunkHeader {
                    size: record_size,
                    used: true,
                },
            );
            record_size
        };
        self.heap_used += used_size;

        Some(chunk_at.add(CHUNK_HEADER_SIZE))
    }

    /// Returns a heap block. A null address is ignored.
    ///
    /// The freed chunk is merged with a free predecessor and with every
    /// free chunk that follows it, so adjacent free chunks always collapse
    /// into one regardless of the order they were freed in.
    pub fn kfree(&mut self, addr: VirtAddr) {
        if addr.as_u32() == 0 {
            return;
        }
        let chunk_at = addr.sub(CHUNK_HEADER_SIZE);

        // Locate the chunk and its predecessor from the heap base; an
        // address that lands between chunk boundaries means the chain is
        // gone.
        let mut previous: Option<(VirtAddr, ChunkHeader)> = None;
        let mut cursor = VirtAddr::new(HEAP_START);
        while cursor < chunk_at {
            let header = self.read_chunk(cursor);
            if header.size == 0 {
                fatal!("corrupted kernel heap: chunk at {} with null size", cursor);
            }
            previous = Some((cursor, header));
            cursor = cursor.add(header.size);
            if cursor > self.heap_break {
                fatal!(
                    "corrupted kernel heap: chunk at {} while the break is {}",
                    cursor,
                    self.heap_break
                );
            }
        }
        if cursor != chunk_at {
            fatal!("free of {} which is not a kernel heap block", addr);
        }

        let header = self.read_chunk(chunk_at);
        if !header.used {
            log::warn!("double free of kernel heap block at {}", addr);
            return;
        }
        self.heap_used -= header.size;

        let (merged_at, mut merged) = match previous {
            Some((prev_at, prev)) if !prev.used => (
                prev_at,
                ChunkHeader {
                    size: prev.size + header.size,
                    used: false,
                },
            ),
            _ => (
                chunk_at,
                ChunkHeader {
                    size: header.size,
                    used: false,
                },
            ),
        };
        loop {
            let next_at = merged_at.add(merged.size);
            if next_at >= self.heap_break {
                break;
            }
            let next = self.read_chunk(next_at);
            if !next.used {
                merged.size += next.size;
            } else {
                break;
            }
        }
        self.write_chunk(merged_at, merged);
    }

    /// Total bytes currently allocated, counted in record sizes.
    pub fn heap_used_bytes(&self) -> u32 {
        self.heap_used
    }

    /// Current end of the mapped heap extent.
    pub fn heap_end(&self) -> VirtAddr {
        self.heap_break
    }

    /// Snapshot of the chunk chain as (address, record size, used), for
    /// diagnostics.
    pub fn heap_chunks(&self) -> Vec<(VirtAddr, u32, bool)> {
        let mut chunks = Vec::new();
        let mut cursor = VirtAddr::new(HEAP_START);
        while cursor < self.heap_break {
            let header = self.read_chunk(cursor);
            if header.size == 0 {
                fatal!("corrupted kernel heap: chunk at {} with null size", cursor);
            }
            chunks.push((cursor, header.size, header.used));
            cursor = cursor.add(header.size);
        }
        chunks
    }
}
