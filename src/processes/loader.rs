//! The executable-image loader boundary.
//!
//! The loader itself is an external collaborator: it understands the image
//! format, while this module defines what it is given to work with. A
//! loader receives the raw image bytes and a [`UserSpace`] over the
//! freshly activated address space, copies each loadable segment to its
//! required virtual address (zero-filling any tail beyond the stored
//! size), and reports the entry point plus the code/read-only range and
//! the zero-initialized range. An image without a writable segment
//! reports an empty zero-fill range at the end of the code range.

use alloc::vec::Vec;
use core::fmt;

use crate::constants::memory::USER_OFFSET;
use crate::constants::processes::USER_STACK_TOP;
use crate::kernel::Kernel;
use crate::memory::address::VirtAddr;
use crate::memory::paging::{DirId, PageFlags};
use crate::processes::process::UserPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The buffer is not a valid executable image.
    BadFormat,
    /// A segment falls outside the permitted user address window.
    OutsideUserWindow,
    /// No physical frame left while faulting a segment page in.
    OutOfMemory,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::BadFormat => write!(f, "not a valid executable image"),
            LoadError::OutsideUserWindow => {
                write!(f, "segment outside the permitted user address window")
            }
            LoadError::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

/// A `[start, end)` range of user virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    pub start: VirtAddr,
    pub end: VirtAddr,
}

impl SegmentRange {
    pub const fn empty() -> Self {
        Self {
            start: VirtAddr::new(0),
            end: VirtAddr::new(0),
        }
    }
}

/// What a successful load reports back.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub entry: VirtAddr,
    /// Code and read-only data.
    pub exec: SegmentRange,
    /// Zero-initialized data; the process heap starts past it.
    pub bss: SegmentRange,
}

pub trait ImageLoader {
    /// Validates `image` and copies its loadable segments into `space`.
    fn load(&self, space: &mut UserSpace<'_>, image: &[u8]) -> Result<LoadedImage, LoadError>;
}

/// The loader's only capability over a half-built address space.
///
/// Writes fault fresh frames into the active directory on demand and
/// record them as owned by the nascent process, so a failed load can be
/// unwound and a finished process torn down. Addresses outside
/// `[USER_OFFSET, USER_STACK_TOP)` are refused.
pub struct UserSpace<'a> {
    kernel: &'a mut Kernel,
    dir: DirId,
    pages: Vec<UserPage>,
}

impl<'a> UserSpace<'a> {
    pub(crate) fn new(kernel: &'a mut Kernel, dir: DirId) -> Self {
        Self {
            kernel,
            dir,
            pages: Vec::new(),
        }
    }

    /// The user pages mapped so far; the caller takes over their
    /// ownership.
    pub(crate) fn into_pages(self) -> Vec<UserPage> {
        self.pages
    }

    fn check_window(at: VirtAddr, len: u32) -> Result<(), LoadError> {
        if at.as_u32() < USER_OFFSET {
            log::info!("cannot place image contents below {:#010x}", USER_OFFSET);
            return Err(LoadError::OutsideUserWindow);
        }
        if at.as_u32() as u64 + len as u64 > USER_STACK_TOP as u64 {
            log::info!("cannot place image contents above {:#010x}", USER_STACK_TOP);
            return Err(LoadError::OutsideUserWindow);
        }
        Ok(())
    }

    fn ensure_mapped(&mut self, at: VirtAddr) -> Result<(), LoadError> {
        let page = at.align_down();
        if self.kernel.translate(page).is_none() {
            let frame = self
                .kernel
                .frames
                .allocate_frame()
                .ok_or(LoadError::OutOfMemory)?;
            self.kernel
                .map_process(page, frame, PageFlags::USER, Some(self.dir));
            self.pages.push(UserPage {
                vaddr: page,
                paddr: frame,
            });
        }
        Ok(())
    }

    /// Copies `bytes` to `at`.
    pub fn write(&mut self, at: VirtAddr, bytes: &[u8]) -> Result<(), LoadError> {
        Self::check_window(at, bytes.len() as u32)?;
        for (i, byte) in bytes.iter().enumerate() {
            let addr = at.add(i as u32);
            self.ensure_mapped(addr)?;
            self.kernel.virt_write_u8(addr, *byte);
        }
        Ok(())
    }

    /// Zero-fills `len` bytes starting at `at`.
    pub fn zero(&mut self, at: VirtAddr, len: u32) -> Result<(), LoadError> {
        Self::check_window(at, len)?;
        for i in 0..len {
            let addr = at.add(i);
            self.ensure_mapped(addr)?;
            self.kernel.virt_write_u8(addr, 0);
        }
        Ok(())
    }

    /// Reads kernel-range memory (argument staging lives in the kernel
    /// heap, which every address space shares).
    pub(crate) fn read_kernel_bytes(&self, at: VirtAddr, len: u32) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; len as usize];
        self.kernel.virt_read_bytes(at, &mut buf);
        buf
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! A minimal flat boot-image format for exercising process creation:
    //! a magic word, the entry address, a segment count, one
    //! `(kind, vaddr, file size, mem size)` header per segment, then the
    //! packed payloads.

    use super::*;
    use alloc::vec::Vec;

    pub(crate) const FLAT_MAGIC: u32 = 0x1F07_B007;
    pub(crate) const SEG_EXEC: u32 = 1;
    pub(crate) const SEG_ZERO_FILL: u32 = 2;

    pub(crate) struct FlatImageLoader;

    fn read_word(image: &[u8], at: usize) -> Result<u32, LoadError> {
        let bytes = image
            .get(at..at + 4)
            .ok_or(LoadError::BadFormat)?
            .try_into()
            .unwrap();
        Ok(u32::from_le_bytes(bytes))
    }

    impl ImageLoader for FlatImageLoader {
        fn load(
            &self,
            space: &mut UserSpace<'_>,
            image: &[u8],
        ) -> Result<LoadedImage, LoadError> {
            if read_word(image, 0)? != FLAT_MAGIC {
                log::info!("image is not in flat boot format");
                return Err(LoadError::BadFormat);
            }
            let entry = VirtAddr::new(read_word(image, 4)?);
            let count = read_word(image, 8)? as usize;

            let mut exec = None;
            let mut bss = None;
            let mut payload = 12 + count * 16;
            for segment in 0..count {
                let header = 12 + segment * 16;
                let kind = read_word(image, header)?;
                let start = VirtAddr::new(read_word(image, header + 4)?);
                let file_size = read_word(image, header + 8)?;
                let mem_size = read_word(image, header + 12)?;
                if mem_size < file_size {
                    return Err(LoadError::BadFormat);
                }
                let end = start.add(mem_size);

                let contents = image
                    .get(payload..payload + file_size as usize)
                    .ok_or(LoadError::BadFormat)?;
                space.write(start, contents)?;
                if mem_size > file_size {
                    space.zero(start.add(file_size), mem_size - file_size)?;
                }
                payload += file_size as usize;

                match kind {
                    SEG_EXEC => exec = Some(SegmentRange { start, end }),
                    SEG_ZERO_FILL => bss = Some(SegmentRange { start, end }),
                    _ => return Err(LoadError::BadFormat),
                }
            }

            let exec = exec.ok_or(LoadError::BadFormat)?;
            let bss = bss.unwrap_or(SegmentRange {
                start: exec.end,
                end: exec.end,
            });
            Ok(LoadedImage { entry, exec, bss })
        }
    }

    /// Builds a two-segment image: code with contents, data fully
    /// zero-filled past `data_file` bytes.
    pub(crate) fn two_segment_image(
        entry: u32,
        code_at: u32,
        code: &[u8],
        data_at: u32,
        data_file: &[u8],
        data_mem: u32,
    ) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(&FLAT_MAGIC.to_le_bytes());
        image.extend_from_slice(&entry.to_le_bytes());
        image.extend_from_slice(&2u32.to_le_bytes());
        for (kind, at, file_size, mem_size) in [
            (SEG_EXEC, code_at, code.len() as u32, code.len() as u32),
            (SEG_ZERO_FILL, data_at, data_file.len() as u32, data_mem),
        ] {
            image.extend_from_slice(&kind.to_le_bytes());
            image.extend_from_slice(&at.to_le_bytes());
            image.extend_from_slice(&file_size.to_le_bytes());
            image.extend_from_slice(&mem_size.to_le_bytes());
        }
        image.extend_from_slice(code);
        image.extend_from_slice(data_file);
        image
    }
}
