//! The kernel context and boot entry.
//!
//! Every process-wide singleton — the RAM arena, the frame bitmap, the
//! heap cursor, the free-VM list, the directory arena, and the process
//! list — is a field of [`Kernel`], built once by [`Kernel::boot`] and
//! threaded explicitly from there. The bootstrap order matters: frames
//! before paging, paging before the heap, the heap before any dynamic
//! mapping, and only then processes.

use alloc::vec;
use alloc::vec::Vec;

use crate::constants::memory::{HEAP_START, KERNEL_RESERVED_END, PAGE_SIZE};
use crate::constants::processes::INIT_ARGV;
use crate::logging;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::bitmap_frame_allocator::BitmapFrameAllocator;
use crate::memory::paging::{DirId, DirectoryRecord, PageFlags, VmArea};
use crate::memory::phys::PhysMemory;
use crate::processes::loader::ImageLoader;
use crate::processes::process::{Pid, ProcessError, ProcessTable};

/// A boot module pre-loaded into RAM by the boot loader: physical
/// location plus byte length.
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    pub base: PhysAddr,
    pub length: u32,
}

pub struct Kernel {
    pub(crate) ram: PhysMemory,
    pub(crate) frames: BitmapFrameAllocator,
    pub(crate) heap_break: VirtAddr,
    pub(crate) heap_used: u32,
    pub(crate) free_vm: Vec<VmArea>,
    pub(crate) directories: Vec<Option<DirectoryRecord>>,
    pub(crate) active_dir: DirId,
    pub(crate) procs: ProcessTable,
    pub(crate) next_pid: u32,
    interrupts_enabled: bool,
    pub(crate) paging_enabled: bool,
    pub(crate) large_pages_enabled: bool,
}

impl Kernel {
    /// Brings the machine up with `high_mem_kb` kilobytes of usable RAM.
    pub fn boot(high_mem_kb: u32) -> Self {
        logging::init();

        let ram_bytes = high_mem_kb.saturating_mul(1024) & !(PAGE_SIZE - 1);
        assert!(
            ram_bytes > KERNEL_RESERVED_END,
            "RAM must exceed the kernel-reserved {} KiB",
            KERNEL_RESERVED_END / 1024
        );

        let mut kernel = Kernel {
            ram: PhysMemory::new(ram_bytes),
            frames: BitmapFrameAllocator::new((ram_bytes / PAGE_SIZE) as usize),
            heap_break: VirtAddr::new(HEAP_START),
            heap_used: 0,
            free_vm: Vec::new(),
            directories: Vec::new(),
            active_dir: DirId::KERNEL,
            procs: ProcessTable::new(),
            next_pid: 1,
            interrupts_enabled: false,
            paging_enabled: false,
            large_pages_enabled: false,
        };

        kernel.init_memory();
        kernel.init_kernel_process();
        kernel.interrupts_enabled = true;
        log::info!("system ready with {} KiB of RAM", high_mem_kb);
        kernel
    }

    pub fn enable_interrupts(&mut self) {
        self.interrupts_enabled = true;
    }

    pub fn disable_interrupts(&mut self) {
        self.interrupts_enabled = false;
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled
    }

    pub fn large_pages_enabled(&self) -> bool {
        self.large_pages_enabled
    }

    /// Maps each module's backing pages 1:1, then executes it with the
    /// fixed startup argument vector. Returns the created pids.
    pub fn load_boot_modules(
        &mut self,
        modules: &[BootModule],
        loader: &dyn ImageLoader,
    ) -> Result<Vec<Pid>, ProcessError> {
        let mut pids = Vec::with_capacity(modules.len());
        for module in modules {
            log::info!(
                "boot module at {} ({} bytes)",
                module.base,
                module.length
            );
            for page in 0..module.length.div_ceil(PAGE_SIZE) {
                let addr = module.base.add(page * PAGE_SIZE);
                self.map_kernel(VirtAddr::new(addr.as_u32()), addr, PageFlags::USER)?;
            }

            let mut image = vec![0u8; module.length as usize];
            self.ram.read_into(module.base, &mut image);
            pids.push(self.create_process(&image, INIT_ARGV, loader)?);
        }
        Ok(pids)
    }
}
