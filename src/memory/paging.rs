//! Paging and address-space management.
//!
//! A two-level translation structure: each address space is one page
//! directory of 1024 entries whose slots 0..256 mirror the kernel's
//! directory and whose last slot maps the directory onto itself. That
//! self-mapping makes every directory and table entry of the active
//! space reachable at a fixed virtual address:
//!
//!   directory entry for v:  0xFFFF_F000 | (v >> 22) * 4
//!   table entry for v:      0xFFC0_0000 | (v >> 12) * 4
//!
//! Both formulas resolve through the ordinary page walk, so mapping and
//! unmapping never touch physical table frames directly.

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::constants::memory::{
    ENTRIES_PER_TABLE, ENTRY_SIZE, KERNEL_DIRECTORY, KERNEL_DIR_ENTRIES, KERNEL_PAGE_0,
    KERNEL_PAGE_1, KERNEL_RESERVED_END, PAGE_HEAP_LIMIT, PAGE_HEAP_START, PAGE_SIZE,
    RECURSIVE_DIR_BASE, RECURSIVE_TABLE_BASE, SELF_MAP_INDEX,
};
use crate::fatal;
use crate::kernel::Kernel;
use crate::memory::address::{PhysAddr, VirtAddr};

bitflags! {
    /// Directory/table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Directory-level 4 MiB mapping.
        const LARGE = 1 << 7;
    }
}

const ENTRY_ADDR_MASK: u32 = 0xFFFF_F000;
const LARGE_ADDR_MASK: u32 = 0xFFC0_0000;

/// A page of kernel virtual memory paired with its backing frame.
#[derive(Debug, Clone, Copy)]
pub struct KernelPage {
    pub vaddr: VirtAddr,
    pub paddr: PhysAddr,
}

/// An interval `[start, end)` of unused kernel virtual addresses.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VmArea {
    pub(crate) start: VirtAddr,
    pub(crate) end: VirtAddr,
}

/// Handle into the directory arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirId(pub(crate) usize);

impl DirId {
    /// The kernel's own address space, installed at boot.
    pub const KERNEL: DirId = DirId(0);
}

/// Descriptor of one page directory: its backing page plus the page-table
/// pages allocated on its behalf, needed for teardown.
pub(crate) struct DirectoryRecord {
    pub(crate) base: KernelPage,
    pub(crate) tables: Vec<KernelPage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The address is outside the kernel range.
    NotKernelSpace,
    /// No pre-built page table covers the address.
    TableMissing,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MapError::NotKernelSpace => write!(f, "address is not in kernel space"),
            MapError::TableMissing => write!(f, "no page table covers the address"),
        }
    }
}

fn directory_entry_window(vaddr: VirtAddr) -> VirtAddr {
    VirtAddr::new(RECURSIVE_DIR_BASE | ((vaddr.as_u32() & 0xFFC0_0000) >> 20))
}

fn table_entry_window(vaddr: VirtAddr) -> VirtAddr {
    VirtAddr::new(RECURSIVE_TABLE_BASE | ((vaddr.as_u32() & 0xFFFF_F000) >> 10))
}

impl Kernel {
    /// Builds the bitmap, the kernel directory, and the initial heap, then
    /// switches translation on. Runs once, before anything else can
    /// allocate.
    pub(crate) fn init_memory(&mut self) {
        // Kernel image, descriptor tables, directory and the pre-built
        // page tables all live below KERNEL_RESERVED_END.
        self.frames
            .reserve_region(PhysAddr::new(0), PhysAddr::new(KERNEL_RESERVED_END));

        let dir = PhysAddr::new(KERNEL_DIRECTORY);
        let low = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::LARGE;
        self.ram.write_u32(dir, KERNEL_PAGE_0 | low.bits());
        self.ram
            .write_u32(dir.add(ENTRY_SIZE), KERNEL_PAGE_1 | low.bits());

        // Slots 2..1023 get their tables from the identity-mapped region
        // behind KERNEL_PAGE_1; the tables start out zeroed.
        let table_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        for slot in 2..SELF_MAP_INDEX {
            let table = KERNEL_PAGE_1 + PAGE_SIZE * slot as u32;
            self.ram
                .write_u32(dir.add(slot as u32 * ENTRY_SIZE), table | table_flags.bits());
        }

        // Page table mirroring trick: the last slot maps the directory
        // itself.
        self.ram.write_u32(
            dir.add(SELF_MAP_INDEX as u32 * ENTRY_SIZE),
            KERNEL_DIRECTORY | table_flags.bits(),
        );

        self.directories.push(Some(DirectoryRecord {
            base: KernelPage {
                vaddr: VirtAddr::new(KERNEL_DIRECTORY),
                paddr: dir,
            },
            tables: Vec::new(),
        }));
        self.active_dir = DirId::KERNEL;
        self.paging_enabled = true;
        self.large_pages_enabled = true;

        // Seed the heap with one mapped page holding a single free chunk,
        // then publish the rest of the kernel virtual space as free.
        self.ksbrk(1);
        self.free_vm.push(VmArea {
            start: VirtAddr::new(PAGE_HEAP_START),
            end: VirtAddr::new(PAGE_HEAP_LIMIT),
        });

        log::info!(
            "paging enabled, {} of {} frames free",
            self.frames.free_frame_count(),
            self.frames.total_frames()
        );
    }

    pub(crate) fn directory(&self, dir: DirId) -> &DirectoryRecord {
        match self.directories.get(dir.0) {
            Some(Some(record)) => record,
            _ => fatal!("reference to unknown page directory {:?}", dir),
        }
    }

    /// Physical frame holding the directory (the value loaded into the
    /// translation base register on a switch).
    pub fn directory_frame(&self, dir: DirId) -> PhysAddr {
        self.directory(dir).base.paddr
    }

    /// Switches the active address space and returns the previous one.
    pub fn activate(&mut self, dir: DirId) -> DirId {
        let _ = self.directory(dir);
        let previous = self.active_dir;
        self.active_dir = dir;
        log::trace!("address space switch {:?} -> {:?}", previous, dir);
        previous
    }

    pub fn active_directory(&self) -> DirId {
        self.active_dir
    }

    fn walk(&self, dir_frame: PhysAddr, vaddr: VirtAddr) -> Option<PhysAddr> {
        let pde = self
            .ram
            .read_u32(dir_frame.add(vaddr.directory_index() as u32 * ENTRY_SIZE));
        if pde & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        if pde & PageFlags::LARGE.bits() != 0 {
            return Some(PhysAddr::new(
                (pde & LARGE_ADDR_MASK) | vaddr.large_page_offset(),
            ));
        }
        let table = PhysAddr::new(pde & ENTRY_ADDR_MASK);
        let pte = self
            .ram
            .read_u32(table.add(vaddr.table_index() as u32 * ENTRY_SIZE));
        if pte & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(PhysAddr::new((pte & ENTRY_ADDR_MASK) | vaddr.page_offset()))
    }

    /// Physical address behind `vaddr` in the active space, sub-page
    /// offset applied, or `None` while either translation level is absent.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.walk(self.directory_frame(self.active_dir), vaddr)
    }

    /// `translate` against an arbitrary directory.
    pub fn translate_in(&self, dir: DirId, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.walk(self.directory_frame(dir), vaddr)
    }

    pub(crate) fn virt_read_u8(&self, vaddr: VirtAddr) -> u8 {
        match self.translate(vaddr) {
            Some(paddr) => self.ram.read_u8(paddr),
            None => fatal!("page fault with no handler: read of unmapped {}", vaddr),
        }
    }

    pub(crate) fn virt_write_u8(&mut self, vaddr: VirtAddr, value: u8) {
        match self.translate(vaddr) {
            Some(paddr) => self.ram.write_u8(paddr, value),
            None => fatal!("page fault with no handler: write of unmapped {}", vaddr),
        }
    }

    pub(crate) fn virt_read_u32(&self, vaddr: VirtAddr) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.virt_read_u8(vaddr.add(i as u32));
        }
        u32::from_le_bytes(bytes)
    }

    pub(crate) fn virt_write_u32(&mut self, vaddr: VirtAddr, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.virt_write_u8(vaddr.add(i as u32), *byte);
        }
    }

    pub(crate) fn virt_read_bytes(&self, vaddr: VirtAddr, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.virt_read_u8(vaddr.add(i as u32));
        }
    }

    pub(crate) fn virt_write_bytes(&mut self, vaddr: VirtAddr, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.virt_write_u8(vaddr.add(i as u32), *byte);
        }
    }

    /// Installs a kernel-range mapping in the shared kernel tables.
    ///
    /// Valid only below the user range; the tables for the whole kernel
    /// range are pre-built at boot, so the call never allocates. The
    /// target frame is reserved in the bitmap (1:1 boot-module mappings
    /// claim their frames this way).
    pub fn map_kernel(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !vaddr.in_kernel_range() {
            log::error!("map_kernel: {} is not in kernel space", vaddr);
            return Err(MapError::NotKernelSpace);
        }
        let pde = self.virt_read_u32(directory_entry_window(vaddr));
        if pde & PageFlags::LARGE.bits() != 0 {
            // Covered by a 4 MiB kernel mapping already.
            log::debug!("map_kernel: {} already mapped by a large page", vaddr);
            return Ok(());
        }
        if pde & PageFlags::PRESENT.bits() == 0 {
            log::error!("map_kernel: no page table covers {}", vaddr);
            return Err(MapError::TableMissing);
        }
        let entry =
            paddr.as_u32() | (PageFlags::PRESENT | PageFlags::WRITABLE | flags).bits();
        self.virt_write_u32(table_entry_window(vaddr), entry);
        self.frames.reserve_frame(paddr);
        Ok(())
    }

    /// Installs a mapping in the active directory, creating the page table
    /// on demand.
    ///
    /// A freshly created table page is recorded as owned by `owner` so the
    /// directory teardown can return it; passing `None` leaves the table
    /// untracked (kernel-only growth paths that never unwind).
    pub fn map_process(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
        owner: Option<DirId>,
    ) {
        let pde_at = directory_entry_window(vaddr);
        let pde = self.virt_read_u32(pde_at);
        if pde & PageFlags::LARGE.bits() != 0 {
            log::debug!("map_process: {} already mapped by a large page", vaddr);
            return;
        }
        if pde & PageFlags::PRESENT.bits() == 0 {
            let table = self.kernel_page_from_heap();
            self.ram
                .zero_range(table.paddr, ENTRIES_PER_TABLE as u32 * ENTRY_SIZE);
            let entry = table.paddr.as_u32()
                | (PageFlags::PRESENT | PageFlags::WRITABLE | flags).bits();
            self.virt_write_u32(pde_at, entry);
            if let Some(owner) = owner {
                match self.directories.get_mut(owner.0) {
                    Some(Some(record)) => record.tables.push(table),
                    _ => fatal!("map_process: unknown owner directory {:?}", owner),
                }
            }
        }
        let entry =
            paddr.as_u32() | (PageFlags::PRESENT | PageFlags::WRITABLE | flags).bits();
        self.virt_write_u32(table_entry_window(vaddr), entry);
    }

    /// Clears the present bit for `vaddr` in the active directory.
    /// Unmapped pages are left alone. The machine model keeps no cached
    /// translations, so there is nothing further to invalidate.
    pub fn unmap(&mut self, vaddr: VirtAddr) {
        if self.translate(vaddr).is_none() {
            return;
        }
        let pde = self.virt_read_u32(directory_entry_window(vaddr));
        if pde & PageFlags::LARGE.bits() != 0 {
            log::debug!("unmap: {} is covered by a large page", vaddr);
            return;
        }
        let pte_at = table_entry_window(vaddr);
        let pte = self.virt_read_u32(pte_at);
        self.virt_write_u32(pte_at, pte & !PageFlags::PRESENT.bits());
    }

    /// Takes the lowest unused kernel virtual page, backs it with a fresh
    /// frame, and maps it. Bootstrap-critical: exhaustion of either
    /// resource halts.
    pub fn kernel_page_from_heap(&mut self) -> KernelPage {
        let paddr = match self.frames.allocate_frame() {
            Some(paddr) => paddr,
            None => fatal!("no page frame available for the kernel page heap"),
        };
        if self.free_vm.is_empty() {
            fatal!("no virtual memory left in the kernel page heap");
        }
        let vaddr = self.free_vm[0].start;
        self.free_vm[0].start = vaddr.add(PAGE_SIZE);
        if self.free_vm[0].start == self.free_vm[0].end {
            self.free_vm.remove(0);
        }
        if let Err(err) = self.map_kernel(vaddr, paddr, PageFlags::empty()) {
            fatal!("kernel page heap mapping failed: {}", err);
        }
        KernelPage { vaddr, paddr }
    }

    /// Returns a page taken from the kernel page heap: frees the backing
    /// frame, removes the mapping, and merges the address back into the
    /// free list. A page with no backing frame is logged and skipped.
    pub fn release_kernel_page(&mut self, vaddr: VirtAddr) {
        match self.translate(vaddr) {
            Some(paddr) => self.frames.free_frame(paddr.align_down()),
            None => {
                log::warn!("release of kernel page {} with no backing frame", vaddr);
                return;
            }
        }
        self.unmap(vaddr);
        self.release_vm_area(vaddr);
    }

    fn release_vm_area(&mut self, vaddr: VirtAddr) {
        let page_end = vaddr.add(PAGE_SIZE);
        let next = self
            .free_vm
            .iter()
            .position(|area| area.start > vaddr)
            .unwrap_or(self.free_vm.len());

        if next > 0 && self.free_vm[next - 1].end > vaddr {
            fatal!("corrupted free virtual address list around {}", vaddr);
        }

        if next > 0 && self.free_vm[next - 1].end == vaddr {
            self.free_vm[next - 1].end = page_end;
            if next < self.free_vm.len() && self.free_vm[next].start == page_end {
                self.free_vm[next - 1].end = self.free_vm[next].end;
                self.free_vm.remove(next);
            }
        } else if next < self.free_vm.len() && self.free_vm[next].start == page_end {
            self.free_vm[next].start = vaddr;
        } else {
            self.free_vm.insert(
                next,
                VmArea {
                    start: vaddr,
                    end: page_end,
                },
            );
        }
    }

    fn build_directory(&mut self, kernel_source: PhysAddr) -> DirId {
        let base = self.kernel_page_from_heap();

        // Kernel space: slots below KERNEL_DIR_ENTRIES are shared with
        // every other address space.
        for slot in 0..KERNEL_DIR_ENTRIES as u32 {
            let entry = self.ram.read_u32(kernel_source.add(slot * ENTRY_SIZE));
            self.ram.write_u32(base.paddr.add(slot * ENTRY_SIZE), entry);
        }

        // User space starts out empty.
        for slot in KERNEL_DIR_ENTRIES as u32..SELF_MAP_INDEX as u32 {
            self.ram.write_u32(base.paddr.add(slot * ENTRY_SIZE), 0);
        }

        // Page table mirroring trick.
        self.ram.write_u32(
            base.paddr.add(SELF_MAP_INDEX as u32 * ENTRY_SIZE),
            base.paddr.as_u32() | (PageFlags::PRESENT | PageFlags::WRITABLE).bits(),
        );

        let record = DirectoryRecord {
            base,
            tables: Vec::new(),
        };
        match self.directories.iter().position(|slot| slot.is_none()) {
            Some(index) => {
                self.directories[index] = Some(record);
                DirId(index)
            }
            None => {
                self.directories.push(Some(record));
                DirId(self.directories.len() - 1)
            }
        }
    }

    /// Creates a fresh address space: kernel mirror, empty user range,
    /// self-map, no owned tables.
    pub fn create_directory(&mut self) -> DirId {
        self.build_directory(PhysAddr::new(KERNEL_DIRECTORY))
    }

    /// Creates an address space for a child of `parent`.
    ///
    /// Only the kernel mirror is established (the parent's slots 0..256
    /// are invariant-identical to the kernel's); the parent's user-space
    /// tables and page contents are not copied. Full duplication for
    /// creation-by-copy remains an open requirement.
    pub fn duplicate_directory(&mut self, parent: DirId) -> DirId {
        let source = self.directory_frame(parent);
        self.build_directory(source)
    }

    /// Tears an address space down: every owned page-table page, then the
    /// directory page itself, goes back to the kernel page heap.
    pub fn destroy_directory(&mut self, dir: DirId) {
        if dir == DirId::KERNEL {
            fatal!("attempt to destroy the kernel address space");
        }
        let record = match self.directories.get_mut(dir.0).and_then(Option::take) {
            Some(record) => record,
            None => fatal!("destroy of unknown page directory {:?}", dir),
        };
        for table in record.tables {
            self.release_kernel_page(table.vaddr);
        }
        self.release_kernel_page(record.base.vaddr);
    }
}
