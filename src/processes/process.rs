//! Process control blocks and the process lifecycle.
//!
//! A process is created from an executable image, may be duplicated, and
//! is torn down once it has gone zombie: its data frames, kernel stack,
//! and page directory all return to the allocators, and its control block
//! leaves the global list. The list itself only promises integrity;
//! scheduling policy lives elsewhere.

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::fmt;

use crate::constants::gdt::{
    KERNEL_STACK_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR, USER_STACK_SELECTOR,
};
use crate::constants::memory::PAGE_SIZE;
use crate::constants::processes::{
    KERNEL_PID, MAX_ARGS, MAX_OPEN_FILES, SIGNAL_COUNT, STACK_ALIGN_MASK, USER_STACK_TOP,
};
use crate::fatal;
use crate::kernel::Kernel;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::paging::{DirId, KernelPage, MapError};
use crate::processes::loader::{ImageLoader, LoadError, SegmentRange, UserSpace};
use crate::processes::registers::{KernelStack, Registers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Terminated but not yet reaped.
    Zombie,
}

/// A user page owned by a process; the backing frame is released at
/// teardown.
#[derive(Debug, Clone, Copy)]
pub struct UserPage {
    pub vaddr: VirtAddr,
    pub paddr: PhysAddr,
}

/// One open-file slot. The file object itself belongs to the filesystem
/// layer and is referred to by an opaque handle.
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    pub mode: u32,
    pub offset: u32,
    pub handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    Default,
    Handler(VirtAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    ImageLoad(LoadError),
    NoSuchProcess(Pid),
    TooManyArguments,
    ReservedPid(Pid),
    BadSignal(usize),
    Map(MapError),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::ImageLoad(err) => write!(f, "image load failed: {}", err),
            ProcessError::NoSuchProcess(pid) => write!(f, "no process with {}", pid),
            ProcessError::TooManyArguments => write!(f, "too many arguments"),
            ProcessError::ReservedPid(pid) => write!(f, "{} is reserved", pid),
            ProcessError::BadSignal(signal) => write!(f, "no signal number {}", signal),
            ProcessError::Map(err) => write!(f, "mapping failed: {}", err),
        }
    }
}

impl From<MapError> for ProcessError {
    fn from(err: MapError) -> Self {
        ProcessError::Map(err)
    }
}

pub struct Pcb {
    pub pid: Pid,
    pub(crate) state: ProcessState,
    pub(crate) parent: Option<Pid>,
    pub regs: Registers,
    pub kstack: KernelStack,
    pub(crate) kstack_page: Option<KernelPage>,
    pub directory: DirId,
    pub(crate) pages: Vec<UserPage>,
    /// Code and read-only data range of the loaded image.
    pub exec: SegmentRange,
    /// Zero-initialized data range of the loaded image.
    pub bss: SegmentRange,
    pub heap_start: VirtAddr,
    pub heap_end: VirtAddr,
    pub(crate) open_files: [Option<OpenFile>; MAX_OPEN_FILES],
    pub(crate) pending_signals: u32,
    pub(crate) signal_handlers: [SignalDisposition; SIGNAL_COUNT],
}

impl Pcb {
    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn pages(&self) -> &[UserPage] {
        &self.pages
    }

    pub fn pending_signals(&self) -> u32 {
        self.pending_signals
    }

    pub fn signal_handler(&self, signal: usize) -> Option<SignalDisposition> {
        self.signal_handlers.get(signal).copied()
    }

    /// Puts `file` in the lowest free slot and returns its descriptor.
    pub fn install_file(&mut self, file: OpenFile) -> Option<usize> {
        let slot = self.open_files.iter().position(Option::is_none)?;
        self.open_files[slot] = Some(file);
        Some(slot)
    }

    pub fn file(&self, fd: usize) -> Option<&OpenFile> {
        self.open_files.get(fd).and_then(Option::as_ref)
    }

    pub fn remove_file(&mut self, fd: usize) -> Option<OpenFile> {
        self.open_files.get_mut(fd).and_then(Option::take)
    }
}

/// The global process list. Insertion goes to the head; traversal order
/// is therefore newest first.
pub struct ProcessTable {
    entries: Vec<Pcb>,
}

impl ProcessTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn insert_head(&mut self, pcb: Pcb) {
        self.entries.insert(0, pcb);
    }

    pub(crate) fn find(&self, pid: Pid) -> Option<&Pcb> {
        self.entries.iter().find(|pcb| pcb.pid == pid)
    }

    pub(crate) fn find_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.entries.iter_mut().find(|pcb| pcb.pid == pid)
    }

    pub(crate) fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        let index = self.entries.iter().position(|pcb| pcb.pid == pid)?;
        Some(self.entries.remove(index))
    }

    pub(crate) fn iter(&self) -> core::slice::Iter<'_, Pcb> {
        self.entries.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> core::slice::IterMut<'_, Pcb> {
        self.entries.iter_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Builds the initial user stack: the argument strings, the
/// null-terminated pointer array, then the argc/argv words the startup
/// code consumes. With no arguments the stack is left untouched.
fn build_user_stack(
    space: &mut UserSpace<'_>,
    staged: &[(VirtAddr, u32)],
) -> Result<VirtAddr, LoadError> {
    let mut sp = VirtAddr::new(USER_STACK_TOP - 16);
    if staged.is_empty() {
        return Ok(sp);
    }

    let mut arg_ptrs: ArrayVec<VirtAddr, MAX_ARGS> = ArrayVec::new();
    for (copy, len) in staged {
        let bytes = space.read_kernel_bytes(*copy, *len);
        sp = sp.sub(*len);
        space.write(sp, &bytes)?;
        arg_ptrs.push(sp);
    }

    sp = VirtAddr::new(sp.as_u32() & STACK_ALIGN_MASK);

    sp = sp.sub(4);
    space.write(sp, &0u32.to_le_bytes())?;
    for ptr in arg_ptrs.iter().rev() {
        sp = sp.sub(4);
        space.write(sp, &ptr.as_u32().to_le_bytes())?;
    }
    let argv_array = sp;
    sp = sp.sub(4);
    space.write(sp, &argv_array.as_u32().to_le_bytes())?;
    sp = sp.sub(4);
    space.write(sp, &(staged.len() as u32).to_le_bytes())?;

    // Room for the return slot the startup code expects below argc.
    sp = sp.sub(4);
    Ok(sp)
}

impl Kernel {
    pub(crate) fn allocate_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Installs the kernel pseudo-process at the head of the list. It
    /// holds the reserved pid, runs in the kernel address space, and is
    /// marked zombie so a scheduler never picks it; the reaper skips it
    /// by pid.
    pub(crate) fn init_kernel_process(&mut self) {
        let pid = self.allocate_pid();
        let mut regs = Registers::new();
        regs.cr3 = self.directory_frame(DirId::KERNEL);
        self.procs.insert_head(Pcb {
            pid,
            state: ProcessState::Zombie,
            parent: None,
            regs,
            kstack: KernelStack::new(),
            kstack_page: None,
            directory: DirId::KERNEL,
            pages: Vec::new(),
            exec: SegmentRange::empty(),
            bss: SegmentRange::empty(),
            heap_start: VirtAddr::new(0),
            heap_end: VirtAddr::new(0),
            open_files: [None; MAX_OPEN_FILES],
            pending_signals: 0,
            signal_handlers: [SignalDisposition::Default; SIGNAL_COUNT],
        });
    }

    pub fn process(&self, pid: Pid) -> Option<&Pcb> {
        self.procs.find(pid)
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.procs.find_mut(pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Pcb> {
        self.procs.iter()
    }

    pub fn process_count(&self) -> usize {
        self.procs.len()
    }

    pub fn set_process_state(
        &mut self,
        pid: Pid,
        state: ProcessState,
    ) -> Result<(), ProcessError> {
        let pcb = self
            .procs
            .find_mut(pid)
            .ok_or(ProcessError::NoSuchProcess(pid))?;
        pcb.state = state;
        Ok(())
    }

    /// Marks `signal` pending for `pid`; delivery is the dispatch layer's
    /// business.
    pub fn post_signal(&mut self, pid: Pid, signal: usize) -> Result<(), ProcessError> {
        if signal >= SIGNAL_COUNT {
            return Err(ProcessError::BadSignal(signal));
        }
        let pcb = self
            .procs
            .find_mut(pid)
            .ok_or(ProcessError::NoSuchProcess(pid))?;
        pcb.pending_signals |= 1 << signal;
        Ok(())
    }

    fn abort_creation(
        &mut self,
        staged: &[(VirtAddr, u32)],
        pages: Vec<UserPage>,
        previous: DirId,
        dir: DirId,
    ) {
        for (copy, _) in staged {
            self.kfree(*copy);
        }
        for page in pages {
            self.frames.free_frame(page.paddr);
        }
        self.activate(previous);
        self.destroy_directory(dir);
    }

    /// Creates a process from an executable image.
    ///
    /// The argument strings are staged in the kernel heap, a fresh address
    /// space is built and activated, the loader places the image, the
    /// initial user stack and kernel stack are set up, and the saved
    /// context is filled with the fixed user-mode selector values. On
    /// loader failure everything is unwound and the caller's address
    /// space is restored.
    pub fn create_process(
        &mut self,
        image: &[u8],
        argv: &[&str],
        loader: &dyn ImageLoader,
    ) -> Result<Pid, ProcessError> {
        if argv.len() > MAX_ARGS {
            return Err(ProcessError::TooManyArguments);
        }
        let pid = self.allocate_pid();

        // Stage the argument strings in the kernel heap: the heap is part
        // of the shared kernel mirror, so the copies stay readable after
        // the address-space switch.
        let mut staged: Vec<(VirtAddr, u32)> = Vec::with_capacity(argv.len());
        for arg in argv {
            let len = arg.len() as u32 + 1;
            let copy = match self.kmalloc(len) {
                Some(copy) => copy,
                None => fatal!("argument staging allocation failed"),
            };
            self.virt_write_bytes(copy, arg.as_bytes());
            self.virt_write_u8(copy.add(len - 1), 0);
            staged.push((copy, len));
        }

        let dir = self.create_directory();
        let previous = self.activate(dir);

        let mut space = UserSpace::new(self, dir);
        let loaded = match loader.load(&mut space, image) {
            Ok(loaded) => loaded,
            Err(err) => {
                let pages = space.into_pages();
                self.abort_creation(&staged, pages, previous, dir);
                log::info!("process creation failed: {}", err);
                return Err(ProcessError::ImageLoad(err));
            }
        };

        let esp = match build_user_stack(&mut space, &staged) {
            Ok(esp) => esp,
            Err(err) => {
                let pages = space.into_pages();
                self.abort_creation(&staged, pages, previous, dir);
                log::info!("process creation failed: {}", err);
                return Err(ProcessError::ImageLoad(err));
            }
        };
        let pages = space.into_pages();

        for (copy, _) in &staged {
            self.kfree(*copy);
        }

        let kstack_page = self.kernel_page_from_heap();
        let kstack = KernelStack {
            ss0: KERNEL_STACK_SELECTOR,
            esp0: kstack_page.vaddr.add(PAGE_SIZE - 16),
        };

        let mut regs = Registers::new();
        regs.esp = esp;
        regs.eip = loaded.entry;
        regs.eflags = 0;
        regs.cs = USER_CODE_SELECTOR;
        regs.ds = USER_DATA_SELECTOR;
        regs.es = USER_DATA_SELECTOR;
        regs.fs = USER_DATA_SELECTOR;
        regs.gs = USER_DATA_SELECTOR;
        regs.ss = USER_STACK_SELECTOR;
        regs.cr3 = self.directory_frame(dir);

        // Process heap grows from the first page past the zero-fill data.
        let heap_start = VirtAddr::new((loaded.bss.end.as_u32() & 0xFFFF_F000) + PAGE_SIZE);

        self.activate(previous);

        self.procs.insert_head(Pcb {
            pid,
            state: ProcessState::Running,
            parent: None,
            regs,
            kstack,
            kstack_page: Some(kstack_page),
            directory: dir,
            pages,
            exec: loaded.exec,
            bss: loaded.bss,
            heap_start,
            heap_end: heap_start,
            open_files: [None; MAX_OPEN_FILES],
            pending_signals: 0,
            signal_handlers: [SignalDisposition::Default; SIGNAL_COUNT],
        });
        log::info!("created {} with entry {}", pid, loaded.entry);
        Ok(pid)
    }

    /// Duplicates `parent`: the saved context is copied verbatim and a
    /// new address space is derived with `duplicate_directory`.
    ///
    /// The child shares no user memory with the parent yet — duplication
    /// establishes the kernel range only, so full creation-by-copy
    /// semantics remain an open requirement. The child does get its own
    /// kernel stack; sharing the parent's would double-release it at
    /// teardown.
    pub fn fork(&mut self, parent: Pid) -> Result<Pid, ProcessError> {
        let (mut regs, parent_dir, exec, bss, heap_start, heap_end, pending, handlers) = {
            let pcb = self
                .procs
                .find(parent)
                .ok_or(ProcessError::NoSuchProcess(parent))?;
            (
                pcb.regs,
                pcb.directory,
                pcb.exec,
                pcb.bss,
                pcb.heap_start,
                pcb.heap_end,
                pcb.pending_signals,
                pcb.signal_handlers,
            )
        };

        let pid = self.allocate_pid();
        let dir = self.duplicate_directory(parent_dir);
        let kstack_page = self.kernel_page_from_heap();
        regs.cr3 = self.directory_frame(dir);

        self.procs.insert_head(Pcb {
            pid,
            state: ProcessState::Running,
            parent: Some(parent),
            regs,
            kstack: KernelStack {
                ss0: KERNEL_STACK_SELECTOR,
                esp0: kstack_page.vaddr.add(PAGE_SIZE - 16),
            },
            kstack_page: Some(kstack_page),
            directory: dir,
            pages: Vec::new(),
            exec,
            bss,
            heap_start,
            heap_end,
            open_files: [None; MAX_OPEN_FILES],
            pending_signals: pending,
            signal_handlers: handlers,
        });
        log::info!("forked {} from {}", pid, parent);
        Ok(pid)
    }

    /// Tears a process down and unlinks it from the list.
    ///
    /// Runs with interrupts disabled: the sequence switches address
    /// spaces while mutating shared structures, and no interrupt may
    /// observe the intermediate state.
    pub fn destroy_process(&mut self, pid: Pid) -> Result<(), ProcessError> {
        if pid.as_u32() == KERNEL_PID {
            return Err(ProcessError::ReservedPid(pid));
        }
        self.disable_interrupts();
        let pcb = match self.procs.remove(pid) {
            Some(pcb) => pcb,
            None => {
                self.enable_interrupts();
                return Err(ProcessError::NoSuchProcess(pid));
            }
        };

        let previous = self.activate(pcb.directory);
        for page in &pcb.pages {
            self.frames.free_frame(page.paddr);
        }
        if let Some(kstack_page) = pcb.kstack_page {
            self.release_kernel_page(kstack_page.vaddr);
        }

        self.activate(DirId::KERNEL);
        self.destroy_directory(pcb.directory);
        if previous != pcb.directory {
            self.activate(previous);
        }

        self.enable_interrupts();
        log::info!("destroyed {}", pid);
        Ok(())
    }

    /// Destroys every zombie except the kernel pseudo-process and
    /// releases its control block. Returns how many were reaped.
    pub fn reap_zombies(&mut self) -> usize {
        let victims: Vec<Pid> = self
            .procs
            .iter()
            .filter(|pcb| pcb.state == ProcessState::Zombie && pcb.pid.as_u32() != KERNEL_PID)
            .map(|pcb| pcb.pid)
            .collect();
        let reaped = victims.len();
        for pid in victims {
            if let Err(err) = self.destroy_process(pid) {
                log::error!("reap of {} failed: {}", pid, err);
            }
        }
        reaped
    }

    /// Hands every child of `old_parent` to `new_parent`, so a parent's
    /// exit leaves no dangling parent links.
    pub fn reparent_children(&mut self, old_parent: Pid, new_parent: Pid) {
        for pcb in self.procs.iter_mut() {
            if pcb.parent == Some(old_parent) {
                pcb.parent = Some(new_parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::USER_OFFSET;
    use crate::processes::loader::fixtures::{two_segment_image, FlatImageLoader};

    const CODE_AT: u32 = USER_OFFSET;
    const ENTRY: u32 = USER_OFFSET + 0x10;
    const DATA_AT: u32 = USER_OFFSET + 0x1000;
    const DATA_MEM: u32 = 64;

    fn kernel() -> Kernel {
        Kernel::boot(16 * 1024)
    }

    fn code_bytes() -> Vec<u8> {
        (0u8..32).collect()
    }

    fn sample_image() -> Vec<u8> {
        two_segment_image(
            ENTRY,
            CODE_AT,
            &code_bytes(),
            DATA_AT,
            &[1, 2, 3, 4],
            DATA_MEM,
        )
    }

    #[test]
    fn test_create_end_to_end() {
        let mut kernel = kernel();
        let pid = kernel
            .create_process(&sample_image(), &["init", "-i"], &FlatImageLoader)
            .unwrap();
        assert_eq!(pid.as_u32(), 2);
        assert_eq!(kernel.active_directory(), DirId::KERNEL);

        let pcb = kernel.process(pid).unwrap();
        assert_eq!(pcb.state(), ProcessState::Running);
        assert_eq!(pcb.parent(), None);
        assert_eq!(pcb.regs.eip, VirtAddr::new(ENTRY));
        assert_eq!(pcb.regs.cs, USER_CODE_SELECTOR);
        assert_eq!(pcb.regs.ds, USER_DATA_SELECTOR);
        assert_eq!(pcb.regs.ss, USER_STACK_SELECTOR);
        assert_eq!(pcb.regs.eax, 0);
        assert_eq!(pcb.regs.cr3, kernel.directory_frame(pcb.directory));
        assert_eq!(pcb.kstack.ss0, KERNEL_STACK_SELECTOR);
        assert_eq!(pcb.exec.start, VirtAddr::new(CODE_AT));
        assert_eq!(pcb.exec.end, VirtAddr::new(CODE_AT + 32));
        assert_eq!(pcb.bss.start, VirtAddr::new(DATA_AT));
        assert_eq!(pcb.bss.end, VirtAddr::new(DATA_AT + DATA_MEM));
        assert_eq!(pcb.heap_start, VirtAddr::new(DATA_AT + PAGE_SIZE));
        assert_eq!(pcb.heap_end, pcb.heap_start);

        let dir = pcb.directory;
        let esp = pcb.regs.esp;
        assert_eq!(esp, VirtAddr::new(0xDFFF_FFC8));

        // Inspect the new address space the way its owner would see it.
        let previous = kernel.activate(dir);
        for (i, byte) in code_bytes().iter().enumerate() {
            assert_eq!(kernel.virt_read_u8(VirtAddr::new(CODE_AT + i as u32)), *byte);
        }
        assert_eq!(kernel.virt_read_u8(VirtAddr::new(DATA_AT)), 1);
        for i in 4..DATA_MEM {
            assert_eq!(kernel.virt_read_u8(VirtAddr::new(DATA_AT + i)), 0);
        }

        // The stack image: return slot, argc, argv, the pointers, then
        // the strings.
        assert_eq!(kernel.virt_read_u32(esp.add(4)), 2);
        let argv_array = kernel.virt_read_u32(esp.add(8));
        assert_eq!(argv_array, esp.as_u32() + 12);
        let arg0 = kernel.virt_read_u32(esp.add(12));
        let arg1 = kernel.virt_read_u32(esp.add(16));
        assert_eq!(kernel.virt_read_u32(esp.add(20)), 0);
        let mut name = [0u8; 5];
        kernel.virt_read_bytes(VirtAddr::new(arg0), &mut name);
        assert_eq!(&name, b"init\0");
        let mut flag = [0u8; 3];
        kernel.virt_read_bytes(VirtAddr::new(arg1), &mut flag);
        assert_eq!(&flag, b"-i\0");
        kernel.activate(previous);
    }

    #[test]
    fn test_create_without_arguments() {
        let mut kernel = kernel();
        let pid = kernel
            .create_process(&sample_image(), &[], &FlatImageLoader)
            .unwrap();
        let pcb = kernel.process(pid).unwrap();
        assert_eq!(pcb.regs.esp, VirtAddr::new(USER_STACK_TOP - 16));
    }

    #[test]
    fn test_create_failure_unwinds() {
        let mut kernel = kernel();
        let free_frames = kernel.frames.free_frame_count();
        let heap_used = kernel.heap_used_bytes();
        let processes = kernel.process_count();
        let directories = kernel.directories.iter().filter(|slot| slot.is_some()).count();

        // First segment loads fine, the second crosses the stack ceiling,
        // so partially loaded pages must be unwound too.
        let image = two_segment_image(
            ENTRY,
            CODE_AT,
            &code_bytes(),
            USER_STACK_TOP - 1,
            &[1, 2, 3, 4],
            DATA_MEM,
        );
        let result = kernel.create_process(&image, &["init"], &FlatImageLoader);
        assert_eq!(
            result,
            Err(ProcessError::ImageLoad(LoadError::OutsideUserWindow))
        );

        assert_eq!(kernel.active_directory(), DirId::KERNEL);
        assert_eq!(kernel.frames.free_frame_count(), free_frames);
        assert_eq!(kernel.heap_used_bytes(), heap_used);
        assert_eq!(kernel.process_count(), processes);
        assert_eq!(
            kernel.directories.iter().filter(|slot| slot.is_some()).count(),
            directories
        );
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut kernel = kernel();
        let result = kernel.create_process(&[0u8; 64], &[], &FlatImageLoader);
        assert_eq!(result, Err(ProcessError::ImageLoad(LoadError::BadFormat)));
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut kernel = kernel();
        let free_frames = kernel.frames.free_frame_count();
        let heap_used = kernel.heap_used_bytes();

        let pid = kernel
            .create_process(&sample_image(), &["init", "-i"], &FlatImageLoader)
            .unwrap();
        let pcb = kernel.process(pid).unwrap();
        let owned: Vec<PhysAddr> = pcb.pages().iter().map(|page| page.paddr).collect();
        assert!(!owned.is_empty());
        let kstack_frame = kernel
            .translate(pcb.kstack_page.unwrap().vaddr)
            .unwrap();
        let dir = pcb.directory;

        kernel.destroy_process(pid).unwrap();

        for frame in owned {
            assert!(!kernel.frames.is_frame_used(frame));
        }
        assert!(!kernel.frames.is_frame_used(kstack_frame));
        assert!(kernel.process(pid).is_none());
        assert!(kernel.directories[dir.0].is_none());
        assert!(kernel.interrupts_enabled());

        // The whole creation round-trips: every frame and heap byte is
        // back.
        assert_eq!(kernel.frames.free_frame_count(), free_frames);
        assert_eq!(kernel.heap_used_bytes(), heap_used);
    }

    #[test]
    fn test_destroy_guards() {
        let mut kernel = kernel();
        assert_eq!(
            kernel.destroy_process(Pid::new(KERNEL_PID)),
            Err(ProcessError::ReservedPid(Pid::new(KERNEL_PID)))
        );
        assert_eq!(
            kernel.destroy_process(Pid::new(99)),
            Err(ProcessError::NoSuchProcess(Pid::new(99)))
        );
        assert!(kernel.interrupts_enabled());
    }

    #[test]
    fn test_fork_copies_context_into_new_space() {
        let mut kernel = kernel();
        let parent = kernel
            .create_process(&sample_image(), &["init"], &FlatImageLoader)
            .unwrap();
        kernel.process_mut(parent).unwrap().regs.eax = 7;

        let child = kernel.fork(parent).unwrap();
        let child_pcb = kernel.process(child).unwrap();
        let parent_pcb = kernel.process(parent).unwrap();

        assert_eq!(child_pcb.regs.eax, 7);
        assert_eq!(child_pcb.regs.eip, parent_pcb.regs.eip);
        assert_eq!(child_pcb.regs.esp, parent_pcb.regs.esp);
        assert_eq!(child_pcb.parent(), Some(parent));
        assert_eq!(child_pcb.state(), ProcessState::Running);
        assert_ne!(child_pcb.directory, parent_pcb.directory);
        assert_ne!(child_pcb.regs.cr3, parent_pcb.regs.cr3);
        assert_ne!(child_pcb.kstack.esp0, parent_pcb.kstack.esp0);
        // No user memory is shared or copied yet.
        assert!(child_pcb.pages().is_empty());
        assert_eq!(
            kernel.translate_in(child_pcb.directory, VirtAddr::new(CODE_AT)),
            None
        );
    }

    #[test]
    fn test_reap_zombies_spares_the_living() {
        let mut kernel = kernel();
        let first = kernel
            .create_process(&sample_image(), &["first"], &FlatImageLoader)
            .unwrap();
        let second = kernel
            .create_process(&sample_image(), &["second"], &FlatImageLoader)
            .unwrap();

        kernel.set_process_state(first, ProcessState::Zombie).unwrap();
        assert_eq!(kernel.reap_zombies(), 1);

        assert!(kernel.process(first).is_none());
        assert!(kernel.process(second).is_some());
        // The kernel pseudo-process is zombie by construction but stays.
        assert!(kernel.process(Pid::new(KERNEL_PID)).is_some());
        assert_eq!(kernel.reap_zombies(), 0);
    }

    #[test]
    fn test_reparent_children() {
        let mut kernel = kernel();
        let old_parent = kernel
            .create_process(&sample_image(), &["old"], &FlatImageLoader)
            .unwrap();
        let new_parent = kernel
            .create_process(&sample_image(), &["new"], &FlatImageLoader)
            .unwrap();
        let first = kernel.fork(old_parent).unwrap();
        let second = kernel.fork(old_parent).unwrap();

        kernel.reparent_children(old_parent, new_parent);

        assert_eq!(kernel.process(first).unwrap().parent(), Some(new_parent));
        assert_eq!(kernel.process(second).unwrap().parent(), Some(new_parent));
    }

    #[test]
    fn test_open_file_slots() {
        let mut kernel = kernel();
        let pid = kernel
            .create_process(&sample_image(), &[], &FlatImageLoader)
            .unwrap();
        let pcb = kernel.process_mut(pid).unwrap();
        let fd = pcb
            .install_file(OpenFile {
                mode: 1,
                offset: 0,
                handle: 42,
            })
            .unwrap();
        assert_eq!(fd, 0);
        assert_eq!(pcb.file(fd).unwrap().handle, 42);
        assert_eq!(pcb.remove_file(fd).unwrap().handle, 42);
        assert!(pcb.file(fd).is_none());
    }

    #[test]
    fn test_signal_state() {
        let mut kernel = kernel();
        let pid = kernel
            .create_process(&sample_image(), &[], &FlatImageLoader)
            .unwrap();
        assert_eq!(
            kernel.process(pid).unwrap().signal_handler(3),
            Some(SignalDisposition::Default)
        );
        kernel.post_signal(pid, 3).unwrap();
        assert_eq!(kernel.process(pid).unwrap().pending_signals(), 1 << 3);
        assert_eq!(
            kernel.post_signal(pid, SIGNAL_COUNT),
            Err(ProcessError::BadSignal(SIGNAL_COUNT))
        );
    }
}
