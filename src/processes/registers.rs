use core::fmt;

use crate::memory::address::{PhysAddr, VirtAddr};

/// Saved execution context of a process: the register image the context
/// switch restores, including the physical address of the page directory.
#[derive(Clone, Copy)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: VirtAddr,
    pub eip: VirtAddr,
    pub eflags: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub cr3: PhysAddr,
}

impl Registers {
    pub fn new() -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: VirtAddr::new(0),
            eip: VirtAddr::new(0),
            eflags: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
            cr3: PhysAddr::new(0),
        }
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ds = f.debug_struct("Registers");

        ds.field("eax", &format_args!("{:#010x}", self.eax))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("esp", &self.esp)
            .field("eip", &self.eip)
            .field("eflags", &format_args!("{:#010x}", self.eflags))
            .field("cs", &format_args!("{:#06x}", self.cs))
            .field("ds", &format_args!("{:#06x}", self.ds))
            .field("es", &format_args!("{:#06x}", self.es))
            .field("fs", &format_args!("{:#06x}", self.fs))
            .field("gs", &format_args!("{:#06x}", self.gs))
            .field("ss", &format_args!("{:#06x}", self.ss))
            .field("cr3", &self.cr3);

        ds.finish()
    }
}

/// Ring-0 stack descriptor loaded on privilege transitions into the
/// kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelStack {
    pub ss0: u16,
    pub esp0: VirtAddr,
}

impl KernelStack {
    pub fn new() -> Self {
        Self {
            ss0: 0,
            esp0: VirtAddr::new(0),
        }
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}
