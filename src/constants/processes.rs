//! Process-layout constants.

/// Top of every process's user stack; the initial stack image is built
/// just below this address.
pub const USER_STACK_TOP: u32 = 0xE000_0000;
/// The initial stack pointer is aligned by clearing the low four bits.
pub const STACK_ALIGN_MASK: u32 = 0xFFFF_FFF0;

/// Reserved pid of the kernel pseudo-process; never reaped.
pub const KERNEL_PID: u32 = 1;

/// Slots in the per-process open-file table.
pub const MAX_OPEN_FILES: usize = 16;
/// Signal numbers carried per process.
pub const SIGNAL_COUNT: usize = 32;
/// Upper bound on argument-vector entries accepted by process creation.
pub const MAX_ARGS: usize = 32;

/// Startup argument vector handed to boot modules.
pub const INIT_ARGV: &[&str] = &["init", "-i"];
