//! Core kernel runtime
//!
//! The interlocking heart of a small 64-bit operating system, built as a
//! hosted library so its behavior can be driven and observed directly:
//!
//! - a preemptive multi-policy scheduler (round-robin, priority, FIFO)
//! - a tiered physical allocator: zoned page frames, a buddy allocator
//!   and a slab object allocator with per-CPU magazines
//! - per-process virtual memory with copy-on-write fork
//! - demand paging with LRU/Clock/FIFO replacement over swap files
//! - message-passing IPC: bounded queues, named channels, request/reply
//! - fork/waitpid process lifecycle and the numeric syscall surface
//!
//! Physical frames carry real byte storage and page tables are software
//! maps, so every path from a user "access" down to the buddy lists
//! runs for real. The platform traps of the target machine (page fault,
//! periodic timer) are the entry points `Kernel::handle_page_fault` and
//! `Kernel::timer_tick`.
//!
//! ```no_run
//! use nucleon_kernel::{Kernel, KernelConfig};
//!
//! let kernel = Kernel::init(KernelConfig::default()).unwrap();
//! let pid = kernel.task_create("worker", 128).unwrap();
//! kernel.timer_tick(0);
//! let child = kernel.fork(pid).unwrap();
//! kernel.exit_task(child, 0, 0).unwrap();
//! let (reaped, status) = kernel.waitpid(pid, -1, 0).unwrap();
//! assert_eq!((reaped, status), (child, 0));
//! kernel.shutdown();
//! ```

extern crate alloc;

pub mod clock;
pub mod config;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;

pub use clock::KernelClock;
pub use config::{KernelConfig, MemRange, SwapFileConfig};
pub use error::{codes, KernelError, Result};
pub use ipc::{msg_type, Message, MessageFlags, QueuePerms, MAX_MESSAGE_SIZE, MESSAGE_WIRE_SIZE};
pub use kernel::Kernel;
pub use mm::{
    AllocFlags, Backing, FaultError, FaultKind, MapFlags, PagingStats, Prot, ReplacementPolicy,
    ZoneKind, MAX_ORDER, PAGE_SIZE,
};
pub use process::{Pid, TaskState, IDLE_PID, INIT_PID, WNOHANG};
pub use sched::{SchedPolicy, SchedStats, DEFAULT_PRIORITY};

/// Give other harness threads a chance while a task is parked; the
/// kernel's polling paths call this between condition re-checks.
pub(crate) fn cpu_relax() {
    std::thread::yield_now();
}
