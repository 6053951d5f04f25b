/// Process lifecycle
///
/// Task control blocks, the process table, fork and wait/exit glue.

pub mod fork;
pub mod table;
pub mod task;
pub mod wait;

pub use fork::{fork_stats, ForkStats};
pub use table::{ProcessTable, FIRST_USER_PID};
pub use task::{
    CpuContext, FdKind, FileDescriptor, FileTable, Pid, SignalState, Task, TaskState, WaitTarget,
    IDLE_PID, INIT_PID, NSIG, SIGCHLD, SIGSEGV,
};
pub use wait::WNOHANG;

pub(crate) use fork::do_fork;
pub(crate) use wait::{do_exit, do_waitpid};
