/// Task control blocks
///
/// One `Task` per schedulable thread of control: identity, scheduler
/// state, the saved register file, the address-space reference, the
/// file-descriptor table and the signal vector.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::mm::{AddressSpace, Pfn};

pub type Pid = u32;

/// PID of the idle task.
pub const IDLE_PID: Pid = 0;
/// PID of init, the reparenting target for orphans.
pub const INIT_PID: Pid = 1;

/// Signal numbers used by the core.
pub const SIGSEGV: i32 = 11;
pub const SIGCHLD: i32 = 17;
pub const NSIG: usize = 32;

/// Task states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// On a run queue, waiting for a CPU
    Ready,
    /// Currently on a CPU
    Running,
    /// Parked on I/O, IPC or a sleep deadline
    Blocked,
    /// Parked in waitpid
    Waiting,
    /// Exited, waiting to be reaped
    Zombie,
    /// Reaped; the TCB is about to disappear
    Terminated,
}

/// What a waiting parent is prepared to reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    AnyChild,
    Child(Pid),
}

impl WaitTarget {
    pub fn matches(self, pid: Pid) -> bool {
        match self {
            WaitTarget::AnyChild => true,
            WaitTarget::Child(p) => p == pid,
        }
    }
}

/// Saved register file: callee/caller-saved registers, flags,
/// instruction pointer, stack pointer and the page-table root.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuContext {
    pub regs: [u64; 16],
    pub flags: u64,
    pub ip: u64,
    pub sp: u64,
    pub page_table_root: u64,
}

impl CpuContext {
    /// Set the syscall return register.
    pub fn set_return(&mut self, value: u64) {
        self.regs[0] = value;
    }

    pub fn return_value(&self) -> u64 {
        self.regs[0]
    }
}

/// Where writes through a descriptor end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// Console output (fd 1/2); bytes go to the kernel log
    Console,
    /// Discards writes, reads empty
    Null,
}

#[derive(Debug)]
pub struct FileDescriptor {
    pub kind: FdKind,
}

impl FileDescriptor {
    pub fn write(&self, buf: &[u8]) -> usize {
        match self.kind {
            FdKind::Console => {
                let text = String::from_utf8_lossy(buf);
                log::info!(target: "console", "{}", text.trim_end_matches('\n'));
                buf.len()
            }
            FdKind::Null => buf.len(),
        }
    }
}

/// File descriptor table; descriptors are Arc-shared so a fork preserves
/// the underlying references.
pub struct FileTable {
    fds: Vec<Option<Arc<FileDescriptor>>>,
}

const MAX_FDS: usize = 64;

impl FileTable {
    /// New table with the standard console descriptors on 0..=2.
    pub fn new() -> Self {
        let mut fds = alloc::vec![None; MAX_FDS];
        let console = Arc::new(FileDescriptor { kind: FdKind::Console });
        fds[0] = Some(Arc::new(FileDescriptor { kind: FdKind::Null }));
        fds[1] = Some(console.clone());
        fds[2] = Some(console);
        Self { fds }
    }

    pub fn get(&self, fd: i32) -> Result<Arc<FileDescriptor>> {
        if fd < 0 || fd as usize >= self.fds.len() {
            return Err(KernelError::Invalid);
        }
        self.fds[fd as usize].clone().ok_or(KernelError::NotFound)
    }

    pub fn alloc_fd(&mut self, file: Arc<FileDescriptor>) -> Result<i32> {
        for (i, slot) in self.fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(i as i32);
            }
        }
        Err(KernelError::Overflow)
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        if fd < 0 || fd as usize >= self.fds.len() || self.fds[fd as usize].is_none() {
            return Err(KernelError::Invalid);
        }
        self.fds[fd as usize] = None;
        Ok(())
    }

    pub fn dup(&mut self, fd: i32) -> Result<i32> {
        let file = self.get(fd)?;
        self.alloc_fd(file)
    }

    /// Per-slot copy preserving the underlying references.
    pub fn deep_copy(&self) -> Self {
        Self {
            fds: self.fds.clone(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.fds.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal handler vector and masks. The pending set is per-task and is
/// not inherited across fork.
#[derive(Debug, Clone)]
pub struct SignalState {
    /// Handler addresses, 0 = default
    pub handlers: [u64; NSIG],
    pub blocked_mask: u64,
    pub pending: u64,
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            handlers: [0; NSIG],
            blocked_mask: 0,
            pending: 0,
        }
    }

    /// Copy for fork: handlers and mask carry over, pending does not.
    pub fn fork_copy(&self) -> Self {
        Self {
            handlers: self.handlers,
            blocked_mask: self.blocked_mask,
            pending: 0,
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Main task structure.
pub struct Task {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub state: TaskState,
    /// 0 is the highest priority
    pub priority: u8,
    /// Remaining ticks in the current quantum
    pub quantum: u32,
    pub default_quantum: u32,
    pub context: CpuContext,
    /// Kernel stack allocation (buddy run)
    pub kstack: Pfn,
    pub kstack_order: u8,
    pub aspace: Option<Arc<AddressSpace>>,
    pub files: FileTable,
    pub signals: SignalState,
    pub children: Vec<Pid>,
    pub exit_code: i32,
    pub exit_signal: i32,
    pub waiting_for: Option<WaitTarget>,
    /// Total ticks spent on a CPU
    pub cpu_ticks: u64,
    /// Times this task was dispatched
    pub dispatches: u64,
}

impl Task {
    pub fn is_zombie(&self) -> bool {
        self.state == TaskState::Zombie
    }

    /// Mark as zombie and record the exit disposition.
    pub fn set_exit(&mut self, code: i32, signal: i32) {
        self.state = TaskState::Zombie;
        self.exit_code = code;
        self.exit_signal = signal;
    }

    /// Encoded wait status: exit code in bits 8..15, signal in bits 0..6.
    pub fn wait_status(&self) -> i32 {
        (self.exit_code << 8) | (self.exit_signal & 0x7f)
    }

    pub fn reset_quantum(&mut self) {
        self.quantum = self.default_quantum;
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("ppid", &self.ppid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_encoding() {
        let mut task = test_task(1500);
        task.set_exit(7, 0);
        assert_eq!(task.wait_status(), 7 << 8);
        task.set_exit(0, SIGSEGV);
        assert_eq!(task.wait_status(), 0x0b);
    }

    #[test]
    fn fork_copy_drops_pending_signals() {
        let mut signals = SignalState::new();
        signals.handlers[SIGCHLD as usize] = 0xdead;
        signals.blocked_mask = 0b1010;
        signals.pending = 0xff;
        let copy = signals.fork_copy();
        assert_eq!(copy.handlers[SIGCHLD as usize], 0xdead);
        assert_eq!(copy.blocked_mask, 0b1010);
        assert_eq!(copy.pending, 0);
    }

    #[test]
    fn fd_table_dup_and_close() {
        let mut files = FileTable::new();
        assert_eq!(files.open_count(), 3);
        let fd = files.dup(1).unwrap();
        assert_eq!(fd, 3);
        files.close(fd).unwrap();
        assert!(files.close(fd).is_err());
        assert!(files.get(1).is_ok());
    }

    fn test_task(pid: Pid) -> Task {
        Task {
            pid,
            ppid: INIT_PID,
            name: String::from("test"),
            state: TaskState::Ready,
            priority: 128,
            quantum: 10,
            default_quantum: 10,
            context: CpuContext::default(),
            kstack: 0,
            kstack_order: 0,
            aspace: None,
            files: FileTable::new(),
            signals: SignalState::new(),
            children: Vec::new(),
            exit_code: 0,
            exit_signal: 0,
            waiting_for: None,
            cpu_ticks: 0,
            dispatches: 0,
        }
    }
}
