/// Process duplication
///
/// fork() builds the child from the parent: a COW clone of the address
/// space, a per-slot copy of the descriptor table, the signal vector
/// without pending bits, and a duplicate of the saved register file
/// with the return register forced to 0. The child is admitted Ready.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernelError, Result};
use crate::kernel::{Kernel, KSTACK_ORDER};
use crate::mm::AllocFlags;
use super::task::{Pid, Task, TaskState};

static TOTAL_FORKS: AtomicU64 = AtomicU64::new(0);
static FAILED_FORKS: AtomicU64 = AtomicU64::new(0);

/// Fork statistics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ForkStats {
    pub total_forks: u64,
    pub failed_forks: u64,
}

pub fn fork_stats() -> ForkStats {
    ForkStats {
        total_forks: TOTAL_FORKS.load(Ordering::Relaxed),
        failed_forks: FAILED_FORKS.load(Ordering::Relaxed),
    }
}

pub(crate) fn do_fork(kernel: &Kernel, parent_pid: Pid) -> Result<Pid> {
    match fork_inner(kernel, parent_pid) {
        Ok(child) => {
            TOTAL_FORKS.fetch_add(1, Ordering::Relaxed);
            log::debug!("fork: {} -> child {}", parent_pid, child);
            Ok(child)
        }
        Err(e) => {
            FAILED_FORKS.fetch_add(1, Ordering::Relaxed);
            log::warn!("fork: {} failed: {}", parent_pid, e);
            Err(e)
        }
    }
}

fn fork_inner(kernel: &Kernel, parent_pid: Pid) -> Result<Pid> {
    let child_pid = kernel.table.alloc_pid();

    let (parent_aspace, files, signals, context, name, priority, default_quantum) =
        kernel.table.with(parent_pid, |t| {
            (
                t.aspace.clone(),
                t.files.deep_copy(),
                t.signals.fork_copy(),
                t.context,
                t.name.clone(),
                t.priority,
                t.default_quantum,
            )
        })?;
    let parent_aspace = parent_aspace.ok_or(KernelError::Invalid)?;

    let child_aspace = kernel.mem.clone_aspace(&parent_aspace)?;

    let kstack = match kernel
        .mem
        .frames()
        .alloc_pages(KSTACK_ORDER, AllocFlags::empty())
    {
        Ok(pfn) => pfn,
        Err(e) => {
            kernel.mem.release_aspace(&child_aspace);
            return Err(e);
        }
    };

    // The child resumes from the same saved context but sees 0 returned.
    let mut child_context = context;
    child_context.set_return(0);

    let child = Task {
        pid: child_pid,
        ppid: parent_pid,
        name,
        state: TaskState::Ready,
        priority,
        quantum: default_quantum,
        default_quantum,
        context: child_context,
        kstack,
        kstack_order: KSTACK_ORDER,
        aspace: Some(child_aspace),
        files,
        signals,
        children: Vec::new(),
        exit_code: 0,
        exit_signal: 0,
        waiting_for: None,
        cpu_ticks: 0,
        dispatches: 0,
    };

    kernel.table.insert(child)?;
    kernel
        .table
        .with_mut(parent_pid, |t| t.children.push(child_pid))?;
    kernel
        .ipc
        .create_process_queue(child_pid, kernel.config().queue_capacity);
    kernel.sched.enqueue(child_pid, priority);
    Ok(child_pid)
}
