/// Exit and zombie reaping
///
/// exit() parks the task as a zombie, hands its children to init,
/// releases its address-space reference and IPC endpoints, and wakes a
/// parent already parked in waitpid. waitpid() reaps a matching zombie,
/// returning the encoded status (exit code in bits 8..15, signal in
/// bits 0..6) and freeing the TCB.

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use super::task::{Pid, TaskState, WaitTarget, IDLE_PID, INIT_PID};

/// waitpid options
pub const WNOHANG: i32 = 1;

pub(crate) fn do_exit(kernel: &Kernel, pid: Pid, code: i32, signal: i32) -> Result<()> {
    if pid == IDLE_PID || pid == INIT_PID {
        return Err(KernelError::Invalid);
    }
    let already = kernel.table.with(pid, |t| t.is_zombie())?;
    if already {
        return Err(KernelError::AlreadyTerminated);
    }

    kernel.table.with_mut(pid, |t| t.set_exit(code, signal))?;
    kernel.sched.dequeue(pid);
    kernel.sched.cancel_sleeper(pid);

    // A terminating task releases its address-space reference; the last
    // reference tears the space down.
    let aspace = kernel.table.with_mut(pid, |t| t.aspace.take())?;
    if let Some(aspace) = aspace {
        if alloc::sync::Arc::strong_count(&aspace) == 1 {
            kernel.mem.release_aspace(&aspace);
        }
    }

    // Owned queues disappear; every blocked peer wakes into NoSuchQueue.
    for waiter in kernel.ipc.destroy_for(pid) {
        kernel.wake_task(waiter);
    }

    // Orphans (zombies included) go to init.
    kernel.table.reparent_to_init(pid);

    // Wake the parent if it is parked on us or on "any child".
    let ppid = kernel.table.with(pid, |t| t.ppid)?;
    let parent_wants_us = kernel
        .table
        .with(ppid, |t| {
            t.state == TaskState::Waiting
                && t.waiting_for.map(|w| w.matches(pid)).unwrap_or(false)
        })
        .unwrap_or(false);
    if parent_wants_us {
        kernel.wake_task(ppid);
    }

    // Vacate the CPU if the dying task held one.
    if let Some(cpu) = kernel.sched.cpu_of(pid) {
        kernel.sched.set_current(cpu, None);
        kernel.schedule(cpu);
    }

    log::info!("proc: task {} exited (code {}, signal {})", pid, code, signal);
    Ok(())
}

pub(crate) fn do_waitpid(
    kernel: &Kernel,
    caller: Pid,
    pid: i32,
    options: i32,
) -> Result<(Pid, i32)> {
    let target = match pid {
        -1 => WaitTarget::AnyChild,
        p if p > 0 => WaitTarget::Child(p as Pid),
        _ => return Err(KernelError::Invalid),
    };

    let mut parked = false;
    loop {
        let children = kernel.table.with(caller, |t| t.children.clone())?;
        if pid > 0 && !children.contains(&(pid as Pid)) {
            if parked {
                kernel.unpark(caller);
            }
            return Err(KernelError::NoSuchChild);
        }
        if children.is_empty() {
            if parked {
                kernel.unpark(caller);
            }
            return Err(KernelError::NoChildren);
        }

        for &child in children.iter().filter(|c| target.matches(**c)) {
            if kernel.table.state_of(child) == Some(TaskState::Zombie) {
                return reap(kernel, caller, child);
            }
        }

        if options & WNOHANG != 0 {
            return Ok((0, 0));
        }

        // Park until a matching child exits. Wake-ups are edge-triggered
        // and spurious ones are fine: the condition is re-checked.
        kernel.table.with_mut(caller, |t| {
            t.state = TaskState::Waiting;
            t.waiting_for = Some(target);
        })?;
        parked = true;
        kernel.clock.advance(1);
        crate::cpu_relax();
    }
}

fn reap(kernel: &Kernel, caller: Pid, child: Pid) -> Result<(Pid, i32)> {
    kernel.table.with_mut(caller, |t| {
        t.waiting_for = None;
        t.children.retain(|&c| c != child);
    })?;
    kernel.unpark(caller);

    let mut task = kernel.table.remove(child).ok_or(KernelError::NoSuchChild)?;
    task.state = TaskState::Terminated;
    let status = task.wait_status();
    kernel
        .mem
        .frames()
        .free_pages(task.kstack, task.kstack_order);
    log::debug!("proc: reaped {} (status {:#x})", child, status);
    Ok((child, status))
}
