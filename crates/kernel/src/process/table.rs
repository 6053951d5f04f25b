/// Process table and PID allocation
///
/// All live tasks, keyed by PID. User PIDs come from a monotonic counter
/// starting at 1000 and are never reused; the idle task (0) and init (1)
/// are created with their well-known PIDs at boot.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::error::{KernelError, Result};
use super::task::{Pid, Task, TaskState, INIT_PID};

/// First dynamically allocated PID.
pub const FIRST_USER_PID: Pid = 1000;

pub struct ProcessTable {
    tasks: Mutex<BTreeMap<Pid, Task>>,
    next_pid: AtomicU32,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            next_pid: AtomicU32::new(FIRST_USER_PID),
        }
    }

    /// Allocate the next PID (monotonic, >= 1000).
    pub fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&task.pid) {
            return Err(KernelError::Busy);
        }
        tasks.insert(task.pid, task);
        Ok(())
    }

    pub fn remove(&self, pid: Pid) -> Option<Task> {
        self.tasks.lock().remove(&pid)
    }

    pub fn exists(&self, pid: Pid) -> bool {
        self.tasks.lock().contains_key(&pid)
    }

    pub fn count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run a closure over one task.
    pub fn with<R>(&self, pid: Pid, f: impl FnOnce(&Task) -> R) -> Result<R> {
        let tasks = self.tasks.lock();
        tasks.get(&pid).map(f).ok_or(KernelError::NoSuchTask)
    }

    /// Run a closure over one task, mutably.
    pub fn with_mut<R>(&self, pid: Pid, f: impl FnOnce(&mut Task) -> R) -> Result<R> {
        let mut tasks = self.tasks.lock();
        tasks.get_mut(&pid).map(f).ok_or(KernelError::NoSuchTask)
    }

    /// Run a closure over two distinct tasks at once.
    pub fn with_pair<R>(
        &self,
        a: Pid,
        b: Pid,
        f: impl FnOnce(&mut Task, &mut Task) -> R,
    ) -> Result<R> {
        if a == b {
            return Err(KernelError::Invalid);
        }
        let mut tasks = self.tasks.lock();
        // Split via pointer juggling is not needed: remove one, reinsert.
        let mut task_b = tasks.remove(&b).ok_or(KernelError::NoSuchTask)?;
        let result = match tasks.get_mut(&a) {
            Some(task_a) => Ok(f(task_a, &mut task_b)),
            None => Err(KernelError::NoSuchTask),
        };
        tasks.insert(b, task_b);
        result
    }

    pub fn state_of(&self, pid: Pid) -> Option<TaskState> {
        self.tasks.lock().get(&pid).map(|t| t.state)
    }

    pub fn priority_of(&self, pid: Pid) -> Option<u8> {
        self.tasks.lock().get(&pid).map(|t| t.priority)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.tasks.lock().keys().copied().collect()
    }

    /// Live children of `ppid`, in PID order.
    pub fn children_of(&self, ppid: Pid) -> Vec<Pid> {
        self.tasks
            .lock()
            .values()
            .filter(|t| t.ppid == ppid)
            .map(|t| t.pid)
            .collect()
    }

    /// Hand every child of a dying task (zombies included) to init.
    pub fn reparent_to_init(&self, dying: Pid) {
        let mut tasks = self.tasks.lock();
        let orphans: Vec<Pid> = tasks
            .values()
            .filter(|t| t.ppid == dying)
            .map(|t| t.pid)
            .collect();
        for pid in &orphans {
            if let Some(task) = tasks.get_mut(pid) {
                task.ppid = INIT_PID;
            }
        }
        if !orphans.is_empty() {
            if let Some(init) = tasks.get_mut(&INIT_PID) {
                for pid in &orphans {
                    if !init.children.contains(pid) {
                        init.children.push(*pid);
                    }
                }
            }
            log::debug!("proc: reparented {} orphan(s) of {} to init", orphans.len(), dying);
        }
    }

    /// Consistency check: every Running task occupies a CPU slot and no
    /// task occupies two slots. (A slot may briefly hold a task that is
    /// blocking in place; that is the suspension-point transition.)
    pub fn verify_states(&self, running: &[Option<Pid>]) -> bool {
        for (i, slot) in running.iter().enumerate() {
            if let Some(pid) = slot {
                if running[i + 1..].contains(&Some(*pid)) {
                    return false;
                }
            }
        }
        let tasks = self.tasks.lock();
        for task in tasks.values() {
            if task.state == TaskState::Running
                && !running.iter().any(|slot| *slot == Some(task.pid))
            {
                return false;
            }
        }
        true
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::task::{CpuContext, FileTable, SignalState};
    use alloc::string::String;

    fn task(pid: Pid, ppid: Pid) -> Task {
        Task {
            pid,
            ppid,
            name: String::from("t"),
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

    #[test]
    fn pids_are_monotonic_from_1000() {
        let table = ProcessTable::new();
        let a = table.alloc_pid();
        let b = table.alloc_pid();
        assert_eq!(a, 1000);
        assert_eq!(b, 1001);
    }

    #[test]
    fn insert_and_reparent() {
        let table = ProcessTable::new();
        table.insert(task(INIT_PID, 0)).unwrap();
        table.insert(task(1000, 999)).unwrap();
        table.insert(task(1001, 1000)).unwrap();
        table.insert(task(1002, 1000)).unwrap();
        assert_eq!(table.children_of(1000).len(), 2);
        table.reparent_to_init(1000);
        assert_eq!(table.children_of(INIT_PID).len(), 2);
        assert!(table
            .with(INIT_PID, |t| t.children.contains(&1001) && t.children.contains(&1002))
            .unwrap());
    }

    #[test]
    fn double_insert_fails() {
        let table = ProcessTable::new();
        table.insert(task(1000, 1)).unwrap();
        assert_eq!(table.insert(task(1000, 1)).unwrap_err(), KernelError::Busy);
    }

    #[test]
    fn with_pair_restores_entries() {
        let table = ProcessTable::new();
        table.insert(task(1000, 1)).unwrap();
        table.insert(task(1001, 1)).unwrap();
        table
            .with_pair(1000, 1001, |a, b| {
                a.children.push(b.pid);
            })
            .unwrap();
        assert_eq!(table.count(), 2);
        assert!(table.with(1000, |t| t.children.contains(&1001)).unwrap());
    }
}
