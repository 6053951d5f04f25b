/// Preemptive multi-policy scheduler
///
/// Run-queue mechanics: round-robin keeps one circular queue, the
/// priority policy keeps one FIFO per priority level (0 is highest) and
/// picks the lowest-numbered non-empty queue. FIFO is the priority
/// policy without quantum preemption. Task state itself lives in the
/// process table; the kernel glues the two together on every tick.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::process::Pid;

/// Number of priority levels; 0 is the highest priority.
pub const NUM_PRIORITIES: usize = 256;

/// Default priority for new tasks.
pub const DEFAULT_PRIORITY: u8 = 128;

/// Scheduling policy, fixed at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// One circular run queue, quantum-based preemption
    RoundRobin,
    /// 256 per-priority FIFOs, round-robin within a level
    Priority,
    /// Priority queues without preemption inside a level
    Fifo,
}

enum RunQueues {
    RoundRobin(VecDeque<Pid>),
    Priority(Vec<VecDeque<Pid>>),
}

struct CpuSlot {
    current: Mutex<Option<Pid>>,
    need_resched: AtomicBool,
}

/// A sleeping task and its wake deadline in ticks.
struct Sleeper {
    pid: Pid,
    wake_at: u64,
}

/// Scheduler statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedStats {
    pub ticks: u64,
    pub context_switches: u64,
    pub preemptions: u64,
    pub yields: u64,
}

pub struct Scheduler {
    policy: SchedPolicy,
    queues: Mutex<RunQueues>,
    cpus: Vec<CpuSlot>,
    sleepers: Mutex<Vec<Sleeper>>,
    ticks: AtomicU64,
    context_switches: AtomicU64,
    preemptions: AtomicU64,
    yields: AtomicU64,
}

impl Scheduler {
    pub fn new(policy: SchedPolicy, cpus: usize) -> Self {
        let queues = match policy {
            SchedPolicy::RoundRobin => RunQueues::RoundRobin(VecDeque::new()),
            SchedPolicy::Priority | SchedPolicy::Fifo => {
                let mut qs = Vec::with_capacity(NUM_PRIORITIES);
                for _ in 0..NUM_PRIORITIES {
                    qs.push(VecDeque::new());
                }
                RunQueues::Priority(qs)
            }
        };
        let mut slots = Vec::with_capacity(cpus.max(1));
        for _ in 0..cpus.max(1) {
            slots.push(CpuSlot {
                current: Mutex::new(None),
                need_resched: AtomicBool::new(false),
            });
        }
        log::info!("sched: {:?} policy, {} cpu(s)", policy, slots.len());
        Self {
            policy,
            queues: Mutex::new(queues),
            cpus: slots,
            sleepers: Mutex::new(Vec::new()),
            ticks: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            yields: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Put a ready task on its run queue tail.
    pub fn enqueue(&self, pid: Pid, priority: u8) {
        let mut queues = self.queues.lock();
        match &mut *queues {
            RunQueues::RoundRobin(q) => {
                if !q.contains(&pid) {
                    q.push_back(pid);
                }
            }
            RunQueues::Priority(qs) => {
                let q = &mut qs[priority as usize];
                if !q.contains(&pid) {
                    q.push_back(pid);
                }
            }
        }
    }

    /// Remove a task from every run queue.
    pub fn dequeue(&self, pid: Pid) {
        let mut queues = self.queues.lock();
        match &mut *queues {
            RunQueues::RoundRobin(q) => q.retain(|&p| p != pid),
            RunQueues::Priority(qs) => {
                for q in qs.iter_mut() {
                    q.retain(|&p| p != pid);
                }
            }
        }
    }

    /// Pop the next runnable pid, if any.
    pub fn pick_next(&self) -> Option<Pid> {
        let mut queues = self.queues.lock();
        match &mut *queues {
            RunQueues::RoundRobin(q) => q.pop_front(),
            RunQueues::Priority(qs) => qs.iter_mut().find_map(|q| q.pop_front()),
        }
    }

    pub fn ready_count(&self) -> usize {
        let queues = self.queues.lock();
        match &*queues {
            RunQueues::RoundRobin(q) => q.len(),
            RunQueues::Priority(qs) => qs.iter().map(|q| q.len()).sum(),
        }
    }

    /// Highest waiting priority, if the priority policy is active.
    pub fn best_ready_priority(&self) -> Option<u8> {
        let queues = self.queues.lock();
        match &*queues {
            RunQueues::RoundRobin(_) => None,
            RunQueues::Priority(qs) => qs
                .iter()
                .position(|q| !q.is_empty())
                .map(|p| p as u8),
        }
    }

    pub fn current(&self, cpu: usize) -> Option<Pid> {
        *self.cpus[cpu % self.cpus.len()].current.lock()
    }

    pub fn set_current(&self, cpu: usize, pid: Option<Pid>) {
        *self.cpus[cpu % self.cpus.len()].current.lock() = pid;
    }

    /// Which CPU runs `pid`, if any.
    pub fn cpu_of(&self, pid: Pid) -> Option<usize> {
        self.cpus
            .iter()
            .position(|slot| *slot.current.lock() == Some(pid))
    }

    pub fn set_need_resched(&self, cpu: usize) {
        self.cpus[cpu % self.cpus.len()]
            .need_resched
            .store(true, Ordering::Release);
    }

    pub fn take_need_resched(&self, cpu: usize) -> bool {
        self.cpus[cpu % self.cpus.len()]
            .need_resched
            .swap(false, Ordering::AcqRel)
    }

    // ---- sleep queue ----

    pub fn add_sleeper(&self, pid: Pid, wake_at: u64) {
        self.sleepers.lock().push(Sleeper { pid, wake_at });
    }

    pub fn cancel_sleeper(&self, pid: Pid) {
        self.sleepers.lock().retain(|s| s.pid != pid);
    }

    /// Remove and return every sleeper whose deadline has passed.
    pub fn take_expired(&self, now: u64) -> Vec<Pid> {
        let mut sleepers = self.sleepers.lock();
        let mut woken = Vec::new();
        sleepers.retain(|s| {
            if s.wake_at <= now {
                woken.push(s.pid);
                false
            } else {
                true
            }
        });
        woken
    }

    pub fn sleeping_count(&self) -> usize {
        self.sleepers.lock().len()
    }

    // ---- counters ----

    pub fn note_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_yield(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
        }
    }
}
