/// The kernel handle
///
/// `Kernel::init` builds every subsystem from a `KernelConfig`;
/// everything the core can do is a method on the handle, and
/// `Kernel::shutdown` consumes it. The platform traps land here:
/// `timer_tick` for the periodic timer and `handle_page_fault` for the
/// MMU, both running the work a real trap handler would do before
/// returning through a reschedule point.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::clock::KernelClock;
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::ipc::{msg_type, IpcRegistry, IpcStats, Message, MessageFlags, QueuePerms, MAX_MESSAGE_SIZE};
use crate::mm::{
    AddressSpace, AllocFlags, Backing, FaultError, FaultKind, MapFlags, MemorySystem, PagingStats,
    Prot, SlabCache, pfn_to_pa,
};
use crate::process::{
    do_exit, do_fork, do_waitpid, Pid, ProcessTable, Task, TaskState, CpuContext, FileTable,
    SignalState, IDLE_PID, INIT_PID, SIGSEGV,
};
use crate::sched::{SchedPolicy, SchedStats, Scheduler, DEFAULT_PRIORITY};

/// Kernel stack size: 2^2 pages = 16 KiB.
pub const KSTACK_ORDER: u8 = 2;

/// Bounce-buffer object size for user/kernel copies.
const BOUNCE_SIZE: usize = 1024;

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) clock: KernelClock,
    pub(crate) mem: MemorySystem,
    pub(crate) table: ProcessTable,
    pub(crate) sched: Scheduler,
    pub(crate) ipc: IpcRegistry,
    pub(crate) bounce: Arc<SlabCache>,
}

impl Kernel {
    /// Bring the core up: memory, scheduler, IPC, the idle task (PID 0)
    /// and init (PID 1).
    pub fn init(config: KernelConfig) -> Result<Kernel> {
        let mem = MemorySystem::new(&config)?;
        let bounce = mem.cache_create("kcopy", BOUNCE_SIZE, 64, None)?;
        let kernel = Kernel {
            clock: KernelClock::new(config.hz),
            sched: Scheduler::new(config.sched_policy, config.cpus),
            table: ProcessTable::new(),
            ipc: IpcRegistry::new(),
            mem,
            bounce,
            config,
        };

        kernel.spawn_with_pid(IDLE_PID, 0, "idle", u8::MAX, false, false)?;
        kernel.spawn_with_pid(INIT_PID, 0, "init", DEFAULT_PRIORITY, true, false)?;
        // init parks in its supervision loop until a child reports
        kernel
            .table
            .with_mut(INIT_PID, |t| t.state = TaskState::Blocked)?;
        log::info!("kernel: up ({} tasks)", kernel.table.count());
        Ok(kernel)
    }

    /// Tear the core down, consuming the handle.
    pub fn shutdown(self) {
        for cache in self.mem.caches() {
            let _ = cache.flush();
            cache.shrink();
        }
        log::info!(
            "kernel: shutdown after {} ticks; {}",
            self.clock.now_ticks(),
            self.mem.summary()
        );
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn now_ticks(&self) -> u64 {
        self.clock.now_ticks()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ---- task management ----

    fn spawn_with_pid(
        &self,
        pid: Pid,
        ppid: Pid,
        name: &str,
        priority: u8,
        with_aspace: bool,
        enqueue: bool,
    ) -> Result<Pid> {
        let aspace = if with_aspace {
            Some(self.mem.create_aspace()?)
        } else {
            None
        };
        let kstack = self
            .mem
            .frames()
            .alloc_pages(KSTACK_ORDER, AllocFlags::empty())?;
        let task = Task {
            pid,
            ppid,
            name: String::from(name),
            state: TaskState::Ready,
            priority,
            quantum: self.config.default_quantum,
            default_quantum: self.config.default_quantum,
            context: CpuContext::default(),
            kstack,
            kstack_order: KSTACK_ORDER,
            aspace,
            files: FileTable::new(),
            signals: SignalState::new(),
            children: Vec::new(),
            exit_code: 0,
            exit_signal: 0,
            waiting_for: None,
            cpu_ticks: 0,
            dispatches: 0,
        };
        self.table.insert(task)?;
        if pid != IDLE_PID {
            self.ipc.create_process_queue(pid, self.config.queue_capacity);
        }
        if enqueue {
            self.sched.enqueue(pid, priority);
        }
        Ok(pid)
    }

    /// Create a primordial task (outside fork), admitted Ready.
    pub fn task_create(&self, name: &str, priority: u8) -> Result<Pid> {
        let pid = self.table.alloc_pid();
        self.spawn_with_pid(pid, INIT_PID, name, priority, true, true)?;
        self.table
            .with_mut(INIT_PID, |t| t.children.push(pid))
            .ok();
        self.preempt_check(priority);
        log::debug!("kernel: task {} '{}' created (prio {})", pid, name, priority);
        Ok(pid)
    }

    pub fn task_state(&self, pid: Pid) -> Result<TaskState> {
        self.table.with(pid, |t| t.state)
    }

    /// Task currently holding `cpu`, if any.
    pub fn sched_current(&self, cpu: usize) -> Option<Pid> {
        self.sched.current(cpu)
    }

    pub fn with_task<R>(&self, pid: Pid, f: impl FnOnce(&Task) -> R) -> Result<R> {
        self.table.with(pid, f)
    }

    pub fn tasks(&self) -> Vec<Pid> {
        self.table.pids()
    }

    // ---- scheduling ----

    /// Periodic timer entry point. Updates counters, wakes expired
    /// sleepers, and reschedules on the way out when the quantum is gone.
    pub fn timer_tick(&self, cpu: usize) {
        let now = if cpu == 0 {
            self.clock.tick()
        } else {
            self.clock.now_ticks()
        };
        self.sched.note_tick();

        if cpu == 0 {
            for pid in self.sched.take_expired(now) {
                log::trace!("sched: sleeper {} expired", pid);
                self.wake_task(pid);
            }
        }

        match self.sched.current(cpu) {
            Some(pid) if pid != IDLE_PID => {
                let expired = self
                    .table
                    .with_mut(pid, |t| {
                        t.cpu_ticks += 1;
                        t.quantum = t.quantum.saturating_sub(1);
                        t.quantum == 0
                    })
                    .unwrap_or(false);
                if expired && self.sched.policy() != SchedPolicy::Fifo {
                    self.sched.set_need_resched(cpu);
                }
            }
            _ => {
                if self.sched.ready_count() > 0 {
                    self.sched.set_need_resched(cpu);
                }
            }
        }

        if self.sched.take_need_resched(cpu) {
            self.sched.note_preemption();
            self.schedule(cpu);
        }
    }

    /// Dispatch the next ready task on `cpu`. The outgoing task, if
    /// still Running, goes back to the tail of its queue.
    pub fn schedule(&self, cpu: usize) {
        let outgoing = self.sched.current(cpu);
        if let Some(pid) = outgoing {
            if pid == IDLE_PID {
                self.table
                    .with_mut(pid, |t| t.state = TaskState::Ready)
                    .ok();
            } else {
                let requeue = self
                    .table
                    .with_mut(pid, |t| {
                        if t.state == TaskState::Running {
                            t.state = TaskState::Ready;
                            t.reset_quantum();
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);
                if requeue {
                    let prio = self.table.priority_of(pid).unwrap_or(DEFAULT_PRIORITY);
                    self.sched.enqueue(pid, prio);
                }
            }
        }

        let next = loop {
            match self.sched.pick_next() {
                Some(pid) => {
                    let dispatched = self
                        .table
                        .with_mut(pid, |t| {
                            if t.state == TaskState::Ready {
                                t.state = TaskState::Running;
                                t.reset_quantum();
                                t.dispatches += 1;
                                true
                            } else {
                                false
                            }
                        })
                        .unwrap_or(false);
                    if dispatched {
                        break Some(pid);
                    }
                    // Stale queue entry; skip it
                }
                None => break None,
            }
        };

        match next {
            Some(pid) => {
                // Context switch: the register file already lives in the
                // TCB; the page-table root travels with it.
                let root = self
                    .table
                    .with(pid, |t| {
                        t.aspace.as_ref().map(|a| a.root_pfn()).unwrap_or(0)
                    })
                    .unwrap_or(0);
                self.table
                    .with_mut(pid, |t| t.context.page_table_root = pfn_to_pa(root))
                    .ok();
                self.sched.set_current(cpu, Some(pid));
                self.sched.note_switch();
                log::trace!("sched: cpu {} -> task {}", cpu, pid);
            }
            None => {
                // Idle: halt until the next interrupt
                self.table
                    .with_mut(IDLE_PID, |t| t.state = TaskState::Running)
                    .ok();
                self.sched.set_current(cpu, Some(IDLE_PID));
            }
        }
    }

    /// Voluntary reschedule of the current task on `cpu`.
    pub fn yield_now(&self, cpu: usize) {
        self.sched.note_yield();
        self.schedule(cpu);
    }

    /// Block the current task on `cpu` for `ms` milliseconds.
    pub fn sleep(&self, cpu: usize, ms: u64) -> Result<()> {
        let pid = self.sched.current(cpu).ok_or(KernelError::NoSuchTask)?;
        if pid == IDLE_PID {
            return Err(KernelError::Invalid);
        }
        let wake_at = self.clock.now_ticks() + self.clock.ticks_for_ms(ms);
        self.table
            .with_mut(pid, |t| t.state = TaskState::Blocked)?;
        self.sched.add_sleeper(pid, wake_at);
        log::trace!("sched: task {} sleeping until tick {}", pid, wake_at);
        self.schedule(cpu);
        Ok(())
    }

    /// Make a blocked/waiting task runnable again.
    pub(crate) fn wake_task(&self, pid: Pid) {
        let woke = self
            .table
            .with_mut(pid, |t| {
                if matches!(t.state, TaskState::Blocked | TaskState::Waiting) {
                    t.state = TaskState::Ready;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !woke {
            return;
        }
        let prio = self.table.priority_of(pid).unwrap_or(DEFAULT_PRIORITY);
        self.sched.enqueue(pid, prio);
        self.preempt_check(prio);
    }

    /// Leave a blocking section: back to Running when the task holds a
    /// CPU, otherwise Ready on its run queue.
    pub(crate) fn unpark(&self, pid: Pid) {
        let on_cpu = self.sched.cpu_of(pid).is_some();
        let runnable = self
            .table
            .with_mut(pid, |t| {
                match t.state {
                    TaskState::Blocked | TaskState::Waiting | TaskState::Ready
                    | TaskState::Running => {
                        t.state = if on_cpu {
                            TaskState::Running
                        } else {
                            TaskState::Ready
                        };
                        true
                    }
                    _ => false,
                }
            })
            .unwrap_or(false);
        if runnable && !on_cpu {
            let prio = self.table.priority_of(pid).unwrap_or(DEFAULT_PRIORITY);
            self.sched.enqueue(pid, prio);
        }
    }

    /// A task of priority `prio` became runnable; preempt a CPU running
    /// something less urgent (priority policies) or wake an idle one.
    fn preempt_check(&self, prio: u8) {
        for cpu in 0..self.sched.cpu_count() {
            match self.sched.current(cpu) {
                None => {
                    self.sched.set_need_resched(cpu);
                    return;
                }
                Some(IDLE_PID) => {
                    self.sched.set_need_resched(cpu);
                    return;
                }
                Some(running) => {
                    if self.sched.policy() != SchedPolicy::RoundRobin {
                        let running_prio =
                            self.table.priority_of(running).unwrap_or(DEFAULT_PRIORITY);
                        if prio < running_prio {
                            self.sched.set_need_resched(cpu);
                            return;
                        }
                    }
                }
            }
        }
    }

    // ---- process lifecycle ----

    pub fn fork(&self, parent: Pid) -> Result<Pid> {
        do_fork(self, parent)
    }

    pub fn waitpid(&self, caller: Pid, pid: i32, options: i32) -> Result<(Pid, i32)> {
        do_waitpid(self, caller, pid, options)
    }

    pub fn exit_task(&self, pid: Pid, code: i32, signal: i32) -> Result<()> {
        do_exit(self, pid, code, signal)
    }

    // ---- memory entry points ----

    pub(crate) fn aspace_of(&self, pid: Pid) -> Result<Arc<AddressSpace>> {
        self.table
            .with(pid, |t| t.aspace.clone())?
            .ok_or(KernelError::NoSuchTask)
    }

    pub fn mmap(
        &self,
        pid: Pid,
        addr: u64,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        backing: Backing,
    ) -> Result<u64> {
        let aspace = self.aspace_of(pid)?;
        self.mem.mmap(&aspace, addr, len, prot, flags, backing)
    }

    pub fn munmap(&self, pid: Pid, addr: u64, len: u64) -> Result<()> {
        let aspace = self.aspace_of(pid)?;
        self.mem.munmap(&aspace, addr, len)
    }

    pub fn mprotect(&self, pid: Pid, addr: u64, len: u64, prot: Prot) -> Result<()> {
        let aspace = self.aspace_of(pid)?;
        self.mem.mprotect(&aspace, addr, len, prot)
    }

    pub fn brk(&self, pid: Pid, new_brk: u64) -> Result<u64> {
        let aspace = self.aspace_of(pid)?;
        self.mem.brk(&aspace, new_brk)
    }

    /// Page-fault trap entry. An unresolvable fault kills the faulting
    /// process with the SEGV disposition (status 0x0b).
    pub fn handle_page_fault(&self, pid: Pid, addr: u64, err: FaultError) -> Result<FaultKind> {
        let aspace = self.aspace_of(pid)?;
        match self.mem.handle_fault(&aspace, addr, err, self.clock.now_ticks()) {
            Err(KernelError::Segv) => {
                log::warn!("fault: task {} segfaulted at {:#x}", pid, addr);
                let _ = self.exit_task(pid, 0, SIGSEGV);
                Err(KernelError::Segv)
            }
            other => other,
        }
    }

    /// Store into user memory as the task itself would; a bad address
    /// terminates the task like a real wild store.
    pub fn write_user(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        let aspace = self.aspace_of(pid)?;
        match self
            .mem
            .write_user(&aspace, addr, data, self.clock.now_ticks())
        {
            Err(KernelError::Segv) => {
                let _ = self.exit_task(pid, 0, SIGSEGV);
                Err(KernelError::Segv)
            }
            other => other,
        }
    }

    pub fn read_user(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        let aspace = self.aspace_of(pid)?;
        match self
            .mem
            .read_user(&aspace, addr, buf, self.clock.now_ticks())
        {
            Err(KernelError::Segv) => {
                let _ = self.exit_task(pid, 0, SIGSEGV);
                Err(KernelError::Segv)
            }
            other => other,
        }
    }

    // ---- IPC entry points ----

    pub fn create_queue(&self, owner: Pid, capacity: usize, perms: QueuePerms) -> u32 {
        self.ipc.create_queue(owner, capacity, perms)
    }

    pub fn destroy_queue(&self, caller: Pid, qid: u32) -> Result<()> {
        for waiter in self.ipc.destroy_queue(qid, caller)? {
            self.wake_task(waiter);
        }
        Ok(())
    }

    fn stamp(&self, msg: &mut Message, sender: Pid) {
        msg.sender_pid = sender;
        msg.timestamp = self.clock.now_ms();
        if msg.msg_id == 0 {
            msg.msg_id = self.ipc.next_msg_id();
        }
    }

    /// Send to an explicit queue. Blocking sends park the caller in
    /// FIFO order behind other blocked senders.
    pub fn send_message(
        &self,
        sender: Pid,
        qid: u32,
        mut msg: Message,
        flags: MessageFlags,
    ) -> Result<()> {
        if msg.data_size as usize > MAX_MESSAGE_SIZE {
            return Err(KernelError::MessageTooLarge);
        }
        let queue = self.ipc.queue(qid)?;
        self.stamp(&mut msg, sender);

        let mut parked = false;
        loop {
            match queue.try_send(sender, msg.clone()) {
                Ok(wake) => {
                    if parked {
                        queue.unregister_send_waiter(sender);
                        self.unpark(sender);
                    }
                    if let Some(pid) = wake {
                        self.wake_task(pid);
                    }
                    self.ipc
                        .stats
                        .messages_sent
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(KernelError::QueueFull) if !flags.contains(MessageFlags::NON_BLOCKING) => {
                    if !parked {
                        queue.register_send_waiter(sender);
                        self.table
                            .with_mut(sender, |t| t.state = TaskState::Blocked)
                            .ok();
                        parked = true;
                    }
                    self.relax();
                }
                Err(e) => {
                    if parked {
                        queue.unregister_send_waiter(sender);
                        self.unpark(sender);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Receive from an explicit queue, symmetric with send.
    pub fn receive_message(
        &self,
        receiver: Pid,
        qid: u32,
        flags: MessageFlags,
    ) -> Result<Message> {
        let queue = self.ipc.queue(qid)?;
        self.receive_on(&queue, receiver, flags)
    }

    /// Receive from the caller's own process queue (the serving side of
    /// request/reply and channel delivery).
    pub fn receive_any(&self, receiver: Pid, flags: MessageFlags) -> Result<Message> {
        let queue = self.ipc.process_queue(receiver)?;
        self.receive_on(&queue, receiver, flags)
    }

    fn receive_on(
        &self,
        queue: &Arc<crate::ipc::MessageQueue>,
        receiver: Pid,
        flags: MessageFlags,
    ) -> Result<Message> {
        let mut parked = false;
        loop {
            match queue.try_recv(receiver) {
                Ok((msg, wake)) => {
                    if parked {
                        queue.unregister_recv_waiter(receiver);
                        self.unpark(receiver);
                    }
                    if let Some(pid) = wake {
                        self.wake_task(pid);
                    }
                    self.ipc
                        .stats
                        .messages_received
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(msg);
                }
                Err(KernelError::QueueEmpty) if !flags.contains(MessageFlags::NON_BLOCKING) => {
                    if !parked {
                        queue.register_recv_waiter(receiver);
                        self.table
                            .with_mut(receiver, |t| t.state = TaskState::Blocked)
                            .ok();
                        parked = true;
                    }
                    self.relax();
                }
                Err(e) => {
                    if parked {
                        queue.unregister_recv_waiter(receiver);
                        self.unpark(receiver);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Read the head of a queue without consuming it.
    pub fn peek_message(&self, qid: u32) -> Result<Message> {
        self.ipc.queue(qid)?.peek()
    }

    /// Publish on a channel. Broadcast delivers best-effort copies to
    /// every subscriber's process queue; unicast takes the first
    /// subscriber with room.
    pub fn send_to_channel(&self, sender: Pid, cid: u32, mut msg: Message) -> Result<usize> {
        let subscribers = self.ipc.channel_subscribers(cid)?;
        let broadcast = self.ipc.channel_is_broadcast(cid)?;
        self.stamp(&mut msg, sender);

        if broadcast {
            let mut delivered = 0;
            for pid in subscribers {
                let Ok(queue) = self.ipc.process_queue(pid) else {
                    continue;
                };
                let mut copy = msg.clone();
                copy.receiver_pid = pid;
                if let Ok(wake) = queue.try_send(sender, copy) {
                    delivered += 1;
                    if let Some(w) = wake {
                        self.wake_task(w);
                    }
                }
            }
            self.ipc.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
            Ok(delivered)
        } else {
            for pid in subscribers {
                let Ok(queue) = self.ipc.process_queue(pid) else {
                    continue;
                };
                let mut copy = msg.clone();
                copy.receiver_pid = pid;
                match queue.try_send(sender, copy) {
                    Ok(wake) => {
                        if let Some(w) = wake {
                            self.wake_task(w);
                        }
                        self.ipc
                            .stats
                            .messages_sent
                            .fetch_add(1, Ordering::Relaxed);
                        return Ok(1);
                    }
                    Err(_) => continue,
                }
            }
            Err(KernelError::QueueFull)
        }
    }

    /// Request/reply rendezvous with a deadline. Polls the caller's own
    /// process queue for the matching reply, yielding between polls.
    pub fn send_request(
        &self,
        caller: Pid,
        target: Pid,
        request: &Message,
        reply_out: &mut Message,
        timeout_ms: u64,
    ) -> Result<()> {
        if !self.table.exists(target) {
            return Err(KernelError::NoSuchTask);
        }
        let mut msg = request.clone();
        msg.mtype = msg_type::REQUEST;
        msg.msg_id = self.ipc.next_msg_id();
        msg.receiver_pid = target;
        msg.sender_pid = caller;
        msg.timestamp = self.clock.now_ms();
        let request_id = msg.msg_id;

        let target_queue = self.ipc.process_queue(target)?;
        if let Some(wake) = target_queue.try_send(caller, msg)? {
            self.wake_task(wake);
        }
        self.ipc.stats.requests.fetch_add(1, Ordering::Relaxed);

        let own = self.ipc.process_queue(caller)?;
        let deadline = self.clock.now_ticks() + self.clock.ticks_for_ms(timeout_ms);
        loop {
            if let Some((reply, wake)) = own.take_matching(caller, |m| {
                m.mtype == msg_type::REPLY && m.reply_to == request_id
            })? {
                if let Some(w) = wake {
                    self.wake_task(w);
                }
                self.ipc
                    .stats
                    .messages_received
                    .fetch_add(1, Ordering::Relaxed);
                *reply_out = reply;
                return Ok(());
            }
            if self.clock.now_ticks() >= deadline {
                self.ipc.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "ipc: request {} from {} to {} timed out",
                    request_id,
                    caller,
                    target
                );
                return Err(KernelError::Timeout);
            }
            // Mandatory yield between polls
            self.relax();
        }
    }

    /// Answer a request: type REPLY, enqueued on the target's queue.
    pub fn send_reply(&self, caller: Pid, target: Pid, mut reply: Message) -> Result<()> {
        let queue = self.ipc.process_queue(target)?;
        reply.mtype = msg_type::REPLY;
        reply.receiver_pid = target;
        self.stamp(&mut reply, caller);
        if let Some(wake) = queue.try_send(caller, reply)? {
            self.wake_task(wake);
        }
        self.ipc.stats.replies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fire-and-forget notification to a process queue.
    pub fn send_async(&self, caller: Pid, target: Pid, mut msg: Message) -> Result<()> {
        let queue = self.ipc.process_queue(target)?;
        msg.mtype = msg_type::NOTIFICATION;
        msg.receiver_pid = target;
        self.stamp(&mut msg, caller);
        if let Some(wake) = queue.try_send(caller, msg)? {
            self.wake_task(wake);
        }
        self.ipc
            .stats
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Deliver one copy per explicit target; succeeds if at least one
    /// queue took it.
    pub fn broadcast(&self, sender: Pid, msg: &Message, targets: &[Pid]) -> Result<usize> {
        let mut stamped = msg.clone();
        self.stamp(&mut stamped, sender);
        let mut delivered = 0;
        for &target in targets {
            let Ok(queue) = self.ipc.process_queue(target) else {
                continue;
            };
            let mut copy = stamped.clone();
            copy.receiver_pid = target;
            if let Ok(wake) = queue.try_send(sender, copy) {
                delivered += 1;
                if let Some(w) = wake {
                    self.wake_task(w);
                }
            }
        }
        self.ipc.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        if delivered > 0 {
            Ok(delivered)
        } else {
            Err(KernelError::QueueFull)
        }
    }

    /// Spin-yield while parked: the timer keeps running, so virtual time
    /// advances while we let other threads of the harness in.
    fn relax(&self) {
        self.clock.advance(1);
        crate::cpu_relax();
    }

    // ---- statistics and invariants ----

    pub fn paging_stats(&self) -> PagingStats {
        self.mem.stats()
    }

    pub fn sched_stats(&self) -> SchedStats {
        self.sched.stats()
    }

    pub fn ipc_stats(&self) -> IpcStats {
        self.ipc.stats()
    }

    pub fn free_pages(&self) -> usize {
        self.mem.frames().free_pages_total()
    }

    /// Cross-subsystem invariant sweep, used by tests.
    pub fn verify_invariants(&self) -> bool {
        if !self.mem.frames().verify_buddy() || !self.mem.frames().verify_zone_accounting() {
            return false;
        }
        for cache in self.mem.caches() {
            if !cache.verify() {
                return false;
            }
        }
        for pid in self.table.pids() {
            let aspace = self.table.with(pid, |t| t.aspace.clone()).ok().flatten();
            if let Some(aspace) = aspace {
                if !aspace.verify() || !self.mem.verify_swap_ptes(&aspace) {
                    return false;
                }
            }
        }
        for queue in self.ipc.all_queues() {
            if !queue.verify() {
                return false;
            }
        }
        let running: Vec<Option<Pid>> = (0..self.sched.cpu_count())
            .map(|cpu| self.sched.current(cpu))
            .collect();
        self.table.verify_states(&running)
    }
}
