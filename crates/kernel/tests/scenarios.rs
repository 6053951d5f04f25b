//! End-to-end scenarios for the core: scheduling fairness, priority
//! preemption, COW after fork, request/reply deadlines, swap pressure
//! and waitpid semantics.

use nucleon_kernel::{
    msg_type, Backing, FaultError, Kernel, KernelConfig, MapFlags, Message, MessageFlags, Prot,
    SchedPolicy, TaskState, WNOHANG,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn kernel_with(config: KernelConfig) -> Kernel {
    init_logging();
    Kernel::init(config).expect("kernel init")
}

#[test]
fn round_robin_fairness() {
    let kernel = kernel_with(KernelConfig::compact(512, 0));
    let a = kernel.task_create("spin-a", 128).unwrap();
    let b = kernel.task_create("spin-b", 128).unwrap();
    let c = kernel.task_create("spin-c", 128).unwrap();

    for _ in 0..3000 {
        kernel.timer_tick(0);
    }

    for pid in [a, b, c] {
        let dispatches = kernel.with_task(pid, |t| t.dispatches).unwrap();
        assert!(
            (99..=101).contains(&dispatches),
            "task {} dispatched {} times, expected about 100",
            pid,
            dispatches
        );
    }
    assert!(kernel.verify_invariants());
    kernel.shutdown();
}

#[test]
fn priority_preemption_after_sleep() {
    let mut config = KernelConfig::compact(512, 0);
    config.sched_policy = SchedPolicy::Priority;
    let kernel = kernel_with(config);

    let a = kernel.task_create("urgent", 64).unwrap();
    let b = kernel.task_create("background", 128).unwrap();

    for _ in 0..30 {
        kernel.timer_tick(0);
    }
    assert_eq!(kernel.sched_current(0), Some(a));

    // A blocks; B gets the CPU
    kernel.sleep(0, 100).unwrap();
    assert_eq!(kernel.sched_current(0), Some(b));
    assert_eq!(kernel.task_state(a).unwrap(), TaskState::Blocked);

    // When A's deadline passes, the next tick preempts B back to A
    for _ in 0..110 {
        kernel.timer_tick(0);
    }
    assert_eq!(kernel.sched_current(0), Some(a));
    assert_eq!(kernel.task_state(b).unwrap(), TaskState::Ready);
    assert!(kernel.verify_invariants());
    kernel.shutdown();
}

#[test]
fn cow_after_fork() {
    let kernel = kernel_with(KernelConfig::compact(256, 16));
    let parent = kernel.task_create("parent", 128).unwrap();
    kernel
        .mmap(
            parent,
            0x40_0000,
            4096,
            Prot::READ | Prot::WRITE,
            MapFlags::FIXED,
            Backing::Anon,
        )
        .unwrap();
    kernel.write_user(parent, 0x40_0000, &[0xaa]).unwrap();

    let child = kernel.fork(parent).unwrap();

    let mut buf = [0u8; 1];
    kernel.read_user(child, 0x40_0000, &mut buf).unwrap();
    assert_eq!(buf[0], 0xaa);

    kernel.write_user(parent, 0x40_0000, &[0xbb]).unwrap();
    kernel.read_user(child, 0x40_0000, &mut buf).unwrap();
    assert_eq!(buf[0], 0xaa, "child must keep its pre-fork view");
    kernel.read_user(parent, 0x40_0000, &mut buf).unwrap();
    assert_eq!(buf[0], 0xbb);

    assert_eq!(kernel.paging_stats().cow_copies, 1);
    assert!(kernel.verify_invariants());
    kernel.shutdown();
}

#[test]
fn request_reply_timeout_and_rendezvous() {
    let kernel = kernel_with(KernelConfig::compact(512, 0));
    let client = kernel.task_create("client", 128).unwrap();
    let server = kernel.task_create("server", 128).unwrap();

    // No server response: the deadline fires
    let mut req = Message::new(msg_type::REQUEST, server);
    req.set_data(b"ping").unwrap();
    let mut reply = Message::new(msg_type::REPLY, client);
    let err = kernel
        .send_request(client, server, &req, &mut reply, 50)
        .unwrap_err();
    assert_eq!(err, nucleon_kernel::KernelError::Timeout);
    assert_eq!(kernel.ipc_stats().timeouts, 1);

    // Drain the dead request so the server starts clean
    let stale = kernel
        .receive_any(server, MessageFlags::NON_BLOCKING)
        .unwrap();
    assert_eq!(stale.mtype, msg_type::REQUEST);

    // A live server answers and the reply matches the request id
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let req = kernel
                .receive_any(server, MessageFlags::empty())
                .expect("server receive");
            let mut reply = Message::new(msg_type::REPLY, req.sender_pid);
            reply.reply_to = req.msg_id;
            reply.set_data(b"pong").unwrap();
            kernel
                .send_reply(server, req.sender_pid, reply)
                .expect("server reply");
        });

        let mut req = Message::new(msg_type::REQUEST, server);
        req.set_data(b"ping").unwrap();
        let mut reply = Message::new(msg_type::REPLY, client);
        kernel
            .send_request(client, server, &req, &mut reply, 30_000)
            .expect("client request");
        assert_eq!(reply.payload(), b"pong");
        assert_eq!(reply.mtype, msg_type::REPLY);
        assert_ne!(reply.reply_to, 0);
    });
    assert!(kernel.verify_invariants());
    kernel.shutdown();
}

#[test]
fn waitpid_reaps_both_children() {
    let kernel = kernel_with(KernelConfig::compact(512, 16));
    let parent = kernel.task_create("parent", 128).unwrap();
    let c1 = kernel.fork(parent).unwrap();
    let c2 = kernel.fork(parent).unwrap();

    // Nothing to reap yet
    assert_eq!(kernel.waitpid(parent, -1, WNOHANG).unwrap(), (0, 0));

    kernel.exit_task(c1, 7, 0).unwrap();
    kernel.exit_task(c2, 9, 0).unwrap();
    assert_eq!(kernel.task_state(c1).unwrap(), TaskState::Zombie);

    let (first, st1) = kernel.waitpid(parent, -1, 0).unwrap();
    let (second, st2) = kernel.waitpid(parent, -1, 0).unwrap();
    let mut reaped = vec![(first, st1 >> 8), (second, st2 >> 8)];
    reaped.sort_unstable();
    assert_eq!(reaped, vec![(c1, 7), (c2, 9)]);

    // Reaped children are gone for good
    assert!(kernel.waitpid(parent, c1 as i32, 0).is_err());
    assert!(kernel.task_state(c1).is_err());
    assert!(kernel.verify_invariants());
    kernel.shutdown();
}

#[test]
fn swap_round_trip_with_four_frames() {
    init_logging();
    // Four user frames (plus the page-table root) and one 16-page swap
    // file. Four dirty pages get written out under pressure; reading
    // them back is four major faults, evicting only clean pages.
    let mem = nucleon_kernel::mm::MemorySystem::new(&KernelConfig::compact(5, 16)).unwrap();
    let asp = mem.create_aspace().unwrap();
    mem.mmap(
        &asp,
        0x40_0000,
        8 * 4096,
        Prot::READ | Prot::WRITE,
        MapFlags::FIXED,
        Backing::Anon,
    )
    .unwrap();

    let mut now = 0;
    for i in 0..4u64 {
        now += 1;
        mem.write_user(&asp, 0x40_0000 + i * 4096, &[0x10 + i as u8], now)
            .unwrap();
    }
    for i in 4..8u64 {
        now += 1;
        let mut buf = [0u8; 1];
        mem.read_user(&asp, 0x40_0000 + i * 4096, &mut buf, now).unwrap();
        assert_eq!(buf[0], 0);
    }
    assert_eq!(mem.stats().swap_outs, 4);
    assert_eq!(mem.stats().major_faults, 0);

    for i in 0..4u64 {
        now += 1;
        let mut buf = [0u8; 1];
        mem.read_user(&asp, 0x40_0000 + i * 4096, &mut buf, now).unwrap();
        assert_eq!(buf[0], 0x10 + i as u8, "page {} lost its bytes", i);
    }

    let stats = mem.stats();
    assert_eq!(stats.major_faults, 4);
    assert_eq!(stats.swap_outs, 4);
    assert_eq!(stats.swap_ins, 4);
    assert_eq!(stats.minor_faults, 8);
    assert!(mem.verify_swap_ptes(&asp));
    assert!(mem.frames().verify_buddy());
    mem.release_aspace(&asp);
}

#[test]
fn segv_terminates_with_0x0b() {
    let kernel = kernel_with(KernelConfig::compact(256, 0));
    let parent = kernel.task_create("parent", 128).unwrap();
    let child = kernel.fork(parent).unwrap();

    let err = kernel
        .handle_page_fault(child, 0xdead_0000, FaultError::USER)
        .unwrap_err();
    assert_eq!(err, nucleon_kernel::KernelError::Segv);
    assert_eq!(kernel.task_state(child).unwrap(), TaskState::Zombie);

    let (reaped, status) = kernel.waitpid(parent, -1, 0).unwrap();
    assert_eq!(reaped, child);
    assert_eq!(status, 0x0b);
    kernel.shutdown();
}
