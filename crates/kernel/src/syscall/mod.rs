/// System call dispatch
///
/// Routes the stable numeric ids to their handlers, copying bounded
/// structures across the user/kernel boundary and flattening every
/// internal error into the negative codes of the public ABI. Kernel
/// pointers never cross back out.

pub mod uaccess;

use crate::error::{KernelError, Result};
use crate::ipc::{Message, MessageFlags};
use crate::kernel::Kernel;
use crate::process::Pid;
use uaccess::{copy_from_user, copy_msg_from_user, copy_msg_to_user, copy_str_from_user};

/// Stable syscall numbers.
pub mod nr {
    pub const WRITE: u32 = 1;
    pub const GETPID: u32 = 39;
    pub const IPC_CREATE_QUEUE: u32 = 50;
    pub const IPC_DESTROY_QUEUE: u32 = 51;
    pub const IPC_SEND_MESSAGE: u32 = 52;
    pub const IPC_RECEIVE_MESSAGE: u32 = 53;
    pub const IPC_CREATE_CHANNEL: u32 = 54;
    pub const IPC_SUBSCRIBE_CHANNEL: u32 = 55;
    pub const IPC_SEND_TO_CHANNEL: u32 = 56;
    pub const IPC_SEND_REQUEST: u32 = 57;
    pub const IPC_SEND_REPLY: u32 = 58;
    pub const IPC_SEND_ASYNC: u32 = 59;
    pub const EXIT: u32 = 60;
    /// 60 collides with exit in the historical table; broadcast lives
    /// one up.
    pub const IPC_BROADCAST: u32 = 61;
}

const MAX_CHANNEL_NAME: usize = 64;
const MAX_BROADCAST_TARGETS: usize = 64;

/// Dispatch one system call for `pid`. Returns the raw value or a
/// negative error code.
pub fn dispatch(kernel: &Kernel, pid: Pid, number: u32, args: &[u64; 6]) -> i64 {
    let result = match number {
        nr::WRITE => sys_write(kernel, pid, args[0] as i32, args[1], args[2] as usize),
        nr::GETPID => Ok(pid as i64),
        nr::EXIT => kernel
            .exit_task(pid, args[0] as i32, 0)
            .map(|_| 0),
        nr::IPC_CREATE_QUEUE => {
            let perms = crate::ipc::QueuePerms::from_bits_truncate(args[1] as u32);
            Ok(kernel.create_queue(pid, args[0] as usize, perms) as i64)
        }
        nr::IPC_DESTROY_QUEUE => kernel.destroy_queue(pid, args[0] as u32).map(|_| 0),
        nr::IPC_SEND_MESSAGE => sys_send_message(kernel, pid, args[0] as u32, args[1], args[2]),
        nr::IPC_RECEIVE_MESSAGE => {
            sys_receive_message(kernel, pid, args[0] as u32, args[1], args[2])
        }
        nr::IPC_CREATE_CHANNEL => {
            sys_create_channel(kernel, pid, args[0], args[1] != 0, args[2] != 0)
        }
        nr::IPC_SUBSCRIBE_CHANNEL => {
            sys_subscribe_channel(kernel, args[0] as u32, args[1] as Pid)
        }
        nr::IPC_SEND_TO_CHANNEL => {
            sys_send_to_channel(kernel, pid, args[0] as u32, args[1])
        }
        nr::IPC_SEND_REQUEST => {
            sys_send_request(kernel, pid, args[0] as Pid, args[1], args[2], args[3])
        }
        nr::IPC_SEND_REPLY => sys_send_reply(kernel, pid, args[0] as Pid, args[1]),
        nr::IPC_SEND_ASYNC => sys_send_async(kernel, pid, args[0] as Pid, args[1]),
        nr::IPC_BROADCAST => {
            sys_broadcast(kernel, pid, args[0], args[1], args[2] as usize)
        }
        _ => {
            log::warn!("syscall: unimplemented number {}", number);
            Err(KernelError::Invalid)
        }
    };

    match result {
        Ok(value) => value,
        Err(e) => e.code(),
    }
}

fn sys_write(kernel: &Kernel, pid: Pid, fd: i32, buf: u64, len: usize) -> Result<i64> {
    let data = copy_from_user(kernel, pid, buf, len)?;
    let file = kernel.with_task(pid, |t| t.files.get(fd))??;
    Ok(file.write(&data) as i64)
}

fn sys_send_message(kernel: &Kernel, pid: Pid, qid: u32, msg_ptr: u64, flags: u64) -> Result<i64> {
    let msg = copy_msg_from_user(kernel, pid, msg_ptr)?;
    let flags = MessageFlags::from_bits_truncate(flags as u32);
    kernel.send_message(pid, qid, msg, flags)?;
    Ok(0)
}

fn sys_receive_message(
    kernel: &Kernel,
    pid: Pid,
    qid: u32,
    msg_ptr: u64,
    flags: u64,
) -> Result<i64> {
    let flags = MessageFlags::from_bits_truncate(flags as u32);
    let msg = kernel.receive_message(pid, qid, flags)?;
    copy_msg_to_user(kernel, pid, msg_ptr, &msg)?;
    Ok(0)
}

fn sys_create_channel(
    kernel: &Kernel,
    pid: Pid,
    name_ptr: u64,
    broadcast: bool,
    persistent: bool,
) -> Result<i64> {
    let name = copy_str_from_user(kernel, pid, name_ptr, MAX_CHANNEL_NAME)?;
    let cid = kernel.ipc.create_channel(&name, broadcast, persistent)?;
    Ok(cid as i64)
}

fn sys_subscribe_channel(kernel: &Kernel, cid: u32, pid: Pid) -> Result<i64> {
    if !kernel.table.exists(pid) {
        return Err(KernelError::NoSuchTask);
    }
    kernel.ipc.subscribe(cid, pid)?;
    Ok(0)
}

fn sys_send_to_channel(kernel: &Kernel, pid: Pid, cid: u32, msg_ptr: u64) -> Result<i64> {
    let msg = copy_msg_from_user(kernel, pid, msg_ptr)?;
    kernel.send_to_channel(pid, cid, msg)?;
    Ok(0)
}

fn sys_send_request(
    kernel: &Kernel,
    pid: Pid,
    target: Pid,
    req_ptr: u64,
    reply_ptr: u64,
    timeout_ms: u64,
) -> Result<i64> {
    let request = copy_msg_from_user(kernel, pid, req_ptr)?;
    let mut reply = Message::new(crate::ipc::msg_type::REPLY, pid);
    kernel.send_request(pid, target, &request, &mut reply, timeout_ms)?;
    copy_msg_to_user(kernel, pid, reply_ptr, &reply)?;
    Ok(0)
}

fn sys_send_reply(kernel: &Kernel, pid: Pid, target: Pid, reply_ptr: u64) -> Result<i64> {
    let reply = copy_msg_from_user(kernel, pid, reply_ptr)?;
    kernel.send_reply(pid, target, reply)?;
    Ok(0)
}

fn sys_send_async(kernel: &Kernel, pid: Pid, target: Pid, msg_ptr: u64) -> Result<i64> {
    let msg = copy_msg_from_user(kernel, pid, msg_ptr)?;
    kernel.send_async(pid, target, msg)?;
    Ok(0)
}

fn sys_broadcast(
    kernel: &Kernel,
    pid: Pid,
    msg_ptr: u64,
    pids_ptr: u64,
    count: usize,
) -> Result<i64> {
    if count == 0 || count > MAX_BROADCAST_TARGETS {
        return Err(KernelError::Invalid);
    }
    let msg = copy_msg_from_user(kernel, pid, msg_ptr)?;
    let raw = copy_from_user(kernel, pid, pids_ptr, count * 4)?;
    let targets: alloc::vec::Vec<Pid> = raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let delivered = kernel.broadcast(pid, &msg, &targets)?;
    Ok(delivered as i64)
}
