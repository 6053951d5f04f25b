/// User/kernel copy helpers
///
/// Syscall arguments that point into user memory are copied through
/// here, bounded and fault-checked. A bad pointer surfaces as an error
/// to the caller instead of killing the process; only direct loads and
/// stores (see `Kernel::read_user`/`write_user`) are wild accesses.
/// Fixed-size message images are staged through a slab bounce buffer on
/// their way across the boundary.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::ipc::{Message, MESSAGE_WIRE_SIZE};
use crate::kernel::Kernel;
use crate::process::Pid;

/// Upper bound for a single copy, keeping runaway lengths in check.
pub const MAX_COPY: usize = 64 * 1024;

pub(crate) fn copy_from_user(kernel: &Kernel, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    if len > MAX_COPY {
        return Err(KernelError::Overflow);
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    let aspace = kernel.aspace_of(pid)?;
    let mut buf = vec![0u8; len];
    kernel
        .mem
        .read_user(&aspace, addr, &mut buf, kernel.clock.now_ticks())
        .map_err(|e| match e {
            KernelError::Segv => KernelError::Invalid,
            other => other,
        })?;
    Ok(buf)
}

pub(crate) fn copy_to_user(kernel: &Kernel, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
    if data.len() > MAX_COPY {
        return Err(KernelError::Overflow);
    }
    if data.is_empty() {
        return Ok(());
    }
    let aspace = kernel.aspace_of(pid)?;
    kernel
        .mem
        .write_user(&aspace, addr, data, kernel.clock.now_ticks())
        .map_err(|e| match e {
            KernelError::Segv => KernelError::Invalid,
            other => other,
        })
}

/// Copy a fixed-size message image in from user space, staging it in a
/// kernel bounce buffer before parsing.
pub(crate) fn copy_msg_from_user(kernel: &Kernel, pid: Pid, addr: u64) -> Result<Message> {
    let wire = copy_from_user(kernel, pid, addr, MESSAGE_WIRE_SIZE)?;
    let staged = kernel.bounce.alloc(0)?;
    kernel.mem.frames().write_phys(staged, &wire);
    let mut bytes = vec![0u8; MESSAGE_WIRE_SIZE];
    kernel.mem.frames().read_phys(staged, &mut bytes);
    kernel.bounce.free(0, staged)?;
    Message::from_wire(&bytes)
}

/// Serialize a message into a bounce buffer and copy it out.
pub(crate) fn copy_msg_to_user(
    kernel: &Kernel,
    pid: Pid,
    addr: u64,
    msg: &Message,
) -> Result<()> {
    let wire = msg.to_wire();
    let staged = kernel.bounce.alloc(0)?;
    kernel.mem.frames().write_phys(staged, &wire);
    let mut bytes = vec![0u8; MESSAGE_WIRE_SIZE];
    kernel.mem.frames().read_phys(staged, &mut bytes);
    kernel.bounce.free(0, staged)?;
    copy_to_user(kernel, pid, addr, &bytes)
}

/// Read a NUL-terminated name of at most `max` bytes.
pub(crate) fn copy_str_from_user(
    kernel: &Kernel,
    pid: Pid,
    addr: u64,
    max: usize,
) -> Result<alloc::string::String> {
    let raw = copy_from_user(kernel, pid, addr, max)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    core::str::from_utf8(&raw[..end])
        .map(alloc::string::String::from)
        .map_err(|_| KernelError::Invalid)
}
