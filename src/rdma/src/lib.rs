//! Bindings and thin wrappers over libibverbs and librdmacm.
//!
//! The wrappers keep the raw handles behind newtypes and surface every failure as
//! `std::io::Error`. Ordering between dependent resources (QP before CM id, CQ before
//! completion channel, memory regions before the protection domain) is left to the owner of
//! the handles; every handle has an explicit fallible `destroy`/`deregister` and a `Drop` that
//! falls back to the same call and only logs.

pub mod ffi {
    #![allow(non_upper_case_globals)]
    #![allow(non_camel_case_types)]
    #![allow(non_snake_case)]
    #![allow(dead_code)]
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
}

pub mod ibv;
pub mod mr;
pub mod rdmacm;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use nix::poll::{poll, PollFd, PollFlags};

/// Block until `fd` is readable or `deadline` passes.
///
/// Returns `Ok(false)` on expiry. A `None` deadline returns `Ok(true)` immediately and leaves the
/// blocking to the caller's subsequent read.
pub(crate) fn wait_readable(fd: RawFd, deadline: Option<Instant>) -> io::Result<bool> {
    let deadline = match deadline {
        Some(d) => d,
        None => return Ok(true),
    };
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        // round up so that a sub-millisecond remainder still sleeps once
        let timeout_ms = ((remaining.as_micros() + 999) / 1000).min(i32::MAX as u128) as i32;
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, timeout_ms) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}
