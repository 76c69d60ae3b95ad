// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Release fences.
//!
//! A fence is a sync-file descriptor which becomes readable once the display
//! consumer (or GPU) has finished reading a buffer. A fence without a
//! descriptor is already signaled.

use std::{
    fmt, io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

pub struct Fence {
    fd: Option<OwnedFd>,
}

impl Fence {
    /// A fence which requires no waiting.
    pub fn signaled() -> Self {
        Self { fd: None }
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    /// An unsignaled fence backed by an eventfd, together with the trigger
    /// that signals it. Stands in for a sync file where no display driver
    /// produces one.
    pub fn pending() -> io::Result<(Fence, FenceTrigger)> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let trigger = FenceTrigger { fd: fd.try_clone()? };
        Ok((Fence::from_fd(fd), trigger))
    }

    /// Non-blocking check of the fence state.
    pub fn is_signaled(&self) -> io::Result<bool> {
        match &self.fd {
            None => Ok(true),
            Some(fd) => poll_readable(fd, 0),
        }
    }

    /// Blocks until the fence signals. There is no timeout: the producer and
    /// consumer contract guarantees the fence eventually signals.
    pub fn wait(self) -> io::Result<()> {
        if let Some(fd) = &self.fd {
            while !poll_readable(fd, -1)? {}
        }
        Ok(())
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::signaled()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.fd {
            Some(fd) => write!(f, "Fence(fd:{})", fd.as_raw_fd()),
            None => write!(f, "Fence(signaled)"),
        }
    }
}

/// Signals the fence returned with it by [`Fence::pending`].
pub struct FenceTrigger {
    fd: OwnedFd,
}

impl FenceTrigger {
    pub fn signal(&self) -> io::Result<()> {
        let one: u64 = 1;
        let ret = unsafe { libc::write(self.fd.as_raw_fd(), (&one as *const u64).cast(), 8) };
        if ret != 8 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl fmt::Debug for FenceTrigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FenceTrigger(fd:{})", self.fd.as_raw_fd())
    }
}

fn poll_readable(fd: &OwnedFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(false);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(io::Error::other(format!(
                "fence fd {} poll revents {:#x}",
                pfd.fd, pfd.revents
            )));
        }
        return Ok(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn test_signaled() {
        let fence = Fence::signaled();
        assert!(fence.is_signaled().unwrap());
        fence.wait().unwrap();
    }

    #[test]
    fn test_pending_then_signaled() {
        let (fence, trigger) = Fence::pending().unwrap();
        assert!(!fence.is_signaled().unwrap());
        trigger.signal().unwrap();
        assert!(fence.is_signaled().unwrap());
        fence.wait().unwrap();
    }

    #[test]
    fn test_wait_blocks_until_signal() {
        let (fence, trigger) = Fence::pending().unwrap();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            trigger.signal().unwrap();
        });
        fence.wait().unwrap();
        t.join().unwrap();
    }
}
