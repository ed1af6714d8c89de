//! Per-process controller attachments.
//!
//! Several OS processes may attach the same controller. Each gets a handle
//! tracking its allocated qpairs, queued async events and callbacks. Handles
//! of processes that died unexpectedly are reaped before every access to
//! per-process state.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

use crate::{pages::Completion, qpair::IoQpair};

/// Invoked with each async event completion the process subscribed to.
pub type AerCallback = Box<dyn Fn(&Completion) + Send>;

/// Invoked when a tracked command exceeds its timeout. The qid is `None`
/// for admin commands.
pub type TimeoutCallback = Box<dyn Fn(Option<u16>, u16) + Send>;

pub struct ControllerProcess {
    pub pid: i32,
    pub is_primary: bool,
    /// Opaque transport device handle; PCIe only.
    pub devhandle: Option<u64>,
    /// Outstanding holds taken via `proc_get_ref`.
    pub ref_count: u32,
    /// I/O qpairs this process allocated. The controller's active list is a
    /// parallel, non-owning view.
    pub qpairs: Vec<IoQpair>,
    /// Async event completions waiting to be dispatched in this process.
    pub async_events: VecDeque<Completion>,
    pub aer_cb: Option<AerCallback>,
    pub timeout_cb: Option<TimeoutCallback>,
    pub timeout_io: Option<Duration>,
    pub timeout_admin: Option<Duration>,
}

impl fmt::Debug for ControllerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerProcess")
            .field("pid", &self.pid)
            .field("is_primary", &self.is_primary)
            .field("ref_count", &self.ref_count)
            .field("qpairs", &self.qpairs.len())
            .field("async_events", &self.async_events.len())
            .finish()
    }
}

impl ControllerProcess {
    pub fn new(pid: i32, is_primary: bool, devhandle: Option<u64>) -> Self {
        ControllerProcess {
            pid,
            is_primary,
            devhandle,
            ref_count: 0,
            qpairs: Vec::new(),
            async_events: VecDeque::new(),
            aer_cb: None,
            timeout_cb: None,
            timeout_io: None,
            timeout_admin: None,
        }
    }
}

/// Whether the process is still running: `kill(pid, 0)` only fails with
/// ESRCH once the pid is gone.
pub fn process_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Pid of the calling process.
pub fn current_pid() -> i32 {
    std::process::id() as i32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(current_pid()));
    }

    #[test]
    fn stale_pid_is_dead() {
        // Close to pid_max; practically never in use on a test box.
        assert!(!process_alive(0x3ffffe));
    }
}
