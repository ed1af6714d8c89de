//! I/O queue pair bookkeeping.
//!
//! The transport owns the actual submission/completion rings; this record
//! tracks what the engine needs: identity, priority, connection state and
//! the deferred-deletion flags used when a qpair is freed from inside its
//! own completion context.

/// Queue priority for weighted round robin arbitration.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QPrio {
    Urgent = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl QPrio {
    pub fn from_raw(raw: u8) -> Option<QPrio> {
        match raw {
            0 => Some(QPrio::Urgent),
            1 => Some(QPrio::High),
            2 => Some(QPrio::Medium),
            3 => Some(QPrio::Low),
            _ => None,
        }
    }
}

/// Queue pair connection state.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum QPairState {
    Disconnected,
    Connecting,
    Connected,
    Enabled,
    Disconnecting,
    Destroying,
}

impl QPairState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QPairState::Disconnected => "Disconnected",
            QPairState::Connecting => "Connecting",
            QPairState::Connected => "Connected",
            QPairState::Enabled => "Enabled",
            QPairState::Disconnecting => "Disconnecting",
            QPairState::Destroying => "Destroying",
        }
    }
}

/// Why a qpair stopped working.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum QPairFailureReason {
    None,
    /// Failed by the host side (reset, disconnect).
    Local,
    /// Failed by the controller.
    Remote,
    Unknown,
}

/// Engine-side view of an I/O queue pair. Owned by the process that
/// allocated it; the controller's active list refers to it by qid.
#[derive(Debug)]
pub struct IoQpair {
    pub id: u16,
    pub qprio: QPrio,
    pub state: QPairState,
    pub failure_reason: QPairFailureReason,
    pub async_mode: bool,
    pub in_completion_context: bool,
    pub delete_after_completion_context: bool,
    /// Poll group tag; set by the embedder, cleared on free.
    pub poll_group: Option<u32>,
    pub owner_pid: i32,
}

impl IoQpair {
    pub fn new(id: u16, qprio: QPrio, async_mode: bool, owner_pid: i32) -> Self {
        IoQpair {
            id,
            qprio,
            state: QPairState::Disconnected,
            failure_reason: QPairFailureReason::None,
            async_mode,
            in_completion_context: false,
            delete_after_completion_context: false,
            poll_group: None,
            owner_pid,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn qprio_range() {
        assert_eq!(QPrio::from_raw(0), Some(QPrio::Urgent));
        assert_eq!(QPrio::from_raw(3), Some(QPrio::Low));
        assert_eq!(QPrio::from_raw(4), None);
    }

    #[test]
    fn new_qpair_starts_disconnected() {
        let qpair = IoQpair::new(1, QPrio::Urgent, false, 42);
        assert_eq!(qpair.state, QPairState::Disconnected);
        assert_eq!(qpair.failure_reason, QPairFailureReason::None);
        assert!(!qpair.delete_after_completion_context);
    }
}
