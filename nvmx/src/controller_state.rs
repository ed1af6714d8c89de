//! Controller initialization states and transition timeouts.

use std::time::{Duration, Instant};

/// States of the init/reset machine. Every submitting state has a paired
/// `WaitFor*` state; completions advance past it.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum NvmeControllerState {
    InitDelay,
    /// Entry state of a (re)initialization; connects the admin queue.
    ConnectAdminq,
    WaitForConnectAdminq,
    ReadVs,
    ReadVsWaitForVs,
    ReadCap,
    ReadCapWaitForCap,
    CheckEn,
    CheckEnWaitForCc,
    DisableWaitForReady1,
    DisableWaitForReady1WaitForCsts,
    SetEn0,
    SetEn0WaitForCc,
    DisableWaitForReady0,
    DisableWaitForReady0WaitForCsts,
    Enable,
    EnableWaitForCc,
    EnableWaitForReady1,
    EnableWaitForReady1WaitForCsts,
    ResetAdminQueue,
    Identify,
    WaitForIdentify,
    ConfigureAer,
    WaitForConfigureAer,
    SetKeepAliveTimeout,
    WaitForKeepAliveTimeout,
    IdentifyIocsSpecific,
    WaitForIdentifyIocsSpecific,
    GetZnsCmdEffectsLog,
    WaitForGetZnsCmdEffectsLog,
    SetNumQueues,
    WaitForSetNumQueues,
    IdentifyActiveNs,
    WaitForIdentifyActiveNs,
    IdentifyNs,
    WaitForIdentifyNs,
    IdentifyIdDescs,
    WaitForIdentifyIdDescs,
    IdentifyNsIocsSpecific,
    WaitForIdentifyNsIocsSpecific,
    SetSupportedLogPages,
    SetSupportedIntelLogPages,
    WaitForSupportedIntelLogPages,
    SetSupportedFeatures,
    SetDbBufCfg,
    WaitForDbBufCfg,
    SetHostId,
    WaitForHostId,
    Ready,
    Error,
}

impl NvmeControllerState {
    pub fn as_str(&self) -> &'static str {
        use NvmeControllerState::*;
        match self {
            InitDelay => "delay init",
            ConnectAdminq => "connect adminq",
            WaitForConnectAdminq => "wait for connect adminq",
            ReadVs => "read vs",
            ReadVsWaitForVs => "read vs wait for vs",
            ReadCap => "read cap",
            ReadCapWaitForCap => "read cap wait for cap",
            CheckEn => "check en",
            CheckEnWaitForCc => "check en wait for cc",
            DisableWaitForReady1 => "disable and wait for CSTS.RDY = 1",
            DisableWaitForReady1WaitForCsts => "disable and wait for CSTS.RDY = 1 reg",
            SetEn0 => "set CC.EN = 0",
            SetEn0WaitForCc => "set CC.EN = 0 wait for cc",
            DisableWaitForReady0 => "disable and wait for CSTS.RDY = 0",
            DisableWaitForReady0WaitForCsts => "disable and wait for CSTS.RDY = 0 reg",
            Enable => "enable controller by writing CC.EN = 1",
            EnableWaitForCc => "enable controller by writing CC.EN = 1 reg",
            EnableWaitForReady1 => "wait for CSTS.RDY = 1",
            EnableWaitForReady1WaitForCsts => "wait for CSTS.RDY = 1 reg",
            ResetAdminQueue => "reset admin queue",
            Identify => "identify controller",
            WaitForIdentify => "wait for identify controller",
            ConfigureAer => "configure AER",
            WaitForConfigureAer => "wait for configure aer",
            SetKeepAliveTimeout => "set keep alive timeout",
            WaitForKeepAliveTimeout => "wait for set keep alive timeout",
            IdentifyIocsSpecific => "identify controller iocs specific",
            WaitForIdentifyIocsSpecific => "wait for identify controller iocs specific",
            GetZnsCmdEffectsLog => "get zns cmd and effects log page",
            WaitForGetZnsCmdEffectsLog => "wait for get zns cmd and effects log page",
            SetNumQueues => "set number of queues",
            WaitForSetNumQueues => "wait for set number of queues",
            IdentifyActiveNs => "identify active ns",
            WaitForIdentifyActiveNs => "wait for identify active ns",
            IdentifyNs => "identify ns",
            WaitForIdentifyNs => "wait for identify ns",
            IdentifyIdDescs => "identify namespace id descriptors",
            WaitForIdentifyIdDescs => "wait for identify namespace id descriptors",
            IdentifyNsIocsSpecific => "identify ns iocs specific",
            WaitForIdentifyNsIocsSpecific => "wait for identify ns iocs specific",
            SetSupportedLogPages => "set supported log pages",
            SetSupportedIntelLogPages => "set supported INTEL log pages",
            WaitForSupportedIntelLogPages => "wait for supported INTEL log pages",
            SetSupportedFeatures => "set supported features",
            SetDbBufCfg => "set doorbell buffer config",
            WaitForDbBufCfg => "wait for doorbell buffer config",
            SetHostId => "set host ID",
            WaitForHostId => "wait for set host ID",
            Ready => "ready",
            Error => "error",
        }
    }
}

/// Timeout selector for a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTimeout {
    /// Disable the deadline check.
    Infinite,
    /// Leave the current deadline untouched (polling sub-states).
    KeepExisting,
    Ms(u64),
}

/// State plus deadline bookkeeping; the controller embeds one.
#[derive(Debug)]
pub struct StateMachine {
    name: String,
    current: NvmeControllerState,
    /// None == no deadline.
    deadline: Option<Instant>,
}

impl StateMachine {
    pub fn new(name: &str, initial: NvmeControllerState) -> Self {
        StateMachine {
            name: name.to_string(),
            current: initial,
            deadline: None,
        }
    }

    pub fn current_state(&self) -> NvmeControllerState {
        self.current
    }

    pub fn set_state(&mut self, state: NvmeControllerState, timeout: StateTimeout) {
        self.set_state_impl(state, timeout, false)
    }

    /// Transition without logging; used by high-frequency polling states.
    pub fn set_state_quiet(&mut self, state: NvmeControllerState, timeout: StateTimeout) {
        self.set_state_impl(state, timeout, true)
    }

    fn set_state_impl(&mut self, state: NvmeControllerState, timeout: StateTimeout, quiet: bool) {
        self.current = state;
        match timeout {
            StateTimeout::KeepExisting => {
                if !quiet {
                    debug!(
                        "{}: setting state to {} (keeping existing timeout)",
                        self.name,
                        state.as_str()
                    );
                }
            }
            StateTimeout::Infinite => {
                self.deadline = None;
                if !quiet {
                    debug!("{}: setting state to {} (no timeout)", self.name, state.as_str());
                }
            }
            StateTimeout::Ms(ms) => {
                self.deadline = Instant::now().checked_add(Duration::from_millis(ms));
                if self.deadline.is_none() {
                    warn!(
                        "{}: timeout of {} ms not representable, disabling the deadline",
                        self.name, ms
                    );
                }
                if !quiet {
                    debug!(
                        "{}: setting state to {} (timeout {} ms)",
                        self.name,
                        state.as_str(),
                        ms
                    );
                }
            }
        }
    }

    /// Whether the current state's deadline has passed.
    pub fn timed_out(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => now > deadline,
            None => false,
        }
    }

    /// Whether a finite deadline is armed at all.
    pub fn deadline_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keep_existing_preserves_deadline() {
        let mut sm = StateMachine::new("ctrlr", NvmeControllerState::ConnectAdminq);
        sm.set_state(NvmeControllerState::ReadVs, StateTimeout::Ms(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(sm.timed_out(Instant::now()));

        // Polling transition keeps the expired deadline in place.
        sm.set_state_quiet(
            NvmeControllerState::ReadVsWaitForVs,
            StateTimeout::KeepExisting,
        );
        assert!(sm.timed_out(Instant::now()));

        // A real transition rearms it.
        sm.set_state(NvmeControllerState::ReadCap, StateTimeout::Ms(60_000));
        assert!(!sm.timed_out(Instant::now()));
    }

    #[test]
    fn infinite_disables_deadline() {
        let mut sm = StateMachine::new("ctrlr", NvmeControllerState::ConnectAdminq);
        sm.set_state(NvmeControllerState::Error, StateTimeout::Infinite);
        assert!(!sm.timed_out(Instant::now()));
        assert_eq!(sm.current_state(), NvmeControllerState::Error);
    }

    #[test]
    fn state_strings_are_stable() {
        assert_eq!(NvmeControllerState::Ready.as_str(), "ready");
        assert_eq!(
            NvmeControllerState::EnableWaitForReady1.as_str(),
            "wait for CSTS.RDY = 1"
        );
    }
}
