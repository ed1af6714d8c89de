//! NVMe controller object: lifecycle, qpair management, reset and
//! multi-process bookkeeping.
//!
//! The controller is cooperatively single-threaded: all progress happens in
//! the caller-invoked pumps (`process_init`, `process_admin_completions`).
//! Embedders that share a controller across threads wrap it the usual way,
//! in an `Arc<Mutex<_>>`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ops::BitOr;
use std::time::{Duration, Instant};

use bit_vec::BitVec;
use crossbeam::atomic::AtomicCell;
use nix::errno::Errno;

use crate::{
    controller_state::{NvmeControllerState, StateMachine, StateTimeout},
    error::NvmeError,
    namespace::NvmeNamespace,
    opts::{
        IoQpairOpts, NvmeControllerOpts, CQ_ENTRY_SIZE, MAX_ADMIN_QUEUE_ENTRIES,
        MIN_ADMIN_QUEUE_ENTRIES, SQ_ENTRY_SIZE,
    },
    pages::{Completion, IdentifyControllerData, ZnsCtrlrData},
    process::{current_pid, process_alive, AerCallback, ControllerProcess, TimeoutCallback},
    qpair::{IoQpair, QPairFailureReason, QPairState, QPrio},
    quirks::{quirks_for, PciId, Quirks},
    registers::{offsets, Bpinfo, Cap, Cc, Cmbsz, Csts, Pmrcap, Vs, NSSR_VALUE},
    transport::{
        AdminCommand, AdminToken, DmaBuffer, NvmeTransport, Payload, RegisterCookie, TransportEvent,
        TransportId,
    },
};

/// Upper bound on outstanding asynchronous event requests.
pub const MAX_ASYNC_EVENTS: u32 = 8;

/// Capability flags derived during identification.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CtrlrFlags(pub u64);

impl CtrlrFlags {
    pub const NONE: CtrlrFlags = CtrlrFlags(0);
    pub const SGL_SUPPORTED: CtrlrFlags = CtrlrFlags(1 << 0);
    pub const SGL_REQUIRES_DWORD_ALIGNMENT: CtrlrFlags = CtrlrFlags(1 << 1);
    pub const WRR_SUPPORTED: CtrlrFlags = CtrlrFlags(1 << 2);
    pub const COMPARE_AND_WRITE_SUPPORTED: CtrlrFlags = CtrlrFlags(1 << 3);
    pub const SECURITY_SEND_RECV_SUPPORTED: CtrlrFlags = CtrlrFlags(1 << 4);
    pub const DIRECTIVES_SUPPORTED: CtrlrFlags = CtrlrFlags(1 << 5);
    pub const ZONE_APPEND_SUPPORTED: CtrlrFlags = CtrlrFlags(1 << 6);

    pub fn contains(&self, other: CtrlrFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CtrlrFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for CtrlrFlags {
    type Output = CtrlrFlags;

    fn bitor(self, rhs: CtrlrFlags) -> CtrlrFlags {
        CtrlrFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for CtrlrFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CtrlrFlags(0x{:x})", self.0)
    }
}

/// Where an admin completion is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdminSink {
    /// An init-machine step; the waiting state identifies the command.
    Init,
    /// One page of the active namespace scan.
    ActiveNs,
    /// Asynchronous event request occupying the given slot.
    Aer(usize),
    KeepAlive,
    Abort,
    /// A synchronous helper polls for the result.
    Poll,
    BootPartitionWrite,
}

#[derive(Debug)]
pub(crate) struct AdminInflight {
    pub sink: AdminSink,
    pub submitted: Instant,
    pub timeout_reported: bool,
    pub cid: u16,
}

/// Paged active-namespace scan in progress.
#[derive(Debug)]
pub(crate) struct ActiveNsCtx {
    pub page_count: u32,
    pub next_nsid: u32,
    pub new_ns_list: Vec<u32>,
}

/// Shutdown progress carried between `destruct_poll_async` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DetachState {
    SetCc,
    CheckCsts,
    GetCsts,
    GetCstsDone,
}

#[derive(Debug)]
pub(crate) struct DetachCtx {
    pub state: DetachState,
    pub shutdown_timeout: Duration,
    pub shutdown_start: Instant,
    pub csts: Csts,
    pub shutdown_complete: bool,
}

/// Boot partition write progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BpWriteState {
    Idle,
    Downloading,
    Downloaded,
    Replace,
    Activate,
}

pub struct NvmeController {
    pub(crate) name: String,
    pub(crate) trid: TransportId,
    pub(crate) transport: Box<dyn NvmeTransport + Send>,
    pub(crate) opts: NvmeControllerOpts,
    pub(crate) sm: StateMachine,
    /// Register access blackout; the pump returns early until it passes.
    pub(crate) sleep_deadline: Option<Instant>,

    pub(crate) cap: Cap,
    pub(crate) vs: Vs,
    pub(crate) process_init_cc: Cc,
    pub(crate) page_size: u32,
    pub(crate) min_page_size: u32,

    pub(crate) quirks: Quirks,
    pub(crate) flags: CtrlrFlags,

    pub(crate) cdata: IdentifyControllerData,
    pub(crate) cdata_zns: Option<Box<ZnsCtrlrData>>,
    pub(crate) max_xfer_size: u32,
    pub(crate) max_sges: u16,
    pub(crate) max_zone_append_size: u32,
    pub(crate) cntlid: u16,
    pub(crate) ioccsz_bytes: u32,
    pub(crate) icdoff: u16,

    pub(crate) ns: BTreeMap<u32, NvmeNamespace>,
    pub(crate) active_ns_count: u32,

    /// Authority for qid allocation; exists only while READY.
    pub(crate) free_io_qids: Option<BitVec>,
    /// Enumeration view; must stay consistent with the bitset.
    pub(crate) active_io_qpairs: Vec<u16>,

    pub(crate) adminq_state: QPairState,
    pub(crate) adminq_failure_reason: QPairFailureReason,

    pub(crate) procs: Vec<ControllerProcess>,

    pub(crate) num_aers: u32,
    pub(crate) aer_slots: Vec<Option<AdminToken>>,

    pub(crate) outstanding_aborts: u32,
    pub(crate) queued_aborts: VecDeque<AdminCommand>,

    pub(crate) ana_log_page: Vec<u8>,

    pub(crate) log_page_supported: [bool; 256],
    pub(crate) feature_supported: [bool; 256],

    pub(crate) shadow_doorbell: Option<DmaBuffer>,
    pub(crate) eventidx: Option<DmaBuffer>,

    pub(crate) keep_alive_interval: Option<Duration>,
    pub(crate) next_keep_alive: Instant,

    is_failed: AtomicCell<bool>,
    is_removed: AtomicCell<bool>,
    is_resetting: AtomicCell<bool>,
    is_destructed: AtomicCell<bool>,
    prepare_for_reset: AtomicCell<bool>,
    pub(crate) timeout_enabled: bool,

    pub(crate) inflight: HashMap<u64, AdminInflight>,
    next_token: u64,
    pub(crate) poll_results: HashMap<u64, (Completion, Option<DmaBuffer>)>,

    pub(crate) active_ns_ctx: Option<ActiveNsCtx>,
    /// Namespace currently walked by a per-ns identify chain.
    pub(crate) init_ns_cursor: u32,

    pub(crate) detach_ctx: Option<DetachCtx>,

    pub(crate) bp_ws: BpWriteState,
    pub(crate) bpid: u8,
    pub(crate) fw_offset: u32,
    pub(crate) fw_size_remaining: u32,
    pub(crate) fw_transfer_size: u32,
    pub(crate) fw_payload: Vec<u8>,
}

impl fmt::Debug for NvmeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeController")
            .field("name", &self.name)
            .field("state", &self.sm.current_state())
            .field("active_ns_count", &self.active_ns_count)
            .field("is_failed", &self.is_failed.load())
            .field("is_resetting", &self.is_resetting.load())
            .finish()
    }
}

impl NvmeController {
    /// Creates a controller driving the device behind `transport`.
    /// Call `process_init` repeatedly afterwards until it reaches ready.
    pub fn new(
        trid: TransportId,
        transport: Box<dyn NvmeTransport + Send>,
        mut opts: NvmeControllerOpts,
    ) -> Self {
        let name = trid.printable().to_string();

        let initial = if trid.is_fabrics() {
            NvmeControllerState::ConnectAdminq
        } else {
            NvmeControllerState::InitDelay
        };

        if opts.admin_queue_size > MAX_ADMIN_QUEUE_ENTRIES {
            error!(
                "{}: admin_queue_size {} exceeds max defined by NVMe spec, use max value",
                name, opts.admin_queue_size
            );
            opts.admin_queue_size = MAX_ADMIN_QUEUE_ENTRIES;
        }
        if opts.admin_queue_size < MIN_ADMIN_QUEUE_ENTRIES {
            error!(
                "{}: admin_queue_size {} is less than minimum defined by NVMe spec, use min value",
                name, opts.admin_queue_size
            );
            opts.admin_queue_size = MIN_ADMIN_QUEUE_ENTRIES;
        }

        let ctrlr = NvmeController {
            sm: StateMachine::new(&name, initial),
            name,
            trid,
            transport,
            opts,
            sleep_deadline: None,
            cap: Cap::default(),
            vs: Vs::default(),
            process_init_cc: Cc::default(),
            page_size: 0,
            min_page_size: 0,
            quirks: Quirks::NONE,
            flags: CtrlrFlags::NONE,
            cdata: IdentifyControllerData::default(),
            cdata_zns: None,
            max_xfer_size: 0,
            max_sges: 0,
            max_zone_append_size: 0,
            cntlid: 0,
            ioccsz_bytes: 0,
            icdoff: 0,
            ns: BTreeMap::new(),
            active_ns_count: 0,
            free_io_qids: None,
            active_io_qpairs: Vec::new(),
            adminq_state: QPairState::Disconnected,
            adminq_failure_reason: QPairFailureReason::None,
            procs: Vec::new(),
            num_aers: 0,
            aer_slots: Vec::new(),
            outstanding_aborts: 0,
            queued_aborts: VecDeque::new(),
            ana_log_page: Vec::new(),
            log_page_supported: [false; 256],
            feature_supported: [false; 256],
            shadow_doorbell: None,
            eventidx: None,
            keep_alive_interval: None,
            next_keep_alive: Instant::now(),
            is_failed: AtomicCell::new(false),
            is_removed: AtomicCell::new(false),
            is_resetting: AtomicCell::new(false),
            is_destructed: AtomicCell::new(false),
            prepare_for_reset: AtomicCell::new(false),
            timeout_enabled: false,
            inflight: HashMap::new(),
            next_token: 1,
            poll_results: HashMap::new(),
            active_ns_ctx: None,
            init_ns_cursor: 0,
            detach_ctx: None,
            bp_ws: BpWriteState::Idle,
            bpid: 0,
            fw_offset: 0,
            fw_size_remaining: 0,
            fw_transfer_size: 0,
            fw_payload: Vec::new(),
        };

        debug!("{}: new NVMe controller created", ctrlr.name);
        ctrlr
    }

    /// Resolves device workarounds from the PCI identity. PCIe attach paths
    /// call this before the first `process_init`.
    pub fn set_pci_id(&mut self, id: PciId) {
        self.quirks = quirks_for(&id);
        if !self.quirks.is_empty() {
            info!("{}: applying quirks {:?}", self.name, self.quirks);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NvmeControllerState {
        self.sm.current_state()
    }

    pub fn transport_id(&self) -> &TransportId {
        &self.trid
    }

    pub fn opts(&self) -> &NvmeControllerOpts {
        &self.opts
    }

    pub fn cdata(&self) -> &IdentifyControllerData {
        &self.cdata
    }

    pub fn flags(&self) -> CtrlrFlags {
        self.flags
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    pub fn max_xfer_size(&self) -> u32 {
        self.max_xfer_size
    }

    pub fn max_sges(&self) -> u16 {
        self.max_sges
    }

    pub fn max_zone_append_size(&self) -> u32 {
        self.max_zone_append_size
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_failed(&self) -> bool {
        self.is_failed.load()
    }

    pub fn is_removed(&self) -> bool {
        self.is_removed.load()
    }

    pub fn is_resetting(&self) -> bool {
        self.is_resetting.load()
    }

    pub(crate) fn is_destructed(&self) -> bool {
        self.is_destructed.load()
    }

    pub(crate) fn set_failed(&self, failed: bool) {
        self.is_failed.store(failed);
    }

    pub(crate) fn set_removed(&self) {
        self.is_removed.store(true);
    }

    pub(crate) fn set_resetting(&self, resetting: bool) {
        self.is_resetting.store(resetting);
    }

    pub(crate) fn set_destructed(&self) {
        self.is_destructed.store(true);
    }

    pub fn is_fabrics(&self) -> bool {
        self.trid.is_fabrics()
    }

    pub fn is_discovery(&self) -> bool {
        self.trid.is_discovery()
    }

    pub fn is_log_page_supported(&self, log_page: u8) -> bool {
        self.log_page_supported[log_page as usize]
    }

    pub fn is_feature_supported(&self, feature: u8) -> bool {
        self.feature_supported[feature as usize]
    }

    pub fn admin_qp_failure_reason(&self) -> QPairFailureReason {
        self.adminq_failure_reason
    }

    /// Current size of the ANA log buffer.
    pub fn ana_log_page_len(&self) -> usize {
        self.ana_log_page.len()
    }

    /// Async events queued for a given process and not yet dispatched.
    pub fn queued_async_event_count_for(&self, pid: i32) -> usize {
        self.procs
            .iter()
            .find(|p| p.pid == pid)
            .map_or(0, |p| p.async_events.len())
    }

    /// Abort commands waiting for an outstanding-abort slot.
    pub fn queued_abort_count(&self) -> usize {
        self.queued_aborts.len()
    }

    /// Marks an intent to reset so the transport can quiesce early.
    pub fn prepare_for_reset(&mut self) {
        self.prepare_for_reset.store(true);
    }

    // -- register snapshots ------------------------------------------------

    pub fn get_regs_cap(&self) -> Cap {
        self.cap
    }

    pub fn get_regs_vs(&self) -> Vs {
        self.vs
    }

    pub fn get_regs_csts(&mut self) -> Result<Csts, NvmeError> {
        self.transport
            .get_reg4(offsets::CSTS)
            .map(Csts)
            .map_err(|source| NvmeError::RegisterAccess { source })
    }

    pub fn get_regs_cc(&mut self) -> Result<Cc, NvmeError> {
        self.transport
            .get_reg4(offsets::CC)
            .map(Cc)
            .map_err(|source| NvmeError::RegisterAccess { source })
    }

    pub fn get_regs_cmbsz(&mut self) -> Cmbsz {
        self.transport
            .get_reg4(offsets::CMBSZ)
            .map(Cmbsz)
            .unwrap_or_default()
    }

    pub fn get_regs_pmrcap(&mut self) -> Pmrcap {
        self.transport
            .get_reg4(offsets::PMRCAP)
            .map(Pmrcap)
            .unwrap_or_default()
    }

    pub fn get_regs_bpinfo(&mut self) -> Result<Bpinfo, NvmeError> {
        self.transport
            .get_reg4(offsets::BPINFO)
            .map(Bpinfo)
            .map_err(|source| NvmeError::RegisterAccess { source })
    }

    // -- namespaces --------------------------------------------------------

    pub fn num_ns(&self) -> u32 {
        self.cdata.nn
    }

    pub fn active_ns_count(&self) -> u32 {
        self.active_ns_count
    }

    /// Looks up a namespace, constructing the object on first use.
    /// Returns None for ids outside `[1, cdata.nn]`.
    pub fn get_ns(&mut self, nsid: u32) -> Option<&mut NvmeNamespace> {
        if nsid < 1 || nsid > self.cdata.nn {
            return None;
        }

        let name = self.name.clone();
        Some(self.ns.entry(nsid).or_insert_with(|| {
            debug!("{}: Namespace {} was added", name, nsid);
            NvmeNamespace::new(nsid)
        }))
    }

    pub fn ns(&self, nsid: u32) -> Option<&NvmeNamespace> {
        self.ns.get(&nsid)
    }

    pub fn is_active_ns(&self, nsid: u32) -> bool {
        self.ns.get(&nsid).map_or(false, |ns| ns.is_active())
    }

    pub fn first_active_ns(&self) -> u32 {
        self.ns
            .values()
            .find(|ns| ns.is_active())
            .map_or(0, |ns| ns.id())
    }

    pub fn next_active_ns(&self, prev_nsid: u32) -> u32 {
        use std::ops::Bound::{Excluded, Unbounded};
        self.ns
            .range((Excluded(prev_nsid), Unbounded))
            .map(|(_, ns)| ns)
            .find(|ns| ns.is_active())
            .map_or(0, |ns| ns.id())
    }

    // -- process table -----------------------------------------------------

    /// Attaches the calling process to the controller. Idempotent.
    pub fn add_process(&mut self, devhandle: Option<u64>) -> Result<(), NvmeError> {
        self.add_process_for(current_pid(), devhandle)
    }

    /// Attaches an explicit pid; the first process to attach is primary.
    pub fn add_process_for(&mut self, pid: i32, devhandle: Option<u64>) -> Result<(), NvmeError> {
        if self.procs.iter().any(|p| p.pid == pid) {
            return Ok(());
        }

        let is_primary = self.procs.is_empty();
        self.procs
            .push(ControllerProcess::new(pid, is_primary, devhandle));
        debug!("{}: process {} attached (primary={})", self.name, pid, is_primary);
        Ok(())
    }

    pub(crate) fn get_process_mut(&mut self, pid: i32) -> Option<&mut ControllerProcess> {
        self.procs.iter_mut().find(|p| p.pid == pid)
    }

    pub(crate) fn current_process_mut(&mut self) -> Option<&mut ControllerProcess> {
        self.get_process_mut(current_pid())
    }

    /// Reaps handles of processes that terminated unexpectedly, returning
    /// the number of live processes left.
    pub(crate) fn remove_inactive_procs(&mut self) -> usize {
        let name = self.name.clone();
        let mut dead: Vec<i32> = Vec::new();

        for proc in &self.procs {
            if !process_alive(proc.pid) {
                error!("{}: process {} terminated unexpected", name, proc.pid);
                dead.push(proc.pid);
            }
        }

        for pid in dead {
            self.cleanup_process(pid);
        }

        self.procs.len()
    }

    /// Frees everything a dead process left behind: queued events, qpairs,
    /// and the handle itself. The process may have died inside a completion
    /// context, so deferred-deletion flags are ignored here.
    fn cleanup_process(&mut self, pid: i32) {
        let idx = match self.procs.iter().position(|p| p.pid == pid) {
            Some(idx) => idx,
            None => return,
        };

        let proc = self.procs.remove(idx);

        for qpair in &proc.qpairs {
            let qid = qpair.id;
            self.transport.disconnect_qpair(qid);
            self.active_io_qpairs.retain(|id| *id != qid);
            self.free_qid(qid);
            self.transport.delete_io_qpair(qid);
        }
    }

    /// Detaches a process handle; frees its qpairs first.
    pub(crate) fn remove_process(&mut self, pid: i32) {
        let qids: Vec<u16> = self
            .get_process_mut(pid)
            .map(|p| p.qpairs.iter().map(|q| q.id).collect())
            .unwrap_or_default();

        for qid in qids {
            if let Err(e) = self.free_io_qpair(qid) {
                warn!("{}: failed to free qpair {} of process {}: {}", self.name, qid, pid, e);
            }
        }

        if let Some(idx) = self.procs.iter().position(|p| p.pid == pid) {
            let proc = self.procs.remove(idx);
            if self.trid.trtype == crate::transport::TransportType::Pcie {
                if let Some(handle) = proc.devhandle {
                    debug!("{}: releasing device handle 0x{:x} of process {}", self.name, handle, pid);
                }
            }
        }
    }

    /// Takes a hold on the current process's attachment.
    pub fn proc_get_ref(&mut self) {
        self.remove_inactive_procs();
        if let Some(proc) = self.current_process_mut() {
            proc.ref_count += 1;
        }
    }

    /// Drops a hold. A process whose last hold is released is removed,
    /// unless it is the only process left; the final process is removed
    /// during controller destruction.
    pub fn proc_put_ref(&mut self) {
        let proc_count = self.remove_inactive_procs();

        let pid = current_pid();
        let remove = match self.get_process_mut(pid) {
            Some(proc) => {
                assert!(proc.ref_count > 0, "unbalanced process reference");
                proc.ref_count -= 1;
                proc.ref_count == 0 && proc_count != 1
            }
            None => false,
        };

        if remove {
            self.remove_process(pid);
        }
    }

    /// Sum of holds across all live processes.
    pub fn get_ref_count(&mut self) -> u32 {
        self.remove_inactive_procs();
        self.procs.iter().map(|p| p.ref_count).sum()
    }

    pub fn process_count(&self) -> usize {
        self.procs.len()
    }

    /// Device handle of the calling process, if it attached with one.
    pub fn proc_get_devhandle(&mut self) -> Option<u64> {
        self.current_process_mut().and_then(|p| p.devhandle)
    }

    /// Installs the async event callback for the calling process.
    pub fn register_aer_callback(&mut self, cb: Option<AerCallback>) {
        if let Some(proc) = self.current_process_mut() {
            proc.aer_cb = cb;
        }
    }

    /// Installs the command timeout callback for the calling process.
    pub fn register_timeout_callback(
        &mut self,
        timeout_io_us: u64,
        timeout_admin_us: u64,
        cb: TimeoutCallback,
    ) {
        if let Some(proc) = self.current_process_mut() {
            proc.timeout_io = Some(Duration::from_micros(timeout_io_us));
            proc.timeout_admin = Some(Duration::from_micros(timeout_admin_us));
            proc.timeout_cb = Some(cb);
        }
        self.timeout_enabled = true;
    }

    // -- qid bitset --------------------------------------------------------

    /// Allocates the lowest free qid. The free-qid bitset only exists while
    /// the controller is ready.
    pub(crate) fn alloc_qid(&mut self) -> Result<u16, NvmeError> {
        let num_io_queues = self.opts.num_io_queues;
        let name = self.name.clone();
        let bits = self.free_io_qids.as_mut().expect("free qid bitset not built");

        match bits
            .iter()
            .enumerate()
            .skip(1)
            .take(num_io_queues as usize)
            .find(|(_, free)| *free)
        {
            Some((qid, _)) => {
                bits.set(qid, false);
                Ok(qid as u16)
            }
            None => {
                error!("{}: No free I/O queue IDs", name);
                Err(NvmeError::NoFreeQid)
            }
        }
    }

    pub(crate) fn free_qid(&mut self, qid: u16) {
        if let Some(bits) = self.free_io_qids.as_mut() {
            bits.set(qid as usize, true);
        }
    }

    // -- I/O qpair lifecycle ----------------------------------------------

    /// Allocates an I/O qpair and, unless `create_only` is set, connects it
    /// synchronously. Returns the qid; all qpair operations take it.
    pub fn alloc_io_qpair(&mut self, user_opts: Option<IoQpairOpts>) -> Result<u16, NvmeError> {
        if self.sm.current_state() != NvmeControllerState::Ready {
            // While resetting or initializing the free-qid bitset is gone or
            // not built yet.
            return Err(NvmeError::InvalidState {
                state: self.sm.current_state().as_str(),
            });
        }

        let opts = user_opts.unwrap_or_else(|| IoQpairOpts::default_for(&self.opts));

        let qprio = QPrio::from_raw(opts.qprio).ok_or(NvmeError::InvalidQprio {
            qprio: opts.qprio,
        })?;

        // Only the urgent class is valid for default round robin arbitration.
        if self.process_init_cc.ams() == crate::registers::ArbMechanism::RoundRobin as u8
            && qprio != QPrio::Urgent
        {
            error!(
                "{}: invalid queue priority for default round robin arbitration method",
                self.name
            );
            return Err(NvmeError::InvalidQprio { qprio: opts.qprio });
        }

        if opts.sq.vaddr != 0 && opts.sq.buffer_size < opts.io_queue_size as u64 * SQ_ENTRY_SIZE {
            error!(
                "{}: sq buffer size 0x{:x} is too small for sq size {}",
                self.name, opts.sq.buffer_size, opts.io_queue_size
            );
            return Err(NvmeError::InvalidParam {
                source: Errno::EINVAL,
            });
        }
        if opts.cq.vaddr != 0 && opts.cq.buffer_size < opts.io_queue_size as u64 * CQ_ENTRY_SIZE {
            error!(
                "{}: cq buffer size 0x{:x} is too small for cq size {}",
                self.name, opts.cq.buffer_size, opts.io_queue_size
            );
            return Err(NvmeError::InvalidParam {
                source: Errno::EINVAL,
            });
        }

        let qid = self.alloc_qid()?;

        if let Err(source) = self.transport.create_io_qpair(qid, &opts) {
            error!("{}: transport failed to create I/O qpair: {}", self.name, source);
            self.free_qid(qid);
            return Err(NvmeError::QpairAlloc { source });
        }

        self.active_io_qpairs.push(qid);

        // The qpair object belongs to the creating process.
        let pid = current_pid();
        if self.get_process_mut(pid).is_none() {
            self.add_process_for(pid, None).ok();
        }
        let qpair = IoQpair::new(qid, qprio, opts.async_mode, pid);
        self.get_process_mut(pid)
            .expect("process handle just added")
            .qpairs
            .push(qpair);

        if self.quirks.contains(Quirks::DELAY_AFTER_QUEUE_ALLOC) {
            std::thread::sleep(Duration::from_micros(100));
        }

        if opts.create_only {
            return Ok(qid);
        }

        if let Err(e) = self.connect_io_qpair(qid) {
            error!("{}: transport failed to connect I/O qpair: {}", self.name, e);
            self.unwind_io_qpair(qid);
            return Err(e);
        }

        Ok(qid)
    }

    /// Removes all traces of a qpair whose connect failed.
    fn unwind_io_qpair(&mut self, qid: u16) {
        for proc in self.procs.iter_mut() {
            proc.qpairs.retain(|q| q.id != qid);
        }
        self.active_io_qpairs.retain(|id| *id != qid);
        self.free_qid(qid);
        self.transport.delete_io_qpair(qid);
    }

    pub(crate) fn find_qpair_mut(&mut self, qid: u16) -> Option<&mut IoQpair> {
        self.procs
            .iter_mut()
            .flat_map(|p| p.qpairs.iter_mut())
            .find(|q| q.id == qid)
    }

    pub(crate) fn find_qpair(&self, qid: u16) -> Option<&IoQpair> {
        self.procs
            .iter()
            .flat_map(|p| p.qpairs.iter())
            .find(|q| q.id == qid)
    }

    pub fn io_qpair_state(&self, qid: u16) -> Option<QPairState> {
        self.find_qpair(qid).map(|q| q.state)
    }

    pub fn io_qpair_failure_reason(&self, qid: u16) -> Option<QPairFailureReason> {
        self.find_qpair(qid).map(|q| q.failure_reason)
    }

    pub fn active_io_qpair_count(&self) -> usize {
        self.active_io_qpairs.len()
    }

    /// Flags a qpair as running inside its own completion callback. Clearing
    /// the flag performs any deletion deferred while it was set.
    pub fn mark_qpair_completion_context(
        &mut self,
        qid: u16,
        in_context: bool,
    ) -> Result<(), NvmeError> {
        let deferred = {
            let qpair = self
                .find_qpair_mut(qid)
                .ok_or(NvmeError::UnknownQpair { qid })?;
            qpair.in_completion_context = in_context;
            !in_context && qpair.delete_after_completion_context
        };

        if deferred {
            self.free_io_qpair(qid)?;
        }
        Ok(())
    }

    /// Tags a qpair as member of a poll group.
    pub fn set_io_qpair_poll_group(&mut self, qid: u16, group: Option<u32>) -> Result<(), NvmeError> {
        let qpair = self
            .find_qpair_mut(qid)
            .ok_or(NvmeError::UnknownQpair { qid })?;
        qpair.poll_group = group;
        Ok(())
    }

    /// Connects a previously created qpair.
    pub fn connect_io_qpair(&mut self, qid: u16) -> Result<(), NvmeError> {
        let state = self
            .io_qpair_state(qid)
            .ok_or(NvmeError::UnknownQpair { qid })?;

        if state != QPairState::Disconnected {
            return Err(NvmeError::QpairConnect {
                source: Errno::EISCONN,
            });
        }

        let rc = self.transport.connect_qpair(qid);

        if self.quirks.contains(Quirks::DELAY_AFTER_QUEUE_ALLOC) {
            std::thread::sleep(Duration::from_micros(100));
        }

        match rc {
            Ok(()) => {
                let qpair = self.find_qpair_mut(qid).expect("qpair checked above");
                qpair.state = QPairState::Connected;
                qpair.failure_reason = QPairFailureReason::None;
                Ok(())
            }
            Err(source) => Err(NvmeError::QpairConnect { source }),
        }
    }

    pub fn disconnect_io_qpair(&mut self, qid: u16) {
        self.transport.disconnect_qpair(qid);
        if let Some(qpair) = self.find_qpair_mut(qid) {
            qpair.state = QPairState::Disconnected;
        }
    }

    /// Frees an I/O qpair. Deletion is deferred when called from the qpair's
    /// own completion context; the unwinding completion performs it.
    pub fn free_io_qpair(&mut self, qid: u16) -> Result<(), NvmeError> {
        let current = current_pid();
        let owner_pid;
        {
            let qpair = match self.find_qpair_mut(qid) {
                Some(qpair) => qpair,
                None => return Ok(()),
            };

            if qpair.in_completion_context {
                qpair.delete_after_completion_context = true;
                return Ok(());
            }

            owner_pid = qpair.owner_pid;
            qpair.poll_group = None;
            qpair.state = QPairState::Destroying;
        }

        self.transport.disconnect_qpair(qid);

        // A foreign process's qpair is freed without touching its queued
        // requests; the callbacks belong to the dead process.
        if owner_pid == current {
            self.transport.reset_qpair(qid);
        }

        for proc in self.procs.iter_mut() {
            proc.qpairs.retain(|q| q.id != qid);
        }
        self.active_io_qpairs.retain(|id| *id != qid);
        self.free_qid(qid);
        self.transport.delete_io_qpair(qid);

        Ok(())
    }

    /// Reconnects a disconnected I/O qpair.
    pub fn reconnect_io_qpair(&mut self, qid: u16) -> Result<(), NvmeError> {
        let state = self
            .io_qpair_state(qid)
            .ok_or(NvmeError::UnknownQpair { qid })?;

        if self.is_removed() {
            return Err(NvmeError::DeviceRemoved);
        }
        if self.is_resetting() || state == QPairState::Disconnecting {
            return Err(NvmeError::ReconnectInProgress);
        }
        if self.is_failed() || state == QPairState::Destroying {
            return Err(NvmeError::ControllerFailed);
        }
        if state != QPairState::Disconnected {
            return Ok(());
        }

        match self.transport.connect_qpair(qid) {
            Ok(()) => {
                let qpair = self.find_qpair_mut(qid).expect("qpair checked above");
                qpair.state = QPairState::Connected;
                qpair.failure_reason = QPairFailureReason::None;
                Ok(())
            }
            Err(_) => Err(NvmeError::QpairConnect {
                source: Errno::EAGAIN,
            }),
        }
    }

    // -- fail / remove / reset --------------------------------------------

    /// Marks the controller failed. Outstanding qpairs observe the failure
    /// on their next completion poll.
    pub(crate) fn fail(&mut self, hot_remove: bool) {
        if hot_remove {
            self.set_removed();
        }

        if self.is_failed() {
            info!("{}: already in failed state", self.name);
            return;
        }

        self.set_failed(true);
        self.transport.disconnect_qpair(0);
        self.adminq_state = QPairState::Disconnected;
        error!("{}: in failed state.", self.name);
    }

    /// Public failure entry point.
    pub fn fail_ctrlr(&mut self) {
        self.fail(false);
    }

    /// Surprise removal: no recovery, subsequent operations see ENODEV.
    pub fn hot_remove(&mut self) {
        self.fail(true);
    }

    /// Completes queued abort requests that were never given to the device.
    pub(crate) fn abort_queued_aborts(&mut self) {
        let n = self.queued_aborts.len();
        self.queued_aborts.clear();
        if n != 0 {
            debug!("{}: aborted {} queued abort commands", self.name, n);
        }
    }

    /// First half of a reset: tear the controller down to a disabled state.
    pub fn disconnect(&mut self) -> Result<(), NvmeError> {
        self.prepare_for_reset.store(false);

        if self.is_resetting() || self.is_removed() {
            // A reset is already in flight or the device is gone; no reason
            // to kick off another teardown.
            return if self.is_resetting() {
                Err(NvmeError::ResetDispatch {
                    source: Errno::EBUSY,
                })
            } else {
                Err(NvmeError::ResetDispatch {
                    source: Errno::ENXIO,
                })
            };
        }

        self.set_resetting(true);
        self.set_failed(false);

        info!("{}: resetting controller", self.name);

        // Keep alive is re-armed during re-initialization.
        self.keep_alive_interval = None;

        self.abort_queued_aborts();

        self.transport.abort_aers();
        self.drain_transport_events();
        for slot in self.aer_slots.iter_mut() {
            if let Some(token) = slot.take() {
                self.inflight.remove(&token.0);
            }
        }

        // Disable all queues before disabling the controller hardware.
        let qids: Vec<u16> = self.active_io_qpairs.clone();
        for qid in qids {
            if let Some(qpair) = self.find_qpair_mut(qid) {
                qpair.failure_reason = QPairFailureReason::Local;
                qpair.state = QPairState::Disconnected;
            }
        }

        self.adminq_failure_reason = QPairFailureReason::Local;
        self.transport.disconnect_qpair(0);
        self.adminq_state = QPairState::Disconnected;

        // Doorbell buffer config and IOCS specific data are invalid across
        // a reset.
        self.free_doorbell_buffer();
        self.free_iocs_specific_data();

        self.free_io_qids = None;

        Ok(())
    }

    pub(crate) fn free_doorbell_buffer(&mut self) {
        self.shadow_doorbell = None;
        self.eventidx = None;
    }

    pub(crate) fn free_iocs_specific_data(&mut self) {
        self.cdata_zns = None;
    }

    /// Second half of a reset: replay the init machine from the top.
    pub fn reconnect_async(&mut self) {
        self.sm
            .set_state(NvmeControllerState::ConnectAdminq, StateTimeout::Infinite);
    }

    /// Pumps re-initialization. `ReconnectInProgress` until the machine
    /// re-reaches ready.
    pub fn reconnect_poll_async(&mut self) -> Result<(), NvmeError> {
        let mut failed = false;

        if self.process_init().is_err() {
            error!("{}: controller reinitialization failed", self.name);
            failed = true;
        }

        if !failed && self.sm.current_state() != NvmeControllerState::Ready {
            return Err(NvmeError::ReconnectInProgress);
        }

        // For non-fabrics controllers the transport qpair memory survives a
        // reset; re-enable the queues with admin commands right here. Fabric
        // qpairs are reconnected on their own threads by the embedder.
        if !failed && !self.is_fabrics() {
            let qids: Vec<u16> = self.active_io_qpairs.clone();
            for qid in qids {
                if let Some(bits) = self.free_io_qids.as_mut() {
                    assert!(
                        bits.get(qid as usize).unwrap_or(false),
                        "active qpair qid missing from rebuilt bitset"
                    );
                    bits.set(qid as usize, false);
                }

                if self.transport.connect_qpair(qid).is_err() {
                    // The qpair stays in the active set with a local failure
                    // reason; the embedder may retry it later.
                    let qpair = self.find_qpair_mut(qid).expect("active qpair");
                    qpair.failure_reason = QPairFailureReason::Local;
                    qpair.state = QPairState::Disconnected;
                    warn!("{}: failed to reconnect qpair {}", self.name, qid);
                } else {
                    let qpair = self.find_qpair_mut(qid).expect("active qpair");
                    qpair.state = QPairState::Connected;
                    qpair.failure_reason = QPairFailureReason::None;
                }
            }
        }

        // Namespace handles can be invalidated during a reset; drop the
        // inactive ones now.
        self.ns.retain(|_, ns| ns.is_active());

        if failed {
            self.fail(false);
        }
        self.set_resetting(false);

        if failed {
            Err(NvmeError::ResetDispatch {
                source: Errno::ENXIO,
            })
        } else {
            Ok(())
        }
    }

    /// Synchronous reset: disconnect, then pump reconnection to completion.
    /// A reset already in progress reports success.
    pub fn reset(&mut self) -> Result<(), NvmeError> {
        match self.disconnect() {
            Ok(()) => {}
            Err(NvmeError::ResetDispatch { source }) if source == Errno::EBUSY => {
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.reconnect_async();

        loop {
            match self.reconnect_poll_async() {
                Err(NvmeError::ReconnectInProgress) => continue,
                other => return other,
            }
        }
    }

    /// Writes the magic value to NSSR. No further cleanup here; on PCIe a
    /// hot-remove follows and does the teardown.
    pub fn reset_subsystem(&mut self) -> Result<(), NvmeError> {
        if !self.cap.nssrs() {
            warn!("{}: subsystem reset is not supported", self.name);
            return Err(NvmeError::NotSupported {
                source: Errno::ENOTSUP,
            });
        }

        info!("{}: resetting subsystem", self.name);
        self.set_resetting(true);
        let rc = self
            .transport
            .set_reg4(offsets::NSSR, NSSR_VALUE)
            .map_err(|source| NvmeError::RegisterAccess { source });
        self.set_resetting(false);

        rc
    }

    /// Re-targets a failed controller at a new transport address. Only the
    /// address may change; transport type and subsystem must match.
    pub fn set_trid(&mut self, trid: TransportId) -> Result<(), NvmeError> {
        if !self.is_failed() {
            return Err(NvmeError::InvalidParam {
                source: Errno::EPERM,
            });
        }

        if trid.trtype != self.trid.trtype || trid.subnqn != self.trid.subnqn {
            return Err(NvmeError::InvalidParam {
                source: Errno::EINVAL,
            });
        }

        self.trid = trid;
        Ok(())
    }

    // -- admin submission plumbing ----------------------------------------

    pub(crate) fn submit_admin(
        &mut self,
        cmd: AdminCommand,
        payload: Payload,
        sink: AdminSink,
    ) -> Result<AdminToken, NvmeError> {
        let token = AdminToken(self.next_token);
        self.next_token += 1;

        let req = crate::transport::AdminRequest {
            token,
            cmd,
            payload,
        };

        self.transport
            .submit_admin_request(req)
            .map_err(|source| NvmeError::Transport { source })?;

        self.inflight.insert(
            token.0,
            AdminInflight {
                sink,
                submitted: Instant::now(),
                timeout_reported: false,
                cid: token.cid(),
            },
        );

        Ok(token)
    }

    /// Drains transport completions and dispatches them. Returns the number
    /// of events handled.
    pub(crate) fn drain_transport_events(&mut self) -> u32 {
        let mut events: Vec<TransportEvent> = Vec::new();
        self.transport.process_completions(&mut events);
        let count = events.len() as u32;

        for event in events {
            match event {
                TransportEvent::Register {
                    cookie,
                    value,
                    status,
                } => self.handle_register_completion(cookie, value, status),
                TransportEvent::Admin {
                    token,
                    cpl,
                    payload,
                } => self.handle_admin_completion(token, cpl, payload),
            }
        }

        count
    }

    fn handle_register_completion(
        &mut self,
        cookie: RegisterCookie,
        value: u64,
        status: Result<(), Errno>,
    ) {
        match cookie {
            RegisterCookie::ShutdownReadCc
            | RegisterCookie::ShutdownWriteCc
            | RegisterCookie::ShutdownReadCsts => {
                self.shutdown_register_done(cookie, value, status)
            }
            _ => self.init_register_done(cookie, value, status),
        }
    }

    fn handle_admin_completion(
        &mut self,
        token: AdminToken,
        cpl: Completion,
        payload: Option<DmaBuffer>,
    ) {
        let inflight = match self.inflight.remove(&token.0) {
            Some(inflight) => inflight,
            None => {
                warn!("{}: completion for unknown admin token {:?}", self.name, token);
                return;
            }
        };

        match inflight.sink {
            AdminSink::Init => self.init_admin_done(cpl, payload),
            AdminSink::ActiveNs => self.active_ns_page_done(cpl, payload),
            AdminSink::Aer(slot) => self.aer_done(slot, token, cpl),
            AdminSink::KeepAlive => {}
            AdminSink::Abort => self.abort_done(cpl),
            AdminSink::Poll => {
                self.poll_results.insert(token.0, (cpl, payload));
            }
            AdminSink::BootPartitionWrite => self.bp_write_done(cpl),
        }
    }

    /// Fires the per-process timeout callback for admin commands whose age
    /// exceeds the registered threshold.
    pub(crate) fn check_admin_timeouts(&mut self) {
        if !self.timeout_enabled {
            return;
        }

        let now = Instant::now();
        let pid = current_pid();

        let threshold = match self
            .procs
            .iter()
            .find(|p| p.pid == pid)
            .and_then(|p| p.timeout_admin)
        {
            Some(t) => t,
            None => return,
        };

        let mut expired: Vec<u16> = Vec::new();
        for inflight in self.inflight.values_mut() {
            if !inflight.timeout_reported && now.duration_since(inflight.submitted) > threshold {
                inflight.timeout_reported = true;
                expired.push(inflight.cid);
            }
        }

        if expired.is_empty() {
            return;
        }

        if let Some(proc) = self.procs.iter().find(|p| p.pid == pid) {
            if let Some(cb) = proc.timeout_cb.as_ref() {
                for cid in expired {
                    error!("{}: admin command {} timed out", self.name, cid);
                    cb(None, cid);
                }
            }
        }
    }

    /// Admin-path pump: keep alive, transport completions, timeout
    /// callbacks and per-process async event delivery.
    pub fn process_admin_completions(&mut self) -> Result<u32, NvmeError> {
        if self.is_failed() {
            return Err(NvmeError::ControllerFailed);
        }

        if self.keep_alive_interval.is_some() {
            self.keep_alive()?;
        }

        let mut completions = self.drain_transport_events();

        self.check_admin_timeouts();

        if self.current_process_mut().is_some() {
            completions += self.complete_queued_async_events();
        }

        Ok(completions)
    }

    // -- CMB / PMR ---------------------------------------------------------

    /// Reserves the controller memory buffer; returns its size in bytes.
    pub fn reserve_cmb(&mut self) -> Result<u64, NvmeError> {
        let cmbsz = self.get_regs_cmbsz();

        if !cmbsz.rds() || !cmbsz.wds() {
            return Err(NvmeError::NotSupported {
                source: Errno::ENOTSUP,
            });
        }

        let size = cmbsz.size_bytes();
        self.transport
            .reserve_cmb()
            .map_err(|source| NvmeError::NotSupported { source })?;
        Ok(size)
    }

    pub fn map_cmb(&mut self) -> Result<(u64, usize), NvmeError> {
        self.transport
            .map_cmb()
            .map_err(|source| NvmeError::NotSupported { source })
    }

    pub fn unmap_cmb(&mut self) -> Result<(), NvmeError> {
        self.transport
            .unmap_cmb()
            .map_err(|source| NvmeError::NotSupported { source })
    }

    pub fn enable_pmr(&mut self) -> Result<(), NvmeError> {
        self.transport
            .enable_pmr()
            .map_err(|source| NvmeError::NotSupported { source })
    }

    pub fn disable_pmr(&mut self) -> Result<(), NvmeError> {
        self.transport
            .disable_pmr()
            .map_err(|source| NvmeError::NotSupported { source })
    }

    pub fn map_pmr(&mut self) -> Result<(u64, usize), NvmeError> {
        self.transport
            .map_pmr()
            .map_err(|source| NvmeError::NotSupported { source })
    }

    pub fn unmap_pmr(&mut self) -> Result<(), NvmeError> {
        self.transport
            .unmap_pmr()
            .map_err(|source| NvmeError::NotSupported { source })
    }

    /// Ids of the memory domains controller I/O buffers may live in.
    pub fn get_memory_domains(&self) -> Vec<String> {
        self.transport.memory_domains()
    }

    // -- destruct ----------------------------------------------------------

    /// Starts an orderly shutdown: aborts outstanding work, frees qpairs and
    /// controller buffers, then begins shutdown notification.
    pub fn destruct_async(&mut self) {
        debug!("{}: Prepare to destruct SSD", self.name);

        self.set_destructed();

        self.drain_transport_events();
        self.abort_queued_aborts();

        self.transport.abort_aers();
        self.drain_transport_events();
        for slot in self.aer_slots.iter_mut() {
            if let Some(token) = slot.take() {
                self.inflight.remove(&token.0);
            }
        }

        let qids: Vec<u16> = self.active_io_qpairs.clone();
        for qid in qids {
            if let Err(e) = self.free_io_qpair(qid) {
                warn!("{}: failed to free qpair {} at destruct: {}", self.name, qid, e);
            }
        }

        self.free_doorbell_buffer();
        self.free_iocs_specific_data();

        self.shutdown_async();
    }

    /// Polls shutdown progress. `ReconnectInProgress` while the device is
    /// still shutting down; any terminal result finishes the teardown.
    pub fn destruct_poll_async(&mut self) -> Result<(), NvmeError> {
        if !self.detach_ctx.as_ref().map_or(true, |c| c.shutdown_complete) {
            match self.shutdown_poll_async() {
                Err(NvmeError::ReconnectInProgress) => return Err(NvmeError::ReconnectInProgress),
                // Destruct proceeds regardless of shutdown failures.
                _ => {}
            }
        }

        self.transport.disconnect_qpair(0);
        self.adminq_state = QPairState::Disconnected;

        for ns in self.ns.values_mut() {
            ns.destruct();
        }
        self.ns.clear();
        self.active_ns_count = 0;

        self.free_io_qids = None;
        self.ana_log_page = Vec::new();

        let pids: Vec<i32> = self.procs.iter().map(|p| p.pid).collect();
        for pid in pids {
            self.remove_process(pid);
        }

        self.transport.destruct();
        self.detach_ctx = None;

        Ok(())
    }

    /// Synchronous destruct used by simple teardown paths.
    pub fn destruct(&mut self) {
        self.destruct_async();

        loop {
            match self.destruct_poll_async() {
                Err(NvmeError::ReconnectInProgress) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                _ => break,
            }
        }
    }
}
