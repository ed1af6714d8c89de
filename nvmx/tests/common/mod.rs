#![allow(dead_code)]
//! In-memory NVMe device model used by the integration tests.
//!
//! The fake transport keeps the whole device state behind an
//! `Arc<Mutex<_>>` so a test can hold a handle to the device while the
//! controller owns the boxed transport: registers behave like a real
//! controller (CC.EN drives CSTS.RDY), admin commands complete immediately,
//! and AERs are held until the test fires them.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use nix::errno::Errno;

use nvmx::pages::{
    build_ana_log_page, feat, AnaGroupDescriptor, AdminOpcode, Completion, DataPage,
    GenericStatusCode, IdentifyCns, IdentifyControllerData, IdentifyNsData, Status,
};
use nvmx::registers::{offsets, Cap, Cc, Csts, Vs, CAP_CSS_NVM, SHST_COMPLETE};
use nvmx::transport::{
    AdminRequest, AdminToken, DmaBuffer, NvmeTransport, Payload, RegisterCookie, TransportEvent,
};
use nvmx::IoQpairOpts;

pub struct FakeState {
    pub cap: Cap,
    pub vs: Vs,
    pub cc: Cc,
    pub csts: Csts,
    pub nssr: u32,

    pub cdata: IdentifyControllerData,
    pub active_ns: Vec<u32>,
    pub ana_change_count: u64,
    pub ana_descs: Vec<AnaGroupDescriptor>,

    /// Keep-alive timeout the device reports via Get Features.
    pub kato_ms: u32,
    pub kato_supported: bool,
    /// Number of I/O queues the device grants (zero-based grant applies).
    pub queue_grant: u32,

    pub fail_connect_qids: HashSet<u16>,

    pending: Vec<TransportEvent>,
    pub held_aers: Vec<(AdminToken, usize)>,

    // Counters observed by tests.
    pub set_en0_writes: u32,
    pub keep_alives: u32,
    pub created_qpairs: HashSet<u16>,
    pub connected_qpairs: HashSet<u16>,
    pub host_id_set: bool,
}

impl FakeState {
    fn new() -> Self {
        let mut cdata = IdentifyControllerData::default();
        cdata.vid = 0x1b36;
        cdata.nn = 2048;
        cdata.aerl = 3;
        cdata.kas = 100;
        cdata.acl = 3;
        cdata.oaes = 1 << 8; /* namespace attribute notices */

        FakeState {
            cap: Cap(0)
                .with_mqes(255)
                .with_to(30)
                .with_css(CAP_CSS_NVM)
                .with_nssrs(true)
                .with_mpsmin(0),
            vs: Vs::new(1, 3, 0),
            cc: Cc(0),
            csts: Csts(0),
            nssr: 0,
            cdata,
            active_ns: vec![1, 2],
            ana_change_count: 0,
            ana_descs: Vec::new(),
            kato_ms: 10_000,
            kato_supported: true,
            queue_grant: 1024,
            fail_connect_qids: HashSet::new(),
            pending: Vec::new(),
            held_aers: Vec::new(),
            set_en0_writes: 0,
            keep_alives: 0,
            created_qpairs: HashSet::new(),
            connected_qpairs: HashSet::new(),
            host_id_set: false,
        }
    }

    fn reg_read(&self, offset: u32) -> u64 {
        match offset {
            offsets::CAP => self.cap.0,
            offsets::VS => self.vs.0 as u64,
            offsets::CC => self.cc.0 as u64,
            offsets::CSTS => self.csts.0 as u64,
            offsets::NSSR => self.nssr as u64,
            _ => 0,
        }
    }

    fn reg_write(&mut self, offset: u32, value: u64) {
        match offset {
            offsets::CC => {
                let new = Cc(value as u32);
                if new.en() && !self.cc.en() {
                    self.csts.set_rdy(true);
                }
                if !new.en() && self.cc.en() {
                    self.set_en0_writes += 1;
                    self.csts.set_rdy(false);
                }
                if new.shn() != 0 {
                    self.csts.set_shst(SHST_COMPLETE);
                }
                self.cc = new;
            }
            offsets::NSSR => self.nssr = value as u32,
            _ => {}
        }
    }

    fn complete(&mut self, token: AdminToken, cpl: Completion, payload: Option<DmaBuffer>) {
        self.pending.push(TransportEvent::Admin {
            token,
            cpl,
            payload,
        });
    }

    fn identify(&mut self, req: AdminRequest) {
        let cmd = req.cmd;
        let cns = cmd.cdw10 & 0xff;
        let mut buf = match req.payload {
            Payload::DataIn(buf) => buf,
            _ => {
                self.complete(
                    req.token,
                    Completion::with_status(Status::generic(GenericStatusCode::InvalidField)),
                    None,
                );
                return;
            }
        };

        let mut cpl = Completion::success();

        if cns == IdentifyCns::Ctrlr as u32 {
            buf.as_mut_slice().copy_from_slice(self.cdata.as_bytes());
        } else if cns == IdentifyCns::ActiveNsList as u32 {
            let out = buf.as_mut_slice();
            let mut off = 0usize;
            for nsid in self.active_ns.iter().filter(|id| **id > cmd.nsid).take(1024) {
                out[off..off + 4].copy_from_slice(&nsid.to_le_bytes());
                off += 4;
            }
        } else if cns == IdentifyCns::Ns as u32 {
            if self.active_ns.contains(&cmd.nsid) {
                let mut nsdata = IdentifyNsData::default();
                nsdata.nsze = 0x1000 * cmd.nsid as u64;
                nsdata.ncap = nsdata.nsze;
                nsdata.anagrpid = 1;
                buf.as_mut_slice().copy_from_slice(nsdata.as_bytes());
            } else {
                cpl = Completion::with_status(Status::generic(GenericStatusCode::InvalidField));
            }
        } else if cns == IdentifyCns::NsIdDescriptorList as u32 {
            let mut list = Vec::new();
            nvmx::pages::build_id_desc(nvmx::pages::NIDT_CSI, &[0u8], &mut list);
            buf.as_mut_slice()[..list.len()].copy_from_slice(&list);
        } else {
            // IOCS specific identify structures are not modeled.
            cpl = Completion::with_status(Status::generic(GenericStatusCode::InvalidField));
        }

        self.complete(req.token, cpl, Some(buf));
    }

    fn get_log_page(&mut self, req: AdminRequest) {
        let lid = (req.cmd.cdw10 & 0xff) as u8;
        let mut buf = match req.payload {
            Payload::DataIn(buf) => buf,
            _ => {
                self.complete(req.token, Completion::success(), None);
                return;
            }
        };

        if lid == nvmx::pages::log_page::ASYMMETRIC_NAMESPACE_ACCESS {
            let page = build_ana_log_page(self.ana_change_count, &self.ana_descs);
            let n = page.len().min(buf.len());
            buf.as_mut_slice()[..n].copy_from_slice(&page[..n]);
        }

        // Other log pages read back as zeroes.
        self.complete(req.token, Completion::success(), Some(buf));
    }

    fn set_features(&mut self, req: AdminRequest) {
        let feature = (req.cmd.cdw10 & 0xff) as u8;
        let mut cpl = Completion::success();

        match feature {
            feat::NUMBER_OF_QUEUES => {
                let requested = (req.cmd.cdw11 & 0xffff) + 1;
                let granted = requested.min(self.queue_grant) - 1;
                cpl.cdw0 = granted | (granted << 16);
            }
            feat::HOST_IDENTIFIER => {
                self.host_id_set = true;
            }
            _ => {}
        }

        self.complete(req.token, cpl, req.payload.take_buffer());
    }

    fn get_features(&mut self, req: AdminRequest) {
        let feature = (req.cmd.cdw10 & 0xff) as u8;
        let cpl = match feature {
            feat::KEEP_ALIVE_TIMER if self.kato_supported => {
                let mut cpl = Completion::success();
                cpl.cdw0 = self.kato_ms;
                cpl
            }
            feat::KEEP_ALIVE_TIMER => {
                Completion::with_status(Status::generic(GenericStatusCode::InvalidField))
            }
            _ => Completion::success(),
        };

        self.complete(req.token, cpl, None);
    }
}

#[derive(Clone)]
pub struct FakeTransport(pub Arc<Mutex<FakeState>>);

impl FakeTransport {
    pub fn new() -> Self {
        FakeTransport(Arc::new(Mutex::new(FakeState::new())))
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, FakeState> {
        self.0.lock()
    }

    /// Completes one held AER with the given completion dword 0.
    pub fn fire_aer(&self, cdw0: u32) {
        let mut state = self.state();
        let (token, _slot) = state.held_aers.remove(0);
        let mut cpl = Completion::success();
        cpl.cdw0 = cdw0;
        state.complete(token, cpl, None);
    }
}

impl NvmeTransport for FakeTransport {
    fn get_reg4(&mut self, offset: u32) -> Result<u32, Errno> {
        Ok(self.state().reg_read(offset) as u32)
    }

    fn get_reg8(&mut self, offset: u32) -> Result<u64, Errno> {
        Ok(self.state().reg_read(offset))
    }

    fn set_reg4(&mut self, offset: u32, value: u32) -> Result<(), Errno> {
        self.state().reg_write(offset, value as u64);
        Ok(())
    }

    fn set_reg8(&mut self, offset: u32, value: u64) -> Result<(), Errno> {
        self.state().reg_write(offset, value);
        Ok(())
    }

    fn get_reg4_async(&mut self, offset: u32, cookie: RegisterCookie) -> Result<(), Errno> {
        let mut state = self.state();
        let value = state.reg_read(offset);
        state.pending.push(TransportEvent::Register {
            cookie,
            value,
            status: Ok(()),
        });
        Ok(())
    }

    fn get_reg8_async(&mut self, offset: u32, cookie: RegisterCookie) -> Result<(), Errno> {
        self.get_reg4_async(offset, cookie)
    }

    fn set_reg4_async(
        &mut self,
        offset: u32,
        value: u32,
        cookie: RegisterCookie,
    ) -> Result<(), Errno> {
        let mut state = self.state();
        state.reg_write(offset, value as u64);
        state.pending.push(TransportEvent::Register {
            cookie,
            value: 0,
            status: Ok(()),
        });
        Ok(())
    }

    fn enable(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn destruct(&mut self) {}

    fn create_io_qpair(&mut self, qid: u16, _opts: &IoQpairOpts) -> Result<(), Errno> {
        self.state().created_qpairs.insert(qid);
        Ok(())
    }

    fn delete_io_qpair(&mut self, qid: u16) {
        let mut state = self.state();
        state.created_qpairs.remove(&qid);
        state.connected_qpairs.remove(&qid);
    }

    fn connect_qpair(&mut self, qid: u16) -> Result<(), Errno> {
        let mut state = self.state();
        if state.fail_connect_qids.contains(&qid) {
            return Err(Errno::EIO);
        }
        state.connected_qpairs.insert(qid);
        Ok(())
    }

    fn disconnect_qpair(&mut self, qid: u16) {
        self.state().connected_qpairs.remove(&qid);
    }

    fn reset_qpair(&mut self, _qid: u16) {}

    fn submit_admin_request(&mut self, req: AdminRequest) -> Result<(), Errno> {
        let opc = req.cmd.opc;
        let mut state = self.state();

        match opc {
            AdminOpcode::Identify => state.identify(req),
            AdminOpcode::GetLogPage => state.get_log_page(req),
            AdminOpcode::SetFeatures => state.set_features(req),
            AdminOpcode::GetFeatures => state.get_features(req),
            AdminOpcode::AsyncEventRequest => {
                let slot = state.held_aers.len();
                state.held_aers.push((req.token, slot));
            }
            AdminOpcode::KeepAlive => {
                state.keep_alives += 1;
                state.complete(req.token, Completion::success(), None);
            }
            _ => {
                let payload = req.payload.take_buffer();
                state.complete(req.token, Completion::success(), payload);
            }
        }

        Ok(())
    }

    fn abort_aers(&mut self) {
        let mut state = self.state();
        let held: Vec<(AdminToken, usize)> = state.held_aers.drain(..).collect();
        for (token, _) in held {
            state.complete(
                token,
                Completion::with_status(Status::generic(GenericStatusCode::AbortedSqDeletion)),
                None,
            );
        }
    }

    fn process_completions(&mut self, events: &mut Vec<TransportEvent>) -> usize {
        let mut state = self.state();
        let n = state.pending.len();
        events.extend(state.pending.drain(..));
        n
    }

    fn max_xfer_size(&self) -> u32 {
        128 * 1024
    }

    fn max_sges(&self) -> u16 {
        16
    }
}

use nvmx::{NvmeController, NvmeControllerOpts, TransportIdBuilder, TransportType};

/// Routes controller logs into the test capture. Safe to call per test;
/// only the first registration wins.
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Builds a controller on a fresh fake device; returns both halves.
pub fn fake_controller(opts: NvmeControllerOpts) -> (NvmeController, FakeTransport) {
    init_test_logging();

    let transport = FakeTransport::new();
    let trid = TransportIdBuilder::new()
        .with_trtype(TransportType::Pcie)
        .with_traddr("0000:81:00.0")
        .build();

    let ctrlr = NvmeController::new(trid, Box::new(transport.clone()), opts);
    (ctrlr, transport)
}

/// Pumps initialization until the controller reaches ready.
pub fn pump_until_ready(ctrlr: &mut NvmeController) {
    for _ in 0..1000 {
        if ctrlr.state() == nvmx::NvmeControllerState::Ready {
            return;
        }
        ctrlr.process_init().expect("init step failed");
    }
    panic!(
        "controller did not reach ready, stuck in {:?}",
        ctrlr.state()
    );
}
