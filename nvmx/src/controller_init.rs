//! Controller initialization and shutdown state machines.
//!
//! `process_init` advances the controller at most one step per call and is
//! re-invoked by the embedder until the state is ready (or error). Hardware
//! never blocks the pump: every register access and admin command is issued
//! asynchronously and the paired `WaitFor*` state is left by the completion.

use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::{
    controller::{ActiveNsCtx, AdminSink, CtrlrFlags, DetachCtx, DetachState, NvmeController},
    controller_state::{NvmeControllerState, StateTimeout},
    error::NvmeError,
    pages::{
        ana_log_page_size, feat, AsyncEventConfig, Completion, CommandsAndEffectsLogPage, Csi,
        DataPage, GenericStatusCode, IdentifyControllerData, IdentifyCns, IdentifyNsData,
        IntelLogPageDirectory, NsListPage, StatusCodeType, ZnsCtrlrData, ZnsNsData,
        GLOBAL_NS_TAG, OPC_ZONE_APPEND,
    },
    pages::log_page,
    opts::{
        COMMAND_SET_AUTO, IO_QUEUE_SIZE_FOR_QUIRK, DEFAULT_IO_QUEUE_SIZE, MAX_IO_QUEUES,
        MAX_IO_QUEUE_ENTRIES, MIN_IO_QUEUE_ENTRIES,
    },
    qpair::QPairState,
    quirks::{Quirks, PCI_VID_INTEL},
    registers::{
        offsets, ArbMechanism, Cap, Cc, Csts, Vs, CAP_AMS_VS, CAP_AMS_WRR, CAP_CSS_IOCS,
        CAP_CSS_NOIO, CAP_CSS_NVM, CC_CSS_IOCS, CC_CSS_NOIO, CC_CSS_NVM, SHN_NORMAL,
        SHST_COMPLETE, VS_1_1, VS_1_2, VS_1_3,
    },
    transport::{DmaBuffer, Payload, RegisterCookie, TransportType},
};

use bit_vec::BitVec;

impl NvmeController {
    /// Upper bound for every "wait for CSTS.RDY" transition, per CAP.TO.
    pub(crate) fn ready_timeout_ms(&self) -> u64 {
        self.cap.to() as u64 * 500
    }

    fn admin_timeout(&self) -> StateTimeout {
        StateTimeout::Ms(self.opts.admin_timeout_ms as u64)
    }

    fn set_error_state(&mut self) {
        self.sm
            .set_state(NvmeControllerState::Error, StateTimeout::Infinite);
    }

    /// Initialization pump. Call repeatedly until the controller reaches
    /// ready; an error return means the machine hit a terminal failure or a
    /// step timed out.
    pub fn process_init(&mut self) -> Result<(), NvmeError> {
        use NvmeControllerState::*;

        let now = Instant::now();

        // A quirk may require leaving the target controller alone for a
        // while. Return early without touching the machine.
        if let Some(deadline) = self.sleep_deadline {
            if now <= deadline {
                return Ok(());
            }
        }
        self.sleep_deadline = None;

        let ready_timeout = self.ready_timeout_ms();
        let mut rc = Ok(());

        match self.sm.current_state() {
            InitDelay => {
                self.sm
                    .set_state(ConnectAdminq, StateTimeout::Ms(ready_timeout));
                if self.quirks.contains(Quirks::DELAY_BEFORE_INIT) {
                    // The device is not ready to be enabled directly after a
                    // bus reset; delay the very first initialization.
                    debug!(
                        "{}: Adding 2 second delay before initializing the controller",
                        self.name
                    );
                    self.sleep_deadline = Some(now + Duration::from_secs(2));
                }
            }

            ConnectAdminq => match self.transport.connect_qpair(0) {
                Ok(()) => {
                    self.adminq_state = QPairState::Connected;
                    self.sm
                        .set_state(WaitForConnectAdminq, StateTimeout::Infinite);
                }
                Err(e) => {
                    error!("{}: failed to connect the admin queue: {}", self.name, e);
                    self.set_error_state();
                }
            },

            WaitForConnectAdminq => {
                self.drain_transport_events();

                match self.adminq_state {
                    QPairState::Connecting => {}
                    QPairState::Connected | QPairState::Enabled => {
                        self.adminq_state = QPairState::Enabled;
                        self.sm.set_state(ReadVs, StateTimeout::Infinite);
                        // Drop anything queued while the admin queue was
                        // connecting so a reset does not stall on stale
                        // requests.
                        self.transport.reset_qpair(0);
                    }
                    _ => self.set_error_state(),
                }
            }

            ReadVs => {
                self.sm.set_state(ReadVsWaitForVs, StateTimeout::Infinite);
                rc = self.get_reg4_async(offsets::VS, RegisterCookie::ReadVs);
            }

            ReadCap => {
                self.sm.set_state(ReadCapWaitForCap, StateTimeout::Infinite);
                rc = self.get_reg8_async(offsets::CAP, RegisterCookie::ReadCap);
            }

            CheckEn => {
                // Begin the hardware initialization by making sure the
                // controller is disabled.
                self.sm
                    .set_state(CheckEnWaitForCc, StateTimeout::Ms(ready_timeout));
                rc = self.get_reg4_async(offsets::CC, RegisterCookie::CheckEnReadCc);
            }

            DisableWaitForReady1 => {
                self.sm.set_state_quiet(
                    DisableWaitForReady1WaitForCsts,
                    StateTimeout::KeepExisting,
                );
                rc = self.get_reg4_async(offsets::CSTS, RegisterCookie::DisableReady1ReadCsts);
            }

            SetEn0 => {
                debug!("{}: Setting CC.EN = 0", self.name);
                self.sm
                    .set_state(SetEn0WaitForCc, StateTimeout::Ms(ready_timeout));
                rc = self.get_reg4_async(offsets::CC, RegisterCookie::SetEn0ReadCc);
            }

            DisableWaitForReady0 => {
                self.sm.set_state_quiet(
                    DisableWaitForReady0WaitForCsts,
                    StateTimeout::KeepExisting,
                );
                rc = self.get_reg4_async(offsets::CSTS, RegisterCookie::DisableReady0ReadCsts);
            }

            Enable => {
                debug!("{}: Setting CC.EN = 1", self.name);
                self.sm
                    .set_state(EnableWaitForCc, StateTimeout::Ms(ready_timeout));
                rc = self.ctrlr_enable();
                return rc;
            }

            EnableWaitForReady1 => {
                self.sm.set_state_quiet(
                    EnableWaitForReady1WaitForCsts,
                    StateTimeout::KeepExisting,
                );
                rc = self.get_reg4_async(offsets::CSTS, RegisterCookie::EnableReady1ReadCsts);
            }

            ResetAdminQueue => {
                self.transport.reset_qpair(0);
                self.sm.set_state(Identify, StateTimeout::Infinite);
            }

            Identify => rc = self.ctrlr_identify(),
            ConfigureAer => rc = self.configure_aer(),
            SetKeepAliveTimeout => rc = self.set_keep_alive_timeout(),
            IdentifyIocsSpecific => rc = self.identify_iocs_specific(),
            GetZnsCmdEffectsLog => rc = self.get_zns_cmd_and_effects_log(),
            SetNumQueues => {
                self.update_nvmf_ioccsz();
                rc = self.set_num_queues();
            }
            IdentifyActiveNs => self.identify_active_ns_init(),
            IdentifyNs => rc = self.identify_namespaces(),
            IdentifyIdDescs => rc = self.identify_id_desc_namespaces(),
            IdentifyNsIocsSpecific => rc = self.identify_namespaces_iocs_specific(),
            SetSupportedLogPages => rc = self.set_supported_log_pages(),
            SetSupportedIntelLogPages => rc = self.set_intel_support_log_pages(),
            SetSupportedFeatures => {
                self.set_supported_features();
                self.sm
                    .set_state(NvmeControllerState::SetDbBufCfg, self.admin_timeout());
            }
            SetDbBufCfg => rc = self.set_doorbell_buffer_config(),
            SetHostId => rc = self.set_host_id(),

            Ready => {
                debug!("{}: Ctrlr already in ready state", self.name);
                return Ok(());
            }

            Error => {
                error!("{}: Ctrlr is in error state", self.name);
                return Err(NvmeError::InvalidState { state: "error" });
            }

            ReadVsWaitForVs
            | ReadCapWaitForCap
            | CheckEnWaitForCc
            | SetEn0WaitForCc
            | DisableWaitForReady1WaitForCsts
            | DisableWaitForReady0WaitForCsts
            | EnableWaitForCc
            | EnableWaitForReady1WaitForCsts
            | WaitForIdentify
            | WaitForConfigureAer
            | WaitForKeepAliveTimeout
            | WaitForIdentifyIocsSpecific
            | WaitForGetZnsCmdEffectsLog
            | WaitForSetNumQueues
            | WaitForIdentifyActiveNs
            | WaitForIdentifyNs
            | WaitForIdentifyIdDescs
            | WaitForIdentifyNsIocsSpecific
            | WaitForSupportedIntelLogPages
            | WaitForDbBufCfg
            | WaitForHostId => {
                self.drain_transport_events();
            }
        }

        rc?;

        // Use the ticks captured on entry so a process swapped out between
        // advancing the state and this check is not penalized.
        if self.sm.timed_out(now) {
            let state = self.sm.current_state().as_str();
            error!("{}: Initialization timed out in state ({})", self.name, state);
            return Err(NvmeError::InitTimeout { state });
        }

        Ok(())
    }

    fn get_reg4_async(&mut self, offset: u32, cookie: RegisterCookie) -> Result<(), NvmeError> {
        self.transport
            .get_reg4_async(offset, cookie)
            .map_err(|source| NvmeError::RegisterAccess { source })
    }

    fn get_reg8_async(&mut self, offset: u32, cookie: RegisterCookie) -> Result<(), NvmeError> {
        self.transport
            .get_reg8_async(offset, cookie)
            .map_err(|source| NvmeError::RegisterAccess { source })
    }

    fn set_cc_async(&mut self, cc: Cc, cookie: RegisterCookie) -> Result<(), NvmeError> {
        self.transport
            .set_reg4_async(offsets::CC, cc.0, cookie)
            .map_err(|source| NvmeError::RegisterAccess { source })
    }

    /// Derives sizing defaults once CAP is known.
    fn init_cap(&mut self) {
        if self.cap.ams() & CAP_AMS_WRR != 0 {
            self.flags.insert(CtrlrFlags::WRR_SUPPORTED);
        }

        self.min_page_size = 1u32 << (12 + self.cap.mpsmin());
        // For now, always select page_size == min_page_size.
        self.page_size = self.min_page_size;

        self.opts.io_queue_size = self.opts.io_queue_size.max(MIN_IO_QUEUE_ENTRIES);
        self.opts.io_queue_size = self.opts.io_queue_size.min(MAX_IO_QUEUE_ENTRIES);
        if self.quirks.contains(Quirks::MINIMUM_IO_QUEUE_SIZE)
            && self.opts.io_queue_size == DEFAULT_IO_QUEUE_SIZE
        {
            // A user-specified size overrides the quirk; cap.mqes still
            // applies either way.
            self.opts.io_queue_size = IO_QUEUE_SIZE_FOR_QUIRK;
        }
        self.opts.io_queue_size = self.opts.io_queue_size.min(self.cap.mqes() as u32 + 1);

        self.opts.io_queue_requests = self.opts.io_queue_requests.max(self.opts.io_queue_size);
    }

    /// Composes CC for the enable step and writes it.
    fn ctrlr_enable(&mut self) -> Result<(), NvmeError> {
        self.transport.enable().map_err(|source| {
            error!("{}: transport ctrlr_enable failed", self.name);
            NvmeError::Transport { source }
        })?;

        let mut cc = self.process_init_cc;
        if cc.en() {
            error!("{}: called with CC.EN = 1", self.name);
            return Err(NvmeError::InvalidParam {
                source: Errno::EINVAL,
            });
        }

        cc.set_en(true);
        cc.set_css(0);
        cc.set_shn(0);
        cc.set_iosqes(6); /* SQ entry size == 64 == 2^6 */
        cc.set_iocqes(4); /* CQ entry size == 16 == 2^4 */

        // Page size is 2 ^ (12 + mps).
        cc.set_mps((self.page_size.trailing_zeros() - 12) as u8);

        // A controller without any CAP.CSS bit is not spec compliant; try to
        // support it regardless.
        if self.cap.css() == 0 {
            info!(
                "{}: Drive reports no command sets supported. Assuming NVM is supported.",
                self.name
            );
            self.cap = self.cap.with_css(CAP_CSS_NVM);
        }

        // No explicit request, or a value too large for CC.CSS: pick the most
        // reasonable supported set.
        if self.opts.command_set >= COMMAND_SET_AUTO {
            if self.cap.css() & CAP_CSS_IOCS != 0 {
                self.opts.command_set = CC_CSS_IOCS;
            } else if self.cap.css() & CAP_CSS_NVM != 0 {
                self.opts.command_set = CC_CSS_NVM;
            } else if self.cap.css() & CAP_CSS_NOIO != 0 {
                self.opts.command_set = CC_CSS_NOIO;
            } else {
                self.opts.command_set = CC_CSS_NVM;
            }
        }

        if self.cap.css() & (1u8 << self.opts.command_set) == 0 {
            debug!(
                "{}: Requested I/O command set {} but supported mask is 0x{:x}",
                self.name,
                self.opts.command_set,
                self.cap.css()
            );
            debug!("{}: Falling back to NVM. Assuming NVM is supported.", self.name);
            self.opts.command_set = CC_CSS_NVM;
        }

        cc.set_css(self.opts.command_set);

        match self.opts.arb_mechanism {
            ArbMechanism::RoundRobin => {}
            ArbMechanism::WeightedRoundRobin => {
                if self.cap.ams() & CAP_AMS_WRR == 0 {
                    return Err(NvmeError::InvalidParam {
                        source: Errno::EINVAL,
                    });
                }
            }
            ArbMechanism::VendorSpecific => {
                if self.cap.ams() & CAP_AMS_VS == 0 {
                    return Err(NvmeError::InvalidParam {
                        source: Errno::EINVAL,
                    });
                }
            }
        }

        cc.set_ams(self.opts.arb_mechanism as u8);
        self.process_init_cc = cc;

        if let Err(e) = self.set_cc_async(cc, RegisterCookie::EnableWriteCc) {
            error!("{}: set_cc() failed", self.name);
            return Err(e);
        }

        Ok(())
    }

    /// Dispatches register completions belonging to the init machine.
    pub(crate) fn init_register_done(
        &mut self,
        cookie: RegisterCookie,
        value: u64,
        status: Result<(), Errno>,
    ) {
        use NvmeControllerState::*;

        match cookie {
            RegisterCookie::ReadVs => {
                if status.is_err() {
                    error!("{}: Failed to read the VS register", self.name);
                    self.set_error_state();
                    return;
                }
                self.vs = Vs(value as u32);
                self.sm.set_state(ReadCap, StateTimeout::Infinite);
            }

            RegisterCookie::ReadCap => {
                if status.is_err() {
                    error!("{}: Failed to read the CAP register", self.name);
                    self.set_error_state();
                    return;
                }
                self.cap = Cap(value);
                self.init_cap();
                self.sm.set_state(CheckEn, StateTimeout::Infinite);
            }

            RegisterCookie::CheckEnReadCc => {
                if status.is_err() {
                    error!("{}: Failed to read the CC register", self.name);
                    self.set_error_state();
                    return;
                }

                self.process_init_cc = Cc(value as u32);
                let ready_timeout = self.ready_timeout_ms();

                let state = if self.process_init_cc.en() {
                    debug!("{}: CC.EN = 1", self.name);
                    DisableWaitForReady1
                } else {
                    DisableWaitForReady0
                };
                self.sm.set_state(state, StateTimeout::Ms(ready_timeout));
            }

            RegisterCookie::SetEn0ReadCc => {
                if status.is_err() {
                    error!("{}: Failed to read the CC register", self.name);
                    self.set_error_state();
                    return;
                }

                let mut cc = Cc(value as u32);
                cc.set_en(false);
                self.process_init_cc = cc;

                let ready_timeout = self.ready_timeout_ms();
                self.sm
                    .set_state(SetEn0WaitForCc, StateTimeout::Ms(ready_timeout));

                if let Err(e) = self.set_cc_async(cc, RegisterCookie::SetEn0WriteCc) {
                    error!("{}: set_cc() failed: {}", self.name, e);
                    self.set_error_state();
                }
            }

            RegisterCookie::SetEn0WriteCc => {
                if status.is_err() {
                    error!("{}: Failed to write the CC register", self.name);
                    self.set_error_state();
                    return;
                }

                if self.quirks.contains(Quirks::DELAY_BEFORE_CHK_RDY) {
                    debug!(
                        "{}: Applying quirk: delay 2.5 seconds before reading registers",
                        self.name
                    );
                    self.sleep_deadline = Some(Instant::now() + Duration::from_millis(2500));
                }

                let ready_timeout = self.ready_timeout_ms();
                self.sm
                    .set_state(DisableWaitForReady0, StateTimeout::Ms(ready_timeout));
            }

            RegisterCookie::DisableReady1ReadCsts => {
                if status.is_err() {
                    self.csts_read_failed(DisableWaitForReady1);
                    return;
                }

                let csts = Csts(value as u32);
                if csts.rdy() || csts.cfs() {
                    let ready_timeout = self.ready_timeout_ms();
                    self.sm
                        .set_state(SetEn0, StateTimeout::Ms(ready_timeout));
                } else {
                    debug!(
                        "{}: CC.EN = 1 && CSTS.RDY = 0 - waiting for reset to complete",
                        self.name
                    );
                    self.sm
                        .set_state_quiet(DisableWaitForReady1, StateTimeout::KeepExisting);
                }
            }

            RegisterCookie::DisableReady0ReadCsts => {
                if status.is_err() {
                    self.csts_read_failed(DisableWaitForReady0);
                    return;
                }

                let csts = Csts(value as u32);
                if !csts.rdy() {
                    debug!("{}: CC.EN = 0 && CSTS.RDY = 0", self.name);
                    let ready_timeout = self.ready_timeout_ms();
                    self.sm.set_state(Enable, StateTimeout::Ms(ready_timeout));
                    // Some SSDs miss CC.EN being set to 1 too soon after
                    // CSTS.RDY went to 0.
                    std::thread::sleep(Duration::from_micros(100));
                } else {
                    self.sm
                        .set_state_quiet(DisableWaitForReady0, StateTimeout::KeepExisting);
                }
            }

            RegisterCookie::EnableWriteCc => {
                if status.is_err() {
                    error!("{}: Failed to set the CC register", self.name);
                    self.set_error_state();
                    return;
                }
                let ready_timeout = self.ready_timeout_ms();
                self.sm
                    .set_state(EnableWaitForReady1, StateTimeout::Ms(ready_timeout));
            }

            RegisterCookie::EnableReady1ReadCsts => {
                if status.is_err() {
                    self.csts_read_failed(EnableWaitForReady1);
                    return;
                }

                let csts = Csts(value as u32);
                if csts.rdy() {
                    debug!(
                        "{}: CC.EN = 1 && CSTS.RDY = 1 - controller is ready",
                        self.name
                    );
                    // The controller is enabled; the rest of initialization
                    // runs serially over the admin queue.
                    self.sm
                        .set_state(ResetAdminQueue, self.admin_timeout());
                } else {
                    self.sm
                        .set_state_quiet(EnableWaitForReady1, StateTimeout::KeepExisting);
                }
            }

            _ => {
                warn!("{}: unexpected register completion {:?}", self.name, cookie);
            }
        }
    }

    /// A device being reset may be unable to service MMIO reads temporarily.
    /// Retry as long as a finite deadline is armed for the state.
    fn csts_read_failed(&mut self, retry_state: NvmeControllerState) {
        if !self.is_failed() && self.sm.deadline_armed() {
            debug!("{}: Failed to read the CSTS register", self.name);
            self.sm.set_state(retry_state, StateTimeout::KeepExisting);
        } else {
            error!("{}: Failed to read the CSTS register", self.name);
            self.set_error_state();
        }
    }

    // -- admin-driven init steps -------------------------------------------

    /// Dispatches an init-step admin completion against the waiting state.
    pub(crate) fn init_admin_done(&mut self, cpl: Completion, payload: Option<DmaBuffer>) {
        use NvmeControllerState::*;

        match self.sm.current_state() {
            WaitForIdentify => self.identify_done(cpl, payload),
            WaitForConfigureAer => self.configure_aer_done(cpl),
            WaitForKeepAliveTimeout => self.set_keep_alive_timeout_done(cpl),
            WaitForIdentifyIocsSpecific => self.identify_iocs_specific_done(cpl, payload),
            WaitForGetZnsCmdEffectsLog => self.zns_cmd_effects_log_done(cpl, payload),
            WaitForSetNumQueues => self.set_num_queues_done(cpl),
            WaitForIdentifyNs => self.identify_ns_done(cpl, payload),
            WaitForIdentifyIdDescs => self.identify_id_descs_done(cpl, payload),
            WaitForIdentifyNsIocsSpecific => self.identify_ns_iocs_specific_done(cpl, payload),
            WaitForSupportedIntelLogPages => self.intel_log_pages_done(cpl, payload),
            WaitForDbBufCfg => self.db_buf_cfg_done(cpl),
            WaitForHostId => self.host_id_done(cpl),
            state => {
                warn!(
                    "{}: stray init admin completion in state {}",
                    self.name,
                    state.as_str()
                );
            }
        }
    }

    fn ctrlr_identify(&mut self) -> Result<(), NvmeError> {
        self.sm
            .set_state(NvmeControllerState::WaitForIdentify, self.admin_timeout());

        let cmd = self.cmd_identify(IdentifyCns::Ctrlr, 0, 0, 0);
        let payload = Payload::DataIn(DmaBuffer::new(std::mem::size_of::<
            IdentifyControllerData,
        >()));

        match self.submit_admin(cmd, payload, AdminSink::Init) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_error_state();
                Err(e)
            }
        }
    }

    fn identify_done(&mut self, cpl: Completion, payload: Option<DmaBuffer>) {
        if cpl.is_error() {
            error!("{}: identify controller failed!", self.name);
            self.set_error_state();
            return;
        }

        let payload = payload.expect("identify controller payload");
        self.cdata = IdentifyControllerData::from_bytes(payload.as_slice());

        // MDTS bounds our default transfer size.
        self.max_xfer_size = self.transport.max_xfer_size();
        debug!("{}: transport max_xfer_size {}", self.name, self.max_xfer_size);
        if self.cdata.mdts > 0 {
            self.max_xfer_size = self
                .max_xfer_size
                .min(self.min_page_size << self.cdata.mdts);
            debug!("{}: MDTS max_xfer_size {}", self.name, self.max_xfer_size);
        }

        debug!("{}: CNTLID 0x{:04x}", self.name, self.cdata.cntlid);
        if self.trid.trtype == TransportType::Pcie {
            self.cntlid = self.cdata.cntlid;
        } else if self.cntlid != self.cdata.cntlid {
            // Fabrics controllers already have CNTLID from Connect; trust it.
            debug!(
                "{}: Identify CNTLID 0x{:04x} != Connect CNTLID 0x{:04x}",
                self.name, self.cdata.cntlid, self.cntlid
            );
        }

        if self.cdata.sgls_supported() != 0 {
            assert_ne!(self.cdata.sgls_supported(), 0x3);
            self.flags.insert(CtrlrFlags::SGL_SUPPORTED);
            if self.cdata.sgls_supported() == 0x2 {
                self.flags.insert(CtrlrFlags::SGL_REQUIRES_DWORD_ALIGNMENT);
            }

            // MSDBD bounds our max_sges; zero means no limit.
            self.max_sges = self.transport.max_sges();
            if self.cdata.msdbd != 0 {
                self.max_sges = self.max_sges.min(self.cdata.msdbd as u16);
            }
            debug!("{}: transport max_sges {}", self.name, self.max_sges);
        }

        if self.cdata.oacs_security() && !self.quirks.contains(Quirks::OACS_SECURITY) {
            self.flags.insert(CtrlrFlags::SECURITY_SEND_RECV_SUPPORTED);
        }

        if self.cdata.oacs_directives() {
            self.flags.insert(CtrlrFlags::DIRECTIVES_SUPPORTED);
        }

        debug!(
            "{}: fuses compare and write: {}",
            self.name,
            self.cdata.fuses_compare_and_write()
        );
        if self.cdata.fuses_compare_and_write() {
            self.flags.insert(CtrlrFlags::COMPARE_AND_WRITE_SUPPORTED);
        }

        self.sm
            .set_state(NvmeControllerState::ConfigureAer, self.admin_timeout());
    }

    fn configure_aer(&mut self) -> Result<(), NvmeError> {
        let mut config = AsyncEventConfig::default();

        if self.is_discovery() {
            config.set_discovery_log_change_notice();
        } else {
            config.set_crit_warn_available_spare();
            config.set_crit_warn_temperature();
            config.set_crit_warn_device_reliability();
            config.set_crit_warn_read_only();
            config.set_crit_warn_volatile_memory_backup();

            if self.vs >= VS_1_2 {
                if self.cdata.oaes_ns_attribute_notices() {
                    config.set_ns_attr_notice();
                }
                if self.cdata.oaes_fw_activation_notices() {
                    config.set_fw_activation_notice();
                }
                if self.cdata.oaes_ana_change_notices() {
                    config.set_ana_change_notice();
                }
            }
            if self.vs >= VS_1_3 && self.cdata.lpa_telemetry() {
                config.set_telemetry_log_notice();
            }
        }

        self.sm
            .set_state(NvmeControllerState::WaitForConfigureAer, self.admin_timeout());

        let cmd = self.cmd_set_features(feat::ASYNC_EVENT_CONFIGURATION, config.0, 0);
        match self.submit_admin(cmd, Payload::None, AdminSink::Init) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_error_state();
                Err(e)
            }
        }
    }

    fn configure_aer_done(&mut self, cpl: Completion) {
        if cpl.is_error() {
            info!("{}: configuring asynchronous event requests failed!", self.name);
            self.num_aers = 0;
        } else {
            // aerl is zero-based.
            self.num_aers = crate::controller::MAX_ASYNC_EVENTS.min(self.cdata.aerl as u32 + 1);
        }

        self.aer_slots = (0..self.num_aers).map(|_| None).collect();
        for slot in 0..self.num_aers as usize {
            if let Err(e) = self.submit_aer(slot) {
                error!("{}: submitting asynchronous event request failed: {}", self.name, e);
                self.set_error_state();
                return;
            }
        }

        self.sm.set_state(
            NvmeControllerState::SetKeepAliveTimeout,
            self.admin_timeout(),
        );
    }

    fn keep_alive_next_state(&mut self) {
        if self.is_discovery() {
            self.sm
                .set_state(NvmeControllerState::Ready, StateTimeout::Infinite);
        } else {
            self.sm.set_state(
                NvmeControllerState::IdentifyIocsSpecific,
                self.admin_timeout(),
            );
        }
    }

    fn set_keep_alive_timeout(&mut self) -> Result<(), NvmeError> {
        if self.opts.keep_alive_timeout_ms == 0 {
            self.keep_alive_next_state();
            return Ok(());
        }

        // Discovery controller identify data does not populate KAS.
        if !self.is_discovery() && self.cdata.kas == 0 {
            debug!("{}: Controller KAS is 0 - not enabling Keep Alive", self.name);
            self.opts.keep_alive_timeout_ms = 0;
            self.keep_alive_next_state();
            return Ok(());
        }

        self.sm.set_state(
            NvmeControllerState::WaitForKeepAliveTimeout,
            self.admin_timeout(),
        );

        // The controller may have adjusted the timeout; retrieve the actual
        // value.
        let cmd = self.cmd_get_features(feat::KEEP_ALIVE_TIMER, 0);
        match self.submit_admin(cmd, Payload::None, AdminSink::Init) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("{}: Keep alive timeout Get Feature failed: {}", self.name, e);
                self.opts.keep_alive_timeout_ms = 0;
                self.set_error_state();
                Err(e)
            }
        }
    }

    fn set_keep_alive_timeout_done(&mut self, cpl: Completion) {
        if cpl.is_error() {
            if cpl.status.sct == StatusCodeType::Generic as u8
                && cpl.status.sc == GenericStatusCode::InvalidField as u8
            {
                debug!(
                    "{}: Keep alive timeout Get Feature is not supported",
                    self.name
                );
            } else {
                error!(
                    "{}: Keep alive timeout Get Feature failed: {}",
                    self.name, cpl.status
                );
                self.opts.keep_alive_timeout_ms = 0;
                self.set_error_state();
                return;
            }
        } else {
            if self.opts.keep_alive_timeout_ms != cpl.cdw0 {
                debug!(
                    "{}: Controller adjusted keep alive timeout to {} ms",
                    self.name, cpl.cdw0
                );
            }
            self.opts.keep_alive_timeout_ms = cpl.cdw0;
        }

        if self.opts.keep_alive_timeout_ms == 0 {
            self.keep_alive_interval = None;
        } else {
            let interval_us = self.opts.keep_alive_timeout_ms as u64 * 1000 / 2;
            debug!("{}: Sending keep alive every {} us", self.name, interval_us);
            self.keep_alive_interval = Some(Duration::from_micros(interval_us));
            // First keep alive goes out as soon as possible.
            self.next_keep_alive = Instant::now();
        }

        self.keep_alive_next_state();
    }

    pub(crate) fn multi_iocs_enabled(&self) -> bool {
        self.cap.css() & CAP_CSS_IOCS != 0 && self.opts.command_set == CC_CSS_IOCS
    }

    /// Fetches the ZNS IOCS-specific controller data. Fetching is
    /// exploratory: "invalid field" simply means the set is absent.
    fn identify_iocs_specific(&mut self) -> Result<(), NvmeError> {
        if !self.multi_iocs_enabled() {
            self.sm
                .set_state(NvmeControllerState::SetNumQueues, self.admin_timeout());
            return Ok(());
        }

        self.sm.set_state(
            NvmeControllerState::WaitForIdentifyIocsSpecific,
            self.admin_timeout(),
        );

        let cmd = self.cmd_identify(IdentifyCns::CtrlrIocs, 0, 0, Csi::Zns as u8);
        let payload = Payload::DataIn(DmaBuffer::new(std::mem::size_of::<ZnsCtrlrData>()));
        match self.submit_admin(cmd, payload, AdminSink::Init) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_error_state();
                self.free_iocs_specific_data();
                Err(e)
            }
        }
    }

    fn identify_iocs_specific_done(&mut self, cpl: Completion, payload: Option<DmaBuffer>) {
        if cpl.is_error() {
            // The controller simply does not support ZNS.
            self.free_iocs_specific_data();
            self.sm
                .set_state(NvmeControllerState::SetNumQueues, self.admin_timeout());
            return;
        }

        let payload = payload.expect("identify iocs payload");
        let cdata_zns = ZnsCtrlrData::from_bytes(payload.as_slice());

        // A zero zasl means use mdts.
        if cdata_zns.zasl != 0 {
            let max_append = self.min_page_size << cdata_zns.zasl;
            self.max_zone_append_size = self.max_xfer_size.min(max_append);
        } else {
            self.max_zone_append_size = self.max_xfer_size;
        }
        self.cdata_zns = Some(Box::new(cdata_zns));

        self.sm.set_state(
            NvmeControllerState::GetZnsCmdEffectsLog,
            self.admin_timeout(),
        );
    }

    fn get_zns_cmd_and_effects_log(&mut self) -> Result<(), NvmeError> {
        self.sm.set_state(
            NvmeControllerState::WaitForGetZnsCmdEffectsLog,
            self.admin_timeout(),
        );

        let len = std::mem::size_of::<CommandsAndEffectsLogPage>();
        let cmd = self.cmd_get_log_page_ext(
            log_page::COMMAND_EFFECTS_LOG,
            0,
            len as u32,
            Csi::Zns as u8,
        );
        let payload = Payload::DataIn(DmaBuffer::new(len));
        match self.submit_admin(cmd, payload, AdminSink::Init) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_error_state();
                Err(e)
            }
        }
    }

    fn zns_cmd_effects_log_done(&mut self, cpl: Completion, payload: Option<DmaBuffer>) {
        if cpl.is_error() {
            error!("{}: reading the ZNS command effects log failed!", self.name);
            self.set_error_state();
            return;
        }

        let payload = payload.expect("zns effects log payload");
        let page = CommandsAndEffectsLogPage::from_bytes(payload.as_slice());
        if page.io_cmd_supported(OPC_ZONE_APPEND) {
            self.flags.insert(CtrlrFlags::ZONE_APPEND_SUPPORTED);
        }

        self.sm
            .set_state(NvmeControllerState::SetNumQueues, self.admin_timeout());
    }

    /// In-capsule data sizing for fabrics transports.
    fn update_nvmf_ioccsz(&mut self) {
        if matches!(
            self.trid.trtype,
            TransportType::Rdma | TransportType::Tcp | TransportType::Fc
        ) {
            let mut ioccsz = self.cdata.ioccsz;
            if ioccsz < 4 {
                error!(
                    "{}: Incorrect IOCCSZ {}, the minimum value should be 4",
                    self.name, ioccsz
                );
                ioccsz = 4;
            }
            self.ioccsz_bytes = ioccsz * 16 - 64;
            self.icdoff = self.cdata.icdoff;
        }
    }

    fn set_num_queues(&mut self) -> Result<(), NvmeError> {
        if self.opts.num_io_queues > MAX_IO_QUEUES {
            info!(
                "{}: Limiting requested num_io_queues {} to max {}",
                self.name, self.opts.num_io_queues, MAX_IO_QUEUES
            );
            self.opts.num_io_queues = MAX_IO_QUEUES;
        } else if self.opts.num_io_queues < 1 {
            info!("{}: Requested num_io_queues 0, increasing to 1", self.name);
            self.opts.num_io_queues = 1;
        }

        self.sm
            .set_state(NvmeControllerState::WaitForSetNumQueues, self.admin_timeout());

        let n = self.opts.num_io_queues - 1;
        let cmd = self.cmd_set_features(feat::NUMBER_OF_QUEUES, n | (n << 16), 0);
        match self.submit_admin(cmd, Payload::None, AdminSink::Init) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_error_state();
                Err(e)
            }
        }
    }

    fn set_num_queues_done(&mut self, cpl: Completion) {
        if cpl.is_error() {
            error!("{}: Set Features - Number of Queues failed!", self.name);
            self.opts.num_io_queues = 0;
        } else {
            // cdw0 is zero-based: lower 16 bits submission queues, upper 16
            // completion queues.
            let sq_allocated = (cpl.cdw0 & 0xffff) + 1;
            let cq_allocated = (cpl.cdw0 >> 16) + 1;
            let min_allocated = sq_allocated.min(cq_allocated);
            self.opts.num_io_queues = min_allocated.min(self.opts.num_io_queues);
        }

        // qid 0 is the admin queue, implicitly allocated.
        let mut bits = BitVec::from_elem(self.opts.num_io_queues as usize + 1, false);
        for qid in 1..=self.opts.num_io_queues as usize {
            bits.set(qid, true);
        }
        self.free_io_qids = Some(bits);

        self.sm
            .set_state(NvmeControllerState::IdentifyActiveNs, self.admin_timeout());
    }

    // -- active namespace scan ---------------------------------------------

    fn identify_active_ns_init(&mut self) {
        if self.cdata.nn == 0 {
            self.finish_active_ns(Vec::new());
            return;
        }

        // Controllers predating CNS 0x02 get a synthesized list: every
        // namespace up to NN reports as active.
        if self.vs < VS_1_1 || self.quirks.contains(Quirks::IDENTIFY_CNS) {
            let list: Vec<u32> = (1..=self.cdata.nn).collect();
            self.finish_active_ns(list);
            return;
        }

        self.active_ns_ctx = Some(ActiveNsCtx {
            page_count: 0,
            next_nsid: 0,
            new_ns_list: Vec::new(),
        });

        self.sm.set_state(
            NvmeControllerState::WaitForIdentifyActiveNs,
            self.admin_timeout(),
        );

        if let Err(e) = self.submit_active_ns_page() {
            error!("{}: failed to submit active ns identify: {}", self.name, e);
            self.active_ns_ctx = None;
            self.set_error_state();
        }
    }

    fn submit_active_ns_page(&mut self) -> Result<(), NvmeError> {
        let next_nsid = self
            .active_ns_ctx
            .as_ref()
            .map(|ctx| ctx.next_nsid)
            .expect("active ns scan in progress");

        let cmd = self.cmd_identify(IdentifyCns::ActiveNsList, 0, next_nsid, 0);
        let payload = Payload::DataIn(DmaBuffer::new(std::mem::size_of::<NsListPage>()));
        self.submit_admin(cmd, payload, AdminSink::ActiveNs)?;
        Ok(())
    }

    pub(crate) fn active_ns_page_done(&mut self, cpl: Completion, payload: Option<DmaBuffer>) {
        if self.active_ns_ctx.is_none() {
            warn!("{}: active ns completion without a scan in progress", self.name);
            return;
        }

        if cpl.is_error() {
            self.active_ns_ctx = None;
            self.set_error_state();
            return;
        }

        let payload = payload.expect("active ns list payload");
        let page = NsListPage::from_bytes(payload.as_slice());

        let last = page.nsid[page.nsid.len() - 1];
        {
            let ctx = self.active_ns_ctx.as_mut().unwrap();
            ctx.page_count += 1;
            ctx.new_ns_list
                .extend(page.nsid.iter().copied().take_while(|nsid| *nsid != 0));
            ctx.next_nsid = last;
        }

        if last == 0 {
            let list = self.active_ns_ctx.take().unwrap().new_ns_list;
            self.finish_active_ns(list);
            return;
        }

        if let Err(e) = self.submit_active_ns_page() {
            error!("{}: failed to request next active ns page: {}", self.name, e);
            self.active_ns_ctx = None;
            self.set_error_state();
        }
    }

    fn finish_active_ns(&mut self, new_list: Vec<u32>) {
        // IOCS specific data is refetched per namespace after the swap.
        for ns in self.ns.values_mut() {
            ns.free_iocs_specific_data();
        }

        self.active_ns_swap(&new_list);
        self.sm
            .set_state(NvmeControllerState::IdentifyNs, self.admin_timeout());
    }

    /// Applies a freshly fetched active-namespace list: namespaces that
    /// disappeared are destructed (kept in the map, inactive), new ones are
    /// constructed on demand. Diffs strictly against the map.
    pub(crate) fn active_ns_swap(&mut self, new_list: &[u32]) {
        let name = self.name.clone();

        for (nsid, ns) in self.ns.iter_mut() {
            if !new_list.contains(nsid) {
                debug!("{}: Namespace {} was removed", name, nsid);
                ns.destruct();
            }
        }

        let mut active_ns_count = 0u32;
        for nsid in new_list {
            if *nsid == 0 {
                break;
            }
            match self.get_ns(*nsid) {
                Some(ns) => {
                    ns.active = true;
                    active_ns_count += 1;
                }
                None => {
                    debug!("{}: Failed to allocate a namespace object.", name);
                }
            }
        }

        self.active_ns_count = active_ns_count;
    }

    // -- per-namespace identify chains -------------------------------------

    fn identify_namespaces(&mut self) -> Result<(), NvmeError> {
        let nsid = self.first_active_ns();
        if nsid == 0 {
            // No active NS, move on to the next state.
            self.sm
                .set_state(NvmeControllerState::IdentifyIdDescs, self.admin_timeout());
            return Ok(());
        }

        self.init_ns_cursor = nsid;
        self.identify_ns_async(nsid).map_err(|e| {
            self.set_error_state();
            e
        })
    }

    fn identify_ns_async(&mut self, nsid: u32) -> Result<(), NvmeError> {
        self.sm
            .set_state(NvmeControllerState::WaitForIdentifyNs, self.admin_timeout());

        let cmd = self.cmd_identify(IdentifyCns::Ns, 0, nsid, 0);
        let payload = Payload::DataIn(DmaBuffer::new(std::mem::size_of::<IdentifyNsData>()));
        self.submit_admin(cmd, payload, AdminSink::Init)?;
        Ok(())
    }

    fn identify_ns_done(&mut self, cpl: Completion, payload: Option<DmaBuffer>) {
        if cpl.is_error() {
            self.set_error_state();
            return;
        }

        let payload = payload.expect("identify ns payload");
        let nsdata = IdentifyNsData::from_bytes(payload.as_slice());

        let cursor = self.init_ns_cursor;
        if let Some(ns) = self.get_ns(cursor) {
            ns.set_identify_data(nsdata);
        }

        let next = self.next_active_ns(cursor);
        if next == 0 {
            self.sm
                .set_state(NvmeControllerState::IdentifyIdDescs, self.admin_timeout());
            return;
        }

        self.init_ns_cursor = next;
        if self.identify_ns_async(next).is_err() {
            self.set_error_state();
        }
    }

    fn identify_id_desc_namespaces(&mut self) -> Result<(), NvmeError> {
        if (self.vs < VS_1_3 && self.cap.css() & CAP_CSS_IOCS == 0)
            || self.quirks.contains(Quirks::IDENTIFY_CNS)
        {
            debug!(
                "{}: Version < 1.3; not attempting to retrieve NS ID Descriptor List",
                self.name
            );
            self.sm.set_state(
                NvmeControllerState::IdentifyNsIocsSpecific,
                self.admin_timeout(),
            );
            return Ok(());
        }

        let nsid = self.first_active_ns();
        if nsid == 0 {
            self.sm.set_state(
                NvmeControllerState::IdentifyNsIocsSpecific,
                self.admin_timeout(),
            );
            return Ok(());
        }

        self.init_ns_cursor = nsid;
        self.identify_id_desc_async(nsid).map_err(|e| {
            self.set_error_state();
            e
        })
    }

    fn identify_id_desc_async(&mut self, nsid: u32) -> Result<(), NvmeError> {
        self.sm.set_state(
            NvmeControllerState::WaitForIdentifyIdDescs,
            self.admin_timeout(),
        );

        let cmd = self.cmd_identify(IdentifyCns::NsIdDescriptorList, 0, nsid, 0);
        let payload = Payload::DataIn(DmaBuffer::new(crate::namespace::ID_DESC_LIST_SIZE));
        self.submit_admin(cmd, payload, AdminSink::Init)?;
        Ok(())
    }

    fn identify_id_descs_done(&mut self, cpl: Completion, payload: Option<DmaBuffer>) {
        if cpl.is_error() {
            // Plenty of controllers claim 1.3 compliance without
            // implementing the NS ID Descriptor List; ignore the error and
            // move on.
            self.sm.set_state(
                NvmeControllerState::IdentifyNsIocsSpecific,
                self.admin_timeout(),
            );
            return;
        }

        let payload = payload.expect("id descriptor payload");
        let cursor = self.init_ns_cursor;
        if let Some(ns) = self.get_ns(cursor) {
            ns.set_id_desc_list_data(payload.as_slice());
        }

        let next = self.next_active_ns(cursor);
        if next == 0 {
            self.sm.set_state(
                NvmeControllerState::IdentifyNsIocsSpecific,
                self.admin_timeout(),
            );
            return;
        }

        self.init_ns_cursor = next;
        if self.identify_id_desc_async(next).is_err() {
            self.set_error_state();
        }
    }

    fn identify_namespaces_iocs_specific(&mut self) -> Result<(), NvmeError> {
        if !self.multi_iocs_enabled() {
            self.sm.set_state(
                NvmeControllerState::SetSupportedLogPages,
                self.admin_timeout(),
            );
            return Ok(());
        }

        self.identify_ns_iocs_specific_next(0)
    }

    /// Advances the per-namespace IOCS identify chain past `prev_nsid`,
    /// skipping namespaces whose command set has no specific data.
    fn identify_ns_iocs_specific_next(&mut self, prev_nsid: u32) -> Result<(), NvmeError> {
        let mut nsid = if prev_nsid == 0 {
            self.first_active_ns()
        } else {
            self.next_active_ns(prev_nsid)
        };

        while nsid != 0 {
            let supported = self
                .ns(nsid)
                .map_or(false, |ns| ns.has_supported_iocs_specific_data());
            if supported {
                break;
            }
            nsid = self.next_active_ns(nsid);
        }

        if nsid == 0 {
            self.sm.set_state(
                NvmeControllerState::SetSupportedLogPages,
                self.admin_timeout(),
            );
            return Ok(());
        }

        self.init_ns_cursor = nsid;

        self.sm.set_state(
            NvmeControllerState::WaitForIdentifyNsIocsSpecific,
            self.admin_timeout(),
        );

        let cmd = self.cmd_identify(IdentifyCns::NsIocs, 0, nsid, Csi::Zns as u8);
        let payload = Payload::DataIn(DmaBuffer::new(std::mem::size_of::<ZnsNsData>()));
        match self.submit_admin(cmd, payload, AdminSink::Init) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_error_state();
                Err(e)
            }
        }
    }

    fn identify_ns_iocs_specific_done(&mut self, cpl: Completion, payload: Option<DmaBuffer>) {
        let cursor = self.init_ns_cursor;

        if cpl.is_error() {
            if let Some(ns) = self.get_ns(cursor) {
                ns.free_iocs_specific_data();
            }
            self.set_error_state();
            return;
        }

        let payload = payload.expect("identify ns iocs payload");
        let data = ZnsNsData::from_bytes(payload.as_slice());
        if let Some(ns) = self.get_ns(cursor) {
            ns.nsdata_zns = Some(Box::new(data));
        }

        if self.identify_ns_iocs_specific_next(cursor).is_err() {
            self.set_error_state();
        }
    }

    // -- supported log pages / features ------------------------------------

    fn set_supported_log_pages(&mut self) -> Result<(), NvmeError> {
        let mut rc = Ok(());

        self.log_page_supported = [false; 256];
        // Mandatory pages.
        self.log_page_supported[log_page::ERROR as usize] = true;
        self.log_page_supported[log_page::HEALTH_INFORMATION as usize] = true;
        self.log_page_supported[log_page::FIRMWARE_SLOT as usize] = true;
        if self.cdata.lpa_celp() {
            self.log_page_supported[log_page::COMMAND_EFFECTS_LOG as usize] = true;
        }

        if self.cdata.cmic_ana_reporting() {
            self.log_page_supported[log_page::ASYMMETRIC_NAMESPACE_ACCESS as usize] = true;
            if !self.opts.disable_read_ana_log_page {
                rc = self.init_ana_log_page();
                if rc.is_ok() {
                    self.parse_and_apply_ana_states();
                }
            }
        }

        if self.cdata.vid == PCI_VID_INTEL && !self.quirks.contains(Quirks::INTEL_NO_LOG_PAGES) {
            self.sm.set_state(
                NvmeControllerState::SetSupportedIntelLogPages,
                self.admin_timeout(),
            );
        } else {
            self.sm.set_state(
                NvmeControllerState::SetSupportedFeatures,
                self.admin_timeout(),
            );
        }

        rc
    }

    fn set_intel_support_log_pages(&mut self) -> Result<(), NvmeError> {
        let len = std::mem::size_of::<IntelLogPageDirectory>();
        let cmd = self.cmd_get_log_page(log_page::intel::PAGE_DIRECTORY, GLOBAL_NS_TAG, len as u32);
        let payload = Payload::DataIn(DmaBuffer::new(len));

        match self.submit_admin(cmd, payload, AdminSink::Init) {
            Ok(_) => {
                self.sm.set_state(
                    NvmeControllerState::WaitForSupportedIntelLogPages,
                    self.admin_timeout(),
                );
            }
            Err(_) => {
                // Vendor pages are best effort.
                self.sm.set_state(
                    NvmeControllerState::SetSupportedFeatures,
                    self.admin_timeout(),
                );
            }
        }

        Ok(())
    }

    fn intel_log_pages_done(&mut self, cpl: Completion, payload: Option<DmaBuffer>) {
        if !cpl.is_error() {
            if let Some(payload) = payload {
                let directory = IntelLogPageDirectory::from_bytes(payload.as_slice());
                self.construct_intel_support_log_page_list(&directory);
            }
        }

        self.sm.set_state(
            NvmeControllerState::SetSupportedFeatures,
            self.admin_timeout(),
        );
    }

    fn construct_intel_support_log_page_list(&mut self, directory: &IntelLogPageDirectory) {
        if self.cdata.vid != PCI_VID_INTEL {
            return;
        }

        self.log_page_supported[log_page::intel::PAGE_DIRECTORY as usize] = true;

        if directory.read_latency_log_len != 0 || self.quirks.contains(Quirks::INTEL_READ_LATENCY)
        {
            self.log_page_supported[log_page::intel::READ_CMD_LATENCY as usize] = true;
        }
        if directory.write_latency_log_len != 0
            || self.quirks.contains(Quirks::INTEL_WRITE_LATENCY)
        {
            self.log_page_supported[log_page::intel::WRITE_CMD_LATENCY as usize] = true;
        }
        if directory.temperature_statistics_log_len != 0 {
            self.log_page_supported[log_page::intel::TEMPERATURE as usize] = true;
        }
        if directory.smart_log_len != 0 {
            self.log_page_supported[log_page::intel::SMART as usize] = true;
        }
        if directory.marketing_description_log_len != 0 {
            self.log_page_supported[log_page::intel::MARKETING_DESCRIPTION as usize] = true;
        }
    }

    fn set_supported_features(&mut self) {
        self.feature_supported = [false; 256];
        // Mandatory features.
        self.feature_supported[feat::ARBITRATION as usize] = true;
        self.feature_supported[feat::POWER_MANAGEMENT as usize] = true;
        self.feature_supported[feat::TEMPERATURE_THRESHOLD as usize] = true;
        self.feature_supported[feat::ERROR_RECOVERY as usize] = true;
        self.feature_supported[feat::NUMBER_OF_QUEUES as usize] = true;
        self.feature_supported[feat::INTERRUPT_COALESCING as usize] = true;
        self.feature_supported[feat::INTERRUPT_VECTOR_CONFIGURATION as usize] = true;
        self.feature_supported[feat::WRITE_ATOMICITY as usize] = true;
        self.feature_supported[feat::ASYNC_EVENT_CONFIGURATION as usize] = true;
        // Optional features.
        if self.cdata.vwc_present() {
            self.feature_supported[feat::VOLATILE_WRITE_CACHE as usize] = true;
        }
        if self.cdata.apsta_supported() {
            self.feature_supported[feat::AUTONOMOUS_POWER_STATE_TRANSITION as usize] = true;
        }
        if self.cdata.hmpre != 0 {
            self.feature_supported[feat::HOST_MEM_BUFFER as usize] = true;
        }
        if self.cdata.vid == PCI_VID_INTEL {
            self.feature_supported[feat::intel::MAX_LBA as usize] = true;
            self.feature_supported[feat::intel::NATIVE_MAX_LBA as usize] = true;
            self.feature_supported[feat::intel::POWER_GOVERNOR_SETTING as usize] = true;
            self.feature_supported[feat::intel::SMBUS_ADDRESS as usize] = true;
            self.feature_supported[feat::intel::LED_PATTERN as usize] = true;
            self.feature_supported[feat::intel::RESET_TIMED_WORKLOAD_COUNTERS as usize] = true;
            self.feature_supported[feat::intel::LATENCY_TRACKING as usize] = true;
        }

        self.set_arbitration_feature();
    }

    fn set_doorbell_buffer_config(&mut self) -> Result<(), NvmeError> {
        if !self.cdata.oacs_doorbell_buffer_config() || self.trid.trtype != TransportType::Pcie {
            self.sm
                .set_state(NvmeControllerState::SetHostId, self.admin_timeout());
            return Ok(());
        }

        // One page each for the shadow doorbells and event indexes.
        let shadow = DmaBuffer::new(self.page_size as usize);
        let eventidx = DmaBuffer::new(self.page_size as usize);
        let prp1 = shadow.io_addr();
        let prp2 = eventidx.io_addr();
        self.shadow_doorbell = Some(shadow);
        self.eventidx = Some(eventidx);

        self.sm
            .set_state(NvmeControllerState::WaitForDbBufCfg, self.admin_timeout());

        let mut cmd = self.cmd_doorbell_buffer_config();
        cmd.prp1 = prp1;
        cmd.prp2 = prp2;

        match self.submit_admin(cmd, Payload::None, AdminSink::Init) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_error_state();
                self.free_doorbell_buffer();
                Err(e)
            }
        }
    }

    fn db_buf_cfg_done(&mut self, cpl: Completion) {
        if cpl.is_error() {
            warn!("{}: Doorbell buffer config failed", self.name);
        } else {
            info!("{}: Doorbell buffer config enabled", self.name);
        }
        self.sm
            .set_state(NvmeControllerState::SetHostId, self.admin_timeout());
    }

    fn set_host_id(&mut self) -> Result<(), NvmeError> {
        if self.trid.trtype != TransportType::Pcie {
            // NVMe-oF sends the host ID during Connect and does not allow
            // Set Features - Host Identifier afterwards.
            debug!(
                "{}: NVMe-oF transport - not sending Set Features - Host ID",
                self.name
            );
            self.sm
                .set_state(NvmeControllerState::Ready, StateTimeout::Infinite);
            return Ok(());
        }

        let (host_id, exhid): (&[u8], u32) = if self.cdata.ctratt_host_id_exhid_supported() {
            debug!("{}: Using 128-bit extended host identifier", self.name);
            (&self.opts.extended_host_id, 1)
        } else {
            debug!("{}: Using 64-bit host identifier", self.name);
            (&self.opts.host_id, 0)
        };

        if host_id.iter().all(|b| *b == 0) {
            debug!(
                "{}: User did not specify host ID - not sending Set Features - Host ID",
                self.name
            );
            self.sm
                .set_state(NvmeControllerState::Ready, StateTimeout::Infinite);
            return Ok(());
        }

        let payload = Payload::DataOut(DmaBuffer::from_slice(host_id));

        self.sm
            .set_state(NvmeControllerState::WaitForHostId, self.admin_timeout());

        let cmd = self.cmd_set_features(feat::HOST_IDENTIFIER, exhid, 0);
        match self.submit_admin(cmd, payload, AdminSink::Init) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("{}: Set Features - Host ID failed: {}", self.name, e);
                self.set_error_state();
                Err(e)
            }
        }
    }

    fn host_id_done(&mut self, cpl: Completion) {
        if cpl.is_error() {
            // The Host ID feature is optional; continue to ready.
            warn!(
                "{}: Set Features - Host ID failed: {}",
                self.name, cpl.status
            );
        } else {
            debug!("{}: Set Features - Host ID was successful", self.name);
        }

        self.sm
            .set_state(NvmeControllerState::Ready, StateTimeout::Infinite);
    }

    // -- ANA log page -------------------------------------------------------

    /// Grows the ANA buffer to fit the current group and namespace counts.
    pub(crate) fn alloc_ana_log_page(&mut self) -> Result<usize, NvmeError> {
        let needed = ana_log_page_size(self.cdata.nanagrpid, self.active_ns_count);
        if needed > self.ana_log_page.len() {
            self.ana_log_page.resize(needed, 0);
        }
        Ok(needed)
    }

    fn init_ana_log_page(&mut self) -> Result<(), NvmeError> {
        self.alloc_ana_log_page()?;
        self.update_ana_log_page()
    }

    /// Applies the buffered ANA log to the namespace map.
    pub(crate) fn parse_and_apply_ana_states(&mut self) {
        let mut descs = Vec::new();
        let rc = crate::pages::parse_ana_log_page(&self.ana_log_page, |desc| {
            descs.push(desc.clone());
            Ok(())
        });

        if let Err(e) = rc {
            warn!("{}: failed to parse ANA log page: {}", self.name, e);
            return;
        }

        let nn = self.cdata.nn;
        for desc in descs {
            let state = match desc.ana_state {
                Some(state) => state,
                None => continue,
            };
            for nsid in desc.nsids {
                if nsid == 0 || nsid > nn {
                    continue;
                }
                if let Some(ns) = self.get_ns(nsid) {
                    ns.ana_group_id = desc.ana_group_id;
                    ns.ana_state = state;
                }
            }
        }
    }

    // -- shutdown ------------------------------------------------------------

    /// Begins shutdown notification (or a plain disable when
    /// `no_shn_notification` is set).
    pub(crate) fn shutdown_async(&mut self) {
        if self.is_removed() {
            self.detach_ctx = Some(DetachCtx {
                state: DetachState::SetCc,
                shutdown_timeout: Duration::from_millis(0),
                shutdown_start: Instant::now(),
                csts: Csts(0),
                shutdown_complete: true,
            });
            return;
        }

        self.detach_ctx = Some(DetachCtx {
            state: DetachState::SetCc,
            shutdown_timeout: Duration::from_millis(0),
            shutdown_start: Instant::now(),
            csts: Csts(0),
            shutdown_complete: false,
        });

        if self
            .get_reg4_async(offsets::CC, RegisterCookie::ShutdownReadCc)
            .is_err()
        {
            error!("{}: Failed to read the CC register", self.name);
            if let Some(ctx) = self.detach_ctx.as_mut() {
                ctx.shutdown_complete = true;
            }
        }
    }

    pub(crate) fn shutdown_register_done(
        &mut self,
        cookie: RegisterCookie,
        value: u64,
        status: Result<(), Errno>,
    ) {
        match cookie {
            RegisterCookie::ShutdownReadCc => {
                if status.is_err() {
                    error!("{}: Failed to read the CC register", self.name);
                    if let Some(ctx) = self.detach_ctx.as_mut() {
                        ctx.shutdown_complete = true;
                    }
                    return;
                }

                let mut cc = Cc(value as u32);

                if self.opts.no_shn_notification {
                    info!("{}: Disable SSD without shutdown notification", self.name);
                    if !cc.en() {
                        if let Some(ctx) = self.detach_ctx.as_mut() {
                            ctx.shutdown_complete = true;
                        }
                        return;
                    }
                    cc.set_en(false);
                } else {
                    cc.set_shn(SHN_NORMAL);
                }

                if self
                    .transport
                    .set_reg4_async(offsets::CC, cc.0, RegisterCookie::ShutdownWriteCc)
                    .is_err()
                {
                    error!("{}: Failed to write CC.SHN", self.name);
                    if let Some(ctx) = self.detach_ctx.as_mut() {
                        ctx.shutdown_complete = true;
                    }
                }
            }

            RegisterCookie::ShutdownWriteCc => {
                if status.is_err() {
                    error!("{}: Failed to write CC.SHN", self.name);
                    if let Some(ctx) = self.detach_ctx.as_mut() {
                        ctx.shutdown_complete = true;
                    }
                    return;
                }

                if self.opts.no_shn_notification {
                    if let Some(ctx) = self.detach_ctx.as_mut() {
                        ctx.shutdown_complete = true;
                    }
                    return;
                }

                // RTD3E is the advertised time from SHN = 1 to SHST = 10b.
                // Devices reporting nothing (or something implausibly small)
                // get ten seconds.
                let rtd3e = self.cdata.rtd3e;
                debug!("{}: RTD3E = {} us", self.name, rtd3e);
                let timeout_ms = ((rtd3e as u64 + 999) / 1000).max(10_000);
                debug!("{}: shutdown timeout = {} ms", self.name, timeout_ms);

                if let Some(ctx) = self.detach_ctx.as_mut() {
                    ctx.shutdown_timeout = Duration::from_millis(timeout_ms);
                    ctx.shutdown_start = Instant::now();
                    ctx.state = DetachState::CheckCsts;
                }
            }

            RegisterCookie::ShutdownReadCsts => {
                if status.is_err() {
                    error!("{}: Failed to read the CSTS register", self.name);
                    if let Some(ctx) = self.detach_ctx.as_mut() {
                        ctx.shutdown_complete = true;
                    }
                    return;
                }

                if let Some(ctx) = self.detach_ctx.as_mut() {
                    ctx.csts = Csts(value as u32);
                    ctx.state = DetachState::GetCstsDone;
                }
            }

            _ => unreachable!("non-shutdown cookie routed to shutdown handler"),
        }
    }

    /// Polls the shutdown sequence; `ReconnectInProgress` while pending.
    pub(crate) fn shutdown_poll_async(&mut self) -> Result<(), NvmeError> {
        let state = match self.detach_ctx.as_ref() {
            Some(ctx) => ctx.state,
            None => return Ok(()),
        };

        match state {
            DetachState::SetCc | DetachState::GetCsts => {
                // Still waiting for the register operation to complete.
                self.drain_transport_events();
                Err(NvmeError::ReconnectInProgress)
            }

            DetachState::CheckCsts => {
                if let Some(ctx) = self.detach_ctx.as_mut() {
                    ctx.state = DetachState::GetCsts;
                }
                if self
                    .get_reg4_async(offsets::CSTS, RegisterCookie::ShutdownReadCsts)
                    .is_err()
                {
                    error!("{}: Failed to read the CSTS register", self.name);
                    return Err(NvmeError::RegisterAccess {
                        source: Errno::EIO,
                    });
                }
                Err(NvmeError::ReconnectInProgress)
            }

            DetachState::GetCstsDone => {
                let (csts, waited, timeout) = {
                    let ctx = self.detach_ctx.as_mut().unwrap();
                    ctx.state = DetachState::CheckCsts;
                    (
                        ctx.csts,
                        ctx.shutdown_start.elapsed(),
                        ctx.shutdown_timeout,
                    )
                };

                if csts.shst() == SHST_COMPLETE {
                    debug!(
                        "{}: shutdown complete in {} milliseconds",
                        self.name,
                        waited.as_millis()
                    );
                    if let Some(ctx) = self.detach_ctx.as_mut() {
                        ctx.shutdown_complete = true;
                    }
                    return Ok(());
                }

                if waited < timeout {
                    return Err(NvmeError::ReconnectInProgress);
                }

                error!(
                    "{}: did not shutdown within {} milliseconds",
                    self.name,
                    timeout.as_millis()
                );
                if self.quirks.contains(Quirks::SHST_COMPLETE) {
                    error!(
                        "{}: likely due to shutdown handling in the VMWare emulated NVMe SSD",
                        self.name
                    );
                }
                if let Some(ctx) = self.detach_ctx.as_mut() {
                    ctx.shutdown_complete = true;
                }
                Ok(())
            }
        }
    }
}
