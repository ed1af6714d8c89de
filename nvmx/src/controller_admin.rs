//! Admin command helpers and the asynchronous event subsystem.
//!
//! Helpers compose the command dwords and submit through the transport.
//! Synchronous wrappers poll the admin queue with the controller's admin
//! timeout as the budget; the init machine uses the asynchronous variants in
//! `controller_init.rs`.

use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::{
    controller::{AdminSink, NvmeController},
    error::NvmeError,
    pages::{
        feat, log_page, AdminOpcode, AerInfoNotice, AerType, AsyncEvent, Completion,
        CommandSpecificStatusCode, DataPage, FormatOpts, FwCommit, FwCommitAction,
        GenericStatusCode, IdentifyCns, IdentifyNsData, NsListPage, Status, StatusCodeType,
        CtrlrListPage, GLOBAL_NS_TAG, MAX_CHANGED_NAMESPACES,
    },
    transport::{AdminCommand, AdminToken, DmaBuffer, Payload},
};

impl NvmeController {
    // -- command composition -------------------------------------------------

    pub(crate) fn cmd_identify(
        &self,
        cns: IdentifyCns,
        cntid: u16,
        nsid: u32,
        csi: u8,
    ) -> AdminCommand {
        let mut cmd = AdminCommand::new(AdminOpcode::Identify);
        cmd.nsid = nsid;
        cmd.cdw10 = cns as u32 | ((cntid as u32) << 16);
        cmd.cdw11 = (csi as u32) << 24;
        cmd
    }

    pub(crate) fn cmd_set_features(&self, feature: u8, cdw11: u32, cdw12: u32) -> AdminCommand {
        let mut cmd = AdminCommand::new(AdminOpcode::SetFeatures);
        cmd.cdw10 = feature as u32;
        cmd.cdw11 = cdw11;
        cmd.cdw12 = cdw12;
        cmd
    }

    pub(crate) fn cmd_get_features(&self, feature: u8, cdw11: u32) -> AdminCommand {
        let mut cmd = AdminCommand::new(AdminOpcode::GetFeatures);
        cmd.cdw10 = feature as u32;
        cmd.cdw11 = cdw11;
        cmd
    }

    pub(crate) fn cmd_get_log_page(&self, lid: u8, nsid: u32, len: u32) -> AdminCommand {
        self.cmd_get_log_page_ext(lid, nsid, len, 0)
    }

    /// Get Log Page with a command set identifier in CDW14.
    pub(crate) fn cmd_get_log_page_ext(
        &self,
        lid: u8,
        nsid: u32,
        len: u32,
        csi: u8,
    ) -> AdminCommand {
        let numd = len / 4 - 1;
        let numdl = numd & 0xffff;
        let numdu = numd >> 16;

        let mut cmd = AdminCommand::new(AdminOpcode::GetLogPage);
        cmd.nsid = nsid;
        cmd.cdw10 = lid as u32 | (numdl << 16);
        cmd.cdw11 = numdu;
        cmd.cdw14 = (csi as u32) << 24;
        cmd
    }

    pub(crate) fn cmd_doorbell_buffer_config(&self) -> AdminCommand {
        AdminCommand::new(AdminOpcode::DoorbellBufferConfig)
    }

    fn cmd_keep_alive(&self) -> AdminCommand {
        AdminCommand::new(AdminOpcode::KeepAlive)
    }

    fn cmd_abort(&self, sqid: u16, cid: u16) -> AdminCommand {
        let mut cmd = AdminCommand::new(AdminOpcode::Abort);
        cmd.cdw10 = (sqid as u32) | ((cid as u32) << 16);
        cmd
    }

    fn cmd_fw_commit(&self, commit: &FwCommit) -> AdminCommand {
        let mut cmd = AdminCommand::new(AdminOpcode::FirmwareCommit);
        cmd.cdw10 = commit.to_cdw10();
        cmd
    }

    pub(crate) fn cmd_fw_image_download(&self, len: u32, offset: u32) -> AdminCommand {
        let mut cmd = AdminCommand::new(AdminOpcode::FirmwareImageDownload);
        cmd.cdw10 = len / 4 - 1;
        cmd.cdw11 = offset / 4;
        cmd
    }

    // -- synchronous submission ----------------------------------------------

    /// Submits a command and polls the admin queue until it completes or the
    /// admin timeout elapses.
    pub(crate) fn submit_and_wait(
        &mut self,
        cmd: AdminCommand,
        payload: Payload,
    ) -> Result<(Completion, Option<DmaBuffer>), NvmeError> {
        let token = self.submit_admin(cmd, payload, AdminSink::Poll)?;
        self.wait_for_token(token)
    }

    fn wait_for_token(
        &mut self,
        token: AdminToken,
    ) -> Result<(Completion, Option<DmaBuffer>), NvmeError> {
        let timeout_ms = self.opts.admin_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);

        loop {
            self.drain_transport_events();

            if let Some(result) = self.poll_results.remove(&token.0) {
                return Ok(result);
            }

            if Instant::now() > deadline {
                self.inflight.remove(&token.0);
                return Err(NvmeError::AdminTimeout { timeout_ms });
            }
        }
    }

    fn check_cpl(&self, cpl: &Completion) -> Result<(), NvmeError> {
        if cpl.is_error() {
            Err(NvmeError::AdminCommand { status: cpl.status })
        } else {
            Ok(())
        }
    }

    // -- generic admin surface -------------------------------------------------

    /// Fetches a log page into a caller-visible buffer.
    pub fn cmd_get_log_page_sync(
        &mut self,
        lid: u8,
        nsid: u32,
        len: u32,
    ) -> Result<Vec<u8>, NvmeError> {
        let cmd = self.cmd_get_log_page(lid, nsid, len);
        let (cpl, payload) = self.submit_and_wait(cmd, Payload::DataIn(DmaBuffer::new(len as usize)))?;
        self.check_cpl(&cpl)?;
        Ok(payload.map(|b| b.as_slice().to_vec()).unwrap_or_default())
    }

    pub fn set_feature(
        &mut self,
        feature: u8,
        cdw11: u32,
        cdw12: u32,
        payload: Option<&[u8]>,
    ) -> Result<u32, NvmeError> {
        let cmd = self.cmd_set_features(feature, cdw11, cdw12);
        let payload = match payload {
            Some(data) => Payload::DataOut(DmaBuffer::from_slice(data)),
            None => Payload::None,
        };
        let (cpl, _) = self.submit_and_wait(cmd, payload)?;
        self.check_cpl(&cpl)?;
        Ok(cpl.cdw0)
    }

    pub fn get_feature(&mut self, feature: u8, cdw11: u32) -> Result<u32, NvmeError> {
        let cmd = self.cmd_get_features(feature, cdw11);
        let (cpl, _) = self.submit_and_wait(cmd, Payload::None)?;
        self.check_cpl(&cpl)?;
        Ok(cpl.cdw0)
    }

    // -- keep alive -------------------------------------------------------------

    /// Sends a Keep Alive if the interval elapsed. Caller is the admin pump.
    pub(crate) fn keep_alive(&mut self) -> Result<(), NvmeError> {
        let interval = match self.keep_alive_interval {
            Some(interval) => interval,
            None => return Ok(()),
        };

        let now = Instant::now();
        if now < self.next_keep_alive {
            return Ok(());
        }

        let cmd = self.cmd_keep_alive();
        if let Err(e) = self.submit_admin(cmd, Payload::None, AdminSink::KeepAlive) {
            error!("{}: Submitting Keep Alive failed", self.name);
            self.next_keep_alive = now + interval;
            return Err(e);
        }

        self.next_keep_alive = now + interval;
        Ok(())
    }

    // -- abort ------------------------------------------------------------------

    /// Requests an abort of the command `cid` on queue `sqid`. Outstanding
    /// aborts are limited by the device's ACL; excess requests queue up and
    /// are submitted as completions come back.
    pub fn cmd_abort_async(&mut self, sqid: u16, cid: u16) -> Result<(), NvmeError> {
        let cmd = self.cmd_abort(sqid, cid);

        if self.outstanding_aborts >= self.cdata.acl as u32 + 1 {
            self.queued_aborts.push_back(cmd);
            return Ok(());
        }

        self.outstanding_aborts += 1;
        self.submit_admin(cmd, Payload::None, AdminSink::Abort)
            .map(|_| ())
    }

    pub(crate) fn abort_done(&mut self, cpl: Completion) {
        if cpl.is_error() {
            debug!("{}: abort command failed: {}", self.name, cpl.status);
        }
        self.outstanding_aborts = self.outstanding_aborts.saturating_sub(1);

        if let Some(cmd) = self.queued_aborts.pop_front() {
            self.outstanding_aborts += 1;
            if self
                .submit_admin(cmd, Payload::None, AdminSink::Abort)
                .is_err()
            {
                error!("{}: failed to submit queued abort", self.name);
                self.outstanding_aborts -= 1;
            }
        }
    }

    // -- asynchronous event requests ----------------------------------------------

    /// Arms one AER slot with a fresh request.
    pub(crate) fn submit_aer(&mut self, slot: usize) -> Result<(), NvmeError> {
        let cmd = AdminCommand::new(AdminOpcode::AsyncEventRequest);
        let token = self.submit_admin(cmd, Payload::None, AdminSink::Aer(slot))?;
        self.aer_slots[slot] = Some(token);
        Ok(())
    }

    /// AER completion: queue the event for every attached process, then
    /// repost into the vacated slot.
    pub(crate) fn aer_done(&mut self, slot: usize, token: AdminToken, cpl: Completion) {
        if let Some(occupant) = self.aer_slots.get_mut(slot) {
            if *occupant == Some(token) {
                *occupant = None;
            }
        }

        if cpl.status.sct == StatusCodeType::Generic as u8
            && cpl.status.sc == GenericStatusCode::AbortedSqDeletion as u8
        {
            // Simulated during shutdown to reap outstanding AERs; never
            // repost.
            return;
        }

        if cpl.status.sct == StatusCodeType::CommandSpecific as u8
            && cpl.status.sc == CommandSpecificStatusCode::AsyncEventRequestLimitExceeded as u8
        {
            // We only post as many AERs as the device advertised; this
            // status means the device is out of spec. Do not repost.
            error!(
                "{}: Controller appears out-of-spec for asynchronous event request handling. Do not repost this AER.",
                self.name
            );
            return;
        }

        self.queue_async_event(&cpl);

        if self.is_removed() || self.is_destructed() {
            return;
        }

        if self.submit_aer(slot).is_err() {
            // Nothing to recover here; run with one fewer AER outstanding.
            error!("{}: resubmitting AER failed!", self.name);
        }
    }

    /// Appends the event to every attached process's queue, preserving
    /// hardware completion order per process.
    pub(crate) fn queue_async_event(&mut self, cpl: &Completion) {
        for proc in self.procs.iter_mut() {
            proc.async_events.push_back(*cpl);
        }
    }

    /// Handles one async event inline for the calling process: reacts to
    /// namespace attribute and ANA change notices, then invokes the
    /// process's AER callback.
    pub fn process_async_event(&mut self, cpl: &Completion) {
        let event = AsyncEvent(cpl.cdw0);

        if event.event_type() == AerType::Notice as u8
            && event.event_info() == AerInfoNotice::NsAttrChanged as u8
        {
            if let Err(e) = self.clear_changed_ns_log() {
                debug!("{}: failed to clear changed ns list log: {}", self.name, e);
            }

            if self.identify_active_ns_sync().is_err() {
                return;
            }
        }

        if event.event_type() == AerType::Notice as u8
            && event.event_info() == AerInfoNotice::AnaChange as u8
            && !self.opts.disable_read_ana_log_page
        {
            if self.update_ana_log_page().is_err() {
                return;
            }
            self.parse_and_apply_ana_states();
        }

        let pid = crate::process::current_pid();
        if let Some(proc) = self.procs.iter().find(|p| p.pid == pid) {
            if let Some(cb) = proc.aer_cb.as_ref() {
                cb(cpl);
            }
        }
    }

    /// Drains the calling process's queued async events in FIFO order.
    pub(crate) fn complete_queued_async_events(&mut self) -> u32 {
        let pid = crate::process::current_pid();
        let mut handled = 0;

        loop {
            let cpl = match self.get_process_mut(pid) {
                Some(proc) => proc.async_events.pop_front(),
                None => return handled,
            };

            match cpl {
                Some(cpl) => {
                    self.process_async_event(&cpl);
                    handled += 1;
                }
                None => return handled,
            }
        }
    }

    // -- namespace management ---------------------------------------------------

    /// Synchronous active namespace scan; refreshes the namespace map.
    pub fn identify_active_ns_sync(&mut self) -> Result<(), NvmeError> {
        let mut new_list: Vec<u32> = Vec::new();

        if self.cdata.nn != 0 {
            if self.vs < crate::registers::VS_1_1
                || self.quirks.contains(crate::quirks::Quirks::IDENTIFY_CNS)
            {
                new_list = (1..=self.cdata.nn).collect();
            } else {
                let mut next_nsid = 0u32;
                loop {
                    let cmd = self.cmd_identify(IdentifyCns::ActiveNsList, 0, next_nsid, 0);
                    let payload =
                        Payload::DataIn(DmaBuffer::new(std::mem::size_of::<NsListPage>()));
                    let (cpl, data) = self.submit_and_wait(cmd, payload)?;
                    self.check_cpl(&cpl)?;

                    let page = NsListPage::from_bytes(
                        data.as_ref().expect("active ns payload").as_slice(),
                    );
                    new_list.extend(page.nsid.iter().copied().take_while(|nsid| *nsid != 0));

                    let last = page.nsid[page.nsid.len() - 1];
                    if last == 0 {
                        break;
                    }
                    next_nsid = last;
                }
            }
        }

        for ns in self.ns.values_mut() {
            ns.free_iocs_specific_data();
        }
        self.active_ns_swap(&new_list);

        Ok(())
    }

    /// Reads and discards the Changed Namespace List log to rearm the
    /// NS-attribute notice, checking only for overflow.
    pub(crate) fn clear_changed_ns_log(&mut self) -> Result<(), NvmeError> {
        let len = (MAX_CHANGED_NAMESPACES * std::mem::size_of::<u32>()) as u32;
        let buf = self.cmd_get_log_page_sync(log_page::CHANGED_NS_LIST, GLOBAL_NS_TAG, len)?;

        // Only the overflow marker is of interest.
        if buf.len() >= 4 {
            let nsid = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if nsid == 0xffff_ffff {
                warn!("{}: changed ns log overflowed.", self.name);
            }
        }

        Ok(())
    }

    /// Re-reads the ANA log into the controller buffer, growing it first if
    /// the active namespace count changed.
    pub(crate) fn update_ana_log_page(&mut self) -> Result<(), NvmeError> {
        let len = self.alloc_ana_log_page()?;

        let cmd = self.cmd_get_log_page(
            log_page::ASYMMETRIC_NAMESPACE_ACCESS,
            GLOBAL_NS_TAG,
            len as u32,
        );
        let (cpl, payload) = self.submit_and_wait(cmd, Payload::DataIn(DmaBuffer::new(len)))?;
        self.check_cpl(&cpl)?;

        let payload = payload.expect("ana log payload");
        self.ana_log_page[..len].copy_from_slice(&payload.as_slice()[..len]);

        Ok(())
    }

    fn attach_detach_ns(
        &mut self,
        nsid: u32,
        ctrlr_list: &CtrlrListPage,
        detach: bool,
    ) -> Result<(), NvmeError> {
        if nsid == 0 {
            return Err(NvmeError::InvalidParam {
                source: Errno::EINVAL,
            });
        }

        let mut cmd = AdminCommand::new(AdminOpcode::NsAttachment);
        cmd.nsid = nsid;
        cmd.cdw10 = detach as u32;

        let payload = Payload::DataOut(DmaBuffer::from_slice(ctrlr_list.as_bytes()));
        let (cpl, _) = self.submit_and_wait(cmd, payload)?;
        self.check_cpl(&cpl)?;

        Ok(())
    }

    /// Attaches controllers to a namespace and refreshes the namespace map.
    pub fn attach_ns(&mut self, nsid: u32, ctrlr_list: &CtrlrListPage) -> Result<(), NvmeError> {
        self.attach_detach_ns(nsid, ctrlr_list, false)?;
        self.identify_active_ns_sync()?;

        let nsdata = {
            let cmd = self.cmd_identify(IdentifyCns::Ns, 0, nsid, 0);
            let payload = Payload::DataIn(DmaBuffer::new(std::mem::size_of::<IdentifyNsData>()));
            let (cpl, data) = self.submit_and_wait(cmd, payload)?;
            self.check_cpl(&cpl)?;
            IdentifyNsData::from_bytes(data.expect("identify ns payload").as_slice())
        };

        if let Some(ns) = self.get_ns(nsid) {
            ns.set_identify_data(nsdata);
        }

        Ok(())
    }

    /// Detaches controllers from a namespace and refreshes the map.
    pub fn detach_ns(&mut self, nsid: u32, ctrlr_list: &CtrlrListPage) -> Result<(), NvmeError> {
        self.attach_detach_ns(nsid, ctrlr_list, true)?;
        self.identify_active_ns_sync()
    }

    /// Creates a namespace; returns the id the controller assigned.
    pub fn create_ns(&mut self, nsdata: &IdentifyNsData) -> Result<u32, NvmeError> {
        let mut cmd = AdminCommand::new(AdminOpcode::NsManagement);
        cmd.cdw10 = 0; /* SEL: create */

        let payload = Payload::DataOut(DmaBuffer::from_slice(nsdata.as_bytes()));
        let (cpl, _) = self.submit_and_wait(cmd, payload)?;
        self.check_cpl(&cpl)?;

        let nsid = cpl.cdw0;
        if nsid == 0 {
            error!("{}: controller reported namespace id 0 for create", self.name);
            return Err(NvmeError::AdminCommand {
                status: Status::generic(GenericStatusCode::InternalDeviceError),
            });
        }
        Ok(nsid)
    }

    pub fn delete_ns(&mut self, nsid: u32) -> Result<(), NvmeError> {
        if nsid == 0 {
            return Err(NvmeError::InvalidParam {
                source: Errno::EINVAL,
            });
        }

        let mut cmd = AdminCommand::new(AdminOpcode::NsManagement);
        cmd.nsid = nsid;
        cmd.cdw10 = 1; /* SEL: delete */

        let (cpl, _) = self.submit_and_wait(cmd, Payload::None)?;
        self.check_cpl(&cpl)?;

        self.identify_active_ns_sync()
    }

    /// Formats the namespace (or all of them via the global tag) and resets
    /// the controller afterwards.
    pub fn format(&mut self, nsid: u32, format: &FormatOpts) -> Result<(), NvmeError> {
        let mut cmd = AdminCommand::new(AdminOpcode::FormatNvm);
        cmd.nsid = nsid;
        cmd.cdw10 = format.to_cdw10();

        let (cpl, _) = self.submit_and_wait(cmd, Payload::None)?;
        self.check_cpl(&cpl)?;

        self.reset()
    }

    // -- firmware ---------------------------------------------------------------

    /// Downloads a firmware image and commits it to `slot`. On success the
    /// controller is reset to activate the image. A device answering the
    /// commit with "activation requires conventional reset" is reported as
    /// success after the reset, per the status policy.
    pub fn update_firmware(
        &mut self,
        payload: &[u8],
        slot: u8,
        commit_action: FwCommitAction,
    ) -> Result<Status, NvmeError> {
        if payload.len() % 4 != 0 {
            error!("{}: firmware image size is not multiple of 4", self.name);
            return Err(NvmeError::InvalidParam {
                source: Errno::EINVAL,
            });
        }

        if !matches!(
            commit_action,
            FwCommitAction::ReplaceImg | FwCommitAction::ReplaceAndEnableImg
        ) {
            error!("{}: invalid firmware commit action", self.name);
            return Err(NvmeError::InvalidParam {
                source: Errno::EINVAL,
            });
        }

        // Chunked download at the controller's minimum page granularity.
        let mut offset = 0usize;
        while offset < payload.len() {
            let transfer = (payload.len() - offset).min(self.min_page_size as usize);

            let cmd = self.cmd_fw_image_download(transfer as u32, offset as u32);
            let chunk = Payload::DataOut(DmaBuffer::from_slice(&payload[offset..offset + transfer]));
            let (cpl, _) = self.submit_and_wait(cmd, chunk)?;
            self.check_cpl(&cpl)?;

            offset += transfer;
        }

        let commit = FwCommit {
            fs: slot,
            ca: commit_action as u8,
            bpid: 0,
        };
        let cmd = self.cmd_fw_commit(&commit);
        let (cpl, _) = self.submit_and_wait(cmd, Payload::None)?;
        let completion_status = cpl.status;

        if cpl.is_error() {
            let conventional = completion_status.sct == StatusCodeType::CommandSpecific as u8
                && completion_status.sc
                    == CommandSpecificStatusCode::FirmwareReqConventionalReset as u8;
            let nvm_reset = completion_status.sct == StatusCodeType::CommandSpecific as u8
                && completion_status.sc == CommandSpecificStatusCode::FirmwareReqNvmReset as u8;

            if conventional {
                info!(
                    "{}: firmware activation requires conventional reset to be performed. !",
                    self.name
                );
            } else if !nvm_reset {
                error!("{}: firmware commit failed!", self.name);
                return Err(NvmeError::AdminCommand {
                    status: completion_status,
                });
            }
        }

        self.reset()?;
        Ok(completion_status)
    }

    // -- security ----------------------------------------------------------------

    pub fn security_receive(
        &mut self,
        secp: u8,
        spsp: u16,
        nssf: u8,
        size: u32,
    ) -> Result<Vec<u8>, NvmeError> {
        let mut cmd = AdminCommand::new(AdminOpcode::SecurityReceive);
        cmd.cdw10 = ((secp as u32) << 24) | ((spsp as u32) << 8) | nssf as u32;
        cmd.cdw11 = size;

        let (cpl, payload) =
            self.submit_and_wait(cmd, Payload::DataIn(DmaBuffer::new(size as usize)))?;
        self.check_cpl(&cpl)?;

        Ok(payload.map(|b| b.as_slice().to_vec()).unwrap_or_default())
    }

    pub fn security_send(
        &mut self,
        secp: u8,
        spsp: u16,
        nssf: u8,
        data: &[u8],
    ) -> Result<(), NvmeError> {
        let mut cmd = AdminCommand::new(AdminOpcode::SecuritySend);
        cmd.cdw10 = ((secp as u32) << 24) | ((spsp as u32) << 8) | nssf as u32;
        cmd.cdw11 = data.len() as u32;

        let (cpl, _) = self.submit_and_wait(cmd, Payload::DataOut(DmaBuffer::from_slice(data)))?;
        self.check_cpl(&cpl)
    }

    // -- arbitration --------------------------------------------------------------

    /// Programs the arbitration feature from the negotiated options. Best
    /// effort; failures are logged and ignored.
    pub(crate) fn set_arbitration_feature(&mut self) {
        if self.opts.arbitration_burst == 0 {
            return;
        }

        if self.opts.arbitration_burst > 7 {
            warn!("{}: Valid arbitration burst values is from 0-7", self.name);
            return;
        }

        let mut cdw11 = self.opts.arbitration_burst as u32;
        if self
            .flags
            .contains(crate::controller::CtrlrFlags::WRR_SUPPORTED)
        {
            cdw11 |= (self.opts.low_priority_weight as u32) << 8;
            cdw11 |= (self.opts.medium_priority_weight as u32) << 16;
            cdw11 |= (self.opts.high_priority_weight as u32) << 24;
        }

        let cmd = self.cmd_set_features(feat::ARBITRATION, cdw11, 0);
        match self.submit_and_wait(cmd, Payload::None) {
            Ok((cpl, _)) => {
                if cpl.is_error() {
                    error!("{}: Set arbitration feature failed", self.name);
                }
            }
            Err(NvmeError::AdminTimeout { .. }) => {
                error!("{}: Timeout to set arbitration feature", self.name);
            }
            Err(_) => {
                error!("{}: Set arbitration feature failed", self.name);
            }
        }
    }
}
