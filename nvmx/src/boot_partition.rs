//! Boot partition I/O.
//!
//! Reads program BPMBL/BPRSEL and poll BPINFO.BRS; writes chain firmware
//! image downloads with two firmware commits (replace, then activate).

use nix::errno::Errno;

use crate::{
    controller::{AdminSink, BpWriteState, NvmeController},
    error::NvmeError,
    pages::{Completion, FwCommit, FwCommitAction},
    registers::{offsets, BootPartitionReadStatus, Bprsel},
    transport::{DmaBuffer, Payload},
};

impl NvmeController {
    /// Starts a boot partition read of `bprsz` 4 KiB units at offset
    /// `bprof` into `buffer_addr` (physically contiguous). Progress is
    /// observed with `read_boot_partition_poll`.
    pub fn read_boot_partition_start(
        &mut self,
        buffer_addr: u64,
        bprsz: u32,
        bprof: u32,
        bpid: u32,
    ) -> Result<(), NvmeError> {
        if !self.cap.bps() {
            return Err(NvmeError::NotSupported {
                source: Errno::ENOTSUP,
            });
        }

        let bpinfo = self.get_regs_bpinfo().map_err(|e| {
            error!("{}: get bpinfo failed", self.name);
            e
        })?;

        if bpinfo.brs() == BootPartitionReadStatus::InProgress {
            error!("{}: Boot Partition read already initiated", self.name);
            return Err(NvmeError::AlreadyInProgress);
        }

        if self
            .transport
            .set_reg8(offsets::BPMBL, buffer_addr)
            .is_err()
        {
            error!("{}: set_bpmbl() failed", self.name);
            return Err(NvmeError::BootPartition {
                source: Errno::EIO,
            });
        }

        let bprsel = Bprsel::new(bpid, bprof, bprsz);
        if self.transport.set_reg4(offsets::BPRSEL, bprsel.0).is_err() {
            error!("{}: set_bprsel() failed", self.name);
            return Err(NvmeError::BootPartition {
                source: Errno::EIO,
            });
        }

        Ok(())
    }

    /// Polls BPINFO.BRS. `AlreadyInProgress` maps to "keep polling".
    pub fn read_boot_partition_poll(&mut self) -> Result<(), NvmeError> {
        let bpinfo = self.get_regs_bpinfo().map_err(|e| {
            error!("{}: get bpinfo failed", self.name);
            e
        })?;

        match bpinfo.brs() {
            BootPartitionReadStatus::NoRead => {
                error!("{}: Boot Partition read not initiated", self.name);
                Err(NvmeError::InvalidParam {
                    source: Errno::EINVAL,
                })
            }
            BootPartitionReadStatus::InProgress => {
                debug!("{}: Boot Partition read in progress", self.name);
                Err(NvmeError::AlreadyInProgress)
            }
            BootPartitionReadStatus::ReadError => {
                error!("{}: Error completing Boot Partition read", self.name);
                Err(NvmeError::BootPartition {
                    source: Errno::EIO,
                })
            }
            BootPartitionReadStatus::Success => {
                info!("{}: Boot Partition read completed successfully", self.name);
                Ok(())
            }
        }
    }

    /// Starts a boot partition write. The image is downloaded in
    /// `min_page_size` chunks, then committed with replace and activate
    /// actions. Completion is observable via `boot_partition_write_state`.
    pub fn write_boot_partition(&mut self, payload: &[u8], bpid: u8) -> Result<(), NvmeError> {
        if !self.cap.bps() {
            return Err(NvmeError::NotSupported {
                source: Errno::ENOTSUP,
            });
        }

        if payload.is_empty() || payload.len() % 4 != 0 {
            return Err(NvmeError::InvalidParam {
                source: Errno::EINVAL,
            });
        }

        self.bp_ws = BpWriteState::Downloading;
        self.bpid = bpid;
        self.fw_offset = 0;
        self.fw_size_remaining = payload.len() as u32;
        self.fw_payload = payload.to_vec();
        self.fw_transfer_size = self.fw_size_remaining.min(self.min_page_size);

        self.bp_download_next()
    }

    pub fn boot_partition_write_state(&self) -> bool {
        self.bp_ws == BpWriteState::Idle
    }

    fn bp_download_next(&mut self) -> Result<(), NvmeError> {
        let offset = self.fw_offset as usize;
        let transfer = self.fw_transfer_size as usize;
        let chunk = DmaBuffer::from_slice(&self.fw_payload[offset..offset + transfer]);

        let cmd = self.cmd_fw_image_download(self.fw_transfer_size, self.fw_offset);
        self.submit_admin(cmd, Payload::DataOut(chunk), AdminSink::BootPartitionWrite)
            .map(|_| ())
    }

    fn bp_commit(&mut self, ca: FwCommitAction) -> Result<(), NvmeError> {
        let commit = FwCommit {
            fs: 0,
            ca: ca as u8,
            bpid: self.bpid,
        };

        let mut cmd = crate::transport::AdminCommand::new(crate::pages::AdminOpcode::FirmwareCommit);
        cmd.cdw10 = commit.to_cdw10();
        self.submit_admin(cmd, Payload::None, AdminSink::BootPartitionWrite)
            .map(|_| ())
    }

    /// Advances the write chain on each firmware download/commit completion.
    pub(crate) fn bp_write_done(&mut self, cpl: Completion) {
        if cpl.is_error() {
            error!("{}: Write Boot Partition failed", self.name);
            self.bp_ws = BpWriteState::Idle;
            return;
        }

        match self.bp_ws {
            BpWriteState::Downloading => {
                debug!(
                    "{}: Boot Partition Downloading at Offset {} Success",
                    self.name, self.fw_offset
                );

                self.fw_offset += self.fw_transfer_size;
                self.fw_size_remaining -= self.fw_transfer_size;

                if self.fw_size_remaining == 0 {
                    self.bp_ws = BpWriteState::Downloaded;
                    self.bp_write_done(Completion::success());
                    return;
                }

                self.fw_transfer_size = self.fw_size_remaining.min(self.min_page_size);
                if self.bp_download_next().is_err() {
                    error!("{}: firmware image download failed!", self.name);
                    self.bp_ws = BpWriteState::Idle;
                }
            }

            BpWriteState::Downloaded => {
                debug!("{}: Boot Partition Download Success", self.name);
                if self.bp_commit(FwCommitAction::ReplaceBootPartition).is_err() {
                    error!("{}: firmware commit failed!", self.name);
                    self.bp_ws = BpWriteState::Idle;
                    return;
                }
                self.bp_ws = BpWriteState::Replace;
            }

            BpWriteState::Replace => {
                debug!("{}: Boot Partition Replacement Success", self.name);
                if self.bp_commit(FwCommitAction::ActivateBootPartition).is_err() {
                    error!("{}: firmware commit failed!", self.name);
                    self.bp_ws = BpWriteState::Idle;
                    return;
                }
                self.bp_ws = BpWriteState::Activate;
            }

            BpWriteState::Activate => {
                debug!("{}: Boot Partition Activation Success", self.name);
                self.bp_ws = BpWriteState::Idle;
                self.fw_payload = Vec::new();
            }

            BpWriteState::Idle => {
                error!("{}: Invalid Boot Partition write state", self.name);
            }
        }
    }
}
