//! The pluggable transport seam.
//!
//! The engine drives a controller exclusively through [`NvmeTransport`];
//! PCIe, RDMA, TCP and FC register/queue mechanics live behind it.
//! Asynchronous operations complete as [`TransportEvent`]s drained by
//! [`NvmeTransport::process_completions`], which the engine matches against
//! the cookie or token it submitted.

use std::fmt;

use nix::errno::Errno;

use crate::{
    opts::IoQpairOpts,
    pages::{AdminOpcode, Completion},
};

/// Transport types understood by the engine.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Pcie,
    Rdma,
    Tcp,
    Fc,
    Custom,
}

impl TransportType {
    pub fn is_fabrics(&self) -> bool {
        matches!(
            self,
            TransportType::Rdma | TransportType::Tcp | TransportType::Fc
        )
    }
}

/// Well-known discovery subsystem NQN.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Transport identity of a controller: type, address, subsystem NQN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportId {
    pub trtype: TransportType,
    pub traddr: String,
    pub trsvcid: String,
    pub subnqn: String,
}

impl TransportId {
    pub fn is_fabrics(&self) -> bool {
        self.trtype.is_fabrics()
    }

    pub fn is_discovery(&self) -> bool {
        self.subnqn.starts_with(DISCOVERY_NQN)
    }

    /// Printable identity used as the log prefix: the subsystem NQN for
    /// fabrics, the transport address otherwise.
    pub fn printable(&self) -> &str {
        if self.is_fabrics() {
            &self.subnqn
        } else {
            &self.traddr
        }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}:{}:{}", self.trtype, self.traddr, self.trsvcid, self.subnqn)
    }
}

#[derive(Debug, Default)]
pub struct TransportIdBuilder {
    trtype: Option<TransportType>,
    traddr: String,
    trsvcid: String,
    subnqn: String,
}

impl TransportIdBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trtype(mut self, trtype: TransportType) -> Self {
        self.trtype = Some(trtype);
        self
    }

    /// the address to connect to
    pub fn with_traddr(mut self, traddr: &str) -> Self {
        self.traddr = traddr.to_string();
        self
    }

    /// svcid (port) to connect to
    pub fn with_trsvcid(mut self, trsvcid: &str) -> Self {
        self.trsvcid = trsvcid.to_string();
        self
    }

    /// target nqn
    pub fn with_subnqn(mut self, subnqn: &str) -> Self {
        self.subnqn = subnqn.to_string();
        self
    }

    pub fn build(self) -> TransportId {
        TransportId {
            trtype: self.trtype.unwrap_or(TransportType::Pcie),
            traddr: self.traddr,
            trsvcid: self.trsvcid,
            subnqn: self.subnqn,
        }
    }
}

/// An owned, zero-filled buffer the transport moves admin payload data
/// through. Heap placement keeps `io_addr` stable for the buffer lifetime.
pub struct DmaBuffer(Box<[u8]>);

impl DmaBuffer {
    pub fn new(len: usize) -> Self {
        DmaBuffer(vec![0u8; len].into_boxed_slice())
    }

    pub fn from_slice(data: &[u8]) -> Self {
        DmaBuffer(data.to_vec().into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Stable address of the buffer, used where the protocol wants a PRP.
    pub fn io_addr(&self) -> u64 {
        self.0.as_ptr() as u64
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaBuffer({} bytes)", self.0.len())
    }
}

/// Direction of the payload attached to an admin request.
#[derive(Debug)]
pub enum Payload {
    None,
    /// Controller-to-host transfer; the transport fills the buffer.
    DataIn(DmaBuffer),
    /// Host-to-controller transfer.
    DataOut(DmaBuffer),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::DataIn(b) | Payload::DataOut(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take_buffer(self) -> Option<DmaBuffer> {
        match self {
            Payload::None => None,
            Payload::DataIn(b) | Payload::DataOut(b) => Some(b),
        }
    }
}

/// Composed admin submission queue entry.
#[derive(Debug, Clone, Copy)]
pub struct AdminCommand {
    pub opc: AdminOpcode,
    pub nsid: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
    /// PRP entries for commands addressing host memory directly
    /// (doorbell buffer config); zero otherwise.
    pub prp1: u64,
    pub prp2: u64,
}

impl AdminCommand {
    pub fn new(opc: AdminOpcode) -> Self {
        AdminCommand {
            opc,
            nsid: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
            prp1: 0,
            prp2: 0,
        }
    }
}

/// Engine-assigned identifier of an in-flight admin request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdminToken(pub u64);

impl AdminToken {
    /// Command identifier placed into the submission queue entry.
    pub fn cid(&self) -> u16 {
        self.0 as u16
    }
}

/// An admin request handed to the transport. The payload buffer travels with
/// the request and comes back attached to the completion event.
#[derive(Debug)]
pub struct AdminRequest {
    pub token: AdminToken,
    pub cmd: AdminCommand,
    pub payload: Payload,
}

/// Identifies which register operation a completion belongs to. The init
/// and shutdown machines only ever have one operation outstanding, and the
/// waiting state knows which cookie it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterCookie {
    ReadVs,
    ReadCap,
    CheckEnReadCc,
    SetEn0ReadCc,
    SetEn0WriteCc,
    DisableReady1ReadCsts,
    DisableReady0ReadCsts,
    EnableWriteCc,
    EnableReady1ReadCsts,
    ShutdownReadCc,
    ShutdownWriteCc,
    ShutdownReadCsts,
}

/// Completion delivered by `process_completions`.
#[derive(Debug)]
pub enum TransportEvent {
    /// An asynchronous register read or write finished. `value` carries the
    /// register content for reads and is unspecified for writes.
    Register {
        cookie: RegisterCookie,
        value: u64,
        status: Result<(), Errno>,
    },
    /// An admin command completed.
    Admin {
        token: AdminToken,
        cpl: Completion,
        payload: Option<DmaBuffer>,
    },
}

/// Contract the engine consumes; implemented per transport (PCIe, RDMA, TCP,
/// FC) outside this crate.
pub trait NvmeTransport {
    // Synchronous register file access.
    fn get_reg4(&mut self, offset: u32) -> Result<u32, Errno>;
    fn get_reg8(&mut self, offset: u32) -> Result<u64, Errno>;
    fn set_reg4(&mut self, offset: u32, value: u32) -> Result<(), Errno>;
    fn set_reg8(&mut self, offset: u32, value: u64) -> Result<(), Errno>;

    // Asynchronous variants; completion arrives as a Register event.
    fn get_reg4_async(&mut self, offset: u32, cookie: RegisterCookie) -> Result<(), Errno>;
    fn get_reg8_async(&mut self, offset: u32, cookie: RegisterCookie) -> Result<(), Errno>;
    fn set_reg4_async(&mut self, offset: u32, value: u32, cookie: RegisterCookie)
        -> Result<(), Errno>;

    /// Transport specific controller enable step, run before CC.EN is set.
    fn enable(&mut self) -> Result<(), Errno>;

    /// Release all transport resources. The controller is unusable afterwards.
    fn destruct(&mut self);

    // Queue pair mechanics. qid 0 is the admin queue.
    fn create_io_qpair(&mut self, qid: u16, opts: &IoQpairOpts) -> Result<(), Errno>;
    fn delete_io_qpair(&mut self, qid: u16);
    fn connect_qpair(&mut self, qid: u16) -> Result<(), Errno>;
    fn disconnect_qpair(&mut self, qid: u16);
    fn reset_qpair(&mut self, qid: u16);

    /// Submit an admin command; completion arrives as an Admin event.
    fn submit_admin_request(&mut self, req: AdminRequest) -> Result<(), Errno>;

    /// Abort outstanding asynchronous event requests. Each aborted AER
    /// completes with generic status `AbortedSqDeletion`.
    fn abort_aers(&mut self);

    /// Drain completed operations. Returns the number of events appended.
    fn process_completions(&mut self, events: &mut Vec<TransportEvent>) -> usize;

    /// Largest single transfer the transport can move, before MDTS clamping.
    fn max_xfer_size(&self) -> u32;

    /// Largest scatter-gather list the transport can express.
    fn max_sges(&self) -> u16;

    /// Ids of the memory domains this transport's buffers live in.
    fn memory_domains(&self) -> Vec<String> {
        Vec::new()
    }

    // Controller memory buffer / persistent memory region; PCIe only.
    fn reserve_cmb(&mut self) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn map_cmb(&mut self) -> Result<(u64, usize), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn unmap_cmb(&mut self) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn enable_pmr(&mut self) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn disable_pmr(&mut self) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn map_pmr(&mut self) -> Result<(u64, usize), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn unmap_pmr(&mut self) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transport_id_printable_identity() {
        let fabrics = TransportIdBuilder::new()
            .with_trtype(TransportType::Tcp)
            .with_traddr("127.0.0.1")
            .with_trsvcid("4420")
            .with_subnqn("nqn.2021-01-01:test.nqn")
            .build();

        assert!(fabrics.is_fabrics());
        assert_eq!(fabrics.printable(), "nqn.2021-01-01:test.nqn");

        let pcie = TransportIdBuilder::new()
            .with_trtype(TransportType::Pcie)
            .with_traddr("0000:81:00.0")
            .build();

        assert!(!pcie.is_fabrics());
        assert_eq!(pcie.printable(), "0000:81:00.0");
    }

    #[test]
    fn discovery_nqn_detection() {
        let trid = TransportIdBuilder::new()
            .with_trtype(TransportType::Tcp)
            .with_subnqn(DISCOVERY_NQN)
            .build();
        assert!(trid.is_discovery());
    }

    #[test]
    fn admin_token_cid() {
        assert_eq!(AdminToken(0x1_0042).cid(), 0x42);
    }
}
