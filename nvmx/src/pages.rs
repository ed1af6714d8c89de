//! NVMe admin protocol data: completion queue entries, admin opcodes and the
//! identify/log data pages the controller engine decodes.
//!
//! Pages are declared `#[repr(C)]` with explicit reserved padding so the byte
//! layout matches the wire format, and are moved in and out of DMA buffers
//! as raw bytes.

use std::fmt;
use std::mem::size_of;
use std::ptr;
use std::slice;

/// A data page that can be copied to and from a transport buffer.
pub trait DataPage: Sized {
    fn from_bytes(buf: &[u8]) -> Self {
        assert!(buf.len() >= size_of::<Self>(), "short data page buffer");
        unsafe { ptr::read_unaligned(buf.as_ptr() as *const Self) }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>())
        }
    }
}

/// Status code types (SCT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCodeType {
    Generic = 0x0,
    CommandSpecific = 0x1,
    MediaError = 0x2,
    Path = 0x3,
    VendorSpecific = 0x7,
}

/// Generic command status codes (SCT 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GenericStatusCode {
    Success = 0x00,
    InvalidOpcode = 0x01,
    InvalidField = 0x02,
    DataTransferError = 0x04,
    InternalDeviceError = 0x06,
    AbortedByRequest = 0x07,
    AbortedSqDeletion = 0x08,
}

/// Command specific status codes (SCT 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandSpecificStatusCode {
    CompletionQueueInvalid = 0x00,
    AsyncEventRequestLimitExceeded = 0x05,
    InvalidFirmwareSlot = 0x06,
    InvalidFirmwareImage = 0x07,
    FirmwareReqConventionalReset = 0x0b,
    FirmwareReqNvmReset = 0x10,
}

/// Completion status field (SCT + SC).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub sct: u8,
    pub sc: u8,
}

impl Status {
    pub const SUCCESS: Status = Status { sct: 0, sc: 0 };

    pub fn generic(sc: GenericStatusCode) -> Self {
        Status {
            sct: StatusCodeType::Generic as u8,
            sc: sc as u8,
        }
    }

    pub fn command_specific(sc: CommandSpecificStatusCode) -> Self {
        Status {
            sct: StatusCodeType::CommandSpecific as u8,
            sc: sc as u8,
        }
    }

    pub fn is_error(&self) -> bool {
        !(self.sct == StatusCodeType::Generic as u8
            && self.sc == GenericStatusCode::Success as u8)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SCT 0x{:x} SC 0x{:x}", self.sct, self.sc)
    }
}

/// Completion queue entry as delivered by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub cdw0: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: Status,
}

impl Completion {
    pub fn success() -> Self {
        Completion::default()
    }

    pub fn with_status(status: Status) -> Self {
        Completion {
            status,
            ..Completion::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }
}

/// Admin command opcodes used by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminOpcode {
    GetLogPage = 0x02,
    Identify = 0x06,
    Abort = 0x08,
    SetFeatures = 0x09,
    GetFeatures = 0x0a,
    AsyncEventRequest = 0x0c,
    NsManagement = 0x0d,
    FirmwareCommit = 0x10,
    FirmwareImageDownload = 0x11,
    NsAttachment = 0x15,
    KeepAlive = 0x18,
    DoorbellBufferConfig = 0x7c,
    FormatNvm = 0x80,
    SecuritySend = 0x81,
    SecurityReceive = 0x82,
}

/// Identify CNS values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdentifyCns {
    Ns = 0x00,
    Ctrlr = 0x01,
    ActiveNsList = 0x02,
    NsIdDescriptorList = 0x03,
    NsIocs = 0x05,
    CtrlrIocs = 0x06,
}

/// Command set identifiers.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Csi {
    Nvm = 0x00,
    KeyValue = 0x01,
    Zns = 0x02,
}

/// Feature identifiers.
pub mod feat {
    pub const ARBITRATION: u8 = 0x01;
    pub const POWER_MANAGEMENT: u8 = 0x02;
    pub const TEMPERATURE_THRESHOLD: u8 = 0x04;
    pub const ERROR_RECOVERY: u8 = 0x05;
    pub const VOLATILE_WRITE_CACHE: u8 = 0x06;
    pub const NUMBER_OF_QUEUES: u8 = 0x07;
    pub const INTERRUPT_COALESCING: u8 = 0x08;
    pub const INTERRUPT_VECTOR_CONFIGURATION: u8 = 0x09;
    pub const WRITE_ATOMICITY: u8 = 0x0a;
    pub const ASYNC_EVENT_CONFIGURATION: u8 = 0x0b;
    pub const AUTONOMOUS_POWER_STATE_TRANSITION: u8 = 0x0c;
    pub const HOST_MEM_BUFFER: u8 = 0x0d;
    pub const KEEP_ALIVE_TIMER: u8 = 0x0f;
    pub const HOST_IDENTIFIER: u8 = 0x81;

    pub mod intel {
        pub const MAX_LBA: u8 = 0xc1;
        pub const NATIVE_MAX_LBA: u8 = 0xc2;
        pub const POWER_GOVERNOR_SETTING: u8 = 0xc6;
        pub const SMBUS_ADDRESS: u8 = 0xc8;
        pub const LED_PATTERN: u8 = 0xc9;
        pub const RESET_TIMED_WORKLOAD_COUNTERS: u8 = 0xd5;
        pub const LATENCY_TRACKING: u8 = 0xe2;
    }
}

/// Log page identifiers.
pub mod log_page {
    pub const ERROR: u8 = 0x01;
    pub const HEALTH_INFORMATION: u8 = 0x02;
    pub const FIRMWARE_SLOT: u8 = 0x03;
    pub const CHANGED_NS_LIST: u8 = 0x04;
    pub const COMMAND_EFFECTS_LOG: u8 = 0x05;
    pub const TELEMETRY_HOST_INITIATED: u8 = 0x07;
    pub const ASYMMETRIC_NAMESPACE_ACCESS: u8 = 0x0c;

    pub mod intel {
        pub const PAGE_DIRECTORY: u8 = 0xc0;
        pub const READ_CMD_LATENCY: u8 = 0xc1;
        pub const WRITE_CMD_LATENCY: u8 = 0xc2;
        pub const TEMPERATURE: u8 = 0xc5;
        pub const SMART: u8 = 0xca;
        pub const MARKETING_DESCRIPTION: u8 = 0xdd;
    }
}

/// Namespace id used for controller-global log pages.
pub const GLOBAL_NS_TAG: u32 = 0xffff_ffff;

/// Maximum entries in the changed namespace list log.
pub const MAX_CHANGED_NAMESPACES: usize = 1024;

/// Zone append opcode, checked in the ZNS command effects log.
pub const OPC_ZONE_APPEND: usize = 0x7d;

/// Firmware commit actions (CDW10.CA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FwCommitAction {
    ReplaceImg = 0,
    ReplaceAndEnableImg = 1,
    EnableImg = 2,
    ActivateImmediate = 3,
    ReplaceBootPartition = 6,
    ActivateBootPartition = 7,
}

/// Firmware commit CDW10 composition.
#[derive(Debug, Clone, Copy, Default)]
pub struct FwCommit {
    pub fs: u8,
    pub ca: u8,
    pub bpid: u8,
}

impl FwCommit {
    pub fn to_cdw10(&self) -> u32 {
        (self.fs as u32 & 0x7) | ((self.ca as u32 & 0x7) << 3) | ((self.bpid as u32 & 1) << 31)
    }
}

/// Format NVM CDW10 composition.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOpts {
    pub lbaf: u8,
    pub mset: u8,
    pub pi: u8,
    pub pil: u8,
    pub ses: u8,
}

impl FormatOpts {
    pub fn to_cdw10(&self) -> u32 {
        (self.lbaf as u32 & 0xf)
            | ((self.mset as u32 & 1) << 4)
            | ((self.pi as u32 & 0x7) << 5)
            | ((self.pil as u32 & 1) << 8)
            | ((self.ses as u32 & 0x7) << 9)
    }
}

/// Async event types (CDW0 bits 0..3 of an AER completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AerType {
    Error = 0x0,
    Smart = 0x1,
    Notice = 0x2,
    Io = 0x6,
    Vendor = 0x7,
}

/// Notice subtypes (CDW0 bits 8..16 when the type is Notice).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AerInfoNotice {
    NsAttrChanged = 0x0,
    FwActivationStart = 0x1,
    TelemetryLogChanged = 0x2,
    AnaChange = 0x3,
}

/// Decoded AER completion dword 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncEvent(pub u32);

impl AsyncEvent {
    pub fn event_type(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    pub fn event_info(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn log_page(&self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    pub fn new(event_type: AerType, info: u8, log_page: u8) -> Self {
        AsyncEvent((event_type as u32) | ((info as u32) << 8) | ((log_page as u32) << 16))
    }
}

/// Async event configuration feature (CDW11 of Set Features 0x0b).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsyncEventConfig(pub u32);

impl AsyncEventConfig {
    pub fn set_crit_warn_available_spare(&mut self) {
        self.0 |= 1 << 0;
    }
    pub fn set_crit_warn_temperature(&mut self) {
        self.0 |= 1 << 1;
    }
    pub fn set_crit_warn_device_reliability(&mut self) {
        self.0 |= 1 << 2;
    }
    pub fn set_crit_warn_read_only(&mut self) {
        self.0 |= 1 << 3;
    }
    pub fn set_crit_warn_volatile_memory_backup(&mut self) {
        self.0 |= 1 << 4;
    }
    pub fn set_ns_attr_notice(&mut self) {
        self.0 |= 1 << 8;
    }
    pub fn set_fw_activation_notice(&mut self) {
        self.0 |= 1 << 9;
    }
    pub fn set_telemetry_log_notice(&mut self) {
        self.0 |= 1 << 10;
    }
    pub fn set_ana_change_notice(&mut self) {
        self.0 |= 1 << 11;
    }
    pub fn set_discovery_log_change_notice(&mut self) {
        self.0 |= 1 << 31;
    }
    pub fn ns_attr_notice(&self) -> bool {
        self.0 & (1 << 8) != 0
    }
    pub fn ana_change_notice(&self) -> bool {
        self.0 & (1 << 11) != 0
    }
}

/// Identify Controller data structure (CNS 0x01), 4096 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdentifyControllerData {
    pub vid: u16,
    pub ssvid: u16,
    pub sn: [u8; 20],
    pub mn: [u8; 40],
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    pub mdts: u8,
    pub cntlid: u16,
    pub ver: u32,
    pub rtd3r: u32,
    pub rtd3e: u32,
    pub oaes: u32,
    pub ctratt: u32,
    pub rrls: u16,
    rsvd102: [u8; 9],
    pub cntrltype: u8,
    pub fguid: [u8; 16],
    pub crdt1: u16,
    pub crdt2: u16,
    pub crdt3: u16,
    rsvd134: [u8; 122],
    pub oacs: u16,
    pub acl: u8,
    pub aerl: u8,
    pub frmw: u8,
    pub lpa: u8,
    pub elpe: u8,
    pub npss: u8,
    pub avscc: u8,
    pub apsta: u8,
    pub wctemp: u16,
    pub cctemp: u16,
    pub mtfa: u16,
    pub hmpre: u32,
    pub hmmin: u32,
    pub tnvmcap: [u8; 16],
    pub unvmcap: [u8; 16],
    pub rpmbs: u32,
    pub edstt: u16,
    pub dsto: u8,
    pub fwug: u8,
    pub kas: u16,
    pub hctma: u16,
    pub mntmt: u16,
    pub mxtmt: u16,
    pub sanicap: u32,
    pub hmminds: u32,
    pub hmmaxd: u16,
    pub nsetidmax: u16,
    pub endgidmax: u16,
    pub anatt: u8,
    pub anacap: u8,
    pub anagrpmax: u32,
    pub nanagrpid: u32,
    pub pels: u32,
    rsvd356: [u8; 156],
    pub sqes: u8,
    pub cqes: u8,
    pub maxcmd: u16,
    pub nn: u32,
    pub oncs: u16,
    pub fuses: u16,
    pub fna: u8,
    pub vwc: u8,
    pub awun: u16,
    pub awupf: u16,
    pub nvscc: u8,
    pub nwpc: u8,
    pub acwu: u16,
    rsvd534: u16,
    pub sgls: u32,
    pub mnan: u32,
    rsvd544: [u8; 224],
    pub subnqn: [u8; 256],
    rsvd1024: [u8; 768],
    pub ioccsz: u32,
    pub iorcsz: u32,
    pub icdoff: u16,
    pub ctrattr: u8,
    pub msdbd: u8,
    rsvd1804: [u8; 244],
    pub psd: [u8; 1024],
    pub vs: [u8; 1024],
}

impl Default for IdentifyControllerData {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl fmt::Debug for IdentifyControllerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifyControllerData")
            .field("vid", &self.vid)
            .field("cntlid", &self.cntlid)
            .field("nn", &self.nn)
            .field("aerl", &self.aerl)
            .field("mdts", &self.mdts)
            .finish()
    }
}

impl DataPage for IdentifyControllerData {}

impl IdentifyControllerData {
    /// ANA reporting capability (CMIC bit 3).
    pub fn cmic_ana_reporting(&self) -> bool {
        self.cmic & (1 << 3) != 0
    }

    pub fn oaes_ns_attribute_notices(&self) -> bool {
        self.oaes & (1 << 8) != 0
    }

    pub fn oaes_fw_activation_notices(&self) -> bool {
        self.oaes & (1 << 9) != 0
    }

    pub fn oaes_ana_change_notices(&self) -> bool {
        self.oaes & (1 << 11) != 0
    }

    pub fn ctratt_host_id_exhid_supported(&self) -> bool {
        self.ctratt & 1 != 0
    }

    pub fn oacs_security(&self) -> bool {
        self.oacs & (1 << 0) != 0
    }

    pub fn oacs_format(&self) -> bool {
        self.oacs & (1 << 1) != 0
    }

    pub fn oacs_firmware(&self) -> bool {
        self.oacs & (1 << 2) != 0
    }

    pub fn oacs_ns_manage(&self) -> bool {
        self.oacs & (1 << 3) != 0
    }

    pub fn oacs_directives(&self) -> bool {
        self.oacs & (1 << 5) != 0
    }

    pub fn oacs_doorbell_buffer_config(&self) -> bool {
        self.oacs & (1 << 8) != 0
    }

    /// Command effects log supported (LPA bit 1).
    pub fn lpa_celp(&self) -> bool {
        self.lpa & (1 << 1) != 0
    }

    /// Telemetry log supported (LPA bit 3).
    pub fn lpa_telemetry(&self) -> bool {
        self.lpa & (1 << 3) != 0
    }

    pub fn apsta_supported(&self) -> bool {
        self.apsta & 1 != 0
    }

    pub fn vwc_present(&self) -> bool {
        self.vwc & 1 != 0
    }

    /// SGL support descriptor (bits 0..2): 1 = supported, 2 = supported with
    /// dword alignment required.
    pub fn sgls_supported(&self) -> u32 {
        self.sgls & 0x3
    }

    pub fn fuses_compare_and_write(&self) -> bool {
        self.fuses & 1 != 0
    }
}

/// Identify Namespace data structure (CNS 0x00), 4096 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdentifyNsData {
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    pub nsfeat: u8,
    pub nlbaf: u8,
    pub flbas: u8,
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub nmic: u8,
    pub rescap: u8,
    pub fpi: u8,
    pub dlfeat: u8,
    pub nawun: u16,
    pub nawupf: u16,
    pub nacwu: u16,
    pub nabsn: u16,
    pub nabo: u16,
    pub nabspf: u16,
    pub noiob: u16,
    pub nvmcap: [u8; 16],
    pub npwg: u16,
    pub npwa: u16,
    pub npdg: u16,
    pub npda: u16,
    pub nows: u16,
    rsvd74: [u8; 18],
    pub anagrpid: u32,
    rsvd96: [u8; 3],
    pub nsattr: u8,
    pub nvmsetid: u16,
    pub endgid: u16,
    pub nguid: [u8; 16],
    pub eui64: [u8; 8],
    pub lbaf: [u32; 16],
    rsvd192: [u8; 192],
    pub vendor_specific: [u8; 3712],
}

impl Default for IdentifyNsData {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl fmt::Debug for IdentifyNsData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifyNsData")
            .field("nsze", &self.nsze)
            .field("ncap", &self.ncap)
            .field("anagrpid", &self.anagrpid)
            .finish()
    }
}

impl DataPage for IdentifyNsData {}

/// ZNS I/O command set specific Identify Controller data (CNS 0x06).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ZnsCtrlrData {
    pub zasl: u8,
    rsvd1: [u8; 4095],
}

impl Default for ZnsCtrlrData {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl fmt::Debug for ZnsCtrlrData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZnsCtrlrData").field("zasl", &self.zasl).finish()
    }
}

impl DataPage for ZnsCtrlrData {}

/// ZNS I/O command set specific Identify Namespace data (CNS 0x05).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ZnsNsData {
    pub zoc: u16,
    pub ozcs: u16,
    pub mar: u32,
    pub mor: u32,
    pub rrl: u32,
    pub frl: u32,
    rsvd20: [u8; 2796],
    pub lbafe: [[u8; 16]; 16],
    rsvd3072: [u8; 768],
    pub vendor_specific: [u8; 256],
}

impl Default for ZnsNsData {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl fmt::Debug for ZnsNsData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZnsNsData")
            .field("zoc", &self.zoc)
            .field("mar", &self.mar)
            .field("mor", &self.mor)
            .finish()
    }
}

impl DataPage for ZnsNsData {}

/// Active namespace list page (CNS 0x02): 1024 namespace ids, zero-terminated.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NsListPage {
    pub nsid: [u32; 1024],
}

impl Default for NsListPage {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl DataPage for NsListPage {}

/// Controller list payload for namespace attach/detach.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CtrlrListPage {
    pub ctrlr_count: u16,
    pub ctrlr_list: [u16; 2047],
}

impl Default for CtrlrListPage {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl DataPage for CtrlrListPage {}

/// Commands Supported and Effects log page (LID 0x05), 4096 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CommandsAndEffectsLogPage {
    pub admin_cmds_supported: [u32; 256],
    pub io_cmds_supported: [u32; 256],
    rsvd2048: [u8; 2048],
}

impl Default for CommandsAndEffectsLogPage {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl DataPage for CommandsAndEffectsLogPage {}

impl CommandsAndEffectsLogPage {
    /// Command supported bit (CSUPP) for an I/O opcode.
    pub fn io_cmd_supported(&self, opc: usize) -> bool {
        self.io_cmds_supported[opc] & 1 != 0
    }
}

/// Intel vendor specific log page directory (LID 0xC0).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IntelLogPageDirectory {
    pub version: [u8; 2],
    rsvd2: [u8; 5],
    pub read_latency_log_len: u8,
    rsvd8: u8,
    pub write_latency_log_len: u8,
    rsvd10: [u8; 2],
    pub temperature_statistics_log_len: u8,
    rsvd13: [u8; 8],
    pub smart_log_len: u8,
    rsvd22: [u8; 37],
    pub marketing_description_log_len: u8,
    rsvd60: [u8; 452],
}

impl Default for IntelLogPageDirectory {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl DataPage for IntelLogPageDirectory {}

/// Namespace identification descriptor types (CNS 0x03 payload).
pub const NIDT_EUI64: u8 = 0x01;
pub const NIDT_NGUID: u8 = 0x02;
pub const NIDT_UUID: u8 = 0x03;
pub const NIDT_CSI: u8 = 0x04;

/// Walks an NS ID descriptor list and returns the CSI descriptor, if present.
pub fn id_desc_list_csi(list: &[u8]) -> Option<Csi> {
    let mut off = 0usize;
    while off + 4 <= list.len() {
        let nidt = list[off];
        let nidl = list[off + 1] as usize;
        if nidt == 0 || nidl == 0 {
            break;
        }
        if nidt == NIDT_CSI && off + 4 < list.len() {
            return match list[off + 4] {
                0x00 => Some(Csi::Nvm),
                0x01 => Some(Csi::KeyValue),
                0x02 => Some(Csi::Zns),
                _ => None,
            };
        }
        off += 4 + nidl;
    }
    None
}

/// Builds a single NS ID descriptor list entry.
pub fn build_id_desc(nidt: u8, data: &[u8], out: &mut Vec<u8>) {
    out.push(nidt);
    out.push(data.len() as u8);
    out.push(0);
    out.push(0);
    out.extend_from_slice(data);
}

/// ANA log page header size.
pub const ANA_PAGE_HDR_SIZE: usize = 16;
/// ANA group descriptor size, excluding the trailing namespace ids.
pub const ANA_GROUP_DESC_SIZE: usize = 32;

/// Asymmetric namespace access states.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnaState {
    Optimized = 0x1,
    NonOptimized = 0x2,
    Inaccessible = 0x3,
    PersistentLoss = 0x4,
    Change = 0xf,
}

impl AnaState {
    pub fn from_raw(raw: u8) -> Option<AnaState> {
        match raw & 0xf {
            0x1 => Some(AnaState::Optimized),
            0x2 => Some(AnaState::NonOptimized),
            0x3 => Some(AnaState::Inaccessible),
            0x4 => Some(AnaState::PersistentLoss),
            0xf => Some(AnaState::Change),
            _ => None,
        }
    }
}

/// Parsed ANA group descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnaGroupDescriptor {
    pub ana_group_id: u32,
    pub change_count: u64,
    pub ana_state: Option<AnaState>,
    pub nsids: Vec<u32>,
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Parses an ANA log page buffer, invoking `f` per group descriptor.
/// Stops early and propagates the first error the callback returns.
pub fn parse_ana_log_page<F>(buf: &[u8], mut f: F) -> Result<(), nix::errno::Errno>
where
    F: FnMut(&AnaGroupDescriptor) -> Result<(), nix::errno::Errno>,
{
    if buf.len() < ANA_PAGE_HDR_SIZE {
        return Err(nix::errno::Errno::EINVAL);
    }

    let num_desc = read_u16(buf, 8) as usize;
    let mut off = ANA_PAGE_HDR_SIZE;

    for _ in 0..num_desc {
        if off + ANA_GROUP_DESC_SIZE > buf.len() {
            return Err(nix::errno::Errno::EINVAL);
        }

        let num_of_nsid = read_u32(buf, off + 4) as usize;
        let end = off + ANA_GROUP_DESC_SIZE + num_of_nsid * 4;
        if end > buf.len() {
            return Err(nix::errno::Errno::EINVAL);
        }

        let desc = AnaGroupDescriptor {
            ana_group_id: read_u32(buf, off),
            change_count: read_u64(buf, off + 8),
            ana_state: AnaState::from_raw(buf[off + 16]),
            nsids: (0..num_of_nsid)
                .map(|i| read_u32(buf, off + ANA_GROUP_DESC_SIZE + i * 4))
                .collect(),
        };

        f(&desc)?;
        off = end;
    }

    Ok(())
}

/// Serializes ANA group descriptors into a log page buffer.
pub fn build_ana_log_page(change_count: u64, descs: &[AnaGroupDescriptor]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&change_count.to_le_bytes());
    buf.extend_from_slice(&(descs.len() as u16).to_le_bytes());
    buf.resize(ANA_PAGE_HDR_SIZE, 0);

    for desc in descs {
        buf.extend_from_slice(&desc.ana_group_id.to_le_bytes());
        buf.extend_from_slice(&(desc.nsids.len() as u32).to_le_bytes());
        buf.extend_from_slice(&desc.change_count.to_le_bytes());
        buf.push(desc.ana_state.map_or(0, |s| s as u8));
        buf.resize(buf.len() + 15, 0);
        for nsid in &desc.nsids {
            buf.extend_from_slice(&nsid.to_le_bytes());
        }
    }

    buf
}

/// Size the ANA log buffer must have for the given group and namespace counts.
pub fn ana_log_page_size(nanagrpid: u32, active_ns_count: u32) -> usize {
    ANA_PAGE_HDR_SIZE
        + nanagrpid as usize * ANA_GROUP_DESC_SIZE
        + active_ns_count as usize * size_of::<u32>()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_sizes() {
        assert_eq!(size_of::<IdentifyControllerData>(), 4096);
        assert_eq!(size_of::<IdentifyNsData>(), 4096);
        assert_eq!(size_of::<ZnsCtrlrData>(), 4096);
        assert_eq!(size_of::<ZnsNsData>(), 4096);
        assert_eq!(size_of::<NsListPage>(), 4096);
        assert_eq!(size_of::<CtrlrListPage>(), 4096);
        assert_eq!(size_of::<CommandsAndEffectsLogPage>(), 4096);
        assert_eq!(size_of::<IntelLogPageDirectory>(), 512);
    }

    #[test]
    fn cdata_round_trip() {
        let mut cdata = IdentifyControllerData::default();
        cdata.vid = 0x8086;
        cdata.nn = 1024;
        cdata.aerl = 3;
        cdata.cmic = 1 << 3;
        cdata.sgls = 0x2;

        let copy = IdentifyControllerData::from_bytes(cdata.as_bytes());
        assert_eq!(copy.vid, 0x8086);
        assert_eq!(copy.nn, 1024);
        assert_eq!(copy.aerl, 3);
        assert!(copy.cmic_ana_reporting());
        assert_eq!(copy.sgls_supported(), 0x2);
    }

    #[test]
    fn status_classification() {
        assert!(!Status::SUCCESS.is_error());
        assert!(Status::generic(GenericStatusCode::InvalidField).is_error());
        assert!(
            Status::command_specific(CommandSpecificStatusCode::AsyncEventRequestLimitExceeded)
                .is_error()
        );
    }

    #[test]
    fn async_event_decode() {
        let ev = AsyncEvent::new(AerType::Notice, AerInfoNotice::AnaChange as u8, 0x0c);
        assert_eq!(ev.event_type(), AerType::Notice as u8);
        assert_eq!(ev.event_info(), AerInfoNotice::AnaChange as u8);
        assert_eq!(ev.log_page(), 0x0c);
    }

    #[test]
    fn ana_log_page_round_trip() {
        let descs = vec![AnaGroupDescriptor {
            ana_group_id: 1,
            change_count: 7,
            ana_state: Some(AnaState::Optimized),
            nsids: vec![1, 2, 4],
        }];

        let buf = build_ana_log_page(3, &descs);
        assert_eq!(buf.len(), ana_log_page_size(1, 3));

        let mut seen = Vec::new();
        parse_ana_log_page(&buf, |d| {
            seen.push(d.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, descs);
    }

    #[test]
    fn id_desc_list_finds_csi() {
        let mut list = vec![0u8; 0];
        build_id_desc(NIDT_EUI64, &[1, 2, 3, 4, 5, 6, 7, 8], &mut list);
        build_id_desc(NIDT_CSI, &[Csi::Zns as u8], &mut list);
        list.resize(4096, 0);

        assert_eq!(id_desc_list_csi(&list), Some(Csi::Zns));
    }

    #[test]
    fn fw_commit_cdw10() {
        let commit = FwCommit {
            fs: 2,
            ca: FwCommitAction::ReplaceBootPartition as u8,
            bpid: 1,
        };
        let cdw10 = commit.to_cdw10();
        assert_eq!(cdw10 & 0x7, 2);
        assert_eq!((cdw10 >> 3) & 0x7, 6);
        assert_eq!(cdw10 >> 31, 1);
    }
}
