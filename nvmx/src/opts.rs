//! Controller and I/O qpair options.

use crate::registers::ArbMechanism;

/// Upper bound on I/O qpairs; qid 0 is the admin queue.
pub const MAX_IO_QUEUES: u32 = 65534;
pub const DEFAULT_MAX_IO_QUEUES: u32 = 1024;

pub const DEFAULT_IO_QUEUE_SIZE: u32 = 256;
pub const MIN_IO_QUEUE_ENTRIES: u32 = 2;
pub const MAX_IO_QUEUE_ENTRIES: u32 = 65536;
/// Queue depth some devices need despite the smaller default.
pub const IO_QUEUE_SIZE_FOR_QUIRK: u32 = 1024;

pub const DEFAULT_IO_QUEUE_REQUESTS: u32 = 512;

pub const DEFAULT_ADMIN_QUEUE_SIZE: u32 = 32;
pub const MIN_ADMIN_QUEUE_ENTRIES: u32 = 2;
pub const MAX_ADMIN_QUEUE_ENTRIES: u32 = 4096;

pub const MIN_KEEP_ALIVE_TIMEOUT_MS: u32 = 10_000;
pub const DEFAULT_TRANSPORT_RETRY_COUNT: u8 = 4;
pub const DEFAULT_ADMIN_TIMEOUT_MS: u32 = 120_000;
pub const DEFAULT_FABRICS_CONNECT_TIMEOUT_US: u64 = 1_000_000;

/// Value of `command_set` meaning "pick the best supported set at enable".
pub const COMMAND_SET_AUTO: u8 = 8;

/// Submission and completion queue entry sizes (bytes).
pub const SQ_ENTRY_SIZE: u64 = 64;
pub const CQ_ENTRY_SIZE: u64 = 16;

/// Options negotiated between the user and the controller during attach.
#[derive(Debug, Clone)]
pub struct NvmeControllerOpts {
    pub num_io_queues: u32,
    pub use_cmb_sqs: bool,
    pub no_shn_notification: bool,
    pub arb_mechanism: ArbMechanism,
    pub arbitration_burst: u8,
    pub low_priority_weight: u8,
    pub medium_priority_weight: u8,
    pub high_priority_weight: u8,
    pub keep_alive_timeout_ms: u32,
    pub transport_retry_count: u8,
    pub io_queue_size: u32,
    pub io_queue_requests: u32,
    pub admin_queue_size: u32,
    pub hostnqn: String,
    pub host_id: [u8; 8],
    pub extended_host_id: [u8; 16],
    pub src_addr: String,
    pub src_svcid: String,
    pub command_set: u8,
    pub admin_timeout_ms: u32,
    pub header_digest: bool,
    pub data_digest: bool,
    pub disable_error_logging: bool,
    pub transport_ack_timeout: u8,
    pub fabrics_connect_timeout_us: u64,
    pub disable_read_ana_log_page: bool,
}

impl Default for NvmeControllerOpts {
    fn default() -> Self {
        let host_uuid = uuid::Uuid::new_v4();

        Self {
            num_io_queues: DEFAULT_MAX_IO_QUEUES,
            use_cmb_sqs: false,
            no_shn_notification: false,
            arb_mechanism: ArbMechanism::RoundRobin,
            arbitration_burst: 0,
            low_priority_weight: 0,
            medium_priority_weight: 0,
            high_priority_weight: 0,
            keep_alive_timeout_ms: MIN_KEEP_ALIVE_TIMEOUT_MS,
            transport_retry_count: DEFAULT_TRANSPORT_RETRY_COUNT,
            io_queue_size: DEFAULT_IO_QUEUE_SIZE,
            io_queue_requests: DEFAULT_IO_QUEUE_REQUESTS,
            admin_queue_size: DEFAULT_ADMIN_QUEUE_SIZE,
            hostnqn: format!(
                "nqn.2014-08.org.nvmexpress:uuid:{}",
                host_uuid.as_hyphenated()
            ),
            host_id: [0; 8],
            extended_host_id: *host_uuid.as_bytes(),
            src_addr: String::new(),
            src_svcid: String::new(),
            command_set: COMMAND_SET_AUTO,
            admin_timeout_ms: DEFAULT_ADMIN_TIMEOUT_MS,
            header_digest: false,
            data_digest: false,
            disable_error_logging: false,
            transport_ack_timeout: 0,
            fabrics_connect_timeout_us: DEFAULT_FABRICS_CONNECT_TIMEOUT_US,
            disable_read_ana_log_page: false,
        }
    }
}

/// Builder to override default controller options.
#[derive(Debug, Default)]
pub struct Builder {
    num_io_queues: Option<u32>,
    arb_mechanism: Option<ArbMechanism>,
    arbitration_burst: Option<u8>,
    priority_weights: Option<(u8, u8, u8)>,
    admin_timeout_ms: Option<u32>,
    disable_error_logging: Option<bool>,
    fabrics_connect_timeout_us: Option<u64>,
    ext_host_id: Option<[u8; 16]>,
    host_id: Option<[u8; 8]>,
    host_nqn: Option<String>,
    keep_alive_timeout_ms: Option<u32>,
    transport_retry_count: Option<u8>,
    io_queue_size: Option<u32>,
    admin_queue_size: Option<u32>,
    command_set: Option<u8>,
    no_shn_notification: Option<bool>,
    disable_read_ana_log_page: Option<bool>,
}

#[allow(dead_code)]
impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_io_queues(mut self, n: u32) -> Self {
        self.num_io_queues = Some(n);
        self
    }

    pub fn with_arb_mechanism(mut self, ams: ArbMechanism) -> Self {
        self.arb_mechanism = Some(ams);
        self
    }

    pub fn with_arbitration_burst(mut self, burst: u8) -> Self {
        self.arbitration_burst = Some(burst);
        self
    }

    /// WRR weights, low/medium/high.
    pub fn with_priority_weights(mut self, low: u8, medium: u8, high: u8) -> Self {
        self.priority_weights = Some((low, medium, high));
        self
    }

    pub fn with_admin_timeout_ms(mut self, timeout: u32) -> Self {
        self.admin_timeout_ms = Some(timeout);
        self
    }

    pub fn with_fabrics_connect_timeout_us(mut self, timeout: u64) -> Self {
        self.fabrics_connect_timeout_us = Some(timeout);
        self
    }

    pub fn with_transport_retry_count(mut self, count: u8) -> Self {
        self.transport_retry_count = Some(count);
        self
    }

    pub fn with_keep_alive_timeout_ms(mut self, timeout: u32) -> Self {
        self.keep_alive_timeout_ms = Some(timeout);
        self
    }

    pub fn disable_error_logging(mut self, disable: bool) -> Self {
        self.disable_error_logging = Some(disable);
        self
    }

    pub fn with_ext_host_id(mut self, ext_host_id: [u8; 16]) -> Self {
        self.ext_host_id = Some(ext_host_id);
        self
    }

    pub fn with_host_id(mut self, host_id: [u8; 8]) -> Self {
        self.host_id = Some(host_id);
        self
    }

    pub fn with_hostnqn<T: Into<String>>(mut self, host_nqn: T) -> Self {
        self.host_nqn = Some(host_nqn.into());
        self
    }

    pub fn with_io_queue_size(mut self, size: u32) -> Self {
        self.io_queue_size = Some(size);
        self
    }

    pub fn with_admin_queue_size(mut self, size: u32) -> Self {
        self.admin_queue_size = Some(size);
        self
    }

    /// Requested CSS value; `>= 8` selects the best supported set.
    pub fn with_command_set(mut self, css: u8) -> Self {
        self.command_set = Some(css);
        self
    }

    pub fn with_no_shn_notification(mut self, no_shn: bool) -> Self {
        self.no_shn_notification = Some(no_shn);
        self
    }

    pub fn with_disable_read_ana_log_page(mut self, disable: bool) -> Self {
        self.disable_read_ana_log_page = Some(disable);
        self
    }

    /// Builder to override default values.
    pub fn build(self) -> NvmeControllerOpts {
        let mut opts = NvmeControllerOpts::default();

        if let Some(n) = self.num_io_queues {
            opts.num_io_queues = n;
        }
        if let Some(ams) = self.arb_mechanism {
            opts.arb_mechanism = ams;
        }
        if let Some(burst) = self.arbitration_burst {
            opts.arbitration_burst = burst;
        }
        if let Some((low, medium, high)) = self.priority_weights {
            opts.low_priority_weight = low;
            opts.medium_priority_weight = medium;
            opts.high_priority_weight = high;
        }
        if let Some(timeout_ms) = self.admin_timeout_ms {
            opts.admin_timeout_ms = timeout_ms;
        }
        if let Some(timeout_us) = self.fabrics_connect_timeout_us {
            opts.fabrics_connect_timeout_us = timeout_us;
        }
        if let Some(retries) = self.transport_retry_count {
            opts.transport_retry_count = retries;
        }
        if let Some(timeout_ms) = self.keep_alive_timeout_ms {
            opts.keep_alive_timeout_ms = timeout_ms;
        }
        if let Some(disable) = self.disable_error_logging {
            opts.disable_error_logging = disable;
        }
        if let Some(ext_host_id) = self.ext_host_id {
            opts.extended_host_id = ext_host_id;
        }
        if let Some(host_id) = self.host_id {
            opts.host_id = host_id;
        }
        if let Some(host_nqn) = self.host_nqn {
            opts.hostnqn = host_nqn;
        }
        if let Some(size) = self.io_queue_size {
            opts.io_queue_size = size;
        }
        if let Some(size) = self.admin_queue_size {
            opts.admin_queue_size = size;
        }
        if let Some(css) = self.command_set {
            opts.command_set = css;
        }
        if let Some(no_shn) = self.no_shn_notification {
            opts.no_shn_notification = no_shn;
        }
        if let Some(disable) = self.disable_read_ana_log_page {
            opts.disable_read_ana_log_page = disable;
        }

        opts
    }
}

/// Caller supplied queue memory, validated against the requested queue size.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueBuffer {
    pub vaddr: u64,
    pub paddr: u64,
    pub buffer_size: u64,
}

/// I/O qpair creation options.
#[derive(Debug, Clone)]
pub struct IoQpairOpts {
    pub qprio: u8,
    pub io_queue_size: u32,
    pub io_queue_requests: u32,
    pub delay_cmd_submit: bool,
    pub sq: QueueBuffer,
    pub cq: QueueBuffer,
    pub create_only: bool,
    pub async_mode: bool,
}

impl IoQpairOpts {
    /// Defaults derived from the negotiated controller options.
    pub fn default_for(ctrlr_opts: &NvmeControllerOpts) -> Self {
        IoQpairOpts {
            qprio: 0,
            io_queue_size: ctrlr_opts.io_queue_size,
            io_queue_requests: ctrlr_opts.io_queue_requests,
            delay_cmd_submit: false,
            sq: QueueBuffer::default(),
            cq: QueueBuffer::default(),
            create_only: false,
            async_mode: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_controller_options() {
        let opts = NvmeControllerOpts::default();

        assert_eq!(opts.num_io_queues, DEFAULT_MAX_IO_QUEUES);
        assert_eq!(opts.keep_alive_timeout_ms, MIN_KEEP_ALIVE_TIMEOUT_MS);
        assert_eq!(opts.command_set, COMMAND_SET_AUTO);
        assert_eq!(opts.admin_timeout_ms, DEFAULT_ADMIN_TIMEOUT_MS);
        assert!(opts.hostnqn.starts_with("nqn.2014-08.org.nvmexpress:uuid:"));
        assert_ne!(opts.extended_host_id, [0u8; 16]);
        assert_eq!(opts.host_id, [0u8; 8]);
    }

    #[test]
    fn builder_overrides() {
        let opts = Builder::new()
            .with_admin_timeout_ms(1)
            .with_fabrics_connect_timeout_us(1)
            .with_transport_retry_count(1)
            .with_keep_alive_timeout_ms(0)
            .with_arb_mechanism(ArbMechanism::WeightedRoundRobin)
            .with_priority_weights(7, 15, 31)
            .build();

        assert_eq!(opts.admin_timeout_ms, 1);
        assert_eq!(opts.fabrics_connect_timeout_us, 1);
        assert_eq!(opts.transport_retry_count, 1);
        assert_eq!(opts.keep_alive_timeout_ms, 0);
        assert_eq!(opts.arb_mechanism, ArbMechanism::WeightedRoundRobin);
        assert_eq!(opts.high_priority_weight, 31);
    }

    #[test]
    fn io_qpair_defaults_follow_controller() {
        let ctrlr_opts = Builder::new().with_io_queue_size(128).build();
        let opts = IoQpairOpts::default_for(&ctrlr_opts);

        assert_eq!(opts.io_queue_size, 128);
        assert_eq!(opts.qprio, 0);
        assert!(!opts.create_only);
    }
}
