//! User-space NVMe host controller engine.
//!
//! The crate drives an NVMe controller from a disabled hardware state to
//! ready, identifies its namespaces, manages I/O queue pairs and async event
//! requests across attaching processes, and exposes the admin command
//! surface. Transport specific register and queue mechanics (PCIe, RDMA,
//! TCP, FC) are consumed through the [`transport::NvmeTransport`] trait.

#[macro_use]
extern crate tracing;
extern crate nix;
#[macro_use]
extern crate serde;
extern crate snafu;

pub mod boot_partition;
pub mod controller;
pub mod controller_admin;
pub mod controller_init;
pub mod controller_state;
pub mod dma;
pub mod error;
pub mod namespace;
pub mod opts;
pub mod pages;
pub mod process;
pub mod qpair;
pub mod quirks;
pub mod registers;
pub mod transport;

pub use controller::{CtrlrFlags, NvmeController, MAX_ASYNC_EVENTS};
pub use controller_state::NvmeControllerState;
pub use dma::{DmaDeviceType, MemoryDomain, MemoryDomainCtx, TranslationResult};
pub use error::NvmeError;
pub use namespace::NvmeNamespace;
pub use opts::{IoQpairOpts, NvmeControllerOpts};
pub use qpair::{QPairFailureReason, QPairState, QPrio};
pub use quirks::{PciId, Quirks};
pub use transport::{
    AdminCommand, AdminRequest, AdminToken, DmaBuffer, NvmeTransport, Payload, RegisterCookie,
    TransportEvent, TransportId, TransportIdBuilder, TransportType,
};
