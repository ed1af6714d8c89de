//! Device specific workarounds keyed by PCI identity.

use std::fmt;
use std::ops::BitOr;

/// Wildcard matching any PCI id component.
pub const PCI_ANY_ID: u16 = 0xffff;

/// PCI identity of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciId {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subvendor_id: u16,
    pub subdevice_id: u16,
}

pub const PCI_VID_INTEL: u16 = 0x8086;
pub const PCI_VID_MEMBLAZE: u16 = 0x1c5f;

impl PciId {
    pub const fn new(vendor_id: u16, device_id: u16, subvendor_id: u16, subdevice_id: u16) -> Self {
        PciId {
            vendor_id,
            device_id,
            subvendor_id,
            subdevice_id,
        }
    }

    /// Compare each field. `PCI_ANY_ID` in `self` matches everything.
    fn matches(&self, other: &PciId) -> bool {
        (self.vendor_id == PCI_ANY_ID || self.vendor_id == other.vendor_id)
            && (self.device_id == PCI_ANY_ID || self.device_id == other.device_id)
            && (self.subvendor_id == PCI_ANY_ID || self.subvendor_id == other.subvendor_id)
            && (self.subdevice_id == PCI_ANY_ID || self.subdevice_id == other.subdevice_id)
    }
}

/// Bitmask of workarounds honored by the controller engine.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Quirks(pub u64);

impl Quirks {
    pub const NONE: Quirks = Quirks(0);
    /// Vendor latency log pages present despite a zero directory length.
    pub const INTEL_READ_LATENCY: Quirks = Quirks(1 << 0);
    pub const INTEL_WRITE_LATENCY: Quirks = Quirks(1 << 1);
    /// Wait 2.5 seconds after disabling before touching registers again.
    pub const DELAY_BEFORE_CHK_RDY: Quirks = Quirks(1 << 2);
    pub const INTEL_STRIPING: Quirks = Quirks(1 << 3);
    /// Controller predates or violates Identify CNS 0x02/0x03 support.
    pub const IDENTIFY_CNS: Quirks = Quirks(1 << 4);
    /// OACS reports security support the device does not actually have.
    pub const OACS_SECURITY: Quirks = Quirks(1 << 5);
    /// Settle time after I/O qpair allocation.
    pub const DELAY_AFTER_QUEUE_ALLOC: Quirks = Quirks(1 << 6);
    /// Shutdown never reports SHST_COMPLETE.
    pub const SHST_COMPLETE: Quirks = Quirks(1 << 7);
    /// Delay the very first enable after a bus reset.
    pub const DELAY_BEFORE_INIT: Quirks = Quirks(1 << 8);
    /// Device wants a larger I/O queue than our default.
    pub const MINIMUM_IO_QUEUE_SIZE: Quirks = Quirks(1 << 9);
    /// Vendor log page directory not implemented.
    pub const INTEL_NO_LOG_PAGES: Quirks = Quirks(1 << 10);

    pub fn contains(&self, other: Quirks) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Quirks {
    type Output = Quirks;

    fn bitor(self, rhs: Quirks) -> Quirks {
        Quirks(self.0 | rhs.0)
    }
}

impl fmt::Debug for Quirks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quirks(0x{:x})", self.0)
    }
}

struct QuirkEntry {
    id: PciId,
    flags: Quirks,
}

static QUIRK_TABLE: &[QuirkEntry] = &[
    QuirkEntry {
        id: PciId::new(PCI_VID_INTEL, 0x0953, PCI_VID_INTEL, 0x3702),
        flags: Quirks(
            Quirks::INTEL_READ_LATENCY.0 | Quirks::INTEL_WRITE_LATENCY.0 | Quirks::INTEL_STRIPING.0,
        ),
    },
    QuirkEntry {
        id: PciId::new(PCI_VID_INTEL, 0x0953, PCI_VID_INTEL, 0x3703),
        flags: Quirks(
            Quirks::INTEL_READ_LATENCY.0 | Quirks::INTEL_WRITE_LATENCY.0 | Quirks::INTEL_STRIPING.0,
        ),
    },
    QuirkEntry {
        id: PciId::new(PCI_VID_INTEL, 0x0953, PCI_VID_INTEL, 0x3704),
        flags: Quirks(
            Quirks::INTEL_READ_LATENCY.0 | Quirks::INTEL_WRITE_LATENCY.0 | Quirks::INTEL_STRIPING.0,
        ),
    },
    QuirkEntry {
        id: PciId::new(PCI_VID_INTEL, 0x0953, PCI_VID_INTEL, 0x3705),
        flags: Quirks(
            Quirks::INTEL_READ_LATENCY.0 | Quirks::INTEL_WRITE_LATENCY.0 | Quirks::INTEL_STRIPING.0,
        ),
    },
    QuirkEntry {
        id: PciId::new(PCI_VID_INTEL, 0x0953, PCI_VID_INTEL, 0x3709),
        flags: Quirks(
            Quirks::INTEL_READ_LATENCY.0 | Quirks::INTEL_WRITE_LATENCY.0 | Quirks::INTEL_STRIPING.0,
        ),
    },
    QuirkEntry {
        id: PciId::new(PCI_VID_INTEL, 0x0953, PCI_VID_INTEL, 0x370a),
        flags: Quirks(
            Quirks::INTEL_READ_LATENCY.0 | Quirks::INTEL_WRITE_LATENCY.0 | Quirks::INTEL_STRIPING.0,
        ),
    },
    QuirkEntry {
        id: PciId::new(PCI_VID_INTEL, 0x0953, PCI_ANY_ID, PCI_ANY_ID),
        flags: Quirks::INTEL_STRIPING,
    },
    QuirkEntry {
        id: PciId::new(PCI_VID_MEMBLAZE, 0x0540, PCI_ANY_ID, PCI_ANY_ID),
        flags: Quirks::DELAY_BEFORE_CHK_RDY,
    },
];

/// Resolve the workaround bitmask for a PCI identity. The first matching
/// table entry wins.
pub fn quirks_for(id: &PciId) -> Quirks {
    for entry in QUIRK_TABLE {
        if entry.id.matches(id) {
            return entry.flags;
        }
    }
    Quirks::NONE
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_match() {
        let q = quirks_for(&PciId::new(PCI_VID_INTEL, 0x0953, PCI_VID_INTEL, 0x3702));
        assert!(q.contains(Quirks::INTEL_READ_LATENCY));
        assert!(q.contains(Quirks::INTEL_WRITE_LATENCY));
        assert!(q.contains(Quirks::INTEL_STRIPING));
    }

    #[test]
    fn wildcard_match() {
        // Unknown subsystem ids still match the catch-all entry.
        let q = quirks_for(&PciId::new(PCI_VID_INTEL, 0x0953, 0x1234, 0x5678));
        assert_eq!(q, Quirks::INTEL_STRIPING);

        let q = quirks_for(&PciId::new(PCI_VID_MEMBLAZE, 0x0540, 0x0001, 0x0001));
        assert_eq!(q, Quirks::DELAY_BEFORE_CHK_RDY);
    }

    #[test]
    fn no_match() {
        let q = quirks_for(&PciId::new(0x1b36, 0x0010, PCI_ANY_ID, PCI_ANY_ID));
        assert!(q.is_empty());
    }
}
