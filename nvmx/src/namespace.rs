//! Namespace objects owned by the controller.
//!
//! Namespaces are constructed on demand and never freed while the controller
//! lives; deactivation clears `active` so references stay valid across
//! resets.

use crate::pages::{id_desc_list_csi, AnaState, Csi, IdentifyNsData, ZnsNsData};

pub const ID_DESC_LIST_SIZE: usize = 4096;

#[derive(Debug)]
pub struct NvmeNamespace {
    id: u32,
    pub(crate) active: bool,
    pub(crate) nsdata: IdentifyNsData,
    pub(crate) csi: Csi,
    pub(crate) id_desc_list: Box<[u8]>,
    pub(crate) nsdata_zns: Option<Box<ZnsNsData>>,
    pub(crate) ana_group_id: u32,
    pub(crate) ana_state: AnaState,
}

impl NvmeNamespace {
    pub(crate) fn new(id: u32) -> Self {
        NvmeNamespace {
            id,
            active: false,
            nsdata: IdentifyNsData::default(),
            csi: Csi::Nvm,
            id_desc_list: vec![0u8; ID_DESC_LIST_SIZE].into_boxed_slice(),
            nsdata_zns: None,
            ana_group_id: 0,
            ana_state: AnaState::Optimized,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn nsdata(&self) -> &IdentifyNsData {
        &self.nsdata
    }

    pub fn csi(&self) -> Csi {
        self.csi
    }

    pub fn num_blocks(&self) -> u64 {
        self.nsdata.nsze
    }

    pub fn ana_group_id(&self) -> u32 {
        self.ana_group_id
    }

    pub fn ana_state(&self) -> AnaState {
        self.ana_state
    }

    pub fn id_desc_list(&self) -> &[u8] {
        &self.id_desc_list
    }

    pub fn zns_data(&self) -> Option<&ZnsNsData> {
        self.nsdata_zns.as_deref()
    }

    /// Whether this namespace has an IOCS specific identify structure we
    /// know how to fetch.
    pub(crate) fn has_supported_iocs_specific_data(&self) -> bool {
        matches!(self.csi, Csi::Zns)
    }

    /// Applies a freshly fetched identify payload.
    pub(crate) fn set_identify_data(&mut self, nsdata: IdentifyNsData) {
        self.nsdata = nsdata;
    }

    /// Applies the NS ID descriptor list and derives the command set.
    pub(crate) fn set_id_desc_list_data(&mut self, list: &[u8]) {
        let n = list.len().min(self.id_desc_list.len());
        self.id_desc_list[..n].copy_from_slice(&list[..n]);
        self.csi = id_desc_list_csi(&self.id_desc_list).unwrap_or(Csi::Nvm);
    }

    pub(crate) fn free_iocs_specific_data(&mut self) {
        self.nsdata_zns = None;
    }

    /// Tears down per-namespace state while keeping the object alive for
    /// outstanding references.
    pub(crate) fn destruct(&mut self) {
        self.active = false;
        self.nsdata = IdentifyNsData::default();
        self.id_desc_list.iter_mut().for_each(|b| *b = 0);
        self.csi = Csi::Nvm;
        self.free_iocs_specific_data();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pages::{build_id_desc, NIDT_CSI};

    #[test]
    fn csi_derived_from_id_desc_list() {
        let mut ns = NvmeNamespace::new(1);
        assert_eq!(ns.csi(), Csi::Nvm);

        let mut list = Vec::new();
        build_id_desc(NIDT_CSI, &[Csi::Zns as u8], &mut list);
        ns.set_id_desc_list_data(&list);

        assert_eq!(ns.csi(), Csi::Zns);
        assert!(ns.has_supported_iocs_specific_data());
    }

    #[test]
    fn destruct_keeps_object_but_clears_state() {
        let mut ns = NvmeNamespace::new(7);
        ns.active = true;
        ns.nsdata.nsze = 1000;
        ns.nsdata_zns = Some(Box::new(Default::default()));

        ns.destruct();

        assert_eq!(ns.id(), 7);
        assert!(!ns.is_active());
        assert_eq!(ns.num_blocks(), 0);
        assert!(ns.zns_data().is_none());
    }
}
