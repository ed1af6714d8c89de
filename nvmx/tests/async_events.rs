//! Asynchronous event handling: namespace attribute changes, ANA state
//! updates and AER slot accounting.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::{fake_controller, pump_until_ready};
use nvmx::pages::{
    ana_log_page_size, AerInfoNotice, AerType, AnaGroupDescriptor, AnaState, AsyncEvent,
};
use nvmx::opts;

fn notice(info: AerInfoNotice) -> u32 {
    AsyncEvent::new(AerType::Notice, info as u8, 0).0
}

#[test]
fn aer_slots_bounded_by_aerl() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    // aerl is zero-based: 3 means four outstanding AERs.
    assert_eq!(fake.state().held_aers.len(), 4);
}

#[test]
fn ns_attribute_change_rescans_namespaces() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    fake.state().active_ns = vec![1, 2, 100, 1024];

    pump_until_ready(&mut ctrlr);
    ctrlr.add_process(None).unwrap();

    assert_eq!(ctrlr.active_ns_count(), 4);
    assert!(ctrlr.is_active_ns(100));

    let fired = Arc::new(AtomicU32::new(0));
    let seen_cdw0 = Arc::new(AtomicU32::new(0));
    {
        let fired = fired.clone();
        let seen_cdw0 = seen_cdw0.clone();
        ctrlr.register_aer_callback(Some(Box::new(move |cpl| {
            fired.fetch_add(1, Ordering::SeqCst);
            seen_cdw0.store(cpl.cdw0, Ordering::SeqCst);
        })));
    }

    // Namespace 100 disappears, then the device posts the notice.
    fake.state().active_ns = vec![1, 2, 1024];
    let cdw0 = notice(AerInfoNotice::NsAttrChanged);
    fake.fire_aer(cdw0);

    ctrlr.process_admin_completions().unwrap();

    assert_eq!(ctrlr.active_ns_count(), 3);
    assert!(!ctrlr.is_active_ns(100));
    assert!(ctrlr.is_active_ns(1024));
    // The namespace object survives deactivation.
    assert!(ctrlr.ns(100).is_some());

    // The registered callback fired exactly once, with the original cpl.
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(seen_cdw0.load(Ordering::SeqCst), cdw0);

    // The vacated AER slot was reposted.
    assert_eq!(fake.state().held_aers.len(), 4);
}

#[test]
fn ana_change_resizes_buffer_and_updates_states() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    {
        let mut state = fake.state();
        state.cdata.cmic = 1 << 3; /* ANA reporting */
        state.cdata.nanagrpid = 1;
        state.active_ns = vec![1, 2];
        state.ana_descs = vec![AnaGroupDescriptor {
            ana_group_id: 1,
            change_count: 1,
            ana_state: Some(AnaState::Optimized),
            nsids: vec![1, 2],
        }];
    }

    pump_until_ready(&mut ctrlr);
    ctrlr.add_process(None).unwrap();

    assert_eq!(ctrlr.ana_log_page_len(), ana_log_page_size(1, 2));
    assert_eq!(ctrlr.ns(1).unwrap().ana_state(), AnaState::Optimized);

    // Two namespaces appear...
    fake.state().active_ns = vec![1, 2, 3, 4];
    fake.fire_aer(notice(AerInfoNotice::NsAttrChanged));
    ctrlr.process_admin_completions().unwrap();
    assert_eq!(ctrlr.active_ns_count(), 4);

    // ...and the device reports all four as optimized in one ANA group.
    {
        let mut state = fake.state();
        state.ana_change_count = 2;
        state.ana_descs = vec![AnaGroupDescriptor {
            ana_group_id: 1,
            change_count: 2,
            ana_state: Some(AnaState::Optimized),
            nsids: vec![1, 2, 3, 4],
        }];
    }
    fake.fire_aer(notice(AerInfoNotice::AnaChange));
    ctrlr.process_admin_completions().unwrap();

    // The ANA buffer grew to fit the four namespace ids.
    assert_eq!(ctrlr.ana_log_page_len(), ana_log_page_size(1, 4));
    for nsid in 1..=4 {
        assert_eq!(ctrlr.ns(nsid).unwrap().ana_state(), AnaState::Optimized);
        assert_eq!(ctrlr.ns(nsid).unwrap().ana_group_id(), 1);
    }
}

#[test]
fn events_fan_out_to_every_process() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    ctrlr.add_process(None).unwrap();
    ctrlr.add_process_for(1, None).unwrap();

    fake.fire_aer(notice(AerInfoNotice::FwActivationStart));
    ctrlr.process_admin_completions().unwrap();

    // The calling process drained its queue; the other process still has
    // the event pending.
    assert_eq!(ctrlr.queued_async_event_count_for(1), 1);
    assert_eq!(
        ctrlr.queued_async_event_count_for(nvmx::process::current_pid()),
        0
    );
}
