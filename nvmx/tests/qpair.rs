//! I/O qpair lifecycle: allocation, qid recycling, reset behavior and
//! multi-process ownership accounting.

mod common;

use assert_matches::assert_matches;

use common::{fake_controller, pump_until_ready};
use nvmx::error::NvmeError;
use nvmx::opts::{self, IoQpairOpts};
use nvmx::{NvmeControllerState, QPairFailureReason, QPairState};

#[test]
fn alloc_rejects_before_ready() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());

    assert_matches!(
        ctrlr.alloc_io_qpair(None),
        Err(NvmeError::InvalidState { .. })
    );
}

#[test]
fn alloc_validates_qprio() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    let mut qp_opts = IoQpairOpts::default_for(ctrlr.opts());
    qp_opts.qprio = 4;
    assert_matches!(
        ctrlr.alloc_io_qpair(Some(qp_opts)),
        Err(NvmeError::InvalidQprio { qprio: 4 })
    );

    // Round robin arbitration only accepts the urgent class.
    let mut qp_opts = IoQpairOpts::default_for(ctrlr.opts());
    qp_opts.qprio = 2;
    assert_matches!(
        ctrlr.alloc_io_qpair(Some(qp_opts)),
        Err(NvmeError::InvalidQprio { .. })
    );
}

#[test]
fn alloc_validates_queue_buffers() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    let mut qp_opts = IoQpairOpts::default_for(ctrlr.opts());
    qp_opts.sq.vaddr = 0x1000;
    qp_opts.sq.buffer_size = 64; /* too small for io_queue_size entries */
    assert_matches!(
        ctrlr.alloc_io_qpair(Some(qp_opts)),
        Err(NvmeError::InvalidParam { .. })
    );
}

#[test]
fn qid_is_recycled_in_first_set_order() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    let first = ctrlr.alloc_io_qpair(None).unwrap();
    let second = ctrlr.alloc_io_qpair(None).unwrap();
    assert_ne!(first, second);

    ctrlr.free_io_qpair(first).unwrap();

    // The freed qid is immediately re-allocatable and comes back first.
    let third = ctrlr.alloc_io_qpair(None).unwrap();
    assert_eq!(third, first);
}

#[test]
fn active_list_matches_process_ownership() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    ctrlr.add_process(None).unwrap();
    // Attaching twice is a no-op.
    ctrlr.add_process(None).unwrap();
    // pid 1 stands in for another live process.
    ctrlr.add_process_for(1, None).unwrap();
    assert_eq!(ctrlr.process_count(), 2);

    let q1 = ctrlr.alloc_io_qpair(None).unwrap();
    let q2 = ctrlr.alloc_io_qpair(None).unwrap();

    // The sum of per-process owned qpairs equals the controller's active
    // count (all were allocated by the calling process here).
    assert_eq!(ctrlr.active_io_qpair_count(), 2);
    assert_eq!(ctrlr.io_qpair_state(q1), Some(QPairState::Connected));
    assert_eq!(ctrlr.io_qpair_state(q2), Some(QPairState::Connected));

    ctrlr.free_io_qpair(q1).unwrap();
    assert_eq!(ctrlr.active_io_qpair_count(), 1);
    assert_eq!(ctrlr.io_qpair_state(q1), None);
}

#[test]
fn proc_put_ref_keeps_last_process() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    ctrlr.add_process(None).unwrap();
    ctrlr.proc_get_ref();
    assert_eq!(ctrlr.get_ref_count(), 1);

    // The sole process is not removed when its refcount hits zero; that
    // happens during controller destruction.
    ctrlr.proc_put_ref();
    assert_eq!(ctrlr.get_ref_count(), 0);
    assert_eq!(ctrlr.process_count(), 1);

    // With a second process attached, the zero-ref process goes away.
    ctrlr.add_process_for(1, None).unwrap();
    ctrlr.proc_get_ref();
    ctrlr.proc_put_ref();
    assert_eq!(ctrlr.process_count(), 1);
}

#[test]
fn reconnect_errors_reflect_controller_state() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    let qid = ctrlr.alloc_io_qpair(None).unwrap();

    // Connected qpair: reconnect is a no-op success.
    assert!(ctrlr.reconnect_io_qpair(qid).is_ok());

    ctrlr.disconnect_io_qpair(qid);

    // Transport refuses: EAGAIN-flavored error.
    fake.state().fail_connect_qids.insert(qid);
    assert_matches!(
        ctrlr.reconnect_io_qpair(qid),
        Err(NvmeError::QpairConnect { .. })
    );

    // Transport accepts again.
    fake.state().fail_connect_qids.remove(&qid);
    assert!(ctrlr.reconnect_io_qpair(qid).is_ok());
    assert_eq!(ctrlr.io_qpair_state(qid), Some(QPairState::Connected));

    // A failed controller reports ENXIO.
    ctrlr.fail_ctrlr();
    ctrlr.disconnect_io_qpair(qid);
    assert_matches!(
        ctrlr.reconnect_io_qpair(qid),
        Err(NvmeError::ControllerFailed)
    );
}

#[test]
fn reset_with_partial_qpair_reconnect() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    ctrlr.add_process(None).unwrap();
    let q1 = ctrlr.alloc_io_qpair(None).unwrap();
    let q2 = ctrlr.alloc_io_qpair(None).unwrap();

    // Make the second qpair fail its reconnect during reset.
    fake.state().fail_connect_qids.insert(q2);

    ctrlr.reset().expect("reset reports success");
    assert_eq!(ctrlr.state(), NvmeControllerState::Ready);

    // First qpair is connected again; the second stays in the active list
    // with a local failure reason.
    assert_eq!(ctrlr.io_qpair_state(q1), Some(QPairState::Connected));
    assert_eq!(
        ctrlr.io_qpair_failure_reason(q2),
        Some(QPairFailureReason::Local)
    );
    assert_eq!(ctrlr.active_io_qpair_count(), 2);
}

#[test]
fn free_io_qpair_is_deferred_in_completion_context() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    let qid = ctrlr.alloc_io_qpair(None).unwrap();

    ctrlr.mark_qpair_completion_context(qid, true).unwrap();
    ctrlr.free_io_qpair(qid).unwrap();

    // Still present; deletion deferred until the context unwinds.
    assert_eq!(ctrlr.active_io_qpair_count(), 1);

    ctrlr.mark_qpair_completion_context(qid, false).unwrap();
    assert_eq!(ctrlr.active_io_qpair_count(), 0);
    assert_eq!(ctrlr.io_qpair_state(qid), None);
}
