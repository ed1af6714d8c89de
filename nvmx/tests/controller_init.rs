//! Controller bring-up, reset and re-targeting scenarios.

mod common;

use assert_matches::assert_matches;

use common::{fake_controller, pump_until_ready};
use nvmx::error::NvmeError;
use nvmx::opts;
use nvmx::registers::ArbMechanism;
use nvmx::{NvmeControllerState, TransportIdBuilder, TransportType};

#[test]
fn enable_from_disabled() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());

    {
        let state = fake.state();
        assert!(!state.cc.en());
        assert!(!state.csts.rdy());
    }

    pump_until_ready(&mut ctrlr);

    let state = fake.state();
    assert!(state.cc.en());
    assert!(state.csts.rdy());
    // The controller was disabled to begin with; no EN=0 write was needed.
    assert_eq!(state.set_en0_writes, 0);
    drop(state);

    // Ready-state invariants: the free qid bitset exists and every reported
    // namespace is active.
    assert!(ctrlr.alloc_io_qpair(None).is_ok());
    assert!(ctrlr.is_active_ns(1));
    assert!(ctrlr.is_active_ns(2));
    assert!(!ctrlr.is_active_ns(3));
    assert_eq!(ctrlr.active_ns_count(), 2);
}

#[test]
fn enable_from_already_enabled() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());

    {
        let mut state = fake.state();
        state.cc.set_en(true);
        state.csts.set_rdy(true);
    }

    pump_until_ready(&mut ctrlr);

    let state = fake.state();
    // The machine had to drive CSTS.RDY through 1 -> 0 -> 1.
    assert_eq!(state.set_en0_writes, 1);
    assert!(state.cc.en());
    assert!(state.csts.rdy());
}

#[test]
fn ams_mismatch_fails_enable() {
    // The device only advertises round robin; ask for weighted round robin.
    let (mut ctrlr, fake) = fake_controller(
        opts::Builder::new()
            .with_arb_mechanism(ArbMechanism::WeightedRoundRobin)
            .build(),
    );

    let mut failed = false;
    for _ in 0..1000 {
        if ctrlr.process_init().is_err() {
            failed = true;
            break;
        }
        if ctrlr.state() == NvmeControllerState::Ready {
            break;
        }
    }

    assert!(failed, "initialization must fail on an AMS mismatch");
    // CC.EN was never set.
    assert!(!fake.state().cc.en());
}

#[test]
fn reset_returns_to_ready_with_identical_cdata() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    let vid = ctrlr.cdata().vid;
    let nn = ctrlr.cdata().nn;
    let aerl = ctrlr.cdata().aerl;

    ctrlr.reset().expect("reset failed");

    assert_eq!(ctrlr.state(), NvmeControllerState::Ready);
    assert_eq!(ctrlr.cdata().vid, vid);
    assert_eq!(ctrlr.cdata().nn, nn);
    assert_eq!(ctrlr.cdata().aerl, aerl);
}

#[test]
fn keep_alive_interval_negotiated() {
    let (mut ctrlr, fake) = fake_controller(
        opts::Builder::new().with_keep_alive_timeout_ms(20_000).build(),
    );
    fake.state().kato_ms = 15_000;

    pump_until_ready(&mut ctrlr);

    // The controller-adjusted value wins.
    assert_eq!(ctrlr.opts().keep_alive_timeout_ms, 15_000);

    ctrlr.add_process(None).unwrap();
    // First keep alive is scheduled immediately.
    ctrlr.process_admin_completions().unwrap();
    assert_eq!(fake.state().keep_alives, 1);
}

#[test]
fn keep_alive_feature_unsupported_is_non_fatal() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    fake.state().kato_supported = false;

    pump_until_ready(&mut ctrlr);

    // Invalid-field from Get Features keeps the user-configured timeout.
    assert_eq!(
        ctrlr.opts().keep_alive_timeout_ms,
        opts::MIN_KEEP_ALIVE_TIMEOUT_MS
    );
}

#[test]
fn num_queues_clamped_by_device_grant() {
    let (mut ctrlr, fake) = fake_controller(
        opts::Builder::new().with_num_io_queues(64).build(),
    );
    fake.state().queue_grant = 4;

    pump_until_ready(&mut ctrlr);

    assert_eq!(ctrlr.opts().num_io_queues, 4);

    // Only four qids can be handed out.
    for _ in 0..4 {
        ctrlr.alloc_io_qpair(None).unwrap();
    }
    assert_matches!(ctrlr.alloc_io_qpair(None), Err(NvmeError::NoFreeQid));
}

#[test]
fn set_trid_only_while_failed() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    let same = TransportIdBuilder::new()
        .with_trtype(TransportType::Pcie)
        .with_traddr("0000:82:00.0")
        .build();

    // Not failed yet: rejected.
    assert!(ctrlr.set_trid(same.clone()).is_err());

    ctrlr.fail_ctrlr();
    assert!(ctrlr.is_failed());

    // Same transport type and subnqn: accepted, repeatedly.
    ctrlr.set_trid(same.clone()).unwrap();
    ctrlr.set_trid(same).unwrap();

    // Different subnqn: rejected.
    let other = TransportIdBuilder::new()
        .with_trtype(TransportType::Pcie)
        .with_traddr("0000:82:00.0")
        .with_subnqn("nqn.2021-01:other")
        .build();
    assert!(ctrlr.set_trid(other).is_err());
}

#[test]
fn subsystem_reset_writes_magic() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    ctrlr.reset_subsystem().unwrap();
    assert_eq!(fake.state().nssr, nvmx::registers::NSSR_VALUE);
}

#[test]
fn ns_lookup_bounds() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    let nn = ctrlr.num_ns();
    assert!(ctrlr.get_ns(0).is_none());
    assert!(ctrlr.get_ns(nn + 1).is_none());
    assert!(ctrlr.get_ns(1).is_some());
}

#[test]
fn destruct_completes_shutdown() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    ctrlr.add_process(None).unwrap();
    ctrlr.alloc_io_qpair(None).unwrap();

    ctrlr.destruct();

    let state = fake.state();
    // Shutdown notification went out and all queues are gone.
    assert_ne!(state.cc.shn(), 0);
    assert!(state.created_qpairs.is_empty());
    assert!(state.held_aers.is_empty());
}
