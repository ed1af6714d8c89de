//! Admin command surface: features, aborts, namespace management, firmware
//! and boot partition writes against the fake device.

mod common;

use common::{fake_controller, pump_until_ready};
use nvmx::opts;
use nvmx::pages::{feat, FormatOpts, FwCommitAction, IdentifyNsData};
use nvmx::NvmeControllerState;

#[test]
fn feature_round_trip() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    ctrlr
        .set_feature(feat::TEMPERATURE_THRESHOLD, 0x150, 0, None)
        .unwrap();
    // The fake reports the configured keep alive value.
    let kato = ctrlr.get_feature(feat::KEEP_ALIVE_TIMER, 0).unwrap();
    assert_eq!(kato, 10_000);
}

#[test]
fn aborts_queue_beyond_acl() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    // acl is 3: four aborts may be outstanding, the rest queue up.
    for cid in 0..6u16 {
        ctrlr.cmd_abort_async(1, cid).unwrap();
    }
    assert_eq!(ctrlr.queued_abort_count(), 2);

    // Completions drain the queue.
    ctrlr.process_admin_completions().unwrap();
    ctrlr.process_admin_completions().unwrap();
    assert_eq!(ctrlr.queued_abort_count(), 0);
}

#[test]
fn format_resets_the_controller() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    ctrlr.format(1, &FormatOpts::default()).unwrap();
    assert_eq!(ctrlr.state(), NvmeControllerState::Ready);
}

#[test]
fn firmware_update_downloads_and_resets() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    // Two full pages plus a tail, all 4-byte aligned.
    let image = vec![0xa5u8; 4096 * 2 + 64];
    let status = ctrlr
        .update_firmware(&image, 1, FwCommitAction::ReplaceAndEnableImg)
        .unwrap();
    assert!(!status.is_error());
    assert_eq!(ctrlr.state(), NvmeControllerState::Ready);

    // Unaligned images are rejected up front.
    assert!(ctrlr
        .update_firmware(&image[..10], 1, FwCommitAction::ReplaceImg)
        .is_err());
}

#[test]
fn namespace_management_refreshes_map() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);
    assert_eq!(ctrlr.active_ns_count(), 2);

    // The device drops namespace 2 while servicing the delete.
    fake.state().active_ns = vec![1];
    ctrlr.delete_ns(2).unwrap();

    assert_eq!(ctrlr.active_ns_count(), 1);
    assert!(!ctrlr.is_active_ns(2));

    // The fake answers the create with cdw0 == 0, which is an invalid
    // namespace id.
    let nsdata = IdentifyNsData::default();
    ctrlr.create_ns(&nsdata).unwrap_err();
}

#[test]
fn security_send_receive() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    ctrlr.security_send(0x01, 0x0001, 0, &[1, 2, 3, 4]).unwrap();
    let data = ctrlr.security_receive(0x01, 0x0001, 0, 512).unwrap();
    assert_eq!(data.len(), 512);
}

#[test]
fn boot_partition_write_chain() {
    let (mut ctrlr, fake) = fake_controller(opts::Builder::new().build());
    {
        let mut state = fake.state();
        state.cap = state.cap.with_bps(true);
    }
    pump_until_ready(&mut ctrlr);

    let image = vec![0x5au8; 4096 + 512];
    ctrlr.write_boot_partition(&image, 0).unwrap();

    // Downloads and the two commits complete over a few pump calls.
    for _ in 0..10 {
        if ctrlr.boot_partition_write_state() {
            break;
        }
        ctrlr.process_admin_completions().unwrap();
    }
    assert!(ctrlr.boot_partition_write_state());
}

#[test]
fn boot_partition_requires_capability() {
    let (mut ctrlr, _fake) = fake_controller(opts::Builder::new().build());
    pump_until_ready(&mut ctrlr);

    assert!(ctrlr.write_boot_partition(&[0u8; 64], 0).is_err());
    assert!(ctrlr.read_boot_partition_start(0x10000, 1, 0, 0).is_err());
}
