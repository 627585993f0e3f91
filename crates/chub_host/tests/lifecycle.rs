mod common;

use chub_core::doorbell::Direction;
use chub_core::platform::FirmwareSource;
use chub_host::fault::FaultKind;
use chub_host::{ChubConfig, ChubError, ChubStatus, ResetPolicy};
use chub_sim::board::{OS_GLITCH_OFFSET, bootloader_image, layout, os_image};
use chub_sim::{DeviceBehaviour, SimBoard, SimFirmware};
use std::sync::{Arc, Mutex};

#[test]
fn power_on_brings_the_device_up() {
    let rig = common::attach(ChubConfig::default());
    assert_eq!(rig.controller.status(), ChubStatus::NoPower);

    rig.controller.power_on().unwrap();
    assert_eq!(rig.controller.status(), ChubStatus::Running);
    assert!(rig.board.device.is_running());
    assert_eq!(rig.board.device.boots(), 1);
    assert_eq!(rig.board.firmware.loads(), 2);
    assert_eq!(rig.controller.reset_count(), 0);
}

#[test]
fn power_on_twice_is_refused() {
    let rig = common::running(ChubConfig::default());
    assert!(matches!(
        rig.controller.power_on(),
        Err(ChubError::InvalidState {
            status: ChubStatus::Running,
            ..
        })
    ));
}

#[test]
fn reset_of_a_running_device_touches_nothing() {
    let rig = common::running(ChubConfig::default());
    let accesses = rig.board.bank.accesses();
    let loads = rig.board.firmware.loads();
    let waits = rig.board.clock.waits();

    rig.controller.reset(false, None).unwrap();
    assert_eq!(rig.board.bank.accesses(), accesses);
    assert_eq!(rig.board.firmware.loads(), loads);
    assert_eq!(rig.board.clock.waits(), waits);
    assert_eq!(rig.board.platform.cycles(), 0);
    assert_eq!(rig.controller.reset_count(), 0);
}

#[test]
fn forced_reset_reloads_and_reboots() {
    let rig = common::running(ChubConfig::default());
    rig.controller.reset(true, None).unwrap();

    assert_eq!(rig.controller.status(), ChubStatus::Running);
    assert_eq!(rig.controller.reset_count(), 1);
    assert_eq!(rig.board.platform.cycles(), 1);
    assert_eq!(rig.board.firmware.loads(), 4);
    assert_eq!(rig.board.device.boots(), 2);
    assert!(rig.controller.last_dump().is_none());
}

#[test]
fn silent_device_exhausts_every_attempt() {
    let rig = common::attach(ChubConfig::default());
    rig.board.device.set_behaviour(DeviceBehaviour {
        answers_alive: false,
        ..DeviceBehaviour::default()
    });

    let err = rig.controller.power_on().unwrap_err();
    assert!(matches!(err, ChubError::AliveHandshakeTimeout { attempts: 4 }));
    assert_eq!(rig.controller.status(), ChubStatus::NotResponding);
    assert_eq!(rig.board.platform.cycles(), 5);
    assert_eq!(rig.controller.reset_failures().len(), 5);
    assert_eq!(rig.controller.reset_count(), 0);

    let dump = rig.controller.last_dump().unwrap();
    assert_eq!(dump.reason, FaultKind::NoResponse);
    assert_eq!(dump.memory.len(), chub_sim::board::WINDOW_SIZE);
}

#[test]
fn failed_power_cycle_is_retried() {
    let rig = common::running(ChubConfig::default());
    rig.board.platform.fail_next_cycle();
    rig.controller.reset(true, None).unwrap();

    assert_eq!(rig.controller.status(), ChubStatus::Running);
    assert_eq!(rig.board.platform.cycles(), 2);
    let failures = rig.controller.reset_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempt, 1);
    assert!(failures[0].error.contains("release reset"));
    assert!(
        failures[0]
            .platform
            .iter()
            .any(|&(name, value)| name == "CHUB_RESET_CYCLES" && value == 1)
    );
}

#[test]
fn status_stays_out_of_not_responding_between_attempts() {
    let rig = common::running(ChubConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let controller = Arc::downgrade(&rig.controller);
    let record = seen.clone();
    rig.board.clock.on_tick(move || {
        if let Some(controller) = controller.upgrade() {
            record.lock().unwrap().push(controller.status());
        }
    });

    rig.board.platform.fail_next_cycle();
    rig.controller.reset(true, None).unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(!seen.contains(&ChubStatus::NotResponding), "{seen:?}");
    assert_eq!(rig.controller.status(), ChubStatus::Running);
}

#[test]
fn corrupted_download_costs_one_attempt() {
    let rig = common::running(ChubConfig::default());
    rig.board.glitch_next_os_load();
    rig.controller.reset(true, None).unwrap();

    assert_eq!(rig.controller.status(), ChubStatus::Running);
    assert_eq!(rig.controller.reset_count(), 1);
    assert_eq!(rig.board.platform.cycles(), 2);
    let failures = rig.controller.reset_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempt, 1);
    assert_eq!(
        failures[0].error,
        ChubError::FirmwareVerifyMismatch {
            region: "os",
            offset: OS_GLITCH_OFFSET,
        }
        .to_string()
    );
}

#[test]
fn corrupted_download_aborts_the_attempt() {
    let rig = common::running(ChubConfig {
        reset_attempts: 1,
        ..ChubConfig::default()
    });
    rig.board.glitch_next_os_load();

    let err = rig.controller.reset(true, None).unwrap_err();
    assert!(
        matches!(
            err,
            ChubError::FirmwareVerifyMismatch {
                region: "os",
                offset: OS_GLITCH_OFFSET,
            }
        ),
        "{err}"
    );
    assert_eq!(rig.controller.status(), ChubStatus::NotResponding);
    assert_eq!(rig.controller.reset_failures().len(), 1);

    rig.controller.reset(true, None).unwrap();
    assert_eq!(rig.controller.status(), ChubStatus::Running);
    assert!(rig.controller.reset_failures().is_empty());
    rig.controller.write(b"x").unwrap();
}

#[test]
fn hung_policy_latches_until_forced() {
    let rig = common::running(ChubConfig {
        reset_policy: ResetPolicy::LatchHung,
        ..ChubConfig::default()
    });
    rig.controller
        .observe_fault(FaultKind::IndexCorruption, chub_host::fault::FaultContext::Task);
    assert_eq!(rig.controller.status(), ChubStatus::Hung);
    assert_eq!(rig.board.platform.cycles(), 0);

    assert!(matches!(rig.controller.write(b"x"), Err(ChubError::Hung)));
    assert!(matches!(rig.controller.reset(false, None), Err(ChubError::Hung)));

    rig.controller.reset(true, None).unwrap();
    assert_eq!(rig.controller.status(), ChubStatus::Running);
    rig.controller.write(b"x").unwrap();
}

#[test]
fn shutdown_and_power_on_again() {
    let rig = common::running(ChubConfig::default());
    rig.controller.shutdown().unwrap();

    assert_eq!(rig.controller.status(), ChubStatus::NoPower);
    assert_eq!(rig.board.device.shutdowns(), 1);
    assert!(!rig.board.device.is_running());
    assert!(matches!(
        rig.controller.write(b"late"),
        Err(ChubError::NotRunning(ChubStatus::NoPower))
    ));
    rig.controller.shutdown().unwrap();

    rig.controller.power_on().unwrap();
    assert_eq!(rig.controller.status(), ChubStatus::Running);
    assert_eq!(rig.board.device.boots(), 2);
    assert_eq!(rig.board.firmware.loads(), 4);
}

#[test]
fn oversized_image_is_rejected_before_power_on() {
    let board = SimBoard::new();
    let firmware: Arc<dyn FirmwareSource> = Arc::new(SimFirmware::new(
        bootloader_image(&layout()),
        os_image(0x9000),
    ));
    let rig = common::attach_with(board, firmware, ChubConfig::default());

    let err = rig.controller.power_on().unwrap_err();
    assert!(matches!(err, ChubError::Firmware(_)), "{err}");
    assert_eq!(rig.controller.status(), ChubStatus::NoPower);
    assert!(!rig.board.device.is_running());
}

#[test]
fn missing_image_is_rejected() {
    let board = SimBoard::new();
    let firmware: Arc<dyn FirmwareSource> =
        Arc::new(SimFirmware::new(bootloader_image(&layout()), Vec::new()));
    let rig = common::attach_with(board, firmware, ChubConfig::default());
    assert!(matches!(
        rig.controller.power_on(),
        Err(ChubError::Firmware(_))
    ));
    assert_eq!(rig.controller.status(), ChubStatus::NoPower);
}

#[test]
fn interrupts_are_masked_without_power() {
    let rig = common::attach(ChubConfig::default());
    rig.board.doorbell.raise(Direction::ToHost, 3);
    assert_eq!(rig.board.doorbell.status(Direction::ToHost), 1 << 3);

    rig.controller.handle_interrupt();
    assert_eq!(rig.board.doorbell.status(Direction::ToHost), 0);
    assert_eq!(rig.controller.status(), ChubStatus::NoPower);
}

#[test]
fn status_report_reflects_the_device() {
    let rig = common::running(ChubConfig::default());
    let report = rig.controller.status_report();
    assert!(report.starts_with("chub alive\n"), "{report}");
    assert!(report.contains("status: running"));
    assert!(report.contains("resets: 0"));

    rig.controller.shutdown().unwrap();
    let report = rig.controller.status_report();
    assert!(report.starts_with("chub isn't alive\n"), "{report}");
    assert!(report.contains("status: no power"));
}

#[test]
fn boot_log_reaches_the_host() {
    let rig = common::running(ChubConfig {
        clock_hz: 400_000_000,
        ..ChubConfig::default()
    });
    rig.controller.flush_log().unwrap();
    assert!(
        rig.controller
            .log()
            .contents()
            .contains("chub: boot 1 clk 400000000")
    );
}
