#![allow(dead_code)]

use chub_core::platform::FirmwareSource;
use chub_host::{ChubConfig, Controller};
use chub_sim::SimBoard;
use std::sync::Arc;

pub struct Rig {
    pub board: SimBoard,
    pub controller: Arc<Controller>,
}

/// Attaches a controller to a fresh simulated board. Every wait on the
/// board clock steps the device and then delivers host interrupts,
/// watchdog and bus monitor reports included.
pub fn attach(config: ChubConfig) -> Rig {
    let board = SimBoard::new();
    let firmware: Arc<dyn FirmwareSource> = board.firmware.clone();
    attach_with(board, firmware, config)
}

pub fn attach_with(board: SimBoard, firmware: Arc<dyn FirmwareSource>, config: ChubConfig) -> Rig {
    let controller = Arc::new(
        Controller::attach(
            board.window.clone(),
            board.bank.clone(),
            board.platform.clone(),
            firmware,
            board.clock.clone(),
            config,
        )
        .unwrap(),
    );
    let weak = Arc::downgrade(&controller);
    let device = Arc::downgrade(&board.device);
    board.clock.on_tick(move || {
        let (Some(controller), Some(device)) = (weak.upgrade(), device.upgrade()) else {
            return;
        };
        if device.take_watchdog() {
            controller.handle_watchdog();
        }
        if let Some(master) = device.take_bus_error() {
            controller.handle_bus_error(master);
        }
        controller.handle_interrupt();
    });
    Rig { board, controller }
}

/// A rig whose device is powered on and answering.
pub fn running(config: ChubConfig) -> Rig {
    let rig = attach(config);
    rig.controller.power_on().unwrap();
    rig
}
