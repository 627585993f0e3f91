use crate::clock::SimClock;
use crate::device::{OS_IMAGE_MAGIC, SimDevice};
use chub_common::ipc;
use chub_common::mmio::{GPR_COUNT, GPR_PC_INDEX};
use chub_core::doorbell::{Doorbell, LoopbackBank};
use chub_core::memmap::BootDescriptor;
use chub_core::platform::{FirmwareError, FirmwareSource, Platform, PlatformError};
use chub_core::window::SharedWindow;
use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Window size of the simulated co-processor.
pub const WINDOW_SIZE: usize = 0x1a000;

/// Region layout of the simulated co-processor.
pub fn layout() -> BootDescriptor {
    BootDescriptor {
        version: ipc::IPC_VERSION,
        bootloader: (0x0, 0x1000),
        code: (0x1000, 0x9000),
        ipc: (0x9000, 0x11000),
        ram: (0x11000, 0x19000),
        shared: (0x19000, 0x1a000),
        dump: (0x0, 0x1a000),
        clock_hz: 0,
        boot_mode: 0,
        kernel_log: 0,
    }
}

/// Bootloader image with `desc` embedded at the descriptor offset.
pub fn bootloader_image(desc: &BootDescriptor) -> Vec<u8> {
    let mut image: Vec<u8> = (0..1024u32).map(|i| (i * 13) as u8).collect();
    let encoded = desc.encode();
    image[ipc::MAP_INFO_OFFSET..ipc::MAP_INFO_OFFSET + encoded.len()].copy_from_slice(&encoded);
    image
}

/// Firmware image the simulated bootloader accepts.
pub fn os_image(len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len.max(OS_IMAGE_MAGIC.len()))
        .map(|i| (i * 31 + 7) as u8)
        .collect();
    image[..OS_IMAGE_MAGIC.len()].copy_from_slice(OS_IMAGE_MAGIC);
    image
}

/// In-memory firmware images.
pub struct SimFirmware {
    bootloader: Vec<u8>,
    os: Vec<u8>,
    loads: AtomicU32,
}

impl SimFirmware {
    pub fn new(bootloader: Vec<u8>, os: Vec<u8>) -> Self {
        Self {
            bootloader,
            os,
            loads: AtomicU32::new(0),
        }
    }

    /// Number of images handed out so far.
    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl FirmwareSource for SimFirmware {
    fn bootloader(&self) -> Result<Vec<u8>, FirmwareError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.bootloader.clone())
    }

    fn os_image(&self) -> Result<Vec<u8>, FirmwareError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if self.os.is_empty() {
            return Err(FirmwareError::Missing("os"));
        }
        Ok(self.os.clone())
    }
}

/// Power sequencing of the simulated device.
pub struct SimPlatform {
    device: Arc<SimDevice>,
    cycles: AtomicU32,
    fail_next_cycle: AtomicBool,
}

impl SimPlatform {
    pub fn new(device: Arc<SimDevice>) -> Self {
        Self {
            device,
            cycles: AtomicU32::new(0),
            fail_next_cycle: AtomicBool::new(false),
        }
    }

    /// Reset cycles performed so far.
    pub fn cycles(&self) -> u32 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Makes the next reset cycle report a sequencing failure.
    pub fn fail_next_cycle(&self) {
        self.fail_next_cycle.store(true, Ordering::Relaxed);
    }
}

impl Platform for SimPlatform {
    fn power_on(&self) -> Result<(), PlatformError> {
        info!("sim: power on");
        self.device.power_up();
        Ok(())
    }

    fn reset_cycle(&self) -> Result<(), PlatformError> {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.device.power_down();
        if self.fail_next_cycle.swap(false, Ordering::Relaxed) {
            return Err(PlatformError::Sequence {
                stage: "release reset",
                code: -110,
            });
        }
        self.device.power_up();
        Ok(())
    }

    fn power_off(&self) -> Result<(), PlatformError> {
        info!("sim: power off");
        self.device.power_down();
        Ok(())
    }

    fn read_gpr(&self) -> [u32; GPR_COUNT] {
        let mut gpr: [u32; GPR_COUNT] = core::array::from_fn(|i| i as u32);
        gpr[GPR_PC_INDEX] = 0x1000 + self.device.boots();
        gpr
    }

    fn diagnostic_registers(&self) -> Vec<(&'static str, u32)> {
        vec![
            ("CHUB_CPU_STATUS", self.device.is_running() as u32),
            ("CHUB_RESET_CYCLES", self.cycles()),
        ]
    }
}

/// A complete simulated board.
pub struct SimBoard {
    pub window: SharedWindow,
    pub bank: Arc<LoopbackBank>,
    pub doorbell: Doorbell,
    pub device: Arc<SimDevice>,
    pub platform: Arc<SimPlatform>,
    pub firmware: Arc<SimFirmware>,
    pub clock: Arc<SimClock>,
}

impl SimBoard {
    /// Builds a board whose bootloader is already resident, so the memory
    /// map resolves before the first power on. The device runs on every
    /// clock tick.
    pub fn new() -> Self {
        let desc = layout();
        let bootloader = bootloader_image(&desc);
        let window = SharedWindow::allocate(WINDOW_SIZE);
        window.write_bytes(0, &bootloader);

        let bank = Arc::new(LoopbackBank::new());
        let doorbell = Doorbell::new(bank.clone());
        let device = Arc::new(SimDevice::new(window.clone(), doorbell.clone()));
        let platform = Arc::new(SimPlatform::new(device.clone()));
        let firmware = Arc::new(SimFirmware::new(bootloader, os_image(4096)));
        let clock = Arc::new(SimClock::new());

        let stepper = Arc::downgrade(&device);
        clock.on_tick(move || {
            if let Some(device) = stepper.upgrade() {
                device.step();
            }
        });

        Self {
            window,
            bank,
            doorbell,
            device,
            platform,
            firmware,
            clock,
        }
    }

    /// Flips the low bit of one firmware byte on its next download. The
    /// readback that follows the download sees the corruption once.
    pub fn glitch_next_os_load(&self) {
        let at = layout().code.0 as usize + OS_GLITCH_OFFSET;
        self.window.glitch_next_write(at, 0x01);
    }
}

/// Offset inside the OS image hit by [`SimBoard::glitch_next_os_load`].
pub const OS_GLITCH_OFFSET: usize = 16;

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chub_common::irq::{self, DeviceEvent, HostEvent};
    use chub_core::delay::Delay;
    use chub_core::doorbell::Direction;
    use chub_core::ipc::{IpcEvent, IpcMap, Side};
    use chub_core::memmap::{MemoryMap, RegionId};

    fn host_view(board: &SimBoard) -> IpcMap {
        let map = MemoryMap::resolve(&board.window).unwrap();
        IpcMap::new(&map, board.doorbell.clone(), Side::Host).unwrap()
    }

    fn load_os(board: &SimBoard) {
        let map = MemoryMap::resolve(&board.window).unwrap();
        let image = board.firmware.os_image().unwrap();
        map.region(RegionId::Os).window().write_bytes(0, &image);
    }

    #[test]
    fn device_stays_down_without_firmware() {
        let board = SimBoard::new();
        board.platform.power_on().unwrap();
        board.clock.tick();
        assert!(!board.device.is_running());
        assert_eq!(board.device.boots(), 0);
    }

    #[test]
    fn device_answers_alive_and_echoes() {
        let board = SimBoard::new();
        let host = host_view(&board);
        host.init();
        load_os(&board);
        board.platform.power_on().unwrap();
        board.clock.tick();
        assert!(board.device.is_running());

        board.doorbell.raise(Direction::ToDevice, irq::ALIVE_LINE);
        host.write_data(b"ping", board.clock.as_ref()).unwrap();
        board.clock.delay_ms(1);

        let mut seen = Vec::new();
        host.dispatch(&mut |ev| seen.push(ev)).unwrap();
        assert_eq!(
            seen,
            [IpcEvent::Alive, IpcEvent::Code(DeviceEvent::Channel0 as u32)]
        );
        assert_eq!(host.read_data().unwrap().unwrap(), b"ping");
        assert_eq!(board.device.received(), vec![b"ping".to_vec()]);
    }

    #[test]
    fn shutdown_halts_the_device() {
        let board = SimBoard::new();
        let host = host_view(&board);
        host.init();
        load_os(&board);
        board.platform.power_on().unwrap();
        board.clock.tick();

        host.add_event(HostEvent::Shutdown as u32, board.clock.as_ref())
            .unwrap();
        board.clock.delay_ms(1);
        assert!(!board.device.is_running());
        assert_eq!(board.device.shutdowns(), 1);
        board.clock.tick();
        assert!(!board.device.is_running());
    }

    #[test]
    fn failed_reset_cycle_leaves_device_down() {
        let board = SimBoard::new();
        load_os(&board);
        board.platform.fail_next_cycle();
        assert!(board.platform.reset_cycle().is_err());
        board.clock.tick();
        assert!(!board.device.is_running());
        board.platform.reset_cycle().unwrap();
        board.clock.tick();
        assert!(board.device.is_running());
        assert_eq!(board.platform.cycles(), 2);
    }
}
