use chub_common::debug::{DebugCommand, DeviceRequest};
use chub_common::irq::{self, DeviceEvent, HostEvent};
use chub_common::scratch;
use chub_core::ChannelId;
use chub_core::delay::Delay;
use chub_core::doorbell::{Direction, Doorbell};
use chub_core::ipc::{IpcEvent, IpcMap, Side};
use chub_core::memmap::{MemoryMap, RegionId};
use chub_core::ring::ctrl;
use chub_core::window::SharedWindow;
use log::{debug, info, warn};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Signature the simulated firmware image starts with.
pub const OS_IMAGE_MAGIC: &[u8; 8] = b"CHUBFW\x00\x01";

/// The device never sleeps on its own; its waits return at once.
struct NoWait;

impl Delay for NoWait {
    fn delay_ms(&self, _ms: u32) {}

    fn now_ms(&self) -> u64 {
        0
    }
}

/// Switches for simulating misbehaving firmware.
#[derive(Debug, Clone, Copy)]
pub struct DeviceBehaviour {
    /// Answer alive pings.
    pub answers_alive: bool,
    /// Assert the wake line when the host asks the device to stay awake.
    pub acks_wakeup: bool,
    /// Send every received packet back to the host.
    pub echo: bool,
}

impl Default for DeviceBehaviour {
    fn default() -> Self {
        Self {
            answers_alive: true,
            acks_wakeup: true,
            echo: true,
        }
    }
}

#[derive(Default)]
struct DeviceState {
    /// Power is applied and reset is released.
    powered: bool,
    /// Firmware stopped itself after a shutdown request.
    halted: bool,
    ipc: Option<IpcMap>,
    boots: u32,
    shutdowns: u32,
    wake_requests: u32,
    received: Vec<Vec<u8>>,
    debug_commands: Vec<u32>,
    /// Watchdog interrupt raised and not yet taken by the host.
    watchdog_irq: bool,
    /// Bus master named by a pending bus monitor report.
    bus_error: Option<&'static str>,
}

/// Software model of the context hub firmware.
pub struct SimDevice {
    window: SharedWindow,
    doorbell: Doorbell,
    state: Mutex<DeviceState>,
    behaviour: Mutex<DeviceBehaviour>,
}

impl SimDevice {
    pub fn new(window: SharedWindow, doorbell: Doorbell) -> Self {
        Self {
            window,
            doorbell,
            state: Mutex::new(DeviceState::default()),
            behaviour: Mutex::new(DeviceBehaviour::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn behaviour(&self) -> DeviceBehaviour {
        *self.behaviour.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behaviour(&self, behaviour: DeviceBehaviour) {
        *self.behaviour.lock().unwrap_or_else(PoisonError::into_inner) = behaviour;
    }

    /// Applies power. The bootloader starts the firmware on the next step
    /// if a valid image is resident by then.
    pub fn power_up(&self) {
        let mut state = self.state();
        state.powered = true;
        state.halted = false;
        state.ipc = None;
    }

    /// Removes power or holds the device in reset.
    pub fn power_down(&self) {
        let mut state = self.state();
        state.powered = false;
        state.ipc = None;
    }

    fn try_boot(&self, state: &mut DeviceState) -> bool {
        let map = match MemoryMap::resolve(&self.window) {
            Ok(map) => map,
            Err(err) => {
                debug!("sim: bootloader cannot find the memory map: {err}");
                return false;
            }
        };
        let os = map.region(RegionId::Os).window();
        let mut magic = [0u8; 8];
        if os.len() >= magic.len() {
            os.read_bytes(0, &mut magic);
        }
        if &magic != OS_IMAGE_MAGIC {
            debug!("sim: no firmware image resident");
            return false;
        }
        let ipc = match IpcMap::new(&map, self.doorbell.clone(), Side::Device) {
            Ok(ipc) => ipc,
            Err(err) => {
                warn!("sim: {err}");
                return false;
            }
        };

        state.boots += 1;
        let (clock_hz, _, _) = map.read_boot_args();
        ipc.log()
            .produce(format!("chub: boot {} clk {}\n", state.boots, clock_hz).as_bytes());
        info!("sim: firmware running (boot {})", state.boots);
        state.ipc = Some(ipc);
        true
    }

    pub fn is_running(&self) -> bool {
        self.state().ipc.is_some()
    }

    pub fn boots(&self) -> u32 {
        self.state().boots
    }

    pub fn shutdowns(&self) -> u32 {
        self.state().shutdowns
    }

    pub fn wake_requests(&self) -> u32 {
        self.state().wake_requests
    }

    /// Packets received from the host, oldest first.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.state().received.clone()
    }

    /// Raw debug command words received from the host.
    pub fn debug_commands(&self) -> Vec<u32> {
        self.state().debug_commands.clone()
    }

    /// Processes everything the host has signalled since the last step.
    pub fn step(&self) {
        let behaviour = self.behaviour();
        let mut state = self.state();
        if state.powered && !state.halted && state.ipc.is_none() && !self.try_boot(&mut state) {
            return;
        }
        let Some(ipc) = state.ipc.take() else {
            return;
        };

        let mut events = Vec::new();
        if let Err(err) = ipc.dispatch(&mut |ev| events.push(ev)) {
            warn!("sim: dispatch failed: {err}");
            self.doorbell.clear_all(Direction::ToDevice);
        }

        let mut running = true;
        for event in events {
            match event {
                IpcEvent::Alive => {
                    if behaviour.answers_alive {
                        self.doorbell.write_scratch(scratch::ALIVE, scratch::ALIVE_OK);
                        self.doorbell.raise(Direction::ToHost, irq::ALIVE_LINE);
                    }
                }
                IpcEvent::Code(code) => match HostEvent::from_code(code) {
                    Some(HostEvent::Channel0 | HostEvent::Channel1 | HostEvent::Channel2) => {
                        while let Ok(Some(packet)) = ipc.read_data() {
                            debug!("sim: rx {} bytes", packet.len());
                            if behaviour.echo {
                                if let Err(err) = ipc.write_data(&packet, &NoWait) {
                                    warn!("sim: echo failed: {err}");
                                }
                            }
                            state.received.push(packet);
                        }
                    }
                    Some(HostEvent::Wakeup) => {
                        state.wake_requests += 1;
                        if behaviour.acks_wakeup {
                            Self::signal(&ipc, DeviceEvent::WakeAssert);
                        }
                    }
                    Some(HostEvent::WakeupClear) => Self::signal(&ipc, DeviceEvent::WakeDeassert),
                    Some(HostEvent::Shutdown) => {
                        info!("sim: shutdown requested");
                        state.shutdowns += 1;
                        state.halted = true;
                        running = false;
                    }
                    Some(HostEvent::ResetComplete) => debug!("sim: host finished reset"),
                    Some(HostEvent::Log) => ipc.log().produce(b"chub: log flush\n"),
                    Some(HostEvent::Debug) => {
                        let (word, _) = ipc.read_debug();
                        state.debug_commands.push(word);
                        if !Self::run_debug_command(&ipc, word, &mut state) {
                            running = false;
                        }
                    }
                    None => warn!("sim: unknown host event {code}"),
                },
            }
        }

        if running {
            state.ipc = Some(ipc);
        }
    }

    fn signal(ipc: &IpcMap, event: DeviceEvent) {
        if let Err(err) = ipc.add_event(event as u32, &NoWait) {
            warn!("sim: cannot signal {event:?}: {err}");
        }
    }

    /// Runs one debug command. Returns `false` when the command leaves the
    /// firmware hung.
    fn run_debug_command(ipc: &IpcMap, word: u32, state: &mut DeviceState) -> bool {
        let Some(cmd) = DebugCommand::from_code(word) else {
            warn!("sim: unknown debug command {word}");
            return true;
        };
        ipc.log().produce(format!("chub: utc {}\n", cmd.name()).as_bytes());
        let request = match cmd {
            DebugCommand::Assert => DeviceRequest::Assert,
            DebugCommand::Fault => DeviceRequest::Fault,
            DebugCommand::DumpStatus => DeviceRequest::PrintLog,
            DebugCommand::Wdt => {
                info!("sim: firmware stuck, watchdog fires");
                state.halted = true;
                state.watchdog_irq = true;
                return false;
            }
            DebugCommand::HangItmon => {
                info!("sim: firmware stuck on the bus");
                state.halted = true;
                state.bus_error = Some("CM4_SHUB_CD");
                return false;
            }
            _ => return true,
        };
        if let Err(err) = ipc.post_debug(request as u32, 0, DeviceEvent::Debug as u32, &NoWait) {
            warn!("sim: cannot report {request:?}: {err}");
        }
        true
    }

    /// Takes the pending watchdog interrupt, if any.
    pub fn take_watchdog(&self) -> bool {
        std::mem::take(&mut self.state().watchdog_irq)
    }

    /// Takes the bus master of the pending bus monitor report, if any.
    pub fn take_bus_error(&self) -> Option<&'static str> {
        self.state().bus_error.take()
    }

    /// Sends `payload` to the host as if the firmware produced it.
    pub fn send(&self, payload: &[u8]) -> bool {
        let state = self.state();
        let Some(ipc) = state.ipc.as_ref() else {
            return false;
        };
        ipc.write_data(payload, &NoWait).is_ok()
    }

    /// Posts a request in the debug word and raises a debug event.
    pub fn report(&self, request: DeviceRequest) -> bool {
        let state = self.state();
        let Some(ipc) = state.ipc.as_ref() else {
            return false;
        };
        ipc.post_debug(request as u32, 0, DeviceEvent::Debug as u32, &NoWait)
            .is_ok()
    }

    /// Appends text to the log ring.
    pub fn write_log(&self, text: &str) {
        if let Some(ipc) = self.state().ipc.as_ref() {
            ipc.log().produce(text.as_bytes());
        }
    }

    /// Scribbles an out-of-range dequeue index into `channel`.
    pub fn corrupt(&self, channel: ChannelId) -> bool {
        let state = self.state();
        let Some(ipc) = state.ipc.as_ref() else {
            return false;
        };
        match channel {
            ChannelId::DataToHost => ipc.data_tx().write_ctrl(ctrl::DQ, u32::MAX),
            ChannelId::DataToDevice => ipc.data_rx().write_ctrl(ctrl::DQ, u32::MAX),
            ChannelId::EventToHost => ipc.events_tx().ring().write_ctrl(ctrl::DQ, u32::MAX),
            ChannelId::EventToDevice => ipc.events_rx().ring().write_ctrl(ctrl::DQ, u32::MAX),
        }
        true
    }
}
