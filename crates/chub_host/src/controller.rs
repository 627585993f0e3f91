use crate::config::{ChubConfig, ResetPolicy};
use crate::diag::{DiagnosticDump, ResetFailure};
use crate::error::ChubError;
use crate::fault::{FaultClassifier, FaultContext, FaultKind, Verdict};
use crate::log_sink::LogSink;
use crate::status::{AtomicStatus, ChubStatus};
use crate::wakeup::{WakeSignal, WakeupArbiter};
use bitvec::prelude::*;
use chub_common::debug::{DebugCommand, DeviceRequest};
use chub_common::irq::{self, DeviceEvent, HostEvent};
use chub_common::{itmon, scratch};
use chub_core::IpcError;
use chub_core::delay::{Delay, poll_until};
use chub_core::doorbell::{Direction, Doorbell, RegisterBank};
use chub_core::ipc::{IpcEvent, IpcMap, Side};
use chub_core::memmap::{MemoryMap, RegionId};
use chub_core::platform::{FirmwareSource, Platform};
use chub_core::sync::SpinLock;
use chub_core::window::SharedWindow;
use log::{debug, error, info, warn};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::Thread;

/// Counts one in-flight IPC operation for as long as it lives.
pub(crate) struct IpcToken<'a>(&'a AtomicU32);

impl Drop for IpcToken<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Host side of one context hub: lifecycle, IPC, wakeup and recovery.
///
/// Every method takes `&self`; share the controller behind an [`Arc`] between
/// the interrupt path, the deferred worker and callers.
pub struct Controller {
    pub(crate) config: ChubConfig,
    pub(crate) map: MemoryMap,
    pub(crate) ipc: IpcMap,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) firmware: Arc<dyn FirmwareSource>,
    pub(crate) delay: Arc<dyn Delay>,
    pub(crate) status: AtomicStatus,
    /// Serialises power on, reset and shutdown.
    pub(crate) reset_lock: Mutex<()>,
    pub(crate) in_reset: AtomicU32,
    pub(crate) in_use_ipc: AtomicU32,
    pub(crate) firmware_resident: AtomicBool,
    pub(crate) alive: AtomicBool,
    /// Cleared when the watchdog fires, set again once the device is up.
    pub(crate) watchdog_armed: AtomicBool,
    /// Data-ready notifications not yet matched by a read.
    pub(crate) rx_ready: AtomicU32,
    pub(crate) log_requested: AtomicBool,
    pub(crate) arbiter: WakeupArbiter,
    pub(crate) faults: FaultClassifier,
    pub(crate) log: LogSink,
    pub(crate) last_dump: Mutex<Option<Arc<DiagnosticDump>>>,
    pub(crate) failures: Mutex<Vec<ResetFailure>>,
    pub(crate) worker: SpinLock<Option<Thread>>,
}

pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Controller {
    /// Resolves the memory map in `window` and builds the host view of the
    /// IPC map. Nothing is written to the device; call
    /// [`Controller::power_on`] next.
    ///
    /// # Arguments
    ///
    /// * `window` - the whole shared window, bootloader at offset zero.
    /// * `bank` - mailbox registers behind the doorbell.
    /// * `platform` - power sequencing and register capture.
    /// * `firmware` - source of the bootloader and OS images.
    /// * `delay` - clock used by every bounded wait.
    ///
    /// # Returns
    ///
    /// The controller in [`ChubStatus::NoPower`], or the error that kept the
    /// memory map or the IPC map from resolving.
    pub fn attach(
        window: SharedWindow,
        bank: Arc<dyn RegisterBank>,
        platform: Arc<dyn Platform>,
        firmware: Arc<dyn FirmwareSource>,
        delay: Arc<dyn Delay>,
        config: ChubConfig,
    ) -> Result<Self, ChubError> {
        let map = MemoryMap::resolve(&window)?;
        map.dump();
        let ipc = IpcMap::new(&map, Doorbell::new(bank), Side::Host)?;
        info!(
            "attached: window {:#x} bytes, log ring {} bytes",
            window.len(),
            map.log_size()
        );

        Ok(Self {
            arbiter: WakeupArbiter::new(config.wakeup_timeout_ms),
            faults: FaultClassifier::new(config.fault_threshold, config.fault_window_ms),
            log: LogSink::new(config.log_capacity),
            config,
            map,
            ipc,
            platform,
            firmware,
            delay,
            status: AtomicStatus::new(ChubStatus::NoPower),
            reset_lock: Mutex::new(()),
            in_reset: AtomicU32::new(0),
            in_use_ipc: AtomicU32::new(0),
            firmware_resident: AtomicBool::new(false),
            alive: AtomicBool::new(false),
            watchdog_armed: AtomicBool::new(false),
            rx_ready: AtomicU32::new(0),
            log_requested: AtomicBool::new(false),
            last_dump: Mutex::new(None),
            failures: Mutex::new(Vec::new()),
            worker: SpinLock::new(None),
        })
    }

    pub fn config(&self) -> &ChubConfig {
        &self.config
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn status(&self) -> ChubStatus {
        self.status.load()
    }

    pub(crate) fn set_status(&self, status: ChubStatus) {
        let previous = self.status.swap(status);
        if previous != status {
            info!("status: {previous} -> {status}");
        }
    }

    pub fn faults(&self) -> &FaultClassifier {
        &self.faults
    }

    pub fn reset_count(&self) -> u32 {
        self.faults.resets()
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn wakeup(&self) -> &WakeupArbiter {
        &self.arbiter
    }

    /// Dump taken before the most recent reset that had a reason.
    pub fn last_dump(&self) -> Option<Arc<DiagnosticDump>> {
        locked(&self.last_dump).clone()
    }

    /// Failed attempts of the most recent recovery.
    pub fn reset_failures(&self) -> Vec<ResetFailure> {
        locked(&self.failures).clone()
    }

    /// Data-ready notifications received and not yet consumed.
    pub fn rx_pending(&self) -> u32 {
        self.rx_ready.load(Ordering::Acquire)
    }

    /// Registers the thread that runs [`Controller::run_deferred`].
    pub fn set_worker(&self, thread: Option<Thread>) {
        *self.worker.lock() = thread;
    }

    pub(crate) fn wake_worker(&self) {
        if let Some(thread) = self.worker.lock().as_ref() {
            thread.unpark();
        }
    }

    pub(crate) fn token(&self) -> Result<IpcToken<'_>, ChubError> {
        self.in_use_ipc.fetch_add(1, Ordering::SeqCst);
        let token = IpcToken(&self.in_use_ipc);
        if self.in_reset.load(Ordering::SeqCst) > 0 {
            return Err(ChubError::ResetInProgress);
        }
        Ok(token)
    }

    fn require_running(&self) -> Result<(), ChubError> {
        match self.status() {
            ChubStatus::Running => Ok(()),
            ChubStatus::Hung => Err(ChubError::Hung),
            status => Err(ChubError::NotRunning(status)),
        }
    }

    fn transport_fault(&self, err: &IpcError, write: bool) {
        warn!("{}: {err}", if write { "write" } else { "read" });
        if let Some(kind) = FaultKind::from_ipc(err, write) {
            self.observe_fault(kind, FaultContext::Task);
        }
    }

    /// Sends one packet to the device.
    pub fn write(&self, payload: &[u8]) -> Result<(), ChubError> {
        self.require_running()?;
        let result = {
            let _token = self.token()?;
            self.ipc.write_data(payload, self.delay.as_ref())
        };
        match result {
            Ok(()) => {
                self.faults.clear(FaultKind::WriteFail);
                Ok(())
            }
            Err(err) => {
                self.transport_fault(&err, true);
                Err(err.into())
            }
        }
    }

    /// Takes the oldest packet from the device, if any.
    pub fn try_read(&self) -> Result<Option<Vec<u8>>, ChubError> {
        self.require_running()?;
        let result = {
            let _token = self.token()?;
            self.ipc.read_data()
        };
        match result {
            Ok(Some(packet)) => {
                let _ = self.rx_ready.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    v.checked_sub(1)
                });
                self.faults.clear(FaultKind::ReadFail);
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.transport_fault(&err, false);
                Err(err.into())
            }
        }
    }

    /// Waits up to `timeout_ms` for a packet from the device.
    pub fn read(&self, timeout_ms: u32) -> Result<Vec<u8>, ChubError> {
        let poll_ms = self.config.read_poll_ms.max(1);
        let mut outcome = None;
        poll_until(self.delay.as_ref(), timeout_ms / poll_ms, poll_ms, || {
            match self.try_read() {
                Ok(None) => false,
                Ok(Some(packet)) => {
                    outcome = Some(Ok(packet));
                    true
                }
                Err(err) => {
                    outcome = Some(Err(err));
                    true
                }
            }
        });
        outcome.unwrap_or_else(|| {
            debug!("read: nothing within {timeout_ms} ms");
            self.observe_fault(FaultKind::ReadFail, FaultContext::Task);
            Err(ChubError::ReadTimeout(timeout_ms))
        })
    }

    fn signal(&self, event: HostEvent) -> Result<(), ChubError> {
        let _token = self.token()?;
        self.ipc
            .add_event(event as u32, self.delay.as_ref())
            .map_err(ChubError::from)
    }

    /// Takes a hold that keeps the device awake. See [`WakeupArbiter`].
    pub fn acquire_wakeup(&self, priority: bool) -> Result<(), ChubError> {
        let result = self.arbiter.acquire(priority, self, self.delay.as_ref());
        if let Err(err) = &result {
            let kind = match err {
                ChubError::WakeupTimeout(_) => FaultKind::WakeupTimeout,
                _ => FaultKind::EventAddFail,
            };
            self.observe_fault(kind, FaultContext::Task);
        }
        result
    }

    pub fn release_wakeup(&self, priority: bool) {
        self.arbiter.release(priority, self);
    }

    /// Sends a debug command to the firmware.
    pub fn send_debug_command(&self, cmd: DebugCommand) -> Result<(), ChubError> {
        self.require_running()?;
        info!("debug: {}", cmd.name());
        if cmd == DebugCommand::DumpStatus {
            self.map.dump();
            self.ipc.dump();
        }
        let result = {
            let _token = self.token()?;
            self.ipc
                .post_debug(cmd as u32, 0, HostEvent::Debug as u32, self.delay.as_ref())
        };
        result.map_err(|err| {
            warn!("debug {}: {err}", cmd.name());
            if let Some(kind) = FaultKind::from_ipc(&err, true) {
                self.observe_fault(kind, FaultContext::Task);
            }
            err.into()
        })
    }

    /// Pings the device and waits for the answer.
    pub fn check_alive(&self) -> bool {
        let Ok(_token) = self.token() else {
            return false;
        };
        self.ping_alive()
    }

    pub(crate) fn ping_alive(&self) -> bool {
        let doorbell = self.ipc.doorbell();
        self.alive.store(false, Ordering::Release);
        doorbell.write_scratch(scratch::ALIVE, scratch::ALIVE_HELLO);
        doorbell.raise(Direction::ToDevice, irq::ALIVE_LINE);

        let poll_ms = self.config.alive_poll_ms.max(1);
        poll_until(
            self.delay.as_ref(),
            self.config.alive_ping_ms / poll_ms,
            poll_ms,
            || {
                if self.ipc.take_alive() {
                    self.alive.store(true, Ordering::Release);
                }
                self.alive.load(Ordering::Acquire)
            },
        )
    }

    /// Human readable status, one fact per line.
    pub fn status_report(&self) -> String {
        let status = self.status();
        let alive = status == ChubStatus::Running && self.check_alive();
        let mut out = String::from(if alive {
            "chub alive\n"
        } else {
            "chub isn't alive\n"
        });

        let doorbell = self.ipc.doorbell();
        let to_host = doorbell.raw_status(Direction::ToHost);
        let to_device = doorbell.raw_status(Direction::ToDevice);
        let _ = writeln!(out, "status: {status}");
        let _ = writeln!(
            out,
            "pending c2a: {:?}",
            to_host.view_bits::<Lsb0>().iter_ones().collect::<Vec<_>>()
        );
        let _ = writeln!(
            out,
            "pending a2c: {:?}",
            to_device.view_bits::<Lsb0>().iter_ones().collect::<Vec<_>>()
        );
        let _ = writeln!(
            out,
            "wakeup: holders {} priority {} awake {}",
            self.arbiter.holders(),
            self.arbiter.priority_holders(),
            self.arbiter.is_awake()
        );
        let _ = writeln!(out, "resets: {}", self.reset_count());
        for (kind, count) in self.faults.active() {
            let _ = writeln!(out, "fault {kind}: {count}");
        }
        out
    }

    /// Moves pending firmware log bytes into the host buffer.
    pub fn flush_log(&self) -> Result<usize, ChubError> {
        self.log.flush_from(self.ipc.log()).map_err(|err| {
            warn!("log: {err}");
            err.into()
        })
    }

    /// Current contents of the dump region, read without stopping the device.
    pub fn read_dump_region(&self) -> Vec<u8> {
        self.map.region(RegionId::Dump).window().to_vec()
    }

    /// Handles one mailbox interrupt. Never blocks.
    pub fn handle_interrupt(&self) {
        let status = self.status();
        let doorbell = self.ipc.doorbell();
        if !status.accepts_interrupts() {
            if doorbell.status(Direction::ToHost) != 0 {
                warn!("interrupt while {status}, masking");
                doorbell.mask_all(Direction::ToHost);
            }
            return;
        }

        if self.ipc.take_alive() {
            self.alive.store(true, Ordering::Release);
        }

        let result = {
            let Ok(_token) = self.token() else {
                return;
            };
            self.ipc.dispatch(&mut |event| self.on_event(event))
        };

        match result {
            Ok(_) => {
                self.faults.clear(FaultKind::EventQueueEmpty);
                self.faults.clear(FaultKind::EventQueueMismatch);
            }
            Err(err) => {
                error!("dispatch: {err}");
                doorbell.clear_all(Direction::ToHost);
                let kind = FaultKind::from_ipc(&err, false).unwrap_or(FaultKind::EventQueueMismatch);
                self.observe_fault(kind, FaultContext::Interrupt);
            }
        }

        if self.log_requested.load(Ordering::Acquire) {
            self.wake_worker();
        }
    }

    /// Handles the co-processor watchdog interrupt.
    ///
    /// Takes a dump while the device is still in the state the watchdog
    /// caught it in and hands the fault to the worker. The line is ignored
    /// after that until a power on or reset brings the device up again.
    pub fn handle_watchdog(&self) {
        if !self.watchdog_armed.swap(false, Ordering::AcqRel) {
            debug!("watchdog: not armed, ignored");
            return;
        }
        error!("watchdog expired while {}", self.status());
        self.capture_dump(FaultKind::Watchdog);
        self.observe_fault(FaultKind::Watchdog, FaultContext::Interrupt);
    }

    /// Handles a bus monitor report naming `master`.
    ///
    /// # Returns
    ///
    /// `false` when the master is not part of the context hub and the
    /// report was left alone, `true` when it was handled here.
    pub fn handle_bus_error(&self, master: &str) -> bool {
        if !itmon::is_hub_master(master) {
            return false;
        }
        let status = self.status();
        if status == ChubStatus::NoPower {
            warn!("bus error from {master} without power, ignored");
            return true;
        }
        error!("bus error from {master} while {status}");
        self.capture_dump(FaultKind::BusError);
        self.observe_fault(FaultKind::BusError, FaultContext::Interrupt);
        true
    }

    fn on_event(&self, event: IpcEvent) {
        let code = match event {
            IpcEvent::Alive => {
                self.alive.store(true, Ordering::Release);
                return;
            }
            IpcEvent::Code(code) => code,
        };

        match DeviceEvent::from_code(code) {
            Some(DeviceEvent::Channel0 | DeviceEvent::Channel1 | DeviceEvent::Channel2) => {
                self.rx_ready.fetch_add(1, Ordering::AcqRel);
            }
            Some(DeviceEvent::Debug) => self.on_device_request(),
            Some(DeviceEvent::Assert) => {
                error!("firmware assert");
                self.observe_fault(FaultKind::FirmwareAssert, FaultContext::Interrupt);
            }
            Some(DeviceEvent::WakeAssert) => self.arbiter.notify_awake(true),
            Some(DeviceEvent::WakeDeassert) => self.arbiter.notify_awake(false),
            None => warn!("unknown device event {code}"),
        }
    }

    fn on_device_request(&self) {
        let (word, arg) = self.ipc.read_debug();
        match DeviceRequest::from_code(word) {
            Some(DeviceRequest::PrintLog | DeviceRequest::FullLog) => {
                self.log_requested.store(true, Ordering::Release);
            }
            Some(DeviceRequest::Fault) => {
                error!("firmware fault (arg {arg:#x})");
                self.observe_fault(FaultKind::FirmwareFault, FaultContext::Interrupt);
            }
            Some(DeviceRequest::Assert | DeviceRequest::Error) => {
                error!("firmware error {word:#x} (arg {arg:#x})");
                self.observe_fault(FaultKind::FirmwareAssert, FaultContext::Interrupt);
            }
            None => warn!("unknown device request {word:#x}"),
        }
    }

    /// Records a fault and escalates it when the classifier says so.
    pub fn observe_fault(&self, kind: FaultKind, context: FaultContext) {
        match self.faults.record(kind, self.delay.now_ms()) {
            Verdict::Counted(count) => debug!("fault {kind}: {count} in window"),
            Verdict::Escalate => self.escalate(kind, context),
        }
    }

    fn escalate(&self, kind: FaultKind, context: FaultContext) {
        if matches!(
            self.status(),
            ChubStatus::NoPower | ChubStatus::ShuttingDown | ChubStatus::Hung
        ) {
            warn!("fault {kind} ignored while {}", self.status());
            return;
        }
        error!("escalating {kind}");

        if self.in_reset.load(Ordering::SeqCst) > 0 {
            self.faults.defer(kind);
            self.wake_worker();
            return;
        }
        self.status.transition_from(
            &[ChubStatus::PoweredOn, ChubStatus::Running],
            ChubStatus::ErrorLatched,
        );
        match context {
            FaultContext::Interrupt => {
                self.faults.defer(kind);
                self.wake_worker();
            }
            FaultContext::Task => self.recover(kind),
        }
    }

    pub(crate) fn recover(&self, kind: FaultKind) {
        match self.config.reset_policy {
            ResetPolicy::LatchHung => {
                error!("{kind}: device marked hung");
                self.set_status(ChubStatus::Hung);
            }
            ResetPolicy::Recover => {
                if let Err(err) = self.reset(false, Some(kind)) {
                    error!("recovery from {kind} failed: {err}");
                }
            }
        }
    }

    /// Work queued from interrupt context: log flush requests and faults
    /// that need a reset. Returns the number of faults handled.
    pub fn run_deferred(&self) -> usize {
        if self.log_requested.swap(false, Ordering::AcqRel) {
            let _ = self.flush_log();
        }

        let kinds = self.faults.take_deferred();
        for &kind in &kinds {
            match self.status() {
                ChubStatus::NoPower | ChubStatus::ShuttingDown | ChubStatus::Hung => {
                    debug!("deferred {kind} dropped");
                }
                ChubStatus::Running if self.check_alive() => {
                    info!("deferred {kind}: device alive, no reset");
                }
                _ => self.recover(kind),
            }
        }
        kinds.len()
    }
}

impl WakeSignal for Controller {
    fn request_awake(&self) -> Result<(), ChubError> {
        self.signal(HostEvent::Wakeup)
    }

    fn allow_idle(&self) -> Result<(), ChubError> {
        self.signal(HostEvent::WakeupClear)
    }
}
