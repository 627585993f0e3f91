use crate::controller::{Controller, locked};
use crate::diag::{DiagnosticDump, ResetFailure};
use crate::error::ChubError;
use crate::fault::{FaultContext, FaultKind};
use crate::status::ChubStatus;
use chub_common::irq::HostEvent;
use chub_common::{ipc, scratch};
use chub_core::delay::poll_until;
use chub_core::doorbell::Direction;
use chub_core::memmap::RegionId;
use chub_core::platform::FirmwareError;
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

/// Holds the reset lock, the in-reset flag and a priority wake hold for
/// the duration of one recovery. Dropping it releases all three.
struct ResetSession<'a> {
    controller: &'a Controller,
    force_reload: bool,
    reason: Option<FaultKind>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> ResetSession<'a> {
    fn begin(
        controller: &'a Controller,
        guard: MutexGuard<'a, ()>,
        force_reload: bool,
        reason: Option<FaultKind>,
    ) -> Self {
        controller.in_reset.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = controller
            .arbiter
            .acquire(true, controller, controller.delay.as_ref())
        {
            warn!("reset: priority wake hold failed: {err}");
        }
        Self {
            controller,
            force_reload,
            reason,
            _guard: guard,
        }
    }
}

impl Drop for ResetSession<'_> {
    fn drop(&mut self) {
        self.controller.in_reset.fetch_sub(1, Ordering::SeqCst);
        self.controller.arbiter.release(true, self.controller);
    }
}

impl Controller {
    /// Brings the device up from [`ChubStatus::NoPower`].
    ///
    /// Downloads both images, initialises the IPC map and waits for the
    /// firmware to answer. A device that stays silent is handed to the
    /// fault classifier, which escalates to a reset; the call succeeds if
    /// that reset brings the device up.
    pub fn power_on(&self) -> Result<(), ChubError> {
        let guard = locked(&self.reset_lock);
        let status = self.status();
        if status != ChubStatus::NoPower {
            return Err(ChubError::InvalidState {
                op: "power on",
                status,
            });
        }

        self.download_firmware()?;
        self.prepare_boot();
        self.ipc.doorbell().unmask_all(Direction::ToHost);
        self.platform.power_on()?;
        self.set_status(ChubStatus::PoweredOn);
        let handshake = self.wait_alive();
        drop(guard);

        match handshake {
            Ok(()) => {
                self.watchdog_armed.store(true, Ordering::Release);
                self.set_status(ChubStatus::Running);
                Ok(())
            }
            Err(err) => {
                error!("power on: {err}");
                self.set_status(ChubStatus::NotResponding);
                self.observe_fault(FaultKind::NoResponse, FaultContext::Task);
                match self.status() {
                    ChubStatus::Running => Ok(()),
                    _ => Err(err),
                }
            }
        }
    }

    /// Resets the device and waits for the firmware to come back.
    ///
    /// Without `force_reload` a running device is left alone and a hung one
    /// is refused. The firmware is downloaded again when `force_reload` is
    /// set or when no image is known to be resident. When `reason` is set,
    /// a diagnostic dump is taken before the device is touched.
    ///
    /// # Arguments
    ///
    /// * `force_reload` - reset and download even when the device runs.
    /// * `reason` - fault that triggered the reset, if any.
    ///
    /// # Returns
    ///
    /// The error of the last attempt once all attempts failed, in which
    /// case the status is [`ChubStatus::NotResponding`]. Each failure is
    /// kept in [`Controller::reset_failures`].
    pub fn reset(&self, force_reload: bool, reason: Option<FaultKind>) -> Result<(), ChubError> {
        let guard = locked(&self.reset_lock);
        match self.status() {
            ChubStatus::Running if !force_reload => {
                debug!("reset: device running, nothing to do");
                return Ok(());
            }
            ChubStatus::Hung if !force_reload => return Err(ChubError::Hung),
            _ => {}
        }

        let mut session = ResetSession::begin(self, guard, force_reload, reason);
        self.run_reset(&mut session)
    }

    fn run_reset(&self, session: &mut ResetSession<'_>) -> Result<(), ChubError> {
        info!(
            "reset: start (reload {}, reason {})",
            session.force_reload,
            session.reason.map_or("none", FaultKind::name)
        );
        locked(&self.failures).clear();

        let attempts = self.config.reset_attempts;
        let mut last = ChubError::AliveHandshakeTimeout { attempts: 0 };
        for attempt in 1..=attempts {
            match self.reset_attempt(session) {
                Ok(()) => {
                    self.faults.clear_all();
                    let total = self.faults.note_reset();
                    self.watchdog_armed.store(true, Ordering::Release);
                    self.set_status(ChubStatus::Running);
                    info!("reset: done after {attempt} attempt(s), {total} reset(s) so far");
                    return Ok(());
                }
                Err(err) => {
                    error!("reset: attempt {attempt}/{attempts} failed: {err}");
                    self.record_failure(attempt, &err);
                    last = err;
                    if attempt < attempts {
                        self.delay.delay_ms(self.config.reset_backoff_ms);
                    }
                }
            }
        }
        error!("reset: giving up");
        self.set_status(ChubStatus::NotResponding);
        Err(last)
    }

    fn reset_attempt(&self, session: &mut ResetSession<'_>) -> Result<(), ChubError> {
        let doorbell = self.ipc.doorbell();
        doorbell.mask_all(Direction::ToHost);
        self.drain_ipc()?;

        if let Some(reason) = session.reason.take() {
            if self.has_fresh_dump(reason) {
                debug!("reset: keeping the dump already taken for {reason}");
            } else {
                self.capture_dump(reason);
            }
        }

        if let Err(err) = self
            .ipc
            .add_event(HostEvent::Shutdown as u32, self.delay.as_ref())
        {
            warn!("reset: shutdown request not delivered: {err}");
        }
        self.delay.delay_ms(self.config.shutdown_grace_ms);

        self.platform.reset_cycle()?;
        self.set_status(ChubStatus::PoweredOn);
        if session.force_reload || !self.firmware_resident.load(Ordering::Acquire) {
            self.erase_shared();
            self.download_firmware()?;
        }
        self.prepare_boot();
        doorbell.unmask_all(Direction::ToHost);

        if let Err(err) = self
            .ipc
            .add_event(HostEvent::ResetComplete as u32, self.delay.as_ref())
        {
            warn!("reset: completion not delivered: {err}");
        }
        self.wait_alive()
    }

    fn drain_ipc(&self) -> Result<(), ChubError> {
        let drained = poll_until(
            self.delay.as_ref(),
            self.config.drain_tries,
            self.config.drain_poll_ms,
            || self.in_use_ipc.load(Ordering::SeqCst) == 0,
        );
        if drained {
            Ok(())
        } else {
            Err(ChubError::DrainTimeout {
                in_use: self.in_use_ipc.load(Ordering::SeqCst),
            })
        }
    }

    /// Whether the newest dump was taken for `reason` since the last
    /// completed reset.
    fn has_fresh_dump(&self, reason: FaultKind) -> bool {
        locked(&self.last_dump)
            .as_ref()
            .is_some_and(|dump| dump.reason == reason && dump.reset_count == self.faults.resets())
    }

    pub(crate) fn capture_dump(&self, reason: FaultKind) {
        let _ = self.flush_log();
        self.ipc.dump();
        let dump = DiagnosticDump {
            reason,
            taken_at_ms: self.delay.now_ms(),
            reset_count: self.faults.resets(),
            mailbox: self.ipc.doorbell().snapshot(),
            gpr: self.platform.read_gpr(),
            memory: self.read_dump_region(),
        };
        info!("reset: dump taken for {reason}, pc {:#010x}", dump.pc());
        *locked(&self.last_dump) = Some(Arc::new(dump));
    }

    fn record_failure(&self, attempt: u32, err: &ChubError) {
        let failure = ResetFailure {
            attempt,
            error: err.to_string(),
            mailbox: self.ipc.doorbell().snapshot(),
            platform: self.platform.diagnostic_registers(),
        };
        for (name, value) in &failure.platform {
            debug!("reset: {name} {value:#010x}");
        }
        locked(&self.failures).push(failure);
    }

    /// Copies both images into their regions.
    fn download_firmware(&self) -> Result<(), ChubError> {
        self.firmware_resident.store(false, Ordering::Release);
        let bootloader = self.firmware.bootloader()?;
        self.copy_image(RegionId::Bootloader, &bootloader)?;
        let os = self.firmware.os_image()?;
        self.copy_image(RegionId::Os, &os)?;
        self.firmware_resident.store(true, Ordering::Release);
        Ok(())
    }

    fn copy_image(&self, id: RegionId, image: &[u8]) -> Result<(), ChubError> {
        let region = self.map.region(id);
        let window = region.window();
        if image.len() > window.len() {
            return Err(FirmwareError::TooLarge {
                image: id.name(),
                len: image.len(),
                capacity: window.len(),
            }
            .into());
        }
        window.write_bytes(0, image);

        if self.config.verify_firmware {
            let mut readback = vec![0u8; image.len()];
            window.read_bytes(0, &mut readback);
            if let Some(offset) = image.iter().zip(&readback).position(|(a, b)| a != b) {
                error!("{}: readback mismatch at {offset:#x}", id.name());
                return Err(ChubError::FirmwareVerifyMismatch {
                    region: id.name(),
                    offset,
                });
            }
        }
        info!("{}: {} bytes loaded", id.name(), image.len());
        Ok(())
    }

    /// Zeroes the IPC map and publishes the boot arguments. The bootloader
    /// image carries its own copy of the descriptor, so this runs after
    /// any download.
    fn prepare_boot(&self) {
        self.ipc.init();
        if !self.ipc.check_reset_valid() {
            error!("ipc map not clean after init");
        }
        self.map
            .write_boot_args(self.config.clock_hz, ipc::BOOTMODE_COLD, self.config.kernel_log);

        let doorbell = self.ipc.doorbell();
        doorbell.clear_all(Direction::ToDevice);
        doorbell.write_scratch(
            scratch::BOOT_MODE,
            self.firmware_resident.load(Ordering::Acquire) as u32,
        );
        doorbell.write_scratch(
            scratch::ALIVE,
            if self.config.kernel_log {
                scratch::KERNEL_LOG_ON
            } else {
                scratch::KERNEL_LOG_OFF
            },
        );

        self.alive.store(false, Ordering::Release);
        self.rx_ready.store(0, Ordering::Release);
        self.arbiter.notify_awake(false);
    }

    /// Zeroes the shared scratch region left behind by the previous image.
    pub fn erase_shared(&self) {
        let window = self.map.region(RegionId::Shared).window();
        window.fill(0, window.len(), 0);
        debug!("shared: {} bytes erased", window.len());
    }

    /// Pings until the firmware answers, with the configured retries.
    fn wait_alive(&self) -> Result<(), ChubError> {
        let retries = self.config.alive_retries;
        if poll_until(
            self.delay.as_ref(),
            retries,
            self.config.alive_poll_ms,
            || self.ping_alive(),
        ) {
            Ok(())
        } else {
            Err(ChubError::AliveHandshakeTimeout {
                attempts: retries + 1,
            })
        }
    }

    /// Stops the firmware and removes power.
    pub fn shutdown(&self) -> Result<(), ChubError> {
        let _guard = locked(&self.reset_lock);
        let status = self.status();
        if status == ChubStatus::NoPower {
            return Ok(());
        }

        self.set_status(ChubStatus::ShuttingDown);
        if status == ChubStatus::Running {
            if let Err(err) = self.request_shutdown() {
                warn!("shutdown: request not delivered: {err}");
            }
        }
        self.delay.delay_ms(self.config.shutdown_grace_ms);
        let _ = self.flush_log();

        self.ipc.doorbell().mask_all(Direction::ToHost);
        self.platform.power_off()?;
        self.firmware_resident.store(false, Ordering::Release);
        self.watchdog_armed.store(false, Ordering::Release);
        self.arbiter.notify_awake(false);
        self.set_status(ChubStatus::NoPower);
        Ok(())
    }

    fn request_shutdown(&self) -> Result<(), ChubError> {
        let _token = self.token()?;
        self.ipc
            .add_event(HostEvent::Shutdown as u32, self.delay.as_ref())
            .map_err(ChubError::from)
    }
}
