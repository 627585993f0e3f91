use crate::stats::RoundTripStats;
use anyhow::{Context, Result, ensure};
use chub_core::ChannelId;
use chub_core::platform::FirmwareSource;
use chub_host::worker::{StdDelay, Workers};
use chub_host::{ChubConfig, Controller};
use chub_io::loader::FileFirmware;
use chub_io::parser;
use chub_sim::SimBoard;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const READ_TIMEOUT_MS: u32 = 100;

/// A simulated board driven in real time: a pump thread plays the device
/// and delivers its interrupts to the controller.
pub struct Rig {
    pub board: SimBoard,
    pub controller: Arc<Controller>,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    workers: Workers,
}

impl Rig {
    pub fn start(images: Option<(String, String)>, config: ChubConfig) -> Result<Self> {
        let board = SimBoard::new();
        let firmware: Arc<dyn FirmwareSource> = match images {
            Some((bootloader, os)) => Arc::new(FileFirmware::new(bootloader, os)),
            None => board.firmware.clone(),
        };
        let controller = Arc::new(
            Controller::attach(
                board.window.clone(),
                board.bank.clone(),
                board.platform.clone(),
                firmware,
                Arc::new(StdDelay::new()),
                config,
            )
            .context("Failed to attach to the simulated board")?,
        );

        let running = Arc::new(AtomicBool::new(true));
        let (r_pump, device, c_pump) = (running.clone(), board.device.clone(), controller.clone());
        let pump = thread::Builder::new()
            .name("chub-pump".into())
            .spawn(move || {
                while r_pump.load(Ordering::Relaxed) {
                    device.step();
                    if device.take_watchdog() {
                        c_pump.handle_watchdog();
                    }
                    if let Some(master) = device.take_bus_error() {
                        c_pump.handle_bus_error(master);
                    }
                    c_pump.handle_interrupt();
                    thread::sleep(Duration::from_micros(200));
                }
            })?;
        let workers = Workers::spawn(controller.clone())?;

        controller.power_on().context("Power on failed")?;
        println!("Context hub is {}", controller.status());
        Ok(Self {
            board,
            controller,
            running,
            pump: Some(pump),
            workers,
        })
    }

    fn round_trip(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.controller.write(payload)?;
        Ok(self.controller.read(READ_TIMEOUT_MS)?)
    }

    pub fn stop(mut self) -> Result<()> {
        self.controller.shutdown()?;
        self.workers.stop();
        self.running.store(false, Ordering::Relaxed);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        Ok(())
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

fn print_log(controller: &Controller) {
    let _ = controller.flush_log();
    let log = controller.log().take();
    if !log.is_empty() {
        println!("\nFirmware log:");
        print!("{}", String::from_utf8_lossy(&log));
    }
}

pub fn run_echo(rig: &Rig, packets: usize, size: usize) -> Result<()> {
    println!("ECHO");
    println!("Packets: {packets}");
    println!("Size:    {size} bytes");
    println!("-------------------------------");

    let controller = &rig.controller;
    controller.acquire_wakeup(false)?;
    let mut stats = RoundTripStats::new();
    for i in 0..packets {
        let payload: Vec<u8> = (0..size).map(|j| (i + j) as u8).collect();
        let start = Instant::now();
        match rig.round_trip(&payload) {
            Ok(echo) if echo == payload => stats.update(start.elapsed().as_nanos() as u64),
            Ok(_) => stats.fail(),
            Err(err) => {
                log::warn!("packet {i}: {err}");
                stats.fail();
            }
        }
    }
    controller.release_wakeup(false);

    stats.print_report();
    print_log(controller);
    println!("\n{}", controller.status_report());
    Ok(())
}

pub fn run_recover(rig: &Rig, packets: usize) -> Result<()> {
    println!("RECOVERY");
    println!("-------------------------------");
    let controller = &rig.controller;

    for i in 0..packets {
        rig.round_trip(&[i as u8; 16])?;
    }
    println!("Exchanged {packets} packets, corrupting {}", ChannelId::DataToDevice);
    ensure!(
        rig.board.device.corrupt(ChannelId::DataToDevice),
        "device is not running"
    );

    match controller.write(b"after corruption") {
        Ok(()) => println!("Write unexpectedly succeeded"),
        Err(err) => println!("Write failed: {err}"),
    }
    println!("Status after recovery: {}", controller.status());
    println!("Resets: {}", controller.reset_count());
    if let Some(dump) = controller.last_dump() {
        print!("{dump}");
    }

    let echo = rig.round_trip(b"after recovery")?;
    ensure!(echo == b"after recovery", "echo mismatch after recovery");
    println!("Link restored");
    print_log(controller);
    Ok(())
}

pub fn run_utc(rig: &Rig, command: &str) -> Result<()> {
    let cmd = parser::parse_command(command)?;
    rig.controller.send_debug_command(cmd)?;
    thread::sleep(Duration::from_millis(50));
    println!("Sent {} ({})", cmd.name(), cmd as u32);
    print_log(&rig.controller);
    println!("\n{}", rig.controller.status_report());
    Ok(())
}

pub fn run_send(rig: &Rig, payload: &str) -> Result<()> {
    let bytes = parser::parse_payload(payload)?;
    let echo = rig.round_trip(&bytes)?;
    let hex: Vec<String> = echo.iter().map(|b| format!("{b:02x}")).collect();
    println!("{}", hex.join(" "));
    Ok(())
}
