use crate::controller::Controller;
use chub_core::delay::Delay;
use log::{debug, info};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Wall clock delay for real devices and the demo.
pub struct StdDelay {
    origin: Instant,
}

impl StdDelay {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Delay for StdDelay {
    fn delay_ms(&self, ms: u32) {
        thread::sleep(Duration::from_millis(ms as u64));
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// The deferred fault worker and the periodic log flusher.
///
/// The fault worker sleeps until interrupt dispatch unparks it and then
/// runs [`Controller::run_deferred`]. The flusher drains the firmware log
/// every `log_flush_ms`. Both stop when [`Workers::stop`] is called or the
/// value is dropped.
pub struct Workers {
    running: Arc<AtomicBool>,
    controller: Arc<Controller>,
    fault: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl Workers {
    pub fn spawn(controller: Arc<Controller>) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));

        let (c_fault, r_fault) = (controller.clone(), running.clone());
        let fault = thread::Builder::new()
            .name("chub-fault".into())
            .spawn(move || {
                while r_fault.load(Ordering::Acquire) {
                    let handled = c_fault.run_deferred();
                    if handled > 0 {
                        debug!("worker: handled {handled} deferred fault(s)");
                    }
                    thread::park_timeout(Duration::from_millis(100));
                }
            })?;
        controller.set_worker(Some(fault.thread().clone()));
        let mut workers = Self {
            running: running.clone(),
            controller: controller.clone(),
            fault: Some(fault),
            flusher: None,
        };

        let interval = Duration::from_millis(controller.config().log_flush_ms.max(1) as u64);
        workers.flusher = Some(
            thread::Builder::new()
                .name("chub-log".into())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        thread::park_timeout(interval);
                        if let Ok(n) = controller.flush_log() {
                            if n > 0 {
                                debug!("worker: flushed {n} log byte(s)");
                            }
                        }
                    }
                })?,
        );

        info!("workers started");
        Ok(workers)
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.controller.set_worker(None);
        for handle in [self.fault.take(), self.flusher.take()].into_iter().flatten() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        info!("workers stopped");
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop();
    }
}
