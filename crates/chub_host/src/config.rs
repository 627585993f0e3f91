use chub_common::timing;

/// What an escalated fault does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetPolicy {
    /// Reset the device and try to bring it back.
    #[default]
    Recover,
    /// Stop talking to the device until someone forces a reset.
    LatchHung,
}

#[derive(Debug, Clone)]
pub struct ChubConfig {
    pub reset_policy: ResetPolicy,
    /// Total reset attempts per recovery, including the first.
    pub reset_attempts: u32,
    pub reset_backoff_ms: u32,
    pub drain_tries: u32,
    pub drain_poll_ms: u32,
    pub shutdown_grace_ms: u32,
    /// Extra pings after the first one fails.
    pub alive_retries: u32,
    pub alive_poll_ms: u32,
    /// How long one ping waits for the answer.
    pub alive_ping_ms: u32,
    /// Recoverable faults of one kind tolerated inside the window.
    pub fault_threshold: u32,
    pub fault_window_ms: u64,
    pub wakeup_timeout_ms: u32,
    pub read_poll_ms: u32,
    /// Read back downloaded images and compare.
    pub verify_firmware: bool,
    pub log_flush_ms: u32,
    /// Bytes of firmware log kept on the host.
    pub log_capacity: usize,
    pub clock_hz: u32,
    pub kernel_log: bool,
}

impl Default for ChubConfig {
    fn default() -> Self {
        Self {
            reset_policy: ResetPolicy::Recover,
            reset_attempts: timing::RESET_ATTEMPTS,
            reset_backoff_ms: timing::RESET_BACKOFF_MS,
            drain_tries: timing::DRAIN_TRIES,
            drain_poll_ms: timing::DRAIN_POLL_MS,
            shutdown_grace_ms: timing::SHUTDOWN_GRACE_MS,
            alive_retries: timing::ALIVE_RETRIES,
            alive_poll_ms: timing::ALIVE_POLL_MS,
            alive_ping_ms: timing::ALIVE_PING_MS,
            fault_threshold: timing::FAULT_THRESHOLD,
            fault_window_ms: 60_000,
            wakeup_timeout_ms: timing::WAKEUP_TIMEOUT_MS,
            read_poll_ms: 1,
            verify_firmware: true,
            log_flush_ms: timing::LOG_FLUSH_MS,
            log_capacity: 1 << 20,
            clock_hz: 0,
            kernel_log: false,
        }
    }
}
