use crate::fault::FaultKind;
use chub_common::mmio::{GPR_COUNT, GPR_PC_INDEX};
use chub_core::doorbell::MailboxSnapshot;
use core::fmt;

/// Device state captured before a reset, for post-mortem analysis.
#[derive(Debug, Clone)]
pub struct DiagnosticDump {
    pub reason: FaultKind,
    pub taken_at_ms: u64,
    /// Completed resets before this one.
    pub reset_count: u32,
    pub mailbox: MailboxSnapshot,
    pub gpr: [u32; GPR_COUNT],
    /// Copy of the dump region.
    pub memory: Vec<u8>,
}

impl DiagnosticDump {
    pub fn pc(&self) -> u32 {
        self.gpr[GPR_PC_INDEX]
    }
}

impl fmt::Display for DiagnosticDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "dump: {} at {} ms, {} earlier reset(s), {} bytes of memory",
            self.reason,
            self.taken_at_ms,
            self.reset_count,
            self.memory.len()
        )?;
        for (i, reg) in self.gpr[..GPR_PC_INDEX].iter().enumerate() {
            write!(f, "r{i:<2} {reg:08x}")?;
            f.write_str(if i % 4 == 3 { "\n" } else { "  " })?;
        }
        writeln!(f, "pc  {:08x}", self.pc())?;
        for (name, value) in self.mailbox.registers {
            writeln!(f, "{name:>8} {value:08x}")?;
        }
        Ok(())
    }
}

/// Why one reset attempt failed, with the registers read right after.
#[derive(Debug, Clone)]
pub struct ResetFailure {
    pub attempt: u32,
    pub error: String,
    pub mailbox: MailboxSnapshot,
    pub platform: Vec<(&'static str, u32)>,
}

impl fmt::Display for ResetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "attempt {}: {}", self.attempt, self.error)?;
        for (name, value) in &self.platform {
            writeln!(f, "  {name} {value:#010x}")?;
        }
        Ok(())
    }
}
