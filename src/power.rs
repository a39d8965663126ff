//! OS power control
//!
//! The shutdown timer chain ends here. The real implementation shells out to
//! the OS after a deliberate pre-delay long enough for an operator to SSH in
//! and break a boot loop; tests substitute a recording double.

use crate::error::{GalvaniError, Result};
use crate::logging::get_logger;

/// Terminal power actions on the host
#[async_trait::async_trait]
pub trait SystemPower: Send {
    /// Halt the OS. Only returns on failure to invoke the shutdown.
    async fn shut_down(&mut self) -> Result<()>;

    /// Reboot the OS. Only returns on failure to invoke the reboot.
    async fn reboot(&mut self) -> Result<()>;
}

/// Real OS power control via `shutdown(8)`
pub struct OsPower {
    pre_delay_sec: u64,
    logger: crate::logging::StructuredLogger,
}

impl OsPower {
    pub fn new(pre_delay_sec: u64) -> Self {
        Self {
            pre_delay_sec,
            logger: get_logger("power"),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        self.logger.warn(&format!(
            "Invoking OS power action in {} seconds: shutdown {}",
            self.pre_delay_sec,
            args.join(" ")
        ));
        tokio::time::sleep(std::time::Duration::from_secs(self.pre_delay_sec)).await;
        let status = tokio::process::Command::new("/usr/sbin/shutdown")
            .args(args)
            .status()
            .await
            .map_err(|e| GalvaniError::io(format!("failed to invoke shutdown: {}", e)))?;
        if !status.success() {
            return Err(GalvaniError::io(format!(
                "shutdown exited with {}",
                status
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SystemPower for OsPower {
    async fn shut_down(&mut self) -> Result<()> {
        self.run(&["-h", "now"]).await
    }

    async fn reboot(&mut self) -> Result<()> {
        self.run(&["-r", "now"]).await
    }
}

/// Records requested power actions instead of performing them. Clones share
/// counters, so a test can keep a handle while the controller owns the double.
#[derive(Debug, Clone, Default)]
pub struct RecordingPower {
    shutdowns: std::sync::Arc<std::sync::atomic::AtomicU32>,
    reboots: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl RecordingPower {
    pub fn shutdowns(&self) -> u32 {
        self.shutdowns.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn reboots(&self) -> u32 {
        self.reboots.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SystemPower for RecordingPower {
    async fn shut_down(&mut self) -> Result<()> {
        self.shutdowns
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn reboot(&mut self) -> Result<()> {
        self.reboots
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
