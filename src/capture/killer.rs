//! Kill a process without letting the kill itself hang teardown.

use std::time::Duration;

use async_trait::async_trait;

/// Something that can be asked whether it is alive and be killed.
#[async_trait]
pub trait Killable: Send {
    /// Whether the process is still running. Reaps it if it has exited.
    fn is_alive(&mut self) -> bool;

    /// Kill and reap the process.
    async fn kill(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl Killable for tokio::process::Child {
    fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        tokio::process::Child::kill(self).await
    }
}

/// Kill `process`, giving up after `timeout`.
///
/// Returns `true` when the kill completed in time. `false` means the process
/// may still be running; callers log it and carry on.
pub async fn kill<P: Killable + ?Sized>(process: &mut P, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, process.kill()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::warn!("[Killer] Kill failed: {}", e);
            false
        }
        Err(_) => {
            log::warn!(
                "[Killer] Kill did not complete within {}ms, abandoning",
                timeout.as_millis()
            );
            false
        }
    }
}
