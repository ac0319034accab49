//! Background deletion of expired messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::error::Result;
use crate::store::DataStore;

/// Minimum time between the start of two scans.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of one pass over every mailbox.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub deleted: usize,
    pub retained: usize,
    pub failed: usize,
}

/// Periodically deletes messages older than `max_age`.
pub struct RetentionSweeper {
    store: Arc<dyn DataStore>,
    max_age: Duration,
    /// Pause after each mailbox to spread out disk load.
    pause: Duration,
    shutdown: CancellationToken,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn DataStore>,
        max_age: Duration,
        pause: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            max_age,
            pause,
            shutdown,
        }
    }

    /// Scan at most once per [`SCAN_INTERVAL`] until shutdown.
    pub async fn run(self) {
        info!(minutes = self.max_age.as_secs() / 60, "Retention scanner started");
        let mut started = Instant::now();
        loop {
            let next = started + SCAN_INTERVAL;
            trace!("Retention scanner sleeping");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }
            started = Instant::now();

            match self.scan().await {
                Ok(summary) => debug!(
                    deleted = summary.deleted,
                    retained = summary.retained,
                    failed = summary.failed,
                    "Retention scan complete"
                ),
                Err(e) => error!(error = %e, "Error during retention scan"),
            }
        }
        info!("Retention scanner stopped");
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        let age = chrono::Duration::from_std(self.max_age).ok()?;
        Utc::now().checked_sub_signed(age)
    }

    /// One pass over every mailbox. Individual delete failures are logged and
    /// counted; listing failures abort the pass.
    pub async fn scan(&self) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        let Some(cutoff) = self.cutoff() else {
            return Ok(summary);
        };
        trace!(cutoff = %cutoff, "Starting retention scan");

        for mailbox in self.store.all_mailboxes()? {
            for meta in mailbox.list()? {
                if meta.date >= cutoff {
                    summary.retained += 1;
                    continue;
                }
                trace!(mailbox = mailbox.name(), id = %meta.id, "Purging expired message");
                match mailbox.delete(&meta.id) {
                    Ok(()) => summary.deleted += 1,
                    Err(e) => {
                        error!(mailbox = mailbox.name(), id = %meta.id, error = %e, "Failed to purge message");
                        summary.failed += 1;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.pause) => {}
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::file::FileDataStore;

    fn fill(store: &dyn DataStore, address: &str, count: usize) {
        let mailbox = store.mailbox_for(address).unwrap();
        for i in 0..count {
            let mut msg = mailbox.new_message().unwrap();
            msg.append(format!("Subject: {i}\r\n\r\nbody\r\n").as_bytes())
                .unwrap();
            msg.close().unwrap();
        }
    }

    #[tokio::test]
    async fn test_scan_deletes_expired_and_reclaims() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileDataStore::open(dir.path(), 0).unwrap());
        fill(store.as_ref(), "alice", 2);
        fill(store.as_ref(), "bob", 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sweeper = RetentionSweeper::new(
            store.clone(),
            Duration::ZERO,
            Duration::ZERO,
            CancellationToken::new(),
        );
        let summary = sweeper.scan().await.unwrap();
        assert_eq!(summary.deleted, 3);
        assert_eq!(summary.failed, 0);
        assert!(store.all_mailboxes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_keeps_recent_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileDataStore::open(dir.path(), 0).unwrap());
        fill(store.as_ref(), "alice", 2);

        let sweeper = RetentionSweeper::new(
            store.clone(),
            Duration::from_secs(3600),
            Duration::ZERO,
            CancellationToken::new(),
        );
        let summary = sweeper.scan().await.unwrap();
        assert_eq!(summary, ScanSummary { deleted: 0, retained: 2, failed: 0 });
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileDataStore::open(dir.path(), 0).unwrap());
        let shutdown = CancellationToken::new();
        let sweeper = RetentionSweeper::new(
            store,
            Duration::from_secs(60),
            Duration::ZERO,
            shutdown.clone(),
        );
        let task = tokio::spawn(sweeper.run());
        shutdown.cancel();
        task.await.unwrap();
    }
}
