//! Poll Scheduler
//!
//! Fires a replication cycle at a fixed interval. Polling can be disabled and
//! re-enabled at runtime; this only affects future ticks, never a cycle that
//! is already running.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::coordinator::ReplicationClient;
use crate::error::{Error, Result};

/// Parse a poll interval written as `HH:mm:ss`. Any part may be empty.
pub fn parse_interval(interval: &str) -> Result<Duration> {
    let invalid = || Error::InvalidInterval(interval.to_string());

    let parts: Vec<&str> = interval.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }

    let mut secs: u64 = 0;
    for (part, unit) in parts.iter().zip([3600u64, 60, 1]) {
        if part.is_empty() {
            continue;
        }
        if !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: u64 = part.parse().map_err(|_| invalid())?;
        secs = value
            .checked_mul(unit)
            .and_then(|v| secs.checked_add(v))
            .ok_or_else(invalid)?;
    }

    Ok(Duration::from_secs(secs))
}

/// Runtime switches and timing of the poller
#[derive(Debug)]
pub struct PollControl {
    interval: Duration,
    disabled: AtomicBool,
    /// Epoch milliseconds of the next tick, 0 when unknown
    next_tick_ms: AtomicI64,
}

/// Poller state as reported by status
#[derive(Debug, Clone, Serialize)]
pub struct PollStatus {
    pub interval_secs: u64,
    pub disabled: bool,
    pub next_poll_at: Option<DateTime<Utc>>,
}

impl PollControl {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            disabled: AtomicBool::new(false),
            next_tick_ms: AtomicI64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn enable(&self) {
        self.disabled.store(false, Ordering::Release);
        tracing::info!("Polling enabled");
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
        tracing::info!("Polling disabled");
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Time of the next scheduled tick
    pub fn next_poll(&self) -> Option<DateTime<Utc>> {
        match self.next_tick_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    fn schedule_next(&self) {
        let next = Utc::now() + chrono::Duration::milliseconds(self.interval.as_millis() as i64);
        self.next_tick_ms.store(next.timestamp_millis(), Ordering::Release);
    }

    pub fn status(&self) -> PollStatus {
        PollStatus {
            interval_secs: self.interval.as_secs(),
            disabled: self.is_disabled(),
            next_poll_at: self.next_poll(),
        }
    }
}

/// Timer driving replication cycles
pub struct PollScheduler {
    client: Arc<ReplicationClient>,
    control: Arc<PollControl>,
    shutdown: watch::Sender<bool>,
}

impl PollScheduler {
    pub fn new(client: Arc<ReplicationClient>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::ZeroInterval);
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            control: Arc::new(PollControl::new(interval)),
            shutdown,
        })
    }

    pub fn control(&self) -> Arc<PollControl> {
        Arc::clone(&self.control)
    }

    /// Tick until [`stop`](Self::stop) is called. The first tick fires one
    /// interval after start.
    pub async fn run(&self) {
        let period = self.control.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown.subscribe();

        self.control.schedule_next();
        tracing::info!("Poll scheduled at an interval of {}ms", period.as_millis());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.control.schedule_next();
                    self.tick();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Poll scheduler stopped");
    }

    fn tick(&self) {
        if self.control.is_disabled() {
            tracing::info!("Poll disabled");
            return;
        }
        // A full copy is not live until its reload finishes
        if self.client.is_reloading() {
            tracing::debug!("Skipping poll while a reload is pending");
            return;
        }

        match self.client.spawn_cycle() {
            Ok(_) => tracing::debug!("Polling leader {}", self.client.leader()),
            Err(e) => tracing::debug!("Skipping poll: {}", e),
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommitPoint;
    use crate::testing::{MockLeader, RecordingHost};

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("00:01:30").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_interval("00:00:60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_interval(" 1:: ").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_interval("::5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_interval("::").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_interval_rejects_garbage() {
        for bad in ["", "60", "00:60", "1:2:3:4", "aa:bb:cc", "-1:00:00", "00:00:1.5"] {
            assert!(
                matches!(parse_interval(bad), Err(Error::InvalidInterval(_))),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn test_control_toggles() {
        let control = PollControl::new(Duration::from_secs(60));
        assert!(!control.is_disabled());
        assert!(control.next_poll().is_none());

        control.disable();
        assert!(control.status().disabled);
        control.enable();
        assert!(!control.is_disabled());

        control.schedule_next();
        let next = control.next_poll().unwrap();
        assert!(next > Utc::now() + chrono::Duration::seconds(50));
    }

    async fn client_at(
        dir: &std::path::Path,
        local: CommitPoint,
    ) -> (Arc<MockLeader>, Arc<RecordingHost>, Arc<ReplicationClient>) {
        let leader = Arc::new(MockLeader::new(2, 2));
        leader.add_index_file("segments_2", b"manifest", 0);
        let host = Arc::new(RecordingHost::open(dir));
        host.seed(local).await;
        let client = Arc::new(ReplicationClient::new(leader.clone(), host.clone()).unwrap());
        (leader, host, client)
    }

    async fn client(dir: &std::path::Path) -> (Arc<MockLeader>, Arc<ReplicationClient>) {
        let (leader, _, client) = client_at(dir, CommitPoint::new(1, 1)).await;
        (leader, client)
    }

    #[tokio::test]
    async fn test_scheduler_rejects_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (_, client) = client(dir.path()).await;
        assert!(matches!(
            PollScheduler::new(client, Duration::ZERO),
            Err(Error::ZeroInterval)
        ));
    }

    #[tokio::test]
    async fn test_scheduler_waits_for_pending_reload() {
        let dir = tempfile::tempdir().unwrap();
        // Same generation forces a full copy
        let (leader, host, client) = client_at(dir.path(), CommitPoint::new(1, 2)).await;
        let gate = host.hold_reload();
        let scheduler =
            Arc::new(PollScheduler::new(client.clone(), Duration::from_millis(20)).unwrap());

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while host.reload_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("scheduled cycle never installed");
        assert!(client.is_reloading());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(leader.requested_files(), vec!["segments_2"]);
        assert_eq!(host.reload_count(), 1);

        scheduler.stop();
        runner.await.unwrap();
        gate.notify_one();
        host.wait_for_reload().await;
    }

    #[tokio::test]
    async fn test_scheduler_polls_leader() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, client) = client(dir.path()).await;
        let scheduler = Arc::new(PollScheduler::new(client.clone(), Duration::from_millis(50)).unwrap());

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.status().await.local != Some(CommitPoint::new(2, 2)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("scheduled cycle never installed");
        assert_eq!(leader.requested_files(), vec!["segments_2"]);
        assert!(scheduler.control().next_poll().is_some());

        scheduler.stop();
        tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disabled_scheduler_skips_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let (leader, client) = client(dir.path()).await;
        let scheduler = Arc::new(PollScheduler::new(client.clone(), Duration::from_millis(20)).unwrap());
        scheduler.control().disable();

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(leader.requests().is_empty());
        assert!(client.status().await.last_cycle.is_none());

        scheduler.stop();
        runner.await.unwrap();
    }
}
