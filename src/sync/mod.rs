pub mod connectivity;

pub use connectivity::Connectivity;

use crate::api::{AttendanceApi, SyncRecord, SyncResponse};
use crate::database::ScanQueue;
use crate::database::models::{AttendanceEntry, ScanRecord};
use crate::session::SessionContext;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub post_scan_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            post_scan_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    SkippedInFlight,
    SkippedOffline,
    Empty,
    Synced { acknowledged: usize, remaining: usize },
    Failed(String),
}

/// Pushes pending scans to the server and reconciles the attendance list.
pub struct SyncEngine {
    queue: ScanQueue,
    api: Arc<dyn AttendanceApi>,
    connectivity: Connectivity,
    sessions: SessionContext,
    config: SyncConfig,
    in_flight: AtomicBool,
    post_scan_scheduled: AtomicBool,
    pending_tx: watch::Sender<i64>,
    attendance_tx: watch::Sender<Vec<AttendanceEntry>>,
}

/// Holds the in-flight flag for the duration of one batch.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(
        queue: ScanQueue,
        api: Arc<dyn AttendanceApi>,
        connectivity: Connectivity,
        sessions: SessionContext,
        config: SyncConfig,
    ) -> Self {
        let (pending_tx, _) = watch::channel(0);
        let (attendance_tx, _) = watch::channel(Vec::new());
        Self {
            queue,
            api,
            connectivity,
            sessions,
            config,
            in_flight: AtomicBool::new(false),
            post_scan_scheduled: AtomicBool::new(false),
            pending_tx,
            attendance_tx,
        }
    }

    pub fn pending(&self) -> watch::Receiver<i64> {
        self.pending_tx.subscribe()
    }

    pub fn attendance(&self) -> watch::Receiver<Vec<AttendanceEntry>> {
        self.attendance_tx.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Re-reads the pending count and publishes it for the "N pending" indicator.
    pub async fn publish_pending_count(&self) -> i64 {
        match self.queue.count().await {
            Ok(count) => {
                self.pending_tx.send_replace(count);
                count
            }
            Err(e) => {
                warn!("Failed to count pending scans: {}", e);
                *self.pending_tx.borrow()
            }
        }
    }

    /// Runs one sync attempt. Never fails; the outcome says what happened.
    pub async fn sync_now(&self) -> SyncOutcome {
        if !self.connectivity.is_online() {
            debug!("Offline; skipping sync");
            return SyncOutcome::SkippedOffline;
        }
        let Some(_flight) = InFlight::acquire(&self.in_flight) else {
            debug!("Sync already in flight");
            return SyncOutcome::SkippedInFlight;
        };

        let outcome = self.sync_batch().await;
        self.publish_pending_count().await;
        outcome
    }

    async fn sync_batch(&self) -> SyncOutcome {
        let pending = match self.queue.list_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Failed to read pending scans: {}", e);
                return SyncOutcome::Failed(e.to_string());
            }
        };
        if pending.is_empty() {
            return SyncOutcome::Empty;
        }

        let batch: Vec<SyncRecord> = pending
            .iter()
            .map(|record| SyncRecord {
                session_id: record.session_id,
                qr_code: record.code.clone(),
                scanned_at: record.scanned_at,
            })
            .collect();

        info!("Syncing {} pending scans", batch.len());
        let response = match self.api.sync_records(&batch).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Sync failed, will retry on next trigger: {}", e);
                return SyncOutcome::Failed(e.to_string());
            }
        };

        let mut acknowledged = 0;
        for (local_id, server_id) in acknowledged_records(&pending, &response) {
            match self.queue.mark_synced(local_id, server_id).await {
                Ok(true) => acknowledged += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to mark scan {} as synced: {}", local_id, e),
            }
        }
        let remaining = pending.len() - acknowledged;
        if remaining > 0 {
            warn!("{} scans were not acknowledged and stay pending", remaining);
        }
        info!("Synced {} scans", acknowledged);

        self.refresh_attendance().await;
        SyncOutcome::Synced {
            acknowledged,
            remaining,
        }
    }

    /// Reloads the current session's attendance list from the server.
    pub async fn refresh_attendance(&self) {
        let Some(session_id) = self.sessions.current_id() else {
            return;
        };
        match self.api.session_attendance(session_id).await {
            Ok(entries) => {
                debug!("Session {} has {} attendance records", session_id, entries.len());
                self.attendance_tx.send_replace(entries);
            }
            Err(e) => warn!("Failed to refresh attendance for session {}: {}", session_id, e),
        }
    }

    /// Schedules a sync shortly after a scan, coalescing bursts of scans into one.
    pub fn schedule_after_scan(self: &Arc<Self>) {
        if !self.connectivity.is_online() {
            return;
        }
        if self.post_scan_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(engine.config.post_scan_delay).await;
            engine.post_scan_scheduled.store(false, Ordering::SeqCst);
            engine.sync_now().await;
        });
    }

    /// Interval and reconnect triggers. Runs until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately, skip it
        ticker.tick().await;

        let mut online_rx = self.connectivity.subscribe();
        let mut was_online = *online_rx.borrow_and_update();
        self.publish_pending_count().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.connectivity.is_online() {
                        self.sync_now().await;
                    }
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !was_online {
                        info!("Connection restored; syncing pending scans");
                        self.sync_now().await;
                    }
                    was_online = online;
                }
            }
        }
        debug!("Sync engine stopped");
    }
}

/// Local ids (with server ids) of the records the server acknowledged.
fn acknowledged_records(pending: &[ScanRecord], response: &SyncResponse) -> Vec<(i64, Option<i64>)> {
    match &response.results {
        None => pending.iter().map(|record| (record.local_id, None)).collect(),
        Some(results) => results
            .iter()
            .enumerate()
            .filter(|(_, result)| result.acknowledged())
            .filter_map(|(position, result)| {
                let record = pending.get(result.index.unwrap_or(position))?;
                Some((record.local_id, result.attendance_id))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SyncRecordResult;
    use crate::api::fake::{FakeApi, session};
    use crate::database::models::{SessionStatus, SyncState};
    use crate::database::test_support::temp_pool;
    use chrono::Utc;

    struct Harness {
        engine: Arc<SyncEngine>,
        api: Arc<FakeApi>,
        queue: ScanQueue,
        connectivity: Connectivity,
        _dir: tempfile::TempDir,
    }

    async fn harness(online: bool, config: SyncConfig) -> Harness {
        let (pool, dir) = temp_pool().await;
        let queue = ScanQueue::new(pool);
        let api = Arc::new(FakeApi::with_sessions(vec![session(42, SessionStatus::Active)]));
        let connectivity = Connectivity::new(online);
        let sessions = SessionContext::new();
        sessions.select(session(42, SessionStatus::Active)).unwrap();
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            api.clone(),
            connectivity.clone(),
            sessions,
            config,
        ));
        Harness {
            engine,
            api,
            queue,
            connectivity,
            _dir: dir,
        }
    }

    async fn wait_for_pending(queue: &ScanQueue, expected: i64) {
        for _ in 0..200 {
            if queue.count().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pending count never reached {}", expected);
    }

    fn record(local_id: i64) -> ScanRecord {
        ScanRecord {
            local_id,
            session_id: 1,
            code: format!("STU-{:03}", local_id),
            scanned_at: Utc::now(),
            sync_state: SyncState::Pending,
            server_id: None,
            synced_at: None,
        }
    }

    #[test]
    fn acknowledgment_follows_results() {
        let pending = vec![record(10), record(11), record(12)];

        let whole = SyncResponse {
            success: true,
            ..Default::default()
        };
        assert_eq!(
            acknowledged_records(&pending, &whole),
            vec![(10, None), (11, None), (12, None)]
        );

        let partial = SyncResponse {
            success: true,
            success_count: Some(1),
            results: Some(vec![
                SyncRecordResult {
                    success: true,
                    attendance_id: Some(500),
                    ..Default::default()
                },
                SyncRecordResult::default(),
                SyncRecordResult {
                    duplicate: true,
                    ..Default::default()
                },
            ]),
            error: None,
        };
        assert_eq!(
            acknowledged_records(&pending, &partial),
            vec![(10, Some(500)), (12, None)]
        );

        let indexed = SyncResponse {
            success: true,
            results: Some(vec![SyncRecordResult {
                index: Some(2),
                success: true,
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(acknowledged_records(&pending, &indexed), vec![(12, None)]);
    }

    #[tokio::test]
    async fn offline_enqueue_loses_nothing() {
        let h = harness(false, SyncConfig::default()).await;
        for i in 0..10 {
            h.queue
                .enqueue(42, &format!("STU-{:03}", i), Utc::now())
                .await
                .unwrap();
        }
        assert_eq!(h.queue.count().await.unwrap(), 10);
        assert_eq!(h.engine.sync_now().await, SyncOutcome::SkippedOffline);
        assert_eq!(h.queue.count().await.unwrap(), 10);

        h.connectivity.set_online(true);
        assert_eq!(
            h.engine.sync_now().await,
            SyncOutcome::Synced {
                acknowledged: 10,
                remaining: 0
            }
        );
        assert_eq!(h.queue.count().await.unwrap(), 0);
        assert_eq!(*h.engine.pending().borrow(), 0);

        let records = h.queue.list_recent(42, 20).await.unwrap();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.sync_state == SyncState::Synced));
        assert!(records.iter().all(|r| r.server_id.is_some()));
    }

    #[tokio::test]
    async fn concurrent_triggers_submit_once() {
        let h = harness(true, SyncConfig::default()).await;
        h.queue.enqueue(42, "STU-001", Utc::now()).await.unwrap();
        *h.api.sync_delay.lock().unwrap() = Some(Duration::from_millis(100));

        let (first, second) = tokio::join!(h.engine.sync_now(), h.engine.sync_now());

        assert_eq!(h.api.sync_calls.load(Ordering::SeqCst), 1);
        let outcomes = [first, second];
        assert!(outcomes.contains(&SyncOutcome::SkippedInFlight));
        assert!(outcomes.contains(&SyncOutcome::Synced {
            acknowledged: 1,
            remaining: 0
        }));
        assert!(!h.engine.is_syncing());
    }

    #[tokio::test]
    async fn failed_sync_mutates_nothing_and_retry_is_idempotent() {
        let h = harness(true, SyncConfig::default()).await;
        let scanned_at = Utc::now();
        h.queue.enqueue(42, "STU-001", scanned_at).await.unwrap();
        h.queue.enqueue(42, "STU-002", scanned_at).await.unwrap();

        // The server stores the batch but the acknowledgment is lost.
        let batch: Vec<SyncRecord> = h
            .queue
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|r| SyncRecord {
                session_id: r.session_id,
                qr_code: r.code,
                scanned_at: r.scanned_at,
            })
            .collect();
        h.api.sync_records(&batch).await.unwrap();
        h.api.fail_sync.store(true, Ordering::SeqCst);

        assert!(matches!(h.engine.sync_now().await, SyncOutcome::Failed(_)));
        assert_eq!(h.queue.count().await.unwrap(), 2);

        h.api.fail_sync.store(false, Ordering::SeqCst);
        assert_eq!(
            h.engine.sync_now().await,
            SyncOutcome::Synced {
                acknowledged: 2,
                remaining: 0
            }
        );
        assert_eq!(h.api.accepted_count(), 2);
        assert_eq!(h.engine.sync_now().await, SyncOutcome::Empty);
    }

    #[tokio::test]
    async fn rejected_records_stay_pending() {
        let h = harness(true, SyncConfig::default()).await;
        h.queue.enqueue(42, "STU-001", Utc::now()).await.unwrap();
        h.queue.enqueue(42, "BOGUS", Utc::now()).await.unwrap();
        h.api.rejected_codes.lock().unwrap().insert("BOGUS".to_string());

        assert_eq!(
            h.engine.sync_now().await,
            SyncOutcome::Synced {
                acknowledged: 1,
                remaining: 1
            }
        );
        let pending = h.queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].code, "BOGUS");
    }

    #[tokio::test]
    async fn successful_sync_refreshes_attendance() {
        let h = harness(true, SyncConfig::default()).await;
        let mut attendance = h.engine.attendance();
        h.queue.enqueue(42, "STU-001", Utc::now()).await.unwrap();

        h.engine.sync_now().await;

        assert_eq!(h.api.attendance_calls.load(Ordering::SeqCst), 1);
        assert!(attendance.has_changed().unwrap());
        assert_eq!(attendance.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn reconnect_triggers_sync() {
        let h = harness(false, SyncConfig::default()).await;
        h.queue.enqueue(42, "STU-001", Utc::now()).await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.engine.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.queue.count().await.unwrap(), 1);

        h.connectivity.set_online(true);
        wait_for_pending(&h.queue, 0).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn interval_triggers_sync_while_online() {
        let h = harness(
            true,
            SyncConfig {
                interval: Duration::from_millis(50),
                post_scan_delay: Duration::from_secs(3),
            },
        )
        .await;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.engine.clone().run(shutdown.clone()));

        h.queue.enqueue(42, "STU-001", Utc::now()).await.unwrap();
        wait_for_pending(&h.queue, 0).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn post_scan_syncs_are_coalesced() {
        let h = harness(
            true,
            SyncConfig {
                interval: Duration::from_secs(30),
                post_scan_delay: Duration::from_millis(30),
            },
        )
        .await;

        for code in ["STU-001", "STU-002", "STU-003"] {
            h.queue.enqueue(42, code, Utc::now()).await.unwrap();
            h.engine.schedule_after_scan();
        }
        wait_for_pending(&h.queue, 0).await;

        assert_eq!(h.api.sync_calls.load(Ordering::SeqCst), 1);
    }
}
