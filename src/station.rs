//! Wires the scanner, the dedup gate, the local queue and the sync engine together.

use crate::api::AttendanceApi;
use crate::database::ScanQueue;
use crate::database::models::{ScanRecord, Session, SessionStatus};
use crate::error::ScanError;
use crate::scanner::{
    Camera, DecodeTrampoline, ScanDeduplicator, ScannerNotice, ScannerState, ScannerSupervisor,
    SupervisorConfig,
};
use crate::session::SessionContext;
use crate::sync::{Connectivity, SyncConfig, SyncEngine, SyncOutcome};
use crate::utils::time::Clock;
use crate::utils::validation::validate_new_session;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Feedback for whoever is watching the station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    Scanned {
        local_id: i64,
        code: String,
        pending: i64,
    },
    SaveFailed {
        code: String,
        error: String,
    },
    ScanRejected(String),
    Scanner(ScannerNotice),
}

pub struct StationParts {
    pub queue: ScanQueue,
    pub api: Arc<dyn AttendanceApi>,
    pub camera: Arc<dyn Camera>,
    pub connectivity: Connectivity,
    pub clock: Arc<dyn Clock>,
    pub supervisor: SupervisorConfig,
    pub sync: SyncConfig,
}

/// A decode that passed the dedup gate, stamped with the session current at decode time.
#[derive(Debug)]
struct AcceptedScan {
    session_id: Option<i64>,
    code: String,
    scanned_at: DateTime<Utc>,
}

pub struct ScanStation {
    sessions: SessionContext,
    supervisor: ScannerSupervisor,
    queue: ScanQueue,
    api: Arc<dyn AttendanceApi>,
    sync: Arc<SyncEngine>,
    connectivity: Connectivity,
    events: mpsc::UnboundedSender<StationEvent>,
    shutdown: CancellationToken,
}

impl ScanStation {
    /// Builds the station and starts its background tasks: scan acceptance,
    /// scanner notices and the sync engine.
    pub fn spawn(parts: StationParts) -> (Arc<Self>, mpsc::UnboundedReceiver<StationEvent>) {
        let StationParts {
            queue,
            api,
            camera,
            connectivity,
            clock,
            supervisor: supervisor_config,
            sync: sync_config,
        } = parts;

        let sessions = SessionContext::new();
        let trampoline = DecodeTrampoline::new();
        let (supervisor, mut notices) =
            ScannerSupervisor::new(camera, trampoline.clone(), supervisor_config);
        let sync = Arc::new(SyncEngine::new(
            queue.clone(),
            api.clone(),
            connectivity.clone(),
            sessions.clone(),
            sync_config,
        ));
        let (events, events_rx) = mpsc::unbounded_channel();
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel::<AcceptedScan>();

        // Runs on every decoded frame: O(1) and never awaits.
        // Decodes with no session selected get their own gate so they cannot
        // suppress the first attributed scan of the same code.
        let dedup = Mutex::new(ScanDeduplicator::default());
        let unattributed = Mutex::new(ScanDeduplicator::default());
        let handler_sessions = sessions.clone();
        trampoline.install(Box::new(move |code: &str| {
            let now = clock.now();
            let session_id = handler_sessions.current_id();
            let gate = if session_id.is_some() { &dedup } else { &unattributed };
            let accepted = match gate.lock() {
                Ok(mut gate) => gate.accept(code, now),
                Err(poisoned) => poisoned.into_inner().accept(code, now),
            };
            if !accepted {
                return;
            }
            let _ = accepted_tx.send(AcceptedScan {
                session_id,
                code: code.to_string(),
                scanned_at: now,
            });
        }));

        let station = Arc::new(Self {
            sessions,
            supervisor,
            queue,
            api,
            sync,
            connectivity,
            events,
            shutdown: CancellationToken::new(),
        });

        let acceptor = station.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = acceptor.shutdown.cancelled() => break,
                    scan = accepted_rx.recv() => match scan {
                        Some(scan) => acceptor.accept_scan(scan).await,
                        None => break,
                    },
                }
            }
        });

        let forwarder = station.events.clone();
        let stop_forwarding = station.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_forwarding.cancelled() => break,
                    notice = notices.recv() => match notice {
                        Some(notice) => {
                            let _ = forwarder.send(StationEvent::Scanner(notice));
                        }
                        None => break,
                    },
                }
            }
        });

        tokio::spawn(station.sync.clone().run(station.shutdown.clone()));

        (station, events_rx)
    }

    async fn accept_scan(&self, scan: AcceptedScan) {
        let Some(session_id) = scan.session_id else {
            warn!("Dropping scan of {}: {}", scan.code, ScanError::NoActiveSession);
            let _ = self
                .events
                .send(StationEvent::ScanRejected(ScanError::NoActiveSession.to_string()));
            return;
        };

        match self.queue.enqueue(session_id, &scan.code, scan.scanned_at).await {
            Ok(local_id) => {
                let pending = self.sync.publish_pending_count().await;
                info!(
                    "Scanned {} for session {} (local_id={}, {} pending)",
                    scan.code, session_id, local_id, pending
                );
                let _ = self.events.send(StationEvent::Scanned {
                    local_id,
                    code: scan.code,
                    pending,
                });
                if self.connectivity.is_online() {
                    self.sync.schedule_after_scan();
                }
            }
            Err(e) => {
                error!("Failed to save scan of {}: {}", scan.code, e);
                let _ = self.events.send(StationEvent::SaveFailed {
                    code: scan.code,
                    error: e.to_string(),
                });
            }
        }
    }

    pub fn sessions(&self) -> &SessionContext {
        &self.sessions
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn scanner_state(&self) -> ScannerState {
        self.supervisor.state()
    }

    pub async fn load_sessions(&self) -> Result<Vec<Session>, ScanError> {
        self.api.list_active_sessions().await
    }

    /// Makes `session` current. Switching away from the scanned session stops
    /// the scanner; it is not resumed for the new one.
    pub async fn select_session(&self, session: Session) -> Result<(), ScanError> {
        if !session.is_active() {
            return Err(ScanError::InactiveSession(session.id));
        }
        if self.sessions.current_id() != Some(session.id) && self.supervisor.state().is_active() {
            info!("Session changed while scanning; stopping scanner");
            self.supervisor.stop().await;
        }
        self.sessions.select(session)?;
        self.sync.refresh_attendance().await;
        Ok(())
    }

    /// Selects `preferred` if given, otherwise the first active session.
    ///
    /// When the API is unreachable and a session id was configured, that id is
    /// trusted so scanning can start offline.
    pub async fn auto_select(&self, preferred: Option<i64>) -> Result<Session, ScanError> {
        let sessions = match self.load_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => match preferred {
                Some(id) => {
                    warn!("Could not load sessions ({}); using session {} unverified", e, id);
                    let session = Session {
                        id,
                        name: format!("Session {}", id),
                        date: Utc::now(),
                        location: None,
                        status: SessionStatus::Active,
                    };
                    self.select_session(session.clone()).await?;
                    return Ok(session);
                }
                None => return Err(e),
            },
        };

        let session = match preferred {
            Some(id) => sessions
                .into_iter()
                .find(|session| session.id == id)
                .ok_or(ScanError::InactiveSession(id))?,
            None => sessions
                .into_iter()
                .next()
                .ok_or(ScanError::NoActiveSession)?,
        };
        self.select_session(session.clone()).await?;
        Ok(session)
    }

    /// Creates a session through the API and makes it current.
    pub async fn create_session(
        &self,
        name: &str,
        date: &str,
        location: Option<&str>,
    ) -> Result<Session, ScanError> {
        let new_session = validate_new_session(name, date, location)?;
        let session = self.api.create_session(&new_session).await?;
        info!("Created session {} ({})", session.id, session.name);
        self.select_session(session.clone()).await?;
        Ok(session)
    }

    pub async fn start_scanning(&self) -> Result<(), ScanError> {
        let session = self.sessions.require_active()?;
        self.supervisor.start(session.id).await
    }

    pub async fn stop_scanning(&self) {
        self.supervisor.stop().await;
    }

    /// Releases the camera, remembering whether scanning was on.
    pub async fn unmount(&self) {
        self.supervisor.unmount().await;
    }

    /// Resumes scanning once if an unmount interrupted it.
    pub async fn mount(&self) -> Result<bool, ScanError> {
        let current = self.sessions.require_active().ok().map(|session| session.id);
        self.supervisor.mount(current).await
    }

    pub async fn pending_count(&self) -> Result<i64, ScanError> {
        self.queue.count().await
    }

    pub async fn recent_scans(&self, limit: i64) -> Result<Vec<ScanRecord>, ScanError> {
        let session = self.sessions.require_active()?;
        self.queue.list_recent(session.id, limit).await
    }

    pub async fn sync_now(&self) -> SyncOutcome {
        self.sync.sync_now().await
    }

    /// Deletes records the server already acknowledged.
    pub async fn cleanup_synced(&self) -> Result<u64, ScanError> {
        let removed = self.queue.delete_synced().await?;
        debug!("Removed {} synced scans", removed);
        Ok(removed)
    }

    /// Releases the camera and stops background work. A last sync is attempted
    /// if the device is online.
    pub async fn shutdown(&self) {
        self.supervisor.unmount().await;
        if let SyncOutcome::Failed(e) = self.sync.sync_now().await {
            warn!("Final sync failed; scans stay queued: {}", e);
        }
        self.shutdown.cancel();
    }
}
