use crate::error::ScanError;
use crate::scanner::decoder::{Camera, DecodeTrampoline, Decoder, DecoderStatus, FacingMode};
use crate::scanner::state::{ProbeVerdict, RestartGuard, ScanIntent, ScannerEvent, ScannerState, reduce};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probe_interval: Duration,
    /// Consecutive unconfirmed probes before a restart.
    pub failure_threshold: u32,
    pub settle_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            failure_threshold: 3,
            settle_delay: Duration::from_millis(300),
        }
    }
}

/// Things the supervisor reports that nobody asked for synchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerNotice {
    Recovered(FacingMode),
    Failed(String),
}

struct Inner {
    state: ScannerState,
    /// The attachment point. At most one decoder lives here.
    decoder: Option<Box<dyn Decoder>>,
    facing: Option<FacingMode>,
    session_id: Option<i64>,
    guard: RestartGuard,
    intent: ScanIntent,
    probe: Option<CancellationToken>,
    restarts: u32,
}

/// Owns the camera decoder and keeps exactly one healthy instance attached
/// while scanning is on.
#[derive(Clone)]
pub struct ScannerSupervisor {
    inner: Arc<Mutex<Inner>>,
    camera: Arc<dyn Camera>,
    trampoline: DecodeTrampoline,
    config: SupervisorConfig,
    state_tx: Arc<watch::Sender<ScannerState>>,
    notices: mpsc::UnboundedSender<ScannerNotice>,
}

impl ScannerSupervisor {
    pub fn new(
        camera: Arc<dyn Camera>,
        trampoline: DecodeTrampoline,
        config: SupervisorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ScannerNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ScannerState::Stopped);
        let inner = Inner {
            state: ScannerState::Stopped,
            decoder: None,
            facing: None,
            session_id: None,
            guard: RestartGuard::default(),
            intent: ScanIntent::default(),
            probe: None,
            restarts: 0,
        };

        (
            Self {
                inner: Arc::new(Mutex::new(inner)),
                camera,
                trampoline,
                config,
                state_tx: Arc::new(state_tx),
                notices,
            },
            notice_rx,
        )
    }

    pub fn state(&self) -> ScannerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScannerState> {
        self.state_tx.subscribe()
    }

    pub async fn session_id(&self) -> Option<i64> {
        self.inner.lock().await.session_id
    }

    pub async fn facing(&self) -> Option<FacingMode> {
        self.inner.lock().await.facing
    }

    pub async fn restart_count(&self) -> u32 {
        self.inner.lock().await.restarts
    }

    /// Attaches a decoder for `session_id`, falling back to the user-facing
    /// camera once before giving up.
    pub async fn start(&self, session_id: i64) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().await;

        if inner.state.is_active() {
            if inner.session_id == Some(session_id) {
                debug!("Scanner already active for session {}", session_id);
                return Ok(());
            }
            self.teardown(&mut inner).await;
            self.apply(&mut inner, ScannerEvent::StopRequested);
        }

        if !self.camera.attach_point_available() {
            return Err(ScanError::CameraUnavailable(
                "no attachment point for the decoder".to_string(),
            ));
        }

        self.apply(&mut inner, ScannerEvent::StartRequested);
        inner.session_id = Some(session_id);
        inner.guard.reset();
        inner.intent.clear();

        match self.attach(&mut inner).await {
            Ok(facing) => {
                info!("Scanner running on {} camera for session {}", facing, session_id);
                self.apply(&mut inner, ScannerEvent::Attached);
                self.spawn_probe(&mut inner);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start scanner: {}", e);
                self.apply(&mut inner, ScannerEvent::AttachFailed);
                let _ = self.notices.send(ScannerNotice::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Hard stop. Waits for any in-flight attach or restart, then tears it down.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
        inner.guard.reset();
        inner.intent.clear();
        inner.session_id = None;
        self.apply(&mut inner, ScannerEvent::StopRequested);
    }

    /// Releases the camera and remembers whether scanning was on.
    pub async fn unmount(&self) {
        let mut inner = self.inner.lock().await;
        let was_scanning = inner.state.is_active();
        self.teardown(&mut inner).await;
        inner.guard.reset();

        match (was_scanning, inner.session_id) {
            (true, Some(session_id)) => {
                info!("Unmounted while scanning session {}; resume pending", session_id);
                inner.intent.remember(session_id);
            }
            _ => inner.intent.clear(),
        }
        self.apply(&mut inner, ScannerEvent::Unmounted);
    }

    /// Resumes scanning once if the last unmount interrupted it and the same
    /// session is still current. Returns whether scanning was resumed.
    pub async fn mount(&self, current_session: Option<i64>) -> Result<bool, ScanError> {
        if !self.camera.attach_point_available() {
            debug!("Mounted without an attachment point; resume deferred");
            return Ok(false);
        }

        let resume = self.inner.lock().await.intent.take_resume(current_session);
        match resume {
            Some(session_id) => {
                info!("Resuming scanning for session {}", session_id);
                self.start(session_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn apply(&self, inner: &mut Inner, event: ScannerEvent) {
        match reduce(inner.state, event) {
            Some(next) => {
                if next != inner.state {
                    debug!("Scanner {} -> {} on {:?}", inner.state, next, event);
                }
                inner.state = next;
                self.state_tx.send_replace(next);
            }
            None => warn!("Ignoring {:?} while scanner is {}", event, inner.state),
        }
    }

    /// Cancels the probe and detaches the current decoder, swallowing teardown errors.
    async fn teardown(&self, inner: &mut Inner) {
        if let Some(probe) = inner.probe.take() {
            probe.cancel();
        }
        if let Some(mut decoder) = inner.decoder.take() {
            if let Err(e) = decoder.stop().await {
                warn!("Decoder teardown failed: {}", e);
            }
        }
        inner.facing = None;
    }

    async fn attach(&self, inner: &mut Inner) -> Result<FacingMode, ScanError> {
        self.teardown(inner).await;

        let mut failures = Vec::new();
        for facing in FacingMode::PREFERENCE {
            let mut decoder = self.camera.create_decoder();
            match decoder.start(facing, self.trampoline.clone()).await {
                Ok(()) => {
                    inner.decoder = Some(decoder);
                    inner.facing = Some(facing);
                    return Ok(facing);
                }
                Err(e) => {
                    warn!("Failed to attach {} camera: {}", facing, e);
                    if let Err(e) = decoder.stop().await {
                        warn!("Decoder teardown failed: {}", e);
                    }
                    failures.push(format!("{}: {}", facing, e));
                }
            }
        }

        Err(ScanError::CameraUnavailable(failures.join("; ")))
    }

    fn spawn_probe(&self, inner: &mut Inner) {
        let token = CancellationToken::new();
        inner.probe = Some(token.clone());
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.probe_loop(token).await });
    }

    async fn probe_loop(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately, skip it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.probe_once(&token).await {
                        break;
                    }
                }
            }
        }
        debug!("Health probe stopped");
    }

    /// One health check. Returns false when this probe loop should end.
    async fn probe_once(&self, token: &CancellationToken) -> bool {
        let Ok(mut inner) = self.inner.try_lock() else {
            debug!("Scanner busy; skipping health probe");
            return true;
        };
        if token.is_cancelled() || inner.state != ScannerState::Running {
            return false;
        }
        if inner.guard.in_flight {
            return true;
        }

        let status = match inner.decoder.as_ref() {
            Some(decoder) => decoder.status(),
            None => Ok(DecoderStatus::NotStarted),
        };
        match status {
            Ok(DecoderStatus::Scanning) => {
                inner.guard.record_healthy();
                return true;
            }
            Ok(other) => debug!("Decoder reports {:?}", other),
            Err(e) => debug!("Decoder status query failed: {}", e),
        }

        match inner.guard.record_unhealthy(self.config.failure_threshold) {
            ProbeVerdict::Wait => true,
            ProbeVerdict::Restart => {
                self.restart(&mut inner).await;
                false
            }
            ProbeVerdict::Escalate => {
                let failure = ScanError::DecoderHealthFailure(
                    "decoder stopped scanning again after a restart".to_string(),
                );
                error!("{}", failure);
                self.teardown(&mut inner).await;
                self.apply(&mut inner, ScannerEvent::RestartExhausted);
                let _ = self.notices.send(ScannerNotice::Failed(failure.to_string()));
                false
            }
        }
    }

    async fn restart(&self, inner: &mut Inner) {
        warn!("Decoder is no longer scanning; restarting");
        self.apply(inner, ScannerEvent::HealthLost);
        self.teardown(inner).await;
        tokio::time::sleep(self.config.settle_delay).await;

        let result = self.attach(inner).await;
        inner.guard.finish_restart();
        inner.restarts += 1;

        match result {
            Ok(facing) => {
                info!("Decoder restarted on {} camera", facing);
                self.apply(inner, ScannerEvent::Attached);
                self.spawn_probe(inner);
                let _ = self.notices.send(ScannerNotice::Recovered(facing));
            }
            Err(e) => {
                error!("Decoder restart failed: {}", e);
                self.apply(inner, ScannerEvent::AttachFailed);
                let _ = self.notices.send(ScannerNotice::Failed(e.to_string()));
            }
        }
    }
}
