//! In-memory camera used by the scanner and station tests.

use crate::scanner::decoder::{
    Camera, DecodeTrampoline, Decoder, DecoderError, DecoderStatus, FacingMode,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CameraState {
    fail_environment: AtomicBool,
    fail_user: AtomicBool,
    start_broken: AtomicBool,
    no_attach_point: AtomicBool,
    next_id: AtomicUsize,
    current: AtomicUsize,
    starts: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    status_calls: AtomicUsize,
    attempts: Mutex<Vec<FacingMode>>,
    broken: Mutex<HashSet<usize>>,
    trampoline: Mutex<Option<DecodeTrampoline>>,
}

#[derive(Clone, Default)]
pub struct FakeCamera {
    state: Arc<CameraState>,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_facing(&self, facing: FacingMode, fail: bool) {
        match facing {
            FacingMode::Environment => self.state.fail_environment.store(fail, Ordering::SeqCst),
            FacingMode::User => self.state.fail_user.store(fail, Ordering::SeqCst),
        }
    }

    /// Makes the currently attached decoder stop reporting "scanning".
    pub fn break_current(&self) {
        let current = self.state.current.load(Ordering::SeqCst);
        self.state.broken.lock().unwrap().insert(current);
    }

    /// Makes every decoder started from now on unhealthy.
    pub fn start_broken(&self, broken: bool) {
        self.state.start_broken.store(broken, Ordering::SeqCst);
    }

    pub fn set_attach_point(&self, available: bool) {
        self.state.no_attach_point.store(!available, Ordering::SeqCst);
    }

    /// Simulates a frame yielding `code`. False when nothing is attached.
    pub fn decode(&self, code: &str) -> bool {
        if self.active() == 0 {
            return false;
        }
        let trampoline = self.state.trampoline.lock().unwrap().clone();
        trampoline.map(|t| t.dispatch(code)).unwrap_or(false)
    }

    pub fn attempts(&self) -> Vec<FacingMode> {
        self.state.attempts.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.state.status_calls.load(Ordering::SeqCst)
    }
}

impl Camera for FakeCamera {
    fn attach_point_available(&self) -> bool {
        !self.state.no_attach_point.load(Ordering::SeqCst)
    }

    fn create_decoder(&self) -> Box<dyn Decoder> {
        Box::new(FakeDecoder {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            state: self.state.clone(),
            started: false,
        })
    }
}

struct FakeDecoder {
    id: usize,
    state: Arc<CameraState>,
    started: bool,
}

#[async_trait]
impl Decoder for FakeDecoder {
    async fn start(
        &mut self,
        facing: FacingMode,
        on_decode: DecodeTrampoline,
    ) -> Result<(), DecoderError> {
        self.state.attempts.lock().unwrap().push(facing);
        let fail = match facing {
            FacingMode::Environment => self.state.fail_environment.load(Ordering::SeqCst),
            FacingMode::User => self.state.fail_user.load(Ordering::SeqCst),
        };
        if fail {
            return Err(DecoderError::NotFound(format!("no {} camera", facing)));
        }

        self.started = true;
        self.state.current.store(self.id, Ordering::SeqCst);
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);
        if self.state.start_broken.load(Ordering::SeqCst) {
            self.state.broken.lock().unwrap().insert(self.id);
        }
        *self.state.trampoline.lock().unwrap() = Some(on_decode);
        Ok(())
    }

    fn status(&self) -> Result<DecoderStatus, DecoderError> {
        self.state.status_calls.fetch_add(1, Ordering::SeqCst);
        if !self.started {
            return Ok(DecoderStatus::NotStarted);
        }
        if self.state.broken.lock().unwrap().contains(&self.id) {
            return Err(DecoderError::Other("video track ended".to_string()));
        }
        Ok(DecoderStatus::Scanning)
    }

    async fn stop(&mut self) -> Result<(), DecoderError> {
        if self.started {
            self.started = false;
            self.state.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
