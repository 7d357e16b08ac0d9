use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    /// Rear camera. Preferred.
    Environment,
    /// Front camera. Fallback.
    User,
}

impl FacingMode {
    pub const PREFERENCE: [FacingMode; 2] = [FacingMode::Environment, FacingMode::User];
}

impl fmt::Display for FacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacingMode::Environment => f.write_str("environment"),
            FacingMode::User => f.write_str("user"),
        }
    }
}

/// What a decoder reports about itself when probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderStatus {
    Scanning,
    Paused,
    NotStarted,
}

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("no camera found: {0}")]
    NotFound(String),

    #[error("camera is already in use")]
    InUse,

    #[error("decoder error: {0}")]
    Other(String),
}

impl From<std::io::Error> for DecoderError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => DecoderError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => DecoderError::PermissionDenied,
            std::io::ErrorKind::ResourceBusy => DecoderError::InUse,
            _ => DecoderError::Other(err.to_string()),
        }
    }
}

/// One decoding session bound to a camera.
#[async_trait]
pub trait Decoder: Send {
    async fn start(
        &mut self,
        facing: FacingMode,
        on_decode: DecodeTrampoline,
    ) -> Result<(), DecoderError>;

    fn status(&self) -> Result<DecoderStatus, DecoderError>;

    async fn stop(&mut self) -> Result<(), DecoderError>;
}

/// Source of fresh decoder instances for the supervisor's attachment point.
pub trait Camera: Send + Sync {
    fn attach_point_available(&self) -> bool {
        true
    }

    fn create_decoder(&self) -> Box<dyn Decoder>;
}

pub type DecodeHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Stable callback given to every decoder. Dispatches to whichever handler is
/// currently installed, so decoders never hold a stale handler.
#[derive(Clone, Default)]
pub struct DecodeTrampoline {
    slot: Arc<RwLock<Option<DecodeHandler>>>,
}

impl DecodeTrampoline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, handler: DecodeHandler) {
        let mut slot = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handler);
    }

    pub fn clear(&self) {
        let mut slot = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
    }

    /// Returns false when no handler is installed and the decode was dropped.
    pub fn dispatch(&self, code: &str) -> bool {
        let slot = match self.slot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.as_ref() {
            Some(handler) => {
                handler(code);
                true
            }
            None => false,
        }
    }
}
