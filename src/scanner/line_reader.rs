//! Decoder for hardware scanners that emit one decoded code per line, either
//! through a device file or on stdin.
//!
//! Each device is read by one long-lived thread owned by the camera. Decoders
//! only attach to and detach from that reader, so a blocked read never outlives
//! a decoder and a re-attached decoder sees every line written after it starts.

use crate::scanner::decoder::{
    Camera, DecodeTrampoline, Decoder, DecoderError, DecoderStatus, FacingMode,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const STDIN_DEVICE: &str = "-";

/// Shared reader of one device. Lines go to whichever decoder is attached.
struct DeviceReader {
    device: String,
    sink: Mutex<Option<(u64, DecodeTrampoline)>>,
    alive: AtomicBool,
}

impl DeviceReader {
    fn sink(&self) -> MutexGuard<'_, Option<(u64, DecodeTrampoline)>> {
        match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn attach(&self, attachment: u64, on_decode: DecodeTrampoline) {
        *self.sink() = Some((attachment, on_decode));
    }

    /// Detaches `attachment` unless another decoder has replaced it already.
    fn detach(&self, attachment: u64) {
        let mut sink = self.sink();
        if matches!(sink.as_ref(), Some((current, _)) if *current == attachment) {
            *sink = None;
        }
    }

    fn forward(&self, code: &str) {
        match self.sink().as_ref() {
            Some((_, on_decode)) => {
                on_decode.dispatch(code);
            }
            None => tracing::debug!("No decoder attached to {}; dropping {}", self.device, code),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct LineCamera {
    environment_device: String,
    user_device: Option<String>,
    readers: Arc<Mutex<HashMap<String, Arc<DeviceReader>>>>,
    next_attachment: Arc<AtomicU64>,
}

impl LineCamera {
    pub fn new(environment_device: impl Into<String>, user_device: Option<String>) -> Self {
        Self {
            environment_device: environment_device.into(),
            user_device,
            readers: Arc::new(Mutex::new(HashMap::new())),
            next_attachment: Arc::new(AtomicU64::new(1)),
        }
    }

    fn device_for(&self, facing: FacingMode) -> Option<&str> {
        match facing {
            FacingMode::Environment => Some(self.environment_device.as_str()),
            FacingMode::User => self.user_device.as_deref(),
        }
    }

    /// Returns the running reader for `device`, starting one if there is none
    /// or the previous one hit end of input.
    async fn reader_for(&self, device: &str) -> Result<Arc<DeviceReader>, DecoderError> {
        if device != STDIN_DEVICE {
            tokio::fs::metadata(device).await?;
        }

        let mut readers = match self.readers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(reader) = readers.get(device) {
            if reader.is_alive() {
                return Ok(reader.clone());
            }
        }

        let reader = Arc::new(DeviceReader {
            device: device.to_string(),
            sink: Mutex::new(None),
            alive: AtomicBool::new(true),
        });
        let thread_reader = reader.clone();
        std::thread::Builder::new()
            .name(format!("scanner-reader {}", device))
            .spawn(move || read_device(thread_reader))?;
        tracing::info!("Reading codes from {}", device);

        readers.insert(device.to_string(), reader.clone());
        Ok(reader)
    }
}

impl Camera for LineCamera {
    fn create_decoder(&self) -> Box<dyn Decoder> {
        Box::new(LineDecoder {
            camera: self.clone(),
            attached: None,
        })
    }
}

/// Blocking read loop. Runs on a plain thread so a read parked on an idle
/// device never holds up runtime shutdown.
fn read_device(reader: Arc<DeviceReader>) {
    let source: Box<dyn Read> = if reader.device == STDIN_DEVICE {
        Box::new(std::io::stdin())
    } else {
        match File::open(&reader.device) {
            Ok(file) => Box::new(file),
            Err(e) => {
                tracing::warn!("Failed to open scanner device {}: {}", reader.device, e);
                reader.alive.store(false, Ordering::SeqCst);
                return;
            }
        }
    };

    for line in BufReader::new(source).lines() {
        match line {
            Ok(line) => {
                let code = line.trim();
                if !code.is_empty() {
                    reader.forward(code);
                }
            }
            Err(e) => {
                tracing::warn!("Scanner device {} read failed: {}", reader.device, e);
                break;
            }
        }
    }
    tracing::warn!("Scanner device {} closed", reader.device);
    reader.alive.store(false, Ordering::SeqCst);
}

struct Attachment {
    reader: Arc<DeviceReader>,
    id: u64,
}

struct LineDecoder {
    camera: LineCamera,
    attached: Option<Attachment>,
}

#[async_trait]
impl Decoder for LineDecoder {
    async fn start(
        &mut self,
        facing: FacingMode,
        on_decode: DecodeTrampoline,
    ) -> Result<(), DecoderError> {
        let device = self
            .camera
            .device_for(facing)
            .ok_or_else(|| DecoderError::NotFound(format!("no {} device configured", facing)))?
            .to_string();

        let reader = self.camera.reader_for(&device).await?;
        let id = self.camera.next_attachment.fetch_add(1, Ordering::SeqCst);
        reader.attach(id, on_decode);
        tracing::debug!("Decoder {} attached to {} ({})", id, device, facing);

        self.attached = Some(Attachment { reader, id });
        Ok(())
    }

    fn status(&self) -> Result<DecoderStatus, DecoderError> {
        match &self.attached {
            None => Ok(DecoderStatus::NotStarted),
            Some(attachment) if attachment.reader.is_alive() => Ok(DecoderStatus::Scanning),
            Some(_) => Ok(DecoderStatus::Paused),
        }
    }

    async fn stop(&mut self) -> Result<(), DecoderError> {
        if let Some(attachment) = self.attached.take() {
            attachment.reader.detach(attachment.id);
        }
        Ok(())
    }
}
