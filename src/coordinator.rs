//! Chooses the active synthesis backend and serializes playback.

use crate::backends::{ProgressCallback, SynthesisBackend, VoiceError, VoiceMethod};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

pub struct VoiceCoordinator {
    device: Arc<dyn SynthesisBackend>,
    neural: Arc<dyn SynthesisBackend>,
    method: RwLock<VoiceMethod>,
    downloading: AtomicBool,
    // One neural initialization at a time; later callers wait and reuse it
    init_lock: tokio::sync::Mutex<()>,
    // Bumped by stop() and every speak(); a speak that sees a newer value stays silent
    generation: AtomicU64,
}

/// Clears the download flag however `ensure_ready` exits.
struct DownloadGuard<'a>(&'a AtomicBool);

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl VoiceCoordinator {
    pub fn new(device: Arc<dyn SynthesisBackend>, neural: Arc<dyn SynthesisBackend>, method: VoiceMethod) -> Self {
        Self {
            device,
            neural,
            method: RwLock::new(method),
            downloading: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn method(&self) -> VoiceMethod {
        *self.method.read()
    }

    fn backend(&self, method: VoiceMethod) -> Arc<dyn SynthesisBackend> {
        match method {
            VoiceMethod::Device => self.device.clone(),
            VoiceMethod::Neural => self.neural.clone(),
        }
    }

    fn active(&self) -> Arc<dyn SynthesisBackend> {
        self.backend(self.method())
    }

    /// Switches backends. Audio from the previous backend is silenced, and
    /// switching to `Device` starts voice selection in the background.
    ///
    /// The background work runs on the current Tokio runtime. Called outside
    /// one, only the method changes.
    pub fn set_method(&self, method: VoiceMethod) {
        let previous = std::mem::replace(&mut *self.method.write(), method);
        if previous != method {
            info!(from = %previous, to = %method, "voice method switched");
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime; skipping stop and voice selection");
            return;
        };

        if previous != method {
            let old = self.backend(previous);
            runtime.spawn(async move { old.stop().await });
        }

        if method == VoiceMethod::Device {
            let device = self.device.clone();
            runtime.spawn(async move {
                if let Err(e) = device.initialize("", None).await {
                    warn!("device voice selection failed: {}", e);
                }
            });
        }
    }

    /// Makes `voice_id` playable on the active backend. Repeated calls for a
    /// voice that is already ready do nothing, and concurrent calls share a
    /// single download.
    pub async fn ensure_ready(&self, voice_id: &str, on_progress: Option<ProgressCallback>) -> Result<(), VoiceError> {
        match self.method() {
            VoiceMethod::Device => self.device.initialize(voice_id, None).await,
            VoiceMethod::Neural => {
                if self.neural.current_voice().as_deref() == Some(voice_id) {
                    return Ok(());
                }
                let _init = self.init_lock.lock().await;
                if self.neural.current_voice().as_deref() == Some(voice_id) {
                    debug!(voice = voice_id, "voice became ready while waiting");
                    return Ok(());
                }
                self.downloading.store(true, Ordering::SeqCst);
                let _guard = DownloadGuard(&self.downloading);
                self.neural.initialize(voice_id, on_progress).await
            }
        }
    }

    /// Speaks `text`, cutting off whatever was playing. Blank text is ignored.
    ///
    /// A call that is still waiting for its voice when `stop` or a newer
    /// `speak` arrives finishes the download but plays nothing.
    pub async fn speak(&self, text: &str, voice_id: &str) -> Result<(), VoiceError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        self.stop().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let method = self.method();
        if method == VoiceMethod::Neural && self.neural.current_voice().as_deref() != Some(voice_id) {
            self.ensure_ready(voice_id, None).await?;
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!(text, "superseded while the voice was loading");
                return Ok(());
            }
        }

        debug!(method = %method, text, "speaking");
        self.backend(method).speak(text, voice_id).await
    }

    pub async fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.active().stop().await;
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.active().is_ready()
    }

    /// The cached neural voice, if any.
    pub fn current_voice_id(&self) -> Option<String> {
        self.neural.current_voice()
    }
}
