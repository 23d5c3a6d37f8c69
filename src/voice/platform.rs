//! Desktop audio platform on top of cpal
//!
//! A desktop process has no permission query API and no screen wake lock;
//! permission is inferred by opening the default input device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};

use super::audio_session::{
    AudioContextHandle, AudioContextState, AudioPlatform, PermissionState,
};
use super::microphone::{FrameSource, SAMPLE_RATE};
use crate::{Error, Result};

/// cpal-backed platform
pub struct CpalPlatform {
    microphone: Arc<dyn FrameSource>,
    contexts: Mutex<HashMap<u64, AudioContextState>>,
    next_id: AtomicU64,
}

impl CpalPlatform {
    #[must_use]
    pub fn new(microphone: Arc<dyn FrameSource>) -> Self {
        Self {
            microphone,
            contexts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn set_state(&self, id: u64, state: AudioContextState) {
        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.insert(id, state);
        }
    }
}

#[async_trait]
impl AudioPlatform for CpalPlatform {
    fn is_secure_context(&self) -> bool {
        true
    }

    fn has_microphone_api(&self) -> bool {
        self.microphone.is_available()
    }

    fn has_audio_context(&self) -> bool {
        cpal::default_host().default_output_device().is_some()
            || cpal::default_host().default_input_device().is_some()
    }

    async fn query_permission(&self) -> Option<PermissionState> {
        None
    }

    async fn try_microphone(&self) -> Result<()> {
        let microphone = Arc::clone(&self.microphone);
        tokio::task::spawn_blocking(move || {
            // Opening succeeds only if the OS lets us read the device
            let subscription = microphone.open(SAMPLE_RATE, 512).map_err(|e| match e {
                Error::Audio(msg) if msg.contains("ermission") => Error::Permission(msg),
                other => other,
            })?;
            drop(subscription);
            Ok(())
        })
        .await
        .map_err(|e| Error::Audio(format!("microphone check task failed: {e}")))?
    }

    async fn create_audio_context(&self, sample_rate: u32) -> Result<AudioContextHandle> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            "audio context bound to input device"
        );

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.set_state(id, AudioContextState::Running);
        Ok(AudioContextHandle { id, sample_rate })
    }

    async fn resume_audio_context(&self, handle: AudioContextHandle) -> Result<()> {
        self.set_state(handle.id, AudioContextState::Running);
        Ok(())
    }

    fn audio_context_state(&self, handle: AudioContextHandle) -> AudioContextState {
        self.contexts
            .lock()
            .ok()
            .and_then(|contexts| contexts.get(&handle.id).copied())
            .unwrap_or(AudioContextState::Closed)
    }

    async fn close_audio_context(&self, handle: AudioContextHandle) {
        self.set_state(handle.id, AudioContextState::Closed);
    }

    async fn request_wake_lock(&self) -> Result<bool> {
        Ok(false)
    }

    async fn release_wake_lock(&self) {}
}
