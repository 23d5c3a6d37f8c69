//! Audio session lifecycle
//!
//! Microphone permission, the audio context used by the detector, the screen
//! wake lock and visibility transitions. Platform facilities are reached
//! through [`AudioPlatform`] so the lifecycle can be exercised without
//! hardware.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use crate::{Error, Result};

/// Microphone permission as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
    Unknown,
}

impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Prompt => "prompt",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Run state of the audio context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioContextState {
    Running,
    Suspended,
    Closed,
}

/// Handle to a created audio context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioContextHandle {
    pub id: u64,
    pub sample_rate: u32,
}

/// Kind of host the daemon runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    /// Platform of the running process
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

/// Platform audio facilities
#[async_trait]
pub trait AudioPlatform: Send + Sync {
    /// Whether microphone access is allowed from this context at all
    fn is_secure_context(&self) -> bool;

    /// Whether any microphone input API exists
    fn has_microphone_api(&self) -> bool;

    /// Whether an audio context can be created
    fn has_audio_context(&self) -> bool;

    /// Query permission without prompting; `None` when no query API exists
    async fn query_permission(&self) -> Option<PermissionState>;

    /// Open and immediately close an input stream
    ///
    /// # Errors
    ///
    /// `Error::Permission` if access is refused, other errors if the device fails
    async fn try_microphone(&self) -> Result<()>;

    /// Create an audio context at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the context cannot be created
    async fn create_audio_context(&self, sample_rate: u32) -> Result<AudioContextHandle>;

    /// Resume a suspended context
    ///
    /// # Errors
    ///
    /// Returns error if the context cannot be resumed
    async fn resume_audio_context(&self, handle: AudioContextHandle) -> Result<()>;

    /// Current run state of a context
    fn audio_context_state(&self, handle: AudioContextHandle) -> AudioContextState;

    /// Close a context
    async fn close_audio_context(&self, handle: AudioContextHandle);

    /// Request a screen wake lock; `Ok(false)` when unsupported
    ///
    /// # Errors
    ///
    /// Returns error if the platform refused an otherwise supported lock
    async fn request_wake_lock(&self) -> Result<bool>;

    /// Release the wake lock if held
    async fn release_wake_lock(&self);
}

/// What the caller should do after a visibility change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityAction {
    /// Nothing to do
    None,
    /// Capture should be restarted
    RestartCapture,
}

/// Capability check of the running environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticSnapshot {
    pub secure_context: bool,
    pub microphone_api: bool,
    pub speech_recognition: bool,
    pub audio_context: bool,
    pub audio_context_state: Option<AudioContextState>,
    pub permission: PermissionState,
    pub platform: Platform,
}

impl DiagnosticSnapshot {
    /// Names of missing capabilities the pipeline cannot run without
    #[must_use]
    pub fn critical_missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.secure_context {
            missing.push("secure context");
        }
        if !self.microphone_api {
            missing.push("microphone");
        }
        if !self.audio_context {
            missing.push("audio context");
        }
        missing
    }

    /// Environment error when a critical capability is missing
    #[must_use]
    pub fn environment_error(&self) -> Option<Error> {
        let missing = self.critical_missing();
        (!missing.is_empty())
            .then(|| Error::Environment(format!("missing {}", missing.join(", "))))
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    context: Option<AudioContextHandle>,
    wake_lock: bool,
    /// Bumped whenever the wake lock is revoked
    wake_lock_lease: u64,
    permission: Option<PermissionState>,
}

/// Owns the audio context, permission state and wake lock
pub struct AudioSessionManager {
    platform: Arc<dyn AudioPlatform>,
    inner: Mutex<SessionInner>,
}

impl AudioSessionManager {
    #[must_use]
    pub fn new(platform: Arc<dyn AudioPlatform>) -> Self {
        Self {
            platform,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut SessionInner) -> T) -> T {
        // State is plain data; a poisoned lock still holds a usable value
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Ask for microphone access
    ///
    /// When the platform cannot answer without prompting, a short-lived
    /// test stream is opened and closed to trigger the prompt.
    ///
    /// # Errors
    ///
    /// Returns error if the test stream fails for a reason other than refusal
    pub async fn request_microphone_permission(&self) -> Result<PermissionState> {
        let queried = self.platform.query_permission().await;
        tracing::debug!(?queried, "permission query");

        let state = match queried {
            Some(state @ (PermissionState::Granted | PermissionState::Denied)) => state,
            Some(PermissionState::Prompt | PermissionState::Unknown) | None => {
                match self.platform.try_microphone().await {
                    Ok(()) => PermissionState::Granted,
                    Err(Error::Permission(reason)) => {
                        tracing::info!(reason, "microphone permission denied");
                        PermissionState::Denied
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.with_inner(|inner| inner.permission = Some(state));
        Ok(state)
    }

    /// Last known permission state
    #[must_use]
    pub fn permission(&self) -> PermissionState {
        self.with_inner(|inner| inner.permission.unwrap_or(PermissionState::Unknown))
    }

    /// Create the audio context on first use; resume it if suspended
    ///
    /// # Errors
    ///
    /// Returns error if the context cannot be created or resumed
    pub async fn ensure_audio_context(&self, sample_rate: u32) -> Result<AudioContextHandle> {
        let existing = self.with_inner(|inner| inner.context);

        if let Some(handle) = existing {
            match self.platform.audio_context_state(handle) {
                AudioContextState::Running => return Ok(handle),
                AudioContextState::Suspended => {
                    self.platform.resume_audio_context(handle).await?;
                    tracing::debug!(id = handle.id, "audio context resumed");
                    return Ok(handle);
                }
                AudioContextState::Closed => {
                    self.with_inner(|inner| inner.context = None);
                }
            }
        }

        let handle = self.platform.create_audio_context(sample_rate).await?;
        tracing::debug!(id = handle.id, sample_rate, "audio context created");
        self.with_inner(|inner| inner.context = Some(handle));
        Ok(handle)
    }

    /// React to the front-end becoming hidden or visible
    ///
    /// Hidden never stops anything; visible resumes the context and asks the
    /// caller to restart capture when it should still be listening.
    pub async fn on_visibility_change(&self, visible: bool, should_listen: bool) -> VisibilityAction {
        if !visible {
            tracing::debug!("front-end hidden");
            return VisibilityAction::None;
        }

        let context = self.with_inner(|inner| inner.context);
        if let Some(handle) = context
            && self.platform.audio_context_state(handle) == AudioContextState::Suspended
            && let Err(e) = self.platform.resume_audio_context(handle).await
        {
            tracing::warn!(error = %e, "failed to resume audio context");
        }

        if should_listen {
            VisibilityAction::RestartCapture
        } else {
            VisibilityAction::None
        }
    }

    /// Lease a wake lock request must carry
    ///
    /// Take it when listening starts; a revocation in between makes the
    /// request a no-op.
    #[must_use]
    pub fn wake_lock_lease(&self) -> u64 {
        self.with_inner(|inner| inner.wake_lock_lease)
    }

    /// Best-effort wake lock while listening
    ///
    /// A grant that arrives after the lease was revoked is handed straight
    /// back to the platform.
    pub async fn acquire_wake_lock(&self, lease: u64) {
        if self.with_inner(|inner| inner.wake_lock || inner.wake_lock_lease != lease) {
            return;
        }
        match self.platform.request_wake_lock().await {
            Ok(true) => {
                let current = self.with_inner(|inner| {
                    let current = inner.wake_lock_lease == lease;
                    if current {
                        inner.wake_lock = true;
                    }
                    current
                });
                if current {
                    tracing::debug!("wake lock acquired");
                } else {
                    self.platform.release_wake_lock().await;
                    tracing::debug!(lease, "wake lock granted after revocation, released");
                }
            }
            Ok(false) => tracing::trace!("wake lock unsupported"),
            Err(e) => tracing::debug!(error = %e, "wake lock refused"),
        }
    }

    /// Revoke the wake lock now; the returned future releases it on the platform
    ///
    /// Pending requests holding an older lease are invalidated before this
    /// returns.
    pub fn revoke_wake_lock(&self) -> impl Future<Output = ()> + Send + 'static {
        let held = self.with_inner(|inner| {
            inner.wake_lock_lease += 1;
            std::mem::take(&mut inner.wake_lock)
        });
        let platform = Arc::clone(&self.platform);
        async move {
            if held {
                platform.release_wake_lock().await;
                tracing::debug!("wake lock released");
            }
        }
    }

    /// Release the wake lock if held
    pub async fn release_wake_lock(&self) {
        self.revoke_wake_lock().await;
    }

    /// Whether the wake lock is currently held
    #[must_use]
    pub fn holds_wake_lock(&self) -> bool {
        self.with_inner(|inner| inner.wake_lock)
    }

    /// Release the wake lock and close the context
    pub async fn close(&self) {
        self.release_wake_lock().await;
        let context = self.with_inner(|inner| inner.context.take());
        if let Some(handle) = context {
            self.platform.close_audio_context(handle).await;
            tracing::debug!(id = handle.id, "audio context closed");
        }
    }

    /// Inspect the environment
    #[must_use]
    pub fn diagnostics(&self, speech_recognition: bool) -> DiagnosticSnapshot {
        let (context, permission) = self.with_inner(|inner| {
            (
                inner.context,
                inner.permission.unwrap_or(PermissionState::Unknown),
            )
        });

        DiagnosticSnapshot {
            secure_context: self.platform.is_secure_context(),
            microphone_api: self.platform.has_microphone_api(),
            speech_recognition,
            audio_context: self.platform.has_audio_context(),
            audio_context_state: context.map(|h| self.platform.audio_context_state(h)),
            permission,
            platform: Platform::current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct StubPlatform {
        query: Option<PermissionState>,
        mic_refused: bool,
        wake_lock: bool,
        grant_delay: Duration,
        released: AtomicUsize,
        mic_checks: AtomicUsize,
        context_state: Mutex<AudioContextState>,
        created: AtomicUsize,
        resumed: AtomicUsize,
    }

    impl StubPlatform {
        fn new(query: Option<PermissionState>) -> Self {
            Self {
                query,
                mic_refused: false,
                wake_lock: true,
                grant_delay: Duration::ZERO,
                released: AtomicUsize::new(0),
                mic_checks: AtomicUsize::new(0),
                context_state: Mutex::new(AudioContextState::Running),
                created: AtomicUsize::new(0),
                resumed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AudioPlatform for StubPlatform {
        fn is_secure_context(&self) -> bool {
            true
        }
        fn has_microphone_api(&self) -> bool {
            true
        }
        fn has_audio_context(&self) -> bool {
            true
        }
        async fn query_permission(&self) -> Option<PermissionState> {
            self.query
        }
        async fn try_microphone(&self) -> Result<()> {
            self.mic_checks.fetch_add(1, Ordering::SeqCst);
            if self.mic_refused {
                Err(Error::Permission("blocked".to_string()))
            } else {
                Ok(())
            }
        }
        async fn create_audio_context(&self, sample_rate: u32) -> Result<AudioContextHandle> {
            let id = self.created.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(AudioContextHandle { id, sample_rate })
        }
        async fn resume_audio_context(&self, _: AudioContextHandle) -> Result<()> {
            self.resumed.fetch_add(1, Ordering::SeqCst);
            *self.context_state.lock().unwrap() = AudioContextState::Running;
            Ok(())
        }
        fn audio_context_state(&self, _: AudioContextHandle) -> AudioContextState {
            *self.context_state.lock().unwrap()
        }
        async fn close_audio_context(&self, _: AudioContextHandle) {}
        async fn request_wake_lock(&self) -> Result<bool> {
            if !self.grant_delay.is_zero() {
                tokio::time::sleep(self.grant_delay).await;
            }
            Ok(self.wake_lock)
        }
        async fn release_wake_lock(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn granted_query_skips_test_stream() {
        let platform = Arc::new(StubPlatform::new(Some(PermissionState::Granted)));
        let session = AudioSessionManager::new(platform.clone());
        let state = session.request_microphone_permission().await.unwrap();
        assert_eq!(state, PermissionState::Granted);
        assert_eq!(platform.mic_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prompt_or_missing_query_opens_test_stream() {
        for query in [Some(PermissionState::Prompt), None] {
            let platform = Arc::new(StubPlatform::new(query));
            let session = AudioSessionManager::new(platform.clone());
            let state = session.request_microphone_permission().await.unwrap();
            assert_eq!(state, PermissionState::Granted);
            assert_eq!(platform.mic_checks.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn refused_test_stream_is_denied() {
        let mut stub = StubPlatform::new(None);
        stub.mic_refused = true;
        let session = AudioSessionManager::new(Arc::new(stub));
        let state = session.request_microphone_permission().await.unwrap();
        assert_eq!(state, PermissionState::Denied);
        assert_eq!(session.permission(), PermissionState::Denied);
    }

    #[tokio::test]
    async fn context_is_created_once_and_resumed() {
        let platform = Arc::new(StubPlatform::new(None));
        let session = AudioSessionManager::new(platform.clone());

        let first = session.ensure_audio_context(16_000).await.unwrap();
        let second = session.ensure_audio_context(16_000).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(platform.created.load(Ordering::SeqCst), 1);

        *platform.context_state.lock().unwrap() = AudioContextState::Suspended;
        session.ensure_audio_context(16_000).await.unwrap();
        assert_eq!(platform.resumed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn visibility_transitions() {
        let platform = Arc::new(StubPlatform::new(None));
        let session = AudioSessionManager::new(platform.clone());
        session.ensure_audio_context(16_000).await.unwrap();
        *platform.context_state.lock().unwrap() = AudioContextState::Suspended;

        assert_eq!(session.on_visibility_change(false, true).await, VisibilityAction::None);
        assert_eq!(platform.resumed.load(Ordering::SeqCst), 0);

        assert_eq!(
            session.on_visibility_change(true, true).await,
            VisibilityAction::RestartCapture
        );
        assert_eq!(platform.resumed.load(Ordering::SeqCst), 1);
        assert_eq!(session.on_visibility_change(true, false).await, VisibilityAction::None);
    }

    #[tokio::test]
    async fn missing_wake_lock_is_not_an_error() {
        let mut stub = StubPlatform::new(None);
        stub.wake_lock = false;
        let session = AudioSessionManager::new(Arc::new(stub));
        session.acquire_wake_lock(session.wake_lock_lease()).await;
        assert!(!session.holds_wake_lock());
        session.release_wake_lock().await;
    }

    #[tokio::test]
    async fn wake_lock_is_released_once() {
        let platform = Arc::new(StubPlatform::new(None));
        let session = AudioSessionManager::new(platform.clone());

        session.acquire_wake_lock(session.wake_lock_lease()).await;
        assert!(session.holds_wake_lock());

        session.release_wake_lock().await;
        session.release_wake_lock().await;
        assert!(!session.holds_wake_lock());
        assert_eq!(platform.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_lease_is_not_acquired() {
        let platform = Arc::new(StubPlatform::new(None));
        let session = AudioSessionManager::new(platform.clone());

        let lease = session.wake_lock_lease();
        session.revoke_wake_lock().await;
        session.acquire_wake_lock(lease).await;
        assert!(!session.holds_wake_lock());
        assert_eq!(platform.released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_wake_lock_request_hands_the_grant_back() {
        let mut stub = StubPlatform::new(None);
        stub.grant_delay = Duration::from_millis(50);
        let platform = Arc::new(stub);
        let session = Arc::new(AudioSessionManager::new(platform.clone()));

        let lease = session.wake_lock_lease();
        let pending = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.acquire_wake_lock(lease).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.close().await;
        pending.await.unwrap();

        assert!(!session.holds_wake_lock());
        assert_eq!(platform.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_reports_missing_capabilities() {
        let snapshot = DiagnosticSnapshot {
            secure_context: false,
            microphone_api: true,
            speech_recognition: true,
            audio_context: false,
            audio_context_state: None,
            permission: PermissionState::Unknown,
            platform: Platform::Linux,
        };
        assert_eq!(snapshot.critical_missing(), vec!["secure context", "audio context"]);
        assert!(matches!(snapshot.environment_error(), Some(Error::Environment(_))));
    }
}
