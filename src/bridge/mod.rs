//! Background notification bridge
//!
//! A worker task that outlives any single front-end. It keeps the critical
//! assets cached, relays wake events to every connected front-end, raises
//! system notifications and answers heartbeats. Front-ends talk to it only
//! through [`BridgeClient`] message passing.

pub mod cache;
pub mod protocol;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub use cache::{
    AssetCache, AssetOrigin, CACHE_VERSION, CRITICAL_ASSETS, KEYWORD_MODEL_ASSET, cache_name,
};
pub use protocol::{ClientMessage, WorkerMessage};
pub use server::BridgeServer;

use crate::{Error, Result};

/// Notification title shown when the wake word is heard
pub const WAKE_NOTIFICATION_TITLE: &str = "Benji activé";

/// Notification body shown when the wake word is heard
pub const WAKE_NOTIFICATION_BODY: &str = "Je t'écoute...";

/// A system notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub tag: String,
}

/// System notification surface
pub trait Notifier: Send + Sync {
    /// Show a notification
    ///
    /// # Errors
    ///
    /// Returns error if the platform refused it
    fn show(&self, notification: &Notification) -> Result<()>;

    /// Open a new front-end at `path`
    ///
    /// # Errors
    ///
    /// Returns error if no front-end can be launched
    fn open_window(&self, path: &str) -> Result<()>;
}

/// Notifier writing to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            title = %notification.title,
            body = %notification.body,
            tag = %notification.tag,
            "notification"
        );
        Ok(())
    }

    fn open_window(&self, path: &str) -> Result<()> {
        tracing::info!(path, "open window requested");
        Ok(())
    }
}

/// Bridge worker settings
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Directory holding the named caches
    pub cache_root: PathBuf,
    /// Where uncached assets are fetched from
    pub origin: AssetOrigin,
    /// Version tag of this worker
    pub version: String,
    /// Whether notifications may be shown
    pub notifications: bool,
    /// Activate right after install instead of waiting for `SKIP_WAITING`
    pub skip_waiting: bool,
}

impl BridgeOptions {
    /// Options from the loaded configuration
    ///
    /// # Errors
    ///
    /// Returns error if the asset base URL is malformed
    pub fn from_config(config: &crate::Config) -> Result<Self> {
        Ok(Self {
            cache_root: config.bridge.cache_dir.clone(),
            origin: AssetOrigin::from_config(
                config.bridge.asset_base_url.as_deref(),
                config.data_dir.join("assets"),
            )?,
            version: CACHE_VERSION.to_string(),
            notifications: config.bridge.notifications,
            skip_waiting: true,
        })
    }
}

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Installing,
    Waiting,
    Active,
}

/// Snapshot of the worker
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BridgeStatus {
    pub lifecycle: Lifecycle,
    pub version: String,
    pub clients: usize,
}

enum BridgeCommand {
    Register {
        id: Uuid,
        outbound: mpsc::UnboundedSender<WorkerMessage>,
    },
    Unregister {
        id: Uuid,
    },
    FromClient {
        id: Uuid,
        message: ClientMessage,
    },
    NotificationClicked {
        tag: String,
    },
    Lookup {
        asset: String,
        reply: oneshot::Sender<Result<Option<Vec<u8>>>>,
    },
    Status {
        reply: oneshot::Sender<BridgeStatus>,
    },
}

/// Handle to the bridge worker
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<BridgeCommand>,
}

impl BridgeHandle {
    /// Connect a new front-end
    #[must_use]
    pub fn connect(&self) -> BridgeClient {
        let id = Uuid::new_v4();
        let (outbound, inbound) = mpsc::unbounded_channel();
        let _ = self.tx.send(BridgeCommand::Register { id, outbound });
        BridgeClient {
            sender: BridgeSender {
                id,
                tx: self.tx.clone(),
            },
            inbound,
        }
    }

    /// Report a click on a notification
    pub fn notification_clicked(&self, tag: &str) {
        let _ = self.tx.send(BridgeCommand::NotificationClicked {
            tag: tag.to_string(),
        });
    }

    /// Cache-first asset lookup
    ///
    /// # Errors
    ///
    /// Returns error if the worker is gone or the path is invalid
    pub async fn lookup(&self, asset: &str) -> Result<Option<Vec<u8>>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BridgeCommand::Lookup {
                asset: asset.to_string(),
                reply,
            })
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }

    /// Current worker status
    ///
    /// # Errors
    ///
    /// Returns error if the worker is gone
    pub async fn status(&self) -> Result<BridgeStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BridgeCommand::Status { reply })
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())
    }
}

fn worker_gone() -> Error {
    Error::Bridge("bridge worker stopped".to_string())
}

/// One front-end's connection to the bridge
pub struct BridgeClient {
    sender: BridgeSender,
    inbound: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl BridgeClient {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.sender.id
    }

    /// Post a message to the worker
    ///
    /// # Errors
    ///
    /// Returns error if the worker is gone
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.sender.send(message)
    }

    /// Next message from the worker; `None` once the worker is gone
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.inbound.recv().await
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<WorkerMessage> {
        self.inbound.try_recv().ok()
    }

    /// Split into independently owned send and receive halves
    #[must_use]
    pub fn into_split(self) -> (BridgeSender, mpsc::UnboundedReceiver<WorkerMessage>) {
        (self.sender, self.inbound)
    }
}

/// Send half of a [`BridgeClient`]; dropping it disconnects the client
pub struct BridgeSender {
    id: Uuid,
    tx: mpsc::UnboundedSender<BridgeCommand>,
}

impl BridgeSender {
    /// Post a message to the worker
    ///
    /// # Errors
    ///
    /// Returns error if the worker is gone
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.tx
            .send(BridgeCommand::FromClient {
                id: self.id,
                message,
            })
            .map_err(|_| worker_gone())
    }
}

impl Drop for BridgeSender {
    fn drop(&mut self) {
        let _ = self.tx.send(BridgeCommand::Unregister { id: self.id });
    }
}

struct Worker {
    options: BridgeOptions,
    notifier: Arc<dyn Notifier>,
    cache: Option<AssetCache>,
    lifecycle: Lifecycle,
    // Connection order; the oldest client is focused on notification click
    clients: Vec<(Uuid, mpsc::UnboundedSender<WorkerMessage>)>,
}

/// Spawn the bridge worker
#[must_use]
pub fn spawn(options: BridgeOptions, notifier: Arc<dyn Notifier>) -> BridgeHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Worker {
        options,
        notifier,
        cache: None,
        lifecycle: Lifecycle::Installing,
        clients: Vec::new(),
    };
    tokio::spawn(worker.run(rx));
    BridgeHandle { tx }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BridgeCommand>) {
        self.install().await;
        if self.options.skip_waiting {
            self.activate().await;
        } else {
            self.lifecycle = Lifecycle::Waiting;
            tracing::info!(version = %self.options.version, "bridge installed, waiting");
        }

        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        tracing::debug!("bridge worker stopped");
    }

    async fn install(&mut self) {
        let name = cache_name(&self.options.version);
        match AssetCache::open(&self.options.cache_root, &name).await {
            Ok(cache) => {
                cache::install(&cache, &self.options.origin, &CRITICAL_ASSETS).await;
                self.cache = Some(cache);
            }
            Err(e) => tracing::warn!(cache = %name, error = %e, "cannot open asset cache"),
        }
    }

    async fn activate(&mut self) {
        let keep = cache_name(&self.options.version);
        match cache::purge_stale(&self.options.cache_root, &keep).await {
            Ok(deleted) if !deleted.is_empty() => {
                tracing::info!(deleted = deleted.len(), "stale caches purged");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to purge caches"),
        }

        self.lifecycle = Lifecycle::Active;
        tracing::info!(version = %self.options.version, "bridge active");
        self.broadcast(&WorkerMessage::SwUpdated {
            version: self.options.version.clone(),
            changes: "nouvelle version active".to_string(),
        });
    }

    async fn handle(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::Register { id, outbound } => {
                self.clients.push((id, outbound));
                tracing::debug!(client = %id, clients = self.clients.len(), "client connected");
            }
            BridgeCommand::Unregister { id } => {
                self.clients.retain(|(client, _)| *client != id);
                tracing::debug!(client = %id, clients = self.clients.len(), "client disconnected");
            }
            BridgeCommand::FromClient { id, message } => self.on_message(id, message).await,
            BridgeCommand::NotificationClicked { tag } => self.on_notification_click(&tag),
            BridgeCommand::Lookup { asset, reply } => {
                let result = match &self.cache {
                    Some(cache) => cache::lookup(cache, &self.options.origin, &asset).await,
                    None => self.options.origin.fetch(&asset).await,
                };
                let _ = reply.send(result);
            }
            BridgeCommand::Status { reply } => {
                let _ = reply.send(BridgeStatus {
                    lifecycle: self.lifecycle,
                    version: self.options.version.clone(),
                    clients: self.clients.len(),
                });
            }
        }
    }

    async fn on_message(&mut self, from: Uuid, message: ClientMessage) {
        tracing::debug!(client = %from, ?message, "bridge message");
        match message {
            ClientMessage::WakewordDetected => {
                self.notify(WAKE_NOTIFICATION_TITLE, WAKE_NOTIFICATION_BODY, "wakeword");
                // The originator already knows
                self.broadcast_except(
                    from,
                    &WorkerMessage::WakewordDetected {
                        timestamp: now_millis(),
                    },
                );
            }
            ClientMessage::FallbackModeActivated { reason } => {
                tracing::info!(reason = reason.as_deref().unwrap_or("unknown"), "fallback mode");
                self.broadcast(&WorkerMessage::FallbackModeActive {
                    timestamp: now_millis(),
                    reason: reason.unwrap_or_else(|| "unknown".to_string()),
                });
            }
            ClientMessage::KeepAlive => self.send_to(from, WorkerMessage::Pong),
            ClientMessage::SkipWaiting => {
                if self.lifecycle == Lifecycle::Waiting {
                    self.activate().await;
                }
            }
            ClientMessage::Push { title, body } => {
                let title = title.unwrap_or_else(|| "Mon Agenda".to_string());
                let body = body.unwrap_or_else(|| "Nouveau message".to_string());
                self.notify(&title, &body, "push");
            }
        }
    }

    fn notify(&self, title: &str, body: &str, tag: &str) {
        if !self.options.notifications {
            tracing::debug!(tag, "notifications disabled");
            return;
        }
        let notification = Notification {
            title: title.to_string(),
            body: body.to_string(),
            tag: tag.to_string(),
        };
        if let Err(e) = self.notifier.show(&notification) {
            tracing::warn!(error = %e, "notification failed");
        }
    }

    fn on_notification_click(&mut self, tag: &str) {
        tracing::debug!(tag, "notification clicked");
        // Closed clients are dropped as we go
        while let Some((id, tx)) = self.clients.first() {
            if tx.send(WorkerMessage::Focus).is_ok() {
                tracing::debug!(client = %id, "focused client");
                return;
            }
            self.clients.remove(0);
        }
        if let Err(e) = self.notifier.open_window("/") {
            tracing::warn!(error = %e, "cannot open window");
        }
    }

    fn send_to(&mut self, id: Uuid, message: WorkerMessage) {
        if let Some((_, tx)) = self.clients.iter().find(|(client, _)| *client == id)
            && tx.send(message).is_err()
        {
            self.clients.retain(|(client, _)| *client != id);
        }
    }

    fn broadcast(&mut self, message: &WorkerMessage) {
        self.clients
            .retain(|(_, tx)| tx.send(message.clone()).is_ok());
    }

    fn broadcast_except(&mut self, skip: Uuid, message: &WorkerMessage) {
        self.clients
            .retain(|(id, tx)| *id == skip || tx.send(message.clone()).is_ok());
    }
}
