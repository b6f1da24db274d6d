//! Call session orchestration: the public [`CallSession`] facade, the shared
//! state snapshots, and the worker task behind them.

pub mod activity;
mod controller;
pub mod ringback;
pub mod sidechannel;

use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{load_tuning, CallTuning};
use crate::events::{
    ActivityEvent, CallEvent, CallKind, EventBus, MediaStateEvent, MessageEvent, StatusEvent,
};
use crate::media::{CaptureBackend, MediaQuality, MediaResourceManager, SystemCaptureBackend};

use activity::{RandomRemoteActivity, RemoteActivitySource};
use controller::{CallCommand, CallWorker};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: String,
    pub name: String,
}

/// Everything needed to place a call, handed over by the collaborator that
/// initiated it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallDescriptor {
    pub kind: CallKind,
    pub participants: Vec<Participant>,
    /// Capture profile; `Reduced` is the low-bandwidth mode.
    #[serde(default)]
    pub quality: MediaQuality,
    pub created_at_ms: u64,
}

impl CallDescriptor {
    pub fn new(kind: CallKind, participants: Vec<Participant>) -> Self {
        Self {
            kind,
            participants,
            quality: MediaQuality::default(),
            created_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    pub fn with_quality(mut self, quality: MediaQuality) -> Self {
        self.quality = quality;
        self
    }
}

#[derive(Default)]
struct SharedInner {
    status: RwLock<StatusEvent>,
    media: RwLock<MediaStateEvent>,
    activity: RwLock<ActivityEvent>,
    messages: RwLock<Vec<MessageEvent>>,
    ringback: RwLock<bool>,
}

/// Cheap-to-clone snapshots of the live call. The worker writes, everyone
/// else reads; late subscribers catch up from here instead of replaying the
/// event stream.
#[derive(Clone, Default)]
pub struct CallSharedState {
    inner: Arc<SharedInner>,
}

impl CallSharedState {
    pub fn status(&self) -> StatusEvent {
        self.inner
            .status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn media(&self) -> MediaStateEvent {
        *self
            .inner
            .media
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn activity(&self) -> ActivityEvent {
        self.inner
            .activity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn messages(&self) -> Vec<MessageEvent> {
        self.inner
            .messages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether the ringback tone should currently be sounding. Tracks the
    /// activation rule (dialing, not minimized), independent of whether an
    /// output device exists.
    pub fn ringback_running(&self) -> bool {
        *self
            .inner
            .ringback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: StatusEvent) {
        *self
            .inner
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    fn set_media(&self, media: MediaStateEvent) {
        *self
            .inner
            .media
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = media;
    }

    fn set_activity(&self, activity: ActivityEvent) {
        *self
            .inner
            .activity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = activity;
    }

    fn set_ringback(&self, running: bool) {
        *self
            .inner
            .ringback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = running;
    }

    fn push_message(&self, message: MessageEvent) {
        self.inner
            .messages
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }
}

/// Handle to one running call. Dropping the session (and every clone of its
/// command sender) tears the call down; explicit hang-up is preferred.
pub struct CallSession {
    cmd_tx: mpsc::UnboundedSender<CallCommand>,
    bus: EventBus,
    shared: CallSharedState,
    worker: JoinHandle<()>,
}

impl CallSession {
    /// Spawns the session worker. The backend and remote-activity source are
    /// injectable so tests can script device outcomes and speaker cadence.
    pub fn start(
        descriptor: CallDescriptor,
        local: LocalIdentity,
        tuning: CallTuning,
        backend: Arc<dyn CaptureBackend>,
        remote_source: Box<dyn RemoteActivitySource>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new();
        let shared = CallSharedState::default();
        let manager = Arc::new(MediaResourceManager::new(backend));

        let worker = CallWorker::new(
            descriptor,
            local,
            tuning,
            manager,
            remote_source,
            bus.clone(),
            shared.clone(),
            cmd_tx.downgrade(),
        );
        let worker = tokio::spawn(worker.run(cmd_rx));

        Self {
            cmd_tx,
            bus,
            shared,
            worker,
        }
    }

    /// Production entry point: platform devices, file-resolved tuning, and
    /// the random remote-speaker cadence.
    pub fn start_with_system_devices(descriptor: CallDescriptor, local: LocalIdentity) -> Self {
        let tuning = match load_tuning() {
            Ok(tuning) => tuning,
            Err(err) => {
                log::warn!("falling back to default call tuning: {err}");
                CallTuning::default()
            }
        };
        let remote_source = Box::new(RandomRemoteActivity::new(
            tuning.remote_activity_probability,
        ));
        Self::start(
            descriptor,
            local,
            tuning,
            Arc::new(SystemCaptureBackend::new()),
            remote_source,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.bus.subscribe()
    }

    pub fn shared(&self) -> &CallSharedState {
        &self.shared
    }

    pub fn answer(&self) -> Result<(), String> {
        self.send(CallCommand::Answer)
    }

    pub fn hang_up(&self) -> Result<(), String> {
        self.send(CallCommand::HangUp)
    }

    /// Signals that the far end terminated the call.
    pub fn remote_hang_up(&self) -> Result<(), String> {
        self.send(CallCommand::RemoteEnded)
    }

    pub fn toggle_mic(&self) -> Result<(), String> {
        self.send(CallCommand::ToggleMic)
    }

    pub fn toggle_camera(&self) -> Result<(), String> {
        self.send(CallCommand::ToggleCamera)
    }

    pub fn toggle_screen_share(&self) -> Result<(), String> {
        self.send(CallCommand::ToggleScreenShare)
    }

    pub fn set_minimized(&self, minimized: bool) -> Result<(), String> {
        self.send(CallCommand::SetMinimized(minimized))
    }

    pub fn send_message(&self, text: impl Into<String>) -> Result<(), String> {
        self.send(CallCommand::SendMessage(text.into()))
    }

    /// Injects a message from a remote participant, as a transport or demo
    /// driver would.
    pub fn push_remote_message(
        &self,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), String> {
        self.send(CallCommand::PushRemoteMessage {
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            text: text.into(),
        })
    }

    /// Hangs up and waits for the worker to drain; the summary is guaranteed
    /// to have been emitted when this returns.
    pub async fn shutdown(self) {
        let CallSession {
            cmd_tx, worker, ..
        } = self;
        let _ = cmd_tx.send(CallCommand::HangUp);
        drop(cmd_tx);
        let _ = worker.await;
    }

    fn send(&self, command: CallCommand) -> Result<(), String> {
        self.cmd_tx
            .send(command)
            .map_err(|_| "call session is no longer running".to_string())
    }
}
