//! Call session state machine. One worker task owns every piece of mutable
//! call state and serializes commands, device-acquisition results, and timer
//! ticks through a single `select!` loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

use crate::config::CallTuning;
use crate::events::{
    ActivityEvent, CallKind, CallStatus, CallSummary, EndReason, EventBus, MediaStateEvent,
    NoticeEvent, NoticeKind, StatusEvent,
};
use crate::media::{AcquireKind, AcquisitionError, DeviceHandle, MediaResourceManager};

use super::activity::{RemoteActivitySource, VoiceActivityMonitor};
use super::ringback::RingbackSynth;
use super::sidechannel::SideChannel;
use super::{CallDescriptor, CallSharedState, LocalIdentity};

const DURATION_TICK: Duration = Duration::from_secs(1);
// Parked value for the pickup timer before the remote side "answers".
const PICKUP_PARKED: Duration = Duration::from_secs(60 * 60 * 24);

#[derive(Debug)]
pub enum CallCommand {
    Answer,
    HangUp,
    RemoteEnded,
    ToggleMic,
    ToggleCamera,
    ToggleScreenShare,
    SetMinimized(bool),
    SendMessage(String),
    PushRemoteMessage {
        sender_id: String,
        sender_name: String,
        text: String,
    },
    ScreenShareExternallyStopped,
}

enum MediaOp {
    InitialAcquire(Result<DeviceHandle, AcquisitionError>),
    CameraUpgrade(Result<(), AcquisitionError>),
    ScreenAcquire(Result<DeviceHandle, AcquisitionError>),
}

pub(super) struct CallWorker {
    descriptor: CallDescriptor,
    tuning: CallTuning,
    manager: Arc<MediaResourceManager>,
    bus: EventBus,
    shared: CallSharedState,
    monitor: VoiceActivityMonitor,
    remote_source: Box<dyn RemoteActivitySource>,
    ringback: RingbackSynth,
    side_channel: SideChannel,
    // Weak so the worker never keeps its own command channel alive.
    cmd_tx: mpsc::WeakUnboundedSender<CallCommand>,
    op_tx: mpsc::UnboundedSender<MediaOp>,
    op_rx: Option<mpsc::UnboundedReceiver<MediaOp>>,

    status: StatusEvent,
    media_state: MediaStateEvent,
    activity: ActivityEvent,
    call_handle: Option<DeviceHandle>,
    screen_handle: Option<DeviceHandle>,
    connected_at: Option<Instant>,
    call_op_in_flight: bool,
    screen_op_in_flight: bool,
    // An OS-level stop can outrun the acquisition result; remember it.
    screen_stop_pending: bool,
    ended: bool,
}

impl CallWorker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        descriptor: CallDescriptor,
        local: LocalIdentity,
        tuning: CallTuning,
        manager: Arc<MediaResourceManager>,
        remote_source: Box<dyn RemoteActivitySource>,
        bus: EventBus,
        shared: CallSharedState,
        cmd_tx: mpsc::WeakUnboundedSender<CallCommand>,
    ) -> Self {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let monitor = VoiceActivityMonitor::new(&tuning);
        let ringback = RingbackSynth::new(tuning.clone());
        let media_state = MediaStateEvent {
            mic_enabled: true,
            camera_enabled: descriptor.kind == CallKind::Video,
            screen_sharing: false,
        };

        Self {
            descriptor,
            tuning,
            manager,
            bus,
            shared,
            monitor,
            remote_source,
            ringback,
            side_channel: SideChannel::new(local),
            cmd_tx,
            op_tx,
            op_rx: Some(op_rx),
            status: StatusEvent::default(),
            media_state,
            activity: ActivityEvent::default(),
            call_handle: None,
            screen_handle: None,
            connected_at: None,
            call_op_in_flight: false,
            screen_op_in_flight: false,
            screen_stop_pending: false,
            ended: false,
        }
    }

    pub(super) async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<CallCommand>) {
        let Some(mut op_rx) = self.op_rx.take() else {
            return;
        };

        log::info!(
            "call session starting: kind={:?} participants={}",
            self.descriptor.kind,
            self.descriptor.participants.len()
        );
        self.sync_ringback();
        self.emit_status();
        self.emit_media();
        self.spawn_initial_acquire();

        let mut vad_tick = interval(Duration::from_millis(self.tuning.vad_tick_ms.max(1)));
        vad_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut remote_tick =
            interval(Duration::from_millis(self.tuning.remote_activity_tick_ms.max(1)));
        remote_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut duration_tick = interval(DURATION_TICK);
        duration_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pickup = Box::pin(sleep(PICKUP_PARKED));
        let mut pickup_armed = false;

        while !self.ended {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            // Every sender is gone; nobody can hang up anymore.
                            self.finish(EndReason::TornDown, None);
                        }
                    }
                }
                Some(op) = op_rx.recv() => {
                    self.handle_media_op(op, &mut pickup, &mut pickup_armed);
                }
                _ = &mut pickup, if pickup_armed && self.status.status == CallStatus::Dialing => {
                    pickup_armed = false;
                    log::info!("remote side picked up");
                    self.connect();
                }
                _ = vad_tick.tick() => {
                    self.on_vad_tick();
                }
                _ = remote_tick.tick(), if self.status.status == CallStatus::Connected => {
                    self.on_remote_tick();
                }
                _ = duration_tick.tick(), if self.status.status == CallStatus::Connected => {
                    self.on_duration_tick();
                }
            }
        }

        // Late acquisition results would otherwise strand a live device.
        while self.call_op_in_flight || self.screen_op_in_flight {
            match op_rx.recv().await {
                Some(op) => self.discard_media_op(op),
                None => break,
            }
        }
        log::info!("call session worker stopped");
    }

    fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Answer => {
                if self.status.status == CallStatus::Dialing {
                    log::info!("call answered locally");
                    self.connect();
                }
            }
            CallCommand::HangUp => self.finish(EndReason::LocalHangUp, None),
            CallCommand::RemoteEnded => self.finish(EndReason::RemoteHangUp, None),
            CallCommand::ToggleMic
            | CallCommand::ToggleCamera
            | CallCommand::ToggleScreenShare
                if self.status.status == CallStatus::Blocked =>
            {
                log::debug!("media toggle ignored: session is blocked");
            }
            CallCommand::ToggleMic => self.toggle_mic(),
            CallCommand::ToggleCamera => self.toggle_camera(),
            CallCommand::ToggleScreenShare => self.toggle_screen_share(),
            CallCommand::SetMinimized(minimized) => {
                if self.status.minimized != minimized {
                    self.status.minimized = minimized;
                    self.sync_ringback();
                    self.emit_status();
                }
            }
            CallCommand::SendMessage(text) => {
                if let Some(message) = self.side_channel.push_local(&text) {
                    self.shared.push_message(message.clone());
                    self.bus.emit_message(&message);
                }
            }
            CallCommand::PushRemoteMessage {
                sender_id,
                sender_name,
                text,
            } => {
                if let Some(message) = self.side_channel.push_remote(sender_id, sender_name, &text)
                {
                    self.shared.push_message(message.clone());
                    self.bus.emit_message(&message);
                }
            }
            CallCommand::ScreenShareExternallyStopped => {
                if let Some(handle) = self.screen_handle.take() {
                    log::info!("screen share stopped outside the application");
                    self.manager.release(&handle);
                    self.media_state.screen_sharing = false;
                    self.emit_media();
                } else if self.screen_op_in_flight {
                    // The stop beat the acquisition result to the worker.
                    log::info!("screen share stopped externally while acquiring");
                    self.screen_stop_pending = true;
                }
            }
        }
    }

    fn spawn_initial_acquire(&mut self) {
        let kind = match self.descriptor.kind {
            CallKind::Audio => AcquireKind::AudioOnly,
            CallKind::Video => AcquireKind::AudioVideo,
        };
        let quality = self.descriptor.quality;
        let manager = Arc::clone(&self.manager);
        let op_tx = self.op_tx.clone();
        self.call_op_in_flight = true;
        tokio::task::spawn_blocking(move || {
            let result = manager.acquire(kind, quality);
            let _ = op_tx.send(MediaOp::InitialAcquire(result));
        });
    }

    fn handle_media_op(
        &mut self,
        op: MediaOp,
        pickup: &mut std::pin::Pin<Box<tokio::time::Sleep>>,
        pickup_armed: &mut bool,
    ) {
        if self.ended {
            self.discard_media_op(op);
            return;
        }
        match op {
            MediaOp::InitialAcquire(Ok(handle)) => {
                self.call_op_in_flight = false;
                handle.set_audio_enabled(self.media_state.mic_enabled);
                self.monitor.start(handle.clone());
                self.call_handle = Some(handle);
                // The simulated far end only answers once local media is up.
                if self.status.status == CallStatus::Dialing {
                    pickup
                        .as_mut()
                        .reset(Instant::now() + Duration::from_millis(self.tuning.pickup_delay_ms));
                    *pickup_armed = true;
                }
            }
            MediaOp::InitialAcquire(Err(err)) => {
                self.call_op_in_flight = false;
                log::warn!("initial media acquisition failed: {err}");
                self.bus.emit_notice(&notice_for_acquisition(&err));
                self.block(err.to_string());
            }
            MediaOp::CameraUpgrade(Ok(())) => {
                self.call_op_in_flight = false;
            }
            MediaOp::CameraUpgrade(Err(err)) => {
                self.call_op_in_flight = false;
                log::warn!("camera upgrade failed: {err}");
                self.media_state.camera_enabled = false;
                self.emit_media();
                self.bus.emit_notice(&NoticeEvent {
                    kind: NoticeKind::CameraUnavailable,
                    message: format!("camera could not be enabled: {err}"),
                });
            }
            MediaOp::ScreenAcquire(Ok(handle)) => {
                self.screen_op_in_flight = false;
                if self.screen_stop_pending {
                    self.screen_stop_pending = false;
                    log::info!("releasing screen capture stopped during acquisition");
                    self.manager.release(&handle);
                    return;
                }
                self.screen_handle = Some(handle);
                self.media_state.screen_sharing = true;
                self.emit_media();
            }
            MediaOp::ScreenAcquire(Err(err)) => {
                self.screen_op_in_flight = false;
                self.screen_stop_pending = false;
                log::warn!("screen share acquisition failed: {err}");
                self.bus.emit_notice(&NoticeEvent {
                    kind: NoticeKind::ScreenShareUnavailable,
                    message: format!("screen sharing could not start: {err}"),
                });
            }
        }
    }

    /// Post-teardown path: every successful late acquisition is released
    /// immediately so no device outlives the session.
    fn discard_media_op(&mut self, op: MediaOp) {
        match op {
            MediaOp::InitialAcquire(result) => {
                self.call_op_in_flight = false;
                if let Ok(handle) = result {
                    self.manager.release(&handle);
                }
            }
            MediaOp::CameraUpgrade(_) => {
                // The call handle was already released; any track the upgrade
                // managed to push stops when the handle's last clone drops.
                self.call_op_in_flight = false;
            }
            MediaOp::ScreenAcquire(result) => {
                self.screen_op_in_flight = false;
                if let Ok(handle) = result {
                    self.manager.release(&handle);
                }
            }
        }
    }

    fn toggle_mic(&mut self) {
        self.media_state.mic_enabled = !self.media_state.mic_enabled;
        if let Some(handle) = self.call_handle.as_ref() {
            handle.set_audio_enabled(self.media_state.mic_enabled);
        }
        self.emit_media();
    }

    fn toggle_camera(&mut self) {
        // Either direction races an in-flight acquire or upgrade, so both are
        // rejected until the pending operation lands.
        if self.call_op_in_flight {
            log::debug!("camera toggle ignored: call media operation in flight");
            return;
        }

        if self.media_state.camera_enabled {
            if let Some(handle) = self.call_handle.as_ref() {
                self.manager.downgrade_from_video(handle);
            }
            self.media_state.camera_enabled = false;
            self.emit_media();
            return;
        }

        let Some(handle) = self.call_handle.clone() else {
            log::debug!("camera toggle ignored: no live call media");
            return;
        };

        // Optimistic flip; reverted with a notice if the device never opens.
        self.media_state.camera_enabled = true;
        self.emit_media();
        self.call_op_in_flight = true;
        let quality = self.descriptor.quality;
        let manager = Arc::clone(&self.manager);
        let op_tx = self.op_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = manager.upgrade_to_video(&handle, quality);
            let _ = op_tx.send(MediaOp::CameraUpgrade(result));
        });
    }

    fn toggle_screen_share(&mut self) {
        if let Some(handle) = self.screen_handle.take() {
            self.manager.release(&handle);
            self.media_state.screen_sharing = false;
            self.emit_media();
            return;
        }

        if self.screen_op_in_flight {
            log::debug!("screen share toggle ignored: acquisition in flight");
            return;
        }

        self.screen_op_in_flight = true;
        let manager = Arc::clone(&self.manager);
        let op_tx = self.op_tx.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = manager.acquire_screen_share(Box::new(move || {
                if let Some(cmd_tx) = cmd_tx.upgrade() {
                    let _ = cmd_tx.send(CallCommand::ScreenShareExternallyStopped);
                }
            }));
            let _ = op_tx.send(MediaOp::ScreenAcquire(result));
        });
    }

    fn connect(&mut self) {
        self.status.status = CallStatus::Connected;
        self.status.elapsed_seconds = 0;
        self.connected_at = Some(Instant::now());
        self.sync_ringback();
        self.emit_status();
    }

    fn on_vad_tick(&mut self) {
        let speaking = self.monitor.tick();
        if speaking != self.activity.local_speaking {
            self.activity.local_speaking = speaking;
            self.emit_activity();
        }
    }

    fn on_remote_tick(&mut self) {
        let active = self.remote_source.poll_active(&self.descriptor.participants);
        if active != self.activity.active_remote {
            self.activity.active_remote = active;
            self.emit_activity();
        }
    }

    fn on_duration_tick(&mut self) {
        let Some(connected_at) = self.connected_at else {
            return;
        };
        let elapsed = connected_at.elapsed().as_secs();
        if elapsed != self.status.elapsed_seconds {
            self.status.elapsed_seconds = elapsed;
            self.emit_status();
        }
    }

    /// Media has proven unobtainable. Devices are released and the session is
    /// parked in `Blocked`; it stays alive until an explicit end so the
    /// caller still drives the final hang-up.
    fn block(&mut self, detail: String) {
        self.monitor.stop();
        self.call_handle = None;
        self.screen_handle = None;
        self.manager.release_all();

        self.media_state = MediaStateEvent::default();
        self.emit_media();
        self.status.status = CallStatus::Blocked;
        self.status.reason = Some(detail);
        self.sync_ringback();
        self.emit_status();
    }

    /// Single teardown path for every way a call can end. Safe to hit more
    /// than once; only the first caller emits the summary.
    fn finish(&mut self, reason: EndReason, detail: Option<String>) {
        if self.ended {
            return;
        }
        self.ended = true;

        self.monitor.stop();
        self.call_handle = None;
        self.screen_handle = None;
        self.manager.release_all();

        let duration_seconds = self
            .connected_at
            .map(|connected_at| connected_at.elapsed().as_secs())
            .unwrap_or(0);

        if self.media_state != MediaStateEvent::default() {
            self.media_state = MediaStateEvent::default();
            self.emit_media();
        }
        if self.activity != ActivityEvent::default() {
            self.activity = ActivityEvent::default();
            self.emit_activity();
        }

        // A blocked session keeps its status and summary reason no matter
        // what triggered the end.
        let reason = if self.status.status == CallStatus::Blocked {
            EndReason::Blocked
        } else {
            self.status.status = CallStatus::Ended;
            reason
        };
        if detail.is_some() {
            self.status.reason = detail;
        }
        self.sync_ringback();
        self.emit_status();

        let summary = CallSummary {
            duration_seconds,
            kind: self.descriptor.kind,
            reason,
        };
        log::info!(
            "call ended: reason={reason:?} duration={duration_seconds}s kind={:?}",
            summary.kind
        );
        self.bus.emit_summary(&summary);
    }

    /// Ringback is audible exactly while the call is dialing in the
    /// foreground. The decision is mirrored into the shared snapshot so the
    /// rule is observable even when no output device exists.
    fn sync_ringback(&mut self) {
        let should_ring =
            !self.ended && self.status.status == CallStatus::Dialing && !self.status.minimized;
        self.shared.set_ringback(should_ring);
        if should_ring {
            self.ringback.start();
        } else {
            self.ringback.stop();
        }
    }

    fn emit_status(&self) {
        self.shared.set_status(self.status.clone());
        self.bus.emit_status(&self.status);
    }

    fn emit_media(&self) {
        self.shared.set_media(self.media_state);
        self.bus.emit_media(&self.media_state);
    }

    fn emit_activity(&self) {
        self.shared.set_activity(self.activity.clone());
        self.bus.emit_activity(&self.activity);
    }
}

fn notice_for_acquisition(err: &AcquisitionError) -> NoticeEvent {
    let kind = match err {
        AcquisitionError::PermissionDenied => NoticeKind::PermissionDenied,
        _ => NoticeKind::DeviceUnavailable,
    };
    NoticeEvent {
        kind,
        message: format!("call media could not be acquired: {err}"),
    }
}
