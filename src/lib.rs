//! Call subsystem for the Beacon workspace client: exclusive media device
//! ownership, the call session state machine, local voice activity
//! detection, a procedural ringback tone, and the in-call text side-channel.
//!
//! The embedding shell drives a call through [`session::CallSession`] and
//! renders from the event stream plus the shared-state snapshots.

pub mod config;
pub mod events;
pub mod media;
pub mod session;

pub use config::{load_tuning, CallTuning, ConfigError};
pub use events::{
    ActivityEvent, CallEvent, CallKind, CallStatus, CallSummary, EndReason, EventBus,
    MediaStateEvent, MessageEvent, NoticeEvent, NoticeKind, StatusEvent,
};
pub use media::{
    AcquireKind, AcquisitionError, CaptureBackend, DeviceHandle, MediaQuality,
    MediaResourceManager, SimulatedCaptureBackend, SystemCaptureBackend,
};
pub use session::{
    CallDescriptor, CallSession, CallSharedState, LocalIdentity, Participant,
};
