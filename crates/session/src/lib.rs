mod accumulator;
mod actor;
mod cache;
mod cancellation;
mod coordinator;
mod error;
mod events;
mod phase;
mod reconciler;
mod state;
mod sync_guard;

#[cfg(test)]
mod testing;

pub use accumulator::{LoadingIndicator, MessageAccumulator, SideChannel};
pub use actor::CoordinatorHandle;
pub use cache::{InMemoryMessageCache, VolatileCache};
pub use cancellation::{CancellationController, SaveOnStop};
pub use coordinator::{CoordinatorDeps, SendInput, StartOutcome, StreamSessionCoordinator};
pub use error::{SessionError, SessionResult};
pub use events::{
    DecodedFrame, ImageStatus, SideChannelUpdate, StreamEvent, TERMINAL_SENTINEL, decode_frame,
};
pub use phase::{PhaseRejection, PhaseTransition, SessionPhase};
pub use reconciler::{IdentityReconciler, ReconcileContext, ReconcileOutcome, SessionIdentity};
pub use state::{ChatStateManager, Notifier};
pub use sync_guard::{SyncGuard, SyncLease};
