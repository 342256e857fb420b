use parley_storage::StorageError;
use parley_transport::TransportError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("failed to open chat stream on `{stage}`: {source}"))]
    TransportOpen {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("chat stream failed on `{stage}`: {source}"))]
    TransportStream {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("received a malformed stream frame: {reason}"))]
    MalformedFrame {
        stage: &'static str,
        reason: String,
    },
    #[snafu(display("server reported an error: {message}"))]
    ServerSignal {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("failed to persist chat state on `{stage}`: {source}"))]
    Persist {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("chat session actor is no longer running"))]
    ActorStopped { stage: &'static str },
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::TransportOpen { stage, .. }
            | Self::TransportStream { stage, .. }
            | Self::MalformedFrame { stage, .. }
            | Self::ServerSignal { stage, .. }
            | Self::Persist { stage, .. }
            | Self::ActorStopped { stage } => stage,
        }
    }

    /// Text for the error toast; `None` when there is nothing worth showing.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::ServerSignal { message, .. } => {
                let message = message.trim();
                (!message.is_empty()).then(|| message.to_string())
            }
            other => Some(other.to_string()),
        }
    }
}
