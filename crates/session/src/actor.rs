use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::coordinator::{SendInput, StartOutcome, StreamSessionCoordinator};
use super::error::{SessionError, SessionResult};
use super::phase::SessionPhase;

enum CoordinatorCommand {
    Start {
        input: SendInput,
        reply: oneshot::Sender<StartOutcome>,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable front end for a coordinator running on its own task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
    phase: watch::Receiver<SessionPhase>,
}

impl CoordinatorHandle {
    pub fn spawn(coordinator: StreamSessionCoordinator) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(coordinator.phase());
        let task = tokio::spawn(run_coordinator(coordinator, command_rx, phase_tx));

        (
            Self {
                commands: command_tx,
                phase: phase_rx,
            },
            task,
        )
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub async fn start(&self, input: SendInput) -> SessionResult<StartOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.send(CoordinatorCommand::Start { input, reply })?;
        outcome.await.map_err(|_| SessionError::ActorStopped {
            stage: "await-start",
        })
    }

    pub async fn cancel(&self) -> SessionResult<()> {
        let (reply, done) = oneshot::channel();
        self.send(CoordinatorCommand::Cancel { reply })?;
        done.await.map_err(|_| SessionError::ActorStopped {
            stage: "await-cancel",
        })
    }

    /// Resolves once the coordinator has no active session.
    pub async fn wait_until_idle(&self) -> SessionResult<()> {
        let mut phase = self.phase.clone();
        phase
            .wait_for(|phase| phase.is_idle())
            .await
            .map(|_| ())
            .map_err(|_| SessionError::ActorStopped {
                stage: "wait-until-idle",
            })
    }

    /// Cancels any active stream and stops the actor.
    pub fn shutdown(&self) {
        let _ = self.commands.send(CoordinatorCommand::Shutdown);
    }

    fn send(&self, command: CoordinatorCommand) -> SessionResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::ActorStopped {
                stage: "send-command",
            })
    }
}

async fn run_coordinator(
    mut coordinator: StreamSessionCoordinator,
    mut commands: mpsc::UnboundedReceiver<CoordinatorCommand>,
    phase_tx: watch::Sender<SessionPhase>,
) {
    loop {
        tokio::select! {
            // Commands first so a cancel is never starved by a busy stream.
            biased;
            command = commands.recv() => {
                match command {
                    Some(CoordinatorCommand::Start { input, reply }) => {
                        let outcome = coordinator.start(input).await;
                        // Publish before replying so callers never observe a stale idle phase.
                        phase_tx.send_replace(coordinator.phase());
                        let _ = reply.send(outcome);
                    }
                    Some(CoordinatorCommand::Cancel { reply }) => {
                        coordinator.cancel().await;
                        phase_tx.send_replace(coordinator.phase());
                        let _ = reply.send(());
                    }
                    Some(CoordinatorCommand::Shutdown) | None => {
                        coordinator.cancel().await;
                        break;
                    }
                }
            }
            event = coordinator.recv_transport_event(), if coordinator.is_active() => {
                coordinator.handle_transport_event(event).await;
            }
        }

        phase_tx.send_replace(coordinator.phase());
    }

    phase_tx.send_replace(coordinator.phase());
    tracing::debug!("chat session actor stopped");
}
