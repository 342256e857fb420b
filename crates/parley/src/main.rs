mod console;
mod logging;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parley_session::{
    CoordinatorDeps, CoordinatorHandle, SendInput, SessionError, StartOutcome,
    StreamSessionCoordinator, SyncGuard,
};
use parley_storage::{ConversationId, MessageStore, SqliteStorage, StorageError};
use parley_transport::{HttpFrameTransport, HttpTransportConfig, TransportError};
use snafu::{ResultExt, Snafu};

use console::{ConsoleChatState, ConsoleNotifier, EchoingCache};
use settings::{ClientSettings, SettingsError, SettingsStore};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Send a prompt to the chat backend and stream the reply")]
#[command(version)]
struct Cli {
    /// Prompt to send
    #[arg(required_unless_present_any = ["history", "save"])]
    prompt: Option<String>,

    /// Continue an existing conversation instead of starting a new one
    #[arg(short, long)]
    conversation: Option<String>,

    /// Title for a new conversation
    #[arg(long)]
    title: Option<String>,

    /// Print the stored messages of `--conversation` and exit
    #[arg(long, requires = "conversation")]
    history: bool,

    /// SQLite database path (overrides settings)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Backend base URL (overrides settings)
    #[arg(long)]
    endpoint: Option<String>,

    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write `--database` and `--endpoint` into the settings file
    #[arg(long)]
    save: bool,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("invalid conversation id on `{stage}`"))]
    ConversationId {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to save settings on `{stage}`"))]
    SaveSettings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to open message store on `{stage}`"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to read conversation history on `{stage}`"))]
    History {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to configure chat transport on `{stage}`"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("chat session stopped unexpectedly on `{stage}`"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("could not start the reply on `{stage}`"))]
    Start {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("reply failed; prompt not delivered: {draft}"))]
    ReplyFailed { stage: &'static str, draft: String },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    let settings_store = match &cli.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let effective = apply_overrides(&settings_store.settings(), &cli);
    if cli.save {
        settings_store.update(effective).context(SaveSettingsSnafu {
            stage: "save-cli-overrides",
        })?;
    } else {
        settings_store.replace(effective);
    }
    let settings = settings_store.settings();

    logging::init(&settings.log_level);
    tracing::debug!(config_path = ?settings_store.config_path(), "settings loaded");

    let conversation_id = cli
        .conversation
        .as_deref()
        .map(ConversationId::parse)
        .transpose()
        .context(ConversationIdSnafu {
            stage: "parse-conversation-argument",
        })?;

    let store = SqliteStorage::open(&settings.database_path)
        .await
        .context(OpenStoreSnafu {
            stage: "open-sqlite-store",
        })?;

    if cli.history
        && let Some(conversation_id) = &conversation_id
    {
        return print_history(&store, conversation_id).await;
    }

    let Some(prompt) = cli.prompt.clone() else {
        return Ok(());
    };

    let transport = HttpFrameTransport::new(
        HttpTransportConfig::new(settings.endpoint.clone())
            .with_api_key(settings.api_key())
            .with_connect_timeout(settings.connect_timeout()),
    )
    .context(TransportSnafu {
        stage: "build-http-transport",
    })?;

    let cache = Arc::new(EchoingCache::new(std::io::stdout()));
    let state = Arc::new(ConsoleChatState::new());
    let notifier = Arc::new(ConsoleNotifier::new());
    let coordinator = StreamSessionCoordinator::new(CoordinatorDeps {
        store: Arc::new(store),
        cache: cache.clone(),
        state: state.clone(),
        notifier: notifier.clone(),
        transport: Arc::new(transport),
        sync_guard: SyncGuard::new(),
    });
    let (handle, actor) = CoordinatorHandle::spawn(coordinator);

    let input = match conversation_id {
        Some(conversation_id) => SendInput::new(prompt).in_conversation(conversation_id),
        None => SendInput::new(prompt).with_title(
            cli.title
                .clone()
                .unwrap_or_else(|| settings.default_conversation_title.clone()),
        ),
    };

    match handle.start(input).await.context(SessionSnafu {
        stage: "send-start-command",
    })? {
        StartOutcome::Started => {}
        StartOutcome::Rejected(rejection) => {
            tracing::warn!(?rejection, "a reply is already streaming");
        }
        StartOutcome::Failed(source) => {
            handle.shutdown();
            return Err(CliError::Start {
                stage: "open-chat-stream",
                source,
            });
        }
    }

    tokio::select! {
        idle = handle.wait_until_idle() => {
            idle.context(SessionSnafu { stage: "wait-for-reply" })?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; saving partial reply");
            handle.cancel().await.context(SessionSnafu { stage: "cancel-reply" })?;
            handle
                .wait_until_idle()
                .await
                .context(SessionSnafu { stage: "wait-after-cancel" })?;
        }
    }
    cache.finish_line();

    handle.shutdown();
    if let Err(error) = actor.await {
        tracing::warn!(error = %error, "chat session task ended abnormally");
    }

    if let Some(conversation_id) = state.active_conversation() {
        eprintln!("conversation: {conversation_id}");
    }

    if notifier.has_errors()
        && let Some(draft) = state.restored_draft()
    {
        return ReplyFailedSnafu {
            stage: "stream-reply",
            draft,
        }
        .fail();
    }

    Ok(())
}

fn apply_overrides(settings: &ClientSettings, cli: &Cli) -> ClientSettings {
    let mut settings = settings.clone();
    if let Some(database) = &cli.database {
        settings.database_path = database.to_string_lossy().into_owned();
    }
    if let Some(endpoint) = &cli.endpoint {
        settings.endpoint = endpoint.clone();
    }
    settings
}

async fn print_history(
    store: &SqliteStorage,
    conversation_id: &ConversationId,
) -> Result<(), CliError> {
    let messages = store
        .list_messages(conversation_id)
        .await
        .context(HistorySnafu {
            stage: "list-conversation-messages",
        })?;

    for message in messages {
        println!("{}: {}", message.role.as_str(), message.content);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "parley",
            "--database",
            "/tmp/chat.db",
            "--endpoint",
            "https://chat.example.test",
            "Hello",
        ]);
        let settings = apply_overrides(&ClientSettings::default(), &cli);

        assert_eq!(cli.prompt.as_deref(), Some("Hello"));
        assert_eq!(settings.database_path, "/tmp/chat.db");
        assert_eq!(settings.endpoint, "https://chat.example.test");
    }

    #[test]
    fn history_requires_a_conversation() {
        assert!(Cli::try_parse_from(["parley", "--history"]).is_err());
        let cli = Cli::try_parse_from(["parley", "--history", "--conversation", "c-1"])
            .expect("history with conversation parses");
        assert!(cli.history);
        assert!(cli.prompt.is_none());
    }

    #[test]
    fn prompt_is_required_without_history_or_save() {
        assert!(Cli::try_parse_from(["parley"]).is_err());
        let cli = Cli::try_parse_from(["parley", "--save", "--endpoint", "https://x.test"])
            .expect("save without prompt parses");
        assert!(cli.save);
        assert!(cli.prompt.is_none());
    }
}
