mod alert;
mod chatbot;
mod config;
mod provider;

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ChatKind;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

use chatbot::buffer::Admission;
use chatbot::credentials::CredentialStore;
use chatbot::outcome::{CompositeRecorder, LogRecorder, OutcomeRecorder};
use chatbot::router::spawn_refresh_loop;
use chatbot::telegram::inbound_from;
use chatbot::{
    ChatbotConfig, ChatbotEngine, CredentialPool, Database, DispatchSequencer, PoolConfig, SequencerConfig,
    TelegramClient, UsageLedger, system_prompt,
};
use config::Config;
use provider::ProviderClients;

struct BotState {
    config: Config,
    engine: ChatbotEngine,
    telegram: Arc<TelegramClient>,
}

impl BotState {
    async fn new(config: Config, bot: &Bot) -> Result<Self, String> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| format!("Failed to create data dir {:?}: {e}", config.data_dir))?;

        let database = Arc::new(
            Database::open(&config.database_path()).map_err(|e| format!("Failed to open database: {e}"))?,
        );

        // Seed credentials from config; admin-set states survive restarts
        for credential in &config.credentials {
            if let Err(e) = database.upsert(credential).await {
                warn!("Failed to seed credential {}: {e}", credential.id);
            }
        }

        let chatbot_config = ChatbotConfig {
            debounce_ms: config.debounce.as_millis() as u64,
            debounce_max_ms: config.debounce_max.as_millis() as u64,
            idle_evict_secs: config.idle_evict.as_secs(),
            business_name: config.business_name.clone(),
            system_prompt: config.system_prompt.clone(),
        };

        let providers = ProviderClients::new(config.provider_timeout).map_err(|e| e.to_string())?;
        let ledger = UsageLedger::new(database.clone(), config.timezone, config.ledger_max_retries);
        let pool = Arc::new(CredentialPool::new(
            PoolConfig {
                provider_timeout: config.provider_timeout,
                transport_backoff: config.transport_backoff,
                fallback_reply: config.fallback_reply.clone(),
                system_prompt: system_prompt(&chatbot_config),
            },
            database.clone(),
            ledger,
            Arc::new(providers),
        ));
        match pool.refresh().await {
            Ok(0) => warn!("No credentials configured; every customer will get the fallback reply"),
            Ok(n) => info!("Loaded {n} credential(s)"),
            Err(e) => error!("Failed to load credentials: {e}"),
        }
        spawn_refresh_loop(pool.clone(), config.credential_refresh);

        let sequencer = Arc::new(DispatchSequencer::new(
            pool,
            SequencerConfig {
                max_concurrent: config.max_concurrent_dispatches,
                max_queue_depth: config.max_queue_depth,
                fallback_reply: config.fallback_reply.clone(),
            },
        ));

        let recorders: Vec<Arc<dyn OutcomeRecorder>> = vec![Arc::new(LogRecorder), database];
        let telegram = Arc::new(TelegramClient::new(bot.clone()));
        let mut engine = ChatbotEngine::new(
            chatbot_config,
            sequencer,
            telegram.clone(),
            Arc::new(CompositeRecorder::new(recorders)),
        );
        engine.start_sweeper();

        Ok(Self {
            config,
            engine,
            telegram,
        })
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "relaydesk.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("relaydesk.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file: {e}");
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(alert_chat_id) = config.alert_chat_id {
        let alert_layer = alert::TelegramAlertLayer::new(bot.clone(), alert_chat_id);
        registry.with(alert_layer).init();
    } else {
        registry.init();
    }

    info!("🚀 Starting relaydesk...");
    info!("Loaded config from {}", config.config_path.display());
    info!(
        "Debounce {}ms (max {}ms), {} concurrent dispatch(es), quota timezone {}",
        config.debounce.as_millis(),
        config.debounce_max.as_millis(),
        config.max_concurrent_dispatches,
        config.timezone
    );

    let state = match BotState::new(config, &bot).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_new_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_new_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    if !matches!(msg.chat.kind, ChatKind::Private(_)) {
        return Ok(());
    }
    if msg.from.as_ref().is_some_and(|u| u.is_bot) {
        return Ok(());
    }
    if state.config.alert_chat_id == Some(msg.chat.id) || !state.config.is_allowed_chat(msg.chat.id) {
        return Ok(());
    }

    let Some((conversation_id, inbound)) = inbound_from(&msg) else {
        return Ok(());
    };

    let admission =
        state
            .engine
            .receive_message(conversation_id, inbound.id, &inbound.text, inbound.received_at);

    match admission {
        Admission::Buffered | Admission::Flushed | Admission::Deferred => {
            let telegram = state.telegram.clone();
            tokio::spawn(async move {
                if let Err(e) = telegram.send_typing(conversation_id).await {
                    debug!("{e}");
                }
            });
        }
        Admission::Duplicate | Admission::Ignored => {}
    }

    Ok(())
}
