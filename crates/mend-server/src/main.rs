mod logging;
mod routes;

use mend_agent::CloudAgentBackend;
use mend_core::{
    approval::details_text,
    codefix::{CodeFixBackend, CodeFixBridge},
    command::{CommandRunner, SystemRunner},
    config::Config,
    db::Db,
    executor::ActionBudget,
    health::{HealthSource, HttpHealthSource},
    notify::{LogNotifier, Notifier},
    orchestrator::{format_status, AgentDeps, RepairAgent, HISTORY_CAP},
    telegram::{parse_callback, CallbackAction, TgCallback, TgMessage, TgUpdate, Telegram},
    verifier::Verifier,
    RepairEvent,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use logging::{BroadcastLayer, LOG_RING_CAP};

const TELEGRAM_POLL_PAUSE: Duration = Duration::from_secs(2);

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub budget: ActionBudget,
    pub verifier: Arc<Verifier>,
    pub codefix: Arc<CodeFixBridge>,
    pub events: broadcast::Sender<RepairEvent>,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<Mutex<VecDeque<String>>>,
    pub start_time: Instant,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _) = broadcast::channel::<String>(1024);
    let log_ring = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_RING_CAP)));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "mend_server=info,mend_core=info,mend_agent=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env();

    std::fs::create_dir_all(&config.data_dir)?;
    let mut db = Db::open(&config.db_path())?;
    db.migrate()?;
    let db = Arc::new(db);

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    if config.health_url.is_empty() {
        warn!("HEALTH_URL is not set: every verification will report the issue as persisting");
    }
    let health: Arc<dyn HealthSource> = Arc::new(HttpHealthSource::new(config.health_url.clone()));

    let telegram = config
        .telegram_enabled()
        .then(|| Arc::new(Telegram::new(config.telegram_token.clone(), config.admin_chat_id)));
    let notifier: Arc<dyn Notifier> = match &telegram {
        Some(tg) => Arc::clone(tg) as Arc<dyn Notifier>,
        None => {
            warn!("TELEGRAM_BOT_TOKEN or ADMIN_CHAT_ID missing: notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };

    let codefix_backend: Arc<dyn CodeFixBackend> = Arc::new(
        CloudAgentBackend::new(config.codefix_api_key.clone(), config.codefix_api_url.clone())
            .with_repo(config.codefix_repo_url.clone(), config.codefix_repo_branch.clone()),
    );

    let agent = RepairAgent::new(
        config.clone(),
        AgentDeps {
            db: Arc::clone(&db),
            runner: Arc::clone(&runner),
            health: Arc::clone(&health),
            notifier,
            codefix: Arc::clone(&codefix_backend),
        },
    );
    let budget = agent.budget();
    let events = agent.event_sender();

    let cancel = CancellationToken::new();
    let agent_task = tokio::spawn(agent.run(cancel.clone()));

    // Telegram polling loop: operator decisions and status requests
    if let Some(tg) = telegram.clone() {
        let db_tg = Arc::clone(&db);
        let budget_tg = budget.clone();
        let cancel_tg = cancel.clone();
        tokio::spawn(async move {
            loop {
                match tg.get_updates().await {
                    Ok(updates) => {
                        for update in updates {
                            match update {
                                TgUpdate::Callback(cb) => handle_callback(&tg, &db_tg, cb).await,
                                TgUpdate::Message(msg) => {
                                    handle_message(&tg, &db_tg, &budget_tg, msg).await
                                }
                            }
                        }
                    }
                    Err(e) => warn!("Telegram poll error: {e:#}"),
                }
                tokio::select! {
                    _ = cancel_tg.cancelled() => break,
                    _ = tokio::time::sleep(TELEGRAM_POLL_PAUSE) => {}
                }
            }
        });
    }

    let state = Arc::new(AppState {
        db: Arc::clone(&db),
        budget,
        verifier: Arc::new(Verifier::new(health, runner, config.verify_delay)),
        codefix: Arc::new(
            CodeFixBridge::new(codefix_backend, config.codefix_poll)
                .with_daily_limit(config.codefix_max_per_day),
        ),
        events,
        log_tx,
        log_ring,
        start_time: Instant::now(),
        config: Arc::new(config),
    });

    let addr = format!("{}:{}", state.config.web_bind, state.config.web_port);
    let app = routes::router(state);

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    cancel.cancel();
    if let Err(e) = agent_task.await {
        warn!("repair agent task ended abnormally: {e}");
    }
    Ok(())
}

async fn handle_callback(tg: &Telegram, db: &Db, cb: TgCallback) {
    let Some((action, request_id)) = parse_callback(&cb.data) else {
        return;
    };
    if cb.chat_id != tg.admin_chat_id {
        warn!(chat_id = cb.chat_id, sender = cb.sender_id, "decision from unauthorized chat");
        let _ = tg.answer_callback_query(&cb.id, "Not authorized").await;
        return;
    }

    let approved = match action {
        CallbackAction::Details => {
            let _ = tg.answer_callback_query(&cb.id, "").await;
            if let Err(e) = tg.send_message(cb.chat_id, &details_text(db, request_id), &[]).await {
                warn!("details reply failed: {e:#}");
            }
            return;
        }
        CallbackAction::Approve => true,
        CallbackAction::Reject => false,
    };

    let (ack, verdict) = match db.resolve_approval(request_id, approved) {
        Ok(true) if approved => ("Approved", Some("✅ APPROVED")),
        Ok(true) => ("Rejected", Some("❌ REJECTED")),
        Ok(false) => ("Request expired or already decided", None),
        Err(e) => {
            warn!(request_id, "recording decision failed: {e:#}");
            ("Could not record decision", None)
        }
    };
    info!(request_id, approved, recorded = verdict.is_some(), "operator decision received");
    let _ = tg.answer_callback_query(&cb.id, ack).await;
    if let Some(verdict) = verdict {
        let text = format!("{}\n\n{verdict}", cb.message_text);
        if let Err(e) = tg.edit_message_text(cb.chat_id, cb.message_id, &text).await {
            warn!("editing approval message failed: {e:#}");
        }
    }
}

async fn handle_message(tg: &Telegram, db: &Db, budget: &ActionBudget, msg: TgMessage) {
    if msg.chat_id != tg.admin_chat_id {
        return;
    }
    let command = msg.text.split_whitespace().next().unwrap_or("");
    let command = command.split('@').next().unwrap_or(command);
    if command != "/repair_status" {
        return;
    }
    let text = match db.recent_repair_records(HISTORY_CAP) {
        Ok(records) => format_status(&records, budget.used(), budget.limit()),
        Err(e) => format!("Failed to load repair history: {e:#}"),
    };
    if let Err(e) = tg.send_message(msg.chat_id, &text, &[]).await {
        warn!("status reply failed: {e:#}");
    }
}
