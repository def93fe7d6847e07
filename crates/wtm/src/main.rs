use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wtm_core::{
    clock::SystemClock,
    config::Config,
    events::WhatsAppEventService,
    memory::InMemoryScheduledMessageRepository,
    repository::ScheduledMessageRepository,
    runtime_config::{CommonRuntimeConfig, TimedRuntimeConfig},
    service::TimedMessageService,
    transport::WhatsAppTransport,
    worker::TimedMessageWorker,
};
use wtm_postgres::PgScheduledMessageRepository;
use wtm_whatsapp::{
    routes::{router, AppState},
    HttpWhatsAppTransport,
};

const TIMED_MESSAGES_INSTRUCTION: &str =
    "Timed Messages: use *add* to schedule, *list* to view pending messages, \
     and cancel by replying *cancel* to a scheduled confirmation.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wtm_core::logging::init("wtm")?;

    let cfg = Arc::new(Config::load()?);
    info!(
        "starting timed messages (assistant_mode={}, gateway={})",
        cfg.assistant_mode, cfg.gateway_url
    );
    if cfg.default_timezone.is_none() {
        warn!("DEFAULT_TIMEZONE is not set; scheduling commands will be rejected until it is");
    }

    let common = Arc::new(CommonRuntimeConfig::new(cfg.common_config_path.clone()));
    let runtime = Arc::new(TimedRuntimeConfig::new(
        cfg.timed_config_path.clone(),
        common,
    ));
    runtime.set_instruction("timed_messages", TIMED_MESSAGES_INSTRUCTION)?;
    log_admin_setup(&runtime);

    let repo: Arc<dyn ScheduledMessageRepository> = match &cfg.database_url {
        Some(url) => Arc::new(PgScheduledMessageRepository::connect(url).await?),
        None => {
            warn!("DATABASE_URL is not set; using the in-memory store (lost on restart)");
            Arc::new(InMemoryScheduledMessageRepository::new())
        }
    };

    let service = Arc::new(TimedMessageService::new(
        repo,
        Arc::new(SystemClock),
        cfg.assistant_policy(),
    ));
    let transport: Arc<dyn WhatsAppTransport> = Arc::new(HttpWhatsAppTransport::new(
        cfg.gateway_url.clone(),
        cfg.gateway_timeout,
    )?);
    let events = Arc::new(WhatsAppEventService::new(
        service.clone(),
        transport.clone(),
        runtime,
        cfg.default_timezone.clone(),
    ));

    let cancel = CancellationToken::new();
    let worker = TimedMessageWorker::new(
        service.clone(),
        transport,
        cfg.poll_interval,
        cfg.batch_size,
    );
    let worker_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    let app = router(
        AppState {
            events,
            service,
        },
        cfg.enable_debug_api,
    );
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    info!("listening on {}", cfg.listen_addr);

    axum_serve(listener, app, cancel.clone()).await?;

    cancel.cancel();
    if let Err(err) = worker_handle.await {
        error!("worker task panicked: {err}");
    }
    Ok(())
}

async fn axum_serve(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = cancel.cancelled() => {}
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}

fn log_admin_setup(runtime: &TimedRuntimeConfig) {
    info!("timed messages commands: !setup timed messages / !stop timed messages");
    for instruction in runtime.instructions().values() {
        info!("- {instruction}");
    }

    if !runtime.admin_sender_id().is_empty() {
        return;
    }
    match runtime.admin_setup_code() {
        Ok(code) => {
            warn!("=== Admin Setup Required ===");
            warn!("Setup code: {code}");
            warn!("Send this message from your WhatsApp account:");
            warn!("!whoami {code}");
            warn!("============================");
        }
        Err(err) => error!("failed generating admin setup code: {err}"),
    }
}
