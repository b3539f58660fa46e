use anyhow::{Context, Result};
use gridstat::api::HttpUtilityApi;
use gridstat::config::Config;
use gridstat::logging::{get_logger, init_logging};
use gridstat::orchestrator::{CycleContext, RefreshOrchestrator};
use gridstat::scheduler::{Scheduler, command_channel};
use gridstat::store::JsonFileStore;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    config.validate().context("validating configuration")?;
    config.validate_remote().context("validating API settings")?;
    init_logging(&config.logging).context("initializing logging")?;

    let logger = get_logger("main");
    logger.info(&format!("Gridstat {} starting up", env!("APP_VERSION")));

    let api = Arc::new(HttpUtilityApi::new(&config.api)?);
    let store = Arc::new(JsonFileStore::open(&config.store.path).await?);
    let tz = config.tz()?;
    let trigger_minute = config.schedule.trigger_minute;
    #[cfg(feature = "web")]
    let web = config.web.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = CycleContext {
        api,
        store,
        config: Arc::new(config),
    };
    let orchestrator = Arc::new(RefreshOrchestrator::new(ctx, shutdown_rx.clone())?);
    let (cmd_tx, cmd_rx) = command_channel();

    #[cfg(feature = "web")]
    let web_task = if web.enabled {
        let orchestrator = orchestrator.clone();
        let cmd_tx = cmd_tx.clone();
        let shutdown = shutdown_rx.clone();
        let logger = logger.clone();
        Some(tokio::spawn(async move {
            if let Err(e) =
                gridstat::web::serve(orchestrator, cmd_tx, &web.host, web.port, shutdown).await
            {
                logger.error(&format!("Web server error: {}", e));
            }
        }))
    } else {
        None
    };

    let scheduler = Scheduler::new(orchestrator, tz, trigger_minute, cmd_rx, shutdown_rx);
    let scheduler_task = tokio::spawn(scheduler.run());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    logger.info("Shutdown requested");
    let _ = shutdown_tx.send(true);
    drop(cmd_tx);

    match scheduler_task.await {
        Ok(Ok(())) => logger.info("Scheduler stopped"),
        Ok(Err(e)) => logger.error(&format!("Scheduler error: {}", e)),
        Err(e) => logger.error(&format!("Scheduler task panicked: {}", e)),
    }
    #[cfg(feature = "web")]
    if let Some(task) = web_task {
        let _ = task.await;
    }
    Ok(())
}
