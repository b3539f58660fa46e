//! Hourly trigger loop and manual command channel

use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::orchestrator::{RefreshOrchestrator, TriggerOutcome};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Commands accepted from the web surface or other front-ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshCommand {
    /// Full refresh of one account, or all when `None`
    ForceFull { account_id: Option<String> },
    /// Resume scheduled cycles after credentials were fixed
    ClearReauth,
}

pub type CommandSender = mpsc::UnboundedSender<RefreshCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<RefreshCommand>;

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

pub struct Scheduler {
    orchestrator: Arc<RefreshOrchestrator>,
    tz: Tz,
    trigger_minute: u32,
    run_on_start: bool,
    commands_rx: CommandReceiver,
    shutdown: watch::Receiver<bool>,
    logger: StructuredLogger,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<RefreshOrchestrator>,
        tz: Tz,
        trigger_minute: u32,
        commands_rx: CommandReceiver,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            orchestrator,
            tz,
            trigger_minute,
            run_on_start: true,
            commands_rx,
            shutdown,
            logger: get_logger("scheduler"),
        }
    }

    /// Skip the cycle that otherwise runs right after start-up
    pub fn without_initial_cycle(mut self) -> Self {
        self.run_on_start = false;
        self
    }

    /// Run until shutdown is signalled; in-flight cycles get a short grace period
    pub async fn run(mut self) -> Result<()> {
        let mut cycles = JoinSet::new();
        if self.run_on_start {
            self.spawn_scheduled(&mut cycles);
        }

        loop {
            let next = next_trigger(Utc::now(), self.tz, self.trigger_minute);
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            self.logger.debug(&format!("Next refresh at {}", next));

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.spawn_scheduled(&mut cycles);
                }
                Some(cmd) = self.commands_rx.recv() => {
                    self.handle_command(cmd, &mut cycles);
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = joined {
                        self.logger.error(&format!("Refresh task failed: {}", e));
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.logger.info("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        let drain = async { while cycles.join_next().await.is_some() {} };
        if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
            self.logger.warn("Refresh still running after grace period; aborting");
            cycles.abort_all();
        }
        Ok(())
    }

    fn spawn_scheduled(&self, cycles: &mut JoinSet<()>) {
        let orchestrator = self.orchestrator.clone();
        let logger = self.logger.clone();
        cycles.spawn(async move {
            log_outcome(&logger, &orchestrator.run_scheduled(Utc::now()).await);
        });
    }

    fn handle_command(&self, cmd: RefreshCommand, cycles: &mut JoinSet<()>) {
        self.logger.info(&format!("Received command: {:?}", cmd));
        match cmd {
            RefreshCommand::ForceFull { account_id } => {
                let orchestrator = self.orchestrator.clone();
                let logger = self.logger.clone();
                cycles.spawn(async move {
                    let outcome = orchestrator
                        .force_full_refresh(Utc::now(), account_id)
                        .await;
                    log_outcome(&logger, &outcome);
                });
            }
            RefreshCommand::ClearReauth => self.orchestrator.clear_reauth(),
        }
    }
}

fn log_outcome(logger: &StructuredLogger, outcome: &TriggerOutcome) {
    match outcome {
        TriggerOutcome::Completed(result) => logger.debug(&format!(
            "Cycle {} completed with {:?}",
            result.id, result.status
        )),
        TriggerOutcome::Rejected => logger.debug("Trigger rejected, cycle in flight"),
        TriggerOutcome::Absorbed => logger.debug("Force refresh absorbed"),
        TriggerOutcome::Suspended => logger.debug("Trigger suspended, re-auth required"),
    }
}

/// First instant after `now` whose local minute equals `minute`
pub fn next_trigger(now: DateTime<Utc>, tz: Tz, minute: u32) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let candidate = local
        .with_minute(minute.min(59))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(local);
    let candidate = if candidate <= local {
        candidate + ChronoDuration::hours(1)
    } else {
        candidate
    };
    candidate.with_timezone(&Utc)
}
