//! Periodic decision timeout sweeper
//!
//! Runs [`DecisionCoordinator::sweep`] on an interval. A failed sweep is
//! reported and simply retried at the next tick.

use super::coordinator::{DecisionCoordinator, SweepReport};
use crate::metrics;
use crate::{MeshError, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Events emitted by the sweeper
#[derive(Debug, Clone)]
pub enum SweeperEvent {
    Started,
    Stopped,
    SweepCompleted(SweepReport),
    SweepFailed { message: String },
}

/// Commands accepted by a running sweeper
#[derive(Debug, Clone)]
pub enum SweeperCommand {
    /// Sweep immediately
    SweepNow,
    /// Replace the sweep period; zero is ignored
    SetInterval(Duration),
    Shutdown,
}

enum CommandResult {
    Continue,
    Stop,
}

pub struct Sweeper {
    coordinator: Arc<DecisionCoordinator>,
    interval: Duration,
    event_tx: broadcast::Sender<SweeperEvent>,
    command_tx: mpsc::Sender<SweeperCommand>,
    command_rx: Option<mpsc::Receiver<SweeperCommand>>,
}

impl Sweeper {
    pub fn new(coordinator: Arc<DecisionCoordinator>, interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (command_tx, command_rx) = mpsc::channel(10);
        Self {
            coordinator,
            interval,
            event_tx,
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SweeperEvent> {
        self.event_tx.subscribe()
    }

    pub fn command_sender(&self) -> mpsc::Sender<SweeperCommand> {
        self.command_tx.clone()
    }

    fn send_event(&self, event: SweeperEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Sweep once now
    pub async fn sweep_once(&self) -> Option<SweepReport> {
        match self.coordinator.sweep(Utc::now()).await {
            Ok(report) => {
                metrics::record_sweep("ok");
                if report != SweepReport::default() {
                    tracing::info!(
                        auto_approved = report.auto_approved,
                        escalated = report.escalated,
                        escalations_timed_out = report.escalations_timed_out,
                        skipped_locked = report.skipped_locked,
                        failures = report.failures,
                        "Sweep completed"
                    );
                }
                self.send_event(SweeperEvent::SweepCompleted(report));
                Some(report)
            }
            Err(e) => {
                metrics::record_sweep("error");
                tracing::warn!(error = %e, "Sweep failed, retrying next tick");
                self.send_event(SweeperEvent::SweepFailed {
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Run until shut down by command, SIGTERM or SIGINT
    pub async fn run(&mut self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(MeshError::Config("Sweep interval must be positive".to_string()));
        }
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| MeshError::Config("Sweeper already running".to_string()))?;
        let mut interval = tokio::time::interval(self.interval);
        self.send_event(SweeperEvent::Started);
        tracing::info!(interval_secs = self.interval.as_secs(), "Sweeper started");

        #[cfg(unix)]
        self.run_with_signals(&mut interval, &mut command_rx).await?;

        #[cfg(not(unix))]
        self.run_without_signals(&mut interval, &mut command_rx).await?;

        self.send_event(SweeperEvent::Stopped);
        tracing::info!("Sweeper stopped");
        Ok(())
    }

    #[cfg(unix)]
    async fn run_with_signals(
        &mut self,
        interval: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<SweeperCommand>,
    ) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| MeshError::Other(format!("Failed to set up SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| MeshError::Other(format!("Failed to set up SIGINT handler: {}", e)))?;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                Some(cmd) = command_rx.recv() => {
                    match self.handle_command(cmd, interval).await {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, stopping sweeper");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, stopping sweeper");
                    break;
                }
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn run_without_signals(
        &mut self,
        interval: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<SweeperCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                Some(cmd) = command_rx.recv() => {
                    match self.handle_command(cmd, interval).await {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_command(
        &mut self,
        cmd: SweeperCommand,
        interval: &mut tokio::time::Interval,
    ) -> CommandResult {
        match cmd {
            SweeperCommand::SweepNow => {
                self.sweep_once().await;
            }
            SweeperCommand::SetInterval(duration) if duration.is_zero() => {
                tracing::warn!("Ignoring zero sweep interval");
            }
            SweeperCommand::SetInterval(duration) => {
                *interval = tokio::time::interval(duration);
                self.interval = duration;
            }
            SweeperCommand::Shutdown => {
                tracing::info!("Received shutdown command");
                return CommandResult::Stop;
            }
        }
        CommandResult::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::config::{BusSettings, DecisionSettings};
    use crate::decision::{DecisionStatus, SqliteDecisionRepository, Tier};
    use crate::lock::LockManager;
    use meshstore::MemoryStore;

    fn coordinator(settings: DecisionSettings) -> Arc<DecisionCoordinator> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(DecisionCoordinator::new(
            Arc::new(SqliteDecisionRepository::open_in_memory().unwrap()),
            MessageBus::new(store.clone(), BusSettings::default()),
            LockManager::new(store),
            settings,
        ))
    }

    #[tokio::test]
    async fn test_sweep_now_and_shutdown() {
        let settings = DecisionSettings {
            minor_timeout: Duration::ZERO,
            ..Default::default()
        };
        let coordinator = coordinator(settings);
        let decision = coordinator.propose("t", "", "a1", Tier::Minor).await.unwrap();

        let mut sweeper = Sweeper::new(coordinator.clone(), Duration::from_secs(3600));
        let mut events = sweeper.subscribe();
        let commands = sweeper.command_sender();
        let handle = tokio::spawn(async move { sweeper.run().await });

        assert!(matches!(events.recv().await.unwrap(), SweeperEvent::Started));
        // First interval tick fires immediately
        match events.recv().await.unwrap() {
            SweeperEvent::SweepCompleted(report) => assert_eq!(report.auto_approved, 1),
            other => panic!("unexpected event: {:?}", other),
        }

        commands.send(SweeperCommand::SweepNow).await.unwrap();
        match events.recv().await.unwrap() {
            SweeperEvent::SweepCompleted(report) => assert_eq!(report, SweepReport::default()),
            other => panic!("unexpected event: {:?}", other),
        }

        commands.send(SweeperCommand::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
        assert!(matches!(events.recv().await.unwrap(), SweeperEvent::Stopped));

        let decision = coordinator.get(&decision.id).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Approved);
    }

    #[tokio::test]
    async fn test_zero_interval_is_ignored() {
        let mut sweeper = Sweeper::new(coordinator(DecisionSettings::default()), Duration::from_secs(3600));
        let mut events = sweeper.subscribe();
        let commands = sweeper.command_sender();
        let handle = tokio::spawn(async move { sweeper.run().await });

        assert!(matches!(events.recv().await.unwrap(), SweeperEvent::Started));
        assert!(matches!(events.recv().await.unwrap(), SweeperEvent::SweepCompleted(_)));

        commands.send(SweeperCommand::SetInterval(Duration::ZERO)).await.unwrap();
        commands.send(SweeperCommand::SweepNow).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), SweeperEvent::SweepCompleted(_)));

        commands.send(SweeperCommand::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
        assert!(matches!(events.recv().await.unwrap(), SweeperEvent::Stopped));
    }

    #[tokio::test]
    async fn test_zero_start_interval_is_an_error() {
        let mut sweeper = Sweeper::new(coordinator(DecisionSettings::default()), Duration::ZERO);
        assert!(matches!(sweeper.run().await, Err(MeshError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_twice_is_an_error() {
        let mut sweeper = Sweeper::new(coordinator(DecisionSettings::default()), Duration::from_secs(60));
        sweeper.command_sender().send(SweeperCommand::Shutdown).await.unwrap();
        sweeper.run().await.unwrap();
        assert!(matches!(sweeper.run().await, Err(MeshError::Config(_))));
    }
}
