use tokio::sync::mpsc;

use crate::robot::PowerStatus;
use crate::state::{Mode, Target};

/// Requests processed by the orchestrator's command loop.
#[derive(Debug)]
pub enum Command {
    SelectTarget(Target),
    GoHome,
    Cancel,
    Acknowledge,
    StartPromotion,
    StopPromotion,
    UserInteraction,
    /// Fired by the inactivity timer; carries the generation it was armed with.
    InactivityExpired(u64),
    PowerStatus(PowerStatus),
}

/// Notifications published to the UI and other observers.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    ModeChanged(Mode),
    Error(String),
    BatteryLevel(f32),
}

/// Cheap handle used by the UI layer and background monitors to reach the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, command: Command) -> anyhow::Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("Orchestrator is not running"))
    }

    pub async fn select_target(&self, target: Target) -> anyhow::Result<()> {
        self.send(Command::SelectTarget(target)).await
    }

    pub async fn go_home(&self) -> anyhow::Result<()> {
        self.send(Command::GoHome).await
    }

    pub async fn cancel(&self) -> anyhow::Result<()> {
        self.send(Command::Cancel).await
    }

    pub async fn acknowledge(&self) -> anyhow::Result<()> {
        self.send(Command::Acknowledge).await
    }

    pub async fn start_promotion(&self) -> anyhow::Result<()> {
        self.send(Command::StartPromotion).await
    }

    pub async fn stop_promotion(&self) -> anyhow::Result<()> {
        self.send(Command::StopPromotion).await
    }

    pub async fn user_interaction(&self) -> anyhow::Result<()> {
        self.send(Command::UserInteraction).await
    }
}
