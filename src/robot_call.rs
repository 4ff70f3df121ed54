//! Remote summons: a shopper's device writes a product id to the domain
//! service and an idle robot drives to that product.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{Command, OrchestratorHandle};
use crate::domain::DomainClient;
use crate::state::{Mode, Target};

#[derive(Debug, Deserialize)]
struct ProductFile {
    products: Vec<Target>,
}

pub async fn load_products(path: impl AsRef<Path>) -> Result<Vec<Target>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read products from {}", path.display()))?;
    let file: ProductFile = serde_json::from_str(&content)
        .with_context(|| format!("Invalid products file {}", path.display()))?;
    Ok(file.products)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Not idle, or still cooling down after the last summon.
    Skipped,
    NoCall,
    /// The call names a product that is not in the catalog.
    UnknownProduct(String),
    Dispatched(Target),
}

#[derive(Debug, Default)]
struct Cooldown {
    /// A summon was dispatched and the robot has not been idle since.
    pending: bool,
    until: Option<Instant>,
}

/// Polls the domain service for robot calls and turns them into navigation
/// commands.
///
/// After a handled call the poller stays quiet until the robot has been back
/// in `Idle` for the whole cooldown.
pub struct RobotCallPoller {
    domain: Arc<dyn DomainClient>,
    products: RwLock<Vec<Target>>,
    cooldown: Duration,
    state: Mutex<Cooldown>,
}

impl RobotCallPoller {
    pub fn new(domain: Arc<dyn DomainClient>, cooldown: Duration) -> Self {
        Self {
            domain,
            products: RwLock::new(Vec::new()),
            cooldown,
            state: Mutex::new(Cooldown::default()),
        }
    }

    pub fn set_products(&self, products: Vec<Target>) {
        info!("[CALL] Loaded {} products", products.len());
        *self
            .products
            .write()
            .unwrap_or_else(PoisonError::into_inner) = products;
    }

    fn find_product(&self, id: &str) -> Option<Target> {
        self.products
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.id.as_deref() == Some(id))
            .cloned()
    }

    /// Returns true while the cooldown keeps polling off. The cooldown clock
    /// starts on the first idle poll after a dispatch.
    fn cooling_down(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if state.pending {
            state.pending = false;
            state.until = Some(now + self.cooldown);
            info!(
                "[CALL] Waiting {:?} before polling for robot calls again",
                self.cooldown
            );
            return true;
        }
        match state.until {
            Some(until) if now < until => true,
            Some(_) => {
                state.until = None;
                info!("[CALL] Cooldown over, resuming robot call polling");
                false
            }
            None => false,
        }
    }

    pub async fn poll(&self, mode: Mode, handle: &OrchestratorHandle) -> Result<PollOutcome> {
        if mode != Mode::Idle || self.cooling_down() {
            return Ok(PollOutcome::Skipped);
        }

        let Some(call) = self.domain.get_robot_call().await? else {
            return Ok(PollOutcome::NoCall);
        };
        debug!("[CALL] Robot call for product {}", call.product_id);

        let Some(product) = self.find_product(&call.product_id) else {
            warn!(
                "[CALL] Robot call for unknown product {}",
                call.product_id
            );
            return Ok(PollOutcome::UnknownProduct(call.product_id));
        };

        info!("[CALL] Summoned to {}", product.name);
        handle
            .send(Command::SelectTarget(product.clone()))
            .await
            .context("Failed to dispatch robot call")?;
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending = true;

        if let Err(e) = self.domain.clear_robot_call(call.data_id.as_deref()).await {
            warn!("[CALL] Failed to clear robot call: {:#}", e);
        }
        Ok(PollOutcome::Dispatched(product))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RobotCallRecord;
    use crate::mock::MockDomain;
    use crate::state::TargetPose;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn product(name: &str, id: &str) -> Target {
        Target {
            name: name.to_string(),
            id: Some(id.to_string()),
            pose: TargetPose {
                x: 4.0,
                y: 2.0,
                z: 0.0,
                yaw: None,
            },
        }
    }

    fn call(product_id: &str) -> RobotCallRecord {
        RobotCallRecord {
            product_id: product_id.to_string(),
            data_id: Some("call-7".to_string()),
        }
    }

    fn poller(domain: &Arc<MockDomain>) -> RobotCallPoller {
        let poller = RobotCallPoller::new(domain.clone(), Duration::from_secs(60));
        poller.set_products(vec![product("Oat Milk", "p-1"), product("Bread", "p-2")]);
        poller
    }

    #[tokio::test(start_paused = true)]
    async fn only_polls_while_idle() {
        let domain = Arc::new(MockDomain::default());
        domain.push_robot_call(Ok(Some(call("p-1"))));
        let poller = poller(&domain);
        let (tx, mut rx) = mpsc::channel(4);
        let handle = OrchestratorHandle::new(tx);

        for mode in [Mode::Navigating, Mode::Patrol, Mode::Arrived, Mode::Error] {
            assert_eq!(poller.poll(mode, &handle).await.unwrap(), PollOutcome::Skipped);
        }
        assert_eq!(domain.robot_call_reads(), 0);
        assert!(rx.try_recv().is_err());

        assert!(matches!(
            poller.poll(Mode::Idle, &handle).await.unwrap(),
            PollOutcome::Dispatched(_)
        ));
        assert_eq!(domain.robot_call_reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_then_clears_the_call() {
        let domain = Arc::new(MockDomain::default());
        domain.push_robot_call(Ok(Some(call("p-2"))));
        let poller = poller(&domain);
        let (tx, mut rx) = mpsc::channel(4);

        let outcome = poller
            .poll(Mode::Idle, &OrchestratorHandle::new(tx))
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Dispatched(product("Bread", "p-2")));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Command::SelectTarget(target) if target.name == "Bread"
        ));
        assert_eq!(domain.cleared_calls(), vec![Some("call-7".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_product_is_left_alone() {
        let domain = Arc::new(MockDomain::default());
        domain.push_robot_call(Ok(Some(call("p-99"))));
        let poller = poller(&domain);
        let (tx, mut rx) = mpsc::channel(4);

        let outcome = poller
            .poll(Mode::Idle, &OrchestratorHandle::new(tx))
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::UnknownProduct("p-99".to_string()));
        assert!(rx.try_recv().is_err());
        assert!(domain.cleared_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_runs_from_return_to_idle() {
        let domain = Arc::new(MockDomain::default());
        domain.push_robot_call(Ok(Some(call("p-1"))));
        let poller = poller(&domain);
        let (tx, _rx) = mpsc::channel(4);
        let handle = OrchestratorHandle::new(tx);

        poller.poll(Mode::Idle, &handle).await.unwrap();
        assert_eq!(domain.robot_call_reads(), 1);

        // Navigation takes longer than the cooldown; it must not count.
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(
            poller.poll(Mode::Navigating, &handle).await.unwrap(),
            PollOutcome::Skipped
        );

        assert_eq!(poller.poll(Mode::Idle, &handle).await.unwrap(), PollOutcome::Skipped);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(poller.poll(Mode::Idle, &handle).await.unwrap(), PollOutcome::Skipped);
        assert_eq!(domain.robot_call_reads(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(poller.poll(Mode::Idle, &handle).await.unwrap(), PollOutcome::NoCall);
        assert_eq!(domain.robot_call_reads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_errors_do_not_start_a_cooldown() {
        let domain = Arc::new(MockDomain::default());
        domain.push_robot_call(Err(anyhow::anyhow!("Failed to get robot call data: 500")));
        let poller = poller(&domain);
        let (tx, _rx) = mpsc::channel(4);
        let handle = OrchestratorHandle::new(tx);

        assert!(poller.poll(Mode::Idle, &handle).await.is_err());
        assert_eq!(poller.poll(Mode::Idle, &handle).await.unwrap(), PollOutcome::NoCall);
        assert_eq!(domain.robot_call_reads(), 2);
    }

    #[tokio::test]
    async fn loads_product_catalog() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"products": [
                {{"name": "Oat Milk", "id": "p-1", "pose": {{"x": 4.0, "y": 2.0}}}}
            ]}}"#
        )
        .unwrap();

        let products = load_products(file.path()).await.unwrap();
        assert_eq!(products, vec![product("Oat Milk", "p-1")]);
    }
}
