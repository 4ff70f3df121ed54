//! Top-level state machine arbitrating patrol, user navigation, battery
//! returns and the inactivity timer.
//!
//! All decisions are taken under one `OrchestrationState` lock that is never
//! held across an `.await`. Every motion owns a [`CancelToken`]; results that
//! arrive after the token was cancelled are dropped, so a superseded motion
//! can never write stale state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::auth::AuthSession;
use crate::battery::{BatteryAction, BatteryGuard};
use crate::cancel::CancelToken;
use crate::command::{Command, OrchestratorEvent, OrchestratorHandle};
use crate::config::OrchestratorConfig;
use crate::domain::DomainClient;
use crate::error::{is_token_error, ErrorKind, OrchestratorError};
use crate::identity::IdentityStore;
use crate::navigation::{NavigationController, RecoveryAction, RecoveryPlan, SpeedProfile};
use crate::patrol::PatrolScheduler;
use crate::robot::{PowerStatus, RobotBase};
use crate::robot_call::RobotCallPoller;
use crate::state::{Mode, OrchestrationState, StateSnapshot, Target, Waypoint};
use crate::telemetry::TelemetryUploader;
use crate::timer::{spawn_ticker, InactivityTimer};


const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;
/// Replays of one request after a token refresh.
const MAX_TOKEN_REPLAYS: u32 = 3;

/// Why the robot is being sent back to the product list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnReason {
    User,
    Battery,
    Recovery,
    Arrival,
    PromotionStopped,
}

struct Inner {
    config: OrchestratorConfig,
    state: Mutex<OrchestrationState>,
    robot: Arc<dyn RobotBase>,
    auth: Arc<AuthSession>,
    navigation: NavigationController,
    patrol: PatrolScheduler,
    telemetry: Arc<TelemetryUploader>,
    battery: BatteryGuard,
    robot_calls: Arc<RobotCallPoller>,
    inactivity: InactivityTimer,
    events: broadcast::Sender<OrchestratorEvent>,
    mode_tx: watch::Sender<Mode>,
    commands: mpsc::Sender<Command>,
    command_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    shutdown: CancelToken,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        robot: Arc<dyn RobotBase>,
        domain: Arc<dyn DomainClient>,
        identity: Arc<IdentityStore>,
        waypoints: Vec<Waypoint>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let (mode_tx, _) = watch::channel(Mode::Idle);

        let telemetry = Arc::new(TelemetryUploader::new(
            robot.clone(),
            domain.clone(),
            identity,
            config.telemetry_interval,
            config.telemetry_cooldown,
        ));
        let battery = BatteryGuard::new(
            robot.clone(),
            config.battery_poll_interval,
            config.low_battery_threshold,
        );
        let robot_calls = Arc::new(RobotCallPoller::new(
            domain.clone(),
            config.robot_call_cooldown,
        ));
        let inner = Inner {
            state: Mutex::new(OrchestrationState::default()),
            auth: Arc::new(AuthSession::new(domain)),
            navigation: NavigationController::new(robot.clone(), config.speeds),
            patrol: PatrolScheduler::new(waypoints),
            inactivity: InactivityTimer::new(commands.clone(), config.inactivity_timeout),
            robot,
            telemetry,
            battery,
            robot_calls,
            events,
            mode_tx,
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            shutdown: CancelToken::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OrchestrationState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle::new(self.inner.commands.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    pub fn mode_receiver(&self) -> watch::Receiver<Mode> {
        self.inner.mode_tx.subscribe()
    }

    pub fn auth(&self) -> Arc<AuthSession> {
        self.inner.auth.clone()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.lock().snapshot()
    }

    pub fn set_waypoints(&self, waypoints: Vec<Waypoint>) {
        info!("[PATROL] Loaded {} patrol points", waypoints.len());
        self.inner.patrol.set_waypoints(waypoints);
    }

    /// Products a remote robot call may name.
    pub fn set_products(&self, products: Vec<Target>) {
        self.inner.robot_calls.set_products(products);
    }

    /// Shows an error that did not come from a motion, e.g. a failed startup.
    pub fn report_error(&self, err: &OrchestratorError) {
        let mut state = self.lock();
        self.surface_error(&mut state, err);
    }

    fn transition(&self, state: &mut OrchestrationState, mode: Mode) {
        if state.mode == mode {
            return;
        }
        info!("Mode {:?} -> {:?}", state.mode, mode);
        state.mode = mode;
        self.inner.mode_tx.send_replace(mode);
        let _ = self.inner.events.send(OrchestratorEvent::ModeChanged(mode));
    }

    fn surface_error(&self, state: &mut OrchestrationState, err: &OrchestratorError) {
        let message = err.to_string();
        error!("{}", message);
        state.last_error = Some(message.clone());
        self.transition(state, Mode::Error);
        let _ = self.inner.events.send(OrchestratorEvent::Error(message));
    }

    /// Runs `f` under the state lock only if `token` still owns the state.
    fn commit<R>(
        &self,
        token: &CancelToken,
        f: impl FnOnce(&mut OrchestrationState) -> R,
    ) -> Option<R> {
        let mut state = self.lock();
        if token.is_cancelled() {
            debug!("Dropping result of a superseded motion");
            return None;
        }
        Some(f(&mut *state))
    }

    fn finish_motion(&self, token: &CancelToken) {
        let mut state = self.lock();
        if state.motion.as_ref().is_some_and(|m| m.same(token)) {
            state.motion = None;
        }
    }

    /// Installs a new motion token, cancelling the one it replaces.
    fn replace_motion(state: &mut OrchestrationState) -> (CancelToken, bool) {
        let had_previous = state.take_motion();
        let token = CancelToken::new();
        state.motion = Some(token.clone());
        (token, had_previous)
    }

    async fn stop_base(&self) {
        if let Err(e) = self.inner.navigation.stop().await {
            warn!("[NAV] {:#}", e);
        }
    }

    fn may_resume_promotion(&self, state: &OrchestrationState) -> bool {
        self.inner.config.auto_promotion
            && state.promotion_active
            && !state.promotion_cancelled
            && !state.returning_to_charger
    }

    fn arm_inactivity(&self, state: &OrchestrationState) {
        if self.may_resume_promotion(state) {
            self.inner.inactivity.start();
        }
    }

    /// Validates the session before a motion, refreshing once if needed.
    async fn auth_gate(&self) -> bool {
        if self.inner.auth.validate_token(false).await {
            return true;
        }
        warn!("[AUTH] Token invalid before motion, refreshing");
        self.inner.auth.refresh_token().await
    }

    /// Sends the robot to a user-selected target, preempting patrol.
    pub async fn select_target(&self, target: Target) {
        self.start_user_motion(Some(target)).await;
    }

    pub async fn request_go_home(&self) {
        self.start_user_motion(None).await;
    }

    async fn start_user_motion(&self, target: Option<Target>) {
        let (token, had_previous) = {
            let mut state = self.lock();
            if state.returning_to_charger {
                warn!("[BATTERY] Ignoring navigation request while returning to charger");
                return;
            }
            self.inner.inactivity.clear();
            // Suspend patrol but keep the promotion intent so inactivity can resume it.
            state.patrolling = false;
            state.recovery_attempts = 0;
            state.navigation_cancelled = false;
            state.last_error = None;
            state.target = target.clone();
            let motion = Self::replace_motion(&mut state);
            self.transition(&mut state, Mode::Navigating);
            motion
        };

        match &target {
            Some(target) => info!("[NAV] Navigating to {}", target.name),
            None => info!("[NAV] Navigating home"),
        }
        if had_previous {
            self.stop_base().await;
        }
        let profile = if target.is_some() {
            SpeedProfile::ProductSearch
        } else {
            SpeedProfile::Default
        };
        self.inner.navigation.set_speed(profile).await;

        let this = self.clone();
        tokio::spawn(async move { this.run_navigation(target, token).await });
    }

    async fn run_navigation(self, target: Option<Target>, token: CancelToken) {
        let mut token_replays = 0;
        loop {
            if !self.auth_gate().await {
                self.commit(&token, |state| {
                    self.surface_error(state, &OrchestratorError::session_expired())
                });
                break;
            }
            if token.is_cancelled() {
                break;
            }

            let result = match &target {
                Some(target) => self.inner.navigation.go_to(&target.pose).await,
                None => self.inner.navigation.go_home().await,
            };
            if token.is_cancelled() {
                break;
            }

            let message = match result {
                Ok(()) => {
                    self.on_arrival(&token, target.is_some()).await;
                    break;
                }
                Err(e) => format!("{:#}", e),
            };

            if is_token_error(&message) {
                if token_replays < MAX_TOKEN_REPLAYS && self.inner.auth.refresh_token().await {
                    token_replays += 1;
                    info!("[AUTH] Token refreshed, replaying navigation");
                    continue;
                }
                self.commit(&token, |state| {
                    self.surface_error(state, &OrchestratorError::session_expired())
                });
                break;
            }

            let kind = self.inner.navigation.classify_error(&message);
            self.inner.navigation.capture_diagnostics(&message, kind).await;

            let plan = self.commit(&token, |state| {
                NavigationController::begin_recovery(&mut state.recovery_attempts)
            });
            match plan {
                None => break,
                Some(RecoveryPlan::Exhausted) => {
                    self.commit(&token, |state| {
                        self.surface_error(
                            state,
                            &OrchestratorError::Navigation {
                                kind,
                                message: format!("{}. Please try again.", message),
                            },
                        )
                    });
                    break;
                }
                Some(RecoveryPlan::Attempt(attempt)) => {
                    info!("[NAV] Recovery attempt {} for {}", attempt, kind);
                }
            }

            match self
                .inner
                .navigation
                .recover(kind, target.is_some(), &token)
                .await
            {
                Ok(RecoveryAction::Retry) => continue,
                Ok(RecoveryAction::ReturnToList) => {
                    self.return_to_list(ReturnReason::Recovery, Some(&token))
                        .await;
                    break;
                }
                Ok(RecoveryAction::Cancelled) => break,
                Err(e) => {
                    warn!("[NAV] Recovery failed: {:#}", e);
                    self.commit(&token, |state| {
                        self.surface_error(
                            state,
                            &OrchestratorError::Navigation {
                                kind,
                                message: format!("{}. Recovery failed.", message),
                            },
                        )
                    });
                    break;
                }
            }
        }
        self.finish_motion(&token);
    }

    async fn on_arrival(&self, token: &CancelToken, had_target: bool) {
        let arrived = self.commit(token, |state| {
            state.recovery_attempts = 0;
            if had_target {
                self.transition(state, Mode::Arrived);
            } else {
                state.target = None;
                self.transition(state, Mode::Idle);
            }
            self.arm_inactivity(state);
        });
        if arrived.is_none() || !had_target {
            return;
        }

        info!("[NAV] Arrived at target");
        if token.sleep(self.inner.config.arrival_dwell).await {
            self.return_to_list(ReturnReason::Arrival, Some(token)).await;
        }
    }

    /// Abandons the current motion and returns to the product list. During a
    /// charger return the robot keeps heading for the dock instead.
    ///
    /// With `owner` set, nothing happens unless that motion still owns the state.
    pub async fn return_to_list(&self, reason: ReturnReason, owner: Option<&CancelToken>) {
        let (returning, had_motion) = {
            let mut state = self.lock();
            if owner.is_some_and(CancelToken::is_cancelled) {
                return;
            }
            if state.returning_to_charger
                && reason != ReturnReason::Battery
                && state.motion.is_some()
            {
                info!("[BATTERY] Ignoring {:?} return while heading to charger", reason);
                return;
            }
            state.navigation_cancelled = true;
            state.recovery_attempts = 0;
            let had_motion = state.take_motion();
            (state.returning_to_charger, had_motion)
        };
        debug!("Returning to list ({:?})", reason);

        if returning {
            let token = {
                let mut state = self.lock();
                state.target = None;
                state.patrolling = false;
                state.last_error = None;
                let (token, _) = Self::replace_motion(&mut state);
                self.transition(&mut state, Mode::Navigating);
                token
            };
            if had_motion {
                self.stop_base().await;
            }
            self.inner.navigation.set_speed(SpeedProfile::Default).await;
            let this = self.clone();
            tokio::spawn(async move { this.return_to_charger(token).await });
            return;
        }

        {
            let mut state = self.lock();
            state.patrolling = false;
            state.target = None;
            state.last_error = None;
            self.transition(&mut state, Mode::Idle);
            self.arm_inactivity(&state);
        }
        self.stop_base().await;
    }

    async fn return_to_charger(self, token: CancelToken) {
        warn!("[BATTERY] Returning to charger");
        match self.inner.navigation.go_home().await {
            Ok(()) => match self.inner.robot.get_power_status().await {
                Ok(status) if status.on_dock() => {
                    self.commit(&token, |state| {
                        state.returning_to_charger = false;
                        info!("[BATTERY] Docked, charger return complete");
                        self.transition(state, Mode::Idle);
                    });
                }
                Ok(_) => info!("[BATTERY] Home reached, waiting for dock confirmation"),
                Err(e) => warn!("[BATTERY] Could not confirm docking: {:#}", e),
            },
            Err(e) => {
                let message = format!("{:#}", e);
                self.commit(&token, |state| {
                    self.surface_error(
                        state,
                        &OrchestratorError::Navigation {
                            kind: ErrorKind::classify(&message),
                            message: format!("{}. Could not return to charger.", message),
                        },
                    )
                });
            }
        }
        self.finish_motion(&token);
    }

    pub async fn request_cancel(&self) {
        info!("Cancel requested");
        self.return_to_list(ReturnReason::User, None).await;
    }

    pub async fn acknowledge_error(&self) {
        info!("Error acknowledged");
        self.return_to_list(ReturnReason::User, None).await;
    }

    /// Explicit promotion start: patrol from the first waypoint.
    pub async fn start_promotion(&self) {
        self.begin_patrol(true).await;
    }

    pub async fn stop_promotion(&self) {
        {
            let mut state = self.lock();
            self.inner.patrol.cancel(&mut state, "stop_promotion");
        }
        self.inner.inactivity.clear();
        self.return_to_list(ReturnReason::PromotionStopped, None)
            .await;
    }

    pub fn register_interaction(&self) {
        let state = self.lock();
        if self.may_resume_promotion(&state) {
            debug!("[PATROL] User interaction, restarting inactivity timer");
            self.inner.inactivity.start();
        }
    }

    pub async fn on_inactivity_expired(&self, generation: u64) {
        if !self.inner.inactivity.is_current(generation) {
            debug!("[PATROL] Ignoring stale inactivity expiry");
            return;
        }
        let eligible = {
            let state = self.lock();
            matches!(state.mode, Mode::Idle | Mode::Arrived) && self.may_resume_promotion(&state)
        };
        if eligible {
            info!("[PATROL] Inactivity timeout, resuming patrol");
            self.begin_patrol(false).await;
        }
    }

    async fn begin_patrol(&self, fresh: bool) {
        self.inner.inactivity.clear();
        let (token, had_previous) = {
            let mut state = self.lock();
            if state.returning_to_charger {
                warn!("[PATROL] Not starting patrol while returning to charger");
                return;
            }
            if let Err(e) = self.inner.patrol.start(&mut state, fresh) {
                self.surface_error(&mut state, &e);
                return;
            }
            state.target = None;
            state.recovery_attempts = 0;
            state.last_error = None;
            let motion = Self::replace_motion(&mut state);
            self.transition(&mut state, Mode::Patrol);
            motion
        };

        if had_previous {
            self.stop_base().await;
        }
        self.inner.navigation.set_speed(SpeedProfile::Patrol).await;

        let this = self.clone();
        tokio::spawn(async move { this.run_patrol(token).await });
    }

    async fn run_patrol(self, token: CancelToken) {
        let mut token_replays = 0;
        loop {
            let waypoint = self.commit(&token, |state| {
                if PatrolScheduler::is_live(state) {
                    self.inner.patrol.current_waypoint(state)
                } else {
                    None
                }
            });
            let Some(Some(waypoint)) = waypoint else {
                break;
            };

            if !self.auth_gate().await {
                self.commit(&token, |state| {
                    state.patrolling = false;
                    self.surface_error(state, &OrchestratorError::session_expired())
                });
                break;
            }
            if token.is_cancelled() {
                break;
            }

            info!("[PATROL] Heading to {}", waypoint.name);
            let result = self.inner.navigation.go_to_waypoint(&waypoint).await;

            if let Err(e) = &result {
                if is_token_error(&format!("{:#}", e)) {
                    if token_replays < MAX_TOKEN_REPLAYS && self.inner.auth.refresh_token().await {
                        token_replays += 1;
                        info!("[AUTH] Token refreshed, replaying leg to {}", waypoint.name);
                        continue;
                    }
                    self.commit(&token, |state| {
                        if PatrolScheduler::is_live(state) {
                            state.patrolling = false;
                            self.surface_error(state, &OrchestratorError::session_expired());
                        }
                    });
                    break;
                }
            }

            let keep_going = self.commit(&token, |state| {
                if !PatrolScheduler::is_live(state) {
                    return false;
                }
                match &result {
                    Ok(()) => {
                        token_replays = 0;
                        self.inner.patrol.advance(state);
                        true
                    }
                    Err(e) => {
                        let message = format!("{:#}", e);
                        state.patrolling = false;
                        self.surface_error(
                            state,
                            &OrchestratorError::Navigation {
                                kind: ErrorKind::classify(&message),
                                message: format!("{}. Please try again.", message),
                            },
                        );
                        false
                    }
                }
            });
            if keep_going != Some(true) {
                break;
            }
        }
        self.finish_motion(&token);
    }

    /// Records a power reading and starts or completes a charger return.
    pub async fn handle_power_status(&self, status: PowerStatus) {
        let action = {
            let mut state = self.lock();
            state.battery_percentage = Some(status.battery_percentage);
            let action = self
                .inner
                .battery
                .assess(&status, state.returning_to_charger);
            match action {
                BatteryAction::ReturnToCharger => {
                    state.returning_to_charger = true;
                    self.inner.patrol.cancel(&mut state, "battery_return");
                }
                BatteryAction::Docked => {
                    state.returning_to_charger = false;
                    state.take_motion();
                    state.target = None;
                    info!("[BATTERY] On dock, charger return complete");
                    self.transition(&mut state, Mode::Idle);
                }
                BatteryAction::None => {}
            }
            action
        };
        let _ = self
            .inner
            .events
            .send(OrchestratorEvent::BatteryLevel(status.battery_percentage));

        if action == BatteryAction::ReturnToCharger {
            warn!(
                "[BATTERY] Battery at {}%, returning to charger",
                status.battery_percentage
            );
            self.inner.inactivity.clear();
            self.return_to_list(ReturnReason::Battery, None).await;
        }
    }

    async fn dispatch(&self, command: Command) {
        match command {
            Command::SelectTarget(target) => self.select_target(target).await,
            Command::GoHome => self.request_go_home().await,
            Command::Cancel => self.request_cancel().await,
            Command::Acknowledge => self.acknowledge_error().await,
            Command::StartPromotion => self.start_promotion().await,
            Command::StopPromotion => self.stop_promotion().await,
            Command::UserInteraction => self.register_interaction(),
            Command::InactivityExpired(generation) => self.on_inactivity_expired(generation).await,
            Command::PowerStatus(status) => self.handle_power_status(status).await,
        }
    }

    /// Starts the background monitors and processes commands until `stop`.
    pub async fn run(&self) -> Result<()> {
        let mut commands = self
            .inner
            .command_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("Orchestrator is already running")?;
        let shutdown = self.inner.shutdown.clone();
        let config = &self.inner.config;

        let battery = {
            let this = self.clone();
            let handle = self.handle();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.inner.battery.run(handle, shutdown).await })
        };
        let telemetry = tokio::spawn(
            self.inner
                .telemetry
                .clone()
                .run(self.mode_receiver(), shutdown.clone()),
        );
        let validation = {
            let auth = self.inner.auth.clone();
            spawn_ticker(
                "token-validation",
                config.token_validation_interval,
                shutdown.clone(),
                move || {
                    let auth = auth.clone();
                    async move {
                        if !auth.validate_token(false).await {
                            warn!("[AUTH] Periodic validation found an invalid token");
                        }
                    }
                },
            )
        };
        let refresh = {
            let auth = self.inner.auth.clone();
            spawn_ticker(
                "token-refresh",
                config.token_refresh_interval,
                shutdown.clone(),
                move || {
                    let auth = auth.clone();
                    async move {
                        if !auth.refresh_token().await {
                            warn!("[AUTH] Scheduled token refresh failed");
                        }
                    }
                },
            )
        };

        let robot_calls = {
            let poller = self.inner.robot_calls.clone();
            let mode = self.mode_receiver();
            let handle = self.handle();
            spawn_ticker(
                "robot-call",
                config.robot_call_interval,
                shutdown.clone(),
                move || {
                    let poller = poller.clone();
                    let handle = handle.clone();
                    let mode = *mode.borrow();
                    async move {
                        if let Err(e) = poller.poll(mode, &handle).await {
                            debug!("[CALL] Robot call poll failed: {:#}", e);
                        }
                    }
                },
            )
        };

        info!("Orchestrator running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => {
                        debug!("Command: {:?}", command);
                        self.dispatch(command).await;
                    }
                    None => break,
                },
            }
        }

        self.inner.inactivity.clear();
        self.lock().take_motion();
        // Monitors still blocked on a full queue fail their send instead of waiting.
        drop(commands);
        let _ = tokio::join!(battery, telemetry, validation, refresh, robot_calls);
        info!("Orchestrator stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }
}
