// outpost-core/src/runtime/hunts.rs
// ============================================================================
// Module: Outpost Hunt Dispatcher
// Description: Fleet-wide flow fan-out with admission control and ceilings.
// Purpose: Evaluate hunt rules against clients and spawn child flows.
// Dependencies: crate::core, crate::interfaces, crate::runtime::engine
// ============================================================================

//! ## Overview
//! The dispatcher evaluates each started hunt's rule set against clients at
//! hunt start, at agent poll time, and on periodic foreman scans. Admission
//! (client limit, per-minute throttle) is decided atomically in the store so
//! a hunt never fans out past its client limit under concurrent scheduling.
//! Child flows use the hunt id as their flow id, which deduplicates repeat
//! dispatch attempts by key.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use thiserror::Error;

use crate::core::client::Client;
use crate::core::hunt::ClientRuleSet;
use crate::core::hunt::Hunt;
use crate::core::hunt::HuntAdmissionDecision;
use crate::core::hunt::HuntState;
use crate::core::identifiers::ClientId;
use crate::core::identifiers::FlowId;
use crate::core::identifiers::FlowName;
use crate::core::identifiers::HuntId;
use crate::core::identifiers::Username;
use crate::core::payload::Payload;
use crate::core::time::DurationMicros;
use crate::interfaces::Clock;
use crate::interfaces::DataStore;
use crate::interfaces::IdGenerator;
use crate::interfaces::StoreError;
use crate::runtime::engine::EngineError;
use crate::runtime::engine::FlowEngine;
use crate::runtime::engine::StartFlowRequest;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Configuration for the hunt dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HuntDispatcherConfig {
    /// Throttle window backing the per-minute client rate.
    pub throttle_window: DurationMicros,
    /// Minimum interval between foreman checks for one client.
    pub foreman_check_interval: DurationMicros,
    /// Page size for full-fleet scans.
    pub scan_page_size: u64,
}

impl Default for HuntDispatcherConfig {
    fn default() -> Self {
        Self {
            throttle_window: DurationMicros::from_minutes(1),
            foreman_check_interval: DurationMicros::from_minutes(30),
            scan_page_size: 512,
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Hunt dispatcher errors.
#[derive(Debug, Error)]
pub enum HuntError {
    /// Data store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Child flow creation failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The hunt definition is invalid.
    #[error("invalid hunt: {0}")]
    InvalidHunt(String),
    /// The requested lifecycle transition is not allowed.
    #[error("invalid hunt transition: {0}")]
    InvalidTransition(String),
}

// ============================================================================
// SECTION: Create Request
// ============================================================================

/// Request to create a hunt.
#[derive(Debug, Clone)]
pub struct CreateHuntRequest {
    /// Creating username.
    pub creator: Username,
    /// Operator description.
    pub description: String,
    /// Flow class dispatched to each matching client.
    pub flow_name: FlowName,
    /// Flow class arguments template.
    pub flow_args: Payload,
    /// Client targeting rules.
    pub client_rule_set: ClientRuleSet,
    /// Maximum dispatches per minute; zero disables throttling.
    pub client_rate: u32,
    /// Maximum total clients.
    pub client_limit: u64,
    /// Maximum crashed clients before the hunt stops.
    pub crash_limit: u64,
    /// Maximum average CPU seconds per client; zero disables the ceiling.
    pub avg_cpu_seconds_per_client_limit: f64,
    /// Maximum average network bytes per client; zero disables the ceiling.
    pub avg_network_bytes_per_client_limit: u64,
    /// Maximum average results per client; zero disables the ceiling.
    pub avg_results_per_client_limit: u64,
}

// ============================================================================
// SECTION: Hunt Dispatcher
// ============================================================================

/// Fleet-wide flow fan-out with admission control and quota ceilings.
pub struct HuntDispatcher {
    /// Data store backend.
    store: Arc<dyn DataStore>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Identifier source for hunt ids.
    ids: Arc<dyn IdGenerator>,
    /// Flow engine used to instantiate child flows.
    engine: Arc<FlowEngine>,
    /// Dispatcher configuration.
    config: HuntDispatcherConfig,
}

impl HuntDispatcher {
    /// Creates a new hunt dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn DataStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        engine: Arc<FlowEngine>,
        config: HuntDispatcherConfig,
    ) -> Self {
        Self { store, clock, ids, engine, config }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Creates a hunt in the paused state.
    ///
    /// # Errors
    ///
    /// Returns [`HuntError::InvalidHunt`] when the flow class is unknown.
    pub fn create_hunt(&self, request: CreateHuntRequest) -> Result<Hunt, HuntError> {
        if !self.engine.registry().contains(request.flow_name.as_str()) {
            return Err(HuntError::InvalidHunt(format!(
                "unknown flow class: {}",
                request.flow_name
            )));
        }
        let now = self.clock.now();
        let hunt = Hunt {
            hunt_id: HuntId::from_raw(self.ids.next_id()),
            creator: request.creator,
            description: request.description,
            flow_name: request.flow_name,
            flow_args: request.flow_args,
            client_rule_set: request.client_rule_set,
            client_rate: request.client_rate,
            client_limit: request.client_limit,
            crash_limit: request.crash_limit,
            avg_cpu_seconds_per_client_limit: request.avg_cpu_seconds_per_client_limit,
            avg_network_bytes_per_client_limit: request.avg_network_bytes_per_client_limit,
            avg_results_per_client_limit: request.avg_results_per_client_limit,
            created_at: now,
            state: HuntState::Paused,
            num_clients: 0,
            num_successful: 0,
            num_failed: 0,
            num_crashed: 0,
            num_results: 0,
            total_cpu_seconds: 0.0,
            total_network_bytes: 0,
            throttle_window_start: now,
            dispatches_this_window: 0,
        };
        self.store.write_hunt(&hunt)?;
        Ok(hunt)
    }

    /// Starts a paused hunt and runs an initial full-fleet scan.
    ///
    /// # Errors
    ///
    /// Returns [`HuntError::InvalidTransition`] when the hunt is not paused.
    pub fn start_hunt(&self, hunt_id: HuntId) -> Result<(), HuntError> {
        let hunt = self.store.read_hunt(hunt_id)?;
        if hunt.state != HuntState::Paused {
            return Err(HuntError::InvalidTransition(format!(
                "hunt {hunt_id} is {:?}, expected paused",
                hunt.state
            )));
        }
        self.store.set_hunt_state(hunt_id, HuntState::Started)?;
        self.scan_fleet_for_hunt(hunt_id)?;
        Ok(())
    }

    /// Stops a hunt; already-dispatched child flows continue.
    ///
    /// # Errors
    ///
    /// Returns [`HuntError`] when the hunt does not exist.
    pub fn stop_hunt(&self, hunt_id: HuntId) -> Result<(), HuntError> {
        self.store.read_hunt(hunt_id)?;
        self.store.set_hunt_state(hunt_id, HuntState::Stopped)?;
        Ok(())
    }

    /// Pauses a started hunt.
    ///
    /// # Errors
    ///
    /// Returns [`HuntError::InvalidTransition`] when the hunt is not started.
    pub fn pause_hunt(&self, hunt_id: HuntId) -> Result<(), HuntError> {
        let hunt = self.store.read_hunt(hunt_id)?;
        if hunt.state != HuntState::Started {
            return Err(HuntError::InvalidTransition(format!(
                "hunt {hunt_id} is {:?}, expected started",
                hunt.state
            )));
        }
        self.store.set_hunt_state(hunt_id, HuntState::Paused)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    /// Evaluates all started hunts against one client, typically at poll
    /// time, and stamps the client's foreman-check time.
    ///
    /// Returns the hunts dispatched to the client.
    ///
    /// # Errors
    ///
    /// Returns [`HuntError`] when the store fails.
    pub fn check_client(&self, client_id: ClientId) -> Result<Vec<HuntId>, HuntError> {
        let client = self.store.read_client(client_id)?;
        let mut dispatched = Vec::new();
        let mut offset = 0;
        loop {
            let hunts = self.store.list_hunts(offset, self.config.scan_page_size)?;
            if hunts.is_empty() {
                break;
            }
            offset += hunts.len() as u64;
            for hunt in hunts {
                if hunt.state.can_dispatch() && self.dispatch_to_client(&hunt, &client)? {
                    dispatched.push(hunt.hunt_id);
                }
            }
        }
        self.store.update_client_foreman_check(client_id, self.clock.now())?;
        Ok(dispatched)
    }

    /// Returns true when the client's foreman check is due.
    ///
    /// # Errors
    ///
    /// Returns [`HuntError`] when the client does not exist.
    pub fn foreman_check_due(&self, client_id: ClientId) -> Result<bool, HuntError> {
        let client = self.store.read_client(client_id)?;
        let now = self.clock.now();
        Ok(now.since(client.last_foreman_check) >= self.config.foreman_check_interval)
    }

    /// Scans the whole fleet for one hunt, dispatching to matching clients.
    ///
    /// # Errors
    ///
    /// Returns [`HuntError`] when the store fails.
    pub fn scan_fleet_for_hunt(&self, hunt_id: HuntId) -> Result<u64, HuntError> {
        let mut dispatched = 0;
        let mut offset = 0;
        loop {
            let clients = self.store.list_clients(offset, self.config.scan_page_size)?;
            if clients.is_empty() {
                return Ok(dispatched);
            }
            offset += clients.len() as u64;
            for client in clients {
                let hunt = self.store.read_hunt(hunt_id)?;
                if !hunt.state.can_dispatch() {
                    return Ok(dispatched);
                }
                if self.dispatch_to_client(&hunt, &client)? {
                    dispatched += 1;
                }
            }
        }
    }

    /// Attempts to dispatch one hunt to one client.
    ///
    /// Returns true when a child flow was created.
    ///
    /// # Errors
    ///
    /// Returns [`HuntError`] when the store fails; a concurrent duplicate
    /// dispatch is treated as not-dispatched rather than an error.
    pub fn dispatch_to_client(&self, hunt: &Hunt, client: &Client) -> Result<bool, HuntError> {
        let now = self.clock.now();
        if !hunt.state.can_dispatch() || !hunt.client_rule_set.matches(client, now) {
            return Ok(false);
        }
        let child_flow_id = FlowId::from_raw(hunt.hunt_id.as_raw());
        match self.store.read_flow(client.client_id, child_flow_id) {
            Ok(_) => return Ok(false),
            Err(StoreError::UnknownFlow { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let admission =
            self.store.record_hunt_dispatch(hunt.hunt_id, now, self.config.throttle_window)?;
        match admission.decision {
            HuntAdmissionDecision::Admitted => {}
            HuntAdmissionDecision::LimitReached => {
                self.store.set_hunt_state(hunt.hunt_id, HuntState::Completed)?;
                return Ok(false);
            }
            HuntAdmissionDecision::Throttled | HuntAdmissionDecision::NotRunning => {
                return Ok(false);
            }
        }

        let start = StartFlowRequest {
            client_id: client.client_id,
            flow_name: hunt.flow_name.clone(),
            args: hunt.flow_args.clone(),
            creator: hunt.creator.clone(),
            cpu_limit_seconds: hunt.avg_cpu_seconds_per_client_limit,
            network_bytes_limit: hunt.avg_network_bytes_per_client_limit,
            flow_id: Some(child_flow_id),
            parent_hunt_id: Some(hunt.hunt_id),
        };
        match self.engine.start_flow(start) {
            Ok(_) => Ok(true),
            Err(EngineError::Store(StoreError::DuplicateKey(_))) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Ceilings
    // ------------------------------------------------------------------

    /// Re-evaluates a hunt's ceilings, stopping the hunt on breach.
    ///
    /// Called after every counter update driven by a terminal child flow.
    /// Returns the breached ceiling, when any.
    ///
    /// # Errors
    ///
    /// Returns [`HuntError`] when the hunt does not exist.
    pub fn enforce_ceilings(&self, hunt_id: HuntId) -> Result<Option<&'static str>, HuntError> {
        let hunt = self.store.read_hunt(hunt_id)?;
        if matches!(hunt.state, HuntState::Stopped) {
            return Ok(None);
        }
        if let Some(reason) = hunt.breached_ceiling() {
            self.store.set_hunt_state(hunt_id, HuntState::Stopped)?;
            return Ok(Some(reason));
        }
        Ok(None)
    }
}
