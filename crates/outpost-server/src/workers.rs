// outpost-server/src/workers.rs
// ============================================================================
// Module: Server Workers
// Description: Flow-processing and message-handler worker threads.
// Purpose: Drain the processing queues by leasing store rows.
// Dependencies: outpost-core
// ============================================================================

//! ## Overview
//! Workers are plain threads sharing nothing but the data store: work is
//! claimed by leasing rows, so any worker (in any process) can pick up any
//! flow. A worker that dies mid-step leaves its leases to expire; the next
//! worker re-executes the step. Shutdown is cooperative through a flag.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use outpost_core::DataStore;
use outpost_core::DurationMicros;
use outpost_core::FlowEngine;
use outpost_core::HuntDispatcher;
use outpost_core::interfaces::Clock;

use crate::audit::AuditEvent;
use crate::audit::AuditOutcome;
use crate::audit::AuditSink;
use crate::handlers::HandlerRegistry;
use crate::handlers::MessageHandler;
use crate::telemetry::ServerMetricEvent;
use crate::telemetry::ServerMetrics;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Lease duration for message handler requests.
const HANDLER_LEASE: DurationMicros = DurationMicros::from_secs(300);
/// Handler requests leased per pass.
const HANDLER_BATCH: u64 = 64;

// ============================================================================
// SECTION: Worker Pool
// ============================================================================

/// Handle over the spawned worker threads.
pub struct WorkerPool {
    /// Cooperative shutdown flag.
    shutdown: Arc<AtomicBool>,
    /// Joinable worker threads.
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` flow workers plus one handler worker.
    #[must_use]
    #[expect(clippy::too_many_arguments, reason = "explicit wiring over a context grab-bag")]
    pub fn spawn(
        engine: Arc<FlowEngine>,
        dispatcher: Arc<HuntDispatcher>,
        store: Arc<dyn DataStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<HandlerRegistry>,
        metrics: Arc<dyn ServerMetrics>,
        audit: Arc<dyn AuditSink>,
        worker_count: u32,
        poll_interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        for index in 0..worker_count {
            let engine = Arc::clone(&engine);
            let dispatcher = Arc::clone(&dispatcher);
            let metrics = Arc::clone(&metrics);
            let shutdown = Arc::clone(&shutdown);
            let name = format!("flow-worker-{index}");
            let worker_name = name.clone();
            let handle = thread::Builder::new().name(name).spawn(move || {
                flow_worker_loop(&engine, &dispatcher, &metrics, &shutdown, &worker_name, poll_interval);
            });
            if let Ok(handle) = handle {
                threads.push(handle);
            }
        }

        {
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new().name("handler-worker".to_string()).spawn(move || {
                handler_worker_loop(
                    &store,
                    &clock,
                    &registry,
                    &metrics,
                    &audit,
                    &shutdown,
                    poll_interval,
                );
            });
            if let Ok(handle) = handle {
                threads.push(handle);
            }
        }

        Self { shutdown, threads }
    }

    /// Signals shutdown and joins all workers.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// SECTION: Flow Worker
// ============================================================================

/// Drains the flow-processing queue until shutdown.
fn flow_worker_loop(
    engine: &FlowEngine,
    dispatcher: &HuntDispatcher,
    metrics: &Arc<dyn ServerMetrics>,
    shutdown: &AtomicBool,
    worker_name: &str,
    poll_interval: Duration,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let outcomes = match engine.process_queue_once(worker_name) {
            Ok(outcomes) => outcomes,
            Err(_) => {
                thread::sleep(poll_interval);
                continue;
            }
        };
        if outcomes.is_empty() {
            thread::sleep(poll_interval);
            continue;
        }
        for outcome in outcomes {
            if let Ok(Some(hunt_id)) = outcome.result {
                metrics.increment(ServerMetricEvent::FlowCompleted);
                if let Ok(Some(_)) = dispatcher.enforce_ceilings(hunt_id) {
                    metrics.increment(ServerMetricEvent::HuntCeilingStop);
                }
            }
        }
    }
}

// ============================================================================
// SECTION: Handler Worker
// ============================================================================

/// Drains the well-known message handler queue until shutdown.
///
/// Requests are acknowledged even when their handler fails; the failure is
/// counted and written to the audit log so it never vanishes silently.
fn handler_worker_loop(
    store: &Arc<dyn DataStore>,
    clock: &Arc<dyn Clock>,
    registry: &HandlerRegistry,
    metrics: &Arc<dyn ServerMetrics>,
    audit: &Arc<dyn AuditSink>,
    shutdown: &AtomicBool,
    poll_interval: Duration,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let leased =
            match store.lease_message_handler_requests(clock.now(), HANDLER_LEASE, HANDLER_BATCH) {
                Ok(leased) => leased,
                Err(_) => {
                    thread::sleep(poll_interval);
                    continue;
                }
            };
        if leased.is_empty() {
            thread::sleep(poll_interval);
            continue;
        }
        let mut done: Vec<(String, u64)> = Vec::with_capacity(leased.len());
        for request in &leased {
            if let Some(handler) = registry.get(&request.handler_name)
                && let Err(err) = handler.handle(request)
            {
                metrics.increment(ServerMetricEvent::HandlerFailed);
                audit.record(&AuditEvent {
                    timestamp: clock.now(),
                    username: None,
                    action: format!("handler.{}", request.handler_name),
                    subject: Some(request.client_id.to_string()),
                    outcome: AuditOutcome::Failed,
                    detail: Some(err.to_string()),
                });
            }
            done.push((request.handler_name.clone(), request.request_id));
        }
        let _ = store.delete_message_handler_requests(&done);
    }
}
