//! Connection supervisor.
//!
//! Owns the lifecycle of the store connection: bounded-retry establishment,
//! reconnection on transport errors, and graceful release on shutdown. The
//! supervisor is the only component that mutates connection state; callers
//! read and write through the shared store handle and report transport
//! errors as [`StoreEvent`]s on a channel the supervisor consumes.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_config::{BackoffMode, SupervisorConfig};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

/// Connection state, owned exclusively by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// The store is reachable.
    Connected,
    /// The retry budget is exhausted. Terminal.
    Failed,
}

/// Typed connection events consumed by the supervisor's state machine.
#[derive(Debug)]
pub enum StoreEvent {
    /// The store answered a health probe.
    Connected,
    /// A caller observed a transport error on the shared handle.
    Error(CacheError),
    /// The store connection was closed.
    Closed,
}

/// Establishes and releases the underlying store connection.
#[async_trait]
pub trait Connect: Send + Sync {
    /// Establishes (or verifies) the connection.
    async fn establish(&self) -> CacheResult<()>;

    /// Releases the connection handle.
    async fn release(&self);
}

/// Immutable reconnect budget, read once per retry cycle.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    /// Retries allowed after the initial attempt of an episode.
    pub max_retries: u32,
    /// Base delay between attempts.
    pub delay: Duration,
    /// Delay policy. Fixed by default; exponential is opt-in.
    pub backoff: BackoffMode,
}

impl RetryBudget {
    /// Builds a budget from supervisor configuration.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay(),
            backoff: config.backoff,
        }
    }

    /// Delay before the attempt following `attempt` failures.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffMode::Fixed => self.delay,
            BackoffMode::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(4);
                self.delay * factor
            }
        }
    }
}

/// Counts in-flight accessor operations so shutdown can drain them.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlightTracker {
    /// Creates an idle tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an operation; the guard deregisters it on drop.
    pub fn guard(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Number of operations currently in flight.
    pub fn active(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once no operations are in flight.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII registration of one in-flight operation.
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}

/// Requests a graceful supervisor shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signals the supervisor to drain and release the connection.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Handles returned alongside a supervisor for wiring into callers.
pub struct SupervisorHandle {
    /// Event channel for callers to report transport errors.
    pub events: mpsc::Sender<StoreEvent>,
    /// Graceful shutdown trigger.
    pub shutdown: ShutdownHandle,
    /// Observable connection state.
    pub state: watch::Receiver<ConnectionState>,
}

enum Episode {
    Connected { attempts: u32 },
    Interrupted,
}

/// Drives the connection state machine.
pub struct ConnectionSupervisor<C: Connect> {
    connector: C,
    budget: RetryBudget,
    grace: Duration,
    tracker: Arc<InFlightTracker>,
    events: mpsc::Receiver<StoreEvent>,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<C: Connect> ConnectionSupervisor<C> {
    /// Capacity of the event channel between callers and the supervisor.
    const EVENT_BUFFER: usize = 64;

    /// Creates a supervisor and the handles used to reach it.
    pub fn new(
        connector: C,
        budget: RetryBudget,
        grace: Duration,
        tracker: Arc<InFlightTracker>,
    ) -> (Self, SupervisorHandle) {
        let (events_tx, events_rx) = mpsc::channel(Self::EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let supervisor = Self {
            connector,
            budget,
            grace,
            tracker,
            events: events_rx,
            shutdown_rx,
            state_tx,
        };

        let handle = SupervisorHandle {
            events: events_tx,
            shutdown: ShutdownHandle { tx: shutdown_tx },
            state: state_rx,
        };

        (supervisor, handle)
    }

    /// Runs the state machine until shutdown or a fatal error.
    ///
    /// Returns `Err(CacheError::RetryBudgetExhausted)` exactly once when a
    /// connect episode runs out of budget; the caller owns the exit policy.
    pub async fn run(mut self) -> CacheResult<()> {
        match self.connect_episode().await? {
            Episode::Interrupted => {
                self.graceful_close().await;
                return Ok(());
            }
            Episode::Connected { attempts } => {
                debug!(attempts, "initial connection established");
                if self.discard_stale_errors() {
                    self.graceful_close().await;
                    return Ok(());
                }
            }
        }

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        self.graceful_close().await;
                        return Ok(());
                    }
                }
                event = self.events.recv() => match event {
                    Some(StoreEvent::Error(e)) => {
                        warn!(error = %e, "store transport error, reconnecting");
                        match self.connect_episode().await? {
                            Episode::Interrupted => {
                                self.graceful_close().await;
                                return Ok(());
                            }
                            Episode::Connected { attempts } => {
                                info!(attempts, "store connection recovered");
                                if self.discard_stale_errors() {
                                    self.graceful_close().await;
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Some(StoreEvent::Connected) => {
                        self.set_state(ConnectionState::Connected);
                    }
                    Some(StoreEvent::Closed) | None => {
                        self.graceful_close().await;
                        return Ok(());
                    }
                },
            }
        }
    }

    /// One connect episode: the initial attempt plus up to `max_retries`
    /// retries, each separated by the budget's delay. The attempt counter
    /// is fresh for every episode.
    async fn connect_episode(&mut self) -> CacheResult<Episode> {
        let attempts_allowed = self.budget.max_retries + 1;

        for attempt in 1..=attempts_allowed {
            self.set_state(ConnectionState::Connecting);

            match self.connector.establish().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    info!(attempt, "store connection established");
                    return Ok(Episode::Connected { attempts: attempt });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        remaining = attempts_allowed - attempt,
                        error = %e,
                        "store connect attempt failed"
                    );
                }
            }

            if attempt < attempts_allowed {
                let delay = self.budget.delay_for_attempt(attempt);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    changed = self.shutdown_rx.changed() => {
                        if changed.is_err() || *self.shutdown_rx.borrow() {
                            return Ok(Episode::Interrupted);
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Failed);
        error!(
            attempts = attempts_allowed,
            "retry budget exhausted, refusing to run without the cache tier"
        );
        Err(CacheError::RetryBudgetExhausted {
            attempts: attempts_allowed,
        })
    }

    /// Discards transport errors queued while an episode was already
    /// underway; each reflects the outage that episode just cleared.
    /// Returns true when a queued close request was found.
    fn discard_stale_errors(&mut self) -> bool {
        let mut stale = 0u32;
        loop {
            match self.events.try_recv() {
                Ok(StoreEvent::Error(_)) => stale += 1,
                Ok(StoreEvent::Connected) => {}
                Ok(StoreEvent::Closed) => return true,
                Err(_) => break,
            }
        }
        if stale > 0 {
            debug!(stale, "dropped stale transport errors after reconnect");
        }
        false
    }

    /// Drains in-flight operations within the grace period, then releases
    /// the connection handle.
    async fn graceful_close(&mut self) {
        info!("shutdown requested, draining in-flight operations");

        if tokio::time::timeout(self.grace, self.tracker.drained())
            .await
            .is_err()
        {
            warn!(
                active = self.tracker.active(),
                "grace period elapsed, abandoning in-flight operations"
            );
        }

        self.connector.release().await;
        self.set_state(ConnectionState::Disconnected);
        info!("store connection released");
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}
