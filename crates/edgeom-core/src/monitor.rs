// ── ConnectMonitor ──
//
// A periodic tick that decides whether the manager link needs a new
// attempt. At most one attempt is alive at a time: a new one is only
// spawned after the previous one's termination was confirmed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::attempt::{AttemptError, ConnectAttempt};
use crate::services::Services;
use crate::state::ConnectionStatus;

/// Outcome of the per-tick reconnect check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Reconnect,
    /// Credentials were rejected; stop retrying until the next switch.
    Halt,
}

struct RunningLoop {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct RunningAttempt {
    number: u64,
    scope: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    services: Arc<Services>,
    running: Mutex<Option<RunningLoop>>,
    attempt: Mutex<Option<RunningAttempt>>,
    generations: AtomicU64,
    attempts: AtomicU64,
}

/// Cloneable handle to the monitor.
#[derive(Clone)]
pub struct ConnectMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectMonitor")
            .field("running", &self.is_running())
            .field("attempts", &self.attempt_count())
            .finish_non_exhaustive()
    }
}

impl ConnectMonitor {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                running: Mutex::new(None),
                attempt: Mutex::new(None),
                generations: AtomicU64::new(0),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// The periodic tick is alive.
    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// An attempt task group is alive.
    pub fn attempt_alive(&self) -> bool {
        self.inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished())
    }

    /// Attempts started since construction.
    pub fn attempt_count(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    // ── Start / stop ─────────────────────────────────────────────────

    /// Start the periodic tick. A no-op when it already runs.
    ///
    /// Waits for the system-info gate first; when the gate stays closed
    /// the monitor starts anyway after logging a warning.
    pub async fn start(&self) {
        if self.is_running() {
            debug!("connect monitor already running");
            return;
        }
        self.wait_for_gate().await;

        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("connect monitor started concurrently");
            return;
        }
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.clone(), cancel.clone()));
        *running = Some(RunningLoop {
            generation,
            cancel,
            handle,
        });
        info!(generation, "connect monitor started");
    }

    async fn wait_for_gate(&self) {
        let settings = &self.inner.services.settings.monitor;
        for _ in 0..settings.gate_wait_rounds {
            if self.inner.services.sysinfo.collected() {
                return;
            }
            tokio::time::sleep(settings.gate_poll).await;
        }
        if !self.inner.services.sysinfo.collected() {
            warn!(
                rounds = settings.gate_wait_rounds,
                "system information not collected, starting monitor anyway"
            );
        }
    }

    /// Stop the tick and any live attempt. Safe to call repeatedly.
    ///
    /// The loop slot is released only once the loop task is confirmed
    /// finished (or aborted after `wait_max_cnt` polls).
    pub async fn stop(&self) {
        let generation = {
            let running = self
                .inner
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match running.as_ref() {
                Some(r) => {
                    r.cancel.cancel();
                    Some(r.generation)
                }
                None => None,
            }
        };

        if let Some(generation) = generation {
            let settings = &self.inner.services.settings.monitor;
            let mut confirmed = false;
            for _ in 0..settings.wait_max_cnt {
                if self.loop_finished(generation) {
                    confirmed = true;
                    break;
                }
                tokio::time::sleep(settings.stop_poll).await;
            }

            let mut running = self
                .inner
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if running.as_ref().is_some_and(|r| r.generation == generation) {
                if let Some(r) = running.take() {
                    if !confirmed && !r.handle.is_finished() {
                        warn!(generation, "monitor loop did not stop in time, aborting");
                        r.handle.abort();
                    }
                }
            }
            info!(generation, "connect monitor stopped");
        }

        self.stop_attempt().await;
    }

    fn loop_finished(&self, generation: u64) -> bool {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|r| r.generation != generation || r.handle.is_finished())
    }

    /// Cancel the live attempt and wait for its task to end.
    async fn stop_attempt(&self) {
        let number = {
            let attempt = self
                .inner
                .attempt
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match attempt.as_ref() {
                Some(a) => {
                    a.scope.cancel();
                    a.number
                }
                None => return,
            }
        };

        let settings = &self.inner.services.settings.monitor;
        for _ in 0..settings.wait_max_cnt {
            if !self.attempt_alive() {
                break;
            }
            tokio::time::sleep(settings.stop_poll).await;
        }

        let mut attempt = self
            .inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(a) = attempt.take() {
            if !a.handle.is_finished() {
                warn!(attempt = number, "attempt did not stop in time, aborting");
                a.handle.abort();
            }
        }
        debug!(attempt = number, "attempt stopped");
    }

    fn spawn_attempt(&self, halt: CancellationToken) {
        let number = self.inner.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let scope = CancellationToken::new();
        let attempt = ConnectAttempt::new(Arc::clone(&self.inner.services), halt, number);
        let handle = tokio::spawn({
            let scope = scope.clone();
            async move {
                if let Err(AttemptError::SpareNodeDetected(node_id)) = attempt.run(scope).await {
                    info!(attempt = number, %node_id, "node id corrected, next tick reconnects");
                }
            }
        });
        *self
            .inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(RunningAttempt {
            number,
            scope,
            handle,
        });
    }

    // ── Tick ─────────────────────────────────────────────────────────

    /// Whether the link needs a new attempt.
    pub fn need_reconnect(&self) -> Decision {
        let s = &self.inner.services;
        let config = match s.net.load() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "network config unreadable, reconnecting");
                return Decision::Reconnect;
            }
        };
        if !config.is_fusion_director() {
            return Decision::Skip;
        }
        if !self.attempt_alive() {
            return Decision::Reconnect;
        }
        if s.ctx.ready_for_send() {
            return Decision::Skip;
        }
        if s.ctx.signals().credentials_rejected() {
            return Decision::Halt;
        }
        let Some(conn) = s.ctx.current().filter(|c| c.is_marked_connected()) else {
            return Decision::Reconnect;
        };
        if matches!(
            config.status,
            Some(ConnectionStatus::Ready | ConnectionStatus::Connecting)
        ) {
            return Decision::Skip;
        }
        if config.server_name.is_empty() {
            return Decision::Skip;
        }
        match s.hosts.lookup(&config.server_name) {
            Ok(Some(ip)) if ip.to_string() == conn.ip() => Decision::Skip,
            Ok(_) => Decision::Reconnect,
            Err(e) => {
                warn!(error = %e, "hosts file unreadable, reconnecting");
                Decision::Reconnect
            }
        }
    }

    async fn tick(&self, loop_cancel: &CancellationToken) {
        match self.need_reconnect() {
            Decision::Skip => trace!("no reconnect needed"),
            Decision::Halt => {
                warn!("manager rejected the credentials, stopping reconnects");
                self.inner
                    .services
                    .status
                    .transition_or_warn(ConnectionStatus::ErrConfigured);
                loop_cancel.cancel();
                self.stop_attempt().await;
                self.inner.services.mef.stop_connect_timer().await;
            }
            Decision::Reconnect => {
                self.inner
                    .services
                    .status
                    .transition_or_warn(ConnectionStatus::Connecting);
                self.stop_attempt().await;
                self.spawn_attempt(loop_cancel.clone());
            }
        }
    }
}

async fn run_loop(monitor: ConnectMonitor, cancel: CancellationToken) {
    let period = monitor.inner.services.settings.monitor.retry_interval;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => monitor.tick(&cancel).await,
        }
    }
    debug!("monitor loop exited");
}
