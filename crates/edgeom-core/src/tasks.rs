// ── Per-connection task group ──
//
// Everything a live session runs: periodic pushers, the outbox drains and
// the inbound dispatcher. All of them hang off one child token of the
// attempt scope, so cancelling the attempt stops the whole group.

use std::sync::Arc;
use std::time::Duration;

use edgeom_api::{Envelope, SessionReceiver, SessionSender};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ActiveConnection;
use crate::dispatch::TokenBucket;
use crate::outbox::Outbox;
use crate::services::Services;
use crate::state::ConnectionStatus;

pub const KEEPALIVE: &str = "websocket/keepalive";
pub const SYS_INFO: &str = "websocket/sys_info";
pub const SYS_STATUS: &str = "websocket/sys_status";

/// Why the group stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEnd {
    /// The attempt scope was cancelled.
    Cancelled,
    /// The session went away underneath us.
    TransportClosed,
}

/// Send one envelope. `false` means the session is gone.
async fn push(sender: &SessionSender, envelope: &Envelope, task: &'static str) -> bool {
    match sender.send(envelope).await {
        Ok(()) => true,
        Err(e) if sender.is_open() => {
            warn!(task, error = %e, "send failed");
            true
        }
        Err(e) => {
            debug!(task, error = %e, "session closed");
            false
        }
    }
}

async fn periodic(
    sender: SessionSender,
    resource: &'static str,
    period: Duration,
    payload: impl Fn() -> Value + Send + 'static,
    cancel: CancellationToken,
) -> TaskEnd {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return TaskEnd::Cancelled,
            _ = interval.tick() => {
                if !push(&sender, &Envelope::new(resource, &payload()), resource).await {
                    return TaskEnd::TransportClosed;
                }
            }
        }
    }
}

async fn drain(
    sender: SessionSender,
    services: Arc<Services>,
    pick: fn(&Services) -> &Outbox,
    cancel: CancellationToken,
) -> TaskEnd {
    let outbox = pick(&services);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return TaskEnd::Cancelled,
            envelope = outbox.recv() => {
                let Some(envelope) = envelope else { return TaskEnd::Cancelled };
                if !push(&sender, &envelope, outbox.name()).await {
                    outbox.requeue(envelope);
                    return TaskEnd::TransportClosed;
                }
            }
        }
    }
}

async fn inbound(
    services: Arc<Services>,
    sender: SessionSender,
    mut receiver: SessionReceiver,
    cancel: CancellationToken,
) -> TaskEnd {
    let tasks = &services.settings.tasks;
    let mut bucket = TokenBucket::new(tasks.dispatch_rate_per_sec, tasks.dispatch_burst);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return TaskEnd::Cancelled,
            frame = receiver.recv() => {
                let Some(frame) = frame else { return TaskEnd::TransportClosed };
                bucket.take().await;
                services.dispatcher.dispatch(&frame, &sender).await;
            }
        }
    }
}

/// Run the task group of `conn` until `scope` is cancelled or the session
/// closes. Either way the session is released. On a transport close the
/// status also returns to `Connecting`, unless a newer connection already
/// replaced this one.
pub async fn run_task_group(
    services: Arc<Services>,
    conn: Arc<ActiveConnection>,
    receiver: SessionReceiver,
    scope: CancellationToken,
) -> TaskEnd {
    let group = scope.child_token();
    let closed = conn.sender().closed_token();
    let settings = services.settings.tasks.clone();
    let mut set: JoinSet<TaskEnd> = JoinSet::new();

    set.spawn(periodic(
        conn.sender().clone(),
        KEEPALIVE,
        settings.heartbeat,
        || serde_json::json!({ "keepalive": "ping" }),
        group.clone(),
    ));
    {
        let info = Arc::clone(&services.sysinfo);
        set.spawn(periodic(
            conn.sender().clone(),
            SYS_INFO,
            settings.sys_info,
            move || info.system_info(),
            group.clone(),
        ));
    }
    {
        let info = Arc::clone(&services.sysinfo);
        set.spawn(periodic(
            conn.sender().clone(),
            SYS_STATUS,
            settings.status,
            move || info.status(),
            group.clone(),
        ));
    }
    set.spawn(drain(conn.sender().clone(), Arc::clone(&services), |s| &s.outboxes.alarms, group.clone()));
    set.spawn(drain(conn.sender().clone(), Arc::clone(&services), |s| &s.outboxes.events, group.clone()));
    set.spawn(drain(conn.sender().clone(), Arc::clone(&services), |s| &s.outboxes.route, group.clone()));
    set.spawn(inbound(
        Arc::clone(&services),
        conn.sender().clone(),
        receiver,
        group.clone(),
    ));
    info!(id = conn.id(), tasks = set.len(), "connection tasks started");

    let end = tokio::select! {
        biased;
        () = scope.cancelled() => TaskEnd::Cancelled,
        () = closed.cancelled() => TaskEnd::TransportClosed,
        Some(joined) = set.join_next() => joined.unwrap_or(TaskEnd::TransportClosed),
    };

    group.cancel();
    while set.join_next().await.is_some() {}

    if end == TaskEnd::TransportClosed && services.ctx.mark_disconnected(conn.id()) {
        info!(id = conn.id(), "connection lost");
        services.status.transition_or_warn(ConnectionStatus::Connecting);
    } else {
        if end == TaskEnd::Cancelled {
            services.ctx.mark_disconnected(conn.id());
        }
        debug!(id = conn.id(), ?end, "connection tasks stopped");
    }
    end
}
