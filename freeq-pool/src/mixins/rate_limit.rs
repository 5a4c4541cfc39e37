//! Limits how many connections may run their connect sequence at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::client::ChatClient;
use crate::config::ConnectionRateLimits;
use crate::connection::Connection;
use crate::mixin::{ClientMixin, ConnectionMixin};

/// Shared admission gate for connect sequences.
#[derive(Clone, Debug)]
pub struct ConnectGate {
    semaphore: Arc<Semaphore>,
    hold: Duration,
}

impl ConnectGate {
    /// `parallel` slots; each is held `hold` longer than its permit lives.
    pub fn new(parallel: usize, hold: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(parallel)),
            hold,
        }
    }

    pub async fn acquire(&self) -> GatePermit {
        // The semaphore is never closed, so acquiring cannot fail.
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        GatePermit {
            permit,
            hold: self.hold,
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A taken slot. Dropping it frees the slot after the gate's hold time.
#[derive(Debug)]
pub struct GatePermit {
    permit: Option<OwnedSemaphorePermit>,
    hold: Duration,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if self.hold.is_zero() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let hold = self.hold;
            handle.spawn(async move {
                tokio::time::sleep(hold).await;
                drop(permit);
            });
        }
    }
}

/// Client mixin that puts one [`ConnectGate`] in front of every connection.
pub struct ConnectionRateLimiter {
    gate: ConnectGate,
}

impl ConnectionRateLimiter {
    pub fn new(limits: &ConnectionRateLimits) -> Self {
        Self {
            gate: ConnectGate::new(
                limits.parallel_connections,
                Duration::from_millis(limits.release_time_ms),
            ),
        }
    }

    pub fn gate(&self) -> &ConnectGate {
        &self.gate
    }
}

impl ClientMixin for ConnectionRateLimiter {
    fn apply_to_client(self: Arc<Self>, client: &ChatClient) {
        client.add_connection_mixin(self);
    }
}

impl ConnectionMixin for ConnectionRateLimiter {
    fn apply_to_connection(self: Arc<Self>, conn: &Arc<Connection>) {
        conn.add_connect_gate(self.gate.clone());
    }
}
