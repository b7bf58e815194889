// =============================================================================
// Broadcast Sink — bounded, authenticated WebSocket fan-out
// =============================================================================
//
// Two client sets back the `/ws/market` and `/ws/signals` endpoints. Fan-out
// discipline:
//
//   - Iteration takes a snapshot of the client set under a short critical
//     section; concurrent connects/disconnects cannot invalidate iteration.
//   - Per-client sends have a hard timeout; a slow or dead client is removed
//     from the set and its transport closed (dropping the outbound channel).
//   - Sends run in batches of `batch_size` concurrent pushes.
//   - A "ping" text frame goes out every ping interval; clients that miss
//     the pong deadline are evicted.
//
// The set never holds its lock across an await.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::runtime_config::BroadcastParams;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Message envelope sent to every client.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: serde_json::Value,
    pub ts: i64,
}

impl Envelope {
    pub fn new(kind: &'static str, data: serde_json::Value) -> Self {
        Self { kind, data, ts: Utc::now().timestamp_millis() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ---------------------------------------------------------------------------
// Client set
// ---------------------------------------------------------------------------

struct ClientHandle {
    tx: mpsc::Sender<String>,
    last_pong: Instant,
}

/// One authenticated WS client population with snapshot-based fan-out.
pub struct ClientSet {
    name: &'static str,
    params: BroadcastParams,
    clients: RwLock<HashMap<Uuid, ClientHandle>>,
}

/// Why `add_client` refused a connection.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    #[error("client set full")]
    Full,
}

impl ClientSet {
    pub fn new(name: &'static str, params: BroadcastParams) -> Self {
        Self { name, params, clients: RwLock::new(HashMap::new()) }
    }

    /// Register an authenticated client. The returned receiver is drained by
    /// the connection's writer task; dropping it closes the transport.
    pub fn add_client(&self) -> Result<(Uuid, mpsc::Receiver<String>), AdmitError> {
        let mut clients = self.clients.write();
        if clients.len() >= self.params.max_clients {
            warn!(set = self.name, cap = self.params.max_clients, "client set full — rejecting");
            return Err(AdmitError::Full);
        }

        let id = Uuid::new_v4();
        // Small buffer: a client that cannot drain a handful of messages
        // within the send timeout is considered unhealthy.
        let (tx, rx) = mpsc::channel(32);
        clients.insert(id, ClientHandle { tx, last_pong: Instant::now() });
        info!(set = self.name, client = %id, total = clients.len(), "ws client added");
        Ok((id, rx))
    }

    pub fn remove_client(&self, id: &Uuid) {
        if self.clients.write().remove(id).is_some() {
            info!(set = self.name, client = %id, "ws client removed");
        }
    }

    pub fn record_pong(&self, id: &Uuid) {
        if let Some(client) = self.clients.write().get_mut(id) {
            client.last_pong = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Fan one payload out to every client. Slow clients are evicted; healthy
    /// clients are unaffected. Returns the number of successful sends.
    pub async fn broadcast(&self, payload: String) -> usize {
        // Snapshot under a short critical section.
        let snapshot: Vec<(Uuid, mpsc::Sender<String>)> = self
            .clients
            .read()
            .iter()
            .map(|(id, c)| (*id, c.tx.clone()))
            .collect();

        if snapshot.is_empty() {
            return 0;
        }

        let timeout = Duration::from_secs(self.params.send_timeout_secs);
        let mut sent = 0;
        let mut dead: Vec<Uuid> = Vec::new();

        for batch in snapshot.chunks(self.params.batch_size.max(1)) {
            let results = futures_util::future::join_all(batch.iter().map(|(id, tx)| {
                let payload = payload.clone();
                async move {
                    match tx.send_timeout(payload, timeout).await {
                        Ok(()) => (*id, true),
                        Err(_) => (*id, false),
                    }
                }
            }))
            .await;

            for (id, ok) in results {
                if ok {
                    sent += 1;
                } else {
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write();
            for id in &dead {
                clients.remove(id);
                warn!(set = self.name, client = %id, "ws client evicted (send timeout)");
            }
        }

        sent
    }

    /// Broadcast the literal heartbeat frame and evict clients whose pong is
    /// older than the pong timeout.
    pub async fn heartbeat(&self) {
        let deadline = Duration::from_secs(self.params.pong_timeout_secs);
        let stale: Vec<Uuid> = self
            .clients
            .read()
            .iter()
            .filter(|(_, c)| c.last_pong.elapsed() > deadline)
            .map(|(id, _)| *id)
            .collect();

        if !stale.is_empty() {
            let mut clients = self.clients.write();
            for id in &stale {
                clients.remove(id);
                warn!(set = self.name, client = %id, "ws client evicted (pong timeout)");
            }
        }

        // The heartbeat is the literal string "ping", not an envelope.
        self.broadcast("ping".to_string()).await;
    }
}

impl std::fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSet")
            .field("name", &self.name)
            .field("clients", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// The two endpoint populations plus convenience emitters.
pub struct BroadcastSink {
    pub market: ClientSet,
    pub signals: ClientSet,
}

impl BroadcastSink {
    pub fn new(params: &BroadcastParams) -> Self {
        Self {
            market: ClientSet::new("market", params.clone()),
            signals: ClientSet::new("signals", params.clone()),
        }
    }

    /// Price tick fan-out to `/ws/market`.
    pub async fn publish_prices(&self, data: serde_json::Value) {
        self.market.broadcast(Envelope::new("prices", data).to_json()).await;
    }

    pub async fn publish_position_update(&self, data: serde_json::Value) {
        self.market
            .broadcast(Envelope::new("position_update", data).to_json())
            .await;
    }

    pub async fn publish_balance_update(&self, data: serde_json::Value) {
        self.market
            .broadcast(Envelope::new("balance_update", data).to_json())
            .await;
    }

    /// New-signal fan-out to `/ws/signals`.
    pub async fn publish_signal(&self, data: serde_json::Value) {
        self.signals
            .broadcast(Envelope::new("new_signal", data).to_json())
            .await;
    }

    pub async fn publish_trade_status(&self, data: serde_json::Value) {
        self.signals
            .broadcast(Envelope::new("trade_status", data).to_json())
            .await;
    }

    pub async fn publish_order_update(&self, data: serde_json::Value) {
        self.signals
            .broadcast(Envelope::new("order_update", data).to_json())
            .await;
    }

    /// Run both heartbeat loops until shutdown.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval_secs = self.market.params.ping_interval_secs;
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.market.heartbeat().await;
                    self.signals.heartbeat().await;
                    debug!(
                        market = self.market.len(),
                        signals = self.signals.len(),
                        "ws heartbeat"
                    );
                }
                _ = shutdown.changed() => {
                    info!("broadcast heartbeat stopping");
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
