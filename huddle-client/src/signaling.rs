//! Request/response signaling over a frame channel
//!
//! Every request gets a fresh correlation id. The matching response or error
//! frame resolves the waiting caller; notifications are handed back to
//! whoever pumps incoming frames.

use async_trait::async_trait;
use huddle_proto::{ClientFrame, ClientRequest, Notification, Response, ServerFrame};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// One round trip. Gives [`ClientError::Timeout`] when no answer
    /// arrives in time.
    async fn request(&self, request: ClientRequest) -> Result<Response>;
}

type Waiter = oneshot::Sender<Result<Response>>;

pub struct ChannelSignaling {
    outbound: mpsc::Sender<ClientFrame>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl ChannelSignaling {
    #[must_use]
    pub fn new(outbound: mpsc::Sender<ClientFrame>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        })
    }

    /// Route one incoming frame. Returns the notification if it was one.
    pub fn dispatch(&self, frame: ServerFrame) -> Option<Notification> {
        let (id, result) = match frame {
            ServerFrame::Notification { notification } => return Some(notification),
            ServerFrame::Response { id, response } => (id, Ok(response)),
            ServerFrame::Error { id, error } => (id, Err(ClientError::from(error))),
        };

        match self.waiters.lock().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(id, "Dropping frame for unknown or expired request"),
        }
        None
    }

    /// Fail every waiting request, e.g. when the socket closes
    pub fn fail_all(&self, reason: &str) {
        let waiters: Vec<Waiter> = self.waiters.lock().drain().map(|(_, w)| w).collect();
        if !waiters.is_empty() {
            warn!(count = waiters.len(), reason, "Failing pending signaling requests");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(ClientError::Network(reason.to_string())));
        }
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[async_trait]
impl SignalingClient for ChannelSignaling {
    async fn request(&self, request: ClientRequest) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = request.name();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);

        if self
            .outbound
            .send(ClientFrame { id, request })
            .await
            .is_err()
        {
            self.waiters.lock().remove(&id);
            return Err(ClientError::Network("signaling channel closed".to_string()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Network("signaling channel closed".to_string())),
            Err(_) => {
                self.waiters.lock().remove(&id);
                warn!(id, request = name, timeout = ?self.timeout, "Signaling request timed out");
                Err(ClientError::Timeout(self.timeout))
            }
        }
    }
}
