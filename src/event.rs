//! Execution events and subscriber fan-out.
//!
//! Every notification produced while a query runs is a [`QueryEvent`]. A
//! query keeps an ordered list of [`EventSender`]s and awaits each one in
//! registration order before continuing, so a slow subscriber slows the
//! execution down instead of piling up unsent events.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use crate::batch::{BatchSummary, ResultMessage};
use crate::result_set::ResultSetSummary;

/// A notification about one query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEvent {
    /// Owner URI of the query the event belongs to.
    pub owner_uri: String,
    /// What happened.
    pub body: EventBody,
}

/// Event payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "payload")]
pub enum EventBody {
    BatchStarted(BatchSummary),
    BatchCompleted(BatchSummary),
    ResultSetAvailable(ResultSetSummary),
    ResultSetUpdated(ResultSetSummary),
    ResultSetCompleted(ResultSetSummary),
    Message(ResultMessage),
    /// Emitted once per query, whatever its outcome.
    QueryCompleted(Vec<BatchSummary>),
}

/// Receives query events.
#[async_trait]
pub trait EventSender: Send + Sync {
    /// Delivers one event. Delivery failures are the sender's own concern.
    async fn send(&self, event: QueryEvent);
}

/// Ordered list of event senders for one owner.
pub struct EventSubscribers {
    owner_uri: String,
    senders: RwLock<Vec<Arc<dyn EventSender>>>,
}

impl EventSubscribers {
    /// Creates an empty list for `owner_uri`.
    pub fn new(owner_uri: impl Into<String>) -> Self {
        Self {
            owner_uri: owner_uri.into(),
            senders: RwLock::new(Vec::new()),
        }
    }

    /// Appends a sender; it receives every event emitted after this call.
    pub fn subscribe(&self, sender: Arc<dyn EventSender>) {
        self.senders.write().push(sender);
    }

    /// Returns the number of senders.
    pub fn len(&self) -> usize {
        self.senders.read().len()
    }

    /// Returns true if nobody listens.
    pub fn is_empty(&self) -> bool {
        self.senders.read().is_empty()
    }

    /// Sends `body` to every sender in registration order.
    pub async fn emit(&self, body: EventBody) {
        // Snapshot so no lock is held while a sender runs
        let senders = self.senders.read().clone();
        for sender in senders {
            sender
                .send(QueryEvent {
                    owner_uri: self.owner_uri.clone(),
                    body: body.clone(),
                })
                .await;
        }
    }
}
