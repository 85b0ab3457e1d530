//! Query events as JSON-RPC notifications.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::{EventBody, EventSender, QueryEvent};
use crate::protocol::{Message, Notification, method};

/// Builds `{"ownerUri": owner, key: payload}`.
fn owner_params(
    owner_uri: String,
    key: &str,
    payload: &impl Serialize,
) -> Result<Value, serde_json::Error> {
    let mut params = Map::new();
    params.insert("ownerUri".to_string(), Value::String(owner_uri));
    params.insert(key.to_string(), serde_json::to_value(payload)?);
    Ok(Value::Object(params))
}

/// Converts a query event to its notification.
pub fn event_notification(event: QueryEvent) -> Result<Notification, serde_json::Error> {
    let owner_uri = event.owner_uri;
    let (name, params) = match &event.body {
        EventBody::BatchStarted(batch) => (
            method::BATCH_START,
            owner_params(owner_uri, "batchSummary", batch)?,
        ),
        EventBody::BatchCompleted(batch) => (
            method::BATCH_COMPLETE,
            owner_params(owner_uri, "batchSummary", batch)?,
        ),
        EventBody::ResultSetAvailable(result_set) => (
            method::RESULT_SET_AVAILABLE,
            owner_params(owner_uri, "resultSetSummary", result_set)?,
        ),
        EventBody::ResultSetUpdated(result_set) => (
            method::RESULT_SET_UPDATED,
            owner_params(owner_uri, "resultSetSummary", result_set)?,
        ),
        EventBody::ResultSetCompleted(result_set) => (
            method::RESULT_SET_COMPLETE,
            owner_params(owner_uri, "resultSetSummary", result_set)?,
        ),
        EventBody::Message(message) => (
            method::MESSAGE,
            owner_params(owner_uri, "message", message)?,
        ),
        EventBody::QueryCompleted(batches) => (
            method::COMPLETE,
            owner_params(owner_uri, "batchSummaries", batches)?,
        ),
    };
    Ok(Notification::new(name, params))
}

/// Forwards query events to the output channel.
///
/// Sending waits for room in the channel, so a slow client throttles query
/// execution.
pub struct ChannelSender {
    outbound: mpsc::Sender<Message>,
}

impl ChannelSender {
    pub fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl EventSender for ChannelSender {
    async fn send(&self, event: QueryEvent) {
        let notification = match event_notification(event) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(error = %e, "failed to serialize query event");
                return;
            }
        };
        if self
            .outbound
            .send(Message::Notification(notification))
            .await
            .is_err()
        {
            debug!("output closed, dropping query event");
        }
    }
}
