//! Request dispatch.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::ServerError;
use super::notify::ChannelSender;
use crate::manager::{CancelOutcome, ExecuteRequest, ManagerError, QueryExecutionManager};
use crate::protocol::{
    CancelResult, ConnectParams, Message, Notification, OwnerParams, Request, RequestId, Response,
    SaveCompleteParams, SaveResultsParams, SettingsParams, SubsetParams, method,
};
use crate::result_set::{SaveFormat, save_callback};
use crate::source::{ConnectionMap, SqliteDataSource};
use crate::storage::RowStoreFactory;

/// Manager serving SQLite connections.
pub type SqliteManager<F> = QueryExecutionManager<ConnectionMap<SqliteDataSource>, F>;

fn params<T: DeserializeOwned>(value: Value) -> Result<T, ServerError> {
    serde_json::from_value(value).map_err(ServerError::InvalidParams)
}

/// Routes requests to the manager and writes their responses.
pub struct Dispatcher<F: RowStoreFactory> {
    manager: Arc<SqliteManager<F>>,
    outbound: mpsc::Sender<Message>,
}

impl<F: RowStoreFactory> Dispatcher<F> {
    pub fn new(manager: Arc<SqliteManager<F>>, outbound: mpsc::Sender<Message>) -> Self {
        Self { manager, outbound }
    }

    async fn send(&self, message: Message) -> Result<(), ServerError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ServerError::Closed)
    }

    /// Handles one request and sends its response.
    ///
    /// Fails only when the response cannot be delivered.
    pub async fn handle(&self, request: Request) -> Result<(), ServerError> {
        let id = request.id.clone();
        debug!(method = %request.method, "request");

        let response = match self.dispatch(request).await {
            // Responded from inside the handler
            Ok(None) => return Ok(()),
            Ok(Some(result)) => Response::success(id, result),
            Err(e) => {
                debug!(error = %e, "request failed");
                Response::error(id, e.code(), e.to_string())
            }
        };
        self.send(Message::Response(response)).await
    }

    async fn dispatch(&self, request: Request) -> Result<Option<Value>, ServerError> {
        let Request {
            id,
            method: name,
            params: raw,
            ..
        } = request;

        let result = match name.as_str() {
            method::CONNECT => self.connect(params(raw)?)?,
            method::DISCONNECT => self.disconnect(params(raw)?).await?,
            method::EXECUTE_STRING => return self.execute(id, params(raw)?).await.map(|_| None),
            method::SUBSET => self.subset(params(raw)?).await?,
            method::CANCEL => self.cancel(params(raw)?),
            method::DISPOSE => {
                let owner: OwnerParams = params(raw)?;
                self.manager.dispose_query(&owner.owner_uri).await?;
                json!({})
            }
            method::SAVE_CSV => self.save(params(raw)?, SaveFormat::Csv)?,
            method::SAVE_JSON => self.save(params(raw)?, SaveFormat::Json)?,
            method::SETTINGS => self.settings(params(raw)?),
            method::SHUTDOWN => {
                self.manager.shutdown().await;
                Value::Null
            }
            _ => return Err(ServerError::MethodNotFound(name)),
        };
        Ok(Some(result))
    }

    fn connect(&self, params: ConnectParams) -> Result<Value, ServerError> {
        let source = SqliteDataSource::open(&params.database)?;
        let replaced = self
            .manager
            .resolver()
            .connect(params.owner_uri.clone(), Arc::new(source))
            .is_some();
        info!(owner_uri = %params.owner_uri, database = %params.database, replaced, "connected");
        Ok(json!(true))
    }

    async fn disconnect(&self, params: OwnerParams) -> Result<Value, ServerError> {
        let owner_uri = params.owner_uri.as_str();
        match self.manager.dispose_query(owner_uri).await {
            Ok(()) | Err(ManagerError::NoSuchQuery(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let disconnected = self.manager.resolver().disconnect(owner_uri).is_some();
        info!(owner_uri, disconnected, "disconnected");
        Ok(json!(disconnected))
    }

    /// Starts a query. The success response is written before the query
    /// starts, so it precedes every notification of the query.
    async fn execute(&self, id: RequestId, request: ExecuteRequest) -> Result<(), ServerError> {
        let sender = Arc::new(ChannelSender::new(self.outbound.clone()));
        let outbound = self.outbound.clone();
        self.manager
            .execute_query(&request, sender, move |_query| async move {
                outbound
                    .send(Message::Response(Response::success(id, json!({}))))
                    .await
                    .is_ok()
            })
            .await?;
        Ok(())
    }

    async fn subset(&self, params: SubsetParams) -> Result<Value, ServerError> {
        let subset = self
            .manager
            .get_subset(
                &params.owner_uri,
                params.batch_index,
                params.result_set_index,
                params.rows_start_index,
                params.rows_count,
            )
            .await?;
        Ok(json!({ "resultSubset": subset }))
    }

    fn cancel(&self, params: OwnerParams) -> Value {
        let outcome = self.manager.cancel_query(&params.owner_uri);
        let messages = match outcome {
            CancelOutcome::Cancelled => None,
            CancelOutcome::NoSuchQuery => Some("No query exists for this owner".to_string()),
            CancelOutcome::AlreadyCompleted => {
                Some("The query has already completed and cannot be canceled".to_string())
            }
        };
        json!(CancelResult { outcome, messages })
    }

    fn save(&self, params: SaveResultsParams, format: SaveFormat) -> Result<Value, ServerError> {
        let SaveResultsParams {
            owner_uri,
            batch_index,
            result_set_index,
            mut save,
        } = params;
        save.format = format;

        let outbound = self.outbound.clone();
        let notify_owner = owner_uri.clone();
        let file_path = save.file_path.display().to_string();
        let on_complete = save_callback(move |outcome| async move {
            let params = match outcome {
                Ok(_) => SaveCompleteParams {
                    owner_uri: notify_owner,
                    file_path,
                    message: None,
                },
                Err(e) => {
                    warn!(owner_uri = %notify_owner, error = %e, "save failed");
                    SaveCompleteParams {
                        owner_uri: notify_owner,
                        file_path,
                        message: Some(e.to_string()),
                    }
                }
            };
            let notification = Notification::new(method::SAVE_COMPLETE, json!(params));
            if outbound
                .send(Message::Notification(notification))
                .await
                .is_err()
            {
                debug!("output closed, dropping save notification");
            }
        });

        self.manager.save_results(
            &owner_uri,
            batch_index,
            result_set_index,
            save,
            on_complete,
        )?;
        Ok(json!({}))
    }

    fn settings(&self, params: SettingsParams) -> Value {
        match params.owner_uri {
            Some(owner_uri) => self.manager.set_owner_settings(&owner_uri, params.settings),
            None => self
                .manager
                .set_default_settings(params.settings.unwrap_or_default()),
        }
        json!({})
    }
}
