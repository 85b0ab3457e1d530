//! Query execution manager.
//!
//! The manager is the process-wide directory of queries, keyed by owner URI
//! (one editor document bound to one connection). It creates queries with
//! the right connection and settings, runs them in background tasks, and
//! routes paging, cancel, save and dispose requests to them.
//!
//! ```text
//! request --> QueryExecutionManager --resolve--> ConnectionResolver
//!                    |
//!                    +-- DashMap<owner, Arc<Query>>
//!                              |
//!                              +-- Batch -- ResultSet -- RowStore
//! ```
//!
//! The registry is a concurrent map: execute and dispose requests for the
//! same owner may race, and every update is a single atomic map operation.

mod error;

pub use error::ManagerError;

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ExecutionSettings;
use crate::event::EventSender;
use crate::query::{Query, QueryError};
use crate::result_set::{ResultSubset, SaveCallback, SaveParams};
use crate::source::ConnectionResolver;
use crate::storage::RowStoreFactory;

/// A request to execute query text for an owner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub owner_uri: String,
    pub query: String,
    /// Capture actual plans for this request, on top of the settings.
    #[serde(default)]
    pub include_actual_plan: bool,
    /// Capture estimated plans for this request, on top of the settings.
    #[serde(default)]
    pub include_estimated_plan: bool,
}

impl ExecuteRequest {
    pub fn new(owner_uri: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            owner_uri: owner_uri.into(),
            query: query.into(),
            include_actual_plan: false,
            include_estimated_plan: false,
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelOutcome {
    /// Cancellation was signaled to the running query.
    Cancelled,
    /// No query exists for the owner.
    NoSuchQuery,
    /// The query had already finished.
    AlreadyCompleted,
}

/// Query type managed for a resolver and store factory.
pub type ManagedQuery<R, F> = Query<<R as ConnectionResolver>::Source, F>;

/// Directory of queries by owner URI.
pub struct QueryExecutionManager<R: ConnectionResolver, F: RowStoreFactory> {
    resolver: Arc<R>,
    factory: Arc<F>,
    defaults: RwLock<ExecutionSettings>,
    owner_settings: DashMap<String, ExecutionSettings>,
    queries: DashMap<String, Arc<ManagedQuery<R, F>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl<R: ConnectionResolver, F: RowStoreFactory> QueryExecutionManager<R, F> {
    pub fn new(resolver: Arc<R>, factory: Arc<F>, defaults: ExecutionSettings) -> Self {
        Self {
            resolver,
            factory,
            defaults: RwLock::new(defaults),
            owner_settings: DashMap::new(),
            queries: DashMap::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn resolver(&self) -> &Arc<R> {
        &self.resolver
    }

    pub fn default_settings(&self) -> ExecutionSettings {
        self.defaults.read().clone()
    }

    /// Replaces the global execution defaults.
    ///
    /// Queries already created keep the settings they were created with.
    pub fn set_default_settings(&self, settings: ExecutionSettings) {
        *self.defaults.write() = settings;
    }

    /// Sets (or with `None`, clears) the settings override of one owner.
    pub fn set_owner_settings(&self, owner_uri: &str, settings: Option<ExecutionSettings>) {
        match settings {
            Some(settings) => {
                self.owner_settings.insert(owner_uri.to_string(), settings);
            }
            None => {
                self.owner_settings.remove(owner_uri);
            }
        }
    }

    /// Settings a new query of `owner_uri` would run with.
    ///
    /// The owner override is merged over the global defaults, then the
    /// request's plan flags are ORed in.
    pub fn settings_for(
        &self,
        owner_uri: &str,
        include_actual_plan: bool,
        include_estimated_plan: bool,
    ) -> ExecutionSettings {
        let defaults = self.default_settings();
        let merged = match self.owner_settings.get(owner_uri) {
            Some(owner) => defaults.merged_with(owner.value()),
            None => defaults,
        };
        merged.with_plan_flags(include_actual_plan, include_estimated_plan)
    }

    /// Returns the query registered for `owner_uri`.
    pub fn query(&self, owner_uri: &str) -> Option<Arc<ManagedQuery<R, F>>> {
        self.queries.get(owner_uri).map(|entry| entry.value().clone())
    }

    /// Number of registered queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    fn require(&self, owner_uri: &str) -> Result<Arc<ManagedQuery<R, F>>, ManagerError> {
        self.query(owner_uri)
            .ok_or_else(|| ManagerError::NoSuchQuery(owner_uri.to_string()))
    }

    /// Creates and registers a query without starting it.
    ///
    /// A finished query of the same owner is disposed and replaced.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::InvalidOwner` if the owner has no connection
    /// and `ManagerError::QueryInProgress` if its previous query still runs.
    pub async fn create_query(
        &self,
        request: &ExecuteRequest,
    ) -> Result<Arc<ManagedQuery<R, F>>, ManagerError> {
        let owner_uri = request.owner_uri.as_str();
        let source = self
            .resolver
            .resolve(owner_uri)
            .ok_or_else(|| ManagerError::InvalidOwner(owner_uri.to_string()))?;

        if let Some(previous) = self.query(owner_uri) {
            if !previous.is_terminal() {
                return Err(ManagerError::QueryInProgress(owner_uri.to_string()));
            }
            let removed = self
                .queries
                .remove_if(owner_uri, |_, query| Arc::ptr_eq(query, &previous));
            if removed.is_some() {
                debug!(owner_uri, "replacing finished query");
                previous.dispose().await;
            }
        }

        let settings = self.settings_for(
            owner_uri,
            request.include_actual_plan,
            request.include_estimated_plan,
        );
        let query = Arc::new(Query::new(
            owner_uri,
            request.query.clone(),
            source,
            self.factory.clone(),
            settings,
        ));

        match self.queries.entry(owner_uri.to_string()) {
            Entry::Occupied(_) => Err(ManagerError::QueryInProgress(owner_uri.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(query.clone());
                Ok(query)
            }
        }
    }

    /// Creates a query and runs it in the background.
    ///
    /// `accept` is awaited after the query is registered and before it
    /// starts; returning `false` disposes and unregisters the query. Events
    /// go to `sender` once accepted.
    ///
    /// Returns whether the query was accepted.
    ///
    /// # Errors
    ///
    /// Fails like [`create_query`](Self::create_query).
    pub async fn execute_query<A, Fut>(
        &self,
        request: &ExecuteRequest,
        sender: Arc<dyn EventSender>,
        accept: A,
    ) -> Result<bool, ManagerError>
    where
        A: FnOnce(Arc<ManagedQuery<R, F>>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let query = self.create_query(request).await?;

        // Unregisters the query if this future is dropped during `accept`
        let pending = Unaccepted {
            queries: &self.queries,
            owner_uri: &request.owner_uri,
            query: Some(query.clone()),
        };
        if !accept(query.clone()).await {
            debug!(owner_uri = %request.owner_uri, "query declined");
            drop(pending);
            query.dispose().await;
            return Ok(false);
        }
        pending.accepted();

        query.subscribe(sender);
        let running = query.clone();
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = running.execute().await {
                warn!(owner_uri = %running.owner_uri(), error = %e, "query execution rejected");
            }
        });

        Ok(true)
    }

    /// Reads a window of rows from one result set.
    pub async fn get_subset(
        &self,
        owner_uri: &str,
        batch_id: usize,
        result_set_id: usize,
        start: i64,
        count: i64,
    ) -> Result<ResultSubset, ManagerError> {
        let query = self.require(owner_uri)?;
        Ok(query
            .get_subset(batch_id, result_set_id, start, count)
            .await?)
    }

    /// Signals cancellation to the owner's query.
    ///
    /// The query stays registered until it is disposed or replaced.
    pub fn cancel_query(&self, owner_uri: &str) -> CancelOutcome {
        let Some(query) = self.query(owner_uri) else {
            return CancelOutcome::NoSuchQuery;
        };
        match query.cancel() {
            Ok(()) => {
                info!(owner_uri, "query cancellation requested");
                CancelOutcome::Cancelled
            }
            Err(QueryError::AlreadyCompleted) => CancelOutcome::AlreadyCompleted,
            Err(e) => {
                warn!(owner_uri, error = %e, "unexpected cancel failure");
                CancelOutcome::AlreadyCompleted
            }
        }
    }

    /// Unregisters and disposes the owner's query.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NoSuchQuery` if the owner has no query.
    pub async fn dispose_query(&self, owner_uri: &str) -> Result<(), ManagerError> {
        let (_, query) = self
            .queries
            .remove(owner_uri)
            .ok_or_else(|| ManagerError::NoSuchQuery(owner_uri.to_string()))?;
        query.dispose().await;
        Ok(())
    }

    /// Starts saving one result set to a file.
    ///
    /// The outcome of the save itself is reported through `on_complete`.
    pub fn save_results(
        &self,
        owner_uri: &str,
        batch_id: usize,
        result_set_id: usize,
        params: SaveParams,
        on_complete: SaveCallback,
    ) -> Result<(), ManagerError> {
        let query = self.require(owner_uri)?;
        let result_set = query.result_set(batch_id, result_set_id)?;
        result_set.save_as(params, on_complete)?;
        Ok(())
    }

    /// Cancels every running query, waits for them and disposes all queries.
    ///
    /// Individual failures are logged and do not stop the shutdown.
    pub async fn shutdown(&self) {
        let queries: Vec<_> = self
            .queries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(queries = queries.len(), "shutting down query execution manager");

        for query in &queries {
            if query.is_terminal() {
                continue;
            }
            if let Err(e) = query.cancel() {
                warn!(owner_uri = %query.owner_uri(), error = %e, "failed to cancel query");
            }
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "query task ended abnormally");
            }
        }

        let owners: Vec<String> = self.queries.iter().map(|e| e.key().clone()).collect();
        for owner_uri in owners {
            if let Some((_, query)) = self.queries.remove(&owner_uri) {
                query.dispose().await;
            }
        }
    }
}

/// Registration of a query whose start has not been accepted yet.
struct Unaccepted<'a, Q> {
    queries: &'a DashMap<String, Arc<Q>>,
    owner_uri: &'a str,
    query: Option<Arc<Q>>,
}

impl<Q> Unaccepted<'_, Q> {
    fn accepted(mut self) {
        self.query = None;
    }
}

impl<Q> Drop for Unaccepted<'_, Q> {
    fn drop(&mut self) {
        if let Some(query) = self.query.take() {
            self.queries
                .remove_if(self.owner_uri, |_, registered| Arc::ptr_eq(registered, &query));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::RecordingSender;
    use crate::query::QueryState;
    use crate::source::ConnectionMap;
    use crate::source::scripted::{ScriptedSource, Step, header};
    use crate::storage::MemoryRowStoreFactory;

    const OWNER: &str = "file:///manager.sql";

    type TestManager = QueryExecutionManager<ConnectionMap<ScriptedSource>, MemoryRowStoreFactory>;

    fn manager(steps: Vec<Step>) -> TestManager {
        let connections = ConnectionMap::new();
        connections.connect(OWNER, Arc::new(ScriptedSource::new(steps)));
        QueryExecutionManager::new(
            Arc::new(connections),
            Arc::new(MemoryRowStoreFactory),
            ExecutionSettings::default(),
        )
    }

    async fn execute(manager: &TestManager, text: &str) -> Arc<RecordingSender> {
        let recorder = Arc::new(RecordingSender::default());
        let accepted = manager
            .execute_query(&ExecuteRequest::new(OWNER, text), recorder.clone(), |_| async {
                true
            })
            .await
            .unwrap();
        assert!(accepted);
        recorder
    }

    async fn wait_terminal(manager: &TestManager) {
        let query = manager.query(OWNER).unwrap();
        while !query.is_terminal() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_execute_and_page() {
        let manager = manager(vec![Step::counting(10)]);
        let recorder = execute(&manager, "SELECT n FROM numbers").await;
        wait_terminal(&manager).await;

        let subset = manager.get_subset(OWNER, 0, 0, 2, 3).await.unwrap();
        assert_eq!(subset.row_count, 3);
        assert_eq!(subset.rows[0][0].display_value, "2");
        assert_eq!(recorder.kinds().first(), Some(&"batch_started"));
    }

    #[tokio::test]
    async fn test_invalid_owner() {
        let manager = manager(Vec::new());
        let result = manager
            .create_query(&ExecuteRequest::new("file:///nobody.sql", "SELECT 1"))
            .await;
        assert!(matches!(result, Err(ManagerError::InvalidOwner(_))));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_running_query_blocks_new_one() {
        let manager = manager(vec![Step::Endless(header(&["n"]))]);
        execute(&manager, "endless").await;

        let second = manager
            .create_query(&ExecuteRequest::new(OWNER, "SELECT 1"))
            .await;
        assert!(matches!(second, Err(ManagerError::QueryInProgress(_))));

        assert_eq!(manager.cancel_query(OWNER), CancelOutcome::Cancelled);
        wait_terminal(&manager).await;
        assert_eq!(manager.query(OWNER).unwrap().state(), QueryState::Cancelled);
        assert_eq!(manager.cancel_query(OWNER), CancelOutcome::AlreadyCompleted);
    }

    #[tokio::test]
    async fn test_finished_query_replaced() {
        let manager = manager(vec![Step::counting(1)]);
        execute(&manager, "SELECT 1").await;
        wait_terminal(&manager).await;
        let first = manager.query(OWNER).unwrap();

        execute(&manager, "SELECT 2").await;
        let second = manager.query(OWNER).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.text(), "SELECT 2");
        assert_eq!(manager.len(), 1);
        // The replaced query's stores are gone
        assert!(first.get_subset(0, 0, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_declined_query_not_registered() {
        let manager = manager(vec![Step::counting(1)]);
        let recorder = Arc::new(RecordingSender::default());
        let accepted = manager
            .execute_query(&ExecuteRequest::new(OWNER, "SELECT 1"), recorder.clone(), |_| async {
                false
            })
            .await
            .unwrap();

        assert!(!accepted);
        assert!(manager.query(OWNER).is_none());
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_accept_unregisters_query() {
        let manager = manager(vec![Step::counting(1)]);
        let recorder = Arc::new(RecordingSender::default());

        // The accept callback never finishes, and the caller gives up
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            manager.execute_query(
                &ExecuteRequest::new(OWNER, "SELECT 1"),
                recorder.clone(),
                |_| std::future::pending::<bool>(),
            ),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(manager.query(OWNER).is_none());

        let query = manager
            .create_query(&ExecuteRequest::new(OWNER, "SELECT 1"))
            .await
            .unwrap();
        assert_eq!(query.state(), QueryState::NotStarted);
    }

    #[tokio::test]
    async fn test_cancel_and_dispose_missing() {
        let manager = manager(Vec::new());
        assert_eq!(manager.cancel_query(OWNER), CancelOutcome::NoSuchQuery);
        assert!(matches!(
            manager.dispose_query(OWNER).await,
            Err(ManagerError::NoSuchQuery(_))
        ));
        assert!(matches!(
            manager.get_subset(OWNER, 0, 0, 0, 1).await,
            Err(ManagerError::NoSuchQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_dispose_removes_query() {
        let manager = manager(vec![Step::counting(1)]);
        execute(&manager, "SELECT 1").await;
        wait_terminal(&manager).await;

        manager.dispose_query(OWNER).await.unwrap();
        assert!(manager.query(OWNER).is_none());
    }

    #[tokio::test]
    async fn test_settings_merge() {
        let manager = manager(vec![Step::counting(1)]);
        manager.set_default_settings(ExecutionSettings {
            include_actual_plan: true,
            ..ExecutionSettings::default()
        });
        manager.set_owner_settings(
            OWNER,
            Some(ExecutionSettings {
                batch_execution_count: 3,
                row_count_limit: 50,
                ..ExecutionSettings::default()
            }),
        );

        let settings = manager.settings_for(OWNER, false, true);
        assert!(settings.include_actual_plan);
        assert!(settings.include_estimated_plan);
        assert_eq!(settings.execution_count(), 3);
        assert_eq!(settings.row_limit(), Some(50));

        let mut request = ExecuteRequest::new(OWNER, "SELECT 1");
        request.include_estimated_plan = true;
        let query = manager.create_query(&request).await.unwrap();
        assert_eq!(query.settings(), &settings);

        manager.set_owner_settings(OWNER, None);
        assert_eq!(manager.settings_for(OWNER, false, false).execution_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_disposes() {
        let manager = manager(vec![Step::Endless(header(&["n"]))]);
        execute(&manager, "endless").await;
        let query = manager.query(OWNER).unwrap();

        manager.shutdown().await;

        assert!(manager.is_empty());
        assert_eq!(query.state(), QueryState::Cancelled);
    }

    #[tokio::test]
    async fn test_save_requires_known_result_set() {
        let manager = manager(vec![Step::counting(1)]);
        execute(&manager, "SELECT 1").await;
        wait_terminal(&manager).await;

        let result = manager.save_results(
            OWNER,
            0,
            3,
            SaveParams::new("/tmp/unused.csv", crate::result_set::SaveFormat::Csv),
            crate::result_set::save_callback(|_| async {}),
        );
        assert!(matches!(result, Err(ManagerError::Query(_))));
    }
}
