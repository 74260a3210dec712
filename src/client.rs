use crate::config::{ConnectionConfig, LiveStackConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::LiveStackError;
use crate::frame::Frame;
use crate::processor::FrameProcessor;
use crate::registry::SubscriptionRegistry;
use crate::stack::{StackDefinition, StackViews};
use crate::store::{MemoryStore, Storage};
use crate::view::{ListView, StateView};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Client facade: composes the connection, storage, processor, and
/// registry, and owns their lifecycles.
pub struct LiveStack {
    connection: ConnectionManager,
    storage: Arc<dyn Storage>,
    registry: SubscriptionRegistry,
    views: StackViews,
    stack: StackDefinition,
    config: LiveStackConfig,
    pump: tokio::task::JoinHandle<()>,
}

impl LiveStack {
    pub fn builder() -> LiveStackBuilder {
        LiveStackBuilder::default()
    }

    /// Connects with a stack definition and default options.
    pub async fn connect(stack: StackDefinition) -> Result<Self, LiveStackError> {
        Self::builder().stack(stack).connect().await
    }

    /// The typed surface for every view the stack declares.
    pub fn views(&self) -> &StackViews {
        &self.views
    }

    /// Typed state view for an explicit view path, bypassing the stack
    /// declarations.
    pub fn state_view<T>(&self, view_path: &str) -> StateView<T>
    where
        T: DeserializeOwned + Unpin + Send + 'static,
    {
        StateView::new(
            self.registry.clone(),
            self.storage.clone(),
            view_path.to_string(),
            self.config.flush_interval,
        )
    }

    /// Typed list view for an explicit view path.
    pub fn list_view<T>(&self, view_path: &str) -> ListView<T>
    where
        T: DeserializeOwned + Unpin + Send + 'static,
    {
        ListView::new(
            self.registry.clone(),
            self.storage.clone(),
            view_path.to_string(),
            self.config.flush_interval,
        )
    }

    pub fn stack(&self) -> &StackDefinition {
        &self.stack
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    pub fn frames(&self) -> broadcast::Receiver<Frame> {
        self.connection.frames()
    }

    /// Empties the storage adapter. Subscriptions are untouched.
    pub async fn clear_store(&self) {
        self.storage.clear(None).await;
    }

    /// Tears down in reverse creation order: registry (issuing wire
    /// unsubscribes), frame pump, connection, connection-held subscription
    /// state. Idempotent.
    pub async fn disconnect(&self) {
        self.registry.clear();
        self.pump.abort();
        self.connection.disconnect();
        self.connection.clear_subscriptions();
    }
}

pub struct LiveStackBuilder {
    stack: StackDefinition,
    url: Option<String>,
    storage: Option<Arc<dyn Storage>>,
    config: LiveStackConfig,
}

impl Default for LiveStackBuilder {
    fn default() -> Self {
        Self {
            stack: StackDefinition::default(),
            url: None,
            storage: None,
            config: LiveStackConfig::default(),
        }
    }
}

impl LiveStackBuilder {
    pub fn stack(mut self, stack: StackDefinition) -> Self {
        self.stack = stack;
        self
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Substitute storage backend; defaults to [`MemoryStore`].
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.config.reconnect_intervals = intervals;
        self
    }

    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.config.max_reconnect_attempts = max;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Per-view entry bound; `None` disables eviction.
    pub fn max_entries_per_view(mut self, max: Option<usize>) -> Self {
        self.config.max_entries_per_view = max;
        self
    }

    /// Batching window for `values()` streams; zero disables coalescing.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub async fn connect(self) -> Result<LiveStack, LiveStackError> {
        let url = self
            .url
            .or_else(|| self.stack.url.clone())
            .ok_or(LiveStackError::MissingUrl)?;

        let storage: Arc<dyn Storage> = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let connection_config: ConnectionConfig = self.config.clone().into();
        let connection = ConnectionManager::new(url, connection_config);

        let processor = FrameProcessor::new(storage.clone(), self.config.max_entries_per_view);
        let mut frames = connection.frames();
        let pump = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => processor.apply(frame).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "frame pump lagged behind the connection");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let registry = SubscriptionRegistry::new(Arc::new(connection.clone()));
        let views = StackViews::new(
            self.stack.views.clone(),
            registry.clone(),
            storage.clone(),
            self.config.flush_interval,
        );

        // An explicit-lifecycle client skips the initial dial; `connect` on
        // the connection manager starts it later.
        if self.config.auto_reconnect {
            connection.connect().await?;
        }

        Ok(LiveStack {
            connection,
            storage,
            registry,
            views,
            stack: self.stack,
            config: self.config,
            pump,
        })
    }
}
