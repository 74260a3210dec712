//! Declarative stack definitions and the typed surface resolved from them.
//!
//! A stack definition is consumed, never produced: generated SDK code or a
//! deserialized JSON document declares the views an application cares
//! about, and [`StackViews`] turns those declarations into typed handles.

use crate::error::LiveStackError;
use crate::registry::SubscriptionRegistry;
use crate::store::Storage;
use crate::view::{ListView, StateView};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    State,
    List,
    Append,
}

/// One declared view of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDef {
    pub mode: ViewMode,
    pub view: String,
}

/// A stack: named collection of entity view declarations, optionally
/// carrying the server URL and an opaque instruction manifest (forwarded to
/// the external instruction executor, never interpreted here).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub views: HashMap<String, HashMap<String, ViewDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<Value>,
}

impl StackDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_view(
        mut self,
        entity: impl Into<String>,
        view_name: impl Into<String>,
        mode: ViewMode,
        view_path: impl Into<String>,
    ) -> Self {
        self.views.entry(entity.into()).or_default().insert(
            view_name.into(),
            ViewDef {
                mode,
                view: view_path.into(),
            },
        );
        self
    }
}

/// Typed access to every view a stack declares.
pub struct StackViews {
    defs: HashMap<String, HashMap<String, ViewDef>>,
    registry: SubscriptionRegistry,
    storage: Arc<dyn Storage>,
    flush_interval: Duration,
}

impl StackViews {
    pub(crate) fn new(
        defs: HashMap<String, HashMap<String, ViewDef>>,
        registry: SubscriptionRegistry,
        storage: Arc<dyn Storage>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            defs,
            registry,
            storage,
            flush_interval,
        }
    }

    fn resolve(&self, entity: &str, view_name: &str) -> Result<&ViewDef, LiveStackError> {
        self.defs
            .get(entity)
            .and_then(|views| views.get(view_name))
            .ok_or_else(|| LiveStackError::UnknownView(format!("{}/{}", entity, view_name)))
    }

    /// Typed state view for a declared `mode: state` entry.
    pub fn state<T>(&self, entity: &str, view_name: &str) -> Result<StateView<T>, LiveStackError>
    where
        T: DeserializeOwned + Unpin + Send + 'static,
    {
        let def = self.resolve(entity, view_name)?;
        if def.mode != ViewMode::State {
            return Err(LiveStackError::ViewModeMismatch(def.view.clone(), "state"));
        }
        Ok(StateView::new(
            self.registry.clone(),
            self.storage.clone(),
            def.view.clone(),
            self.flush_interval,
        ))
    }

    /// Typed list view for a declared `mode: list` (or append) entry.
    pub fn list<T>(&self, entity: &str, view_name: &str) -> Result<ListView<T>, LiveStackError>
    where
        T: DeserializeOwned + Unpin + Send + 'static,
    {
        let def = self.resolve(entity, view_name)?;
        match def.mode {
            ViewMode::List | ViewMode::Append => Ok(ListView::new(
                self.registry.clone(),
                self.storage.clone(),
                def.view.clone(),
                self.flush_interval,
            )),
            ViewMode::State => Err(LiveStackError::ViewModeMismatch(def.view.clone(), "list")),
        }
    }

    pub fn declared(&self) -> &HashMap<String, HashMap<String, ViewDef>> {
        &self.defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stack_definition_parses_from_json() {
        let stack: StackDefinition = serde_json::from_value(json!({
            "name": "ore",
            "url": "wss://example.com",
            "views": {
                "OreRound": {
                    "state": {"mode": "state", "view": "OreRound/state"},
                    "list": {"mode": "list", "view": "OreRound/list"}
                }
            },
            "instructions": {"mine": {"accounts": []}}
        }))
        .unwrap();

        assert_eq!(stack.name, "ore");
        assert_eq!(stack.url.as_deref(), Some("wss://example.com"));
        let round = &stack.views["OreRound"];
        assert_eq!(round["state"].mode, ViewMode::State);
        assert_eq!(round["list"].view, "OreRound/list");
        assert!(stack.instructions.is_some());
    }

    #[test]
    fn builder_accumulates_views() {
        let stack = StackDefinition::new("demo")
            .with_url("ws://localhost:8877")
            .with_view("Round", "list", ViewMode::List, "Round/list")
            .with_view("Round", "state", ViewMode::State, "Round/state");

        assert_eq!(stack.views["Round"].len(), 2);
    }
}
