//! Typed state document and per-namespace section access.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::namespace::Namespace;
use crate::models::resource::{Location, PoolState, ResourcesState};
use crate::models::session::ServersState;
use crate::models::task::QueueState;
use crate::{AppError, Result};

/// Current on-disk schema version of the consolidated document.
pub const DOCUMENT_VERSION: u32 = 1;

/// Opaque UI settings; the coordinator stores them but never interprets them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct UiState(pub serde_json::Map<String, serde_json::Value>);

/// Root object persisted as the consolidated state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    /// Schema version.
    #[serde(default)]
    pub version: u32,
    /// Time of the last successful save.
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    /// Task queue section.
    #[serde(default)]
    pub queue: QueueState,
    /// Location pool section.
    #[serde(default)]
    pub locations: PoolState<Location>,
    /// Contact-identifier pools section.
    #[serde(default)]
    pub resources: ResourcesState,
    /// UI settings section.
    #[serde(default)]
    pub ui: UiState,
    /// Worker sessions section.
    #[serde(default)]
    pub servers: ServersState,
}

impl StateDocument {
    /// Empty document with every namespace at its default skeleton.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            ..Self::default()
        }
    }

    /// Serialize one namespace to JSON.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if encoding fails.
    pub fn section_value(&self, namespace: Namespace) -> Result<serde_json::Value> {
        let value = match namespace {
            Namespace::Queue => serde_json::to_value(&self.queue)?,
            Namespace::Locations => serde_json::to_value(&self.locations)?,
            Namespace::Resources => serde_json::to_value(&self.resources)?,
            Namespace::Ui => serde_json::to_value(&self.ui)?,
            Namespace::Servers => serde_json::to_value(&self.servers)?,
        };
        Ok(value)
    }

    /// Replace one namespace from JSON, leaving siblings untouched.
    ///
    /// The value is fully decoded before anything is replaced, so a shape
    /// mismatch leaves the document unchanged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if `value` does not match the
    /// namespace's schema.
    pub fn replace_section(&mut self, namespace: Namespace, value: serde_json::Value) -> Result<()> {
        match namespace {
            Namespace::Queue => self.queue = decode_section(namespace, value)?,
            Namespace::Locations => self.locations = decode_section(namespace, value)?,
            Namespace::Resources => self.resources = decode_section(namespace, value)?,
            Namespace::Ui => self.ui = decode_section(namespace, value)?,
            Namespace::Servers => self.servers = decode_section(namespace, value)?,
        }
        Ok(())
    }

    /// Reset one namespace to its default skeleton.
    pub fn reset_section(&mut self, namespace: Namespace) {
        match namespace {
            Namespace::Queue => self.queue = QueueState::default(),
            Namespace::Locations => self.locations = PoolState::default(),
            Namespace::Resources => self.resources = ResourcesState::default(),
            Namespace::Ui => self.ui = UiState::default(),
            Namespace::Servers => self.servers = ServersState::default(),
        }
    }
}

fn decode_section<T: DeserializeOwned>(namespace: Namespace, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| AppError::Serialization(format!("invalid {namespace} section: {err}")))
}

/// A strongly typed namespace of the state document.
pub trait Section: Serialize + DeserializeOwned + Default + Clone + Send + 'static {
    /// Namespace this section is stored under.
    const NAMESPACE: Namespace;

    /// Borrow the section from the document.
    fn section(doc: &StateDocument) -> &Self;

    /// Mutably borrow the section from the document.
    fn section_mut(doc: &mut StateDocument) -> &mut Self;
}

impl Section for QueueState {
    const NAMESPACE: Namespace = Namespace::Queue;

    fn section(doc: &StateDocument) -> &Self {
        &doc.queue
    }

    fn section_mut(doc: &mut StateDocument) -> &mut Self {
        &mut doc.queue
    }
}

impl Section for PoolState<Location> {
    const NAMESPACE: Namespace = Namespace::Locations;

    fn section(doc: &StateDocument) -> &Self {
        &doc.locations
    }

    fn section_mut(doc: &mut StateDocument) -> &mut Self {
        &mut doc.locations
    }
}

impl Section for ResourcesState {
    const NAMESPACE: Namespace = Namespace::Resources;

    fn section(doc: &StateDocument) -> &Self {
        &doc.resources
    }

    fn section_mut(doc: &mut StateDocument) -> &mut Self {
        &mut doc.resources
    }
}

impl Section for UiState {
    const NAMESPACE: Namespace = Namespace::Ui;

    fn section(doc: &StateDocument) -> &Self {
        &doc.ui
    }

    fn section_mut(doc: &mut StateDocument) -> &mut Self {
        &mut doc.ui
    }
}

impl Section for ServersState {
    const NAMESPACE: Namespace = Namespace::Servers;

    fn section(doc: &StateDocument) -> &Self {
        &doc.servers
    }

    fn section_mut(doc: &mut StateDocument) -> &mut Self {
        &mut doc.servers
    }
}

/// Look up a dotted path (`tasks.0.status`) inside a JSON value.
#[must_use]
pub fn lookup_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |node, segment| match node {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Write `value` at a dotted path, creating intermediate objects.
///
/// # Errors
///
/// Returns `AppError::Serialization` if the path crosses a scalar or an
/// out-of-range array index.
pub fn assign_path(root: &mut serde_json::Value, path: &str, value: serde_json::Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut node = root;
    for segment in parents {
        node = child_mut(node, segment, path)?;
    }

    match node {
        serde_json::Value::Object(map) => {
            map.insert((*last).to_owned(), value);
            Ok(())
        }
        serde_json::Value::Array(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| AppError::Serialization(format!("no array slot at '{path}'")))?;
            *slot = value;
            Ok(())
        }
        _ => Err(AppError::Serialization(format!(
            "path '{path}' crosses a scalar value"
        ))),
    }
}

fn child_mut<'a>(
    node: &'a mut serde_json::Value,
    segment: &str,
    path: &str,
) -> Result<&'a mut serde_json::Value> {
    match node {
        serde_json::Value::Object(map) => Ok(map
            .entry(segment.to_owned())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()))),
        serde_json::Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get_mut(i))
            .ok_or_else(|| AppError::Serialization(format!("no array slot at '{path}'"))),
        _ => Err(AppError::Serialization(format!(
            "path '{path}' crosses a scalar value"
        ))),
    }
}
