//! Pooled resource items and the persisted pool sections.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An item that can live in a [`crate::pool::ResourcePool`].
pub trait PoolItem: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Human-readable pool kind used in logs and IPC (`locations`, `emails`).
    const KIND: &'static str;

    /// Identity of the item; two items with the same key are the same resource.
    fn key(&self) -> String;
}

/// A geographic location assigned to an account profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// City name.
    pub city: String,
    /// State or region code.
    pub state: String,
    /// Latitude in decimal degrees.
    pub lat: f64,
    /// Longitude in decimal degrees.
    pub lon: f64,
    /// ISO country code.
    pub country_code: String,
}

impl PoolItem for Location {
    const KIND: &'static str = "locations";

    fn key(&self) -> String {
        format!("{}, {}", self.city.trim(), self.state.trim()).to_lowercase()
    }
}

/// A contact email address handed to a single account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EmailAddress(pub String);

impl EmailAddress {
    /// Wrap a raw address, trimming surrounding whitespace.
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_owned())
    }

    /// The address text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PoolItem for EmailAddress {
    const KIND: &'static str = "emails";

    fn key(&self) -> String {
        self.0.trim().to_lowercase()
    }
}

/// Per-set counts kept alongside each pool for observability.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Items ready for allocation.
    pub available: usize,
    /// Items held by a requester.
    pub allocated: usize,
    /// Items consumed by a successful run.
    pub used: usize,
    /// Items removed after repeated failures.
    pub blacklisted: usize,
    /// Sum of all four sets.
    pub total: usize,
}

/// Persisted state of one resource pool.
///
/// Every item belongs to exactly one of `available`, `allocated`, `used`,
/// or `blacklisted`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", bound = "R: PoolItem")]
pub struct PoolState<R> {
    /// Items ready for allocation, popped from the front.
    #[serde(default = "VecDeque::new")]
    pub available: VecDeque<R>,
    /// Requester id to the single item it holds.
    #[serde(default = "BTreeMap::new", alias = "testing")]
    pub allocated: BTreeMap<String, R>,
    /// Items consumed by a successful run.
    #[serde(default = "Vec::new")]
    pub used: Vec<R>,
    /// Items removed after reaching the failure threshold.
    #[serde(default = "Vec::new")]
    pub blacklisted: Vec<R>,
    /// Failed releases per item key.
    #[serde(default = "BTreeMap::new")]
    pub failure_counts: BTreeMap<String, u32>,
    /// Derived counts, refreshed on every mutation.
    #[serde(default)]
    pub stats: PoolStats,
}

impl<R> Default for PoolState<R> {
    fn default() -> Self {
        Self {
            available: VecDeque::new(),
            allocated: BTreeMap::new(),
            used: Vec::new(),
            blacklisted: Vec::new(),
            failure_counts: BTreeMap::new(),
            stats: PoolStats::default(),
        }
    }
}

impl<R: PoolItem> PoolState<R> {
    /// Whether an item with `key` is present in any of the four sets.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.available.iter().any(|r| r.key() == key)
            || self.allocated.values().any(|r| r.key() == key)
            || self.used.iter().any(|r| r.key() == key)
            || self.blacklisted.iter().any(|r| r.key() == key)
    }

    /// Counts computed from the four sets.
    #[must_use]
    pub fn counts(&self) -> PoolStats {
        let available = self.available.len();
        let allocated = self.allocated.len();
        let used = self.used.len();
        let blacklisted = self.blacklisted.len();
        PoolStats {
            available,
            allocated,
            used,
            blacklisted,
            total: available + allocated + used + blacklisted,
        }
    }

    /// Recompute `stats` from the four sets.
    pub fn refresh_stats(&mut self) {
        self.stats = self.counts();
    }
}

/// The `resources` namespace: contact-identifier pools.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesState {
    /// Email address pool.
    #[serde(default)]
    pub emails: PoolState<EmailAddress>,
}
