//! Bounded resource pools with allocation, release, and blacklist semantics.
//!
//! A [`ResourcePool`] hands one item at a time to each requester and tracks
//! it through `available -> allocated -> used`, or back to `available` on a
//! failed run until the failure threshold moves it to `blacklisted`. Every
//! operation runs under the state store's document lock and is persisted
//! before it returns.

pub mod seed;

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::PoolConfig;
use crate::models::resource::{EmailAddress, Location, PoolItem, PoolState, PoolStats};
use crate::store::{Namespace, StateDocument, StateStore};
use crate::{AppError, Result};

/// Binds a pool item type to the document section that stores its pool.
pub trait PooledResource: PoolItem {
    /// Namespace holding the pool.
    const NAMESPACE: Namespace;

    /// Borrow the pool state from the document.
    fn pool(doc: &StateDocument) -> &PoolState<Self>;

    /// Mutably borrow the pool state from the document.
    fn pool_mut(doc: &mut StateDocument) -> &mut PoolState<Self>;
}

impl PooledResource for Location {
    const NAMESPACE: Namespace = Namespace::Locations;

    fn pool(doc: &StateDocument) -> &PoolState<Self> {
        &doc.locations
    }

    fn pool_mut(doc: &mut StateDocument) -> &mut PoolState<Self> {
        &mut doc.locations
    }
}

impl PooledResource for EmailAddress {
    const NAMESPACE: Namespace = Namespace::Resources;

    fn pool(doc: &StateDocument) -> &PoolState<Self> {
        &doc.resources.emails
    }

    fn pool_mut(doc: &mut StateDocument) -> &mut PoolState<Self> {
        &mut doc.resources.emails
    }
}

/// Location pool.
pub type LocationPool = ResourcePool<Location>;

/// Email address pool.
pub type EmailPool = ResourcePool<EmailAddress>;

/// Pool of one resource kind, persisted in the state store.
pub struct ResourcePool<R> {
    store: Arc<StateStore>,
    blacklist_threshold: u32,
    auto_reset: bool,
    kind: PhantomData<fn() -> R>,
}

impl<R> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            blacklist_threshold: self.blacklist_threshold,
            auto_reset: self.auto_reset,
            kind: PhantomData,
        }
    }
}

impl<R: PooledResource> ResourcePool<R> {
    /// Construct a pool over `store`.
    ///
    /// `blacklist_threshold` is the number of failed releases after which
    /// an item leaves circulation. With `auto_reset`, an empty pool is
    /// refilled once per allocation from every non-allocated item.
    #[must_use]
    pub fn new(store: Arc<StateStore>, blacklist_threshold: u32, auto_reset: bool) -> Self {
        Self {
            store,
            blacklist_threshold: blacklist_threshold.max(1),
            auto_reset,
            kind: PhantomData,
        }
    }

    /// Construct a pool from the `[pools]` configuration section.
    #[must_use]
    pub fn from_config(store: Arc<StateStore>, config: &PoolConfig) -> Self {
        Self::new(store, config.blacklist_threshold, config.auto_reset_on_exhaustion)
    }

    /// Hand an item to `requester_id`.
    ///
    /// Returns the requester's existing item if it already holds one.
    /// Returns `None` when nothing can be allocated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the new state cannot be saved.
    pub async fn allocate(&self, requester_id: &str) -> Result<Option<R>> {
        let span = info_span!("pool_allocate", kind = R::KIND, requester_id);
        async {
            if let Some(held) = self.allocation_for(requester_id).await {
                debug!(key = %held.key(), "requester already holds an item");
                return Ok(Some(held));
            }

            let auto_reset = self.auto_reset;
            let allocated = self
                .store
                .mutate(R::NAMESPACE, |doc| {
                    let pool = R::pool_mut(doc);
                    if let Some(held) = pool.allocated.get(requester_id) {
                        return Ok(Some(held.clone()));
                    }
                    if pool.available.is_empty() && auto_reset && has_recyclable(pool) {
                        warn!("pool exhausted, recycling used and blacklisted items");
                        reset_pool(pool);
                    }
                    let Some(item) = pool.available.pop_front() else {
                        return Ok(None);
                    };
                    pool.allocated.insert(requester_id.to_owned(), item.clone());
                    pool.refresh_stats();
                    Ok(Some(item))
                })
                .await?;
            self.store.save().await?;

            match &allocated {
                Some(item) => info!(key = %item.key(), "item allocated"),
                None => info!("pool exhausted"),
            }
            Ok(allocated)
        }
        .instrument(span)
        .await
    }

    /// Return `requester_id`'s item after a failed run.
    ///
    /// The item's failure count grows by one. Below the threshold it goes
    /// back to `available`; at the threshold it is blacklisted and its count
    /// is cleared.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotAssigned` if the requester does not hold the
    /// item with `key`, or `AppError::Persistence` if saving fails.
    pub async fn release(&self, requester_id: &str, key: &str) -> Result<()> {
        let span = info_span!("pool_release", kind = R::KIND, requester_id, key);
        async {
            let threshold = self.blacklist_threshold;
            let blacklisted = self
                .store
                .mutate(R::NAMESPACE, |doc| {
                    let pool = R::pool_mut(doc);
                    let item = take_allocation(pool, requester_id, key)?;
                    let failures = {
                        let count = pool.failure_counts.entry(item.key()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    let blacklisted = failures >= threshold;
                    if blacklisted {
                        pool.failure_counts.remove(&item.key());
                        pool.blacklisted.push(item);
                    } else {
                        pool.available.push_back(item);
                    }
                    pool.refresh_stats();
                    Ok(blacklisted)
                })
                .await?;
            self.store.save().await?;

            if blacklisted {
                warn!("item blacklisted after repeated failures");
            } else {
                info!("item returned to pool");
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Consume `requester_id`'s item after a successful run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotAssigned` if the requester does not hold the
    /// item with `key`, or `AppError::Persistence` if saving fails.
    pub async fn mark_used(&self, requester_id: &str, key: &str) -> Result<()> {
        let span = info_span!("pool_mark_used", kind = R::KIND, requester_id, key);
        async {
            self.store
                .mutate(R::NAMESPACE, |doc| {
                    let pool = R::pool_mut(doc);
                    let item = take_allocation(pool, requester_id, key)?;
                    pool.failure_counts.remove(&item.key());
                    pool.used.push(item);
                    pool.refresh_stats();
                    Ok(())
                })
                .await?;
            self.store.save().await?;
            info!("item marked used");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Move every used and blacklisted item back to `available` and clear
    /// failure counts. Live allocations are kept.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if saving fails.
    pub async fn reset(&self) -> Result<PoolStats> {
        let stats = self
            .store
            .mutate(R::NAMESPACE, |doc| {
                let pool = R::pool_mut(doc);
                reset_pool(pool);
                Ok(pool.stats)
            })
            .await?;
        self.store.save().await?;
        info!(kind = R::KIND, available = stats.available, "pool reset");
        Ok(stats)
    }

    /// Add items not already present in any set. Returns how many were new.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if saving fails.
    pub async fn add_items(&self, items: impl IntoIterator<Item = R>) -> Result<usize> {
        let items: Vec<R> = items.into_iter().collect();
        let added = self
            .store
            .mutate(R::NAMESPACE, |doc| {
                let pool = R::pool_mut(doc);
                let mut added = 0;
                for item in items {
                    if pool.contains_key(&item.key()) {
                        continue;
                    }
                    pool.available.push_back(item);
                    added += 1;
                }
                pool.refresh_stats();
                Ok(added)
            })
            .await?;
        self.store.save().await?;
        info!(kind = R::KIND, added, "pool seeded");
        Ok(added)
    }

    /// Item currently held by `requester_id`.
    pub async fn allocation_for(&self, requester_id: &str) -> Option<R> {
        self.store
            .read(|doc| R::pool(doc).allocated.get(requester_id).cloned())
            .await
    }

    /// Per-set counts.
    pub async fn stats(&self) -> PoolStats {
        self.store.read(|doc| R::pool(doc).counts()).await
    }

    /// Clone the whole pool state.
    pub async fn state(&self) -> PoolState<R> {
        self.store.read(|doc| R::pool(doc).clone()).await
    }
}

impl ResourcePool<EmailAddress> {
    /// Add raw addresses, skipping blanks and duplicates.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if saving fails.
    pub async fn add_emails<S: AsRef<str>>(&self, raw: impl IntoIterator<Item = S>) -> Result<usize> {
        let emails: Vec<EmailAddress> = raw
            .into_iter()
            .map(|line| EmailAddress::new(line.as_ref()))
            .filter(|email| !email.as_str().is_empty())
            .collect();
        self.add_items(emails).await
    }
}

fn has_recyclable<R>(pool: &PoolState<R>) -> bool {
    !pool.used.is_empty() || !pool.blacklisted.is_empty()
}

fn reset_pool<R: PoolItem>(pool: &mut PoolState<R>) {
    pool.available.extend(std::mem::take(&mut pool.used));
    pool.available.extend(std::mem::take(&mut pool.blacklisted));
    pool.failure_counts.clear();
    pool.refresh_stats();
}

fn take_allocation<R: PoolItem>(pool: &mut PoolState<R>, requester_id: &str, key: &str) -> Result<R> {
    let holds = pool
        .allocated
        .get(requester_id)
        .is_some_and(|item| item.key() == key.trim().to_lowercase());
    if !holds {
        return Err(AppError::NotAssigned(format!(
            "{requester_id} does not hold {} item '{key}'",
            R::KIND
        )));
    }
    pool.allocated
        .remove(requester_id)
        .ok_or_else(|| AppError::NotAssigned(format!("{requester_id} holds no {} item", R::KIND)))
}
