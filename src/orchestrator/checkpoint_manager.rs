//! Checkpoint creation and restore for state document snapshots.
//!
//! Provides [`create_checkpoint`] to snapshot the whole document with a
//! SHA-256 digest per namespace, and [`restore_checkpoint`] to reinstate a
//! previous snapshot and report which namespaces had diverged since.
//! Checkpoints are stored as `<dir>/<id>.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::models::checkpoint::Checkpoint;
use crate::store::writer::{read_json, write_atomic};
use crate::store::{Namespace, StateDocument, StateStore};
use crate::{AppError, Result};

/// Listing entry for a stored checkpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Checkpoint identifier.
    pub id: String,
    /// Optional label.
    pub label: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Snapshot the current document into `dir` and trim old checkpoints.
///
/// # Errors
///
/// Returns `AppError::Serialization` if the document cannot be encoded, or
/// `AppError::Persistence` if the checkpoint cannot be written.
pub async fn create_checkpoint(
    store: &StateStore,
    dir: &Path,
    label: Option<&str>,
    max_retained: usize,
) -> Result<Checkpoint> {
    let span = info_span!("create_checkpoint", label);
    async {
        let document = store.snapshot().await;
        let digests = namespace_digests(&document)?;
        let checkpoint = Checkpoint::new(
            label.map(ToOwned::to_owned),
            serde_json::to_value(&document)?,
            digests,
        );

        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        write_atomic(&checkpoint_path(dir, &checkpoint.id), &bytes).await?;
        info!(checkpoint_id = %checkpoint.id, "checkpoint created");

        let pruned = prune_checkpoints(dir, max_retained).await?;
        if pruned > 0 {
            info!(pruned, "old checkpoints removed");
        }
        Ok(checkpoint)
    }
    .instrument(span)
    .await
}

/// Reinstate checkpoint `id` and return it with the namespaces whose
/// content differed from the snapshot.
///
/// The restored document is saved before returning. Leases inside it are
/// stale; the caller is expected to run startup reclamation.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the checkpoint does not exist,
/// `AppError::Serialization` if it is corrupt, or `AppError::Persistence`
/// if the restored state cannot be saved.
pub async fn restore_checkpoint(
    store: &StateStore,
    dir: &Path,
    id: &str,
) -> Result<(Checkpoint, Vec<Namespace>)> {
    let span = info_span!("restore_checkpoint", checkpoint_id = id);
    async {
        let checkpoint = load_checkpoint(dir, id).await?;
        let document: StateDocument = serde_json::from_value(checkpoint.document.clone())
            .map_err(|err| AppError::Serialization(format!("checkpoint {id} is corrupt: {err}")))?;

        let current = namespace_digests(&store.snapshot().await)?;
        let diverged = find_divergences(&checkpoint.namespace_digests, &current);
        if diverged.is_empty() {
            info!("no namespace divergences detected");
        } else {
            warn!(?diverged, "namespaces diverged since checkpoint");
        }

        store.replace_document(document).await;
        store.save().await?;
        info!("checkpoint restored");
        Ok((checkpoint, diverged))
    }
    .instrument(span)
    .await
}

/// Read one checkpoint.
///
/// # Errors
///
/// Returns `AppError::NotFound` if `id` is malformed or absent.
pub async fn load_checkpoint(dir: &Path, id: &str) -> Result<Checkpoint> {
    if Uuid::parse_str(id).is_err() {
        return Err(AppError::NotFound(format!("checkpoint {id}")));
    }
    read_json::<Checkpoint>(&checkpoint_path(dir, id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("checkpoint {id}")))
}

/// Every readable checkpoint in `dir`, newest first.
///
/// # Errors
///
/// Returns `AppError::Io` if the directory pattern is invalid.
pub async fn list_checkpoints(dir: &Path) -> Result<Vec<CheckpointSummary>> {
    let mut summaries = Vec::new();
    for path in checkpoint_files(dir)? {
        match read_json::<Checkpoint>(&path).await {
            Ok(Some(cp)) => summaries.push(CheckpointSummary {
                id: cp.id,
                label: cp.label,
                created_at: cp.created_at,
            }),
            Ok(None) => {}
            Err(err) => warn!(path = %path.display(), %err, "skipping unreadable checkpoint"),
        }
    }
    summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(summaries)
}

/// Remove all but the newest `max_retained` checkpoints. Returns how many
/// were removed.
///
/// # Errors
///
/// Returns `AppError::Persistence` if a file cannot be removed.
pub async fn prune_checkpoints(dir: &Path, max_retained: usize) -> Result<usize> {
    let listed = list_checkpoints(dir).await?;
    let mut removed = 0;
    for stale in listed.iter().skip(max_retained) {
        let path = checkpoint_path(dir, &stale.id);
        tokio::fs::remove_file(&path).await.map_err(|e| {
            AppError::Persistence(format!("failed to remove {}: {e}", path.display()))
        })?;
        removed += 1;
    }
    Ok(removed)
}

/// SHA-256 of each namespace's serialized content.
///
/// # Errors
///
/// Returns `AppError::Serialization` if a namespace cannot be encoded.
pub fn namespace_digests(document: &StateDocument) -> Result<BTreeMap<String, String>> {
    let mut digests = BTreeMap::new();
    for namespace in Namespace::ALL {
        let bytes = serde_json::to_vec(&document.section_value(namespace)?)?;
        digests.insert(namespace.as_str().to_owned(), sha256_hex(&bytes));
    }
    Ok(digests)
}

fn find_divergences(
    checkpoint: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> Vec<Namespace> {
    Namespace::ALL
        .into_iter()
        .filter(|ns| checkpoint.get(ns.as_str()) != current.get(ns.as_str()))
        .collect()
}

fn checkpoint_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

fn checkpoint_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("*.json");
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern)
        .map_err(|err| AppError::Io(format!("invalid checkpoint pattern: {err}")))?;
    Ok(paths.filter_map(std::result::Result::ok).collect())
}

/// Compute SHA-256 hex digest of the given bytes.
fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
