//! Per-city model artifact registry.
//!
//! Artifacts live as one JSON file per city under the model directory and
//! are cached in memory after first use. [`ArtifactStore::commit`] writes to
//! a temporary file and renames it over the previous artifact, then swaps
//! the cache entry. Readers therefore see the old artifact or the new one,
//! never a partial write.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::forest::{ForestParams, RandomForest};
use crate::models::Metrics;

// ---

/// Immutable result of one training run.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelArtifact {
    // ---
    pub city: String,
    /// Starts at 1 and increases on every retrain of the same city.
    pub version: u32,
    pub trained_at: DateTime<Utc>,
    pub feature_columns: Vec<String>,
    pub metrics: Metrics,
    pub params: ForestParams,
    pub model: RandomForest,
}

#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<ModelArtifact>>>,
}

fn city_key(city: &str) -> String {
    // ---
    city.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

fn lock_poisoned() -> PipelineError {
    PipelineError::Artifact("artifact cache lock poisoned".to_string())
}

impl ArtifactStore {
    /// Open (and create if needed) the artifact directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        // ---
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::info!("Artifact store at {}", root.display());
        Ok(Self {
            root,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, city: &str) -> PathBuf {
        self.root.join(format!("pm25_model_{}.json", city_key(city)))
    }

    /// Latest committed artifact, or `None` when the city was never trained.
    pub fn get(&self, city: &str) -> Result<Option<Arc<ModelArtifact>>> {
        // ---
        let key = city_key(city);
        if let Some(hit) = self.cache.read().map_err(|_| lock_poisoned())?.get(&key) {
            return Ok(Some(Arc::clone(hit)));
        }

        let path = self.path_for(city);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let artifact: Arc<ModelArtifact> = Arc::new(serde_json::from_slice(&bytes)?);
        tracing::info!(
            "Loaded model for {} (version {}, trained at {}, R2 {:.4})",
            artifact.city,
            artifact.version,
            artifact.trained_at,
            artifact.metrics.r2
        );

        let mut cache = self.cache.write().map_err(|_| lock_poisoned())?;
        // A commit may have raced this load; keep whichever is newer.
        let entry = cache.entry(key).or_insert_with(|| Arc::clone(&artifact));
        if entry.version < artifact.version {
            *entry = Arc::clone(&artifact);
        }
        Ok(Some(Arc::clone(entry)))
    }

    pub fn contains(&self, city: &str) -> Result<bool> {
        // ---
        if self.cache.read().map_err(|_| lock_poisoned())?.contains_key(&city_key(city)) {
            return Ok(true);
        }
        Ok(self.path_for(city).exists())
    }

    /// Version number the next artifact for `city` should carry.
    pub fn next_version(&self, city: &str) -> Result<u32> {
        Ok(self.get(city)?.map_or(1, |a| a.version + 1))
    }

    /// Atomically replace the artifact for `artifact.city`.
    pub fn commit(&self, artifact: ModelArtifact) -> Result<Arc<ModelArtifact>> {
        // ---
        let path = self.path_for(&artifact.city);
        let tmp = self.root.join(format!(
            ".{}.{}.tmp",
            city_key(&artifact.city),
            Uuid::new_v4()
        ));

        let bytes = serde_json::to_vec_pretty(&artifact)?;
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        let artifact = Arc::new(artifact);
        self.cache
            .write()
            .map_err(|_| lock_poisoned())?
            .insert(city_key(&artifact.city), Arc::clone(&artifact));

        tracing::info!(
            "Committed model for {} version {} to {}",
            artifact.city,
            artifact.version,
            path.display()
        );
        Ok(artifact)
    }

    /// Explicit deletion, the only way back to the "absent" state.
    pub fn delete(&self, city: &str) -> Result<bool> {
        // ---
        self.invalidate(city)?;
        let path = self.path_for(city);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        tracing::info!("Deleted model for {}", city);
        Ok(true)
    }

    /// Drop the cached copy so the next `get` reloads from disk.
    pub fn invalidate(&self, city: &str) -> Result<()> {
        // ---
        self.cache
            .write()
            .map_err(|_| lock_poisoned())?
            .remove(&city_key(city));
        Ok(())
    }
}
