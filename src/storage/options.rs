use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::types::{Result, VitreeError};

use super::metrics::MvccMetrics;

const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Configuration supplied when creating a [`super::VersionedBTree`].
///
/// Every field has a default, so a TOML file only needs the values it changes.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Leaf page capacity in bytes.
    pub page_size: usize,
    /// Bytes of a page kept free of fat tuples.
    pub fat_tuple_headroom: usize,
    /// Whether hot chains are folded into fat tuples.
    pub enable_fat_tuple: bool,
    /// Chain length that triggers conversion; defaults to the worker count.
    pub fat_tuple_threshold: Option<usize>,
    /// Whether mutations append records to the WAL.
    pub enable_wal: bool,
    /// Whether garbage collection relocates tombstones for analytical readers.
    pub enable_graveyard: bool,
    /// Optimistic read attempts before falling back to a shared latch.
    pub optimistic_retries: usize,
    /// Attempts to take a tuple write lock before aborting the writer.
    pub write_lock_spin_limit: usize,
    /// Optional metrics sink.
    #[serde(skip)]
    pub metrics: Option<Arc<dyn MvccMetrics>>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            fat_tuple_headroom: 1000,
            enable_fat_tuple: true,
            fat_tuple_threshold: None,
            enable_wal: true,
            enable_graveyard: true,
            optimistic_retries: 8,
            write_lock_spin_limit: 1024,
            metrics: None,
        }
    }
}

impl std::fmt::Debug for TreeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeOptions")
            .field("page_size", &self.page_size)
            .field("fat_tuple_headroom", &self.fat_tuple_headroom)
            .field("enable_fat_tuple", &self.enable_fat_tuple)
            .field("fat_tuple_threshold", &self.fat_tuple_threshold)
            .field("enable_wal", &self.enable_wal)
            .field("enable_graveyard", &self.enable_graveyard)
            .field("optimistic_retries", &self.optimistic_retries)
            .field("write_lock_spin_limit", &self.write_lock_spin_limit)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl TreeOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text).map_err(|e| VitreeError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Sets the page capacity.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the headroom kept free of fat tuples.
    pub fn fat_tuple_headroom(mut self, bytes: usize) -> Self {
        self.fat_tuple_headroom = bytes;
        self
    }

    /// Enables or disables fat-tuple conversion.
    pub fn enable_fat_tuple(mut self, enabled: bool) -> Self {
        self.enable_fat_tuple = enabled;
        self
    }

    /// Sets the chain length that triggers fat-tuple conversion.
    pub fn fat_tuple_threshold(mut self, versions: usize) -> Self {
        self.fat_tuple_threshold = Some(versions);
        self
    }

    /// Enables or disables WAL records.
    pub fn enable_wal(mut self, enabled: bool) -> Self {
        self.enable_wal = enabled;
        self
    }

    /// Enables or disables tombstone relocation to the graveyard.
    pub fn enable_graveyard(mut self, enabled: bool) -> Self {
        self.enable_graveyard = enabled;
        self
    }

    /// Sets the optimistic read budget.
    pub fn optimistic_retries(mut self, attempts: usize) -> Self {
        self.optimistic_retries = attempts;
        self
    }

    /// Sets the tuple write-lock spin budget.
    pub fn write_lock_spin_limit(mut self, attempts: usize) -> Self {
        self.write_lock_spin_limit = attempts;
        self
    }

    /// Sets the metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn MvccMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Largest encoded fat tuple.
    pub fn max_fat_tuple_length(&self) -> usize {
        self.page_size.saturating_sub(self.fat_tuple_headroom)
    }

    /// Chain length that triggers conversion for a pool of `workers`.
    pub fn conversion_threshold(&self, workers: usize) -> usize {
        self.fat_tuple_threshold.unwrap_or(workers).max(1)
    }

    /// Checks option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(VitreeError::Invalid("page_size must be in 1..=32768"));
        }
        if self.fat_tuple_headroom >= self.page_size {
            return Err(VitreeError::Invalid("fat_tuple_headroom must be below page_size"));
        }
        if self.optimistic_retries == 0 {
            return Err(VitreeError::Invalid("optimistic_retries must be non-zero"));
        }
        Ok(())
    }
}
