// Copyright 2024-2026 Fluxserve Contributors
// SPDX-License-Identifier: Apache-2.0

//! Rolling activation history per model, for rollback and the status view.

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::Serialize;

use super::version::ModelVersion;

/// Bounded history length per model.
pub const DEFAULT_MAX_HISTORY: usize = 10;

/// How a version became active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSource {
    /// First load of the model name.
    Initial,
    /// Explicit switch while serving.
    HotSwap,
    /// Reverted to the previous entry.
    Rollback,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationEntry {
    pub version: ModelVersion,
    pub activated_at: SystemTime,
    pub deactivated_at: Option<SystemTime>,
    pub source: ActivationSource,
}

impl ActivationEntry {
    fn new(version: ModelVersion, source: ActivationSource) -> Self {
        Self {
            version,
            activated_at: SystemTime::now(),
            deactivated_at: None,
            source,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionHistory {
    entries: VecDeque<ActivationEntry>,
    max_entries: usize,
}

impl VersionHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_HISTORY)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries),
            max_entries,
        }
    }

    /// Record a new activation, deactivating the current one.
    pub fn record(&mut self, version: ModelVersion, source: ActivationSource) {
        if let Some(current) = self.entries.back_mut() {
            if current.is_active() {
                current.deactivated_at = Some(SystemTime::now());
            }
        }
        self.entries.push_back(ActivationEntry::new(version, source));
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn current(&self) -> Option<&ActivationEntry> {
        self.entries.back()
    }

    /// The previously active version, the rollback target.
    pub fn previous(&self) -> Option<&ActivationEntry> {
        self.entries
            .len()
            .checked_sub(2)
            .and_then(|i| self.entries.get(i))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ActivationEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for VersionHistory {
    fn default() -> Self {
        Self::new()
    }
}
