// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Options offered to a requester while they decide which one to play.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use teamup_common::PENDING_SELECTION_TIMEOUT_SECONDS;
use thiserror::Error;
use tracing::debug;

use crate::Candidate;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no pending selection for {0}")]
    NotFound(String),
    #[error("pending selection for {0} has expired")]
    Expired(String),
    #[error("option {option_no} is out of range (1-{available})")]
    OptionOutOfRange { option_no: usize, available: usize },
}

#[derive(Debug, Clone)]
struct PendingEntry {
    candidates: Vec<Candidate>,
    created_at: DateTime<Utc>,
}

/// Candidate pools keyed by requester, evicted after a fixed TTL.
///
/// A new offer for the same key replaces the old one. Expired entries are
/// dropped lazily on access and in bulk by [`PendingSelections::sweep`].
#[derive(Debug)]
pub struct PendingSelections {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl Default for PendingSelections {
    fn default() -> Self {
        Self::new(Duration::seconds(PENDING_SELECTION_TIMEOUT_SECONDS as i64))
    }
}

impl PendingSelections {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &PendingEntry, now: DateTime<Utc>) -> bool {
        now >= entry.created_at + self.ttl
    }

    /// Park `candidates` for `key`; returns when the offer expires.
    pub fn offer(&self, key: impl Into<String>, candidates: Vec<Candidate>) -> DateTime<Utc> {
        self.offer_at(key, candidates, Utc::now())
    }

    pub fn offer_at(
        &self,
        key: impl Into<String>,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let key = key.into();
        let replaced = self
            .entries()
            .insert(
                key.clone(),
                PendingEntry {
                    candidates,
                    created_at: now,
                },
            )
            .is_some();
        if replaced {
            debug!(key = %key, "replaced pending selection");
        }
        now + self.ttl
    }

    pub fn options(&self, key: &str) -> Result<Vec<Candidate>, SelectionError> {
        self.options_at(key, Utc::now())
    }

    pub fn options_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, SelectionError> {
        let mut entries = self.entries();
        let entry = entries
            .get(key)
            .ok_or_else(|| SelectionError::NotFound(key.to_string()))?;
        if self.is_expired(entry, now) {
            entries.remove(key);
            return Err(SelectionError::Expired(key.to_string()));
        }
        Ok(entry.candidates.clone())
    }

    /// Take option `option_no` (1-based) and close the selection.
    ///
    /// An out-of-range choice leaves the offer in place so the requester
    /// can try again.
    pub fn choose(&self, key: &str, option_no: usize) -> Result<Candidate, SelectionError> {
        self.choose_at(key, option_no, Utc::now())
    }

    pub fn choose_at(
        &self,
        key: &str,
        option_no: usize,
        now: DateTime<Utc>,
    ) -> Result<Candidate, SelectionError> {
        let mut entries = self.entries();
        let entry = entries
            .get(key)
            .ok_or_else(|| SelectionError::NotFound(key.to_string()))?;
        if self.is_expired(entry, now) {
            entries.remove(key);
            return Err(SelectionError::Expired(key.to_string()));
        }

        let available = entry.candidates.len();
        if option_no == 0 || option_no > available {
            return Err(SelectionError::OptionOutOfRange {
                option_no,
                available,
            });
        }

        let mut entry = entries
            .remove(key)
            .ok_or_else(|| SelectionError::NotFound(key.to_string()))?;
        Ok(entry.candidates.swap_remove(option_no - 1))
    }

    pub fn cancel(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Drop every expired offer; returns how many were evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.created_at + self.ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "swept expired selections");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
