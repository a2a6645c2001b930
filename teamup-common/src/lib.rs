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

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Hard cap on members per team (3-on-3 half court).
pub const MAX_TEAM_SIZE: usize = 3;
/// Rosters at or below this size are played as one team.
pub const SMALL_ROSTER_LIMIT: usize = 4;
pub const DEFAULT_NUM_OPTIONS: usize = 3;
/// Upper bound on options a single request may ask for.
pub const MAX_NUM_OPTIONS: usize = 10;
pub const DEFAULT_AVOID_RECENT_COUNT: usize = 1;
pub const DEFAULT_HISTORY_LIMIT: usize = 5;
pub const PENDING_SELECTION_TIMEOUT_SECONDS: u64 = 600;
pub const STRANGER_ID_PREFIX: &str = "STRANGER_";

pub type Identity = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionStatus {
    Selected,
    PendingSelection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionRequest {
    pub requester_id: String,
    /// Free-text roster, e.g. `Sun: [amy, bo] cat, dan, eve`.
    #[serde(default)]
    pub roster_text: Option<String>,
    #[serde(default)]
    pub groups: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub individuals: Option<Vec<String>>,
    #[serde(default)]
    pub num_options: Option<usize>,
    #[serde(default)]
    pub history_aware: Option<bool>,
    #[serde(default)]
    pub avoid_recent_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NameMapping {
    pub input: String,
    pub identity: Identity,
    pub stranger: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateView {
    /// 1-based, as shown to the user.
    pub option_no: usize,
    pub teams: Vec<Vec<Identity>>,
    #[serde(default)]
    pub similarity_score: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub record_id: String,
    pub channel_id: String,
    pub teams: Vec<Vec<Identity>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionResponse {
    pub channel_id: String,
    pub status: PartitionStatus,
    pub total_members: usize,
    pub team_sizes: Vec<usize>,
    pub options: Vec<CandidateView>,
    #[serde(default)]
    pub selected: Option<HistoryEntry>,
    pub mappings: Vec<NameMapping>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub requester_id: String,
    pub option_no: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResponse {
    pub channel_id: String,
    pub requester_id: String,
    pub selected: HistoryEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub channel_id: String,
    pub entries: Vec<HistoryEntry>,
}

/// Names and regex patterns that resolve to one identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AliasSet {
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AliasMember {
    pub identity: Identity,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasListResponse {
    pub members: Vec<AliasMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AliasImportFailure {
    pub identity: Identity,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasImportResponse {
    pub imported: usize,
    pub rejected: Vec<AliasImportFailure>,
}

/// Names pulled out of a free-text roster, before identity resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRoster {
    pub groups: Vec<Vec<String>>,
    pub individuals: Vec<String>,
}

impl ParsedRoster {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.individuals.is_empty()
    }

    pub fn name_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum::<usize>() + self.individuals.len()
    }

    /// Every name in roster order: grouped names first, then individuals.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.groups.iter().flatten().chain(self.individuals.iter())
    }
}

static LABEL_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^:：\[]*[:：]").expect("label prefix regex"));
static GROUP_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]").expect("group block regex"));
static NAME_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,，、\r\n]").expect("name separator regex"));

fn strip_label(text: &str) -> &str {
    match LABEL_PREFIX.find(text.trim_start()) {
        Some(found) => text.trim_start()[found.end()..].trim(),
        None => text.trim(),
    }
}

fn split_names(text: &str) -> Vec<String> {
    NAME_SEPARATOR
        .split(text)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Parse a roster like `Sun: [amy, bo, cy] dan、eve，fay`.
///
/// A leading `label:` is dropped. Each bracketed block becomes a pre-formed
/// group; everything else is split on `,` `，` `、` and newlines into
/// individuals. Oversize groups are kept whole so the engine can reject them.
pub fn parse_roster(text: &str) -> ParsedRoster {
    let body = strip_label(text);

    let groups: Vec<Vec<String>> = GROUP_BLOCK
        .captures_iter(body)
        .map(|caps| split_names(&caps[1]))
        .filter(|group| !group.is_empty())
        .collect();

    let outside = GROUP_BLOCK.replace_all(body, ",");
    let individuals = split_names(&outside);

    ParsedRoster {
        groups,
        individuals,
    }
}

/// True when the text names at least one player once parsed.
///
/// Blank text, a bare label (`Sun:`) and separators or brackets with nothing
/// between them are not rosters.
pub fn looks_like_roster(text: &str) -> bool {
    !parse_roster(text).is_empty()
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var regex")
    });
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
