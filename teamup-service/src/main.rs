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

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use lambda_http::run as lambda_run;
use regex::Regex;
use serde::Deserialize;
use teamup_common::{
    AliasImportFailure, AliasImportResponse, AliasListResponse, AliasMember, AliasSet,
    CandidateView, DEFAULT_AVOID_RECENT_COUNT, DEFAULT_HISTORY_LIMIT, DEFAULT_NUM_OPTIONS,
    HistoryEntry, HistoryResponse, Identity, MAX_NUM_OPTIONS, NameMapping,
    PENDING_SELECTION_TIMEOUT_SECONDS, ParsedRoster, PartitionRequest, PartitionResponse,
    PartitionStatus, STRANGER_ID_PREFIX, SelectionRequest, SelectionResponse, expand_env_vars,
    looks_like_roster, parse_roster,
};
use teamup_engine::{
    Candidate, EngineError, HistoryRecord, PartitionOptions, PendingSelections, Roster,
    SelectionError, partition,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_PENDING_SWEEP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_HISTORY_CAPACITY: usize = 50;

#[derive(Clone)]
struct AppState {
    config: Arc<ServiceConfig>,
    history: Arc<dyn HistoryStore>,
    resolver: Arc<dyn IdentityResolver>,
    aliases: Arc<dyn AliasStore>,
    pending: Arc<PendingSelections>,
}

#[derive(Debug, Clone)]
struct ServiceConfig {
    alias_config_path: Option<String>,
    pending_timeout_seconds: u64,
    sweep_interval_seconds: u64,
    history_capacity: usize,
    default_num_options: usize,
    default_avoid_recent_count: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            alias_config_path: None,
            pending_timeout_seconds: PENDING_SELECTION_TIMEOUT_SECONDS,
            sweep_interval_seconds: DEFAULT_PENDING_SWEEP_INTERVAL_SECONDS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            default_num_options: DEFAULT_NUM_OPTIONS,
            default_avoid_recent_count: DEFAULT_AVOID_RECENT_COUNT,
        }
    }
}

impl ServiceConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            alias_config_path: std::env::var("ALIAS_CONFIG_PATH")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            pending_timeout_seconds: positive_or(
                std::env::var("PENDING_SELECTION_TIMEOUT_SECONDS").ok(),
                defaults.pending_timeout_seconds,
            ),
            sweep_interval_seconds: positive_or(
                std::env::var("PENDING_SWEEP_INTERVAL_SECONDS").ok(),
                defaults.sweep_interval_seconds,
            ),
            history_capacity: positive_or(
                std::env::var("HISTORY_CAPACITY").ok(),
                defaults.history_capacity,
            ),
            default_num_options: positive_or(
                std::env::var("DEFAULT_NUM_OPTIONS").ok(),
                defaults.default_num_options,
            )
            .min(MAX_NUM_OPTIONS),
            default_avoid_recent_count: positive_or(
                std::env::var("DEFAULT_AVOID_RECENT_COUNT").ok(),
                defaults.default_avoid_recent_count,
            ),
        }
    }

    fn pending_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.pending_timeout_seconds).unwrap_or(i64::MAX))
    }
}

/// Parse a positive number, falling back to `default` for missing, malformed or zero values.
fn positive_or<T>(value: Option<String>, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default,
{
    value
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|parsed| *parsed > T::default())
        .unwrap_or(default)
}

#[async_trait]
trait IdentityResolver: Send + Sync {
    /// Canonical identity for a display name, if known.
    async fn lookup(&self, raw_name: &str) -> anyhow::Result<Option<Identity>>;
}

#[async_trait]
trait HistoryStore: Send + Sync {
    /// Up to `limit` committed partitions for the channel, newest first.
    async fn recent(&self, channel_id: &str, limit: usize) -> anyhow::Result<Vec<HistoryEntry>>;
    async fn record(
        &self,
        channel_id: &str,
        teams: Vec<Vec<Identity>>,
    ) -> anyhow::Result<HistoryEntry>;
}

#[async_trait]
trait AliasStore: Send + Sync {
    /// Members whose identity or aliases contain `search`, in registration order.
    async fn list(&self, search: Option<&str>) -> anyhow::Result<Vec<AliasMember>>;
    async fn get(&self, identity: &str) -> anyhow::Result<Option<AliasMember>>;
    /// Merge `aliases` into the member, registering it if needed.
    async fn add(&self, identity: &str, aliases: AliasSet) -> anyhow::Result<AliasMember>;
    async fn remove_member(&self, identity: &str) -> anyhow::Result<Option<AliasMember>>;
    async fn remove_alias(
        &self,
        identity: &str,
        alias: &str,
    ) -> anyhow::Result<Option<AliasMember>>;
}

#[derive(Debug, Error)]
enum AliasError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("no aliases or patterns given")]
    NothingToAdd,
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("alias {alias:?} already belongs to {owner}")]
    Claimed { alias: String, owner: Identity },
}

#[derive(Debug, Default, Deserialize)]
struct AliasConfigFile {
    #[serde(default)]
    members: serde_yaml::Mapping,
}

/// Display-name lookup table.
///
/// Exact aliases (and the identity key itself) match case-insensitively;
/// regex patterns are tried afterwards in registration order.
#[derive(Debug, Default)]
struct AliasTable {
    members: Vec<AliasMember>,
    exact: HashMap<String, Identity>,
    patterns: Vec<(Regex, Identity)>,
}

impl AliasTable {
    fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let parsed: AliasConfigFile =
            serde_yaml::from_str(raw).context("failed to parse alias config yaml")?;

        let mut table = Self::default();
        for (key, value) in parsed.members {
            let Some(identity) = key.as_str().map(str::trim).filter(|id| !id.is_empty()) else {
                warn!(key = ?key, "ignoring non-string member key in alias config");
                continue;
            };
            let set = if value.is_null() {
                AliasSet::default()
            } else {
                match serde_yaml::from_value::<AliasSet>(value) {
                    Ok(set) => set,
                    Err(error) => {
                        warn!(identity = %identity, error = %error, "ignoring malformed alias entry");
                        continue;
                    }
                }
            };
            table.add_lenient(identity, set);
        }
        Ok(table)
    }

    /// File entries skip contested aliases and bad patterns with a warning.
    fn add_lenient(&mut self, identity: &str, set: AliasSet) {
        let mut aliases = Vec::with_capacity(set.aliases.len());
        for alias in std::iter::once(identity.to_string()).chain(set.aliases) {
            match self.owner_of(&alias) {
                Some(owner) if owner.as_str() != identity => {
                    warn!(alias = %alias, owner = %owner, identity = %identity, "alias already claimed");
                }
                _ => aliases.push(alias),
            }
        }

        let mut patterns = Vec::with_capacity(set.patterns.len());
        for pattern in set.patterns {
            match Regex::new(&pattern) {
                Ok(regex) => patterns.push((pattern, regex)),
                Err(error) => {
                    warn!(identity = %identity, pattern = %pattern, error = %error, "ignoring invalid alias pattern");
                }
            }
        }

        self.merge(identity, aliases, patterns);
    }

    fn add(&mut self, identity: &str, set: AliasSet) -> Result<AliasMember, AliasError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(AliasError::EmptyIdentity);
        }
        let aliases: Vec<String> = set
            .aliases
            .iter()
            .map(|alias| alias.trim().to_string())
            .filter(|alias| !alias.is_empty())
            .collect();
        if aliases.is_empty() && set.patterns.is_empty() {
            return Err(AliasError::NothingToAdd);
        }

        for alias in std::iter::once(identity).chain(aliases.iter().map(String::as_str)) {
            match self.owner_of(alias) {
                Some(owner) if owner.as_str() != identity => {
                    return Err(AliasError::Claimed {
                        alias: alias.to_string(),
                        owner: owner.clone(),
                    });
                }
                _ => {}
            }
        }

        let mut patterns = Vec::with_capacity(set.patterns.len());
        for pattern in set.patterns {
            match Regex::new(&pattern) {
                Ok(regex) => patterns.push((pattern, regex)),
                Err(error) => {
                    return Err(AliasError::InvalidPattern {
                        reason: error.to_string(),
                        pattern,
                    });
                }
            }
        }

        let mut names = vec![identity.to_string()];
        names.extend(aliases);
        Ok(self.merge(identity, names, patterns))
    }

    /// `names` may start with the identity itself; it is indexed but not
    /// listed as an alias.
    fn merge(
        &mut self,
        identity: &str,
        names: Vec<String>,
        patterns: Vec<(String, Regex)>,
    ) -> AliasMember {
        let index = match self
            .members
            .iter()
            .position(|member| member.identity == identity)
        {
            Some(index) => index,
            None => {
                self.members.push(AliasMember {
                    identity: identity.to_string(),
                    ..AliasMember::default()
                });
                self.members.len() - 1
            }
        };

        for name in names {
            let name = name.trim().to_string();
            let key = normalize_alias(&name);
            if key.is_empty() {
                continue;
            }
            self.exact
                .entry(key.clone())
                .or_insert_with(|| identity.to_string());
            let member = &mut self.members[index];
            let listed = member
                .aliases
                .iter()
                .any(|known| normalize_alias(known) == key);
            if name != identity && !listed {
                member.aliases.push(name);
            }
        }

        for (pattern, regex) in patterns {
            if self.members[index].patterns.contains(&pattern) {
                continue;
            }
            self.patterns.push((regex, identity.to_string()));
            self.members[index].patterns.push(pattern);
        }

        self.members[index].clone()
    }

    fn owner_of(&self, alias: &str) -> Option<&Identity> {
        self.exact.get(&normalize_alias(alias))
    }

    fn get(&self, identity: &str) -> Option<&AliasMember> {
        let identity = identity.trim();
        self.members
            .iter()
            .find(|member| member.identity == identity)
    }

    fn search(&self, term: Option<&str>) -> Vec<AliasMember> {
        let term = term.map(normalize_alias).unwrap_or_default();
        self.members
            .iter()
            .filter(|member| {
                term.is_empty()
                    || normalize_alias(&member.identity).contains(&term)
                    || member
                        .aliases
                        .iter()
                        .any(|alias| normalize_alias(alias).contains(&term))
            })
            .cloned()
            .collect()
    }

    fn remove_member(&mut self, identity: &str) -> Option<AliasMember> {
        let identity = identity.trim();
        let index = self
            .members
            .iter()
            .position(|member| member.identity == identity)?;
        let removed = self.members.remove(index);
        self.exact.retain(|_, owner| owner.as_str() != identity);
        self.patterns.retain(|(_, owner)| owner.as_str() != identity);
        Some(removed)
    }

    fn remove_alias(&mut self, identity: &str, alias: &str) -> Option<AliasMember> {
        let identity = identity.trim();
        let key = normalize_alias(alias);
        let member = self
            .members
            .iter_mut()
            .find(|member| member.identity == identity)?;
        let position = member
            .aliases
            .iter()
            .position(|known| normalize_alias(known) == key)?;
        member.aliases.remove(position);
        let updated = member.clone();

        let owned = self
            .exact
            .get(&key)
            .is_some_and(|owner| owner.as_str() == identity);
        if owned && key != normalize_alias(identity) {
            self.exact.remove(&key);
        }
        Some(updated)
    }

    fn lookup(&self, raw_name: &str) -> Option<Identity> {
        let key = normalize_alias(raw_name);
        if key.is_empty() {
            return None;
        }
        if let Some(identity) = self.exact.get(&key) {
            return Some(identity.clone());
        }
        let trimmed = raw_name.trim();
        self.patterns
            .iter()
            .find(|(regex, _)| regex.is_match(trimmed))
            .map(|(_, identity)| identity.clone())
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

fn normalize_alias(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Alias table shared by name resolution and the alias endpoints.
#[derive(Debug, Default)]
struct AliasRegistry {
    table: RwLock<AliasTable>,
}

impl AliasRegistry {
    fn new(table: AliasTable) -> Self {
        Self {
            table: RwLock::new(table),
        }
    }
}

#[async_trait]
impl IdentityResolver for AliasRegistry {
    async fn lookup(&self, raw_name: &str) -> anyhow::Result<Option<Identity>> {
        Ok(self.table.read().await.lookup(raw_name))
    }
}

#[async_trait]
impl AliasStore for AliasRegistry {
    async fn list(&self, search: Option<&str>) -> anyhow::Result<Vec<AliasMember>> {
        Ok(self.table.read().await.search(search))
    }

    async fn get(&self, identity: &str) -> anyhow::Result<Option<AliasMember>> {
        Ok(self.table.read().await.get(identity).cloned())
    }

    async fn add(&self, identity: &str, aliases: AliasSet) -> anyhow::Result<AliasMember> {
        Ok(self.table.write().await.add(identity, aliases)?)
    }

    async fn remove_member(&self, identity: &str) -> anyhow::Result<Option<AliasMember>> {
        Ok(self.table.write().await.remove_member(identity))
    }

    async fn remove_alias(
        &self,
        identity: &str,
        alias: &str,
    ) -> anyhow::Result<Option<AliasMember>> {
        Ok(self.table.write().await.remove_alias(identity, alias))
    }
}

fn load_alias_table(path: Option<&str>) -> AliasTable {
    let Some(path) = path else {
        return AliasTable::default();
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read alias config file");
            return AliasTable::default();
        }
    };

    if raw.trim().is_empty() {
        warn!(path = %path, "alias config file is empty");
        return AliasTable::default();
    }

    match AliasTable::from_yaml(&expand_env_vars(&raw)) {
        Ok(table) => {
            info!(path = %path, members = table.len(), "loaded alias config");
            table
        }
        Err(error) => {
            warn!(path = %path, error = %error, "failed to load alias config");
            AliasTable::default()
        }
    }
}

/// Resolve every name, numbering unknown ones `STRANGER_1`, `STRANGER_2`, ...
/// in order of first appearance.
async fn resolve_names(
    resolver: &dyn IdentityResolver,
    names: &[String],
) -> anyhow::Result<Vec<NameMapping>> {
    let mut strangers: HashMap<&str, Identity> = HashMap::new();
    let mut mappings = Vec::with_capacity(names.len());

    for name in names {
        let input = name.trim();
        let mapping = match resolver.lookup(input).await? {
            Some(identity) => NameMapping {
                input: input.to_string(),
                identity,
                stranger: false,
            },
            None => {
                let next_no = strangers.len() + 1;
                let identity = strangers
                    .entry(input)
                    .or_insert_with(|| format!("{STRANGER_ID_PREFIX}{next_no}"))
                    .clone();
                NameMapping {
                    input: input.to_string(),
                    identity,
                    stranger: true,
                }
            }
        };
        mappings.push(mapping);
    }

    Ok(mappings)
}

struct InMemoryHistoryStore {
    capacity: usize,
    channels: RwLock<HashMap<String, VecDeque<HistoryEntry>>>,
}

impl InMemoryHistoryStore {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn recent(&self, channel_id: &str, limit: usize) -> anyhow::Result<Vec<HistoryEntry>> {
        let channels = self.channels.read().await;
        Ok(channels
            .get(channel_id)
            .map(|entries| entries.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn record(
        &self,
        channel_id: &str,
        teams: Vec<Vec<Identity>>,
    ) -> anyhow::Result<HistoryEntry> {
        let entry = HistoryEntry {
            record_id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            teams,
            created_at: Utc::now(),
        };

        let mut channels = self.channels.write().await;
        let entries = channels.entry(channel_id.to_string()).or_default();
        entries.push_front(entry.clone());
        entries.truncate(self.capacity);
        Ok(entry)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "teamup_service=debug,teamup_engine=debug,tower_http=info".to_string()
        }))
        .init();

    let config = ServiceConfig::from_env();
    let aliases = load_alias_table(config.alias_config_path.as_deref());
    info!(
        alias_members = aliases.len(),
        pending_timeout_seconds = config.pending_timeout_seconds,
        history_capacity = config.history_capacity,
        default_num_options = config.default_num_options,
        "teamup-service loaded config"
    );

    let aliases = Arc::new(AliasRegistry::new(aliases));
    let state = AppState {
        history: Arc::new(InMemoryHistoryStore::new(config.history_capacity)),
        resolver: aliases.clone(),
        aliases,
        pending: Arc::new(PendingSelections::new(config.pending_ttl())),
        config: Arc::new(config),
    };

    spawn_pending_sweeper(
        state.pending.clone(),
        Duration::from_secs(state.config.sweep_interval_seconds),
    );

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running teamup-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr("TEAMUP_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "teamup-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_pending_sweeper(
    pending: Arc<PendingSelections>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = pending.sweep();
            if evicted > 0 {
                debug!(evicted, remaining = pending.len(), "pending selection sweep");
            }
        }
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/channels/{channel_id}/partitions",
            post(create_partition_handler),
        )
        .route(
            "/v1/channels/{channel_id}/selections",
            post(select_option_handler),
        )
        .route(
            "/v1/channels/{channel_id}/selections/{requester_id}",
            delete(cancel_selection_handler),
        )
        .route(
            "/v1/channels/{channel_id}/history",
            get(get_history_handler),
        )
        .route(
            "/v1/aliases",
            get(list_aliases_handler).post(import_aliases_handler),
        )
        .route(
            "/v1/aliases/{identity}",
            get(get_alias_handler)
                .post(add_aliases_handler)
                .delete(delete_alias_member_handler),
        )
        .route(
            "/v1/aliases/{identity}/{alias}",
            delete(delete_alias_handler),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "teamup-service"}))
}

fn pending_key(channel_id: &str, requester_id: &str) -> String {
    format!("{channel_id}/{requester_id}")
}

fn clean_names(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn run_engine(
    roster: &Roster,
    options: &PartitionOptions,
    history: &[HistoryRecord],
) -> Result<Vec<Candidate>, EngineError> {
    let mut rng = rand::rng();
    partition(roster, options, history, &mut rng)
}

async fn create_partition_handler(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(request): Json<PartitionRequest>,
) -> Result<Json<PartitionResponse>, ApiError> {
    let requester_id = request.requester_id.trim().to_string();
    if requester_id.is_empty() {
        return Err(ApiError::bad_request("requester_id is required"));
    }

    let mut parsed = match request.roster_text.as_deref() {
        Some(text) if looks_like_roster(text) => parse_roster(text),
        _ => ParsedRoster::default(),
    };
    parsed.groups.extend(
        request
            .groups
            .unwrap_or_default()
            .into_iter()
            .map(clean_names)
            .filter(|group| !group.is_empty()),
    );
    parsed
        .individuals
        .extend(clean_names(request.individuals.unwrap_or_default()));

    let names: Vec<String> = parsed.names().cloned().collect();
    let mappings = resolve_names(state.resolver.as_ref(), &names)
        .await
        .map_err(|error| ApiError::internal(format!("identity lookup failed: {error}")))?;

    let mut resolved = mappings.iter().map(|mapping| mapping.identity.clone());
    let groups: Vec<Vec<Identity>> = parsed
        .groups
        .iter()
        .map(|group| resolved.by_ref().take(group.len()).collect())
        .collect();
    let roster = Roster::new(groups, resolved.collect());

    let history_aware = request.history_aware.unwrap_or(false);
    let num_options = request.num_options.unwrap_or(if history_aware {
        1
    } else {
        state.config.default_num_options
    });
    if num_options > MAX_NUM_OPTIONS {
        return Err(ApiError::bad_request(format!(
            "num_options must be at most {MAX_NUM_OPTIONS}"
        )));
    }
    let avoid_recent_count = request
        .avoid_recent_count
        .unwrap_or(state.config.default_avoid_recent_count);
    let options = PartitionOptions {
        num_options,
        history_aware,
        avoid_recent_count,
    };

    let history: Vec<HistoryRecord> = if history_aware {
        state
            .history
            .recent(&channel_id, avoid_recent_count)
            .await
            .map_err(|error| ApiError::internal(format!("history lookup failed: {error}")))?
            .iter()
            .map(|entry| HistoryRecord::from_teams(&entry.teams))
            .collect()
    } else {
        Vec::new()
    };

    let candidates = run_engine(&roster, &options, &history)?;
    let first = candidates
        .first()
        .ok_or_else(|| ApiError::internal("engine returned no candidates"))?;
    let total_members = first.partition.total_members();
    let team_sizes = first.partition.team_sizes();

    let views: Vec<CandidateView> = candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| CandidateView {
            option_no: index + 1,
            teams: candidate.partition.teams.clone(),
            similarity_score: history_aware.then_some(candidate.similarity_score),
        })
        .collect();

    let key = pending_key(&channel_id, &requester_id);
    let (status, selected, expires_at) = if candidates.len() == 1 {
        state.pending.cancel(&key);
        let teams = candidates
            .into_iter()
            .next()
            .map(|candidate| candidate.partition.into_teams())
            .unwrap_or_default();
        let entry = state
            .history
            .record(&channel_id, teams)
            .await
            .map_err(|error| ApiError::internal(format!("history record failed: {error}")))?;
        (PartitionStatus::Selected, Some(entry), None)
    } else {
        let expires_at = state.pending.offer(key, candidates);
        (PartitionStatus::PendingSelection, None, Some(expires_at))
    };

    info!(
        channel_id = %channel_id,
        requester_id = %requester_id,
        total_members,
        options = views.len(),
        history_aware,
        status = ?status,
        "partition request served"
    );

    Ok(Json(PartitionResponse {
        channel_id,
        status,
        total_members,
        team_sizes,
        options: views,
        selected,
        mappings,
        expires_at,
    }))
}

async fn select_option_handler(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(request): Json<SelectionRequest>,
) -> Result<Json<SelectionResponse>, ApiError> {
    let requester_id = request.requester_id.trim().to_string();
    let key = pending_key(&channel_id, &requester_id);
    let chosen = state.pending.choose(&key, request.option_no)?;

    let selected = state
        .history
        .record(&channel_id, chosen.partition.into_teams())
        .await
        .map_err(|error| ApiError::internal(format!("history record failed: {error}")))?;

    info!(
        channel_id = %channel_id,
        requester_id = %requester_id,
        option_no = request.option_no,
        record_id = %selected.record_id,
        "pending selection committed"
    );

    Ok(Json(SelectionResponse {
        channel_id,
        requester_id,
        selected,
    }))
}

async fn cancel_selection_handler(
    State(state): State<AppState>,
    Path((channel_id, requester_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.pending.cancel(&pending_key(&channel_id, &requester_id)) {
        return Err(ApiError::not_found(format!(
            "no pending selection for {requester_id} in {channel_id}"
        )));
    }

    info!(channel_id = %channel_id, requester_id = %requester_id, "pending selection cancelled");
    Ok(Json(serde_json::json!({
        "channel_id": channel_id,
        "requester_id": requester_id,
        "cancelled": true
    })))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn get_history_handler(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(state.config.history_capacity);
    let entries = state
        .history
        .recent(&channel_id, limit)
        .await
        .map_err(|error| ApiError::internal(format!("history lookup failed: {error}")))?;

    Ok(Json(HistoryResponse {
        channel_id,
        entries,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct AliasQuery {
    search: Option<String>,
}

async fn list_aliases_handler(
    State(state): State<AppState>,
    Query(query): Query<AliasQuery>,
) -> Result<Json<AliasListResponse>, ApiError> {
    let members = state
        .aliases
        .list(query.search.as_deref())
        .await
        .map_err(ApiError::from_alias)?;
    Ok(Json(AliasListResponse { members }))
}

async fn get_alias_handler(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<AliasMember>, ApiError> {
    state
        .aliases
        .get(&identity)
        .await
        .map_err(ApiError::from_alias)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no aliases registered for {identity}")))
}

async fn add_aliases_handler(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(aliases): Json<AliasSet>,
) -> Result<Json<AliasMember>, ApiError> {
    let member = state
        .aliases
        .add(&identity, aliases)
        .await
        .map_err(ApiError::from_alias)?;

    info!(
        identity = %member.identity,
        aliases = member.aliases.len(),
        patterns = member.patterns.len(),
        "aliases updated"
    );
    Ok(Json(member))
}

async fn delete_alias_member_handler(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<AliasMember>, ApiError> {
    let removed = state
        .aliases
        .remove_member(&identity)
        .await
        .map_err(ApiError::from_alias)?
        .ok_or_else(|| ApiError::not_found(format!("no aliases registered for {identity}")))?;

    info!(identity = %removed.identity, "alias member removed");
    Ok(Json(removed))
}

async fn delete_alias_handler(
    State(state): State<AppState>,
    Path((identity, alias)): Path<(String, String)>,
) -> Result<Json<AliasMember>, ApiError> {
    let updated = state
        .aliases
        .remove_alias(&identity, &alias)
        .await
        .map_err(ApiError::from_alias)?
        .ok_or_else(|| ApiError::not_found(format!("{identity} has no alias {alias:?}")))?;

    info!(identity = %updated.identity, alias = %alias, "alias removed");
    Ok(Json(updated))
}

/// Register many members at once; bad entries are reported, not fatal.
async fn import_aliases_handler(
    State(state): State<AppState>,
    Json(members): Json<Vec<AliasMember>>,
) -> Result<Json<AliasImportResponse>, ApiError> {
    let mut imported = 0;
    let mut rejected = Vec::new();

    for member in members {
        let set = AliasSet {
            aliases: member.aliases,
            patterns: member.patterns,
        };
        let outcome = state.aliases.add(&member.identity, set).await;
        match outcome {
            Ok(_) => imported += 1,
            Err(error) if error.downcast_ref::<AliasError>().is_some() => {
                rejected.push(AliasImportFailure {
                    identity: member.identity,
                    error: error.to_string(),
                });
            }
            Err(error) => return Err(ApiError::from_alias(error)),
        }
    }

    info!(imported, rejected = rejected.len(), "alias import finished");
    Ok(Json(AliasImportResponse { imported, rejected }))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn gone(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GONE,
            message: message.into(),
        }
    }

    fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }
}

impl ApiError {
    fn from_alias(error: anyhow::Error) -> Self {
        match error.downcast_ref::<AliasError>() {
            Some(AliasError::Claimed { .. }) => Self::conflict(error.to_string()),
            Some(_) => Self::bad_request(error.to_string()),
            None => Self::internal(format!("alias store failed: {error}")),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::NoFeasiblePartition { .. } => Self::unprocessable(error.to_string()),
            EngineError::GroupTooLarge { .. }
            | EngineError::InvalidOptions(_)
            | EngineError::EmptyRoster => Self::bad_request(error.to_string()),
        }
    }
}

impl From<SelectionError> for ApiError {
    fn from(error: SelectionError) -> Self {
        match error {
            SelectionError::NotFound(_) => Self::not_found(error.to_string()),
            SelectionError::Expired(_) => Self::gone(error.to_string()),
            SelectionError::OptionOutOfRange { .. } => Self::bad_request(error.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    struct FailingHistoryStore;

    #[async_trait]
    impl HistoryStore for FailingHistoryStore {
        async fn recent(
            &self,
            _channel_id: &str,
            _limit: usize,
        ) -> anyhow::Result<Vec<HistoryEntry>> {
            anyhow::bail!("history backend unavailable")
        }

        async fn record(
            &self,
            _channel_id: &str,
            _teams: Vec<Vec<Identity>>,
        ) -> anyhow::Result<HistoryEntry> {
            anyhow::bail!("history backend unavailable")
        }
    }

    #[derive(Default)]
    struct RecordingResolver {
        lookups: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IdentityResolver for RecordingResolver {
        async fn lookup(&self, raw_name: &str) -> anyhow::Result<Option<Identity>> {
            self.lookups.lock().unwrap().push(raw_name.to_string());
            Ok(raw_name
                .strip_prefix("@")
                .map(|identity| identity.to_string()))
        }
    }

    const ALIASES: &str = r#"
members:
  amy:
    aliases: ["Amy Lee", "shared"]
  bo:
    aliases: ["shared"]
    patterns: ["^bo+b?$", "(?i)^robert", "(["]
  cy:
"#;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn app_state_with(resolver: Arc<dyn IdentityResolver>, ttl: chrono::Duration) -> AppState {
        AppState {
            config: Arc::new(ServiceConfig::default()),
            history: Arc::new(InMemoryHistoryStore::new(DEFAULT_HISTORY_CAPACITY)),
            resolver,
            aliases: Arc::new(AliasRegistry::default()),
            pending: Arc::new(PendingSelections::new(ttl)),
        }
    }

    fn app_state() -> AppState {
        let registry = Arc::new(AliasRegistry::new(AliasTable::from_yaml(ALIASES).unwrap()));
        AppState {
            resolver: registry.clone(),
            aliases: registry,
            ..app_state_with(
                Arc::new(AliasRegistry::default()),
                chrono::Duration::minutes(10),
            )
        }
    }

    fn individuals_request(requester_id: &str, players: &[&str]) -> PartitionRequest {
        PartitionRequest {
            requester_id: requester_id.to_string(),
            individuals: Some(names(players)),
            ..PartitionRequest::default()
        }
    }

    fn nine_players() -> Vec<&'static str> {
        vec!["p1", "p2", "p3", "p4", "p5", "p6", "p7", "p8", "p9"]
    }

    fn canonical(teams: &[Vec<Identity>]) -> BTreeSet<BTreeSet<Identity>> {
        teams
            .iter()
            .map(|team| team.iter().cloned().collect())
            .collect()
    }

    async fn create(
        state: &AppState,
        channel_id: &str,
        request: PartitionRequest,
    ) -> Result<Json<PartitionResponse>, ApiError> {
        create_partition_handler(
            State(state.clone()),
            Path(channel_id.to_string()),
            Json(request),
        )
        .await
    }

    async fn select(
        state: &AppState,
        channel_id: &str,
        requester_id: &str,
        option_no: usize,
    ) -> Result<Json<SelectionResponse>, ApiError> {
        select_option_handler(
            State(state.clone()),
            Path(channel_id.to_string()),
            Json(SelectionRequest {
                requester_id: requester_id.to_string(),
                option_no,
            }),
        )
        .await
    }

    #[test]
    fn positive_or_rejects_zero_and_garbage() {
        assert_eq!(positive_or(Some("7".to_string()), 3usize), 7);
        assert_eq!(positive_or(Some(" 12 ".to_string()), 3u64), 12);
        assert_eq!(positive_or(Some("0".to_string()), 3usize), 3);
        assert_eq!(positive_or(Some("-4".to_string()), 3usize), 3);
        assert_eq!(positive_or(Some("many".to_string()), 3usize), 3);
        assert_eq!(positive_or(None, 600u64), 600);
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.pending_ttl(), chrono::Duration::seconds(600));
        assert_eq!(config.sweep_interval_seconds, 60);
        assert_eq!(config.history_capacity, 50);
        assert_eq!(config.default_num_options, 3);
        assert_eq!(config.default_avoid_recent_count, 1);
        assert!(config.alias_config_path.is_none());
    }

    #[test]
    fn alias_table_resolves_aliases_keys_and_patterns() {
        let table = AliasTable::from_yaml(ALIASES).unwrap();

        assert_eq!(table.lookup(" AMY LEE "), Some("amy".to_string()));
        assert_eq!(table.lookup("Amy"), Some("amy".to_string()));
        assert_eq!(table.lookup("cy"), Some("cy".to_string()));
        assert_eq!(table.lookup("booob"), Some("bo".to_string()));
        assert_eq!(table.lookup("Robert Smith"), Some("bo".to_string()));
        assert_eq!(table.lookup("dan"), None);
        assert_eq!(table.lookup("   "), None);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn alias_table_keeps_first_claim_on_shared_alias() {
        let table = AliasTable::from_yaml(ALIASES).unwrap();
        assert_eq!(table.lookup("shared"), Some("amy".to_string()));
        assert_eq!(table.get("bo").unwrap().aliases, Vec::<String>::new());
        // the invalid pattern is skipped, the other two remain
        assert_eq!(table.patterns.len(), 2);
        assert_eq!(table.get("bo").unwrap().patterns.len(), 2);
    }

    #[test]
    fn alias_table_rejects_malformed_yaml() {
        assert!(AliasTable::from_yaml("members: [").is_err());
    }

    #[test]
    fn missing_alias_file_yields_empty_table() {
        assert_eq!(load_alias_table(None).len(), 0);
        assert_eq!(
            load_alias_table(Some("/definitely/not/here/aliases.yaml")).len(),
            0
        );
    }

    #[tokio::test]
    async fn resolve_names_numbers_strangers_by_first_appearance() {
        let registry = AliasRegistry::new(AliasTable::from_yaml(ALIASES).unwrap());
        let mappings = resolve_names(&registry, &names(&["Amy Lee", "zed", "yan", " zed", "bo"]))
            .await
            .unwrap();

        let identities: Vec<&str> = mappings
            .iter()
            .map(|mapping| mapping.identity.as_str())
            .collect();
        assert_eq!(
            identities,
            vec!["amy", "STRANGER_1", "STRANGER_2", "STRANGER_1", "bo"]
        );
        assert_eq!(
            mappings.iter().filter(|mapping| mapping.stranger).count(),
            3
        );
        assert_eq!(mappings[3].input, "zed");
    }

    #[tokio::test]
    async fn history_store_is_newest_first_and_capped_per_channel() {
        let store = InMemoryHistoryStore::new(2);
        for round in 1..=3 {
            store
                .record("c1", vec![vec![format!("round{round}")]])
                .await
                .unwrap();
        }
        store.record("c2", vec![vec!["other".to_string()]]).await.unwrap();

        let recent = store.recent("c1", 10).await.unwrap();
        let firsts: Vec<&str> = recent.iter().map(|entry| entry.teams[0][0].as_str()).collect();
        assert_eq!(firsts, vec!["round3", "round2"]);
        assert_eq!(store.recent("c1", 1).await.unwrap().len(), 1);
        assert_eq!(store.recent("c2", 10).await.unwrap().len(), 1);
        assert!(store.recent("nobody", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plain_request_parks_three_options() {
        let state = app_state();
        let response = create(&state, "c1", individuals_request("u1", &nine_players()))
            .await
            .unwrap()
            .0;

        assert_eq!(response.status, PartitionStatus::PendingSelection);
        assert_eq!(response.total_members, 9);
        assert_eq!(response.team_sizes, vec![3, 3, 3]);
        assert_eq!(response.options.len(), 3);
        assert!(response.selected.is_none());
        assert!(response.expires_at.is_some());
        for (index, option) in response.options.iter().enumerate() {
            assert_eq!(option.option_no, index + 1);
            assert_eq!(option.teams.iter().map(Vec::len).sum::<usize>(), 9);
            assert!(option.similarity_score.is_none());
        }
        assert_eq!(state.pending.len(), 1);
        assert!(state.history.recent("c1", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn selecting_an_option_records_it_and_closes_the_offer() {
        let state = app_state();
        let response = create(&state, "c1", individuals_request("u1", &nine_players()))
            .await
            .unwrap()
            .0;

        let selection = select(&state, "c1", "u1", 2).await.unwrap().0;
        assert_eq!(selection.selected.teams, response.options[1].teams);
        assert_eq!(selection.requester_id, "u1");

        let history = state.history.recent("c1", 5).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].record_id, selection.selected.record_id);

        let error = select(&state, "c1", "u1", 1).await.unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn out_of_range_selection_keeps_the_offer() {
        let state = app_state();
        create(&state, "c1", individuals_request("u1", &nine_players()))
            .await
            .unwrap();

        for option_no in [0, 4] {
            let error = select(&state, "c1", "u1", option_no).await.unwrap_err();
            assert_eq!(error.status, StatusCode::BAD_REQUEST);
        }
        assert!(select(&state, "c1", "u1", 3).await.is_ok());
    }

    #[tokio::test]
    async fn offers_are_scoped_to_channel_and_requester() {
        let state = app_state();
        create(&state, "c1", individuals_request("u1", &nine_players()))
            .await
            .unwrap();

        let other_requester = select(&state, "c1", "u2", 1).await.unwrap_err();
        assert_eq!(other_requester.status, StatusCode::NOT_FOUND);
        let other_channel = select(&state, "c2", "u1", 1).await.unwrap_err();
        assert_eq!(other_channel.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn expired_offer_is_gone() {
        let state = app_state_with(
            Arc::new(AliasRegistry::default()),
            chrono::Duration::zero(),
        );
        create(&state, "c1", individuals_request("u1", &nine_players()))
            .await
            .unwrap();

        let error = select(&state, "c1", "u1", 1).await.unwrap_err();
        assert_eq!(error.status, StatusCode::GONE);
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn small_roster_is_committed_immediately() {
        let state = app_state();
        let response = create(&state, "c1", individuals_request("u1", &["amy", "bo", "cy"]))
            .await
            .unwrap()
            .0;

        assert_eq!(response.status, PartitionStatus::Selected);
        assert_eq!(response.team_sizes, vec![3]);
        assert_eq!(response.options.len(), 1);
        assert!(response.expires_at.is_none());
        let selected = response.selected.unwrap();
        assert_eq!(
            state.history.recent("c1", 5).await.unwrap()[0].record_id,
            selected.record_id
        );
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn history_aware_request_defaults_to_one_scored_option() {
        let state = app_state();
        let request = PartitionRequest {
            history_aware: Some(true),
            ..individuals_request("u1", &nine_players())
        };
        let response = create(&state, "c1", request).await.unwrap().0;

        assert_eq!(response.status, PartitionStatus::Selected);
        assert_eq!(response.options.len(), 1);
        assert_eq!(response.options[0].similarity_score, Some(0));
        assert!(response.selected.is_some());
    }

    #[tokio::test]
    async fn history_aware_request_never_repeats_the_last_partition() {
        let state = app_state();
        let players = nine_players();
        state
            .history
            .record(
                "c1",
                vec![
                    names(&players[0..3]),
                    names(&players[3..6]),
                    names(&players[6..9]),
                ],
            )
            .await
            .unwrap();

        for _ in 0..10 {
            let last = state.history.recent("c1", 1).await.unwrap().remove(0);
            let request = PartitionRequest {
                history_aware: Some(true),
                ..individuals_request("u1", &players)
            };
            let response = create(&state, "c1", request).await.unwrap().0;
            let option = &response.options[0];
            assert_ne!(canonical(&option.teams), canonical(&last.teams));
            assert!(option.similarity_score.unwrap() < 100);
        }
    }

    #[tokio::test]
    async fn text_roster_keeps_groups_and_maps_strangers() {
        let state = app_state();
        let request = PartitionRequest {
            requester_id: "u1".to_string(),
            roster_text: Some("Sun: [Amy Lee, zed] bo, cy".to_string()),
            individuals: Some(names(&["  ", "dan"])),
            ..PartitionRequest::default()
        };
        let response = create(&state, "c1", request).await.unwrap().0;

        assert_eq!(response.total_members, 5);
        assert_eq!(response.team_sizes, vec![3, 2]);
        let inputs: Vec<&str> = response
            .mappings
            .iter()
            .map(|mapping| mapping.input.as_str())
            .collect();
        assert_eq!(inputs, vec!["Amy Lee", "zed", "bo", "cy", "dan"]);
        assert_eq!(response.mappings[1].identity, "STRANGER_1");
        assert_eq!(response.mappings[4].identity, "STRANGER_2");

        for option in &response.options {
            let together = option.teams.iter().any(|team| {
                team.contains(&"amy".to_string()) && team.contains(&"STRANGER_1".to_string())
            });
            assert!(together, "group split in {:?}", option.teams);
        }
    }

    #[tokio::test]
    async fn request_lists_are_resolved_through_the_resolver() {
        let resolver = Arc::new(RecordingResolver::default());
        let state = app_state_with(resolver.clone(), chrono::Duration::minutes(10));
        let request = PartitionRequest {
            requester_id: "u1".to_string(),
            groups: Some(vec![names(&["@amy", "@bo"]), Vec::new()]),
            individuals: Some(names(&["@cy", "dan"])),
            ..PartitionRequest::default()
        };
        let response = create(&state, "c1", request).await.unwrap().0;

        assert_eq!(
            *resolver.lookups.lock().unwrap(),
            names(&["@amy", "@bo", "@cy", "dan"])
        );
        assert_eq!(response.status, PartitionStatus::Selected);
        assert_eq!(
            response.options[0].teams,
            vec![names(&["amy", "bo", "cy", "STRANGER_1"])]
        );
    }

    #[tokio::test]
    async fn oversize_group_is_bad_request() {
        let state = app_state();
        let request = PartitionRequest {
            requester_id: "u1".to_string(),
            roster_text: Some("[a, b, c, d] e, f".to_string()),
            ..PartitionRequest::default()
        };
        let error = create(&state, "c1", request).await.unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(error.message.contains("group"), "{}", error.message);
    }

    #[tokio::test]
    async fn empty_roster_and_missing_requester_are_bad_requests() {
        let state = app_state();
        let empty = create(&state, "c1", individuals_request("u1", &[])).await.unwrap_err();
        assert_eq!(empty.status, StatusCode::BAD_REQUEST);

        let anonymous = create(&state, "c1", individuals_request(" ", &["a", "b"]))
            .await
            .unwrap_err();
        assert_eq!(anonymous.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn zero_options_is_bad_request() {
        let state = app_state();
        let request = PartitionRequest {
            num_options: Some(0),
            ..individuals_request("u1", &nine_players())
        };
        let error = create(&state, "c1", request).await.unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_removes_pending_offer() {
        let state = app_state();
        create(&state, "c1", individuals_request("u1", &nine_players()))
            .await
            .unwrap();

        let cancelled = cancel_selection_handler(
            State(state.clone()),
            Path(("c1".to_string(), "u1".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(cancelled.0["cancelled"], true);

        let again = cancel_selection_handler(
            State(state.clone()),
            Path(("c1".to_string(), "u1".to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(again.status, StatusCode::NOT_FOUND);

        let error = select(&state, "c1", "u1", 1).await.unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn committed_partition_supersedes_pending_offer() {
        let state = app_state();
        create(&state, "c1", individuals_request("u1", &nine_players()))
            .await
            .unwrap();
        create(&state, "c1", individuals_request("u1", &["a", "b"]))
            .await
            .unwrap();

        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn history_endpoint_defaults_to_five_newest() {
        let state = app_state();
        for round in 0..7 {
            state
                .history
                .record("c1", vec![vec![format!("r{round}")]])
                .await
                .unwrap();
        }

        let all = get_history_handler(
            State(state.clone()),
            Path("c1".to_string()),
            Query(HistoryQuery::default()),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(all.entries.len(), 5);
        assert_eq!(all.entries[0].teams, vec![vec!["r6".to_string()]]);

        let two = get_history_handler(
            State(state.clone()),
            Path("c1".to_string()),
            Query(HistoryQuery { limit: Some(2) }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(two.entries.len(), 2);
    }

    #[tokio::test]
    async fn history_backend_failure_is_internal_error() {
        let state = AppState {
            history: Arc::new(FailingHistoryStore),
            ..app_state()
        };
        let request = PartitionRequest {
            history_aware: Some(true),
            ..individuals_request("u1", &nine_players())
        };
        let error = create(&state, "c1", request).await.unwrap_err();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn engine_errors_map_to_http_statuses() {
        let cases = [
            (
                ApiError::from(EngineError::NoFeasiblePartition { attempts: 30 }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(EngineError::EmptyRoster),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(SelectionError::Expired("c1/u1".to_string())),
                StatusCode::GONE,
            ),
            (
                ApiError::from(SelectionError::NotFound("c1/u1".to_string())),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.status, status);
        }
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let response = health().await.0;
        assert_eq!(response["ok"], true);
        assert_eq!(response["service"], "teamup-service");
    }

    #[tokio::test]
    async fn num_options_above_the_cap_is_bad_request() {
        let state = app_state();
        let too_many = PartitionRequest {
            num_options: Some(MAX_NUM_OPTIONS + 1),
            ..individuals_request("u1", &nine_players())
        };
        let error = create(&state, "c1", too_many).await.unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(state.pending.is_empty());

        let at_cap = PartitionRequest {
            num_options: Some(MAX_NUM_OPTIONS),
            ..individuals_request("u1", &nine_players())
        };
        let response = create(&state, "c1", at_cap).await.unwrap().0;
        assert_eq!(response.options.len(), MAX_NUM_OPTIONS);
    }

    async fn add_aliases(
        state: &AppState,
        identity: &str,
        aliases: &[&str],
        patterns: &[&str],
    ) -> Result<Json<AliasMember>, ApiError> {
        add_aliases_handler(
            State(state.clone()),
            Path(identity.to_string()),
            Json(AliasSet {
                aliases: names(aliases),
                patterns: names(patterns),
            }),
        )
        .await
    }

    async fn list_aliases(state: &AppState, search: Option<&str>) -> Vec<AliasMember> {
        list_aliases_handler(
            State(state.clone()),
            Query(AliasQuery {
                search: search.map(str::to_string),
            }),
        )
        .await
        .unwrap()
        .0
        .members
    }

    #[tokio::test]
    async fn alias_list_exports_members_and_filters_by_search() {
        let state = app_state();

        let all = list_aliases(&state, None).await;
        let identities: Vec<&str> = all.iter().map(|member| member.identity.as_str()).collect();
        assert_eq!(identities, vec!["amy", "bo", "cy"]);
        assert_eq!(all[0].aliases, names(&["Amy Lee", "shared"]));

        let found = list_aliases(&state, Some("LEE")).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identity, "amy");
        assert!(list_aliases(&state, Some("nobody")).await.is_empty());
    }

    #[tokio::test]
    async fn added_alias_resolves_in_the_next_partition() {
        let state = app_state();
        let member = add_aliases(&state, "dan", &["Daniel", " Dan the Man "], &[])
            .await
            .unwrap()
            .0;
        assert_eq!(member.aliases, names(&["Daniel", "Dan the Man"]));

        let merged = add_aliases(&state, "dan", &["daniel", "DD"], &["^d+$"])
            .await
            .unwrap()
            .0;
        assert_eq!(merged.aliases, names(&["Daniel", "Dan the Man", "DD"]));
        assert_eq!(merged.patterns, names(&["^d+$"]));

        let fetched = get_alias_handler(State(state.clone()), Path("dan".to_string()))
            .await
            .unwrap()
            .0;
        assert_eq!(fetched, merged);

        let response = create(&state, "c1", individuals_request("u1", &["dan the man", "Amy"]))
            .await
            .unwrap()
            .0;
        assert_eq!(response.mappings[0].identity, "dan");
        assert!(response.mappings.iter().all(|mapping| !mapping.stranger));
        assert_eq!(
            state.resolver.lookup("ddd").await.unwrap(),
            Some("dan".to_string())
        );
    }

    #[tokio::test]
    async fn adding_a_claimed_alias_is_a_conflict() {
        let state = app_state();
        let error = add_aliases(&state, "dan", &["Amy Lee"], &[]).await.unwrap_err();
        assert_eq!(error.status, StatusCode::CONFLICT);

        let own_key = add_aliases(&state, "shared", &["x"], &[]).await.unwrap_err();
        assert_eq!(own_key.status, StatusCode::CONFLICT);
        assert_eq!(list_aliases(&state, None).await.len(), 3);
    }

    #[tokio::test]
    async fn malformed_alias_updates_are_bad_requests() {
        let state = app_state();
        for (identity, aliases, patterns) in [
            ("dan", vec![], vec!["(["]),
            ("dan", vec!["  "], vec![]),
            ("  ", vec!["x"], vec![]),
        ] {
            let error = add_aliases(&state, identity, &aliases, &patterns)
                .await
                .unwrap_err();
            assert_eq!(error.status, StatusCode::BAD_REQUEST, "{}", error.message);
        }
        assert!(
            get_alias_handler(State(state.clone()), Path("dan".to_string()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn deleting_one_alias_keeps_the_rest() {
        let state = app_state();
        let updated = delete_alias_handler(
            State(state.clone()),
            Path(("amy".to_string(), "amy lee".to_string())),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(updated.aliases, names(&["shared"]));

        let response = create(&state, "c1", individuals_request("u1", &["Amy Lee", "shared"]))
            .await
            .unwrap()
            .0;
        assert_eq!(response.mappings[0].identity, "STRANGER_1");
        assert_eq!(response.mappings[1].identity, "amy");

        let missing = delete_alias_handler(
            State(state.clone()),
            Path(("amy".to_string(), "amy lee".to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deleting_a_member_drops_all_of_its_names() {
        let state = app_state();
        let removed = delete_alias_member_handler(State(state.clone()), Path("bo".to_string()))
            .await
            .unwrap()
            .0;
        assert_eq!(removed.identity, "bo");

        let response = create(&state, "c1", individuals_request("u1", &["bo", "booob"]))
            .await
            .unwrap()
            .0;
        assert!(response.mappings.iter().all(|mapping| mapping.stranger));

        let again = delete_alias_member_handler(State(state.clone()), Path("bo".to_string()))
            .await
            .unwrap_err();
        assert_eq!(again.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn import_registers_valid_members_and_reports_the_rest() {
        let state = app_state();
        let members = vec![
            AliasMember {
                identity: "dan".to_string(),
                aliases: names(&["Daniel"]),
                patterns: Vec::new(),
            },
            AliasMember {
                identity: "eve".to_string(),
                aliases: names(&["Amy Lee"]),
                patterns: Vec::new(),
            },
            AliasMember {
                identity: "fay".to_string(),
                aliases: Vec::new(),
                patterns: names(&["^fa+y$"]),
            },
        ];
        let report = import_aliases_handler(State(state.clone()), Json(members))
            .await
            .unwrap()
            .0;

        assert_eq!(report.imported, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].identity, "eve");
        assert_eq!(list_aliases(&state, None).await.len(), 5);
        assert_eq!(
            state.resolver.lookup("faaay").await.unwrap(),
            Some("fay".to_string())
        );
    }

    #[tokio::test]
    async fn sweeper_evicts_expired_offers() {
        let pending = Arc::new(PendingSelections::new(chrono::Duration::zero()));
        pending.offer("c1/u1", Vec::new());
        let handle = spawn_pending_sweeper(pending.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert!(pending.is_empty());
    }
}
