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

use rand::Rng;
use serde::{Deserialize, Serialize};
use teamup_common::{DEFAULT_AVOID_RECENT_COUNT, DEFAULT_NUM_OPTIONS, SMALL_ROSTER_LIMIT};
use tracing::{debug, warn};

use crate::{
    AllocationUnit, DuplicateFilter, EngineError, HistoryRecord, Partition, Roster, build_units,
    generate_candidate, plan_team_sizes, similarity_score,
};

const PLAIN_POOL_FACTOR: usize = 3;
const HISTORY_POOL_FACTOR: usize = 10;
const ATTEMPTS_PER_OPTION: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOptions {
    pub num_options: usize,
    /// Rank candidates against recent history instead of returning them
    /// in generation order.
    pub history_aware: bool,
    pub avoid_recent_count: usize,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            num_options: DEFAULT_NUM_OPTIONS,
            history_aware: false,
            avoid_recent_count: DEFAULT_AVOID_RECENT_COUNT,
        }
    }
}

impl PartitionOptions {
    pub fn plain(num_options: usize) -> Self {
        Self {
            num_options,
            ..Self::default()
        }
    }

    pub fn history_aware(num_options: usize, avoid_recent_count: usize) -> Self {
        Self {
            num_options,
            history_aware: true,
            avoid_recent_count,
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.num_options < 1 {
            return Err(EngineError::InvalidOptions(
                "num_options must be at least 1".to_string(),
            ));
        }
        if self.avoid_recent_count < 1 {
            return Err(EngineError::InvalidOptions(
                "avoid_recent_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn pool_target(&self) -> usize {
        let factor = if self.history_aware {
            HISTORY_POOL_FACTOR
        } else {
            PLAIN_POOL_FACTOR
        };
        self.num_options.saturating_mul(factor)
    }

    fn attempt_budget(&self) -> usize {
        self.num_options.saturating_mul(ATTEMPTS_PER_OPTION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub partition: Partition,
    pub similarity_score: u32,
}

#[derive(Default)]
struct Pool {
    accepted: Vec<Partition>,
    /// Repeats kept only while the pool is short of `num_options`.
    duplicates: Vec<Partition>,
    attempts: usize,
}

fn collect_pool<R>(
    units: &[AllocationUnit],
    capacities: &[usize],
    options: &PartitionOptions,
    rng: &mut R,
) -> Pool
where
    R: Rng + ?Sized,
{
    let target = options.pool_target();
    let budget = options.attempt_budget();
    let mut filter = DuplicateFilter::new();
    let mut pool = Pool::default();

    while pool.accepted.len() < target && pool.attempts < budget {
        pool.attempts += 1;
        let Some(partition) = generate_candidate(units, capacities, rng) else {
            continue;
        };
        if filter.admit(&partition) {
            pool.accepted.push(partition);
        } else if pool.accepted.len() + pool.duplicates.len() < options.num_options {
            pool.duplicates.push(partition);
        }
    }

    debug!(
        attempts = pool.attempts,
        accepted = pool.accepted.len(),
        duplicates = pool.duplicates.len(),
        target,
        "candidate pool collected"
    );
    pool
}

/// Split `roster` into teams and return up to `num_options` candidates.
///
/// `history` is newest first; only the first `avoid_recent_count` records
/// are consulted, and only in history-aware mode. History-aware results are
/// ordered by ascending similarity score (ties keep generation order);
/// plain results are in generation order with a score of 0.
///
/// If no grouped arrangement is feasible, groups are dissolved and
/// generation is retried once.
pub fn partition<R>(
    roster: &Roster,
    options: &PartitionOptions,
    history: &[HistoryRecord],
    rng: &mut R,
) -> Result<Vec<Candidate>, EngineError>
where
    R: Rng + ?Sized,
{
    options.validate()?;
    let plan = build_units(roster)?;
    if plan.total_members == 0 {
        return Err(EngineError::EmptyRoster);
    }

    let window = &history[..history.len().min(options.avoid_recent_count)];
    let score = |partition: &Partition| {
        if options.history_aware {
            similarity_score(partition, window)
        } else {
            0
        }
    };

    if plan.total_members <= SMALL_ROSTER_LIMIT {
        let partition = Partition::new(vec![plan.members().cloned().collect()]);
        let similarity_score = score(&partition);
        return Ok(vec![Candidate {
            partition,
            similarity_score,
        }]);
    }

    let capacities = plan_team_sizes(plan.total_members);
    let mut pool = collect_pool(&plan.units, &capacities, options, rng);

    if pool.accepted.is_empty() {
        warn!(
            total_members = plan.total_members,
            attempts = pool.attempts,
            "no feasible grouped partition; retrying with groups dissolved"
        );
        let ungrouped = plan.ungrouped();
        let first_attempts = pool.attempts;
        pool = collect_pool(&ungrouped.units, &capacities, options, rng);
        if pool.accepted.is_empty() {
            return Err(EngineError::NoFeasiblePartition {
                attempts: first_attempts + pool.attempts,
            });
        }
    }

    let mut candidates: Vec<Candidate> = pool
        .accepted
        .into_iter()
        .map(|partition| Candidate {
            similarity_score: score(&partition),
            partition,
        })
        .collect();

    if options.history_aware {
        candidates.sort_by_key(|candidate| candidate.similarity_score);
    }
    candidates.truncate(options.num_options);

    let shortfall = options.num_options - candidates.len();
    candidates.extend(pool.duplicates.into_iter().take(shortfall).map(|partition| {
        Candidate {
            similarity_score: score(&partition),
            partition,
        }
    }));

    debug!(
        total_members = plan.total_members,
        team_sizes = ?capacities,
        returned = candidates.len(),
        history_aware = options.history_aware,
        "partition candidates ready"
    );
    Ok(candidates)
}
