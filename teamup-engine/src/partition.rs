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

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use teamup_common::Identity;

/// One team with member order ignored.
pub type TeamSet = BTreeSet<Identity>;
/// A partition with both team order and member order ignored.
pub type CanonicalPartition = BTreeSet<TeamSet>;
/// Two teammates, smaller identity first.
pub type Pair = (Identity, Identity);

/// Teams in display order. Each team lists its members in placement order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub teams: Vec<Vec<Identity>>,
}

impl Partition {
    pub fn new(teams: Vec<Vec<Identity>>) -> Self {
        Self { teams }
    }

    pub fn total_members(&self) -> usize {
        self.teams.iter().map(Vec::len).sum()
    }

    pub fn team_sizes(&self) -> Vec<usize> {
        self.teams.iter().map(Vec::len).collect()
    }

    pub fn team_of(&self, identity: &str) -> Option<usize> {
        self.teams
            .iter()
            .position(|team| team.iter().any(|member| member == identity))
    }

    pub fn team_sets(&self) -> CanonicalPartition {
        self.teams
            .iter()
            .map(|team| team.iter().cloned().collect())
            .collect()
    }

    /// Every unordered pair of players sharing a team.
    pub fn pair_set(&self) -> BTreeSet<Pair> {
        let mut pairs = BTreeSet::new();
        for team in &self.teams {
            for (i, left) in team.iter().enumerate() {
                for right in &team[i + 1..] {
                    if left == right {
                        continue;
                    }
                    let pair = if left < right {
                        (left.clone(), right.clone())
                    } else {
                        (right.clone(), left.clone())
                    };
                    pairs.insert(pair);
                }
            }
        }
        pairs
    }

    pub fn into_teams(self) -> Vec<Vec<Identity>> {
        self.teams
    }
}

/// Remembers which partitions a pool already holds.
///
/// Equality is exact partition identity: swapping a single player between
/// two teams yields a new, admissible partition.
#[derive(Debug, Default)]
pub struct DuplicateFilter {
    seen: HashSet<CanonicalPartition>,
}

impl DuplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and remembers `partition` if it is new to the pool.
    pub fn admit(&mut self, partition: &Partition) -> bool {
        self.seen.insert(partition.team_sets())
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.seen.contains(&partition.team_sets())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
