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

use std::collections::BTreeSet;

use teamup_common::Identity;

use crate::{CanonicalPartition, Pair, Partition};

pub const EXACT_REPEAT_PENALTY: u32 = 100;
pub const SHARED_TEAM_PENALTY: u32 = 10;
pub const SHARED_PAIR_PENALTY: u32 = 1;

/// A past partition reduced to the forms used for comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    team_sets: CanonicalPartition,
    pairs: BTreeSet<Pair>,
}

impl HistoryRecord {
    pub fn from_partition(partition: &Partition) -> Self {
        Self {
            team_sets: partition.team_sets(),
            pairs: partition.pair_set(),
        }
    }

    pub fn from_teams(teams: &[Vec<Identity>]) -> Self {
        Self::from_partition(&Partition::new(teams.to_vec()))
    }

    pub fn team_sets(&self) -> &CanonicalPartition {
        &self.team_sets
    }

    pub fn pairs(&self) -> &BTreeSet<Pair> {
        &self.pairs
    }

    fn penalty_against(&self, past: &HistoryRecord) -> u32 {
        if self.team_sets == past.team_sets {
            return EXACT_REPEAT_PENALTY;
        }
        let same_teams = self.team_sets.intersection(&past.team_sets).count() as u32;
        let same_pairs = self.pairs.intersection(&past.pairs).count() as u32;
        SHARED_TEAM_PENALTY * same_teams + SHARED_PAIR_PENALTY * same_pairs
    }
}

impl From<&Partition> for HistoryRecord {
    fn from(partition: &Partition) -> Self {
        Self::from_partition(partition)
    }
}

/// How much `candidate` repeats `history`; 0 means no overlap at all.
///
/// Each record contributes independently. An exact repeat costs
/// [`EXACT_REPEAT_PENALTY`] and nothing more for that record; otherwise
/// every identical team and every shared teammate pair adds up.
pub fn similarity_score(candidate: &Partition, history: &[HistoryRecord]) -> u32 {
    if history.is_empty() {
        return 0;
    }
    let forms = HistoryRecord::from_partition(candidate);
    history
        .iter()
        .map(|past| forms.penalty_against(past))
        .sum()
}
