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

//! Team-partitioning engine.
//!
//! Turns a roster of free individuals and pre-formed groups into balanced
//! teams of at most three, generating several distinct candidates and
//! optionally ranking them by how little they repeat recent history.
//!
//! Everything here is synchronous and in-memory. Randomness is always
//! passed in, so a seeded RNG gives reproducible results.

mod error;
mod generator;
mod partition;
pub mod pending;
mod planner;
mod scoring;
mod selector;
mod units;

pub use error::EngineError;
pub use generator::generate_candidate;
pub use partition::{CanonicalPartition, DuplicateFilter, Pair, Partition, TeamSet};
pub use pending::{PendingSelections, SelectionError};
pub use planner::plan_team_sizes;
pub use scoring::{
    EXACT_REPEAT_PENALTY, HistoryRecord, SHARED_PAIR_PENALTY, SHARED_TEAM_PENALTY,
    similarity_score,
};
pub use selector::{Candidate, PartitionOptions, partition};
pub use units::{AllocationUnit, Roster, UnitKind, UnitPlan, build_units};
