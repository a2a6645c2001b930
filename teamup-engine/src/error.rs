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

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A pre-formed group is bigger than a team may be. `group_no` is 1-based.
    #[error("group {group_no} has {size} members but a team holds at most {max}")]
    GroupTooLarge {
        group_no: usize,
        size: usize,
        max: usize,
    },
    #[error("no feasible partition found after {attempts} attempts")]
    NoFeasiblePartition { attempts: usize },
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("roster has no members")]
    EmptyRoster,
}
