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

use teamup_common::{MAX_TEAM_SIZE, SMALL_ROSTER_LIMIT};

/// Target team sizes for `total_members` players, largest teams first.
///
/// Small rosters stay together. Otherwise teams of three are preferred and
/// the remainder is absorbed by teams of two, so nobody plays alone.
pub fn plan_team_sizes(total_members: usize) -> Vec<usize> {
    if total_members <= SMALL_ROSTER_LIMIT {
        return vec![total_members];
    }

    let full_teams = total_members / MAX_TEAM_SIZE;
    let remaining = total_members % MAX_TEAM_SIZE;
    let mut sizes = vec![MAX_TEAM_SIZE; full_teams];

    match remaining {
        1 => {
            // Borrow one player from the last full team: 3 + 1 becomes 2 + 2.
            if let Some(last) = sizes.last_mut() {
                *last -= 1;
            }
            sizes.push(2);
        }
        2 => sizes.push(2),
        _ => {}
    }

    sizes
}
