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

use rand::{Rng, seq::SliceRandom};
use tracing::debug;

use crate::{AllocationUnit, Partition};

/// Build one random candidate by greedy packing.
///
/// Units are placed in a uniformly shuffled order. Each unit goes to the
/// least-filled team that still has room for all of it, lowest index on
/// ties. Returns `None` when some unit fits nowhere; callers treat that as a
/// discarded attempt.
pub fn generate_candidate<R>(
    units: &[AllocationUnit],
    capacities: &[usize],
    rng: &mut R,
) -> Option<Partition>
where
    R: Rng + ?Sized,
{
    let mut order: Vec<&AllocationUnit> = units.iter().collect();
    order.shuffle(rng);

    let mut teams: Vec<Vec<_>> = capacities
        .iter()
        .map(|&capacity| Vec::with_capacity(capacity))
        .collect();

    for unit in order {
        let size = unit.size();
        let Some(target) = (0..teams.len())
            .filter(|&index| capacities[index].saturating_sub(teams[index].len()) >= size)
            .min_by_key(|&index| teams[index].len())
        else {
            debug!(
                unit_size = size,
                capacities = ?capacities,
                "unit does not fit any team; discarding attempt"
            );
            return None;
        };
        teams[target].extend(unit.members.iter().cloned());
    }

    teams.retain(|team| !team.is_empty());
    Some(Partition::new(teams))
}
