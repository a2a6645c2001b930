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

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use teamup_common::{Identity, MAX_TEAM_SIZE};

use crate::EngineError;

/// Who showed up: pre-formed groups that must play together, and everyone else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub groups: Vec<Vec<Identity>>,
    #[serde(default)]
    pub individuals: Vec<Identity>,
}

impl Roster {
    pub fn new(groups: Vec<Vec<Identity>>, individuals: Vec<Identity>) -> Self {
        Self {
            groups,
            individuals,
        }
    }

    pub fn from_individuals<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Identity>,
    {
        Self {
            groups: Vec::new(),
            individuals: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Group,
    Individual,
}

/// An indivisible chunk of players placed into exactly one team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationUnit {
    pub kind: UnitKind,
    pub members: Vec<Identity>,
}

impl AllocationUnit {
    pub fn individual(identity: Identity) -> Self {
        Self {
            kind: UnitKind::Individual,
            members: vec![identity],
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    pub units: Vec<AllocationUnit>,
    pub total_members: usize,
}

impl UnitPlan {
    fn from_units(units: Vec<AllocationUnit>) -> Self {
        let total_members = units.iter().map(AllocationUnit::size).sum();
        Self {
            units,
            total_members,
        }
    }

    /// Same members, every one of them as a free individual.
    pub fn ungrouped(&self) -> Self {
        Self::from_units(
            self.units
                .iter()
                .flat_map(|unit| unit.members.iter().cloned())
                .map(AllocationUnit::individual)
                .collect(),
        )
    }

    pub fn members(&self) -> impl Iterator<Item = &Identity> {
        self.units.iter().flat_map(|unit| unit.members.iter())
    }
}

/// Split a roster into allocation units, groups first.
///
/// Each identity ends up in exactly one unit. Membership in an earlier group
/// wins over a later group, and any group wins over the free list. A group
/// that shrinks to one member is demoted to an individual.
///
/// The size limit applies to distinct names: `[a, a, b, c]` is a valid trio.
/// Blank names are ignored before counting.
pub fn build_units(roster: &Roster) -> Result<UnitPlan, EngineError> {
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut units = Vec::with_capacity(roster.groups.len() + roster.individuals.len());

    for (index, group) in roster.groups.iter().enumerate() {
        let mut distinct: Vec<&Identity> = Vec::with_capacity(group.len());
        for member in group.iter().filter(|member| !member.is_empty()) {
            if !distinct.contains(&member) {
                distinct.push(member);
            }
        }

        if distinct.len() > MAX_TEAM_SIZE {
            return Err(EngineError::GroupTooLarge {
                group_no: index + 1,
                size: distinct.len(),
                max: MAX_TEAM_SIZE,
            });
        }

        let mut members: Vec<Identity> = Vec::with_capacity(distinct.len());
        for member in distinct {
            if claimed.insert(member.as_str()) {
                members.push(member.clone());
            }
        }

        match members.len() {
            0 => {}
            1 => units.push(AllocationUnit {
                kind: UnitKind::Individual,
                members,
            }),
            _ => units.push(AllocationUnit {
                kind: UnitKind::Group,
                members,
            }),
        }
    }

    for identity in &roster.individuals {
        if identity.is_empty() || !claimed.insert(identity.as_str()) {
            continue;
        }
        units.push(AllocationUnit::individual(identity.clone()));
    }

    Ok(UnitPlan::from_units(units))
}
