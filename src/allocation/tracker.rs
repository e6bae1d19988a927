use crate::model::Team;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compteurs d'une équipe, en quarts de PCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TeamCounters {
    pub target: i32,
    pub non_floating: i32,
    pub floor_match: i32,
    pub remainder: i32,
    pub tie_break: i32,
    pub pending_tie: bool,
}

impl TeamCounters {
    pub fn received(&self) -> i32 {
        self.non_floating + self.floor_match + self.remainder + self.tie_break
    }

    /// Besoin restant, jamais négatif.
    pub fn remaining(&self) -> i32 {
        (self.target - self.received()).max(0)
    }

    /// Besoin adressé aux PCA flottants.
    pub fn floating_need(&self) -> i32 {
        (self.target - self.non_floating).max(0)
    }
}

/// Suivi cible/réalisé par équipe, propre à un seul passage d'allocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationTracker {
    pub teams: BTreeMap<Team, TeamCounters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bucket {
    NonFloating,
    FloorMatch,
    Remainder,
    TieBreak,
}

impl AllocationTracker {
    pub fn new(targets: &BTreeMap<Team, i32>) -> Self {
        let teams = Team::ALL
            .into_iter()
            .map(|team| {
                let target = targets.get(&team).copied().unwrap_or(0);
                (
                    team,
                    TeamCounters {
                        target,
                        ..TeamCounters::default()
                    },
                )
            })
            .collect();
        Self { teams }
    }

    pub fn counters(&self, team: Team) -> TeamCounters {
        self.teams.get(&team).copied().unwrap_or_default()
    }

    pub fn remaining(&self, team: Team) -> i32 {
        self.counters(team).remaining()
    }

    pub(crate) fn record(&mut self, team: Team, quarters: i32, bucket: Bucket) {
        let c = self.teams.entry(team).or_default();
        match bucket {
            Bucket::NonFloating => c.non_floating += quarters,
            Bucket::FloorMatch => c.floor_match += quarters,
            Bucket::Remainder => c.remainder += quarters,
            Bucket::TieBreak => c.tie_break += quarters,
        }
    }

    pub(crate) fn mark_pending(&mut self, team: Team) {
        self.teams.entry(team).or_default().pending_tie = true;
    }

    /// Équipes ayant encore un besoin, par besoin décroissant puis ordre d'équipe.
    pub fn teams_by_need(&self) -> Vec<(Team, i32)> {
        let mut out: Vec<(Team, i32)> = self
            .teams
            .iter()
            .map(|(t, c)| (*t, c.remaining()))
            .filter(|(_, r)| *r > 0)
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }
}
