//! Allocation des PCA en quatre créneaux quotidiens.
//!
//! Déroulé d'un passage :
//! 1. les PCA d'équipe (non flottants) couvrent leur équipe sur leurs créneaux ;
//! 2. *floor-match* : chaque équipe reçoit `floor(besoin)` PCA flottants
//!    disponibles toute la journée ;
//! 3. *reste* : les quarts restants sont distribués un créneau à la fois à
//!    l'équipe au plus fort besoin restant, en gardant de préférence le même
//!    PCA pour une équipe ;
//! 4. face à une égalité que le vivier ne peut pas satisfaire, chaque équipe à
//!    égalité reçoit d'abord une unité tant qu'il en reste assez ; le reliquat
//!    disputé n'est jamais tranché arbitrairement : une `TieBreakRequest` est
//!    émise et ses créneaux restent suspendus jusqu'à décision externe.
//!
//! Toutes les unités sont des quarts de PCA (un créneau = 0.25).

use super::tracker::{AllocationTracker, Bucket};
use super::types::{
    AllocOptions, AllocationLog, AssignmentReason, IssueCode, PcaAllocation, PcaPriorityOrder,
    SkipReason, TieBreakContext, TieBreakDecision, TieBreakRequest, ValidationIssue,
};
use super::DayEntry;
use crate::model::{DayStatus, Roster, Slot, SlotSet, Staff, StaffId, Team};
use crate::rounding::to_quarters;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub(crate) struct PcaOutcome {
    pub pcas: BTreeMap<StaffId, PcaAllocation>,
    pub tracker: AllocationTracker,
    pub log: AllocationLog,
    pub pending_ties: Vec<TieBreakRequest>,
    pub issues: Vec<ValidationIssue>,
}

struct PoolMember<'a> {
    staff: &'a Staff,
    free: SlotSet,
}

/// Créneaux réellement affectables : disponibles, plafonnés par la FTE.
pub fn assignable_slots(status: &DayStatus) -> SlotSet {
    let cap = usize::try_from(to_quarters(status.fte).max(0)).unwrap_or(0);
    status.available_slots.iter().take(cap).collect()
}

type PriorityKey = (bool, u32, StaffId);

fn priority_key(roster: &Roster, opts: &AllocOptions, staff: &Staff, team: Option<Team>) -> PriorityKey {
    match opts.pca_priority {
        PcaPriorityOrder::IdOnly => (false, 0, staff.id.clone()),
        PcaPriorityOrder::PreferenceThenId => {
            let pref = roster.preference_for(&staff.id);
            let prefers = match (pref, team) {
                (Some(p), Some(t)) => p.preferred_teams.contains(&t),
                _ => false,
            };
            let rank = pref.map_or(u32::MAX, |p| p.rank);
            (!prefers, rank, staff.id.clone())
        }
    }
}

struct Run<'r, 'a> {
    roster: &'r Roster,
    opts: &'r AllocOptions,
    decisions: &'r [TieBreakDecision],
    pool: Vec<PoolMember<'a>>,
    out: PcaOutcome,
}

impl<'r, 'a> Run<'r, 'a> {
    fn assign(&mut self, idx: usize, slot: Slot, team: Team, bucket: Bucket, reason: AssignmentReason) {
        let member = &mut self.pool[idx];
        member.free.remove(slot);
        let staff = member.staff;
        self.out
            .pcas
            .entry(staff.id.clone())
            .or_insert_with(|| PcaAllocation::new(staff.id.clone(), true))
            .slots
            .insert(slot, team);
        self.out.tracker.record(team, 1, bucket);
        self.out.log.assigned(&staff.id, slot, team, reason);
    }

    fn serves(&self, idx: usize, team: Team) -> bool {
        self.out
            .pcas
            .get(&self.pool[idx].staff.id)
            .is_some_and(|a| a.slots.values().any(|t| *t == team))
    }

    fn floor_match(&mut self) {
        let order = self.out.tracker.teams_by_need();
        if order.iter().any(|(_, need)| *need >= 4) {
            for m in self.pool.iter().filter(|m| !m.free.is_full_day() && !m.free.is_empty()) {
                self.out.log.skipped(&m.staff.id, SkipReason::NotFullyAvailable);
            }
        }

        for (team, need) in order {
            let whole = usize::try_from(need / 4).unwrap_or(0);
            if whole == 0 {
                continue;
            }
            let mut candidates: Vec<usize> = (0..self.pool.len())
                .filter(|i| self.pool[*i].free.is_full_day())
                .collect();
            candidates.sort_by_cached_key(|i| priority_key(self.roster, self.opts, self.pool[*i].staff, Some(team)));

            let picked: Vec<usize> = candidates.into_iter().take(whole).collect();
            if picked.len() < whole {
                tracing::debug!(%team, wanted = whole, got = picked.len(), "floor-match shortfall");
            }
            for idx in picked {
                for slot in Slot::ALL {
                    self.assign(idx, slot, team, Bucket::FloorMatch, AssignmentReason::FloorMatch);
                }
                let remaining = self.out.tracker.remaining(team);
                self.out.log.team_event(team, 4, AssignmentReason::FloorMatch, remaining);
            }
        }
    }

    /// Cherche la dernière décision correspondant exactement au contexte.
    fn decision_for(&mut self, ctx: &TieBreakContext) -> Option<(Team, String)> {
        let decisions = self.decisions;
        let found = decisions.iter().rev().find(|d| &d.context == ctx)?;
        if ctx.tied_teams.contains(&found.chosen) {
            Some((found.chosen, found.id.clone()))
        } else {
            self.out.issues.push(ValidationIssue::warning(
                IssueCode::InvalidTieDecision,
                format!(
                    "tie-break decision {} chose {} which is not among the tied teams",
                    found.id, found.chosen
                ),
            ));
            None
        }
    }

    fn serves_any(&self, id: &StaffId) -> bool {
        self.out.pcas.get(id).is_some_and(|a| !a.slots.is_empty())
    }

    /// Unités créneau libres : créneau par créneau, puis dans l'ordre du vivier.
    fn supply(&self) -> Vec<(usize, Slot)> {
        let mut out = Vec::new();
        for slot in Slot::ALL {
            for (i, m) in self.pool.iter().enumerate() {
                if m.free.contains(slot) {
                    out.push((i, slot));
                }
            }
        }
        out
    }

    /// Continuité : un PCA servant déjà l'équipe passe avant l'ordre global.
    fn pick(&self, supply: &[(usize, Slot)], team: Team) -> Option<(usize, Slot)> {
        supply
            .iter()
            .copied()
            .find(|(i, _)| self.serves(*i, team))
            .or_else(|| supply.first().copied())
    }

    fn give(&mut self, idx: usize, slot: Slot, team: Team) {
        self.assign(idx, slot, team, Bucket::Remainder, AssignmentReason::Remainder);
        let remaining = self.out.tracker.remaining(team);
        self.out.log.team_event(team, 1, AssignmentReason::Remainder, remaining);
    }

    fn remainder(&mut self) {
        loop {
            let needs = self.out.tracker.teams_by_need();
            let Some(&(_, top)) = needs.first() else {
                break;
            };
            let supply = self.supply();
            let Some(&first) = supply.first() else {
                break;
            };

            let tied: Vec<Team> = needs
                .iter()
                .take_while(|(_, r)| *r == top)
                .map(|(t, _)| *t)
                .collect();
            let supply_q = i32::try_from(supply.len()).unwrap_or(i32::MAX);
            let tied_n = i32::try_from(tied.len()).unwrap_or(i32::MAX);

            if tied.len() > 1 && supply_q < top.saturating_mul(tied_n) {
                if supply_q >= tied_n {
                    // une unité par équipe à égalité ; seul le reliquat reste disputé
                    for team in &tied {
                        let supply = self.supply();
                        if let Some((idx, slot)) = self.pick(&supply, *team) {
                            self.give(idx, slot, *team);
                        }
                    }
                    continue;
                }

                let (idx, slot) = first;
                let context = TieBreakContext {
                    tied_teams: tied.clone(),
                    candidate: self.pool[idx].staff.id.clone(),
                    slot,
                };
                if let Some((team, decision)) = self.decision_for(&context) {
                    self.assign(idx, slot, team, Bucket::TieBreak, AssignmentReason::TieBreak { decision: decision.clone() });
                    let remaining = self.out.tracker.remaining(team);
                    self.out
                        .log
                        .team_event(team, 1, AssignmentReason::TieBreak { decision }, remaining);
                    continue;
                }

                tracing::warn!(teams = ?tied, candidate = %context.candidate, %slot, "unresolved tie, escalating");
                for team in &tied {
                    self.out.tracker.mark_pending(*team);
                }
                for (i, slot) in &supply {
                    tracing::debug!(staff = %self.pool[*i].staff.id, slot = %slot, "slot suspended until tie-break");
                    self.out
                        .log
                        .skipped(&self.pool[*i].staff.id, SkipReason::PendingTieBreak { slot: *slot });
                }
                self.out.pending_ties.push(TieBreakRequest {
                    context,
                    remaining_quarters: top,
                    supply_quarters: supply_q,
                });
                break;
            }

            if let Some((idx, slot)) = self.pick(&supply, tied[0]) {
                self.give(idx, slot, tied[0]);
            }
        }
    }
}

pub(crate) fn allocate_pcas(
    roster: &Roster,
    day: &[DayEntry<'_>],
    targets: &BTreeMap<Team, f64>,
    opts: &AllocOptions,
    decisions: &[TieBreakDecision],
) -> PcaOutcome {
    let target_q: BTreeMap<Team, i32> = targets.iter().map(|(t, v)| (*t, to_quarters(*v))).collect();
    let mut out = PcaOutcome {
        tracker: AllocationTracker::new(&target_q),
        ..PcaOutcome::default()
    };
    let mut pool = Vec::new();

    for entry in day.iter().filter(|e| e.staff.is_pca()) {
        let staff = entry.staff;
        if !entry.status.leave.is_on_duty() {
            out.log.skipped(&staff.id, SkipReason::OnLeave);
            continue;
        }
        let slots = assignable_slots(&entry.status);
        if slots.is_empty() {
            out.log.skipped(&staff.id, SkipReason::NoAssignableSlots);
            continue;
        }

        match (staff.floating, staff.team) {
            (false, Some(team)) => {
                let mut alloc = PcaAllocation::new(staff.id.clone(), false);
                for slot in slots.iter() {
                    alloc.slots.insert(slot, team);
                    out.log.assigned(&staff.id, slot, team, AssignmentReason::NonFloating);
                }
                let q = i32::try_from(slots.len()).unwrap_or(0);
                out.tracker.record(team, q, Bucket::NonFloating);
                let remaining = out.tracker.remaining(team);
                out.log.team_event(team, q, AssignmentReason::NonFloating, remaining);
                out.pcas.insert(staff.id.clone(), alloc);
            }
            _ => {
                out.pcas
                    .insert(staff.id.clone(), PcaAllocation::new(staff.id.clone(), true));
                pool.push(PoolMember { staff, free: slots });
            }
        }
    }

    pool.sort_by_cached_key(|m| priority_key(roster, opts, m.staff, None));

    let mut run = Run {
        roster,
        opts,
        decisions,
        pool,
        out,
    };
    run.floor_match();
    run.remainder();

    if run.out.pending_ties.is_empty() {
        for m in &run.pool {
            if !run.serves_any(&m.staff.id) {
                run.out.log.skipped(&m.staff.id, SkipReason::Unneeded);
            }
        }
    }
    run.out
}
