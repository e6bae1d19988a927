mod beds;
mod floating_pca;
mod fte;
mod therapist;
mod tracker;
mod types;

pub use beds::{allocate_beds, BedAllocation, BedTransfer, Reconciliation};
pub use floating_pca::assignable_slots;
pub use fte::{calculate_beds_fte, calculate_pca_fte, BedsFte, FteInputs, PcaFte};
pub use tracker::{AllocationTracker, TeamCounters};
pub use types::{
    AllocError, AllocOptions, AllocationLog, AssignmentReason, DutyKind, IssueCode, PcaAllocation,
    PcaPriorityOrder, ScheduleCalculations, Severity, SkipReason, SlotAssignmentEntry,
    TeamAllocationEntry, TherapistAllocation, TieBreakContext, TieBreakDecision, TieBreakRequest,
    ValidationIssue,
};

use crate::model::{DayStatus, Roster, ScheduleDate, Staff, StaffId, Team};
use crate::rounding::to_quarters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entrées brutes d'une journée : congés/FTE par personne, lits par équipe.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DailyInputs {
    #[serde(default)]
    pub staff: BTreeMap<StaffId, DayStatus>,
    #[serde(default)]
    pub ward_beds: BTreeMap<Team, u32>,
}

impl DailyInputs {
    /// Valeurs par défaut issues de la configuration (tout le monde en service).
    pub fn from_roster(roster: &Roster) -> Self {
        Self {
            staff: roster
                .staff
                .iter()
                .map(|s| (s.id.clone(), s.default_status()))
                .collect(),
            ward_beds: roster.ward_beds.clone(),
        }
    }

    pub fn status_for(&self, staff: &Staff) -> DayStatus {
        self.staff
            .get(&staff.id)
            .cloned()
            .unwrap_or_else(|| staff.default_status())
    }
}

/// Vue d'une personne pour la journée (référence au roster + statut du jour).
#[derive(Debug, Clone)]
pub(crate) struct DayEntry<'a> {
    pub staff: &'a Staff,
    pub status: DayStatus,
}

/// Moteur : exécute FTE → lits → kinés → PCA flottants dans cet ordre fixe.
#[derive(Debug)]
pub struct Allocator<'a> {
    roster: &'a Roster,
    opts: AllocOptions,
}

impl<'a> Allocator<'a> {
    pub fn new(roster: &'a Roster) -> Self {
        Self {
            roster,
            opts: roster.options,
        }
    }

    pub fn with_options(mut self, opts: AllocOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn options(&self) -> &AllocOptions {
        &self.opts
    }

    fn day_entries(&self, inputs: &DailyInputs) -> Result<Vec<DayEntry<'a>>, AllocError> {
        let mut out = Vec::with_capacity(self.roster.staff.len());
        for staff in &self.roster.staff {
            let status = inputs.status_for(staff);
            status.validate().map_err(|source| AllocError::InvalidStatus {
                staff: staff.id.clone(),
                source,
            })?;
            out.push(DayEntry { staff, status });
        }
        Ok(out)
    }

    /// Agrège les entrées du calculateur FTE à partir de la journée.
    pub fn fte_inputs(&self, inputs: &DailyInputs) -> Result<FteInputs, AllocError> {
        let day = self.day_entries(inputs)?;
        Ok(fte_inputs_from(&day, inputs))
    }

    /// Calcule l'état Algorithme complet pour `date`.
    pub fn compute(
        &self,
        date: ScheduleDate,
        inputs: &DailyInputs,
        decisions: &[TieBreakDecision],
    ) -> Result<ScheduleCalculations, AllocError> {
        if let Some(unknown) = inputs
            .staff
            .keys()
            .find(|id| self.roster.find_staff(id).is_none())
        {
            return Err(AllocError::UnknownStaff(unknown.as_str().to_string()));
        }
        let day = self.day_entries(inputs)?;
        let fte_in = fte_inputs_from(&day, inputs);

        let beds_fte = calculate_beds_fte(&fte_in)?;
        let pca_fte = calculate_pca_fte(&fte_in, &beds_fte)?;

        let beds = allocate_beds(&beds_fte.beds_for_relieving, self.opts.reconciliation_tolerance);
        let therapists = therapist::allocate_therapists(self.roster, &day);
        let pcas = floating_pca::allocate_pcas(
            self.roster,
            &day,
            &pca_fte.average_pca_per_team,
            &self.opts,
            decisions,
        );

        let mut issues = beds.issues.clone();
        issues.extend(therapists.issues);
        issues.extend(pcas.issues);

        tracing::info!(
            %date,
            transfers = beds.transfers.len(),
            therapists = therapists.allocations.len(),
            pcas = pcas.pcas.len(),
            pending_ties = pcas.pending_ties.len(),
            "schedule computed"
        );

        Ok(ScheduleCalculations {
            date,
            beds_fte,
            pca_fte,
            beds,
            therapists: therapists.allocations,
            pcas: pcas.pcas,
            tracker: pcas.tracker,
            log: pcas.log,
            pending_ties: pcas.pending_ties,
            issues,
        })
    }
}

fn fte_inputs_from(day: &[DayEntry<'_>], inputs: &DailyInputs) -> FteInputs {
    let mut pt_per_team: BTreeMap<Team, f64> = BTreeMap::new();
    let mut total_pt = 0.0;
    let mut total_pca = 0.0;
    for e in day.iter().filter(|e| e.status.is_working()) {
        if e.staff.is_therapist() {
            total_pt += e.status.fte;
            if let Some(team) = e.staff.team {
                *pt_per_team.entry(team).or_insert(0.0) += e.status.fte;
            }
        } else {
            total_pca += e.status.fte;
        }
    }
    let beds_per_team: BTreeMap<Team, f64> = inputs
        .ward_beds
        .iter()
        .map(|(t, b)| (*t, f64::from(*b)))
        .collect();
    FteInputs {
        total_beds: beds_per_team.values().sum(),
        total_pt_on_duty: total_pt,
        total_pca_on_duty: total_pca,
        beds_per_team,
        pt_per_team,
    }
}

/// Vérifie les invariants d'exclusion des congés, de disponibilité, de FTE
/// et d'équipe unique des PCA non flottants sur un jeu d'allocations.
pub fn verify_invariants(
    roster: &Roster,
    inputs: &DailyInputs,
    calcs: &ScheduleCalculations,
) -> Vec<ValidationIssue> {
    let mut out = Vec::new();

    let mut fte_used: BTreeMap<&StaffId, i32> = BTreeMap::new();
    for a in &calcs.therapists {
        let Some(staff) = roster.find_staff(&a.staff) else {
            out.push(ValidationIssue::error(
                IssueCode::UnknownReference,
                format!("therapist allocation for unknown staff {}", a.staff),
            ));
            continue;
        };
        let status = inputs.status_for(staff);
        if !status.leave.is_on_duty() {
            out.push(ValidationIssue::error(
                IssueCode::LeaveViolation,
                format!("{} is on leave but holds a therapist duty", a.staff),
            ));
        }
        *fte_used.entry(&a.staff).or_insert(0) += to_quarters(a.fte);
    }
    for (id, used) in fte_used {
        if let Some(staff) = roster.find_staff(id) {
            let remaining = to_quarters(inputs.status_for(staff).fte);
            if used > remaining {
                out.push(ValidationIssue::error(
                    IssueCode::InsufficientFte,
                    format!("{id} is booked beyond remaining FTE"),
                ));
            }
        }
    }

    for (id, alloc) in &calcs.pcas {
        let Some(staff) = roster.find_staff(id) else {
            out.push(ValidationIssue::error(
                IssueCode::UnknownReference,
                format!("PCA allocation for unknown staff {id}"),
            ));
            continue;
        };
        let status = inputs.status_for(staff);
        if !status.leave.is_on_duty() && !alloc.slots.is_empty() {
            out.push(ValidationIssue::error(
                IssueCode::LeaveViolation,
                format!("{id} is on leave but holds PCA slots"),
            ));
        }
        for slot in alloc.slots.keys() {
            if !status.available_slots.contains(*slot) {
                out.push(ValidationIssue::error(
                    IssueCode::UnavailableSlot,
                    format!("{id} assigned to unavailable slot {slot}"),
                ));
            }
        }
        if !alloc.floating {
            let mut teams: Vec<Team> = alloc.slots.values().copied().collect();
            teams.sort();
            teams.dedup();
            if teams.len() > 1 {
                out.push(ValidationIssue::error(
                    IssueCode::ConflictingAssignment,
                    format!("non-floating PCA {id} assigned to several teams"),
                ));
            }
        }
    }

    out
}
