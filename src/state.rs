//! Modèle d'état à trois couches : Sauvegardé / Algorithme / Override.
//!
//! - L'état Sauvegardé est le snapshot durable écrit à la sauvegarde.
//! - L'état Algorithme est recalculé depuis les entrées brutes ; tant que
//!   celles-ci n'ont pas changé depuis la dernière sauvegarde, la base reste
//!   le snapshot sauvegardé.
//! - L'état Override contient les éditions non sauvegardées et l'emporte
//!   clé par clé sur l'état Algorithme.
//!
//! Les overrides manuels sauvegardés sont conservés à part dans le snapshot
//! et réappliqués après chaque recalcul, sous les éditions en cours.

use crate::allocation::{
    AllocError, Allocator, AssignmentReason, BedTransfer, DailyInputs, IssueCode, PcaAllocation,
    ScheduleCalculations, TherapistAllocation, TieBreakDecision, ValidationIssue,
};
use crate::model::{validate_fte, DayStatus, Roster, ScheduleDate, StaffId, Team};
use crate::rounding::to_quarters;
use crate::workflow::WorkflowStep;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const FORMAT_VERSION: u32 = 2;

/// Snapshot persistant d'une date de planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SavedState {
    pub format_version: u32,
    pub date: ScheduleDate,
    pub step: WorkflowStep,
    pub inputs: DailyInputs,
    /// Allocations fusionnées ; absentes si les entrées ne permettaient pas le calcul.
    #[serde(default)]
    pub calculations: Option<ScheduleCalculations>,
    /// Overrides manuels sauvegardés, réappliqués après chaque recalcul.
    #[serde(default)]
    pub manual: ManualOverrides,
    #[serde(default)]
    pub tie_breaks: Vec<TieBreakDecision>,
    pub saved_at: DateTime<Utc>,
}

/// Overrides manuels déjà sauvegardés (cumulés d'une sauvegarde à l'autre).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ManualOverrides {
    pub therapists: BTreeMap<StaffId, Vec<TherapistAllocation>>,
    pub pcas: BTreeMap<StaffId, PcaAllocation>,
    pub bed_transfers: Option<Vec<BedTransfer>>,
}

impl ManualOverrides {
    pub fn is_empty(&self) -> bool {
        self.therapists.is_empty() && self.pcas.is_empty() && self.bed_transfers.is_none()
    }

    fn absorb(&mut self, ov: &OverrideState) {
        for (k, v) in &ov.therapists {
            self.therapists.insert(k.clone(), v.clone());
        }
        for (k, v) in &ov.pcas {
            self.pcas.insert(k.clone(), v.clone());
        }
        if ov.bed_transfers.is_some() {
            self.bed_transfers = ov.bed_transfers.clone();
        }
    }
}

/// Catégorie d'édition et étape du workflow qui la possède.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditCategory {
    StaffStatus,
    WardBeds,
    TherapistDuty,
    PcaSlots,
    BedTransfers,
    TieBreak,
}

impl EditCategory {
    /// `None` : jamais soumis au verrouillage par étape.
    pub fn owner_step(&self) -> Option<WorkflowStep> {
        match self {
            EditCategory::StaffStatus => Some(WorkflowStep::LeaveFte),
            EditCategory::WardBeds => None,
            EditCategory::TherapistDuty => Some(WorkflowStep::TherapistPca),
            EditCategory::PcaSlots | EditCategory::TieBreak => Some(WorkflowStep::FloatingPca),
            EditCategory::BedTransfers => Some(WorkflowStep::BedRelieving),
        }
    }

    fn included_at(&self, step: WorkflowStep) -> bool {
        self.owner_step().map_or(true, |owner| owner <= step)
    }
}

/// Éditions utilisateur non encore sauvegardées.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OverrideState {
    pub staff: BTreeMap<StaffId, DayStatus>,
    pub ward_beds: BTreeMap<Team, u32>,
    pub therapists: BTreeMap<StaffId, Vec<TherapistAllocation>>,
    pub pcas: BTreeMap<StaffId, PcaAllocation>,
    pub bed_transfers: Option<Vec<BedTransfer>>,
    pub tie_breaks: Vec<TieBreakDecision>,
}

impl OverrideState {
    pub fn is_empty(&self) -> bool {
        self.staff.is_empty()
            && self.ward_beds.is_empty()
            && self.therapists.is_empty()
            && self.pcas.is_empty()
            && self.bed_transfers.is_none()
            && self.tie_breaks.is_empty()
    }

    /// Vrai si les entrées de l'algorithme diffèrent du snapshot sauvegardé.
    pub fn affects_algorithm(&self) -> bool {
        !self.staff.is_empty() || !self.ward_beds.is_empty() || !self.tie_breaks.is_empty()
    }

    /// Sous-ensemble sauvegardé à l'étape `step` (lits du service toujours inclus).
    pub fn included_at(&self, step: WorkflowStep) -> OverrideState {
        let keep = |c: EditCategory| c.included_at(step);
        OverrideState {
            staff: if keep(EditCategory::StaffStatus) { self.staff.clone() } else { BTreeMap::new() },
            ward_beds: self.ward_beds.clone(),
            therapists: if keep(EditCategory::TherapistDuty) { self.therapists.clone() } else { BTreeMap::new() },
            pcas: if keep(EditCategory::PcaSlots) { self.pcas.clone() } else { BTreeMap::new() },
            bed_transfers: if keep(EditCategory::BedTransfers) { self.bed_transfers.clone() } else { None },
            tie_breaks: if keep(EditCategory::TieBreak) { self.tie_breaks.clone() } else { Vec::new() },
        }
    }

    /// Retire les entrées identiques à celles effectivement sauvegardées ;
    /// une valeur modifiée pendant la sauvegarde reste en place.
    fn remove_committed(&mut self, committed: &OverrideState) {
        for (k, v) in &committed.staff {
            if self.staff.get(k) == Some(v) {
                self.staff.remove(k);
            }
        }
        for (k, v) in &committed.ward_beds {
            if self.ward_beds.get(k) == Some(v) {
                self.ward_beds.remove(k);
            }
        }
        for (k, v) in &committed.therapists {
            if self.therapists.get(k) == Some(v) {
                self.therapists.remove(k);
            }
        }
        for (k, v) in &committed.pcas {
            if self.pcas.get(k) == Some(v) {
                self.pcas.remove(k);
            }
        }
        if committed.bed_transfers.is_some() && committed.bed_transfers == self.bed_transfers {
            self.bed_transfers = None;
        }
        self.tie_breaks
            .retain(|d| !committed.tie_breaks.iter().any(|c| c.id == d.id));
    }
}

/// Discipline « un seul écrivain à la fois » par date.
#[derive(Debug, Default)]
pub struct SaveGate {
    in_flight: Option<u64>,
    issued: u64,
    rerun: bool,
}

impl SaveGate {
    /// `None` : une sauvegarde est déjà en vol, une relance est planifiée.
    pub fn try_begin(&mut self) -> Option<u64> {
        if self.in_flight.is_some() {
            self.rerun = true;
            return None;
        }
        self.issued += 1;
        self.in_flight = Some(self.issued);
        Some(self.issued)
    }

    pub fn note_change(&mut self) {
        if self.in_flight.is_some() {
            self.rerun = true;
        }
    }

    /// Libère le verrou ; renvoie vrai si un nouveau cycle doit suivre.
    pub fn finish(&mut self, ticket: u64) -> bool {
        if self.in_flight != Some(ticket) {
            return false;
        }
        self.in_flight = None;
        std::mem::take(&mut self.rerun)
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// Sauvegarde en cours : snapshot figé au démarrage.
#[derive(Debug, Clone)]
pub struct SaveTicket {
    pub id: u64,
    pub state: SavedState,
    included: OverrideState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveFinish {
    pub committed: bool,
    pub rerun: bool,
}

/// Composition des trois couches pour une date.
#[derive(Debug)]
pub struct ScheduleState {
    date: ScheduleDate,
    roster: Arc<Roster>,
    saved: Option<SavedState>,
    overrides: OverrideState,
    algorithm: Option<ScheduleCalculations>,
    compute_error: Option<String>,
    gate: SaveGate,
}

impl ScheduleState {
    pub fn new(date: ScheduleDate, roster: Arc<Roster>, saved: Option<SavedState>) -> Self {
        let mut state = Self {
            date,
            roster,
            saved,
            overrides: OverrideState::default(),
            algorithm: None,
            compute_error: None,
            gate: SaveGate::default(),
        };
        state.refresh();
        state
    }

    pub fn date(&self) -> ScheduleDate {
        self.date
    }
    pub fn roster(&self) -> &Roster {
        &self.roster
    }
    pub fn saved(&self) -> Option<&SavedState> {
        self.saved.as_ref()
    }
    pub fn overrides(&self) -> &OverrideState {
        &self.overrides
    }
    pub fn algorithm(&self) -> Option<&ScheduleCalculations> {
        self.algorithm.as_ref()
    }
    pub fn compute_error(&self) -> Option<&str> {
        self.compute_error.as_deref()
    }
    pub fn save_in_flight(&self) -> bool {
        self.gate.in_flight()
    }

    /// Vrai tant que l'état Override n'est pas vide depuis la dernière sauvegarde réussie.
    pub fn has_unsaved_changes(&self) -> bool {
        !self.overrides.is_empty()
    }

    pub fn base_inputs(&self) -> DailyInputs {
        self.saved
            .as_ref()
            .map(|s| s.inputs.clone())
            .unwrap_or_else(|| DailyInputs::from_roster(&self.roster))
    }

    fn inputs_with(&self, ov: &OverrideState) -> DailyInputs {
        let mut inputs = self.base_inputs();
        for (k, v) in &ov.staff {
            inputs.staff.insert(k.clone(), v.clone());
        }
        for (k, v) in &ov.ward_beds {
            inputs.ward_beds.insert(*k, *v);
        }
        inputs
    }

    pub fn effective_inputs(&self) -> DailyInputs {
        self.inputs_with(&self.overrides)
    }

    fn decisions_with(&self, ov: &OverrideState) -> Vec<TieBreakDecision> {
        let mut out: Vec<TieBreakDecision> = self
            .saved
            .as_ref()
            .map(|s| s.tie_breaks.clone())
            .unwrap_or_default();
        out.extend(ov.tie_breaks.iter().cloned());
        out
    }

    fn algorithm_for(&self, ov: &OverrideState) -> Result<ScheduleCalculations, AllocError> {
        if !ov.affects_algorithm() {
            if let Some(calcs) = self.saved.as_ref().and_then(|s| s.calculations.clone()) {
                return Ok(calcs);
            }
        }
        Allocator::new(&self.roster).compute(self.date, &self.inputs_with(ov), &self.decisions_with(ov))
    }

    /// Recalcule l'état Algorithme ; l'erreur est aussi conservée pour la validation.
    pub fn recompute(&mut self) -> Result<(), AllocError> {
        match self.algorithm_for(&self.overrides) {
            Ok(calcs) => {
                self.algorithm = Some(calcs);
                self.compute_error = None;
                Ok(())
            }
            Err(err) => {
                self.algorithm = None;
                self.compute_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn refresh(&mut self) {
        if let Err(err) = self.recompute() {
            tracing::warn!(date = %self.date, error = %err, "recompute failed");
        }
    }

    /// Overrides effectifs : manuels sauvegardés, puis éditions en cours qui l'emportent.
    fn layered(&self, ov: &OverrideState) -> OverrideState {
        let mut out = ov.clone();
        let Some(manual) = self.saved.as_ref().map(|s| &s.manual) else {
            return out;
        };
        for (k, v) in &manual.therapists {
            out.therapists.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &manual.pcas {
            out.pcas.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if out.bed_transfers.is_none() {
            out.bed_transfers = manual.bed_transfers.clone();
        }
        out
    }

    fn merged_with(&self, ov: &OverrideState, base: Option<ScheduleCalculations>) -> Option<ScheduleCalculations> {
        let mut calcs = base?;
        apply_overrides(&self.roster, &self.inputs_with(ov), &mut calcs, &self.layered(ov));
        Some(calcs)
    }

    /// Vue fusionnée : Override l'emporte sur Algorithme pour chaque clé présente.
    pub fn merged(&self) -> Option<ScheduleCalculations> {
        self.merged_with(&self.overrides, self.algorithm.clone())
    }

    // --- éditions -------------------------------------------------------

    pub fn set_staff_status(&mut self, staff: &StaffId, status: DayStatus) -> Result<(), AllocError> {
        if self.roster.find_staff(staff).is_none() {
            return Err(AllocError::UnknownStaff(staff.as_str().to_string()));
        }
        status.validate().map_err(|source| AllocError::InvalidStatus {
            staff: staff.clone(),
            source,
        })?;
        self.overrides.staff.insert(staff.clone(), status);
        self.touched();
        Ok(())
    }

    pub fn set_ward_beds(&mut self, team: Team, beds: u32) {
        self.overrides.ward_beds.insert(team, beds);
        self.touched();
    }

    pub fn override_therapist(&mut self, staff: &StaffId, duties: Vec<TherapistAllocation>) -> Result<(), AllocError> {
        check_therapist_override(&self.roster, &self.effective_inputs(), staff, &duties)?;
        self.overrides.therapists.insert(staff.clone(), duties);
        self.touched();
        Ok(())
    }

    pub fn override_pca(&mut self, alloc: PcaAllocation) -> Result<(), AllocError> {
        check_pca_override(&self.roster, &self.effective_inputs(), &alloc)?;
        self.overrides.pcas.insert(alloc.staff.clone(), alloc);
        self.touched();
        Ok(())
    }

    pub fn override_bed_transfers(&mut self, transfers: Vec<BedTransfer>) -> Result<(), AllocError> {
        check_bed_transfers(&transfers)?;
        self.overrides.bed_transfers = Some(transfers);
        self.touched();
        Ok(())
    }

    pub fn record_tie_break(&mut self, decision: TieBreakDecision) -> Result<(), AllocError> {
        if !decision.context.tied_teams.contains(&decision.chosen) {
            return Err(AllocError::InvalidOverride("chosen team is not among the tied teams"));
        }
        self.overrides.tie_breaks.push(decision);
        self.touched();
        Ok(())
    }

    /// Abandon de l'étape : les décisions d'arbitrage non sauvegardées sont écartées.
    pub fn discard_tie_breaks(&mut self) {
        if !self.overrides.tie_breaks.is_empty() {
            self.overrides.tie_breaks.clear();
            self.touched();
        }
    }

    pub fn discard_overrides(&mut self) {
        self.overrides = OverrideState::default();
        self.touched();
    }

    fn touched(&mut self) {
        self.gate.note_change();
        self.refresh();
    }

    // --- sauvegarde -----------------------------------------------------

    /// Fige un snapshot pour `step`. `None` si une sauvegarde est déjà en vol
    /// (un nouveau cycle sera signalé par `finish_save`).
    pub fn begin_save(&mut self, step: WorkflowStep, now: DateTime<Utc>) -> Option<SaveTicket> {
        let id = self.gate.try_begin()?;
        let included = self.overrides.included_at(step);
        let base = if included == self.overrides {
            self.algorithm.clone()
        } else {
            self.algorithm_for(&included).ok()
        };
        let calculations = self.merged_with(&included, base);
        let mut tie_breaks = self.saved.as_ref().map(|s| s.tie_breaks.clone()).unwrap_or_default();
        tie_breaks.extend(included.tie_breaks.iter().cloned());
        let mut manual = self.saved.as_ref().map(|s| s.manual.clone()).unwrap_or_default();
        manual.absorb(&included);

        let state = SavedState {
            format_version: FORMAT_VERSION,
            date: self.date,
            step,
            inputs: self.inputs_with(&included),
            calculations,
            manual,
            tie_breaks,
            saved_at: now,
        };
        tracing::debug!(date = %self.date, ticket = id, ?step, "save snapshot taken");
        Some(SaveTicket { id, state, included })
    }

    /// Termine une sauvegarde. En cas d'échec, l'état Override est conservé intact.
    pub fn finish_save<E: std::fmt::Display>(&mut self, ticket: SaveTicket, result: Result<(), E>) -> SaveFinish {
        let committed = match result {
            Ok(()) => {
                self.overrides.remove_committed(&ticket.included);
                self.saved = Some(ticket.state);
                true
            }
            Err(err) => {
                tracing::warn!(date = %self.date, error = %err, "save failed, overrides retained");
                false
            }
        };
        let rerun = self.gate.finish(ticket.id);
        if committed {
            self.refresh();
        }
        SaveFinish { committed, rerun }
    }
}

pub(crate) fn check_therapist_override(
    roster: &Roster,
    inputs: &DailyInputs,
    staff: &StaffId,
    duties: &[TherapistAllocation],
) -> Result<(), AllocError> {
    let member = roster
        .find_staff(staff)
        .ok_or_else(|| AllocError::UnknownStaff(staff.as_str().to_string()))?;
    if !member.is_therapist() {
        return Err(AllocError::InvalidOverride("staff is not a therapist"));
    }
    let status = inputs.status_for(member);
    if !status.leave.is_on_duty() && !duties.is_empty() {
        return Err(AllocError::NotOnDuty(staff.clone()));
    }
    let mut used = 0;
    for d in duties {
        if &d.staff != staff {
            return Err(AllocError::InvalidOverride("duty belongs to another staff member"));
        }
        if let Some(program) = &d.program {
            if roster.find_program(program).is_none() {
                return Err(AllocError::UnknownProgram(program.to_string()));
            }
        }
        validate_fte(d.fte)?;
        used += to_quarters(d.fte);
    }
    let remaining = to_quarters(status.fte);
    if used > remaining {
        return Err(AllocError::FteExceeded {
            staff: staff.clone(),
            requested: f64::from(used) / 4.0,
            remaining: status.fte,
        });
    }
    Ok(())
}

pub(crate) fn check_pca_override(roster: &Roster, inputs: &DailyInputs, alloc: &PcaAllocation) -> Result<(), AllocError> {
    let member = roster
        .find_staff(&alloc.staff)
        .ok_or_else(|| AllocError::UnknownStaff(alloc.staff.as_str().to_string()))?;
    if !member.is_pca() {
        return Err(AllocError::InvalidOverride("staff is not a PCA"));
    }
    let status = inputs.status_for(member);
    if !status.leave.is_on_duty() && !alloc.slots.is_empty() {
        return Err(AllocError::NotOnDuty(alloc.staff.clone()));
    }
    if let Some(slot) = alloc.slots.keys().find(|s| !status.available_slots.contains(**s)) {
        return Err(AllocError::UnavailableSlot {
            staff: alloc.staff.clone(),
            slot: *slot,
        });
    }
    let is_floating = member.floating || member.team.is_none();
    if alloc.floating != is_floating {
        return Err(AllocError::InvalidOverride("floating flag does not match staff record"));
    }
    if !is_floating {
        let mut teams = alloc.slots.values();
        if let Some(first) = teams.next() {
            if teams.any(|t| t != first) {
                return Err(AllocError::InvalidOverride("non-floating PCA must keep one team"));
            }
        }
    }
    Ok(())
}

fn check_bed_transfers(transfers: &[BedTransfer]) -> Result<(), AllocError> {
    for t in transfers {
        if t.beds == 0 {
            return Err(AllocError::InvalidOverride("bed transfer of zero beds"));
        }
        if t.source == t.target {
            return Err(AllocError::InvalidOverride("bed transfer within one team"));
        }
    }
    Ok(())
}

/// Applique les overrides encore valides ; les autres sont écartés avec un avertissement.
fn apply_overrides(roster: &Roster, inputs: &DailyInputs, calcs: &mut ScheduleCalculations, ov: &OverrideState) {
    for (staff, duties) in &ov.therapists {
        match check_therapist_override(roster, inputs, staff, duties) {
            Ok(()) => {
                calcs.therapists.retain(|a| &a.staff != staff);
                calcs.therapists.extend(duties.iter().cloned());
            }
            Err(err) => {
                tracing::warn!(%staff, error = %err, "therapist override dropped");
                push_once(
                    &mut calcs.issues,
                    ValidationIssue::warning(
                        IssueCode::OverrideDropped,
                        format!("therapist override for {staff} dropped: {err}"),
                    ),
                );
            }
        }
    }
    calcs.therapists.sort_by(|a, b| a.staff.cmp(&b.staff));

    for (staff, alloc) in &ov.pcas {
        match check_pca_override(roster, inputs, alloc) {
            // déjà en place dans un snapshot sauvegardé
            Ok(()) if calcs.pcas.get(staff) == Some(alloc) => {}
            Ok(()) => {
                for (slot, team) in &alloc.slots {
                    calcs.log.assigned(staff, *slot, *team, AssignmentReason::ManualOverride);
                }
                calcs.pcas.insert(staff.clone(), alloc.clone());
            }
            Err(err) => {
                tracing::warn!(%staff, error = %err, "PCA override dropped");
                push_once(
                    &mut calcs.issues,
                    ValidationIssue::warning(
                        IssueCode::OverrideDropped,
                        format!("PCA override for {staff} dropped: {err}"),
                    ),
                );
            }
        }
    }

    if let Some(transfers) = &ov.bed_transfers {
        calcs.beds.transfers = transfers.clone();
    }
}

fn push_once(issues: &mut Vec<ValidationIssue>, issue: ValidationIssue) {
    if !issues.contains(&issue) {
        issues.push(issue);
    }
}
