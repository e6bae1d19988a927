use crate::allocation::{
    verify_invariants, AllocError, BedTransfer, IssueCode, PcaAllocation, ScheduleCalculations,
    TherapistAllocation, TieBreakDecision, TieBreakRequest, ValidationIssue,
};
use crate::cache::CacheService;
use crate::model::{DayStatus, LeaveType, Roster, ScheduleDate, SlotSet, StaffId, Team};
use crate::state::{EditCategory, SaveFinish, SaveTicket, ScheduleState};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Étapes ordonnées du workflow quotidien.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStep {
    LeaveFte,
    TherapistPca,
    FloatingPca,
    BedRelieving,
    Review,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 5] = [
        WorkflowStep::LeaveFte,
        WorkflowStep::TherapistPca,
        WorkflowStep::FloatingPca,
        WorkflowStep::BedRelieving,
        WorkflowStep::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStep::LeaveFte => "leave-fte",
            WorkflowStep::TherapistPca => "therapist-pca",
            WorkflowStep::FloatingPca => "floating-pca",
            WorkflowStep::BedRelieving => "bed-relieving",
            WorkflowStep::Review => "review",
        }
    }

    pub fn next(&self) -> Option<WorkflowStep> {
        let i = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(i + 1).copied()
    }

    pub fn prev(&self) -> Option<WorkflowStep> {
        let i = Self::ALL.iter().position(|s| s == self)?;
        i.checked_sub(1).and_then(|j| Self::ALL.get(j).copied())
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStep {
    type Err = WorkflowError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == s.trim())
            .ok_or_else(|| WorkflowError::UnknownStep(s.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("{category:?} edits belong to step {owner}, current step is {current}")]
    StepLocked {
        category: EditCategory,
        owner: WorkflowStep,
        current: WorkflowStep,
    },
    #[error("unknown workflow step: {0}")]
    UnknownStep(String),
    #[error("already at the first step")]
    AtFirstStep,
    #[error("no pending tie-break at index {0}")]
    UnknownTie(usize),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Horloge injectable (horodatage des sauvegardes et arbitrages).
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Réponse humaine à une demande d'arbitrage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieBreakAnswer {
    pub chosen: Team,
    pub decided_by: String,
}

/// Source externe de décisions (boîte de dialogue d'arbitrage).
///
/// `None` : décision toujours en attente ; seule l'affectation concernée reste suspendue.
pub trait TieBreakSource {
    fn request_decision(&mut self, request: &TieBreakRequest) -> Option<TieBreakAnswer>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepValidation {
    pub step: WorkflowStep,
    pub issues: Vec<ValidationIssue>,
}

impl StepValidation {
    pub fn passed(&self) -> bool {
        !self.issues.iter().any(ValidationIssue::is_error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveReport {
    Saved { at: DateTime<Utc> },
    /// Une sauvegarde est déjà en vol ; un nouveau cycle suivra.
    Queued,
    Failed(String),
}

impl SaveReport {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveReport::Saved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: WorkflowStep,
    /// `None` si la validation a bloqué le passage.
    pub to: Option<WorkflowStep>,
    pub validation: StepValidation,
    pub save: SaveReport,
}

impl Transition {
    pub fn advanced(&self) -> bool {
        self.to.is_some()
    }
}

/// Étape à laquelle se rattache un code de problème.
fn issue_step(code: IssueCode) -> WorkflowStep {
    match code {
        IssueCode::PreconditionViolation
        | IssueCode::UnknownReference
        | IssueCode::InsufficientFte
        | IssueCode::UnstaffedProgram
        | IssueCode::UnassignedTherapist
        | IssueCode::LeaveViolation => WorkflowStep::TherapistPca,
        IssueCode::UnresolvedTie
        | IssueCode::InvalidTieDecision
        | IssueCode::UnavailableSlot
        | IssueCode::ConflictingAssignment => WorkflowStep::FloatingPca,
        IssueCode::ReconciliationOverflow => WorkflowStep::BedRelieving,
        IssueCode::OverrideDropped => WorkflowStep::Review,
    }
}

/// Contrôleur : séquence les étapes, verrouille les éditions par étape,
/// sauvegarde automatiquement à chaque tentative de transition.
pub struct WorkflowController<S: Storage> {
    storage: S,
    cache: CacheService,
    clock: Box<dyn Clock>,
    state: ScheduleState,
    step: WorkflowStep,
}

impl<S: Storage> WorkflowController<S> {
    pub fn open(
        storage: S,
        roster: Arc<Roster>,
        date: ScheduleDate,
        mut cache: CacheService,
        clock: Box<dyn Clock>,
    ) -> Result<Self, WorkflowError> {
        let now = clock.now();
        let saved = match cache.get(date, now) {
            Some(hit) => {
                tracing::debug!(%date, "schedule served from cache");
                Some(hit.clone())
            }
            None => {
                let loaded = storage
                    .load(date)
                    .map_err(|e| WorkflowError::Persistence(format!("{e:#}")))?;
                if let Some(s) = &loaded {
                    cache.put(date, s.clone(), now);
                }
                loaded
            }
        };
        let step = saved.as_ref().map_or(WorkflowStep::LeaveFte, |s| s.step);
        let state = ScheduleState::new(date, roster, saved);
        tracing::info!(%date, %step, "workflow opened");
        Ok(Self {
            storage,
            cache,
            clock,
            state,
            step,
        })
    }

    pub fn step(&self) -> WorkflowStep {
        self.step
    }
    pub fn state(&self) -> &ScheduleState {
        &self.state
    }
    pub fn storage(&self) -> &S {
        &self.storage
    }
    pub fn cache(&self) -> &CacheService {
        &self.cache
    }
    pub fn date(&self) -> ScheduleDate {
        self.state.date()
    }

    /// Allocations affichées : Override sur Algorithme.
    pub fn calculations(&self) -> Option<ScheduleCalculations> {
        self.state.merged()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.state.has_unsaved_changes()
    }

    pub fn pending_ties(&self) -> Vec<TieBreakRequest> {
        self.state
            .algorithm()
            .map(|c| c.pending_ties.clone())
            .unwrap_or_default()
    }

    // --- validation -----------------------------------------------------

    fn leave_fte_issues(&self) -> Vec<ValidationIssue> {
        let roster = self.state.roster();
        let inputs = self.state.effective_inputs();
        let mut out = Vec::new();
        for id in inputs.staff.keys() {
            if roster.find_staff(id).is_none() {
                out.push(ValidationIssue::error(
                    IssueCode::UnknownReference,
                    format!("leave/FTE entry for unknown staff {id}"),
                ));
            }
        }
        for staff in &roster.staff {
            if let Err(err) = inputs.status_for(staff).validate() {
                out.push(ValidationIssue::error(
                    IssueCode::PreconditionViolation,
                    format!("{}: {err}", staff.id),
                ));
            }
        }
        if let Some(err) = self.state.compute_error() {
            out.push(ValidationIssue::error(IssueCode::PreconditionViolation, err));
        }
        out
    }

    /// Valide une étape à partir de l'état fusionné courant.
    pub fn validate(&self, step: WorkflowStep) -> StepValidation {
        let mut issues = Vec::new();
        if step == WorkflowStep::LeaveFte || step == WorkflowStep::Review {
            issues.extend(self.leave_fte_issues());
        }
        if step == WorkflowStep::LeaveFte {
            return StepValidation { step, issues };
        }

        let Some(merged) = self.state.merged() else {
            issues.push(ValidationIssue::error(
                IssueCode::PreconditionViolation,
                self.state
                    .compute_error()
                    .unwrap_or("no allocation could be computed")
                    .to_string(),
            ));
            return StepValidation { step, issues };
        };

        let mut all = merged.issues.clone();
        all.extend(verify_invariants(
            self.state.roster(),
            &self.state.effective_inputs(),
            &merged,
        ));
        for tie in &merged.pending_ties {
            all.push(ValidationIssue::error(
                IssueCode::UnresolvedTie,
                format!(
                    "teams {:?} tied for PCA {} slot {}",
                    tie.context.tied_teams, tie.context.candidate, tie.context.slot
                ),
            ));
        }

        issues.extend(
            all.into_iter()
                .filter(|i| step == WorkflowStep::Review || issue_step(i.code) == step),
        );
        StepValidation { step, issues }
    }

    // --- transitions ----------------------------------------------------

    /// Tente de passer à l'étape suivante ; sauvegarde dans tous les cas.
    pub fn advance(&mut self) -> Transition {
        let from = self.step;
        let validation = self.validate(from);
        let to = if validation.passed() { from.next() } else { None };
        if let Some(next) = to {
            self.step = next;
            tracing::info!(date = %self.date(), %from, to = %next, "workflow step advanced");
        } else {
            tracing::info!(date = %self.date(), %from, issues = validation.issues.len(), "workflow step blocked");
        }
        let save = self.save();
        Transition {
            from,
            to,
            validation,
            save,
        }
    }

    /// Retour à l'étape précédente ; quitter l'étape PCA flottants abandonne
    /// les arbitrages non sauvegardés.
    pub fn go_back(&mut self) -> Result<WorkflowStep, WorkflowError> {
        let prev = self.step.prev().ok_or(WorkflowError::AtFirstStep)?;
        if self.step == WorkflowStep::FloatingPca {
            self.state.discard_tie_breaks();
        }
        self.step = prev;
        Ok(prev)
    }

    // --- sauvegarde -----------------------------------------------------

    pub fn begin_save(&mut self) -> Option<SaveTicket> {
        let now = self.clock.now();
        self.state.begin_save(self.step, now)
    }

    pub fn finish_save(&mut self, ticket: SaveTicket, result: anyhow::Result<()>) -> SaveFinish {
        let now = self.clock.now();
        let date = ticket.state.date;
        let snapshot = ticket.state.clone();
        let failure = result.err().map(|e| format!("{e:#}"));
        let finish = self.state.finish_save(ticket, failure.as_ref().map_or(Ok(()), Err));
        if finish.committed {
            self.cache.put(date, snapshot, now);
        }
        finish
    }

    /// Sauvegarde synchrone via le `Storage` ; enchaîne un nouveau cycle
    /// si des changements sont arrivés pendant l'écriture.
    pub fn save(&mut self) -> SaveReport {
        loop {
            let Some(ticket) = self.begin_save() else {
                return SaveReport::Queued;
            };
            let at = ticket.state.saved_at;
            let result = self.storage.save(ticket.state.date, &ticket.state);
            let failure = result.as_ref().err().map(|e| format!("{e:#}"));
            let finish = self.finish_save(ticket, result);
            if let Some(msg) = failure {
                return SaveReport::Failed(msg);
            }
            if !finish.rerun {
                tracing::info!(date = %self.date(), "schedule saved");
                return SaveReport::Saved { at };
            }
        }
    }

    // --- éditions -------------------------------------------------------

    fn ensure_editable(&self, category: EditCategory) -> Result<(), WorkflowError> {
        match category.owner_step() {
            Some(owner) if owner != self.step => Err(WorkflowError::StepLocked {
                category,
                owner,
                current: self.step,
            }),
            _ => Ok(()),
        }
    }

    pub fn set_staff_status(&mut self, staff: &StaffId, status: DayStatus) -> Result<(), WorkflowError> {
        self.ensure_editable(EditCategory::StaffStatus)?;
        self.state.set_staff_status(staff, status)?;
        Ok(())
    }

    /// Saisie brute : la chaîne de congé est normalisée ici, une seule fois.
    pub fn set_staff_status_raw(
        &mut self,
        staff: &StaffId,
        leave: Option<&str>,
        fte: f64,
        slots: Option<SlotSet>,
    ) -> Result<(), WorkflowError> {
        let leave = LeaveType::normalize(leave).map_err(AllocError::from)?;
        let status = if leave.is_on_duty() {
            DayStatus::on_duty(fte).with_slots(slots.unwrap_or(SlotSet::FULL_DAY))
        } else {
            DayStatus::on_leave(leave)
        };
        self.set_staff_status(staff, status)
    }

    /// Toujours éditable, quelle que soit l'étape.
    pub fn set_ward_beds(&mut self, team: Team, beds: u32) {
        self.state.set_ward_beds(team, beds);
    }

    pub fn override_therapist(&mut self, staff: &StaffId, duties: Vec<TherapistAllocation>) -> Result<(), WorkflowError> {
        self.ensure_editable(EditCategory::TherapistDuty)?;
        self.state.override_therapist(staff, duties)?;
        Ok(())
    }

    pub fn override_pca(&mut self, alloc: PcaAllocation) -> Result<(), WorkflowError> {
        self.ensure_editable(EditCategory::PcaSlots)?;
        self.state.override_pca(alloc)?;
        Ok(())
    }

    pub fn override_bed_transfers(&mut self, transfers: Vec<BedTransfer>) -> Result<(), WorkflowError> {
        self.ensure_editable(EditCategory::BedTransfers)?;
        self.state.override_bed_transfers(transfers)?;
        Ok(())
    }

    /// Enregistre la décision humaine pour la n-ième égalité en attente.
    pub fn resolve_tie(&mut self, index: usize, chosen: Team, decided_by: &str) -> Result<TieBreakDecision, WorkflowError> {
        self.ensure_editable(EditCategory::TieBreak)?;
        let request = self
            .pending_ties()
            .into_iter()
            .nth(index)
            .ok_or(WorkflowError::UnknownTie(index))?;
        let decision = TieBreakDecision::new(request.context, chosen, decided_by, self.clock.now());
        self.state.record_tie_break(decision.clone())?;
        tracing::info!(decision = %decision.id, %chosen, "tie-break resolved");
        Ok(decision)
    }

    /// Interroge la source pour chaque égalité en attente, jusqu'à ce
    /// qu'elle réponde `None`. Renvoie le nombre de décisions appliquées.
    pub fn poll_tie_breaks(&mut self, source: &mut dyn TieBreakSource) -> Result<usize, WorkflowError> {
        self.ensure_editable(EditCategory::TieBreak)?;
        let mut applied = 0;
        while let Some(request) = self.pending_ties().into_iter().next() {
            let Some(answer) = source.request_decision(&request) else {
                break;
            };
            self.resolve_tie(0, answer.chosen, &answer.decided_by)?;
            applied += 1;
        }
        Ok(applied)
    }
}
