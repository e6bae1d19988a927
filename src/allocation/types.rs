use crate::model::{ModelError, ProgramId, Role, ScheduleDate, Slot, StaffId, Team};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use super::beds::BedAllocation;
use super::fte::{BedsFte, PcaFte};
use super::tracker::AllocationTracker;

/// Ordre total utilisé pour tirer les PCA flottants du vivier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcaPriorityOrder {
    /// PCA préférant l'équipe d'abord, puis rang de préférence (sans préférence en dernier), puis id.
    #[default]
    PreferenceThenId,
    /// Ordre lexicographique des identifiants uniquement.
    IdOnly,
}

/// Options d'allocation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocOptions {
    /// Écart maximal toléré (en lits) entre lits cédés et reçus avant réconciliation.
    pub reconciliation_tolerance: u32,
    pub pca_priority: PcaPriorityOrder,
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            reconciliation_tolerance: 1,
            pca_priority: PcaPriorityOrder::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("no {0:?} on duty: on-duty FTE total is zero")]
    ZeroOnDuty(Role),
    #[error("non-finite input: {0}")]
    NonFiniteInput(&'static str),
    #[error("invalid day status for staff {staff}: {source}")]
    InvalidStatus {
        staff: StaffId,
        #[source]
        source: ModelError,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("unknown staff: {0}")]
    UnknownStaff(String),
    #[error("unknown program: {0}")]
    UnknownProgram(String),
    #[error("staff {0} is not on duty")]
    NotOnDuty(StaffId),
    #[error("staff {staff} is not available in slot {slot}")]
    UnavailableSlot { staff: StaffId, slot: Slot },
    #[error("staff {staff} would exceed remaining FTE ({requested} > {remaining})")]
    FteExceeded {
        staff: StaffId,
        requested: f64,
        remaining: f64,
    },
    #[error("invalid override: {0}")]
    InvalidOverride(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    PreconditionViolation,
    ReconciliationOverflow,
    UnknownReference,
    InsufficientFte,
    UnstaffedProgram,
    UnassignedTherapist,
    UnavailableSlot,
    ConflictingAssignment,
    LeaveViolation,
    UnresolvedTie,
    InvalidTieDecision,
    OverrideDropped,
}

/// Problème de validation attaché à une sortie (jamais avalé silencieusement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: IssueCode,
    pub message: String,
}

impl ValidationIssue {
    pub fn error<M: Into<String>>(code: IssueCode, message: M) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
        }
    }

    pub fn warning<M: Into<String>>(code: IssueCode, message: M) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutyKind {
    Ordinary,
    SpecialProgram,
    Spt,
}

/// Service attribué à un kiné. Un kiné peut cumuler plusieurs services
/// tant que la somme des `fte` ne dépasse pas sa FTE restante.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TherapistAllocation {
    pub staff: StaffId,
    pub team: Team,
    pub duty: DutyKind,
    #[serde(default)]
    pub program: Option<ProgramId>,
    pub fte: f64,
}

/// Affectation d'un PCA : au plus une équipe par créneau.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PcaAllocation {
    pub staff: StaffId,
    pub floating: bool,
    pub slots: BTreeMap<Slot, Team>,
}

impl PcaAllocation {
    pub fn new(staff: StaffId, floating: bool) -> Self {
        Self {
            staff,
            floating,
            slots: BTreeMap::new(),
        }
    }

    pub fn assigned_quarters(&self) -> usize {
        self.slots.len()
    }

    pub fn quarters_for(&self, team: Team) -> usize {
        self.slots.values().filter(|t| **t == team).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignmentReason {
    NonFloating,
    FloorMatch,
    Remainder,
    TieBreak { decision: String },
    ManualOverride,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    OnLeave,
    NoAssignableSlots,
    NotFullyAvailable,
    /// Créneau suspendu en attente d'arbitrage.
    PendingTieBreak { slot: Slot },
    Unneeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SlotAssignmentEntry {
    Assigned {
        staff: StaffId,
        slot: Slot,
        team: Team,
        reason: AssignmentReason,
    },
    Skipped {
        staff: StaffId,
        reason: SkipReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamAllocationEntry {
    pub quarters: i32,
    pub reason: AssignmentReason,
    /// Besoin restant (en quarts) après cette décision.
    pub remaining_after: i32,
}

/// Journaux en ajout seul : par créneau et par équipe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationLog {
    pub slots: Vec<SlotAssignmentEntry>,
    pub teams: BTreeMap<Team, Vec<TeamAllocationEntry>>,
}

impl AllocationLog {
    pub(crate) fn assigned(&mut self, staff: &StaffId, slot: Slot, team: Team, reason: AssignmentReason) {
        self.slots.push(SlotAssignmentEntry::Assigned {
            staff: staff.clone(),
            slot,
            team,
            reason,
        });
    }

    pub(crate) fn skipped(&mut self, staff: &StaffId, reason: SkipReason) {
        self.slots.push(SlotAssignmentEntry::Skipped {
            staff: staff.clone(),
            reason,
        });
    }

    pub(crate) fn team_event(&mut self, team: Team, quarters: i32, reason: AssignmentReason, remaining_after: i32) {
        self.teams.entry(team).or_default().push(TeamAllocationEntry {
            quarters,
            reason,
            remaining_after,
        });
    }
}

/// Contexte d'une égalité non résoluble automatiquement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TieBreakContext {
    /// Équipes à égalité, triées.
    pub tied_teams: Vec<Team>,
    /// PCA et créneau candidats pour la prochaine unité.
    pub candidate: StaffId,
    pub slot: Slot,
}

/// Demande d'arbitrage émise par l'allocateur de PCA flottants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieBreakRequest {
    pub context: TieBreakContext,
    /// Besoin restant en quarts de chaque équipe à égalité.
    pub remaining_quarters: i32,
    /// Unités créneau encore disponibles dans le vivier.
    pub supply_quarters: i32,
}

/// Snapshot complet de l'état Algorithme pour une date.
///
/// Recalculé intégralement à chaque changement d'entrée ; deux calculs sur
/// des entrées identiques produisent une sérialisation identique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleCalculations {
    pub date: ScheduleDate,
    pub beds_fte: BedsFte,
    pub pca_fte: PcaFte,
    pub beds: BedAllocation,
    pub therapists: Vec<TherapistAllocation>,
    pub pcas: BTreeMap<StaffId, PcaAllocation>,
    pub tracker: AllocationTracker,
    pub log: AllocationLog,
    #[serde(default)]
    pub pending_ties: Vec<TieBreakRequest>,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
}

impl ScheduleCalculations {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(ValidationIssue::is_error)
    }

    pub fn therapist_duties(&self, staff: &StaffId) -> impl Iterator<Item = &TherapistAllocation> + '_ {
        let staff = staff.clone();
        self.therapists.iter().filter(move |a| a.staff == staff)
    }
}

/// Arbitrage humain d'une égalité. Vit dans l'état Override jusqu'à la
/// sauvegarde, puis dans l'état Sauvegardé.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TieBreakDecision {
    pub id: String,
    pub context: TieBreakContext,
    pub chosen: Team,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
}

impl TieBreakDecision {
    pub fn new<S: Into<String>>(
        context: TieBreakContext,
        chosen: Team,
        decided_by: S,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            context,
            chosen,
            decided_by: decided_by.into(),
            decided_at,
        }
    }
}
