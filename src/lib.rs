#![forbid(unsafe_code)]
//! Wardalloc : allocation quotidienne du personnel d'un service hospitalier (sans BD).
//!
//! - Calcul FTE, relève de lits, affectation des kinés et des PCA flottants.
//! - Arbitrage humain des égalités, jamais tranchées arbitrairement.
//! - État à trois couches (Sauvegardé / Algorithme / Override) et workflow en étapes.
//! - Stockage fichiers (JSON/CSV), dates de planning en jour calendaire local.

pub mod allocation;
pub mod cache;
pub mod io;
pub mod model;
pub mod rounding;
pub mod state;
pub mod storage;
pub mod workflow;

pub use allocation::{
    allocate_beds, calculate_beds_fte, calculate_pca_fte, verify_invariants, AllocError,
    AllocOptions, Allocator, BedAllocation, BedTransfer, DailyInputs, PcaAllocation,
    ScheduleCalculations, TherapistAllocation, TieBreakDecision, TieBreakRequest, ValidationIssue,
};
pub use cache::CacheService;
pub use model::{
    DayStatus, LeaveType, Role, Roster, ScheduleDate, Slot, SlotSet, Staff, StaffId, Team,
};
pub use state::{ManualOverrides, SavedState, ScheduleState};
pub use storage::{JsonStorage, MemoryStorage, Storage};
pub use workflow::{
    Clock, FixedClock, SystemClock, TieBreakSource, WorkflowController, WorkflowError,
    WorkflowStep,
};
