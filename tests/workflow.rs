#![forbid(unsafe_code)]
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use wardalloc::allocation::{
    AllocError, AssignmentReason, DutyKind, IssueCode, PcaAllocation, SlotAssignmentEntry,
    TherapistAllocation, TieBreakRequest,
};
use wardalloc::model::{
    DayStatus, LeaveType, ProgramId, Role, Roster, ScheduleDate, Slot, SlotSet, Staff, StaffId, Team,
};
use wardalloc::storage::{MemoryStorage, Storage};
use wardalloc::workflow::{
    FixedClock, SaveReport, TieBreakAnswer, TieBreakSource, WorkflowController, WorkflowError,
    WorkflowStep,
};
use wardalloc::CacheService;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 1, 8, 0, 0).unwrap()
}

fn date() -> ScheduleDate {
    "2025-10-01".parse().unwrap()
}

fn roster(with_tie: bool) -> Roster {
    let mut staff = vec![
        Staff::new("t1", Role::Therapist, Some(Team::Fo)).with_id("t1"),
        Staff::new("t2", Role::Therapist, Some(Team::Smm)).with_id("t2"),
        Staff::new("p1", Role::Pca, None).floating().with_id("p1"),
    ];
    if !with_tie {
        staff.push(Staff::new("p2", Role::Pca, None).floating().with_id("p2"));
    }
    Roster {
        staff,
        ward_beds: BTreeMap::from([(Team::Fo, 10), (Team::Smm, 10)]),
        ..Roster::default()
    }
}

fn open(with_tie: bool) -> WorkflowController<MemoryStorage> {
    let mut ctl = WorkflowController::open(
        MemoryStorage::new(),
        Arc::new(roster(with_tie)),
        date(),
        CacheService::disabled(),
        Box::new(FixedClock(now())),
    )
    .unwrap();
    // un seul créneau pour deux équipes à 0.5 : moins d'unités que d'équipes à égalité
    if with_tie {
        ctl.set_staff_status(
            &StaffId::new("p1"),
            DayStatus::on_duty(1.0).with_slots(SlotSet::parse_list("1").unwrap()),
        )
        .unwrap();
    }
    ctl
}

fn advance_to(ctl: &mut WorkflowController<MemoryStorage>, step: WorkflowStep) {
    while ctl.step() < step {
        let t = ctl.advance();
        assert!(t.advanced(), "blocked at {}: {:?}", t.from, t.validation.issues);
    }
}

#[test]
fn advance_saves_and_moves_forward() {
    let mut ctl = open(false);
    assert_eq!(ctl.step(), WorkflowStep::LeaveFte);
    let t = ctl.advance();
    assert_eq!(t.to, Some(WorkflowStep::TherapistPca));
    assert!(t.save.is_saved());
    assert_eq!(ctl.storage().save_count(), 1);
    assert!(!ctl.has_unsaved_changes());

    let saved = ctl.state().saved().unwrap();
    assert_eq!(saved.step, WorkflowStep::TherapistPca);
    assert!(saved.calculations.is_some());
}

#[test]
fn edits_are_locked_to_their_step() {
    let mut ctl = open(false);
    let alloc = PcaAllocation::new(StaffId::new("p1"), true);
    assert!(matches!(
        ctl.override_pca(alloc),
        Err(WorkflowError::StepLocked { owner: WorkflowStep::FloatingPca, .. })
    ));

    advance_to(&mut ctl, WorkflowStep::TherapistPca);
    assert!(matches!(
        ctl.set_staff_status(&StaffId::new("t1"), DayStatus::on_leave(LeaveType::Sick)),
        Err(WorkflowError::StepLocked { .. })
    ));

    // lits du service : toujours éditables
    ctl.set_ward_beds(Team::Fo, 12);
    assert_eq!(ctl.state().effective_inputs().ward_beds[&Team::Fo], 12);
}

#[test]
fn overrides_take_precedence_over_algorithm() {
    let mut ctl = open(false);
    advance_to(&mut ctl, WorkflowStep::TherapistPca);
    let t1 = StaffId::new("t1");
    ctl.override_therapist(
        &t1,
        vec![TherapistAllocation {
            staff: t1.clone(),
            team: Team::Smm,
            duty: DutyKind::Ordinary,
            program: None,
            fte: 1.0,
        }],
    )
    .unwrap();

    let merged = ctl.calculations().unwrap();
    let duties: Vec<_> = merged.therapist_duties(&t1).collect();
    assert_eq!(duties.len(), 1);
    assert_eq!(duties[0].team, Team::Smm);

    let algo = ctl.state().algorithm().unwrap();
    assert_eq!(algo.therapist_duties(&t1).next().unwrap().team, Team::Fo);
    assert!(ctl.has_unsaved_changes());
}

fn move_t1_to_smm(ctl: &mut WorkflowController<MemoryStorage>) {
    let t1 = StaffId::new("t1");
    ctl.override_therapist(
        &t1,
        vec![TherapistAllocation {
            staff: t1.clone(),
            team: Team::Smm,
            duty: DutyKind::Ordinary,
            program: None,
            fte: 1.0,
        }],
    )
    .unwrap();
}

#[test]
fn saved_overrides_survive_later_input_edits() {
    let mut ctl = open(false);
    let t1 = StaffId::new("t1");
    advance_to(&mut ctl, WorkflowStep::TherapistPca);
    move_t1_to_smm(&mut ctl);
    advance_to(&mut ctl, WorkflowStep::FloatingPca);
    assert!(!ctl.has_unsaved_changes());
    assert!(ctl.state().saved().unwrap().manual.therapists.contains_key(&t1));

    ctl.set_ward_beds(Team::Fo, 11);
    let algo = ctl.state().algorithm().unwrap();
    assert_eq!(algo.therapist_duties(&t1).next().unwrap().team, Team::Fo);
    let merged = ctl.calculations().unwrap();
    let duties: Vec<_> = merged.therapist_duties(&t1).collect();
    assert_eq!(duties.len(), 1);
    assert_eq!(duties[0].team, Team::Smm);

    assert!(ctl.save().is_saved());
    let stored = ctl.storage().load(date()).unwrap().unwrap();
    assert_eq!(stored.inputs.ward_beds[&Team::Fo], 11);
    let calcs = stored.calculations.as_ref().unwrap();
    assert_eq!(calcs.therapist_duties(&t1).next().unwrap().team, Team::Smm);
    assert_eq!(stored.manual.therapists[&t1][0].team, Team::Smm);
}

#[test]
fn saved_pca_override_is_not_logged_twice() {
    let mut ctl = open(false);
    advance_to(&mut ctl, WorkflowStep::FloatingPca);
    let mut manual = PcaAllocation::new(StaffId::new("p1"), true);
    manual.slots.insert(Slot::new(1).unwrap(), Team::Smm);
    ctl.override_pca(manual.clone()).unwrap();
    assert!(ctl.save().is_saved());
    assert!(ctl.save().is_saved());

    let merged = ctl.calculations().unwrap();
    assert_eq!(merged.pcas[&StaffId::new("p1")], manual);
    let manual_entries = merged
        .log
        .slots
        .iter()
        .filter(|e| {
            matches!(
                e,
                SlotAssignmentEntry::Assigned {
                    reason: AssignmentReason::ManualOverride,
                    ..
                }
            )
        })
        .count();
    assert_eq!(manual_entries, 1);
}

#[test]
fn therapist_override_with_unknown_program_is_rejected() {
    let mut ctl = open(false);
    advance_to(&mut ctl, WorkflowStep::TherapistPca);
    let t1 = StaffId::new("t1");
    let err = ctl
        .override_therapist(
            &t1,
            vec![TherapistAllocation {
                staff: t1.clone(),
                team: Team::Fo,
                duty: DutyKind::SpecialProgram,
                program: Some(ProgramId::new("ghost")),
                fte: 0.25,
            }],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Alloc(AllocError::UnknownProgram(ref p)) if p == "ghost"
    ));
    assert!(!ctl.has_unsaved_changes());
}

#[test]
fn invalid_overrides_are_rejected() {
    let mut ctl = open(false);
    advance_to(&mut ctl, WorkflowStep::TherapistPca);
    let t1 = StaffId::new("t1");
    let too_much = vec![
        TherapistAllocation {
            staff: t1.clone(),
            team: Team::Fo,
            duty: DutyKind::Ordinary,
            program: None,
            fte: 1.0,
        },
        TherapistAllocation {
            staff: t1.clone(),
            team: Team::Smm,
            duty: DutyKind::Spt,
            program: None,
            fte: 0.5,
        },
    ];
    assert!(ctl.override_therapist(&t1, too_much).is_err());
    assert!(!ctl.has_unsaved_changes());
}

#[test]
fn failed_save_keeps_overrides() {
    let mut ctl = open(false);
    ctl.advance();
    ctl.storage().set_fail_saves(true);
    ctl.set_ward_beds(Team::Fo, 12);

    let report = ctl.save();
    assert!(matches!(report, SaveReport::Failed(_)));
    assert!(ctl.has_unsaved_changes());
    assert_eq!(ctl.state().overrides().ward_beds[&Team::Fo], 12);
    assert_eq!(ctl.state().saved().unwrap().inputs.ward_beds[&Team::Fo], 10);

    ctl.storage().set_fail_saves(false);
    assert!(ctl.save().is_saved());
    assert!(!ctl.has_unsaved_changes());
    assert_eq!(ctl.state().saved().unwrap().inputs.ward_beds[&Team::Fo], 12);
}

#[test]
fn edit_during_save_is_queued_and_kept() {
    let mut ctl = open(false);
    ctl.set_ward_beds(Team::Fo, 12);
    let ticket = ctl.begin_save().unwrap();
    assert!(ctl.state().save_in_flight());

    ctl.set_ward_beds(Team::Fo, 14);
    assert!(ctl.begin_save().is_none());
    assert_eq!(ctl.save(), SaveReport::Queued);

    let finish = ctl.finish_save(ticket, Ok(()));
    assert!(finish.committed);
    assert!(finish.rerun);
    assert_eq!(ctl.state().saved().unwrap().inputs.ward_beds[&Team::Fo], 12);
    assert_eq!(ctl.state().overrides().ward_beds[&Team::Fo], 14);
    assert!(ctl.has_unsaved_changes());

    assert!(ctl.save().is_saved());
    assert_eq!(ctl.state().saved().unwrap().inputs.ward_beds[&Team::Fo], 14);
    assert!(!ctl.has_unsaved_changes());
}

#[test]
fn pending_tie_blocks_floating_step_until_resolved() {
    let mut ctl = open(true);
    advance_to(&mut ctl, WorkflowStep::FloatingPca);
    assert_eq!(ctl.pending_ties().len(), 1);

    let blocked = ctl.advance();
    assert!(!blocked.advanced());
    assert!(blocked.save.is_saved());
    assert_eq!(ctl.step(), WorkflowStep::FloatingPca);

    let decision = ctl.resolve_tie(0, Team::Fo, "ward lead").unwrap();
    assert_eq!(decision.chosen, Team::Fo);
    assert_eq!(decision.decided_at, now());
    assert!(ctl.pending_ties().is_empty());

    let merged = ctl.calculations().unwrap();
    assert_eq!(merged.pcas[&StaffId::new("p1")].slots[&Slot::new(1).unwrap()], Team::Fo);

    let t = ctl.advance();
    assert_eq!(t.to, Some(WorkflowStep::BedRelieving));
    assert_eq!(ctl.state().saved().unwrap().tie_breaks.len(), 1);
}

#[test]
fn resolving_with_a_team_outside_the_tie_fails() {
    let mut ctl = open(true);
    advance_to(&mut ctl, WorkflowStep::FloatingPca);
    assert!(ctl.resolve_tie(0, Team::Dro, "ward lead").is_err());
    assert!(matches!(
        ctl.resolve_tie(3, Team::Fo, "ward lead"),
        Err(WorkflowError::UnknownTie(3))
    ));
    assert_eq!(ctl.pending_ties().len(), 1);
}

#[test]
fn going_back_discards_unsaved_tie_breaks() {
    let mut ctl = open(true);
    advance_to(&mut ctl, WorkflowStep::FloatingPca);
    ctl.resolve_tie(0, Team::Smm, "ward lead").unwrap();
    assert!(ctl.pending_ties().is_empty());

    assert_eq!(ctl.go_back().unwrap(), WorkflowStep::TherapistPca);
    assert!(ctl.state().overrides().tie_breaks.is_empty());
    assert_eq!(ctl.pending_ties().len(), 1);
}

#[test]
fn go_back_at_first_step_fails() {
    let mut ctl = open(false);
    assert!(matches!(ctl.go_back(), Err(WorkflowError::AtFirstStep)));
}

#[test]
fn later_step_edits_are_not_saved_from_an_earlier_step() {
    let mut ctl = open(true);
    advance_to(&mut ctl, WorkflowStep::FloatingPca);
    let mut manual = PcaAllocation::new(StaffId::new("p1"), true);
    manual.slots.insert(Slot::new(1).unwrap(), Team::Fo);
    ctl.override_pca(manual.clone()).unwrap();

    ctl.go_back().unwrap();
    assert!(ctl.save().is_saved());

    let saved = ctl.state().saved().unwrap();
    let saved_p1 = &saved.calculations.as_ref().unwrap().pcas[&StaffId::new("p1")];
    assert_ne!(saved_p1, &manual);
    assert!(ctl.has_unsaved_changes());
    assert_eq!(ctl.state().overrides().pcas[&StaffId::new("p1")], manual);
}

#[test]
fn pca_override_outside_availability_is_rejected() {
    let mut ctl = open(true);
    advance_to(&mut ctl, WorkflowStep::FloatingPca);
    let mut manual = PcaAllocation::new(StaffId::new("p1"), true);
    manual.slots.insert(Slot::new(3).unwrap(), Team::Fo);
    assert!(ctl.override_pca(manual).is_err());
}

struct Always(Team);

impl TieBreakSource for Always {
    fn request_decision(&mut self, _request: &TieBreakRequest) -> Option<TieBreakAnswer> {
        Some(TieBreakAnswer {
            chosen: self.0,
            decided_by: "dialog".into(),
        })
    }
}

struct Undecided;

impl TieBreakSource for Undecided {
    fn request_decision(&mut self, _request: &TieBreakRequest) -> Option<TieBreakAnswer> {
        None
    }
}

#[test]
fn tie_break_source_is_polled() {
    let mut ctl = open(true);
    advance_to(&mut ctl, WorkflowStep::FloatingPca);

    assert_eq!(ctl.poll_tie_breaks(&mut Undecided).unwrap(), 0);
    assert_eq!(ctl.pending_ties().len(), 1);

    assert_eq!(ctl.poll_tie_breaks(&mut Always(Team::Smm)).unwrap(), 1);
    assert!(ctl.pending_ties().is_empty());
    assert_eq!(ctl.state().overrides().tie_breaks[0].decided_by, "dialog");
}

#[test]
fn reopen_restores_saved_step_from_cache() {
    let cache = CacheService::new(Duration::minutes(5), 0);
    let mut ctl = WorkflowController::open(
        MemoryStorage::new(),
        Arc::new(roster(false)),
        date(),
        cache,
        Box::new(FixedClock(now())),
    )
    .unwrap();
    ctl.advance();
    assert_eq!(ctl.cache().len(), 1);

    let reopened = WorkflowController::open(
        MemoryStorage::new(),
        Arc::new(roster(false)),
        date(),
        ctl.cache().clone(),
        Box::new(FixedClock(now() + Duration::minutes(1))),
    )
    .unwrap();
    assert_eq!(reopened.step(), WorkflowStep::TherapistPca);
    assert!(!reopened.has_unsaved_changes());
}

#[test]
fn cache_entries_expire_and_follow_epoch() {
    let mut ctl = open(false);
    ctl.advance();
    let saved = ctl.state().saved().unwrap().clone();

    let mut cache = CacheService::new(Duration::minutes(5), 7);
    cache.put(date(), saved, now());
    assert!(cache.get(date(), now() + Duration::minutes(1)).is_some());
    assert!(cache.get(date(), now() + Duration::minutes(6)).is_none());

    cache.bump_epoch();
    assert!(cache.get(date(), now()).is_none());
    assert_eq!(cache.purge_expired(now()), 1);
    assert!(cache.is_empty());
}

#[test]
fn step_names_round_trip() {
    for step in WorkflowStep::ALL {
        assert_eq!(step.as_str().parse::<WorkflowStep>().unwrap(), step);
    }
    assert_eq!(WorkflowStep::Review.next(), None);
    assert_eq!(WorkflowStep::TherapistPca.prev(), Some(WorkflowStep::LeaveFte));
    assert!("done".parse::<WorkflowStep>().is_err());
}

#[test]
fn stale_overrides_are_dropped_at_merge() {
    let mut ctl = open(false);
    advance_to(&mut ctl, WorkflowStep::TherapistPca);
    let t1 = StaffId::new("t1");
    ctl.override_therapist(
        &t1,
        vec![TherapistAllocation {
            staff: t1.clone(),
            team: Team::Smm,
            duty: DutyKind::Ordinary,
            program: None,
            fte: 1.0,
        }],
    )
    .unwrap();

    assert_eq!(ctl.go_back().unwrap(), WorkflowStep::LeaveFte);
    assert!(ctl.state().overrides().therapists.contains_key(&t1));
    ctl.set_staff_status(&t1, DayStatus::on_leave(LeaveType::Sick))
        .unwrap();

    let merged = ctl.calculations().unwrap();
    assert_eq!(merged.therapist_duties(&t1).count(), 0);
    assert!(merged
        .issues
        .iter()
        .any(|i| i.code == IssueCode::OverrideDropped && !i.is_error()));
    assert!(ctl.validate(WorkflowStep::Review).passed());
}
