#![forbid(unsafe_code)]
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::tempdir;
use wardalloc::allocation::{allocate_beds, Allocator, DailyInputs};
use wardalloc::io;
use wardalloc::model::{LeaveType, Role, Roster, ScheduleDate, SlotSet, Staff, StaffId, Team};
use wardalloc::storage::{decode_saved_state, DecodeError, JsonStorage, Storage};
use wardalloc::workflow::{FixedClock, WorkflowController, WorkflowStep};
use wardalloc::CacheService;

fn date() -> ScheduleDate {
    "2025-10-01".parse().unwrap()
}

fn roster() -> Roster {
    Roster {
        staff: vec![
            Staff::new("t1", Role::Therapist, Some(Team::Fo)).with_id("t1"),
            Staff::new("t2", Role::Therapist, Some(Team::Smm)).with_id("t2"),
            Staff::new("p1", Role::Pca, None).floating().with_id("p1"),
            Staff::new("p2", Role::Pca, None).floating().with_id("p2"),
        ],
        ward_beds: BTreeMap::from([(Team::Fo, 10), (Team::Smm, 10)]),
        ..Roster::default()
    }
}

fn saved_bytes(dir: &std::path::Path) -> Vec<u8> {
    let mut ctl = WorkflowController::open(
        JsonStorage::open(dir).unwrap(),
        Arc::new(roster()),
        date(),
        CacheService::disabled(),
        Box::new(FixedClock(Utc.with_ymd_and_hms(2025, 10, 1, 8, 0, 0).unwrap())),
    )
    .unwrap();
    assert!(ctl.advance().advanced());
    fs::read(ctl.storage().path_for(date())).unwrap()
}

#[test]
fn json_storage_roundtrip() {
    let dir = tempdir().unwrap();
    let bytes = saved_bytes(dir.path());
    assert!(!bytes.is_empty());
    assert!(dir.path().join("2025-10-01.json").exists());

    let storage = JsonStorage::open(dir.path()).unwrap();
    let loaded = storage.load(date()).unwrap().unwrap();
    assert_eq!(loaded.step, WorkflowStep::TherapistPca);
    assert_eq!(loaded.date, date());
    assert!(loaded.calculations.is_some());
    assert!(loaded.manual.is_empty());

    let other: ScheduleDate = "2025-10-02".parse().unwrap();
    assert!(storage.load(other).unwrap().is_none());
}

#[test]
fn decode_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    let bytes = saved_bytes(dir.path());
    let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    value
        .as_object_mut()
        .unwrap()
        .insert("legacy_notes".into(), serde_json::json!("x"));
    let tampered = serde_json::to_vec(&value).unwrap();
    assert!(matches!(
        decode_saved_state(&tampered, date()),
        Err(DecodeError::Json(_))
    ));

    let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    value["manual"]["notes"] = serde_json::json!("x");
    let tampered = serde_json::to_vec(&value).unwrap();
    assert!(matches!(
        decode_saved_state(&tampered, date()),
        Err(DecodeError::Json(_))
    ));
}

#[test]
fn decode_checks_version_and_date() {
    let dir = tempdir().unwrap();
    let bytes = saved_bytes(dir.path());
    assert!(decode_saved_state(&bytes, date()).is_ok());

    let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    value["format_version"] = serde_json::json!(99);
    let future = serde_json::to_vec(&value).unwrap();
    assert!(matches!(
        decode_saved_state(&future, date()),
        Err(DecodeError::Version { found: 99, .. })
    ));

    // format 1 : pas de section des overrides manuels sauvegardés
    value["format_version"] = serde_json::json!(1);
    let older = serde_json::to_vec(&value).unwrap();
    assert!(matches!(
        decode_saved_state(&older, date()),
        Err(DecodeError::Version { found: 1, .. })
    ));

    value.as_object_mut().unwrap().remove("format_version");
    let bare = serde_json::to_vec(&value).unwrap();
    assert!(matches!(
        decode_saved_state(&bare, date()),
        Err(DecodeError::MissingVersion)
    ));

    let other: ScheduleDate = "2025-10-02".parse().unwrap();
    assert!(matches!(
        decode_saved_state(&bytes, other),
        Err(DecodeError::DateMismatch { .. })
    ));
}

#[test]
fn decode_rejects_invalid_day_status() {
    let dir = tempdir().unwrap();
    let bytes = saved_bytes(dir.path());
    let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    value["inputs"]["staff"]["t1"]["fte"] = serde_json::json!(0.3);
    let bad = serde_json::to_vec(&value).unwrap();
    assert!(matches!(
        decode_saved_state(&bad, date()),
        Err(DecodeError::InvalidStatus { .. })
    ));
}

#[test]
fn pca_grid_csv_export() {
    let roster = roster();
    let inputs = DailyInputs::from_roster(&roster);
    let calcs = Allocator::new(&roster).compute(date(), &inputs, &[]).unwrap();

    let mut buf = Vec::new();
    io::write_pca_csv(&mut buf, &calcs, &roster).unwrap();
    let out = String::from_utf8(buf).unwrap();
    insta::assert_snapshot!(out, @r###"
    staff,name,floating,slot1,slot2,slot3,slot4
    p1,p1,yes,FO,FO,FO,FO
    p2,p2,yes,SMM,SMM,SMM,SMM
    "###);
}

#[test]
fn bed_transfer_csv_export() {
    let roster = roster();
    let inputs = DailyInputs::from_roster(&roster);
    let mut calcs = Allocator::new(&roster).compute(date(), &inputs, &[]).unwrap();
    calcs.beds = allocate_beds(&BTreeMap::from([(Team::Fo, 4), (Team::Smm, -4)]), 1);

    let mut buf = Vec::new();
    io::write_bed_transfers_csv(&mut buf, &calcs).unwrap();
    assert_eq!(String::from_utf8(buf).unwrap(), "source,target,beds\nSMM,FO,4\n");
}

#[test]
fn day_status_csv_normalizes_leave() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("leave.csv");
    fs::write(&path, "id,leave,fte,slots\nt1,AL,,\np1,,0.5,1;3\nt2,none,1,\n").unwrap();

    let rows = io::import_day_status_csv(&path).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].0, StaffId::new("t1"));
    assert_eq!(rows[0].1.leave, LeaveType::Annual);
    assert_eq!(rows[0].1.fte, 0.0);
    assert_eq!(rows[1].1.fte, 0.5);
    assert_eq!(rows[1].1.available_slots, SlotSet::parse_list("1,3").unwrap());
    assert!(rows[2].1.leave.is_on_duty());
    assert!(rows[2].1.available_slots.is_full_day());

    fs::write(&path, "id,leave,fte,slots\nt1,--,,\n").unwrap();
    assert!(io::import_day_status_csv(&path).is_err());
    fs::write(&path, "id,leave,fte,slots\nt1,,0.3,\n").unwrap();
    assert!(io::import_day_status_csv(&path).is_err());
}

#[test]
fn staff_csv_import_marks_teamless_pca_floating() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("staff.csv");
    fs::write(
        &path,
        "id,name,role,team,floating,fte\nt1,Alice,PT,FO,,\np1,Bob,PCA,,,0.5\nn1,Chloe,pca,smm,no,\n",
    )
    .unwrap();

    let staff = io::import_staff_csv(&path).unwrap();
    assert_eq!(staff.len(), 3);
    assert!(staff[0].is_therapist());
    assert_eq!(staff[0].team, Some(Team::Fo));
    assert!(staff[1].floating);
    assert_eq!(staff[1].team, None);
    assert_eq!(staff[1].fte, 0.5);
    assert!(!staff[2].floating);
    assert_eq!(staff[2].team, Some(Team::Smm));
}

#[test]
fn roster_json_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("roster.json");
    let roster = roster();
    io::save_roster_json(&path, &roster).unwrap();
    let loaded = io::load_roster_json(&path).unwrap();
    assert_eq!(loaded.staff, roster.staff);
    assert_eq!(loaded.ward_beds, roster.ward_beds);
    assert_eq!(loaded.options, roster.options);
}
