#![forbid(unsafe_code)]
use std::collections::BTreeMap;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;
use wardalloc::io;
use wardalloc::model::{Role, Roster, Staff, Team};

fn write_roster(path: &std::path::Path) {
    let roster = Roster {
        staff: vec![
            Staff::new("Alice", Role::Therapist, Some(Team::Fo)).with_id("t1"),
            Staff::new("Bruno", Role::Therapist, Some(Team::Smm)).with_id("t2"),
            Staff::new("Chloe", Role::Pca, None).floating().with_id("p1"),
            Staff::new("David", Role::Pca, None).floating().with_id("p2"),
        ],
        ward_beds: BTreeMap::from([(Team::Fo, 10), (Team::Smm, 10)]),
        ..Roster::default()
    };
    io::save_roster_json(path, &roster).unwrap();
}

#[test]
fn help_lists_commands() {
    Command::cargo_bin("wardalloc-cli")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("advance"))
        .stdout(predicate::str::contains("resolve-tie"));
}

#[test]
fn advance_writes_schedule_file() {
    let dir = tempdir().unwrap();
    let roster = dir.path().join("roster.json");
    let store = dir.path().join("schedules");
    write_roster(&roster);

    let run = |args: &[&str]| {
        let mut cmd = Command::cargo_bin("wardalloc-cli").unwrap();
        cmd.arg("--roster")
            .arg(&roster)
            .arg("--store")
            .arg(&store)
            .arg("--date")
            .arg("2025-10-01")
            .args(args);
        cmd.assert()
    };

    run(&["status"])
        .success()
        .stdout(predicate::str::contains("leave-fte"));
    run(&["set-leave", "--staff", "Bruno", "--leave", "AL"]).success();
    run(&["set-leave", "--staff", "t2", "--fte", "1"]).success();
    run(&["advance"])
        .success()
        .stdout(predicate::str::contains("leave-fte → therapist-pca"));
    assert!(store.join("2025-10-01.json").exists());

    let csv = dir.path().join("pca.csv");
    run(&["export", "--out-csv", csv.to_str().unwrap()]).success();
    let grid = std::fs::read_to_string(&csv).unwrap();
    assert!(grid.starts_with("staff,name,floating,slot1,slot2,slot3,slot4"));
    assert!(grid.contains("p1,Chloe,yes,FO,FO,FO,FO"));
}

#[test]
fn bad_date_is_rejected() {
    Command::cargo_bin("wardalloc-cli")
        .unwrap()
        .args(["--date", "01/10/2025", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid schedule date"));
}
