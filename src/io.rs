use crate::allocation::ScheduleCalculations;
use crate::model::{DayStatus, LeaveType, Role, Roster, Slot, SlotSet, Staff, StaffId, Team};
use anyhow::{bail, Context};
use csv::{ReaderBuilder, WriterBuilder};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Import du personnel depuis CSV: header `id,name,role,team[,floating][,fte]`
pub fn import_staff_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Staff>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut out = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let id = rec.get(0).context("missing id")?.trim();
        let name = rec.get(1).context("missing name")?.trim();
        if id.is_empty() || name.is_empty() {
            bail!("invalid staff row (empty id or name)");
        }
        let role = parse_role(rec.get(2).context("missing role")?)
            .with_context(|| format!("invalid role for {id}"))?;
        let team = match rec.get(3).map(str::trim) {
            Some("") | None => None,
            Some(raw) => Some(raw.parse::<Team>()?),
        };
        let mut staff = Staff::new(name, role, team).with_id(id);
        if let Some(flag) = rec.get(4).map(str::trim).filter(|f| !f.is_empty()) {
            staff.floating = parse_bool(flag)
                .with_context(|| format!("invalid floating value for {id}"))?;
        }
        if staff.team.is_none() && staff.is_pca() {
            staff.floating = true;
        }
        if let Some(fte) = rec.get(5).map(str::trim).filter(|f| !f.is_empty()) {
            staff.fte = crate::model::validate_fte(fte.parse().with_context(|| format!("fte for {id}"))?)?;
        }
        out.push(staff);
    }
    Ok(out)
}

/// Import des saisies du jour: header `id,leave,fte[,slots]`.
/// Les chaînes de congé sont normalisées ici et nulle part ailleurs.
pub fn import_day_status_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<(StaffId, DayStatus)>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut out = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let id = rec.get(0).context("missing id")?.trim();
        if id.is_empty() {
            bail!("invalid day status row (empty id)");
        }
        let leave = LeaveType::normalize(rec.get(1))
            .with_context(|| format!("invalid leave type for {id}"))?;
        let status = if leave.is_on_duty() {
            let fte: f64 = rec
                .get(2)
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map_or(Ok(1.0), |f| f.parse::<f64>())
                .with_context(|| format!("invalid fte for {id}"))?;
            let slots = match rec.get(3) {
                Some(raw) => SlotSet::parse_list(raw)
                    .with_context(|| format!("invalid slots for {id}"))?,
                None => SlotSet::FULL_DAY,
            };
            DayStatus::on_duty(fte).with_slots(slots)
        } else {
            DayStatus::on_leave(leave)
        };
        status
            .validate()
            .with_context(|| format!("invalid status for {id}"))?;
        out.push((StaffId::new(id), status));
    }
    Ok(out)
}

fn parse_role(s: &str) -> anyhow::Result<Role> {
    match s.trim().to_ascii_lowercase().as_str() {
        "pt" | "therapist" | "physio" | "physiotherapist" => Ok(Role::Therapist),
        "pca" => Ok(Role::Pca),
        other => bail!("expected therapist or pca, got {other:?}"),
    }
}

fn parse_bool(s: &str) -> anyhow::Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => bail!("expected boolean"),
    }
}

pub fn load_roster_json<P: AsRef<Path>>(path: P) -> anyhow::Result<Roster> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let roster: Roster =
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(roster)
}

/// Export JSON du roster (jolie mise en forme)
pub fn save_roster_json<P: AsRef<Path>>(path: P, roster: &Roster) -> anyhow::Result<()> {
    let s = serde_json::to_string_pretty(roster)?;
    fs::write(path, s)?;
    Ok(())
}

pub fn export_calculations_json<P: AsRef<Path>>(path: P, calcs: &ScheduleCalculations) -> anyhow::Result<()> {
    let s = serde_json::to_string_pretty(calcs)?;
    fs::write(path, s)?;
    Ok(())
}

/// Grille PCA: header `staff,name,floating,slot1,slot2,slot3,slot4`
pub fn write_pca_csv<W: Write>(out: W, calcs: &ScheduleCalculations, roster: &Roster) -> anyhow::Result<()> {
    let mut w = WriterBuilder::new().has_headers(true).from_writer(out);
    w.write_record(["staff", "name", "floating", "slot1", "slot2", "slot3", "slot4"])?;
    for (id, alloc) in &calcs.pcas {
        let name = roster.find_staff(id).map(|s| s.name.as_str()).unwrap_or("");
        let cells: Vec<&str> = Slot::ALL
            .iter()
            .map(|slot| alloc.slots.get(slot).map_or("", Team::as_str))
            .collect();
        let mut record = vec![id.as_str(), name, if alloc.floating { "yes" } else { "no" }];
        record.extend(cells);
        w.write_record(record)?;
    }
    w.flush()?;
    Ok(())
}

pub fn export_pca_csv<P: AsRef<Path>>(path: P, calcs: &ScheduleCalculations, roster: &Roster) -> anyhow::Result<()> {
    let file = fs::File::create(path)?;
    write_pca_csv(file, calcs, roster)
}

/// Transferts de lits: header `source,target,beds`
pub fn write_bed_transfers_csv<W: Write>(out: W, calcs: &ScheduleCalculations) -> anyhow::Result<()> {
    let mut w = WriterBuilder::new().has_headers(true).from_writer(out);
    w.write_record(["source", "target", "beds"])?;
    let mut buf = itoa::Buffer::new();
    for t in &calcs.beds.transfers {
        w.write_record([t.source.as_str(), t.target.as_str(), buf.format(t.beds)])?;
    }
    w.flush()?;
    Ok(())
}
