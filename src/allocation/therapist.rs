use super::types::{DutyKind, IssueCode, TherapistAllocation, ValidationIssue};
use super::DayEntry;
use crate::model::{ProgramId, Roster, SptAllocation, Staff, StaffId, Team};
use crate::rounding::{from_quarters, to_quarters};
use std::collections::BTreeMap;

struct Working<'a> {
    staff: &'a Staff,
    remaining: i32,
}

#[derive(Debug, Default)]
pub(crate) struct TherapistOutcome {
    pub allocations: Vec<TherapistAllocation>,
    pub issues: Vec<ValidationIssue>,
}

impl TherapistOutcome {
    fn push(&mut self, w: &mut Working<'_>, team: Team, duty: DutyKind, program: Option<ProgramId>, quarters: i32) {
        w.remaining -= quarters;
        tracing::debug!(staff = %w.staff.id, %team, ?duty, quarters, "therapist duty assigned");
        self.allocations.push(TherapistAllocation {
            staff: w.staff.id.clone(),
            team,
            duty,
            program,
            fte: from_quarters(quarters),
        });
    }
}

/// Affecte les kinés en service : programme nommé > service SPT > service d'équipe.
///
/// Les kinés en congé sont écartés avant toute passe ; la FTE restante borne
/// le cumul de services.
pub(crate) fn allocate_therapists(roster: &Roster, day: &[DayEntry<'_>]) -> TherapistOutcome {
    let mut out = TherapistOutcome::default();

    let mut working: BTreeMap<StaffId, Working<'_>> = BTreeMap::new();
    for entry in day.iter().filter(|e| e.staff.is_therapist()) {
        if !entry.status.is_working() {
            tracing::debug!(staff = %entry.staff.id, "therapist excluded (leave or zero FTE)");
            continue;
        }
        working.insert(
            entry.staff.id.clone(),
            Working {
                staff: entry.staff,
                remaining: to_quarters(entry.status.fte),
            },
        );
    }

    let mut bindings: Vec<&SptAllocation> = roster.spt_allocations.iter().collect();
    bindings.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.staff.cmp(&b.staff))
            .then_with(|| a.program.cmp(&b.program))
    });

    for b in &bindings {
        if roster.find_staff(&b.staff).is_none() {
            out.issues.push(ValidationIssue::error(
                IssueCode::UnknownReference,
                format!("SPT allocation references unknown staff {}", b.staff),
            ));
        }
        if let Some(pid) = &b.program {
            if roster.find_program(pid).is_none() {
                out.issues.push(ValidationIssue::error(
                    IssueCode::UnknownReference,
                    format!("SPT allocation references unknown program {pid}"),
                ));
            }
        }
    }

    // 1. programmes nommés
    let mut programs: Vec<_> = roster.programs.iter().collect();
    programs.sort_by(|a, b| a.id.cmp(&b.id));
    for program in programs {
        if !program.fte_cost.is_finite() || program.fte_cost <= 0.0 || program.fte_cost > 1.0 {
            out.issues.push(ValidationIssue::error(
                IssueCode::PreconditionViolation,
                format!("program {} has invalid FTE cost {}", program.id, program.fte_cost),
            ));
            continue;
        }
        let cost = to_quarters(program.fte_cost).max(1);
        let mut staffed = 0u32;

        for b in bindings.iter().filter(|b| b.program.as_ref() == Some(&program.id)) {
            if staffed >= program.therapists_required {
                break;
            }
            let Some(w) = working.get_mut(&b.staff) else {
                continue;
            };
            if w.remaining < cost {
                out.issues.push(ValidationIssue::warning(
                    IssueCode::InsufficientFte,
                    format!(
                        "{} lacks FTE for program {} ({} < {})",
                        w.staff.id,
                        program.id,
                        from_quarters(w.remaining),
                        program.fte_cost
                    ),
                ));
                continue;
            }
            let Some(team) = program.team.or(w.staff.team) else {
                out.issues.push(ValidationIssue::warning(
                    IssueCode::UnassignedTherapist,
                    format!("no team for {} on program {}", w.staff.id, program.id),
                ));
                continue;
            };
            out.push(w, team, DutyKind::SpecialProgram, Some(program.id.clone()), cost);
            staffed += 1;
        }

        if staffed < program.therapists_required {
            out.issues.push(ValidationIssue::warning(
                IssueCode::UnstaffedProgram,
                format!(
                    "program {} staffed {}/{}",
                    program.id, staffed, program.therapists_required
                ),
            ));
        }
    }

    // 2. service SPT d'équipe
    for b in bindings.iter().filter(|b| b.program.is_none()) {
        let Some(w) = working.get_mut(&b.staff) else {
            continue;
        };
        let requested = match b.fte {
            Some(f) if f.is_finite() && f > 0.0 => to_quarters(f),
            Some(_) => {
                out.issues.push(ValidationIssue::error(
                    IssueCode::PreconditionViolation,
                    format!("SPT allocation for {} has invalid FTE", b.staff),
                ));
                continue;
            }
            None => w.remaining,
        };
        if requested == 0 {
            continue;
        }
        if requested > w.remaining {
            out.issues.push(ValidationIssue::warning(
                IssueCode::InsufficientFte,
                format!(
                    "{} lacks FTE for SPT duty ({} < {})",
                    w.staff.id,
                    from_quarters(w.remaining),
                    from_quarters(requested)
                ),
            ));
            continue;
        }
        let Some(team) = b.team.or(w.staff.team) else {
            out.issues.push(ValidationIssue::warning(
                IssueCode::UnassignedTherapist,
                format!("no team for SPT duty of {}", w.staff.id),
            ));
            continue;
        };
        out.push(w, team, DutyKind::Spt, None, requested);
    }

    // 3. service ordinaire dans l'équipe d'attache
    for w in working.values_mut() {
        if w.remaining <= 0 {
            continue;
        }
        match w.staff.team {
            Some(team) => {
                let q = w.remaining;
                out.push(w, team, DutyKind::Ordinary, None, q);
            }
            None => out.issues.push(ValidationIssue::warning(
                IssueCode::UnassignedTherapist,
                format!("{} has remaining FTE but no home team", w.staff.id),
            )),
        }
    }

    out.allocations.sort_by(|a, b| a.staff.cmp(&b.staff));
    out
}
