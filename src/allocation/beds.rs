use super::types::{IssueCode, ValidationIssue};
use crate::model::Team;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Transfert de lits : `source` cède ses lits, `target` les reprend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BedTransfer {
    pub source: Team,
    pub target: Team,
    pub beds: u32,
}

/// Ajustement appliqué à une équipe pour absorber l'écart d'arrondi.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub team: Team,
    pub delta: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BedAllocation {
    /// Valeurs de relève après réconciliation (somme nulle si dans la tolérance).
    pub relieving: BTreeMap<Team, i32>,
    pub transfers: Vec<BedTransfer>,
    #[serde(default)]
    pub reconciliation: Option<Reconciliation>,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
}

impl BedAllocation {
    pub fn beds_released(&self, team: Team) -> u32 {
        self.transfers
            .iter()
            .filter(|t| t.source == team)
            .map(|t| t.beds)
            .sum()
    }

    pub fn beds_taken(&self, team: Team) -> u32 {
        self.transfers
            .iter()
            .filter(|t| t.target == team)
            .map(|t| t.beds)
            .sum()
    }
}

/// Répartit les lits de relève entre équipes.
///
/// Un écart résiduel (somme des valeurs) dans la tolérance est absorbé par
/// l'équipe de plus grande magnitude ; au-delà, un `ReconciliationOverflow`
/// est attaché au résultat et rien n'est absorbé.
pub fn allocate_beds(relieving: &BTreeMap<Team, i32>, tolerance: u32) -> BedAllocation {
    let mut adjusted = relieving.clone();
    let mut issues = Vec::new();
    let mut reconciliation = None;

    let remainder: i32 = adjusted.values().sum();
    if remainder != 0 {
        if remainder.unsigned_abs() <= tolerance {
            // plus grande magnitude ; à égalité, première équipe dans l'ordre
            let largest = adjusted
                .iter()
                .max_by(|a, b| a.1.abs().cmp(&b.1.abs()).then_with(|| b.0.cmp(a.0)))
                .map(|(team, _)| *team);
            if let Some(team) = largest {
                if let Some(v) = adjusted.get_mut(&team) {
                    *v -= remainder;
                }
                tracing::debug!(%team, remainder, "bed rounding remainder absorbed");
                reconciliation = Some(Reconciliation {
                    team,
                    delta: -remainder,
                });
            }
        } else {
            tracing::warn!(remainder, tolerance, "bed reconciliation overflow");
            issues.push(ValidationIssue::error(
                IssueCode::ReconciliationOverflow,
                format!(
                    "bed relief does not balance: remainder {remainder} exceeds tolerance {tolerance}"
                ),
            ));
        }
    }

    let transfers = match_transfers(&adjusted);

    BedAllocation {
        relieving: adjusted,
        transfers,
        reconciliation,
        issues,
    }
}

/// Appariement glouton : plus gros excédent vers plus gros déficit d'abord.
fn match_transfers(relieving: &BTreeMap<Team, i32>) -> Vec<BedTransfer> {
    let mut takers: Vec<(Team, u32)> = relieving
        .iter()
        .filter(|(_, v)| **v > 0)
        .map(|(t, v)| (*t, v.unsigned_abs()))
        .collect();
    let mut givers: Vec<(Team, u32)> = relieving
        .iter()
        .filter(|(_, v)| **v < 0)
        .map(|(t, v)| (*t, v.unsigned_abs()))
        .collect();
    takers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    givers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut out = Vec::new();
    let (mut ti, mut gi) = (0usize, 0usize);
    while ti < takers.len() && gi < givers.len() {
        let beds = takers[ti].1.min(givers[gi].1);
        out.push(BedTransfer {
            source: givers[gi].0,
            target: takers[ti].0,
            beds,
        });
        takers[ti].1 -= beds;
        givers[gi].1 -= beds;
        if takers[ti].1 == 0 {
            ti += 1;
        }
        if givers[gi].1 == 0 {
            gi += 1;
        }
    }
    out
}
