use super::types::AllocError;
use crate::model::{Role, Team};
use crate::rounding::{round_to_nearest_integer, round_to_nearest_quarter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entrées du calcul FTE pour une journée.
#[derive(Debug, Clone, PartialEq)]
pub struct FteInputs {
    pub total_beds: f64,
    pub total_pt_on_duty: f64,
    pub total_pca_on_duty: f64,
    pub beds_per_team: BTreeMap<Team, f64>,
    pub pt_per_team: BTreeMap<Team, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BedsFte {
    pub beds_per_pt: f64,
    /// Positif : l'équipe doit reprendre des lits ; négatif : elle en cède.
    pub beds_for_relieving: BTreeMap<Team, i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PcaFte {
    pub average_pca_per_team: BTreeMap<Team, f64>,
}

fn check_inputs(inputs: &FteInputs) -> Result<(), AllocError> {
    let finite = inputs.total_beds.is_finite()
        && inputs.total_pt_on_duty.is_finite()
        && inputs.total_pca_on_duty.is_finite()
        && inputs.beds_per_team.values().all(|v| v.is_finite())
        && inputs.pt_per_team.values().all(|v| v.is_finite());
    if !finite {
        return Err(AllocError::NonFiniteInput("FTE calculator inputs"));
    }
    if inputs.total_pt_on_duty <= 0.0 {
        return Err(AllocError::ZeroOnDuty(Role::Therapist));
    }
    Ok(())
}

/// `bedsPerPT` global puis, par équipe, `round(bedsPerPT × pt − lits)`.
pub fn calculate_beds_fte(inputs: &FteInputs) -> Result<BedsFte, AllocError> {
    check_inputs(inputs)?;
    let beds_per_pt = inputs.total_beds / inputs.total_pt_on_duty;

    let beds_for_relieving = Team::ALL
        .into_iter()
        .map(|team| {
            let pt = inputs.pt_per_team.get(&team).copied().unwrap_or(0.0);
            let beds = inputs.beds_per_team.get(&team).copied().unwrap_or(0.0);
            let relief = round_to_nearest_integer(beds_per_pt * pt - beds) as i32;
            (team, relief)
        })
        .collect();

    tracing::debug!(beds_per_pt, "beds FTE computed");
    Ok(BedsFte {
        beds_per_pt,
        beds_for_relieving,
    })
}

/// Moyenne cible de PCA par équipe, arrondie au quart.
pub fn calculate_pca_fte(inputs: &FteInputs, beds: &BedsFte) -> Result<PcaFte, AllocError> {
    check_inputs(inputs)?;
    if inputs.total_pca_on_duty <= 0.0 {
        return Err(AllocError::ZeroOnDuty(Role::Pca));
    }
    let beds_per_pca = inputs.total_beds / inputs.total_pca_on_duty;

    let average_pca_per_team = Team::ALL
        .into_iter()
        .map(|team| {
            let pt = inputs.pt_per_team.get(&team).copied().unwrap_or(0.0);
            let avg = if beds_per_pca > 0.0 {
                round_to_nearest_quarter(beds.beds_per_pt * pt / beds_per_pca)
            } else {
                // aucun lit : répartition proportionnelle aux kinés
                round_to_nearest_quarter(pt * inputs.total_pca_on_duty / inputs.total_pt_on_duty)
            };
            (team, avg)
        })
        .collect();

    Ok(PcaFte {
        average_pca_per_team,
    })
}
