//! Primitives d'arrondi partagées par tous les allocateurs.
//!
//! Fonctions pures et totales : NaN/Infini se propagent, la validation des
//! entrées finies se fait en amont.

/// Arrondi à l'entier le plus proche, moitié loin de zéro (lits entiers).
pub fn round_to_nearest_integer(x: f64) -> f64 {
    x.round()
}

/// Arrondi au multiple de 0.25 le plus proche (moyennes PCA par équipe).
pub fn round_to_nearest_quarter(x: f64) -> f64 {
    (x * 4.0).round() / 4.0
}

/// Convertit une valeur déjà finie en nombre de quarts entiers.
pub fn to_quarters(x: f64) -> i32 {
    (round_to_nearest_quarter(x) * 4.0) as i32
}

pub fn from_quarters(q: i32) -> f64 {
    f64::from(q) / 4.0
}
