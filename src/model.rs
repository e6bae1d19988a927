use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::allocation::AllocOptions;

/// Équipes du service. L'ensemble est fermé et connu à la compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Team {
    Fo,
    Smm,
    Sfm,
    Cppc,
    Mc,
    Gmc,
    Nsm,
    Dro,
}

impl Team {
    pub const ALL: [Team; 8] = [
        Team::Fo,
        Team::Smm,
        Team::Sfm,
        Team::Cppc,
        Team::Mc,
        Team::Gmc,
        Team::Nsm,
        Team::Dro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Fo => "FO",
            Team::Smm => "SMM",
            Team::Sfm => "SFM",
            Team::Cppc => "CPPC",
            Team::Mc => "MC",
            Team::Gmc => "GMC",
            Team::Nsm => "NSM",
            Team::Dro => "DRO",
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Team {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Team::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ModelError::UnknownTeam(wanted.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("unknown team: {0}")]
    UnknownTeam(String),
    #[error("malformed leave type: {0:?}")]
    MalformedLeaveType(String),
    #[error("slot out of range (expected 1..=4): {0}")]
    SlotOutOfRange(u8),
    #[error("duplicate slot in slot list: {0}")]
    DuplicateSlot(u8),
    #[error("invalid FTE {0}: expected a quarter multiple within 0.0..=1.0")]
    InvalidFte(f64),
    #[error("invalid schedule date (expected YYYY-MM-DD): {0}")]
    InvalidDate(String),
}

/// Identifiant fort pour Staff
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StaffId(String);

impl StaffId {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_owned())
    }
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StaffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Therapist,
    Pca,
}

/// Type de congé du jour. `OnDuty` est la sentinelle « pas de congé ».
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tag", rename_all = "snake_case")]
pub enum LeaveType {
    OnDuty,
    Annual,
    Sick,
    Study,
    Conference,
    Other(String),
}

impl LeaveType {
    /// Unique point de normalisation des chaînes de congé brutes.
    ///
    /// `None`, chaîne vide, `none`, `on duty`, `on-duty` → `OnDuty`. Les
    /// abréviations connues sont reconnues ; toute autre étiquette
    /// alphanumérique devient `Other`. Une chaîne sans aucun caractère
    /// alphanumérique est rejetée.
    pub fn normalize(raw: Option<&str>) -> Result<Self, ModelError> {
        let Some(raw) = raw else {
            return Ok(LeaveType::OnDuty);
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(LeaveType::OnDuty);
        }
        if !trimmed.chars().any(char::is_alphanumeric) {
            return Err(ModelError::MalformedLeaveType(raw.to_string()));
        }
        let key: String = trimmed
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == '_' { ' ' } else { c })
            .collect();
        let key = key.split_whitespace().collect::<Vec<_>>().join(" ");
        Ok(match key.as_str() {
            "none" | "on duty" | "onduty" | "duty" => LeaveType::OnDuty,
            "al" | "annual" | "annual leave" => LeaveType::Annual,
            "sl" | "sick" | "sick leave" => LeaveType::Sick,
            "study" | "study leave" | "sdl" => LeaveType::Study,
            "conference" | "conf" | "course" => LeaveType::Conference,
            _ => LeaveType::Other(trimmed.to_string()),
        })
    }

    pub fn is_on_duty(&self) -> bool {
        matches!(self, LeaveType::OnDuty)
    }
}

/// Créneau quotidien fixe (1 à 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Slot(u8);

impl Slot {
    pub const ALL: [Slot; 4] = [Slot(1), Slot(2), Slot(3), Slot(4)];

    pub fn new(n: u8) -> Result<Self, ModelError> {
        if (1..=4).contains(&n) {
            Ok(Self(n))
        } else {
            Err(ModelError::SlotOutOfRange(n))
        }
    }

    pub fn number(&self) -> u8 {
        self.0
    }

    fn bit(&self) -> u8 {
        1 << (self.0 - 1)
    }
}

impl TryFrom<u8> for Slot {
    type Error = ModelError;
    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Slot::new(n)
    }
}

impl From<Slot> for u8 {
    fn from(s: Slot) -> u8 {
        s.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ensemble de créneaux (bitmask), sérialisé comme liste triée.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct SlotSet(u8);

impl SlotSet {
    pub const EMPTY: SlotSet = SlotSet(0);
    pub const FULL_DAY: SlotSet = SlotSet(0b1111);

    pub fn contains(&self, slot: Slot) -> bool {
        self.0 & slot.bit() != 0
    }
    pub fn insert(&mut self, slot: Slot) {
        self.0 |= slot.bit();
    }
    pub fn remove(&mut self, slot: Slot) {
        self.0 &= !slot.bit();
    }
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
    pub fn is_full_day(&self) -> bool {
        self.0 == Self::FULL_DAY.0
    }
    pub fn is_subset_of(&self, other: &SlotSet) -> bool {
        self.0 & !other.0 == 0
    }
    pub fn iter(&self) -> impl Iterator<Item = Slot> + '_ {
        Slot::ALL.into_iter().filter(move |s| self.contains(*s))
    }

    /// Parse `"1,2,4"` ; chaîne vide → journée complète.
    pub fn parse_list(raw: &str) -> Result<Self, ModelError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::FULL_DAY);
        }
        let mut nums = Vec::new();
        for part in raw.split([',', ';', ' ']).filter(|p| !p.is_empty()) {
            let n: u8 = part
                .trim()
                .parse()
                .map_err(|_| ModelError::SlotOutOfRange(0))?;
            nums.push(n);
        }
        SlotSet::try_from(nums)
    }
}

impl Default for SlotSet {
    fn default() -> Self {
        Self::FULL_DAY
    }
}

impl FromIterator<Slot> for SlotSet {
    fn from_iter<I: IntoIterator<Item = Slot>>(iter: I) -> Self {
        let mut set = SlotSet::EMPTY;
        for s in iter {
            set.insert(s);
        }
        set
    }
}

impl TryFrom<Vec<u8>> for SlotSet {
    type Error = ModelError;
    fn try_from(nums: Vec<u8>) -> Result<Self, Self::Error> {
        let mut set = SlotSet::EMPTY;
        for n in nums {
            let slot = Slot::new(n)?;
            if set.contains(slot) {
                return Err(ModelError::DuplicateSlot(n));
            }
            set.insert(slot);
        }
        Ok(set)
    }
}

impl From<SlotSet> for Vec<u8> {
    fn from(set: SlotSet) -> Vec<u8> {
        set.iter().map(|s| s.number()).collect()
    }
}

/// Vérifie qu'une FTE est finie, dans `0.0..=1.0` et multiple de 0.25.
pub fn validate_fte(fte: f64) -> Result<f64, ModelError> {
    let quarters = fte * 4.0;
    if !fte.is_finite() || !(0.0..=1.0).contains(&fte) || quarters.fract() != 0.0 {
        return Err(ModelError::InvalidFte(fte));
    }
    Ok(fte)
}

/// Membre du personnel (référencé par les allocations, jamais copié).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Staff {
    pub id: StaffId,
    pub name: String,
    pub role: Role,
    /// Équipe d'attache ; absente pour les PCA flottants.
    #[serde(default)]
    pub team: Option<Team>,
    #[serde(default)]
    pub floating: bool,
    /// FTE contractuelle utilisée quand le jour n'a pas de saisie.
    #[serde(default = "default_fte")]
    pub fte: f64,
}

fn default_fte() -> f64 {
    1.0
}

impl Staff {
    pub fn new<N: Into<String>>(name: N, role: Role, team: Option<Team>) -> Self {
        Self {
            id: StaffId::random(),
            name: name.into(),
            role,
            team,
            floating: false,
            fte: 1.0,
        }
    }

    pub fn with_id<S: AsRef<str>>(mut self, id: S) -> Self {
        self.id = StaffId::new(id);
        self
    }

    pub fn floating(mut self) -> Self {
        self.floating = true;
        self.team = None;
        self
    }

    pub fn is_therapist(&self) -> bool {
        self.role == Role::Therapist
    }

    pub fn is_pca(&self) -> bool {
        self.role == Role::Pca
    }

    /// Statut du jour par défaut : en service, FTE contractuelle, journée complète.
    pub fn default_status(&self) -> DayStatus {
        DayStatus {
            leave: LeaveType::OnDuty,
            fte: self.fte,
            available_slots: SlotSet::FULL_DAY,
        }
    }
}

/// Saisie quotidienne de congé / FTE pour un membre du personnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DayStatus {
    pub leave: LeaveType,
    pub fte: f64,
    #[serde(default)]
    pub available_slots: SlotSet,
}

impl DayStatus {
    pub fn on_duty(fte: f64) -> Self {
        Self {
            leave: LeaveType::OnDuty,
            fte,
            available_slots: SlotSet::FULL_DAY,
        }
    }

    pub fn on_leave(leave: LeaveType) -> Self {
        Self {
            leave,
            fte: 0.0,
            available_slots: SlotSet::EMPTY,
        }
    }

    pub fn with_slots(mut self, slots: SlotSet) -> Self {
        self.available_slots = slots;
        self
    }

    /// En service avec une FTE restante non nulle.
    pub fn is_working(&self) -> bool {
        self.leave.is_on_duty() && self.fte > 0.0
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        validate_fte(self.fte)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProgramId(String);

impl ProgramId {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_owned())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Programme spécial (ex. réhabilitation cardiaque) consommant une part de FTE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecialProgram {
    pub id: ProgramId,
    pub name: String,
    /// Équipe servie ; à défaut l'équipe d'attache du kiné.
    #[serde(default)]
    pub team: Option<Team>,
    pub fte_cost: f64,
    #[serde(default = "default_required")]
    pub therapists_required: u32,
}

fn default_required() -> u32 {
    1
}

/// Liaison kiné → programme nommé ou service SPT d'équipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SptAllocation {
    pub staff: StaffId,
    /// Programme nommé ; absent = service SPT auprès de `team`.
    #[serde(default)]
    pub program: Option<ProgramId>,
    #[serde(default)]
    pub team: Option<Team>,
    #[serde(default)]
    pub fte: Option<f64>,
    #[serde(default)]
    pub priority: u32,
}

/// Indice de préférence d'un PCA (équipes et rang dans l'ordre de priorité).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PcaPreference {
    pub staff: StaffId,
    #[serde(default)]
    pub preferred_teams: Vec<Team>,
    pub rank: u32,
}

/// Configuration complète en lecture seule (fournisseur roster/config).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Roster {
    #[serde(default)]
    pub staff: Vec<Staff>,
    #[serde(default)]
    pub programs: Vec<SpecialProgram>,
    #[serde(default)]
    pub spt_allocations: Vec<SptAllocation>,
    #[serde(default)]
    pub pca_preferences: Vec<PcaPreference>,
    /// Nombre de lits par équipe par défaut.
    #[serde(default)]
    pub ward_beds: BTreeMap<Team, u32>,
    #[serde(default)]
    pub options: AllocOptions,
}

impl Roster {
    pub fn find_staff<'a>(&'a self, id: &StaffId) -> Option<&'a Staff> {
        self.staff.iter().find(|s| &s.id == id)
    }
    pub fn find_staff_by_name<'a>(&'a self, name: &str) -> Option<&'a Staff> {
        self.staff.iter().find(|s| s.name == name)
    }
    pub fn find_program<'a>(&'a self, id: &ProgramId) -> Option<&'a SpecialProgram> {
        self.programs.iter().find(|p| &p.id == id)
    }
    pub fn preference_for<'a>(&'a self, id: &StaffId) -> Option<&'a PcaPreference> {
        self.pca_preferences.iter().find(|p| &p.staff == id)
    }
}

/// Clé de date de planning : jour calendaire local, `YYYY-MM-DD`, sans fuseau.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleDate(NaiveDate);

impl ScheduleDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn today_local() -> Self {
        Self(Local::now().date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn key(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for ScheduleDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for ScheduleDate {
    type Err = ModelError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // strict : exactement 10 caractères, pas d'heure ni de décalage
        if s.len() != 10 {
            return Err(ModelError::InvalidDate(s.to_string()));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self)
            .map_err(|_| ModelError::InvalidDate(s.to_string()))
    }
}

impl TryFrom<String> for ScheduleDate {
    type Error = ModelError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ScheduleDate> for String {
    fn from(d: ScheduleDate) -> String {
        d.key()
    }
}
