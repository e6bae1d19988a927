use crate::model::{ModelError, ScheduleDate, StaffId};
use crate::state::{SavedState, FORMAT_VERSION};
use anyhow::Context;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Collaborateur de persistance, une entrée par date de planning.
pub trait Storage {
    /// Charge l'état sauvegardé d'une date, `None` si absent.
    fn load(&self, date: ScheduleDate) -> anyhow::Result<Option<SavedState>>;
    /// Sauvegarde de manière atomique.
    fn save(&self, date: ScheduleDate, state: &SavedState) -> anyhow::Result<()>;
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed schedule JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing format_version")]
    MissingVersion,
    #[error("unsupported format version {found} (expected {expected})")]
    Version { found: u64, expected: u32 },
    #[error("record is for {found}, expected {expected}")]
    DateMismatch {
        found: ScheduleDate,
        expected: ScheduleDate,
    },
    #[error("invalid day status for {staff}: {source}")]
    InvalidStatus {
        staff: StaffId,
        #[source]
        source: ModelError,
    },
}

/// Décodage strict : version vérifiée, champs inconnus rejetés, statuts validés.
pub fn decode_saved_state(bytes: &[u8], expected: ScheduleDate) -> Result<SavedState, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let found = value
        .get("format_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or(DecodeError::MissingVersion)?;
    if found != u64::from(FORMAT_VERSION) {
        return Err(DecodeError::Version {
            found,
            expected: FORMAT_VERSION,
        });
    }
    let state: SavedState = serde_json::from_value(value)?;
    if state.date != expected {
        return Err(DecodeError::DateMismatch {
            found: state.date,
            expected,
        });
    }
    for (staff, status) in &state.inputs.staff {
        status.validate().map_err(|source| DecodeError::InvalidStatus {
            staff: staff.clone(),
            source,
        })?;
    }
    Ok(state)
}

/// Un fichier `<YYYY-MM-DD>.json` par date dans un répertoire.
pub struct JsonStorage {
    dir: PathBuf,
}

impl JsonStorage {
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn path_for(&self, date: ScheduleDate) -> PathBuf {
        self.dir.join(format!("{}.json", date.key()))
    }
}

impl Storage for JsonStorage {
    fn load(&self, date: ScheduleDate) -> anyhow::Result<Option<SavedState>> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let state = decode_saved_state(&data, date)
            .with_context(|| format!("decoding {}", path.display()))?;
        Ok(Some(state))
    }

    fn save(&self, date: ScheduleDate, state: &SavedState) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating schedule directory {}", self.dir.display()))?;
        let path = self.path_for(date);
        let json = serde_json::to_vec_pretty(state)?;
        let mut tmp = NamedTempFile::new_in(&self.dir).with_context(|| "creating temp file")?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).with_context(|| "atomic rename")?;
        Ok(())
    }
}

/// Stockage en mémoire (JSON sérialisé), avec injection d'échec pour les tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RefCell<BTreeMap<ScheduleDate, Vec<u8>>>,
    fail_saves: Cell<bool>,
    saves: Cell<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.set(fail);
    }

    pub fn save_count(&self) -> usize {
        self.saves.get()
    }

    pub fn insert_raw(&self, date: ScheduleDate, bytes: Vec<u8>) {
        self.records.borrow_mut().insert(date, bytes);
    }
}

impl Storage for MemoryStorage {
    fn load(&self, date: ScheduleDate) -> anyhow::Result<Option<SavedState>> {
        let records = self.records.borrow();
        let Some(bytes) = records.get(&date) else {
            return Ok(None);
        };
        Ok(Some(decode_saved_state(bytes, date)?))
    }

    fn save(&self, date: ScheduleDate, state: &SavedState) -> anyhow::Result<()> {
        if self.fail_saves.get() {
            anyhow::bail!("storage unavailable");
        }
        let bytes = serde_json::to_vec(state)?;
        self.records.borrow_mut().insert(date, bytes);
        self.saves.set(self.saves.get() + 1);
        Ok(())
    }
}
