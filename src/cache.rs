use crate::model::ScheduleDate;
use crate::state::SavedState;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct CacheEntry {
    state: SavedState,
    stored_at: DateTime<Utc>,
    epoch: u64,
}

/// Cache explicite des états sauvegardés, injecté dans le contrôleur.
///
/// Une entrée est servie si elle a moins de `ttl` et appartient à l'époque
/// courante ; `bump_epoch` invalide tout d'un coup.
#[derive(Debug, Clone)]
pub struct CacheService {
    ttl: Duration,
    epoch: u64,
    entries: BTreeMap<ScheduleDate, CacheEntry>,
}

impl CacheService {
    pub fn new(ttl: Duration, epoch: u64) -> Self {
        Self {
            ttl,
            epoch,
            entries: BTreeMap::new(),
        }
    }

    /// Cache qui ne sert jamais rien (TTL nul).
    pub fn disabled() -> Self {
        Self::new(Duration::zero(), 0)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, date: ScheduleDate, now: DateTime<Utc>) -> Option<&SavedState> {
        let entry = self.entries.get(&date)?;
        let fresh = entry.epoch == self.epoch && now - entry.stored_at < self.ttl;
        fresh.then_some(&entry.state)
    }

    pub fn put(&mut self, date: ScheduleDate, state: SavedState, now: DateTime<Utc>) {
        self.entries.insert(
            date,
            CacheEntry {
                state,
                stored_at: now,
                epoch: self.epoch,
            },
        );
    }

    pub fn invalidate(&mut self, date: ScheduleDate) {
        self.entries.remove(&date);
    }

    pub fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Retire les entrées périmées ou d'une époque antérieure.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let (epoch, ttl) = (self.epoch, self.ttl);
        self.entries
            .retain(|_, e| e.epoch == epoch && now - e.stored_at < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
