//! Persistence boundary.
//!
//! Both backends give the same guarantees the orchestration relies on: an
//! attribution insert is an atomic check-and-insert on the triple, a rate
//! update is a conditional update on the row it was computed from, and a
//! mirror row is created at most once per engagement.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    chain::EngagementId,
    contracts::{ContractMirrorRecord, MirrorPatch},
    identity::{Address, Timestamp},
    ledger::Attribution,
    rate_limit::TalentCommissionRate,
};

mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("{column} value {value} exceeds the sqlite integer range")]
    OutOfRange { column: &'static str, value: u64 },
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inserted<T> {
    New(T),
    Existing(T),
}

pub trait AttributionStore: Send + Sync {
    fn insert_attribution(
        &self,
        attribution: &Attribution,
    ) -> Result<Inserted<Attribution>, StoreError>;

    fn find_attribution(
        &self,
        client: &Address,
        talent: &Address,
        scout: &Address,
    ) -> Result<Option<Attribution>, StoreError>;

    fn attributions_for(
        &self,
        client: &Address,
        talent: &Address,
    ) -> Result<Vec<Attribution>, StoreError>;
}

pub trait RateStore: Send + Sync {
    fn register_talent(
        &self,
        rate: &TalentCommissionRate,
    ) -> Result<TalentCommissionRate, StoreError>;

    fn commission_rate(&self, talent: &Address)
        -> Result<Option<TalentCommissionRate>, StoreError>;

    /// Writes the new percent only if the row still holds the expected
    /// values. Returns whether the write happened.
    fn update_commission_rate(
        &self,
        talent: &Address,
        expected_percent: u8,
        expected_last_changed: Option<Timestamp>,
        new_percent: u8,
        now: Timestamp,
    ) -> Result<bool, StoreError>;
}

pub trait MirrorStore: Send + Sync {
    fn insert_mirror(
        &self,
        record: &ContractMirrorRecord,
    ) -> Result<Inserted<ContractMirrorRecord>, StoreError>;

    fn mirror(&self, engagement_id: EngagementId)
        -> Result<Option<ContractMirrorRecord>, StoreError>;

    fn patch_mirror(
        &self,
        engagement_id: EngagementId,
        patch: &MirrorPatch,
    ) -> Result<Option<ContractMirrorRecord>, StoreError>;
}

impl<T: AttributionStore + ?Sized> AttributionStore for Arc<T> {
    fn insert_attribution(
        &self,
        attribution: &Attribution,
    ) -> Result<Inserted<Attribution>, StoreError> {
        (**self).insert_attribution(attribution)
    }

    fn find_attribution(
        &self,
        client: &Address,
        talent: &Address,
        scout: &Address,
    ) -> Result<Option<Attribution>, StoreError> {
        (**self).find_attribution(client, talent, scout)
    }

    fn attributions_for(
        &self,
        client: &Address,
        talent: &Address,
    ) -> Result<Vec<Attribution>, StoreError> {
        (**self).attributions_for(client, talent)
    }
}

impl<T: RateStore + ?Sized> RateStore for Arc<T> {
    fn register_talent(
        &self,
        rate: &TalentCommissionRate,
    ) -> Result<TalentCommissionRate, StoreError> {
        (**self).register_talent(rate)
    }

    fn commission_rate(
        &self,
        talent: &Address,
    ) -> Result<Option<TalentCommissionRate>, StoreError> {
        (**self).commission_rate(talent)
    }

    fn update_commission_rate(
        &self,
        talent: &Address,
        expected_percent: u8,
        expected_last_changed: Option<Timestamp>,
        new_percent: u8,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        (**self).update_commission_rate(
            talent,
            expected_percent,
            expected_last_changed,
            new_percent,
            now,
        )
    }
}

impl<T: MirrorStore + ?Sized> MirrorStore for Arc<T> {
    fn insert_mirror(
        &self,
        record: &ContractMirrorRecord,
    ) -> Result<Inserted<ContractMirrorRecord>, StoreError> {
        (**self).insert_mirror(record)
    }

    fn mirror(
        &self,
        engagement_id: EngagementId,
    ) -> Result<Option<ContractMirrorRecord>, StoreError> {
        (**self).mirror(engagement_id)
    }

    fn patch_mirror(
        &self,
        engagement_id: EngagementId,
        patch: &MirrorPatch,
    ) -> Result<Option<ContractMirrorRecord>, StoreError> {
        (**self).patch_mirror(engagement_id, patch)
    }
}

type TripleKey = (Address, Address, Address);

#[derive(Default)]
struct Tables {
    attributions: BTreeMap<TripleKey, Attribution>,
    rates: BTreeMap<Address, TalentCommissionRate>,
    mirror: BTreeMap<EngagementId, ContractMirrorRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl AttributionStore for MemoryStore {
    fn insert_attribution(
        &self,
        attribution: &Attribution,
    ) -> Result<Inserted<Attribution>, StoreError> {
        let mut tables = self.tables()?;
        let key = (
            attribution.client.clone(),
            attribution.talent.clone(),
            attribution.scout.clone(),
        );
        if let Some(existing) = tables.attributions.get(&key) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        tables.attributions.insert(key, attribution.clone());
        Ok(Inserted::New(attribution.clone()))
    }

    fn find_attribution(
        &self,
        client: &Address,
        talent: &Address,
        scout: &Address,
    ) -> Result<Option<Attribution>, StoreError> {
        let tables = self.tables()?;
        let key = (client.clone(), talent.clone(), scout.clone());
        Ok(tables.attributions.get(&key).cloned())
    }

    fn attributions_for(
        &self,
        client: &Address,
        talent: &Address,
    ) -> Result<Vec<Attribution>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .attributions
            .values()
            .filter(|a| &a.client == client && &a.talent == talent)
            .cloned()
            .collect())
    }
}

impl RateStore for MemoryStore {
    fn register_talent(
        &self,
        rate: &TalentCommissionRate,
    ) -> Result<TalentCommissionRate, StoreError> {
        let mut tables = self.tables()?;
        Ok(tables
            .rates
            .entry(rate.talent.clone())
            .or_insert_with(|| rate.clone())
            .clone())
    }

    fn commission_rate(
        &self,
        talent: &Address,
    ) -> Result<Option<TalentCommissionRate>, StoreError> {
        let tables = self.tables()?;
        Ok(tables.rates.get(talent).cloned())
    }

    fn update_commission_rate(
        &self,
        talent: &Address,
        expected_percent: u8,
        expected_last_changed: Option<Timestamp>,
        new_percent: u8,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        match tables.rates.get_mut(talent) {
            Some(row)
                if row.current_percent == expected_percent
                    && row.last_changed_at == expected_last_changed =>
            {
                row.current_percent = new_percent;
                row.last_changed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl MirrorStore for MemoryStore {
    fn insert_mirror(
        &self,
        record: &ContractMirrorRecord,
    ) -> Result<Inserted<ContractMirrorRecord>, StoreError> {
        let mut tables = self.tables()?;
        if let Some(existing) = tables.mirror.get(&record.engagement_id) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        tables.mirror.insert(record.engagement_id, record.clone());
        Ok(Inserted::New(record.clone()))
    }

    fn mirror(
        &self,
        engagement_id: EngagementId,
    ) -> Result<Option<ContractMirrorRecord>, StoreError> {
        let tables = self.tables()?;
        Ok(tables.mirror.get(&engagement_id).cloned())
    }

    fn patch_mirror(
        &self,
        engagement_id: EngagementId,
        patch: &MirrorPatch,
    ) -> Result<Option<ContractMirrorRecord>, StoreError> {
        let mut tables = self.tables()?;
        Ok(tables.mirror.get_mut(&engagement_id).map(|row| {
            row.merge(patch);
            row.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(talent: &str, percent: u8) -> TalentCommissionRate {
        TalentCommissionRate {
            talent: Address::parse(talent).unwrap(),
            current_percent: percent,
            last_changed_at: None,
            account_created_at: 0,
        }
    }

    #[test]
    fn register_keeps_the_first_row() {
        let store = MemoryStore::new();
        store.register_talent(&rate("0x7a", 10)).unwrap();
        let stored = store.register_talent(&rate("0x7a", 30)).unwrap();
        assert_eq!(stored.current_percent, 10);
    }

    #[test]
    fn conditional_update_detects_stale_reads() {
        let store = MemoryStore::new();
        let talent = Address::parse("0x7a").unwrap();
        store.register_talent(&rate("0x7a", 10)).unwrap();
        assert!(store.update_commission_rate(&talent, 10, None, 12, 100).unwrap());
        assert!(!store.update_commission_rate(&talent, 10, None, 14, 101).unwrap());
        let row = store.commission_rate(&talent).unwrap().unwrap();
        assert_eq!((row.current_percent, row.last_changed_at), (12, Some(100)));
    }
}
