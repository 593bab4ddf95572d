use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    identity::{Address, IdentityError, Timestamp},
    store::{AttributionStore, Inserted, RateStore, StoreError},
};

#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("scout cannot refer themselves as client")]
    SelfReferral,
    #[error("invalid {role} address: {source}")]
    InvalidAddress {
        role: &'static str,
        #[source]
        source: IdentityError,
    },
    #[error("talent {0} has no commission rate on record")]
    UnknownTalent(Address),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommissionRule {
    OncePerTriple,
}

impl CommissionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionRule::OncePerTriple => "once_per_triple",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "once_per_triple" => Some(CommissionRule::OncePerTriple),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttributionStatus {
    Active,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attribution {
    pub id: String,
    pub client: Address,
    pub talent: Address,
    pub scout: Address,
    pub locked_fee_percent: u8,
    pub commission_rule: CommissionRule,
    pub captured_at: Timestamp,
    pub expires_at: Timestamp,
}

impl Attribution {
    pub fn status(&self, now: Timestamp) -> AttributionStatus {
        if now >= self.expires_at {
            AttributionStatus::Expired
        } else {
            AttributionStatus::Active
        }
    }
}

pub fn attribution_id(client: &Address, talent: &Address, scout: &Address) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"attribution");
    hasher.update(client.as_str().as_bytes());
    hasher.update(talent.as_str().as_bytes());
    hasher.update(scout.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct AttributionLedger<S> {
    store: S,
    horizon_secs: u64,
}

impl<S: AttributionStore + RateStore> AttributionLedger<S> {
    pub fn new(store: S, horizon_secs: u64) -> Self {
        Self {
            store,
            horizon_secs,
        }
    }

    pub fn lock_attribution(
        &self,
        client: &str,
        talent: &str,
        scout: &str,
        now: Timestamp,
    ) -> Result<Attribution, AttributionError> {
        if same_identity(client, scout) {
            return Err(AttributionError::SelfReferral);
        }
        let client = parse_role("client", client)?;
        let talent = parse_role("talent", talent)?;
        let scout = parse_role("scout", scout)?;

        if let Some(existing) = self.store.find_attribution(&client, &talent, &scout)? {
            debug!(id = %existing.id, "attribution already locked");
            return Ok(existing);
        }

        let rate = self
            .store
            .commission_rate(&talent)?
            .ok_or_else(|| AttributionError::UnknownTalent(talent.clone()))?;
        let attribution = Attribution {
            id: attribution_id(&client, &talent, &scout),
            client,
            talent,
            scout,
            locked_fee_percent: rate.current_percent,
            commission_rule: CommissionRule::OncePerTriple,
            captured_at: now,
            expires_at: now.saturating_add(self.horizon_secs),
        };
        match self.store.insert_attribution(&attribution)? {
            Inserted::New(stored) => {
                info!(
                    id = %stored.id,
                    scout = %stored.scout,
                    locked_fee_percent = stored.locked_fee_percent,
                    "attribution locked"
                );
                Ok(stored)
            }
            Inserted::Existing(stored) => {
                debug!(id = %stored.id, "lost attribution insert race, returning stored row");
                Ok(stored)
            }
        }
    }

    pub fn active_attribution(
        &self,
        client: &Address,
        talent: &Address,
        now: Timestamp,
    ) -> Result<Option<Attribution>, AttributionError> {
        let mut rows = self.store.attributions_for(client, talent)?;
        rows.retain(|a| a.status(now) == AttributionStatus::Active);
        Ok(rows.into_iter().min_by_key(|a| (a.captured_at, a.id.clone())))
    }
}

fn parse_role(role: &'static str, raw: &str) -> Result<Address, AttributionError> {
    Address::parse(raw).map_err(|source| AttributionError::InvalidAddress { role, source })
}

// canonical forms when both parse, raw text otherwise
fn same_identity(a: &str, b: &str) -> bool {
    match (Address::parse(a), Address::parse(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CommissionConfig,
        identity::{DAY_SECS, HOUR_SECS},
        rate_limit::{FeeRateLimiter, TalentCommissionRate},
        store::MemoryStore,
    };
    use std::sync::Arc;

    const HORIZON: u64 = 30 * DAY_SECS;
    const CLIENT: &str = "0xc1";
    const TALENT: &str = "0x7a";
    const SCOUT: &str = "0x5c";

    fn store_with_talent(percent: u8, created_at: Timestamp) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .register_talent(&TalentCommissionRate {
                talent: Address::parse(TALENT).unwrap(),
                current_percent: percent,
                last_changed_at: None,
                account_created_at: created_at,
            })
            .unwrap();
        store
    }

    #[test]
    fn repeat_lock_keeps_original_rate() {
        let store = store_with_talent(10, 0);
        let ledger = AttributionLedger::new(store.clone(), HORIZON);
        let limiter = FeeRateLimiter::new(store.clone(), &CommissionConfig::default());

        let first = ledger.lock_attribution(CLIENT, TALENT, SCOUT, HOUR_SECS).unwrap();
        limiter
            .propose_rate_change(&first.talent, 35, 2 * HOUR_SECS)
            .unwrap();
        let second = ledger
            .lock_attribution(CLIENT, TALENT, SCOUT, 3 * HOUR_SECS)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.locked_fee_percent, 10);
    }

    #[test]
    fn rate_changes_never_touch_locked_rows() {
        let store = store_with_talent(20, 0);
        let ledger = AttributionLedger::new(store.clone(), HORIZON);
        let limiter = FeeRateLimiter::new(store.clone(), &CommissionConfig::default());

        let early = ledger.lock_attribution(CLIENT, TALENT, SCOUT, 100).unwrap();
        limiter.propose_rate_change(&early.talent, 5, 200).unwrap();
        let late = ledger.lock_attribution("0xc2", TALENT, SCOUT, 300).unwrap();

        let stored = store
            .find_attribution(&early.client, &early.talent, &early.scout)
            .unwrap()
            .unwrap();
        assert_eq!(stored.locked_fee_percent, 20);
        assert_eq!(late.locked_fee_percent, 5);
    }

    #[test]
    fn self_referral_is_always_rejected() {
        let ledger = AttributionLedger::new(store_with_talent(10, 0), HORIZON);
        let padded = format!("0x{:0>64}", "c1");
        for (client, scout) in [
            ("0xc1", "0xc1"),
            ("0xC1", padded.as_str()),
            ("garbage", "garbage"),
        ] {
            let err = ledger.lock_attribution(client, TALENT, scout, 1).unwrap_err();
            assert!(matches!(err, AttributionError::SelfReferral), "{client}");
        }
        let unknown_talent = ledger.lock_attribution("0xc1", "0xdead", "0xc1", 1);
        assert!(matches!(unknown_talent, Err(AttributionError::SelfReferral)));
    }

    #[test]
    fn malformed_identities_are_rejected() {
        let ledger = AttributionLedger::new(store_with_talent(10, 0), HORIZON);
        let err = ledger.lock_attribution(CLIENT, "talent", SCOUT, 1).unwrap_err();
        assert!(matches!(err, AttributionError::InvalidAddress { role: "talent", .. }));
    }

    #[test]
    fn unregistered_talent_cannot_be_attributed() {
        let ledger = AttributionLedger::new(Arc::new(MemoryStore::new()), HORIZON);
        let err = ledger.lock_attribution(CLIENT, TALENT, SCOUT, 1).unwrap_err();
        assert!(matches!(err, AttributionError::UnknownTalent(_)));
    }

    #[test]
    fn attribution_expires_by_time_only() {
        let store = store_with_talent(10, 0);
        let ledger = AttributionLedger::new(store, HORIZON);
        let locked = ledger.lock_attribution(CLIENT, TALENT, SCOUT, 50).unwrap();
        assert_eq!(locked.expires_at, 50 + HORIZON);
        assert_eq!(locked.status(49 + HORIZON), AttributionStatus::Active);
        assert_eq!(locked.status(50 + HORIZON), AttributionStatus::Expired);

        let client = Address::parse(CLIENT).unwrap();
        let talent = Address::parse(TALENT).unwrap();
        assert!(ledger.active_attribution(&client, &talent, 60).unwrap().is_some());
        assert!(ledger
            .active_attribution(&client, &talent, 50 + HORIZON)
            .unwrap()
            .is_none());
    }

    #[test]
    fn oldest_active_attribution_wins() {
        let store = store_with_talent(10, 0);
        let ledger = AttributionLedger::new(store, HORIZON);
        let first = ledger.lock_attribution(CLIENT, TALENT, "0x5d", 10).unwrap();
        ledger.lock_attribution(CLIENT, TALENT, SCOUT, 20).unwrap();
        let active = ledger
            .active_attribution(&first.client, &first.talent, 30)
            .unwrap()
            .unwrap();
        assert_eq!(active.scout, first.scout);
    }

    // lookup always misses, so every lock goes through the insert constraint
    struct BlindLookup(Arc<MemoryStore>);

    impl AttributionStore for BlindLookup {
        fn insert_attribution(
            &self,
            attribution: &Attribution,
        ) -> Result<Inserted<Attribution>, StoreError> {
            self.0.insert_attribution(attribution)
        }

        fn find_attribution(
            &self,
            _client: &Address,
            _talent: &Address,
            _scout: &Address,
        ) -> Result<Option<Attribution>, StoreError> {
            Ok(None)
        }

        fn attributions_for(
            &self,
            client: &Address,
            talent: &Address,
        ) -> Result<Vec<Attribution>, StoreError> {
            self.0.attributions_for(client, talent)
        }
    }

    impl RateStore for BlindLookup {
        fn register_talent(
            &self,
            rate: &TalentCommissionRate,
        ) -> Result<TalentCommissionRate, StoreError> {
            self.0.register_talent(rate)
        }

        fn commission_rate(
            &self,
            talent: &Address,
        ) -> Result<Option<TalentCommissionRate>, StoreError> {
            self.0.commission_rate(talent)
        }

        fn update_commission_rate(
            &self,
            talent: &Address,
            expected_percent: u8,
            expected_last_changed: Option<Timestamp>,
            new_percent: u8,
            now: Timestamp,
        ) -> Result<bool, StoreError> {
            self.0.update_commission_rate(
                talent,
                expected_percent,
                expected_last_changed,
                new_percent,
                now,
            )
        }
    }

    #[test]
    fn uniqueness_violation_returns_the_stored_row() {
        let inner = store_with_talent(10, 0);
        let ledger = AttributionLedger::new(BlindLookup(inner.clone()), HORIZON);
        let first = ledger.lock_attribution(CLIENT, TALENT, SCOUT, 5).unwrap();

        let limiter = FeeRateLimiter::new(inner.clone(), &CommissionConfig::default());
        limiter.propose_rate_change(&first.talent, 40, 6).unwrap();

        let raced = ledger.lock_attribution(CLIENT, TALENT, SCOUT, 7).unwrap();
        assert_eq!(raced, first);
        assert_eq!(
            inner
                .attributions_for(&first.client, &first.talent)
                .unwrap()
                .len(),
            1
        );
    }
}
