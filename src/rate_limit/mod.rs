use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::CommissionConfig,
    identity::{Address, Timestamp, DAY_SECS},
    store::{RateStore, StoreError},
};

/// Grace and cool-down windows for a user-editable field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangePolicy {
    pub grace_secs: u64,
    pub cooldown_secs: u64,
}

impl ChangePolicy {
    pub fn commission(config: &CommissionConfig) -> Self {
        Self {
            grace_secs: config.grace_secs,
            cooldown_secs: config.cooldown_secs,
        }
    }

    pub fn evaluate<T: PartialEq>(
        &self,
        field: &LimitedField<T>,
        proposed: &T,
        now: Timestamp,
    ) -> ChangeDecision {
        if field.value == *proposed {
            return ChangeDecision::Unchanged;
        }
        if now.saturating_sub(field.created_at) < self.grace_secs {
            return ChangeDecision::Allowed;
        }
        // never changed counts as changed at the epoch
        let elapsed = now.saturating_sub(field.last_changed_at.unwrap_or(0));
        if elapsed >= self.cooldown_secs {
            return ChangeDecision::Allowed;
        }
        let cooldown_days = self.cooldown_secs.div_ceil(DAY_SECS);
        let days_remaining = cooldown_days.saturating_sub(elapsed / DAY_SECS).max(1);
        ChangeDecision::CoolingDown { days_remaining }
    }
}

/// A value that changes at most once per cool-down window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimitedField<T> {
    pub value: T,
    pub last_changed_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeDecision {
    Unchanged,
    Allowed,
    CoolingDown { days_remaining: u64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TalentCommissionRate {
    pub talent: Address,
    pub current_percent: u8,
    pub last_changed_at: Option<Timestamp>,
    pub account_created_at: Timestamp,
}

impl TalentCommissionRate {
    pub fn as_field(&self) -> LimitedField<u8> {
        LimitedField {
            value: self.current_percent,
            last_changed_at: self.last_changed_at,
            created_at: self.account_created_at,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateChange {
    pub talent: Address,
    pub previous_percent: u8,
    pub current_percent: u8,
    pub changed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("commission {percent}% outside 0..={max}%")]
    OutOfRange { percent: u8, max: u8 },
    #[error("commission was changed recently, retry in {days_remaining} day(s)")]
    RateLimited { days_remaining: u64 },
    #[error("unknown talent {0}")]
    UnknownTalent(Address),
    #[error("commission for {0} is being changed concurrently")]
    Contended(Address),
    #[error(transparent)]
    Store(#[from] StoreError),
}

const MAX_RACES: usize = 2;

pub struct FeeRateLimiter<R> {
    rates: R,
    policy: ChangePolicy,
    max_percent: u8,
}

impl<R: RateStore> FeeRateLimiter<R> {
    pub fn new(rates: R, config: &CommissionConfig) -> Self {
        Self {
            rates,
            policy: ChangePolicy::commission(config),
            max_percent: config.max_percent,
        }
    }

    pub fn register_talent(
        &self,
        talent: &Address,
        percent: u8,
        account_created_at: Timestamp,
    ) -> Result<TalentCommissionRate, RateLimitError> {
        if percent > self.max_percent {
            return Err(RateLimitError::OutOfRange {
                percent,
                max: self.max_percent,
            });
        }
        let rate = TalentCommissionRate {
            talent: talent.clone(),
            current_percent: percent,
            last_changed_at: None,
            account_created_at,
        };
        Ok(self.rates.register_talent(&rate)?)
    }

    pub fn current_rate(&self, talent: &Address) -> Result<TalentCommissionRate, RateLimitError> {
        self.rates
            .commission_rate(talent)?
            .ok_or_else(|| RateLimitError::UnknownTalent(talent.clone()))
    }

    pub fn propose_rate_change(
        &self,
        talent: &Address,
        new_percent: u8,
        now: Timestamp,
    ) -> Result<RateChange, RateLimitError> {
        if new_percent > self.max_percent {
            return Err(RateLimitError::OutOfRange {
                percent: new_percent,
                max: self.max_percent,
            });
        }
        for _ in 0..=MAX_RACES {
            let current = self.current_rate(talent)?;
            match self.policy.evaluate(&current.as_field(), &new_percent, now) {
                ChangeDecision::Unchanged => {
                    return Ok(RateChange {
                        talent: talent.clone(),
                        previous_percent: current.current_percent,
                        current_percent: current.current_percent,
                        changed: false,
                    });
                }
                ChangeDecision::CoolingDown { days_remaining } => {
                    debug!(%talent, days_remaining, "commission change rejected");
                    return Err(RateLimitError::RateLimited { days_remaining });
                }
                ChangeDecision::Allowed => {
                    let applied = self.rates.update_commission_rate(
                        talent,
                        current.current_percent,
                        current.last_changed_at,
                        new_percent,
                        now,
                    )?;
                    if applied {
                        info!(
                            %talent,
                            from = current.current_percent,
                            to = new_percent,
                            "commission rate changed"
                        );
                        return Ok(RateChange {
                            talent: talent.clone(),
                            previous_percent: current.current_percent,
                            current_percent: new_percent,
                            changed: true,
                        });
                    }
                    debug!(%talent, "commission row moved underneath us, re-evaluating");
                }
            }
        }
        Err(RateLimitError::Contended(talent.clone()))
    }
}
