//! The exposed surface: one [`Marketplace`] per process, built by the entry
//! point from its config, store and chain.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    chain::{Amount, CreateEngagement, EngagementId, EscrowChain},
    config::MarketConfig,
    contracts::{ContractMirror, ContractMirrorRecord, ReconcileReport},
    error::Failure,
    escrow::{EscrowFlow, EscrowOrchestrator, PollPolicy},
    identity::{now_unix, Address, Timestamp},
    ledger::{Attribution, AttributionLedger},
    rate_limit::{FeeRateLimiter, RateChange, TalentCommissionRate},
    session::{ReferralToken, ScoutSessionStore, SessionStorage},
    store::{AttributionStore, MirrorStore, RateStore},
};

pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngagementRequest {
    pub client: Address,
    pub talent: Address,
    pub amount: Amount,
}

pub fn parse_address(role: &'static str, raw: &str) -> Result<Address, Failure> {
    Address::parse(raw).map_err(|source| Failure::InvalidAddress { role, source })
}

pub struct Marketplace<C, S> {
    config: MarketConfig,
    ledger: AttributionLedger<Arc<S>>,
    rates: FeeRateLimiter<Arc<S>>,
    mirror: ContractMirror,
    chain: Arc<C>,
    clock: Clock,
}

impl<C, S> Marketplace<C, S>
where
    C: EscrowChain + 'static,
    S: AttributionStore + RateStore + MirrorStore + 'static,
{
    pub fn new(config: MarketConfig, store: Arc<S>, chain: Arc<C>) -> Self {
        let ledger = AttributionLedger::new(Arc::clone(&store), config.referral.horizon_secs);
        let rates = FeeRateLimiter::new(Arc::clone(&store), &config.commission);
        let mirror = ContractMirror::new(store);
        Self {
            config,
            ledger,
            rates,
            mirror,
            chain,
            clock: Arc::new(now_unix),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    pub fn now(&self) -> Timestamp {
        (self.clock)()
    }

    pub fn session<T: SessionStorage>(&self, storage: T) -> ScoutSessionStore<T> {
        ScoutSessionStore::new(storage, self.config.referral.horizon_secs)
    }

    pub fn capture_referral<T: SessionStorage>(
        &self,
        session: &ScoutSessionStore<T>,
        candidate: Option<&str>,
        current_identity: Option<&Address>,
    ) -> Result<Option<ReferralToken>, Failure> {
        Ok(session.capture(candidate, current_identity, self.now())?)
    }

    pub fn peek_referral<T: SessionStorage>(
        &self,
        session: &ScoutSessionStore<T>,
    ) -> Result<Option<ReferralToken>, Failure> {
        Ok(session.peek_or_restore(self.now())?)
    }

    pub fn consume_referral<T: SessionStorage>(
        &self,
        session: &ScoutSessionStore<T>,
    ) -> Result<Option<ReferralToken>, Failure> {
        Ok(session.consume_once(self.now())?)
    }

    pub fn lock_attribution(
        &self,
        client: &str,
        talent: &str,
        scout: &str,
    ) -> Result<Attribution, Failure> {
        Ok(self.ledger.lock_attribution(client, talent, scout, self.now())?)
    }

    /// The session token is consumed whether or not it yields an attribution.
    pub fn attribute_signup<T: SessionStorage>(
        &self,
        session: &ScoutSessionStore<T>,
        client: &str,
        talent: &str,
    ) -> Result<Option<Attribution>, Failure> {
        let Some(token) = self.consume_referral(session)? else {
            debug!(client, "signup without a referral");
            return Ok(None);
        };
        self.lock_attribution(client, talent, token.scout.as_str())
            .map(Some)
    }

    pub fn register_talent(
        &self,
        talent: &str,
        percent: u8,
        account_created_at: Option<Timestamp>,
    ) -> Result<TalentCommissionRate, Failure> {
        let talent = parse_address("talent", talent)?;
        let created_at = account_created_at.unwrap_or_else(|| self.now());
        Ok(self.rates.register_talent(&talent, percent, created_at)?)
    }

    pub fn current_rate(&self, talent: &str) -> Result<TalentCommissionRate, Failure> {
        let talent = parse_address("talent", talent)?;
        Ok(self.rates.current_rate(&talent)?)
    }

    pub fn propose_rate_change(&self, talent: &str, new_percent: u8) -> Result<RateChange, Failure> {
        let talent = parse_address("talent", talent)?;
        Ok(self.rates.propose_rate_change(&talent, new_percent, self.now())?)
    }

    pub fn engagement_params(&self, request: &EngagementRequest) -> Result<CreateEngagement, Failure> {
        let attribution =
            self.ledger
                .active_attribution(&request.client, &request.talent, self.now())?;
        if let Some(attribution) = &attribution {
            debug!(
                id = %attribution.id,
                locked_fee_percent = attribution.locked_fee_percent,
                "engagement carries scout attribution"
            );
        }
        Ok(CreateEngagement {
            client: request.client.clone(),
            talent: request.talent.clone(),
            scout: attribution.as_ref().map(|a| a.scout.clone()),
            scout_fee_percent: attribution.as_ref().map(|a| a.locked_fee_percent),
            amount: request.amount,
        })
    }

    pub fn orchestrator(&self, params: CreateEngagement) -> EscrowOrchestrator<C> {
        EscrowOrchestrator::new(
            Arc::clone(&self.chain),
            self.mirror.clone(),
            PollPolicy::from_config(&self.config.escrow),
            params,
        )
    }

    pub fn start_escrow_flow(&self, request: &EngagementRequest) -> Result<EscrowFlow<C>, Failure> {
        let params = self.engagement_params(request)?;
        info!(
            client = %params.client,
            talent = %params.talent,
            amount = params.amount,
            attributed = params.scout.is_some(),
            "starting escrow flow"
        );
        Ok(self.orchestrator(params).spawn())
    }

    pub fn mirror_record(
        &self,
        engagement_id: EngagementId,
    ) -> Result<Option<ContractMirrorRecord>, Failure> {
        Ok(self.mirror.record(engagement_id)?)
    }

    pub fn mirror(&self) -> &ContractMirror {
        &self.mirror
    }

    pub fn reconcile(&self) -> ReconcileReport {
        self.mirror.reconcile()
    }
}
