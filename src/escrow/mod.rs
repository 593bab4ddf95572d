//! Escrow transaction orchestration.
//!
//! One [`EscrowOrchestrator`] drives one engagement attempt through
//!
//! ```text
//! Form -> CreatingProject -> WaitingConfirmation -> FundingEscrow -> Complete
//!                                   |                     |
//!                                   +------> Failed <-----+
//! ```
//!
//! Each submission and each confirmation wait runs inside a hard deadline;
//! transport errors spend the same budget as pending answers. Partial progress
//! (create tx, engagement id, fund tx) is never discarded, so a failed flow is
//! resumed with [`EscrowOrchestrator::resume`] instead of creating a second
//! engagement on-chain.

use std::{future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    chain::{decode_engagement_id, ChainError, CreateEngagement, EngagementId, EscrowChain, TxRef, TxStatus},
    config::EscrowConfig,
    contracts::{ContractMirror, ContractMirrorRecord, MirrorStatus},
    identity::now_unix,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    Form,
    CreatingProject,
    WaitingConfirmation,
    FundingEscrow,
    Complete,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscrowFailure {
    #[error("{step} submission failed: {reason}")]
    SubmissionFailed { step: Step, reason: String },
    #[error("{step} transaction rejected: {reason}")]
    TransactionRejected { step: Step, reason: String },
    /// Outcome unknown. `tx_ref` is absent when the submission itself never
    /// got an answer.
    #[error(
        "{step} transaction {} not confirmed after {waited_secs}s; \
         it may still land, check the chain before retrying",
        .tx_ref.as_ref().map_or("(no reference)", TxRef::as_str)
    )]
    ConfirmationTimeout {
        step: Step,
        tx_ref: Option<TxRef>,
        waited_secs: u64,
    },
    #[error("create transaction confirmed but its result is unreadable: {reason}")]
    ConfirmationPayloadUnparseable { reason: String },
    #[error("cancelled before submission")]
    Cancelled,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Create,
    Fund,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Step::Create => "create",
            Step::Fund => "fund",
        })
    }
}

/// Misuse of the orchestrator, as opposed to an outcome of the flow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscrowError {
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition { from: EscrowState, to: EscrowState },
    #[error("flow already started (state {0:?})")]
    AlreadyStarted(EscrowState),
    #[error("cancellation is only possible before anything is submitted")]
    NotCancellable,
    #[error("nothing to resume: {0}")]
    NotResumable(String),
    #[error("escrow task ended abnormally: {0}")]
    TaskFailed(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowTransaction {
    pub params: CreateEngagement,
    pub state: EscrowState,
    pub create_tx_ref: Option<TxRef>,
    pub engagement_id: Option<EngagementId>,
    pub fund_tx_ref: Option<TxRef>,
    pub failure: Option<EscrowFailure>,
}

impl EscrowTransaction {
    pub fn new(params: CreateEngagement) -> Self {
        Self {
            params,
            state: EscrowState::Form,
            create_tx_ref: None,
            engagement_id: None,
            fund_tx_ref: None,
            failure: None,
        }
    }

    pub fn summary(&self) -> String {
        match (&self.state, &self.failure) {
            (EscrowState::Complete, _) => format!(
                "engagement {} funded",
                self.engagement_id.map(|id| id.to_string()).unwrap_or_default()
            ),
            (_, Some(failure)) => match self.engagement_id {
                Some(id) => format!("{failure} (engagement {id} exists and can be resumed)"),
                None => failure.to_string(),
            },
            (state, None) => format!("in progress: {state:?}"),
        }
    }

    fn enter(&mut self, next: EscrowState) -> Result<(), EscrowError> {
        use EscrowState::*;
        let legal = match (self.state, next) {
            (Form, CreatingProject) => self.create_tx_ref.is_some(),
            (Form, Failed) => self.create_tx_ref.is_none(),
            (CreatingProject, WaitingConfirmation) => true,
            (WaitingConfirmation, FundingEscrow) => self.engagement_id.is_some(),
            (WaitingConfirmation, Failed) | (FundingEscrow, Failed) => true,
            (FundingEscrow, Complete) => {
                self.engagement_id.is_some()
                    && self.create_tx_ref.is_some()
                    && self.fund_tx_ref.is_some()
            }
            (Failed, WaitingConfirmation) => {
                self.create_tx_ref.is_some() && self.engagement_id.is_none()
            }
            (Failed, FundingEscrow) => self.engagement_id.is_some(),
            _ => false,
        };
        if !legal {
            return Err(EscrowError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowTransition {
    pub from: EscrowState,
    pub to: EscrowState,
    pub create_tx_ref: Option<TxRef>,
    pub engagement_id: Option<EngagementId>,
    pub fund_tx_ref: Option<TxRef>,
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn from_config(config: &EscrowConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            timeout: config.confirmation_timeout(),
        }
    }
}

pub struct EscrowOrchestrator<C> {
    chain: Arc<C>,
    mirror: ContractMirror,
    policy: PollPolicy,
    tx: EscrowTransaction,
    events: Option<mpsc::UnboundedSender<EscrowTransition>>,
}

impl<C: EscrowChain> EscrowOrchestrator<C> {
    pub fn new(
        chain: Arc<C>,
        mirror: ContractMirror,
        policy: PollPolicy,
        params: CreateEngagement,
    ) -> Self {
        Self {
            chain,
            mirror,
            policy,
            tx: EscrowTransaction::new(params),
            events: None,
        }
    }

    pub fn transaction(&self) -> &EscrowTransaction {
        &self.tx
    }

    pub fn state(&self) -> EscrowState {
        self.tx.state
    }

    pub fn subscribe(&mut self, sender: mpsc::UnboundedSender<EscrowTransition>) {
        self.events = Some(sender);
    }

    /// Abandons the flow. Only possible while nothing has been submitted.
    pub fn cancel(&mut self) -> Result<(), EscrowError> {
        if self.tx.state != EscrowState::Form || self.tx.create_tx_ref.is_some() {
            return Err(EscrowError::NotCancellable);
        }
        self.fail(EscrowFailure::Cancelled)
    }

    /// Runs a fresh flow to a terminal state.
    ///
    /// A create submission the chain refuses leaves the flow in `Form` with
    /// the failure recorded; nothing exists on-chain and `resume` starts over.
    pub async fn run(&mut self) -> Result<EscrowTransaction, EscrowError> {
        if self.tx.state != EscrowState::Form || self.tx.failure.is_some() {
            return Err(EscrowError::AlreadyStarted(self.tx.state));
        }
        self.drive().await
    }

    /// Continues a failed flow from its last durable point.
    pub async fn resume(&mut self) -> Result<EscrowTransaction, EscrowError> {
        match (self.tx.state, self.tx.failure.clone()) {
            (EscrowState::Form, Some(EscrowFailure::SubmissionFailed { .. })) => {
                self.tx.failure = None;
                self.drive().await
            }
            (EscrowState::Failed, Some(failure)) => {
                self.prepare_resume(&failure)?;
                self.drive().await
            }
            (state, _) => Err(EscrowError::NotResumable(format!("state {state:?}"))),
        }
    }

    pub fn spawn(mut self) -> EscrowFlow<C>
    where
        C: 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribe(sender);
        let handle = tokio::spawn(async move {
            let result = self.run().await;
            // close the stream once the flow is over
            self.events = None;
            (self, result)
        });
        EscrowFlow {
            transitions: UnboundedReceiverStream::new(receiver),
            handle,
        }
    }

    fn prepare_resume(&mut self, failure: &EscrowFailure) -> Result<(), EscrowError> {
        let target = match failure {
            EscrowFailure::Cancelled => {
                return Err(EscrowError::NotResumable("flow was cancelled".into()))
            }
            EscrowFailure::ConfirmationPayloadUnparseable { .. } => {
                return Err(EscrowError::NotResumable(
                    "engagement id unknown; inspect the create transaction".into(),
                ))
            }
            EscrowFailure::TransactionRejected {
                step: Step::Create, ..
            } => {
                return Err(EscrowError::NotResumable(
                    "create was rejected on-chain; start a new flow".into(),
                ))
            }
            EscrowFailure::ConfirmationTimeout {
                step: Step::Create,
                tx_ref: None,
                ..
            } => {
                return Err(EscrowError::NotResumable(
                    "create submission went unanswered; look for the engagement on-chain first"
                        .into(),
                ))
            }
            EscrowFailure::ConfirmationTimeout {
                step: Step::Create, ..
            } => EscrowState::WaitingConfirmation,
            EscrowFailure::TransactionRejected {
                step: Step::Fund, ..
            } => {
                // definitely failed: the next attempt submits a new fund tx
                self.tx.fund_tx_ref = None;
                EscrowState::FundingEscrow
            }
            // a timed-out fund tx is re-polled, never resubmitted; an
            // unanswered fund submission is sent again and the contract
            // rejects a second funding
            EscrowFailure::ConfirmationTimeout {
                step: Step::Fund, ..
            }
            | EscrowFailure::SubmissionFailed { .. } => EscrowState::FundingEscrow,
        };
        self.tx.failure = None;
        let from = self.tx.state;
        self.tx.enter(target)?;
        info!(?from, to = ?target, "resuming escrow flow");
        self.emit(from, None);
        Ok(())
    }

    async fn drive(&mut self) -> Result<EscrowTransaction, EscrowError> {
        loop {
            match self.tx.state {
                EscrowState::Form => {
                    if !self.submit_create().await? {
                        return Ok(self.tx.clone());
                    }
                }
                EscrowState::CreatingProject => self.advance(EscrowState::WaitingConfirmation)?,
                EscrowState::WaitingConfirmation => self.confirm_create().await?,
                EscrowState::FundingEscrow => self.fund().await?,
                EscrowState::Complete | EscrowState::Failed => return Ok(self.tx.clone()),
            }
        }
    }

    /// Returns false when the chain refused the submission and the flow
    /// stays in `Form`.
    async fn submit_create(&mut self) -> Result<bool, EscrowError> {
        let chain = Arc::clone(&self.chain);
        let params = self.tx.params.clone();
        match submit_with_retry(&self.policy, Step::Create, || chain.submit_create(&params)).await {
            Ok(tx_ref) => {
                info!(tx = %tx_ref, amount = params.amount, "create transaction submitted");
                self.tx.create_tx_ref = Some(tx_ref);
                self.advance(EscrowState::CreatingProject)?;
                Ok(true)
            }
            Err(SubmitError::Refused(err)) => {
                warn!(%err, "create submission refused, nothing on-chain");
                self.tx.failure = Some(EscrowFailure::SubmissionFailed {
                    step: Step::Create,
                    reason: err.to_string(),
                });
                self.emit(EscrowState::Form, self.tx.failure.as_ref().map(|f| f.to_string()));
                Ok(false)
            }
            Err(SubmitError::Unanswered { waited_secs }) => {
                self.fail(EscrowFailure::ConfirmationTimeout {
                    step: Step::Create,
                    tx_ref: None,
                    waited_secs,
                })?;
                Ok(false)
            }
        }
    }

    async fn confirm_create(&mut self) -> Result<(), EscrowError> {
        let Some(tx_ref) = self.tx.create_tx_ref.clone() else {
            return Err(EscrowError::IllegalTransition {
                from: self.tx.state,
                to: EscrowState::FundingEscrow,
            });
        };
        let payload = match self.await_confirmation(Step::Create, &tx_ref).await {
            Ok(payload) => payload,
            Err(failure) => return self.fail(failure),
        };
        let engagement_id = match decode_engagement_id(&payload) {
            Ok(id) => id,
            Err(err) => {
                return self.fail(EscrowFailure::ConfirmationPayloadUnparseable {
                    reason: err.0,
                })
            }
        };
        self.tx.engagement_id = Some(engagement_id);
        info!(engagement_id, tx = %tx_ref, "engagement created on-chain");
        self.mirror.publish_created(self.mirror_record(engagement_id, tx_ref));
        self.advance(EscrowState::FundingEscrow)
    }

    async fn fund(&mut self) -> Result<(), EscrowError> {
        let Some(engagement_id) = self.tx.engagement_id else {
            return Err(EscrowError::IllegalTransition {
                from: self.tx.state,
                to: EscrowState::Complete,
            });
        };
        let fund_tx_ref = match self.tx.fund_tx_ref.clone() {
            Some(existing) => existing,
            None => {
                let chain = Arc::clone(&self.chain);
                let amount = self.tx.params.amount;
                match submit_with_retry(&self.policy, Step::Fund, || {
                    chain.submit_fund(engagement_id, amount)
                })
                .await
                {
                    Ok(tx_ref) => {
                        info!(engagement_id, tx = %tx_ref, "fund transaction submitted");
                        self.tx.fund_tx_ref = Some(tx_ref.clone());
                        tx_ref
                    }
                    Err(SubmitError::Refused(err)) => {
                        return self.fail(EscrowFailure::SubmissionFailed {
                            step: Step::Fund,
                            reason: err.to_string(),
                        })
                    }
                    Err(SubmitError::Unanswered { waited_secs }) => {
                        return self.fail(EscrowFailure::ConfirmationTimeout {
                            step: Step::Fund,
                            tx_ref: None,
                            waited_secs,
                        })
                    }
                }
            }
        };
        if let Err(failure) = self.await_confirmation(Step::Fund, &fund_tx_ref).await {
            return self.fail(failure);
        }
        self.advance(EscrowState::Complete)?;
        self.mirror.publish_funded(engagement_id, fund_tx_ref);
        Ok(())
    }

    async fn await_confirmation(&self, step: Step, tx_ref: &TxRef) -> Result<Value, EscrowFailure> {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let timed_out = || EscrowFailure::ConfirmationTimeout {
            step,
            tx_ref: Some(tx_ref.clone()),
            waited_secs: started.elapsed().as_secs(),
        };
        let mut polls = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            polls += 1;
            match time::timeout(remaining, self.chain.transaction_status(tx_ref)).await {
                Ok(Ok(TxStatus::Success { payload })) => {
                    debug!(%step, tx = %tx_ref, polls, "confirmed");
                    return Ok(payload);
                }
                Ok(Ok(TxStatus::Aborted { reason })) => {
                    warn!(%step, tx = %tx_ref, %reason, "transaction aborted on-chain");
                    return Err(EscrowFailure::TransactionRejected { step, reason });
                }
                Ok(Ok(TxStatus::Pending)) => debug!(%step, tx = %tx_ref, polls, "still pending"),
                Ok(Err(err)) => debug!(%step, tx = %tx_ref, %err, "status poll failed, retrying"),
                Err(_) => return Err(timed_out()),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            time::sleep(self.policy.interval.min(remaining)).await;
        }
    }

    fn mirror_record(&self, engagement_id: EngagementId, create_tx_ref: TxRef) -> ContractMirrorRecord {
        let params = &self.tx.params;
        ContractMirrorRecord {
            engagement_id,
            client: params.client.clone(),
            talent: params.talent.clone(),
            scout: params.scout.clone(),
            scout_fee_percent: params.scout_fee_percent,
            amount: params.amount,
            create_tx_ref,
            fund_tx_ref: None,
            status: MirrorStatus::Created,
            recorded_at: now_unix(),
        }
    }

    fn advance(&mut self, next: EscrowState) -> Result<(), EscrowError> {
        let from = self.tx.state;
        self.tx.enter(next)?;
        info!(?from, to = ?next, "escrow transition");
        self.emit(from, None);
        Ok(())
    }

    fn fail(&mut self, failure: EscrowFailure) -> Result<(), EscrowError> {
        let from = self.tx.state;
        let reason = failure.to_string();
        self.tx.failure = Some(failure);
        self.tx.enter(EscrowState::Failed)?;
        warn!(?from, %reason, "escrow flow failed");
        self.emit(from, Some(reason));
        Ok(())
    }

    fn emit(&self, from: EscrowState, reason: Option<String>) {
        if let Some(events) = &self.events {
            // receiver gone just means nobody is watching
            let _ = events.send(EscrowTransition {
                from,
                to: self.tx.state,
                create_tx_ref: self.tx.create_tx_ref.clone(),
                engagement_id: self.tx.engagement_id,
                fund_tx_ref: self.tx.fund_tx_ref.clone(),
                reason,
            });
        }
    }
}

enum SubmitError {
    Refused(ChainError),
    /// Transport kept failing until the budget ran out; the transaction may
    /// or may not have been accepted.
    Unanswered { waited_secs: u64 },
}

async fn submit_with_retry<F, Fut>(
    policy: &PollPolicy,
    step: Step,
    mut submit: F,
) -> Result<TxRef, SubmitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TxRef, ChainError>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempt = 0u32;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(%step, attempt, "submission unanswered within the confirmation budget");
            return Err(SubmitError::Unanswered {
                waited_secs: started.elapsed().as_secs(),
            });
        }
        attempt += 1;
        match time::timeout(remaining, submit()).await {
            Ok(Ok(tx_ref)) => return Ok(tx_ref),
            Ok(Err(err)) if !err.is_transient() => return Err(SubmitError::Refused(err)),
            Ok(Err(err)) => debug!(%step, %err, attempt, "submission failed in transport, retrying"),
            Err(_) => debug!(%step, attempt, "submission timed out"),
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        time::sleep(policy.interval.min(remaining)).await;
    }
}

pub struct EscrowFlow<C> {
    pub transitions: UnboundedReceiverStream<EscrowTransition>,
    handle: JoinHandle<(EscrowOrchestrator<C>, Result<EscrowTransaction, EscrowError>)>,
}

impl<C: EscrowChain + 'static> EscrowFlow<C> {
    pub async fn finish(self) -> Result<(EscrowOrchestrator<C>, EscrowTransaction), EscrowError> {
        let (orchestrator, result) = self
            .handle
            .await
            .map_err(|err| EscrowError::TaskFailed(err.to_string()))?;
        Ok((orchestrator, result?))
    }
}
