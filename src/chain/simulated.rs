use std::{collections::BTreeMap, sync::Mutex};

use serde_json::json;
use sha2::{Digest, Sha256};

use super::{Amount, ChainError, CreateEngagement, EngagementId, EscrowChain, TxRef, TxStatus};

/// In-process stand-in for the escrow contract.
///
/// Every submitted transaction reports `pending` for `confirm_after` polls and
/// then succeeds. Engagement ids are handed out sequentially from 1.
#[derive(Debug)]
pub struct SimulatedChain {
    confirm_after: u32,
    state: Mutex<SimState>,
}

#[derive(Debug, Default)]
struct SimState {
    nonce: u64,
    next_engagement: EngagementId,
    engagements: BTreeMap<EngagementId, SimEngagement>,
    txs: BTreeMap<TxRef, SimTx>,
}

#[derive(Debug)]
struct SimEngagement {
    amount: Amount,
    funded: bool,
}

#[derive(Debug)]
struct SimTx {
    polls_left: u32,
    outcome: TxStatus,
}

impl SimulatedChain {
    pub fn new(confirm_after: u32) -> Self {
        Self {
            confirm_after,
            state: Mutex::new(SimState {
                next_engagement: 1,
                ..SimState::default()
            }),
        }
    }

    /// Starts id assignment at `first` instead of 1, so runs sharing a
    /// mirror database do not reuse ids.
    pub fn with_first_engagement(self, first: EngagementId) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.next_engagement = first.max(1);
        }
        self
    }

    pub fn is_funded(&self, engagement_id: EngagementId) -> bool {
        self.state
            .lock()
            .map(|state| {
                state
                    .engagements
                    .get(&engagement_id)
                    .map(|e| e.funded)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimState>, ChainError> {
        self.state
            .lock()
            .map_err(|_| ChainError::Transport("simulator state poisoned".into()))
    }
}

impl SimState {
    fn next_tx_ref(&mut self, kind: &str) -> TxRef {
        self.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(b"sim-tx");
        hasher.update(kind.as_bytes());
        hasher.update(self.nonce.to_le_bytes());
        TxRef(format!("0x{}", hex::encode(hasher.finalize())))
    }
}

impl EscrowChain for SimulatedChain {
    async fn submit_create(&self, params: &CreateEngagement) -> Result<TxRef, ChainError> {
        if params.amount == 0 {
            return Err(ChainError::Refused("amount must be positive".into()));
        }
        let mut state = self.lock()?;
        let id = state.next_engagement;
        state.next_engagement += 1;
        state.engagements.insert(
            id,
            SimEngagement {
                amount: params.amount,
                funded: false,
            },
        );
        let tx = state.next_tx_ref("create");
        state.txs.insert(
            tx.clone(),
            SimTx {
                polls_left: self.confirm_after,
                outcome: TxStatus::Success {
                    payload: json!({
                        "events": [{
                            "type": "0x5c07::escrow::ProjectCreated",
                            "data": {"project_id": id.to_string()}
                        }]
                    }),
                },
            },
        );
        Ok(tx)
    }

    async fn submit_fund(
        &self,
        engagement_id: EngagementId,
        amount: Amount,
    ) -> Result<TxRef, ChainError> {
        let mut state = self.lock()?;
        let outcome = match state.engagements.get_mut(&engagement_id) {
            None => TxStatus::Aborted {
                reason: format!("E_PROJECT_NOT_FOUND({engagement_id})"),
            },
            Some(engagement) if engagement.funded => TxStatus::Aborted {
                reason: "E_ALREADY_FUNDED".into(),
            },
            Some(engagement) if engagement.amount != amount => TxStatus::Aborted {
                reason: "E_AMOUNT_MISMATCH".into(),
            },
            Some(engagement) => {
                engagement.funded = true;
                TxStatus::Success {
                    payload: json!({"events": [{"type": "0x5c07::escrow::EscrowFunded"}]}),
                }
            }
        };
        let tx = state.next_tx_ref("fund");
        state.txs.insert(
            tx.clone(),
            SimTx {
                polls_left: self.confirm_after,
                outcome,
            },
        );
        Ok(tx)
    }

    async fn transaction_status(&self, tx: &TxRef) -> Result<TxStatus, ChainError> {
        let mut state = self.lock()?;
        let Some(entry) = state.txs.get_mut(tx) else {
            // not indexed yet, as a node would answer
            return Ok(TxStatus::Pending);
        };
        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(TxStatus::Pending);
        }
        Ok(entry.outcome.clone())
    }
}
