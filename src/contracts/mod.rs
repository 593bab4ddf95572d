use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    chain::{Amount, EngagementId, TxRef},
    identity::{Address, Timestamp},
    store::{Inserted, MirrorStore, StoreError},
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStatus {
    Created,
    Funded,
}

impl MirrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorStatus::Created => "created",
            MirrorStatus::Funded => "funded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(MirrorStatus::Created),
            "funded" => Some(MirrorStatus::Funded),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractMirrorRecord {
    pub engagement_id: EngagementId,
    pub client: Address,
    pub talent: Address,
    pub scout: Option<Address>,
    pub scout_fee_percent: Option<u8>,
    pub amount: Amount,
    pub create_tx_ref: TxRef,
    pub fund_tx_ref: Option<TxRef>,
    pub status: MirrorStatus,
    pub recorded_at: Timestamp,
}

impl ContractMirrorRecord {
    pub fn merge(&mut self, patch: &MirrorPatch) {
        if let Some(fund_tx_ref) = &patch.fund_tx_ref {
            self.fund_tx_ref = Some(fund_tx_ref.clone());
        }
        if let Some(status) = patch.status {
            self.status = self.status.max(status);
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorPatch {
    pub fund_tx_ref: Option<TxRef>,
    pub status: Option<MirrorStatus>,
}

impl MirrorPatch {
    pub fn funded(fund_tx_ref: TxRef) -> Self {
        Self {
            fund_tx_ref: Some(fund_tx_ref),
            status: Some(MirrorStatus::Funded),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fund_tx_ref.is_none() && self.status.is_none()
    }

    pub fn absorb(&mut self, later: &MirrorPatch) {
        if later.fund_tx_ref.is_some() {
            self.fund_tx_ref = later.fund_tx_ref.clone();
        }
        self.status = match (self.status, later.status) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror record for engagement {0} already exists")]
    Conflict(EngagementId),
    #[error("no mirror record for engagement {0}")]
    NotFound(EngagementId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PendingWrite {
    record: Option<ContractMirrorRecord>,
    patch: MirrorPatch,
}

#[derive(Debug, Default)]
pub struct MirrorBacklog {
    entries: Mutex<BTreeMap<EngagementId, PendingWrite>>,
}

impl MirrorBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<EngagementId, PendingWrite>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn defer_full(&self, record: ContractMirrorRecord) {
        let id = record.engagement_id;
        self.entries().entry(id).or_default().record = Some(record);
    }

    fn defer_patch(&self, engagement_id: EngagementId, patch: &MirrorPatch) {
        self.entries()
            .entry(engagement_id)
            .or_default()
            .patch
            .absorb(patch);
    }

    pub fn pending(&self) -> Vec<EngagementId> {
        self.entries().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub replayed: usize,
    pub still_pending: usize,
}

#[derive(Clone)]
pub struct ContractMirror {
    store: Arc<dyn MirrorStore>,
    backlog: Arc<MirrorBacklog>,
}

impl ContractMirror {
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self {
            store,
            backlog: Arc::new(MirrorBacklog::new()),
        }
    }

    pub fn backlog(&self) -> &MirrorBacklog {
        &self.backlog
    }

    pub fn apply_full(
        &self,
        record: &ContractMirrorRecord,
    ) -> Result<ContractMirrorRecord, MirrorError> {
        match self.store.insert_mirror(record)? {
            Inserted::New(stored) => Ok(stored),
            Inserted::Existing(_) => Err(MirrorError::Conflict(record.engagement_id)),
        }
    }

    pub fn apply_partial(
        &self,
        engagement_id: EngagementId,
        patch: &MirrorPatch,
    ) -> Result<ContractMirrorRecord, MirrorError> {
        self.store
            .patch_mirror(engagement_id, patch)?
            .ok_or(MirrorError::NotFound(engagement_id))
    }

    pub fn record(
        &self,
        engagement_id: EngagementId,
    ) -> Result<Option<ContractMirrorRecord>, MirrorError> {
        Ok(self.store.mirror(engagement_id)?)
    }

    pub(crate) fn publish_created(&self, record: ContractMirrorRecord) {
        match self.apply_full(&record) {
            Ok(_) => info!(engagement_id = record.engagement_id, "mirror row created"),
            Err(MirrorError::Conflict(id)) => {
                debug!(engagement_id = id, "mirror row already present")
            }
            Err(err) => {
                warn!(engagement_id = record.engagement_id, %err, "mirror create deferred");
                self.backlog.defer_full(record);
            }
        }
    }

    pub(crate) fn publish_funded(&self, engagement_id: EngagementId, fund_tx_ref: TxRef) {
        let patch = MirrorPatch::funded(fund_tx_ref);
        if !self.backlog.pending().contains(&engagement_id) {
            match self.apply_partial(engagement_id, &patch) {
                Ok(_) => {
                    info!(engagement_id, "mirror row marked funded");
                    return;
                }
                Err(err) => warn!(engagement_id, %err, "mirror update deferred"),
            }
        }
        self.backlog.defer_patch(engagement_id, &patch);
    }

    pub fn reconcile(&self) -> ReconcileReport {
        let snapshot: Vec<(EngagementId, PendingWrite)> = self
            .backlog
            .entries()
            .iter()
            .map(|(id, write)| (*id, write.clone()))
            .collect();
        let mut report = ReconcileReport::default();
        for (id, write) in snapshot {
            match self.replay(id, &write) {
                Ok(()) => {
                    let mut entries = self.backlog.entries();
                    if entries.get(&id) == Some(&write) {
                        entries.remove(&id);
                    }
                    report.replayed += 1;
                }
                Err(err) => warn!(engagement_id = id, %err, "mirror replay failed"),
            }
        }
        report.still_pending = self.backlog.entries().len();
        report
    }

    fn replay(&self, engagement_id: EngagementId, write: &PendingWrite) -> Result<(), MirrorError> {
        if let Some(record) = &write.record {
            match self.apply_full(record) {
                Ok(_) | Err(MirrorError::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if !write.patch.is_empty() {
            self.apply_partial(engagement_id, &write.patch)?;
        }
        Ok(())
    }
}
