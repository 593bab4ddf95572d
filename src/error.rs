//! Outcome taxonomy returned by the [`Marketplace`](crate::market::Marketplace)
//! facade.
//!
//! Module errors stay precise; this enum is what callers branch on. Business
//! conditions (self-referral, cool-down, on-chain rejection, timeout) are
//! ordinary variants, never panics.

use serde::Serialize;

use crate::{
    chain::{EngagementId, TxRef},
    contracts::MirrorError,
    escrow::{EscrowError, EscrowFailure, Step},
    identity::{Address, IdentityError},
    ledger::AttributionError,
    rate_limit::RateLimitError,
    session::SessionError,
    store::StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("invalid attribution: {0}")]
    InvalidAttribution(String),
    #[error("invalid {role} address: {source}")]
    InvalidAddress {
        role: &'static str,
        #[source]
        source: IdentityError,
    },
    #[error("commission was changed recently, retry in {days_remaining} day(s)")]
    RateLimited { days_remaining: u64 },
    #[error("commission {percent}% outside 0..={max}%")]
    OutOfRange { percent: u8, max: u8 },
    #[error("unknown talent {0}")]
    UnknownTalent(Address),
    #[error("commission for {0} is being changed concurrently, try again")]
    Contended(Address),
    #[error("{step} transaction rejected: {reason}")]
    TransactionRejected { step: Step, reason: String },
    #[error(
        "{step} transaction {} unconfirmed after {waited_secs}s, check it later",
        .tx_ref.as_ref().map_or("(no reference)", TxRef::as_str)
    )]
    ConfirmationTimeout {
        step: Step,
        tx_ref: Option<TxRef>,
        waited_secs: u64,
    },
    #[error("confirmed create transaction has an unreadable result: {0}")]
    ConfirmationPayloadUnparseable(String),
    #[error("{step} submission failed: {reason}")]
    SubmissionFailed { step: Step, reason: String },
    #[error("escrow flow cancelled")]
    Cancelled,
    #[error("mirror record for engagement {0} already exists")]
    MirrorConflict(EngagementId),
    #[error("no mirror record for engagement {0}")]
    MirrorNotFound(EngagementId),
    #[error(transparent)]
    Escrow(#[from] EscrowError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Failure {
    pub fn kind(&self) -> &'static str {
        match self {
            Failure::InvalidAttribution(_) => "invalid_attribution",
            Failure::InvalidAddress { .. } => "invalid_address",
            Failure::RateLimited { .. } => "rate_limited",
            Failure::OutOfRange { .. } => "out_of_range",
            Failure::UnknownTalent(_) => "unknown_talent",
            Failure::Contended(_) => "contended",
            Failure::TransactionRejected { .. } => "transaction_rejected",
            Failure::ConfirmationTimeout { .. } => "confirmation_timeout",
            Failure::ConfirmationPayloadUnparseable(_) => "confirmation_payload_unparseable",
            Failure::SubmissionFailed { .. } => "submission_failed",
            Failure::Cancelled => "cancelled",
            Failure::MirrorConflict(_) => "mirror_conflict",
            Failure::MirrorNotFound(_) => "mirror_not_found",
            Failure::Escrow(_) => "escrow_misuse",
            Failure::Session(_) => "session",
            Failure::Store(_) => "store",
        }
    }

    /// Whether repeating the same call unchanged can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Failure::Contended(_)
                | Failure::ConfirmationTimeout { .. }
                | Failure::SubmissionFailed { .. }
                | Failure::Store(StoreError::Sqlite(_))
        )
    }

    pub fn report(&self) -> FailureReport {
        FailureReport {
            kind: self.kind(),
            reason: self.to_string(),
            retryable: self.is_retryable(),
            days_remaining: match self {
                Failure::RateLimited { days_remaining } => Some(*days_remaining),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FailureReport {
    pub kind: &'static str,
    pub reason: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<u64>,
}

impl From<AttributionError> for Failure {
    fn from(err: AttributionError) -> Self {
        match err {
            AttributionError::SelfReferral => {
                Failure::InvalidAttribution("scout cannot refer themselves".into())
            }
            AttributionError::InvalidAddress { role, source } => {
                Failure::InvalidAddress { role, source }
            }
            AttributionError::UnknownTalent(talent) => Failure::UnknownTalent(talent),
            AttributionError::Store(err) => Failure::Store(err),
        }
    }
}

impl From<RateLimitError> for Failure {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::OutOfRange { percent, max } => Failure::OutOfRange { percent, max },
            RateLimitError::RateLimited { days_remaining } => {
                Failure::RateLimited { days_remaining }
            }
            RateLimitError::UnknownTalent(talent) => Failure::UnknownTalent(talent),
            RateLimitError::Contended(talent) => Failure::Contended(talent),
            RateLimitError::Store(err) => Failure::Store(err),
        }
    }
}

impl From<EscrowFailure> for Failure {
    fn from(failure: EscrowFailure) -> Self {
        match failure {
            EscrowFailure::SubmissionFailed { step, reason } => {
                Failure::SubmissionFailed { step, reason }
            }
            EscrowFailure::TransactionRejected { step, reason } => {
                Failure::TransactionRejected { step, reason }
            }
            EscrowFailure::ConfirmationTimeout {
                step,
                tx_ref,
                waited_secs,
            } => Failure::ConfirmationTimeout {
                step,
                tx_ref,
                waited_secs,
            },
            EscrowFailure::ConfirmationPayloadUnparseable { reason } => {
                Failure::ConfirmationPayloadUnparseable(reason)
            }
            EscrowFailure::Cancelled => Failure::Cancelled,
        }
    }
}

impl From<MirrorError> for Failure {
    fn from(err: MirrorError) -> Self {
        match err {
            MirrorError::Conflict(id) => Failure::MirrorConflict(id),
            MirrorError::NotFound(id) => Failure::MirrorNotFound(id),
            MirrorError::Store(err) => Failure::Store(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_errors_map_onto_the_taxonomy() {
        let self_referral: Failure = AttributionError::SelfReferral.into();
        assert_eq!(self_referral.kind(), "invalid_attribution");
        assert!(!self_referral.is_retryable());

        let limited: Failure = RateLimitError::RateLimited { days_remaining: 2 }.into();
        let report = limited.report();
        assert_eq!(report.kind, "rate_limited");
        assert_eq!(report.days_remaining, Some(2));

        let timeout: Failure = EscrowFailure::ConfirmationTimeout {
            step: Step::Create,
            tx_ref: Some(TxRef::from("0xc0")),
            waited_secs: 60,
        }
        .into();
        assert!(timeout.is_retryable());
        assert!(timeout.to_string().contains("0xc0"));

        let unanswered: Failure = EscrowFailure::ConfirmationTimeout {
            step: Step::Fund,
            tx_ref: None,
            waited_secs: 60,
        }
        .into();
        assert_eq!(unanswered.kind(), "confirmation_timeout");
        assert!(unanswered.to_string().contains("(no reference)"));

        let rejected: Failure = EscrowFailure::TransactionRejected {
            step: Step::Fund,
            reason: "E_LOCKED".into(),
        }
        .into();
        assert_eq!(rejected.kind(), "transaction_rejected");
        assert!(!rejected.is_retryable());

        assert!(matches!(
            Failure::from(MirrorError::NotFound(9)),
            Failure::MirrorNotFound(9)
        ));
    }

    #[test]
    fn report_omits_absent_fields() {
        let json = serde_json::to_value(Failure::Cancelled.report()).unwrap();
        assert_eq!(json["kind"], "cancelled");
        assert_eq!(json["retryable"], false);
        assert!(json.get("days_remaining").is_none());

        let contended = Failure::Contended(Address::parse("0x7a").unwrap()).report();
        assert!(contended.retryable);

        let overflow = Failure::from(StoreError::OutOfRange {
            column: "amount",
            value: u64::MAX,
        });
        assert_eq!(overflow.kind(), "store");
        assert!(!overflow.report().retryable);
    }
}
