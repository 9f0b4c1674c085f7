//! Commission planning: referral cascades and cycle payouts.
//!
//! Planning is pure. The daemon executes a plan against the ledger
//! collaborator, guarding every credit with the `find_transaction`
//! idempotency check keyed by the deterministic [`reference_id`], so
//! replaying an already-handled entry produces zero new transactions.

use serde::{Deserialize, Serialize};

use crate::level::LevelConfig;
use crate::position::PositionId;

/// Kind of commission credit, part of the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommissionKind {
    /// Per-placement referral bonus paid up the sponsor chain.
    Referral,
    /// Flat cycle bonus paid to a completed position's owner.
    Cycle,
}

impl CommissionKind {
    /// Stable string form used in ledger references and persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Referral => "REFERRAL",
            Self::Cycle => "CYCLE",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REFERRAL" => Some(Self::Referral),
            "CYCLE" => Some(Self::Cycle),
            _ => None,
        }
    }
}

/// One planned credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommissionCredit {
    /// User to credit.
    pub beneficiary: String,
    /// Amount in minor units.
    pub amount: i64,
    /// Cascade depth that produced the credit (1 = direct sponsor,
    /// 0 = cycle payout to the owner).
    pub depth: u32,
    /// Credit kind.
    pub kind: CommissionKind,
    /// Deterministic ledger reference for at-most-once crediting.
    pub reference_id: String,
}

/// Deterministic ledger reference for a credit.
///
/// Keyed by `(position, beneficiary, kind)`: the same placement can
/// never pay the same ancestor twice for the same reason, across runs
/// and across crash-recovery replays.
#[must_use]
pub fn reference_id(position_id: PositionId, beneficiary: &str, kind: CommissionKind) -> String {
    format!("{}:{position_id}:{beneficiary}", kind.as_str())
}

/// Plans the referral cascade for one placement.
///
/// Walks `sponsor_chain` (nearest ancestor first) up to `max_depth`
/// ancestors, crediting `price x pct(depth)` at each. Zero-amount
/// credits (depth beyond the configured table, or rounding to zero)
/// are dropped from the plan.
#[must_use]
pub fn plan_referral_cascade(
    cfg: &LevelConfig,
    position_id: PositionId,
    sponsor_chain: &[String],
    max_depth: u32,
) -> Vec<CommissionCredit> {
    sponsor_chain
        .iter()
        .take(max_depth as usize)
        .enumerate()
        .filter_map(|(i, ancestor)| {
            let depth = i as u32 + 1;
            let amount = cfg.referral_payout(depth);
            (amount > 0).then(|| CommissionCredit {
                beneficiary: ancestor.clone(),
                amount,
                depth,
                kind: CommissionKind::Referral,
                reference_id: reference_id(position_id, ancestor, CommissionKind::Referral),
            })
        })
        .collect()
}

/// Plans the cycle payout for a completed position.
#[must_use]
pub fn plan_cycle_credit(
    cfg: &LevelConfig,
    position_id: PositionId,
    owner_user_id: &str,
) -> CommissionCredit {
    CommissionCredit {
        beneficiary: owner_user_id.to_string(),
        amount: cfg.cycle_payout(),
        depth: 0,
        kind: CommissionKind::Cycle,
        reference_id: reference_id(position_id, owner_user_id, CommissionKind::Cycle),
    }
}
