//! Fire-and-forget notification seam.
//!
//! The engine emits events after placements, cycles, and credits; the
//! realtime/notification collaborator fans them out to users. Delivery
//! is never on the engine's critical path: emitters must not block and
//! must not fail the run. The default emitter writes structured log
//! lines, which is also what the standalone deployment ships.

use fmx_core::commission::CommissionCredit;
use fmx_core::cycle::CycleCompletion;
use fmx_core::position::{MatrixPosition, PositionId};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

/// Receives engine events. Implementations must be cheap and
/// infallible; anything slow belongs behind a channel.
pub trait NotificationEmitter: Send + Sync {
    /// A position was placed into a matrix.
    fn position_placed(&self, position: &MatrixPosition);

    /// A position's subtree filled and it cycled.
    fn cycle_completed(&self, level: u32, completion: &CycleCompletion);

    /// A commission credit was written to the ledger.
    fn bonus_awarded(&self, level: u32, credit: &CommissionCredit);
}

/// Default emitter: structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl NotificationEmitter for TracingEmitter {
    fn position_placed(&self, position: &MatrixPosition) {
        info!(
            event = "matrix_position_placed",
            position_id = %position.id,
            user_id = %position.user_id,
            level = position.level,
            slot_index = position.slot_index,
            parent = ?position.parent_position_id,
            "position placed"
        );
    }

    fn cycle_completed(&self, level: u32, completion: &CycleCompletion) {
        info!(
            event = "cycle_completed",
            position_id = %completion.position_id,
            owner = %completion.owner_user_id,
            level,
            payout = completion.payout,
            reenter = completion.reenter,
            "matrix cycled"
        );
    }

    fn bonus_awarded(&self, level: u32, credit: &CommissionCredit) {
        info!(
            event = "bonus_awarded",
            beneficiary = %credit.beneficiary,
            level,
            amount = credit.amount,
            kind = credit.kind.as_str(),
            depth = credit.depth,
            reference_id = %credit.reference_id,
            "bonus awarded"
        );
    }
}

/// An engine event as fanned out to realtime subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A position was placed.
    PositionPlaced {
        /// The new position.
        position_id: PositionId,
        /// Its owner.
        user_id: String,
        /// Target level.
        level: u32,
    },
    /// A position cycled.
    CycleCompleted {
        /// The completed position.
        position_id: PositionId,
        /// Its owner.
        user_id: String,
        /// Target level.
        level: u32,
        /// Cycle payout in minor units.
        payout: i64,
    },
    /// A commission landed in the ledger.
    BonusAwarded {
        /// Credited user.
        user_id: String,
        /// Target level.
        level: u32,
        /// Credit amount in minor units.
        amount: i64,
        /// `REFERRAL` or `CYCLE`.
        kind: String,
    },
}

/// Emitter that fans events out over a `tokio` broadcast channel for
/// the daemon's realtime side. Lagging or absent subscribers drop
/// events; the engine never blocks on delivery.
#[derive(Debug, Clone)]
pub struct BroadcastEmitter {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastEmitter {
    /// Creates an emitter with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// A new subscription to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        // A send error only means nobody is subscribed right now.
        let _ = self.tx.send(event);
    }
}

impl NotificationEmitter for BroadcastEmitter {
    fn position_placed(&self, position: &MatrixPosition) {
        self.emit(EngineEvent::PositionPlaced {
            position_id: position.id,
            user_id: position.user_id.clone(),
            level: position.level,
        });
    }

    fn cycle_completed(&self, level: u32, completion: &CycleCompletion) {
        self.emit(EngineEvent::CycleCompleted {
            position_id: completion.position_id,
            user_id: completion.owner_user_id.clone(),
            level,
            payout: completion.payout,
        });
    }

    fn bonus_awarded(&self, level: u32, credit: &CommissionCredit) {
        self.emit(EngineEvent::BonusAwarded {
            user_id: credit.beneficiary.clone(),
            level,
            amount: credit.amount,
            kind: credit.kind.as_str().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use fmx_core::commission::CommissionKind;

    use super::*;

    #[test]
    fn test_broadcast_emitter_fans_out() {
        let emitter = BroadcastEmitter::new(8);
        let mut rx = emitter.subscribe();

        let position = MatrixPosition::new_root("u1", "alice", 1, None, Utc::now());
        emitter.position_placed(&position);
        emitter.bonus_awarded(
            1,
            &CommissionCredit {
                beneficiary: "s1".to_string(),
                amount: 10,
                depth: 1,
                kind: CommissionKind::Referral,
                reference_id: "REFERRAL:p:s1".to_string(),
            },
        );

        match rx.try_recv().unwrap() {
            EngineEvent::PositionPlaced { user_id, level, .. } => {
                assert_eq!(user_id, "u1");
                assert_eq!(level, 1);
            },
            other => panic!("unexpected event {other:?}"),
        }
        match rx.try_recv().unwrap() {
            EngineEvent::BonusAwarded { amount, kind, .. } => {
                assert_eq!(amount, 10);
                assert_eq!(kind, "REFERRAL");
            },
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let emitter = BroadcastEmitter::new(4);
        let position = MatrixPosition::new_root("u1", "alice", 1, None, Utc::now());
        emitter.position_placed(&position);
    }
}
