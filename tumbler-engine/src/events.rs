//! Typed lifecycle notifications.
//!
//! Components publish transitions on a broadcast channel; interested parties
//! subscribe and receive without coupling the publisher to them.

use tokio::sync::broadcast;

use tumbler_types::amount::Amount;
use tumbler_types::coinjoin::CoinJoinPhase;
use tumbler_types::mix::MixStatus;
use tumbler_types::schedule::{OperationKind, OperationStatus};
use tumbler_types::{MixRequestId, OperationId, ParticipantId, SessionId};

/// Everything the engine announces to the outside.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MixStatusChanged {
        id: MixRequestId,
        from: MixStatus,
        to: MixStatus,
    },
    DepositObserved {
        id: MixRequestId,
        tx_hash: String,
        amount: Amount,
        confirmations: u32,
    },
    SignatureVerified {
        key_image: [u8; 32],
    },
    DoubleSpendRejected {
        key_image: [u8; 32],
    },
    SessionPhaseChanged {
        session: SessionId,
        from: CoinJoinPhase,
        to: CoinJoinPhase,
    },
    ParticipantBlamed {
        session: SessionId,
        participant: ParticipantId,
    },
    OutputTxSent {
        mix: MixRequestId,
        tx_hash: String,
    },
    OperationFinished {
        id: OperationId,
        kind: OperationKind,
        status: OperationStatus,
    },
}

/// Broadcast fan-out for [`EngineEvent`]s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::SignatureVerified { key_image: [1u8; 32] });
        match rx.recv().await.unwrap() {
            EngineEvent::SignatureVerified { key_image } => assert_eq!(key_image, [1u8; 32]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.emit(EngineEvent::DoubleSpendRejected { key_image: [0u8; 32] });
    }
}
