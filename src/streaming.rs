// Stage event protocol: wire types, SSE framing, and the event sink the
// orchestrator writes into while a battle runs.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::metrics;

/// One discrete step of the battle pipeline, in pipeline order.
/// `Error` is terminal-only: it is emitted when an upstream completion
/// failure aborts the battle and never appears in a successful stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStage {
    Entering,
    GeneratingA,
    GeneratingB,
    RefiningA,
    RefiningB,
    Critique,
    Judging,
    Winner,
    Error,
}

impl BattleStage {
    /// Position in the fixed pipeline order. Events for a stage are never
    /// emitted after any event of a later stage.
    pub fn order_index(self) -> usize {
        match self {
            BattleStage::Entering => 0,
            BattleStage::GeneratingA => 1,
            BattleStage::GeneratingB => 2,
            BattleStage::RefiningA => 3,
            BattleStage::RefiningB => 4,
            BattleStage::Critique => 5,
            BattleStage::Judging => 6,
            BattleStage::Winner => 7,
            BattleStage::Error => 8,
        }
    }
}

/// A single checkpoint emitted to the client stream.
///
/// A stage may appear twice: once without `data` (stage started) and once
/// with the produced payload (stage completed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: BattleStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "agentName", skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

impl StageEvent {
    pub fn new(stage: BattleStage) -> Self {
        Self {
            stage,
            data: None,
            agent_name: None,
        }
    }

    pub fn with_data(stage: BattleStage, data: impl Into<String>) -> Self {
        Self {
            stage,
            data: Some(data.into()),
            agent_name: None,
        }
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }
}

/// Encode a stage event as one SSE frame: `data: <json>\n\n`.
pub fn encode_sse(event: &StageEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

/// Write side of a battle's event stream.
///
/// Wraps an mpsc sender whose receiver is drained into the HTTP response
/// body. If a send fails the client is gone; the sink goes quiet so the
/// pipeline can keep running (the leaderboard entry is still worth
/// producing), and no further sends are attempted.
pub struct EventSink {
    tx: Option<mpsc::Sender<StageEvent>>,
    client_gone: bool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StageEvent>) -> Self {
        Self {
            tx: Some(tx),
            client_gone: false,
        }
    }

    /// A sink that discards everything. Used when a battle is run without a
    /// listening client (tests, backfills).
    pub fn disabled() -> Self {
        Self {
            tx: None,
            client_gone: false,
        }
    }

    /// Send one event. Best-effort: a dropped receiver silences the sink.
    pub async fn send(&mut self, event: StageEvent) {
        if self.client_gone {
            return;
        }
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).await.is_err() {
            tracing::warn!("Client disconnected mid-battle, suppressing further stage events");
            self.client_gone = true;
        } else {
            metrics::STAGE_EVENTS_SENT_TOTAL.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sse_framing() {
        let event = StageEvent::with_data(BattleStage::Entering, "Nova vs Blaze");
        let frame = encode_sse(&event);
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        assert_eq!(
            frame,
            "data: {\"stage\":\"entering\",\"data\":\"Nova vs Blaze\"}\n\n"
        );
    }

    #[test]
    fn test_encode_omits_absent_fields() {
        let event = StageEvent::new(BattleStage::Judging);
        let frame = encode_sse(&event);
        assert_eq!(frame, "data: {\"stage\":\"judging\"}\n\n");
    }

    #[test]
    fn test_stage_names_are_snake_case() {
        let event = StageEvent::new(BattleStage::GeneratingA).with_agent("Nova");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"generating_a\""));
        assert!(json.contains("\"agentName\":\"Nova\""));
    }

    #[test]
    fn test_stage_order_is_strictly_increasing() {
        let stages = [
            BattleStage::Entering,
            BattleStage::GeneratingA,
            BattleStage::GeneratingB,
            BattleStage::RefiningA,
            BattleStage::RefiningB,
            BattleStage::Critique,
            BattleStage::Judging,
            BattleStage::Winner,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].order_index() < pair[1].order_index());
        }
    }

    #[tokio::test]
    async fn test_sink_goes_quiet_after_receiver_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut sink = EventSink::new(tx);
        sink.send(StageEvent::new(BattleStage::Entering)).await;
        drop(rx);
        // Both of these must be no-ops, not hangs or panics.
        sink.send(StageEvent::new(BattleStage::GeneratingA)).await;
        sink.send(StageEvent::new(BattleStage::GeneratingB)).await;
        assert!(sink.client_gone);
    }

    #[tokio::test]
    async fn test_disabled_sink_discards() {
        let mut sink = EventSink::disabled();
        sink.send(StageEvent::new(BattleStage::Winner)).await;
        assert!(!sink.client_gone);
    }
}
