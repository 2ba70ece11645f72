// Battle orchestrator: drives the seven-stage pipeline end to end.
//
// Stages run strictly in sequence; each stage's prompt depends on the
// previous stage's output, and the live feed's value is watching the
// pipeline progress. The completion calls are the only await points.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::db::{Database, NewBattle};
use crate::llm::{CompletionError, CompletionProvider, CompletionRequest, ModelClass};
use crate::metrics;
use crate::prompts;
use crate::streaming::{BattleStage, EventSink, StageEvent};

/// Which side of the battle a judgment picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::A => "A",
            Side::B => "B",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCritique {
    pub strengths: String,
    pub weaknesses: String,
}

/// Per-agent strengths/weaknesses produced by the critic stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Critique {
    pub a: AgentCritique,
    pub b: AgentCritique,
}

impl Critique {
    /// Sentinel substituted when the critic output fails to parse.
    pub fn parse_error() -> Self {
        let sentinel = AgentCritique {
            strengths: "Parse error".to_string(),
            weaknesses: "Parse error".to_string(),
        };
        Self {
            a: sentinel.clone(),
            b: sentinel,
        }
    }
}

/// Final verdict from the judge stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub winner: Side,
    pub score_a: i64,
    pub score_b: i64,
    pub reason: String,
}

impl Judgment {
    /// Sentinel substituted when the judge output fails to parse.
    pub fn defaulted() -> Self {
        Self {
            winner: Side::A,
            score_a: 50,
            score_b: 50,
            reason: "Parse error - defaulted".to_string(),
        }
    }

    /// Clamp scores into [0, 100]. A judgment that parsed but wandered out
    /// of range keeps its winner and reason.
    pub fn clamp_scores(mut self) -> Self {
        self.score_a = self.score_a.clamp(0, 100);
        self.score_b = self.score_b.clamp(0, 100);
        self
    }
}

/// One agent's submission through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSubmission {
    pub name: String,
    pub code: String,
    pub refined: String,
}

/// The assembled outcome of one battle. Immutable once judging completes;
/// the sole unit handed to persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleResult {
    pub prompt: String,
    pub agent_a: AgentSubmission,
    pub agent_b: AgentSubmission,
    pub critique: Critique,
    /// Raw critic output, streamed and stored even when unparseable.
    pub critique_raw: String,
    pub judgment: Judgment,
}

impl BattleResult {
    pub fn winner_name(&self) -> &str {
        match self.judgment.winner {
            Side::A => &self.agent_a.name,
            Side::B => &self.agent_b.name,
        }
    }
}

/// Outcome of lenient model-JSON parsing: either the structured value, or
/// the raw text that refused to parse (the caller substitutes a sentinel).
#[derive(Debug, Clone, PartialEq)]
pub enum ModelJson<T> {
    Parsed(T),
    Fallback(String),
}

impl<T: DeserializeOwned> ModelJson<T> {
    /// Best-effort parse. Markdown code fences are stripped first since
    /// models wrap JSON in them despite instructions.
    pub fn parse(raw: &str) -> Self {
        let cleaned = strip_code_fences(raw);
        match serde_json::from_str::<T>(cleaned) {
            Ok(value) => ModelJson::Parsed(value),
            Err(_) => ModelJson::Fallback(raw.to_string()),
        }
    }
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line (which may carry a language tag) and the closing fence.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[derive(Debug, Error)]
pub enum BattleError {
    #[error("completion failed during {stage}: {source}")]
    Completion {
        stage: &'static str,
        #[source]
        source: CompletionError,
    },
}

/// The orchestrator. Owns the completion provider seam and the persistence
/// façade; one `run_battle` call owns its BattleResult for the request's
/// lifetime.
pub struct Arena {
    provider: Arc<dyn CompletionProvider>,
    db: Arc<Database>,
}

impl Arena {
    pub fn new(provider: Arc<dyn CompletionProvider>, db: Arc<Database>) -> Self {
        Self { provider, db }
    }

    /// Run the full pipeline, emitting stage events into `sink` as it goes.
    ///
    /// Fails only on an unrecoverable completion error (after emitting a
    /// terminal `error` event). Persistence failures are logged and
    /// swallowed; the in-memory result is still returned.
    pub async fn run_battle(
        &self,
        prompt: &str,
        mut sink: EventSink,
    ) -> Result<BattleResult, BattleError> {
        metrics::BATTLES_STARTED_TOTAL.inc();
        let timer = metrics::BATTLE_DURATION_SECONDS.start_timer();

        let result = self.run_pipeline(prompt, &mut sink).await;
        drop(timer);

        match &result {
            Ok(battle) => {
                metrics::BATTLES_COMPLETED_TOTAL.inc();
                self.persist(battle).await;
            }
            Err(e) => {
                metrics::BATTLES_ERRORED_TOTAL.inc();
                tracing::error!("Battle aborted: {e}");
                sink.send(StageEvent::with_data(
                    BattleStage::Error,
                    format!("Battle failed: {e}"),
                ))
                .await;
            }
        }
        result
    }

    async fn run_pipeline(
        &self,
        prompt: &str,
        sink: &mut EventSink,
    ) -> Result<BattleResult, BattleError> {
        let (name_a, name_b) = prompts::random_agent_pair();

        sink.send(StageEvent::with_data(
            BattleStage::Entering,
            format!("{name_a} vs {name_b}"),
        ))
        .await;

        let code_a = self
            .generate_stage(sink, BattleStage::GeneratingA, prompt, name_a)
            .await?;
        let code_b = self
            .generate_stage(sink, BattleStage::GeneratingB, prompt, name_b)
            .await?;

        let refined_a = self
            .refine_stage(sink, BattleStage::RefiningA, &code_a, name_a)
            .await?;
        let refined_b = self
            .refine_stage(sink, BattleStage::RefiningB, &code_b, name_b)
            .await?;

        // Critique: economy model, lenient parse with sentinel fallback. The
        // raw text is streamed and stored regardless of parse outcome.
        sink.send(StageEvent::new(BattleStage::Critique)).await;
        let critique_raw = self
            .complete(
                "critique",
                CompletionRequest::new(
                    ModelClass::Economy,
                    prompts::CRITIC_SYSTEM,
                    prompts::critic_prompt(&refined_a, &refined_b),
                ),
            )
            .await?;
        let critique = match ModelJson::<Critique>::parse(&critique_raw) {
            ModelJson::Parsed(c) => c,
            ModelJson::Fallback(_) => {
                metrics::PARSE_FALLBACKS_TOTAL
                    .with_label_values(&["critique"])
                    .inc();
                tracing::warn!("Critique did not parse, substituting sentinel");
                Critique::parse_error()
            }
        };
        sink.send(StageEvent::with_data(BattleStage::Critique, critique_raw.clone()))
            .await;

        // Judging: economy model at reduced temperature for format compliance.
        sink.send(StageEvent::new(BattleStage::Judging)).await;
        let judgment_raw = self
            .complete(
                "judging",
                CompletionRequest::new(
                    ModelClass::Economy,
                    prompts::JUDGE_SYSTEM,
                    prompts::judge_prompt(&refined_a, &refined_b, &critique_raw),
                )
                .with_temperature(0.3),
            )
            .await?;
        let judgment = match ModelJson::<Judgment>::parse(&judgment_raw) {
            ModelJson::Parsed(j) => j.clamp_scores(),
            ModelJson::Fallback(_) => {
                metrics::PARSE_FALLBACKS_TOTAL
                    .with_label_values(&["judging"])
                    .inc();
                tracing::warn!("Judgment did not parse, substituting default");
                Judgment::defaulted()
            }
        };
        sink.send(StageEvent::with_data(BattleStage::Judging, judgment_raw))
            .await;

        let result = BattleResult {
            prompt: prompt.to_string(),
            agent_a: AgentSubmission {
                name: name_a.to_string(),
                code: code_a,
                refined: refined_a,
            },
            agent_b: AgentSubmission {
                name: name_b.to_string(),
                code: code_b,
                refined: refined_b,
            },
            critique,
            critique_raw,
            judgment,
        };

        sink.send(StageEvent::with_data(
            BattleStage::Winner,
            result.winner_name(),
        ))
        .await;

        Ok(result)
    }

    async fn generate_stage(
        &self,
        sink: &mut EventSink,
        stage: BattleStage,
        prompt: &str,
        agent_name: &str,
    ) -> Result<String, BattleError> {
        sink.send(StageEvent::new(stage).with_agent(agent_name)).await;
        let code = self
            .complete(
                "generate",
                CompletionRequest::new(
                    ModelClass::Premium,
                    prompts::GENERATOR_SYSTEM,
                    prompts::generator_prompt(prompt, agent_name),
                ),
            )
            .await?;
        sink.send(StageEvent::with_data(stage, code.clone()).with_agent(agent_name))
            .await;
        Ok(code)
    }

    async fn refine_stage(
        &self,
        sink: &mut EventSink,
        stage: BattleStage,
        code: &str,
        agent_name: &str,
    ) -> Result<String, BattleError> {
        sink.send(StageEvent::new(stage).with_agent(agent_name)).await;
        let refined = self
            .complete(
                "refine",
                CompletionRequest::new(
                    ModelClass::Premium,
                    prompts::REFINER_SYSTEM,
                    prompts::refiner_prompt(code),
                ),
            )
            .await?;
        sink.send(StageEvent::with_data(stage, refined.clone()).with_agent(agent_name))
            .await;
        Ok(refined)
    }

    async fn complete(
        &self,
        stage: &'static str,
        req: CompletionRequest,
    ) -> Result<String, BattleError> {
        self.provider
            .complete(&req)
            .await
            .map_err(|source| BattleError::Completion { stage, source })
    }

    /// Store the battle record and fold both agents into the leaderboard.
    /// Non-fatal: the caller still gets the in-memory result.
    async fn persist(&self, battle: &BattleResult) {
        let record = NewBattle {
            prompt: battle.prompt.clone(),
            agent_a_name: battle.agent_a.name.clone(),
            agent_b_name: battle.agent_b.name.clone(),
            agent_a_code: battle.agent_a.code.clone(),
            agent_b_code: battle.agent_b.code.clone(),
            agent_a_refined: battle.agent_a.refined.clone(),
            agent_b_refined: battle.agent_b.refined.clone(),
            critique: battle.critique_raw.clone(),
            winner: battle.judgment.winner.as_str().to_string(),
            score_a: battle.judgment.score_a,
            score_b: battle.judgment.score_b,
            score_reason: battle.judgment.reason.clone(),
        };

        if let Err(e) = self.db.insert_battle(&record).await {
            tracing::error!("Failed to store battle: {e}");
        }

        let (won_a, won_b) = match battle.judgment.winner {
            Side::A => (true, false),
            Side::B => (false, true),
        };
        if let Err(e) = self
            .db
            .update_agent_aggregate(&battle.agent_a.name, won_a, battle.judgment.score_a as f64)
            .await
        {
            tracing::error!("Failed to update aggregate for {}: {e}", battle.agent_a.name);
        }
        if let Err(e) = self
            .db
            .update_agent_aggregate(&battle.agent_b.name, won_b, battle.judgment.score_b as f64)
            .await
        {
            tracing::error!("Failed to update aggregate for {}: {e}", battle.agent_b.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_json_parses_strict_judgment() {
        let raw = r#"{"winner":"B","score_a":70,"score_b":85,"reason":"B handles edge cases"}"#;
        match ModelJson::<Judgment>::parse(raw) {
            ModelJson::Parsed(j) => {
                assert_eq!(j.winner, Side::B);
                assert_eq!(j.score_b, 85);
            }
            ModelJson::Fallback(_) => panic!("expected parse"),
        }
    }

    #[test]
    fn test_model_json_strips_code_fences() {
        let raw = "```json\n{\"winner\":\"A\",\"score_a\":90,\"score_b\":60,\"reason\":\"ok\"}\n```";
        assert!(matches!(
            ModelJson::<Judgment>::parse(raw),
            ModelJson::Parsed(_)
        ));
    }

    #[test]
    fn test_model_json_falls_back_on_truncated_json() {
        let raw = r#"{"winner":"A","score_a":90"#;
        match ModelJson::<Judgment>::parse(raw) {
            ModelJson::Fallback(text) => assert_eq!(text, raw),
            ModelJson::Parsed(_) => panic!("expected fallback"),
        }
    }

    #[test]
    fn test_model_json_falls_back_on_prose() {
        let raw = "I think agent A did a better job overall.";
        assert!(matches!(
            ModelJson::<Critique>::parse(raw),
            ModelJson::Fallback(_)
        ));
    }

    #[test]
    fn test_judgment_sentinel() {
        let j = Judgment::defaulted();
        assert_eq!(j.winner, Side::A);
        assert_eq!((j.score_a, j.score_b), (50, 50));
        assert_eq!(j.reason, "Parse error - defaulted");
    }

    #[test]
    fn test_critique_sentinel() {
        let c = Critique::parse_error();
        assert_eq!(c.a.strengths, "Parse error");
        assert_eq!(c.b.weaknesses, "Parse error");
    }

    #[test]
    fn test_clamp_scores() {
        let j = Judgment {
            winner: Side::B,
            score_a: -5,
            score_b: 140,
            reason: "exuberant judge".to_string(),
        }
        .clamp_scores();
        assert_eq!(j.score_a, 0);
        assert_eq!(j.score_b, 100);
        assert_eq!(j.winner, Side::B);
    }

    #[test]
    fn test_winner_name_follows_judgment_side() {
        let submission = |name: &str| AgentSubmission {
            name: name.to_string(),
            code: String::new(),
            refined: String::new(),
        };
        let mut result = BattleResult {
            prompt: "p".to_string(),
            agent_a: submission("Nova"),
            agent_b: submission("Blaze"),
            critique: Critique::parse_error(),
            critique_raw: String::new(),
            judgment: Judgment::defaulted(),
        };
        assert_eq!(result.winner_name(), "Nova");
        result.judgment.winner = Side::B;
        assert_eq!(result.winner_name(), "Blaze");
    }
}
