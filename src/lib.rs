// AI code battle arena backend library.
//
// Two LLM coding agents each solve a user prompt; their solutions are
// refined, critiqued, and judged, with every stage streamed to the client
// over SSE and the final result persisted for the public leaderboard.

pub mod api;
pub mod arena;
pub mod config;
pub mod db;
pub mod entitlements;
pub mod llm;
pub mod metrics;
pub mod prompts;
pub mod rate_limit;
pub mod streaming;
