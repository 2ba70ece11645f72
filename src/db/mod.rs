// Database access layer (SQLite via sqlx).
//
// Battles are append-only; the leaderboard is a per-agent aggregate kept by
// read-modify-write; entitlements map access keys to tiers.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

/// A stored battle, one row per completed (or aborted-after-judging) run.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BattleRecord {
    pub id: String,
    pub prompt: String,
    pub agent_a_name: String,
    pub agent_b_name: String,
    pub agent_a_code: String,
    pub agent_b_code: String,
    pub agent_a_refined: String,
    pub agent_b_refined: String,
    /// Raw critique text as returned by the model, kept even when it failed
    /// to parse so the output can be audited.
    pub critique: String,
    /// "A" or "B".
    pub winner: String,
    pub score_a: i64,
    pub score_b: i64,
    pub score_reason: String,
    pub created_at: String,
}

/// Battle fields supplied by the orchestrator; id and timestamp are assigned
/// on insert.
#[derive(Debug, Clone)]
pub struct NewBattle {
    pub prompt: String,
    pub agent_a_name: String,
    pub agent_b_name: String,
    pub agent_a_code: String,
    pub agent_b_code: String,
    pub agent_a_refined: String,
    pub agent_b_refined: String,
    pub critique: String,
    pub winner: String,
    pub score_a: i64,
    pub score_b: i64,
    pub score_reason: String,
}

/// Trimmed battle row for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BattleSummary {
    pub id: String,
    pub prompt: String,
    pub agent_a_name: String,
    pub agent_b_name: String,
    pub winner: String,
    pub score_a: i64,
    pub score_b: i64,
    pub created_at: String,
}

/// Aggregate win/loss/average-score stats per agent display name.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaderboardEntry {
    pub agent_name: String,
    pub wins: i64,
    pub battles: i64,
    pub avg_score: f64,
}

/// A durable grant of a tier to an email, looked up by access key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entitlement {
    pub id: i64,
    pub email: String,
    pub tier: String,
    pub access_key: String,
    pub status: String,
    pub created_at: String,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS battles (
                id TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                agent_a_name TEXT NOT NULL,
                agent_b_name TEXT NOT NULL,
                agent_a_code TEXT NOT NULL DEFAULT '',
                agent_b_code TEXT NOT NULL DEFAULT '',
                agent_a_refined TEXT NOT NULL DEFAULT '',
                agent_b_refined TEXT NOT NULL DEFAULT '',
                critique TEXT NOT NULL DEFAULT '',
                winner TEXT NOT NULL,
                score_a INTEGER NOT NULL DEFAULT 0,
                score_b INTEGER NOT NULL DEFAULT 0,
                score_reason TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leaderboard (
                agent_name TEXT PRIMARY KEY,
                wins INTEGER NOT NULL DEFAULT 0,
                battles INTEGER NOT NULL DEFAULT 0,
                avg_score REAL NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entitlements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL,
                tier TEXT NOT NULL,
                access_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Battles ───────────────────────────────────────────────────────

    pub async fn insert_battle(&self, battle: &NewBattle) -> Result<BattleRecord, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        let row = sqlx::query_as::<_, BattleRecord>(
            r#"
            INSERT INTO battles (
                id, prompt, agent_a_name, agent_b_name,
                agent_a_code, agent_b_code, agent_a_refined, agent_b_refined,
                critique, winner, score_a, score_b, score_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, prompt, agent_a_name, agent_b_name,
                agent_a_code, agent_b_code, agent_a_refined, agent_b_refined,
                critique, winner, score_a, score_b, score_reason, created_at
            "#,
        )
        .bind(&id)
        .bind(&battle.prompt)
        .bind(&battle.agent_a_name)
        .bind(&battle.agent_b_name)
        .bind(&battle.agent_a_code)
        .bind(&battle.agent_b_code)
        .bind(&battle.agent_a_refined)
        .bind(&battle.agent_b_refined)
        .bind(&battle.critique)
        .bind(&battle.winner)
        .bind(battle.score_a)
        .bind(battle.score_b)
        .bind(&battle.score_reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_battle(&self, id: &str) -> Result<Option<BattleRecord>, sqlx::Error> {
        let row = sqlx::query_as::<_, BattleRecord>(
            r#"
            SELECT id, prompt, agent_a_name, agent_b_name,
                agent_a_code, agent_b_code, agent_a_refined, agent_b_refined,
                critique, winner, score_a, score_b, score_reason, created_at
            FROM battles WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_recent_battles(&self, limit: i64) -> Result<Vec<BattleSummary>, sqlx::Error> {
        let rows = sqlx::query_as::<_, BattleSummary>(
            r#"
            SELECT id, prompt, agent_a_name, agent_b_name, winner,
                score_a, score_b, created_at
            FROM battles ORDER BY created_at DESC, id LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ── Leaderboard ───────────────────────────────────────────────────

    pub async fn leaderboard(&self, limit: i64) -> Result<Vec<LeaderboardEntry>, sqlx::Error> {
        let rows = sqlx::query_as::<_, LeaderboardEntry>(
            r#"
            SELECT agent_name, wins, battles, avg_score
            FROM leaderboard ORDER BY wins DESC, avg_score DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Fold one battle into an agent's aggregate stats. The average is a
    /// running mean: new_avg = (old_avg * old_count + score) / (old_count + 1).
    pub async fn update_agent_aggregate(
        &self,
        agent_name: &str,
        won: bool,
        score: f64,
    ) -> Result<(), sqlx::Error> {
        let existing = sqlx::query_as::<_, LeaderboardEntry>(
            "SELECT agent_name, wins, battles, avg_score FROM leaderboard WHERE agent_name = ?",
        )
        .bind(agent_name)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(entry) => {
                let new_battles = entry.battles + 1;
                let new_wins = entry.wins + if won { 1 } else { 0 };
                let new_avg =
                    (entry.avg_score * entry.battles as f64 + score) / new_battles as f64;
                sqlx::query(
                    "UPDATE leaderboard SET wins = ?, battles = ?, avg_score = ? WHERE agent_name = ?",
                )
                .bind(new_wins)
                .bind(new_battles)
                .bind(new_avg)
                .bind(agent_name)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO leaderboard (agent_name, wins, battles, avg_score) VALUES (?, ?, 1, ?)",
                )
                .bind(agent_name)
                .bind(if won { 1 } else { 0 })
                .bind(score)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    // ── Entitlements ──────────────────────────────────────────────────

    /// Create an entitlement, or return the existing active one for the same
    /// (email, tier) pair. Emails are normalized to lowercase.
    pub async fn create_or_reuse_entitlement(
        &self,
        email: &str,
        tier: &str,
        access_key: &str,
    ) -> Result<Entitlement, sqlx::Error> {
        let email = email.to_lowercase();

        let existing = sqlx::query_as::<_, Entitlement>(
            r#"
            SELECT id, email, tier, access_key, status, created_at
            FROM entitlements WHERE email = ? AND tier = ? AND status = 'active'
            "#,
        )
        .bind(&email)
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(entitlement) = existing {
            return Ok(entitlement);
        }

        let row = sqlx::query_as::<_, Entitlement>(
            r#"
            INSERT INTO entitlements (email, tier, access_key) VALUES (?, ?, ?)
            RETURNING id, email, tier, access_key, status, created_at
            "#,
        )
        .bind(&email)
        .bind(tier)
        .bind(access_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Look up an active entitlement by its access key.
    pub async fn get_entitlement_by_access_key(
        &self,
        access_key: &str,
    ) -> Result<Option<Entitlement>, sqlx::Error> {
        let row = sqlx::query_as::<_, Entitlement>(
            r#"
            SELECT id, email, tier, access_key, status, created_at
            FROM entitlements WHERE access_key = ? AND status = 'active'
            "#,
        )
        .bind(access_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn set_entitlement_status(
        &self,
        access_key: &str,
        status: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE entitlements SET status = ?, updated_at = datetime('now') WHERE access_key = ?",
        )
        .bind(status)
        .bind(access_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        sqlx::any::install_default_drivers();
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn sample_battle() -> NewBattle {
        NewBattle {
            prompt: "Write a function that reverses a string".to_string(),
            agent_a_name: "Nova".to_string(),
            agent_b_name: "Blaze".to_string(),
            agent_a_code: "def r(s): return s[::-1]".to_string(),
            agent_b_code: "def rev(s): return ''.join(reversed(s))".to_string(),
            agent_a_refined: "def reverse(s): return s[::-1]".to_string(),
            agent_b_refined: "def reverse(s): return ''.join(reversed(s))".to_string(),
            critique: r#"{"a":{"strengths":"short","weaknesses":"none"}}"#.to_string(),
            winner: "A".to_string(),
            score_a: 88,
            score_b: 74,
            score_reason: "Cleaner slicing".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_battle() {
        let db = test_db().await;
        let stored = db.insert_battle(&sample_battle()).await.unwrap();
        assert!(!stored.id.is_empty());
        assert_eq!(stored.winner, "A");
        assert_eq!(stored.score_a, 88);

        let fetched = db.get_battle(&stored.id).await.unwrap().unwrap();
        assert_eq!(fetched.prompt, stored.prompt);
        assert_eq!(fetched.critique, stored.critique);
        assert!(db.get_battle("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_recent_battles() {
        let db = test_db().await;
        for _ in 0..3 {
            db.insert_battle(&sample_battle()).await.unwrap();
        }
        let battles = db.list_recent_battles(2).await.unwrap();
        assert_eq!(battles.len(), 2);
        assert_eq!(battles[0].agent_a_name, "Nova");
    }

    #[tokio::test]
    async fn test_aggregate_running_mean() {
        let db = test_db().await;
        db.update_agent_aggregate("Nova", true, 80.0).await.unwrap();
        db.update_agent_aggregate("Nova", false, 60.0).await.unwrap();

        let board = db.leaderboard(10).await.unwrap();
        assert_eq!(board.len(), 1);
        let nova = &board[0];
        assert_eq!(nova.wins, 1);
        assert_eq!(nova.battles, 2);
        assert!((nova.avg_score - 70.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_aggregate_order_independent_between_agents() {
        let db = test_db().await;
        // One battle: Nova wins 88, Blaze loses 74, updates in either order.
        db.update_agent_aggregate("Blaze", false, 74.0).await.unwrap();
        db.update_agent_aggregate("Nova", true, 88.0).await.unwrap();

        let board = db.leaderboard(10).await.unwrap();
        assert_eq!(board[0].agent_name, "Nova");
        assert_eq!(board[0].wins, 1);
        assert_eq!(board[1].agent_name, "Blaze");
        assert_eq!(board[1].wins, 0);
        assert_eq!(board[1].battles, 1);
    }

    #[tokio::test]
    async fn test_leaderboard_ordering() {
        let db = test_db().await;
        db.update_agent_aggregate("Apex", true, 90.0).await.unwrap();
        db.update_agent_aggregate("Apex", true, 92.0).await.unwrap();
        db.update_agent_aggregate("Vortex", true, 95.0).await.unwrap();
        db.update_agent_aggregate("Zenith", false, 99.0).await.unwrap();

        let board = db.leaderboard(10).await.unwrap();
        // Wins first, then avg score.
        assert_eq!(board[0].agent_name, "Apex");
        assert_eq!(board[1].agent_name, "Vortex");
        assert_eq!(board[2].agent_name, "Zenith");
    }

    #[tokio::test]
    async fn test_entitlement_create_reuse_and_status() {
        let db = test_db().await;
        let first = db
            .create_or_reuse_entitlement("User@Example.com", "pro", "arena_a")
            .await
            .unwrap();
        assert_eq!(first.email, "user@example.com");
        assert_eq!(first.status, "active");

        // Same (email, tier) reuses the existing record; the new key is ignored.
        let again = db
            .create_or_reuse_entitlement("user@example.com", "pro", "arena_b")
            .await
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.access_key, "arena_a");

        // A different tier for the same email is a separate grant.
        let builder = db
            .create_or_reuse_entitlement("user@example.com", "builder", "arena_c")
            .await
            .unwrap();
        assert_ne!(builder.id, first.id);

        assert!(db.set_entitlement_status("arena_a", "canceled").await.unwrap());
        assert!(db
            .get_entitlement_by_access_key("arena_a")
            .await
            .unwrap()
            .is_none());
        assert!(db
            .get_entitlement_by_access_key("arena_c")
            .await
            .unwrap()
            .is_some());
    }
}
