//! Audit journal of reconciliation cycles and broker actions.
//!
//! The journal is write-only from the engine's point of view: decisions are
//! always made from fresh broker snapshots, never from rows stored here.
//! Operators read it back through `sigcopier status`.

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

/// Connection pool for the journal. Cheap to clone and shared by all drivers.
#[derive(Clone)]
pub struct Journal {
    pool: SqlitePool,
}

/// One finished (or aborted) cycle of one account.
#[derive(Debug, Clone, Default)]
pub struct CycleRecord {
    pub id: String,
    pub login: u64,
    pub started_at: String,
    pub finished_at: String,
    pub pairs_ok: i64,
    pub pairs_failed: i64,
    pub signals: i64,
    pub invalid_signals: i64,
    pub creates: i64,
    pub updates: i64,
    pub closes: i64,
    pub ignored: i64,
    pub skipped: i64,
    pub failures: i64,
    /// Why the cycle was aborted, if it was
    pub error: Option<String>,
}

/// One broker request issued by a driver.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub cycle_id: String,
    pub login: u64,
    pub kind: String,
    pub tag: String,
    pub signal_id: Option<String>,
    pub ticket: Option<i64>,
    pub symbol: String,
    pub retcode: Option<i64>,
    pub comment: String,
    pub success: bool,
}

/// Stored action row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAction {
    pub id: i64,
    pub cycle_id: String,
    pub login: i64,
    pub kind: String,
    pub tag: String,
    pub signal_id: Option<String>,
    pub ticket: Option<i64>,
    pub symbol: String,
    pub retcode: Option<i64>,
    pub comment: String,
    pub success: bool,
    pub created_at: String,
}

/// Per-account totals for the status command.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountSummary {
    pub login: i64,
    pub cycles: i64,
    pub aborted_cycles: i64,
    pub creates: i64,
    pub updates: i64,
    pub closes: i64,
    pub failures: i64,
    pub last_cycle_at: Option<String>,
}

impl Journal {
    /// Open (or create) a journal database.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to journal database")?;

        let journal = Self { pool };
        journal.run_migrations().await?;

        Ok(journal)
    }

    /// Private in-memory journal, used by tests and `--once` rehearsals.
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory journal")?;

        let journal = Self { pool };
        journal.run_migrations().await?;

        Ok(journal)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cycles (
                id TEXT PRIMARY KEY,
                login INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                pairs_ok INTEGER NOT NULL DEFAULT 0,
                pairs_failed INTEGER NOT NULL DEFAULT 0,
                signals INTEGER NOT NULL DEFAULT 0,
                invalid_signals INTEGER NOT NULL DEFAULT 0,
                creates INTEGER NOT NULL DEFAULT 0,
                updates INTEGER NOT NULL DEFAULT 0,
                closes INTEGER NOT NULL DEFAULT 0,
                ignored INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                failures INTEGER NOT NULL DEFAULT 0,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                login INTEGER NOT NULL,
                kind TEXT NOT NULL,
                tag TEXT NOT NULL,
                signal_id TEXT,
                ticket INTEGER,
                symbol TEXT NOT NULL,
                retcode INTEGER,
                comment TEXT NOT NULL DEFAULT '',
                success INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cycles_login ON cycles(login, finished_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_actions_cycle ON actions(cycle_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn record_cycle(&self, cycle: &CycleRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cycles (
                id, login, started_at, finished_at, pairs_ok, pairs_failed, signals,
                invalid_signals, creates, updates, closes, ignored, skipped, failures, error
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cycle.id)
        .bind(cycle.login as i64)
        .bind(&cycle.started_at)
        .bind(&cycle.finished_at)
        .bind(cycle.pairs_ok)
        .bind(cycle.pairs_failed)
        .bind(cycle.signals)
        .bind(cycle.invalid_signals)
        .bind(cycle.creates)
        .bind(cycle.updates)
        .bind(cycle.closes)
        .bind(cycle.ignored)
        .bind(cycle.skipped)
        .bind(cycle.failures)
        .bind(&cycle.error)
        .execute(&self.pool)
        .await
        .context("Failed to record cycle")?;

        Ok(())
    }

    pub async fn record_action(&self, action: &ActionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actions (
                cycle_id, login, kind, tag, signal_id, ticket, symbol, retcode, comment, success
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&action.cycle_id)
        .bind(action.login as i64)
        .bind(&action.kind)
        .bind(&action.tag)
        .bind(&action.signal_id)
        .bind(action.ticket)
        .bind(&action.symbol)
        .bind(action.retcode)
        .bind(&action.comment)
        .bind(action.success)
        .execute(&self.pool)
        .await
        .context("Failed to record action")?;

        Ok(())
    }

    /// Totals per account, ordered by login.
    pub async fn summary(&self) -> Result<Vec<AccountSummary>> {
        sqlx::query_as::<_, AccountSummary>(
            r#"
            SELECT
                login,
                COUNT(*) AS cycles,
                COALESCE(SUM(CASE WHEN error IS NOT NULL THEN 1 ELSE 0 END), 0) AS aborted_cycles,
                COALESCE(SUM(creates), 0) AS creates,
                COALESCE(SUM(updates), 0) AS updates,
                COALESCE(SUM(closes), 0) AS closes,
                COALESCE(SUM(failures), 0) AS failures,
                MAX(finished_at) AS last_cycle_at
            FROM cycles
            GROUP BY login
            ORDER BY login
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load journal summary")
    }

    /// Most recent failed broker actions, newest first.
    pub async fn recent_failures(&self, limit: i64) -> Result<Vec<StoredAction>> {
        sqlx::query_as::<_, StoredAction>(
            "SELECT * FROM actions WHERE success = 0 ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load failed actions")
    }

    /// Actions issued during one cycle, in order.
    pub async fn cycle_actions(&self, cycle_id: &str) -> Result<Vec<StoredAction>> {
        sqlx::query_as::<_, StoredAction>("SELECT * FROM actions WHERE cycle_id = ? ORDER BY id")
            .bind(cycle_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load cycle actions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(id: &str, login: u64, error: Option<&str>) -> CycleRecord {
        CycleRecord {
            id: id.to_string(),
            login,
            started_at: "2024-03-01T12:00:00Z".to_string(),
            finished_at: format!("2024-03-01T12:00:0{}Z", id.len() % 10),
            creates: 2,
            closes: 1,
            error: error.map(str::to_string),
            ..Default::default()
        }
    }

    fn action(cycle_id: &str, kind: &str, success: bool) -> ActionRecord {
        ActionRecord {
            cycle_id: cycle_id.to_string(),
            login: 5001,
            kind: kind.to_string(),
            tag: "40465699977".to_string(),
            signal_id: Some("77".to_string()),
            ticket: None,
            symbol: "EURUSD".to_string(),
            retcode: Some(if success { 10009 } else { 10016 }),
            comment: if success { "Request executed" } else { "Invalid stops" }.to_string(),
            success,
        }
    }

    #[tokio::test]
    async fn test_summary_aggregates_per_account() {
        let journal = Journal::in_memory().await.unwrap();
        journal.record_cycle(&cycle("a", 5001, None)).await.unwrap();
        journal.record_cycle(&cycle("bb", 5001, Some("positions snapshot failed"))).await.unwrap();
        journal.record_cycle(&cycle("c", 7001, None)).await.unwrap();

        let summary = journal.summary().await.unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].login, 5001);
        assert_eq!(summary[0].cycles, 2);
        assert_eq!(summary[0].aborted_cycles, 1);
        assert_eq!(summary[0].creates, 4);
        assert_eq!(summary[1].closes, 1);
    }

    #[tokio::test]
    async fn test_failed_actions_are_listed_newest_first() {
        let journal = Journal::in_memory().await.unwrap();
        journal.record_action(&action("a", "create", true)).await.unwrap();
        journal.record_action(&action("a", "update", false)).await.unwrap();
        journal.record_action(&action("b", "close", false)).await.unwrap();

        let failures = journal.recent_failures(10).await.unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].kind, "close");
        assert_eq!(failures[1].retcode, Some(10016));

        let actions = journal.cycle_actions("a").await.unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions[0].success);
    }
}
