use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

pub mod models;
use models::*;

/// Thread-safe SQLite store (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const POSITION_COLS: &str = "id, idempotency_key, run_date, venue, venue_kind, event_id, entity_id,
     statistic, line, side, price, implied_probability, model_probability,
     confidence, edge, stake, stake_units, status, committed_at";

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Positions ─────────────────────────────────────────────────────────────

    /// Append a position to the position log. Returns `Some(id)` on insert,
    /// `None` when a position with the same idempotency key already exists
    /// (a prior, possibly partial, run committed it — skipping is not an error).
    pub fn insert_position(&self, pos: &Position) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO positions (
                idempotency_key, run_date, venue, venue_kind, event_id, entity_id,
                statistic, line, side, price, implied_probability, model_probability,
                confidence, edge, stake, stake_units, status, committed_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                pos.idempotency_key,
                pos.run_date,
                pos.venue,
                pos.venue_kind.as_str(),
                pos.event_id,
                pos.entity_id,
                pos.statistic,
                pos.line,
                pos.side.as_str(),
                pos.price,
                pos.implied_probability,
                pos.model_probability,
                pos.confidence,
                pos.edge,
                pos.stake,
                pos.stake_units,
                pos.status.as_str(),
                pos.committed_at,
            ],
        )?;
        if changed == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    /// List every position committed for a run date
    pub fn list_positions_for_date(&self, run_date: NaiveDate) -> Result<Vec<Position>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLS} FROM positions WHERE run_date=?1 ORDER BY id"
        ))?;
        let positions = stmt
            .query_map(params![run_date], map_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    /// List positions for a date still awaiting settlement
    pub fn list_committed_positions(&self, run_date: NaiveDate) -> Result<Vec<Position>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLS} FROM positions
             WHERE run_date=?1 AND status='committed' ORDER BY id"
        ))?;
        let positions = stmt
            .query_map(params![run_date], map_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    // ── Closing quotes ────────────────────────────────────────────────────────

    /// Attach a closing quote to a position. Returns false when one is
    /// already present (collector re-run); the original is kept.
    pub fn insert_closing_quote(&self, quote: &ClosingQuote) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO closing_quotes (position_id, price, implied_probability, captured_at)
             VALUES (?1,?2,?3,?4)",
            params![
                quote.position_id,
                quote.price,
                quote.implied_probability,
                quote.captured_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn closing_quote_for(&self, position_id: i64) -> Result<Option<ClosingQuote>> {
        let conn = self.conn.lock().unwrap();
        let quote = conn
            .query_row(
                "SELECT position_id, price, implied_probability, captured_at
                 FROM closing_quotes WHERE position_id=?1",
                params![position_id],
                |row| {
                    Ok(ClosingQuote {
                        position_id: row.get(0)?,
                        price: row.get(1)?,
                        implied_probability: row.get(2)?,
                        captured_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(quote)
    }

    /// Positions for a date that do not yet have a closing quote
    pub fn positions_missing_closing_quote(&self, run_date: NaiveDate) -> Result<Vec<Position>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLS} FROM positions p
             WHERE p.run_date=?1
               AND NOT EXISTS (SELECT 1 FROM closing_quotes c WHERE c.position_id = p.id)
             ORDER BY p.id"
        ))?;
        let positions = stmt
            .query_map(params![run_date], map_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    // ── Settlement & ledger ───────────────────────────────────────────────────

    pub fn settlement_for(&self, position_id: i64) -> Result<Option<SettlementRecord>> {
        let conn = self.conn.lock().unwrap();
        let rec = conn
            .query_row(
                "SELECT id, position_id, outcome, payout, settled_at
                 FROM settlements WHERE position_id=?1",
                params![position_id],
                map_settlement,
            )
            .optional()?;
        Ok(rec)
    }

    /// Settle a position: write the settlement record, mark the position
    /// terminal, and append exactly one ledger entry whose delta is the net
    /// P&L (payout − stake), all in one transaction. A position that already
    /// has a settlement is left untouched and `None` is returned.
    pub fn settle_position(
        &self,
        pos: &Position,
        outcome: Outcome,
        payout: f64,
        starting_bankroll: f64,
    ) -> Result<Option<SettlementRecord>> {
        let position_id = match pos.id {
            Some(id) => id,
            None => bail!("cannot settle a position without a database id"),
        };
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let already: Option<i64> = tx
            .query_row(
                "SELECT id FROM settlements WHERE position_id=?1",
                params![position_id],
                |row| row.get(0),
            )
            .optional()?;
        if already.is_some() {
            tx.rollback()?;
            return Ok(None);
        }

        let settled_at = Utc::now();
        tx.execute(
            "INSERT INTO settlements (position_id, outcome, payout, settled_at)
             VALUES (?1,?2,?3,?4)",
            params![position_id, outcome.as_str(), payout, settled_at],
        )?;
        let settlement_id = tx.last_insert_rowid();

        let new_status = match outcome {
            Outcome::Void => PositionStatus::Voided,
            _ => PositionStatus::Settled,
        };
        tx.execute(
            "UPDATE positions SET status=?1 WHERE id=?2",
            params![new_status.as_str(), position_id],
        )?;

        let prev_balance: Option<f64> = tx
            .query_row(
                "SELECT balance FROM ledger ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let delta = payout - pos.stake;
        let balance = prev_balance.unwrap_or(starting_bankroll) + delta;
        tx.execute(
            "INSERT INTO ledger (run_date, delta, balance, reference, recorded_at)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                pos.run_date,
                delta,
                balance,
                format!("settlement:{}|{}", settlement_id, pos.idempotency_key),
                settled_at,
            ],
        )?;

        tx.commit()?;
        Ok(Some(SettlementRecord {
            id: Some(settlement_id),
            position_id,
            outcome,
            payout,
            settled_at,
        }))
    }

    /// Current balance: the last ledger balance, or the starting bankroll
    /// when nothing has settled yet
    pub fn current_balance(&self, starting_bankroll: f64) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        let balance: Option<f64> = conn
            .query_row(
                "SELECT balance FROM ledger ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(starting_bankroll))
    }

    pub fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, run_date, delta, balance, reference, recorded_at
             FROM ledger ORDER BY id",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(LedgerEntry {
                    id: row.get(0)?,
                    run_date: row.get(1)?,
                    delta: row.get(2)?,
                    balance: row.get(3)?,
                    reference: row.get(4)?,
                    recorded_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Replay every ledger entry in order from the starting bankroll and
    /// verify each stored running balance. This is the core consistency
    /// check: the replayed final balance must equal the stored one exactly
    /// (within float tolerance).
    pub fn replay_ledger(&self, starting_bankroll: f64) -> Result<f64> {
        let entries = self.ledger_entries()?;
        let mut balance = starting_bankroll;
        for entry in &entries {
            balance += entry.delta;
            if (balance - entry.balance).abs() > 1e-6 {
                bail!(
                    "ledger replay mismatch at entry {}: replayed {:.6}, stored {:.6} ({})",
                    entry.id.unwrap_or(-1),
                    balance,
                    entry.balance,
                    entry.reference
                );
            }
        }
        Ok(balance)
    }

    // ── Advisory locks ────────────────────────────────────────────────────────

    /// Try to take the per-date advisory lock for a pipeline. Returns false
    /// when another invocation holds it. Locks older than `ttl_secs` are
    /// treated as stale (crashed run) and reclaimed.
    pub fn try_acquire_lock(
        &self,
        run_date: NaiveDate,
        pipeline: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(ttl_secs as i64);
        conn.execute(
            "DELETE FROM run_locks WHERE run_date=?1 AND pipeline=?2 AND acquired_at < ?3",
            params![run_date, pipeline, cutoff],
        )?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO run_locks (run_date, pipeline, acquired_at) VALUES (?1,?2,?3)",
            params![run_date, pipeline, Utc::now()],
        )?;
        Ok(changed > 0)
    }

    pub fn release_lock(&self, run_date: NaiveDate, pipeline: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM run_locks WHERE run_date=?1 AND pipeline=?2",
            params![run_date, pipeline],
        )?;
        Ok(())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    let venue_kind: String = row.get(4)?;
    let side: String = row.get(9)?;
    let status: String = row.get(17)?;
    Ok(Position {
        id: row.get(0)?,
        idempotency_key: row.get(1)?,
        run_date: row.get(2)?,
        venue: row.get(3)?,
        venue_kind: VenueKind::parse(&venue_kind).unwrap_or(VenueKind::FixedOdds),
        event_id: row.get(5)?,
        entity_id: row.get(6)?,
        statistic: row.get(7)?,
        line: row.get(8)?,
        side: Side::parse(&side).unwrap_or(Side::Yes),
        price: row.get(10)?,
        implied_probability: row.get(11)?,
        model_probability: row.get(12)?,
        confidence: row.get(13)?,
        edge: row.get(14)?,
        stake: row.get(15)?,
        stake_units: row.get(16)?,
        status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Committed),
        committed_at: row.get(18)?,
    })
}

fn map_settlement(row: &rusqlite::Row) -> rusqlite::Result<SettlementRecord> {
    let outcome: String = row.get(2)?;
    Ok(SettlementRecord {
        id: row.get(0)?,
        position_id: row.get(1)?,
        outcome: Outcome::parse(&outcome).unwrap_or(Outcome::Void),
        payout: row.get(3)?,
        settled_at: row.get(4)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS positions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key     TEXT    NOT NULL UNIQUE,
    run_date            TEXT    NOT NULL,
    venue               TEXT    NOT NULL,
    venue_kind          TEXT    NOT NULL,
    event_id            TEXT    NOT NULL,
    entity_id           TEXT    NOT NULL,
    statistic           TEXT    NOT NULL,
    line                REAL,
    side                TEXT    NOT NULL,
    price               REAL    NOT NULL,
    implied_probability REAL    NOT NULL,
    model_probability   REAL    NOT NULL,
    confidence          REAL    NOT NULL,
    edge                REAL    NOT NULL,
    stake               REAL    NOT NULL,
    stake_units         REAL    NOT NULL,
    status              TEXT    NOT NULL DEFAULT 'committed',
    committed_at        TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS closing_quotes (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    position_id         INTEGER NOT NULL UNIQUE,
    price               REAL    NOT NULL,
    implied_probability REAL    NOT NULL,
    captured_at         TEXT    NOT NULL,
    FOREIGN KEY (position_id) REFERENCES positions(id)
);

CREATE TABLE IF NOT EXISTS settlements (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    position_id INTEGER NOT NULL UNIQUE,
    outcome     TEXT    NOT NULL,
    payout      REAL    NOT NULL,
    settled_at  TEXT    NOT NULL,
    FOREIGN KEY (position_id) REFERENCES positions(id)
);

CREATE TABLE IF NOT EXISTS ledger (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_date    TEXT    NOT NULL,
    delta       REAL    NOT NULL,
    balance     REAL    NOT NULL,
    reference   TEXT    NOT NULL,
    recorded_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS run_locks (
    run_date    TEXT NOT NULL,
    pipeline    TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    UNIQUE(run_date, pipeline)
);

CREATE INDEX IF NOT EXISTS idx_positions_run_date ON positions(run_date);
CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
"#;
