//! Ledger-backed account repository.
//!
//! Authoritative server state: one cash account per user, positions, and the
//! append-only `account_ledger`. Every write runs in a `BEGIN IMMEDIATE`
//! transaction, so the position row check-and-flip and the balance/ledger
//! pair are serialized against all other writers and either land together or
//! not at all.

use crate::services::brackets::{validate_brackets, validate_order, ValidationError};
use crate::services::fees::{FeeSchedule, BALANCE_EPSILON};
use crate::services::trading::TradingError;
use crate::types::{
    CloseReason, ClosedPosition, CreatePositionInput, LedgerEntry, LedgerEntryType,
    OpenedPosition, Position, PositionSide, PositionStatus, TradingAccount,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::json;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS trading_accounts (
        user_id TEXT PRIMARY KEY,
        initial_balance REAL NOT NULL,
        cash_balance REAL NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS positions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES trading_accounts(user_id),
        symbol TEXT NOT NULL,
        side TEXT NOT NULL CHECK (side IN ('long', 'short')),
        quantity REAL NOT NULL CHECK (quantity > 0),
        entry_price REAL NOT NULL CHECK (entry_price > 0),
        take_profit REAL,
        stop_loss REAL,
        status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
        close_price REAL,
        close_pnl REAL,
        close_reason TEXT,
        created_at INTEGER NOT NULL,
        closed_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_positions_user_status ON positions(user_id, status);
    CREATE INDEX IF NOT EXISTS idx_positions_symbol_status ON positions(symbol, status);

    CREATE TABLE IF NOT EXISTS account_ledger (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL REFERENCES trading_accounts(user_id),
        entry_type TEXT NOT NULL,
        amount REAL NOT NULL,
        balance_after REAL NOT NULL,
        position_id TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_ledger_user ON account_ledger(user_id, id);
";

const POSITION_COLUMNS: &str = "id, user_id, symbol, side, quantity, entry_price, take_profit, \
     stop_loss, status, close_price, close_pnl, close_reason, created_at, closed_at";

const LEDGER_COLUMNS: &str =
    "id, user_id, entry_type, amount, balance_after, position_id, metadata, created_at";

/// SQLite repository for accounts, positions and the ledger.
pub struct LedgerStore {
    conn: Mutex<Connection>,
    fees: FeeSchedule,
    initial_balance: f64,
}

impl LedgerStore {
    /// Open (or create) the database at `path`.
    pub fn new<P: AsRef<Path>>(
        path: P,
        fees: FeeSchedule,
        initial_balance: f64,
    ) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn, fees, initial_balance)?;
        info!("Ledger store initialized");
        Ok(store)
    }

    /// In-memory database (for testing).
    pub fn new_in_memory(fees: FeeSchedule, initial_balance: f64) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self::with_connection(conn, fees, initial_balance)?;
        debug!("In-memory ledger store initialized");
        Ok(store)
    }

    fn with_connection(
        conn: Connection,
        fees: FeeSchedule,
        initial_balance: f64,
    ) -> Result<Self, rusqlite::Error> {
        // Several stores may share one file; writers wait for the lock.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            fees,
            initial_balance,
        })
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    /// Starting cash for newly created accounts.
    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, TradingError> {
        self.conn
            .lock()
            .map_err(|_| TradingError::DatabaseError("connection lock poisoned".to_string()))
    }

    // ========== Accounts ==========

    /// Fetch the account, if one exists.
    pub fn get_trading_account(&self, user_id: &str) -> Result<Option<TradingAccount>, TradingError> {
        let conn = self.conn()?;
        Ok(select_account(&conn, user_id)?)
    }

    /// Fetch the account, creating it (with its `init` ledger entry) on first
    /// use.
    pub fn ensure_trading_account(&self, user_id: &str) -> Result<TradingAccount, TradingError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let account = ensure_account(&tx, user_id, self.initial_balance, now_ms())?;
        tx.commit()?;
        Ok(account)
    }

    // ========== Positions ==========

    /// Open a position: ensure the account, charge the open fee, insert the
    /// position and append the `open_fee` entry, atomically.
    pub fn create_position(&self, input: &CreatePositionInput) -> Result<OpenedPosition, TradingError> {
        let symbol = input.symbol.trim().to_lowercase();
        if symbol.is_empty() {
            return Err(ValidationError::EmptySymbol.into());
        }
        validate_order(input.quantity, input.entry_price)?;
        validate_brackets(input.side, input.entry_price, input.stop_loss, input.take_profit)?;

        let now = now_ms();
        let cost = self.fees.quote(input.entry_price, input.quantity);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let account = ensure_account(&tx, &input.user_id, self.initial_balance, now)?;
        if cost.fee > account.cash_balance + BALANCE_EPSILON {
            return Err(TradingError::InsufficientBalance {
                needed: cost.fee,
                available: account.cash_balance,
            });
        }

        let balance_after = account.cash_balance - cost.fee;
        update_balance(&tx, &input.user_id, balance_after, now)?;

        let position = Position {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: input.user_id.clone(),
            symbol,
            side: input.side,
            quantity: input.quantity,
            entry_price: input.entry_price,
            take_profit: input.take_profit,
            stop_loss: input.stop_loss,
            status: PositionStatus::Open,
            close_price: None,
            close_pnl: None,
            close_reason: None,
            created_at: now,
            closed_at: None,
        };
        tx.execute(
            "INSERT INTO positions (id, user_id, symbol, side, quantity, entry_price,
                 take_profit, stop_loss, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'open', ?9)",
            params![
                position.id,
                position.user_id,
                position.symbol,
                position.side.as_str(),
                position.quantity,
                position.entry_price,
                position.take_profit,
                position.stop_loss,
                position.created_at,
            ],
        )?;

        append_ledger(
            &tx,
            &input.user_id,
            LedgerEntryType::OpenFee,
            -cost.fee,
            balance_after,
            Some(&position.id),
            json!({
                "symbol": position.symbol,
                "side": position.side,
                "quantity": position.quantity,
                "entryPrice": position.entry_price,
                "notional": cost.notional,
                "feeRate": self.fees.effective_rate(),
            }),
            now,
        )?;

        let account = select_account(&tx, &input.user_id)?.ok_or_else(|| {
            TradingError::DatabaseError(format!("account {} vanished", input.user_id))
        })?;
        tx.commit()?;

        info!(
            "Opened {} {} {} @ {} for {} (fee {:.4})",
            position.side, position.quantity, position.symbol, position.entry_price, position.user_id, cost.fee
        );
        Ok(OpenedPosition {
            position,
            account,
            fee: cost.fee,
        })
    }

    /// Close a position exactly once.
    ///
    /// The status flip and the PnL computation are one conditional `UPDATE`
    /// scoped to `status = 'open'` (and to `user_id` when given). A position
    /// that is already closed, missing, or owned by someone else yields
    /// `Ok(None)` and touches nothing.
    pub fn close_position_if_open(
        &self,
        position_id: &str,
        close_price: f64,
        reason: CloseReason,
        user_id: Option<&str>,
    ) -> Result<Option<ClosedPosition>, TradingError> {
        if !close_price.is_finite() || close_price <= 0.0 {
            return Err(ValidationError::InvalidPrice(close_price).into());
        }
        let now = now_ms();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!(
            "UPDATE positions
             SET status = 'closed',
                 close_price = ?2,
                 close_reason = ?3,
                 closed_at = ?4,
                 close_pnl = (CASE WHEN side = 'long' THEN ?2 - entry_price ELSE entry_price - ?2 END)
                             * quantity - ?2 * quantity * ?5
             WHERE id = ?1 AND status = 'open' AND (?6 IS NULL OR user_id = ?6)
             RETURNING {POSITION_COLUMNS}"
        );
        let closed = tx
            .query_row(
                &sql,
                params![
                    position_id,
                    close_price,
                    reason.as_str(),
                    now,
                    self.fees.effective_rate(),
                    user_id,
                ],
                position_from_row,
            )
            .optional()?;

        let Some(mut position) = closed else {
            debug!("Close skipped for {}: not open", position_id);
            return Ok(None);
        };

        let pnl = match position.close_pnl {
            Some(v) if v.is_finite() => v,
            other => {
                warn!("Non-finite close PnL {:?} on {}, booking 0", other, position.id);
                tx.execute(
                    "UPDATE positions SET close_pnl = 0 WHERE id = ?1",
                    params![position.id],
                )?;
                position.close_pnl = Some(0.0);
                0.0
            }
        };

        let account = select_account(&tx, &position.user_id)?.ok_or_else(|| {
            TradingError::DatabaseError(format!("account {} missing", position.user_id))
        })?;
        let balance_after = account.cash_balance + pnl;
        update_balance(&tx, &position.user_id, balance_after, now)?;

        let ledger_entry = append_ledger(
            &tx,
            &position.user_id,
            LedgerEntryType::ClosePnl,
            pnl,
            balance_after,
            Some(&position.id),
            json!({
                "symbol": position.symbol,
                "side": position.side,
                "quantity": position.quantity,
                "entryPrice": position.entry_price,
                "closePrice": close_price,
                "reason": reason,
            }),
            now,
        )?;

        let account = TradingAccount {
            cash_balance: balance_after,
            updated_at: now,
            ..account
        };
        tx.commit()?;

        info!(
            "Closed {} {} @ {} ({}) pnl {:.4}",
            position.id, position.symbol, close_price, reason, pnl
        );
        Ok(Some(ClosedPosition {
            position,
            account,
            ledger_entry,
        }))
    }

    /// Replace both brackets of an open position. `Ok(None)` when the
    /// position is closed or not visible to `user_id`.
    pub fn update_position_brackets_if_open(
        &self,
        position_id: &str,
        user_id: Option<&str>,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    ) -> Result<Option<Position>, TradingError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(current) = select_position(&tx, position_id, user_id)? else {
            return Ok(None);
        };
        if !current.is_open() {
            debug!("Bracket edit skipped for {}: already closed", position_id);
            return Ok(None);
        }
        validate_brackets(current.side, current.entry_price, stop_loss, take_profit)?;

        let sql = format!(
            "UPDATE positions SET take_profit = ?2, stop_loss = ?3
             WHERE id = ?1 AND status = 'open'
             RETURNING {POSITION_COLUMNS}"
        );
        let updated = tx
            .query_row(
                &sql,
                params![position_id, take_profit, stop_loss],
                position_from_row,
            )
            .optional()?;
        tx.commit()?;

        if let Some(ref p) = updated {
            info!("Brackets on {}: TP {:?} SL {:?}", p.id, p.take_profit, p.stop_loss);
        }
        Ok(updated)
    }

    /// Wipe the user's positions and ledger and restore the original initial
    /// balance. A fresh `init` entry keeps the ledger summing to the balance.
    pub fn reset_user_session(&self, user_id: &str) -> Result<TradingAccount, TradingError> {
        let now = now_ms();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let account = ensure_account(&tx, user_id, self.initial_balance, now)?;
        let ledger_rows = tx.execute("DELETE FROM account_ledger WHERE user_id = ?1", params![user_id])?;
        let position_rows = tx.execute("DELETE FROM positions WHERE user_id = ?1", params![user_id])?;
        update_balance(&tx, user_id, account.initial_balance, now)?;
        append_ledger(
            &tx,
            user_id,
            LedgerEntryType::Init,
            account.initial_balance,
            account.initial_balance,
            None,
            json!({ "reset": true }),
            now,
        )?;
        tx.commit()?;

        info!(
            "Reset session for {}: removed {} positions, {} ledger entries",
            user_id, position_rows, ledger_rows
        );
        Ok(TradingAccount {
            cash_balance: account.initial_balance,
            updated_at: now,
            ..account
        })
    }

    // ========== Reads ==========

    /// The user's positions, newest first, optionally filtered by status.
    pub fn list_positions(
        &self,
        user_id: &str,
        status: Option<PositionStatus>,
    ) -> Result<Vec<Position>, TradingError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, rowid DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![user_id, status.map(|s| s.as_str())],
            position_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_open_positions(&self, user_id: &str) -> Result<Vec<Position>, TradingError> {
        self.list_positions(user_id, Some(PositionStatus::Open))
    }

    /// Open positions on `symbol` across all users.
    pub fn open_positions_for_symbol(&self, symbol: &str) -> Result<Vec<Position>, TradingError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE symbol = ?1 AND status = 'open'
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![symbol.to_lowercase()], position_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Single position, scoped to its owner when `user_id` is given.
    pub fn get_position(
        &self,
        position_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<Position>, TradingError> {
        let conn = self.conn()?;
        Ok(select_position(&conn, position_id, user_id)?)
    }

    /// The user's ledger in append order.
    pub fn list_ledger(&self, user_id: &str) -> Result<Vec<LedgerEntry>, TradingError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM account_ledger WHERE user_id = ?1 ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], ledger_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// `Σ amount` over the user's ledger.
    pub fn ledger_balance(&self, user_id: &str) -> Result<f64, TradingError> {
        let conn = self.conn()?;
        let sum = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0.0) FROM account_ledger WHERE user_id = ?1",
            params![user_id],
            |row| row.get::<_, f64>(0),
        )?;
        Ok(sum)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Insert-if-absent. The `init` entry is written only by the call that
/// actually created the row.
fn ensure_account(
    conn: &Connection,
    user_id: &str,
    initial_balance: f64,
    now: i64,
) -> Result<TradingAccount, TradingError> {
    if user_id.trim().is_empty() {
        return Err(TradingError::Unauthorized);
    }
    let inserted = conn.execute(
        "INSERT INTO trading_accounts (user_id, initial_balance, cash_balance, created_at, updated_at)
         VALUES (?1, ?2, ?2, ?3, ?3)
         ON CONFLICT(user_id) DO NOTHING",
        params![user_id, initial_balance, now],
    )?;
    if inserted > 0 {
        append_ledger(
            conn,
            user_id,
            LedgerEntryType::Init,
            initial_balance,
            initial_balance,
            None,
            json!({ "initialBalance": initial_balance }),
            now,
        )?;
        info!("Created trading account for {} with {}", user_id, initial_balance);
    }

    select_account(conn, user_id)?
        .ok_or_else(|| TradingError::DatabaseError(format!("account {} not created", user_id)))
}

fn select_account(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<TradingAccount>> {
    conn.query_row(
        "SELECT user_id, initial_balance, cash_balance, created_at, updated_at
         FROM trading_accounts WHERE user_id = ?1",
        params![user_id],
        |row| {
            Ok(TradingAccount {
                user_id: row.get(0)?,
                initial_balance: row.get(1)?,
                cash_balance: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        },
    )
    .optional()
}

fn update_balance(conn: &Connection, user_id: &str, cash_balance: f64, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE trading_accounts SET cash_balance = ?2, updated_at = ?3 WHERE user_id = ?1",
        params![user_id, cash_balance, now],
    )?;
    Ok(())
}

fn select_position(
    conn: &Connection,
    position_id: &str,
    user_id: Option<&str>,
) -> rusqlite::Result<Option<Position>> {
    let sql = format!(
        "SELECT {POSITION_COLUMNS} FROM positions
         WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)"
    );
    conn.query_row(&sql, params![position_id, user_id], position_from_row)
        .optional()
}

#[allow(clippy::too_many_arguments)]
fn append_ledger(
    conn: &Connection,
    user_id: &str,
    entry_type: LedgerEntryType,
    amount: f64,
    balance_after: f64,
    position_id: Option<&str>,
    metadata: serde_json::Value,
    now: i64,
) -> rusqlite::Result<LedgerEntry> {
    conn.execute(
        "INSERT INTO account_ledger (user_id, entry_type, amount, balance_after, position_id, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            entry_type.as_str(),
            amount,
            balance_after,
            position_id,
            metadata.to_string(),
            now,
        ],
    )?;

    Ok(LedgerEntry {
        id: conn.last_insert_rowid(),
        user_id: user_id.to_string(),
        entry_type,
        amount,
        balance_after,
        position_id: position_id.map(str::to_string),
        metadata,
        created_at: now,
    })
}

fn enum_column<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unexpected value '{}'", raw).into())
    })
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    let close_reason = match row.get::<_, Option<String>>(11)? {
        Some(raw) => Some(CloseReason::parse(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(11, Type::Text, format!("unexpected close reason '{}'", raw).into())
        })?),
        None => None,
    };

    Ok(Position {
        id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        side: enum_column(row, 3, PositionSide::parse)?,
        quantity: row.get(4)?,
        entry_price: row.get(5)?,
        take_profit: row.get(6)?,
        stop_loss: row.get(7)?,
        status: enum_column(row, 8, PositionStatus::parse)?,
        close_price: row.get(9)?,
        close_pnl: row.get(10)?,
        close_reason,
        created_at: row.get(12)?,
        closed_at: row.get(13)?,
    })
}

fn ledger_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let metadata: String = row.get(6)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        entry_type: enum_column(row, 2, LedgerEntryType::parse)?,
        amount: row.get(3)?,
        balance_after: row.get(4)?,
        position_id: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: row.get(7)?,
    })
}
