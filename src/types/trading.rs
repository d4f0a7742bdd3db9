//! Trading Types
//!
//! Server-side domain model for paper trading: accounts, positions and the
//! append-only account ledger.

use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Sign applied to price moves: +1 for long, -1 for short.
    pub fn direction(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" | "buy" => Some(PositionSide::Long),
            "short" | "sell" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position lifecycle status. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    Manual,
    System,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::Manual => "manual",
            CloseReason::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "take_profit" => Some(CloseReason::TakeProfit),
            "stop_loss" => Some(CloseReason::StopLoss),
            "manual" => Some(CloseReason::Manual),
            "system" => Some(CloseReason::System),
            _ => None,
        }
    }
}

impl Default for CloseReason {
    fn default() -> Self {
        CloseReason::Manual
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of balance change recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    /// Initial deposit written when the account is first created.
    Init,
    /// Fee debited when a position is opened.
    OpenFee,
    /// Net PnL credited (or debited) when a position is closed.
    ClosePnl,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Init => "init",
            LedgerEntryType::OpenFee => "open_fee",
            LedgerEntryType::ClosePnl => "close_pnl",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(LedgerEntryType::Init),
            "open_fee" => Some(LedgerEntryType::OpenFee),
            "close_pnl" => Some(LedgerEntryType::ClosePnl),
            _ => None,
        }
    }
}

impl std::fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Entities
// =============================================================================

/// A user's virtual cash account. One per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingAccount {
    pub user_id: String,
    pub initial_balance: f64,
    /// Always equal to the sum of the user's ledger amounts.
    pub cash_balance: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A leveraged position, open or closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    pub status: PositionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Mark-to-market PnL at `mark`, before any close fee.
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        (mark - self.entry_price) * self.quantity * self.side.direction()
    }
}

/// Immutable signed balance-change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: String,
    pub entry_type: LedgerEntryType,
    pub amount: f64,
    pub balance_after: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

// =============================================================================
// Requests
// =============================================================================

/// Input for opening a position on the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePositionInput {
    #[serde(default)]
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

/// Request body for closing a position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionRequest {
    /// Close price; the latest mark is used when absent.
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub reason: Option<CloseReason>,
}

/// Request body for editing brackets. `None` clears the bracket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBracketsRequest {
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

/// Result of a close attempt that actually transitioned the position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPosition {
    pub position: Position,
    pub account: TradingAccount,
    pub ledger_entry: LedgerEntry,
}

/// Result of a successful open.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedPosition {
    pub position: Position,
    pub account: TradingAccount,
    pub fee: f64,
}

/// Ledger view exposing the balance invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub cash_balance: f64,
    pub ledger_sum: f64,
    pub entries: Vec<LedgerEntry>,
}
