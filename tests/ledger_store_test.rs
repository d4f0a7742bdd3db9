//! Ledger store integration tests
//!
//! Tests cover:
//! - Open/close accounting against the append-only ledger
//! - Exactly-once closes, including racing closers on one database file
//! - Session resets scoped to a single user
//! - Rejected opens leaving no trace

use paperdesk::services::{FeeSchedule, LedgerStore, TradingError};
use paperdesk::types::*;
use std::sync::Arc;
use std::thread;

fn store() -> LedgerStore {
    LedgerStore::new_in_memory(FeeSchedule::default(), 10_000.0).unwrap()
}

fn input(user: &str, symbol: &str, side: PositionSide, qty: f64, price: f64) -> CreatePositionInput {
    CreatePositionInput {
        user_id: user.to_string(),
        symbol: symbol.to_string(),
        side,
        quantity: qty,
        entry_price: price,
        take_profit: None,
        stop_loss: None,
    }
}

fn assert_ledger_matches(store: &LedgerStore, user: &str) {
    let account = store.get_trading_account(user).unwrap().unwrap();
    let sum = store.ledger_balance(user).unwrap();
    assert!(
        (account.cash_balance - sum).abs() < 1e-9,
        "cash {} != ledger {}",
        account.cash_balance,
        sum
    );
}

fn temp_db_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("paperdesk-test-{}.db", uuid::Uuid::new_v4()))
}

// =============================================================================
// Accounting
// =============================================================================

mod accounting_tests {
    use super::*;

    #[test]
    fn test_open_close_scenario() {
        let store = store();
        let opened = store
            .create_position(&input("alice", "BTCUSDT", PositionSide::Long, 0.1, 50_000.0))
            .unwrap();
        assert!((opened.fee - 2.0).abs() < 1e-9);
        assert!((opened.account.cash_balance - 9_998.0).abs() < 1e-9);
        assert_eq!(opened.position.symbol, "btcusdt");

        let closed = store
            .close_position_if_open(&opened.position.id, 51_000.0, CloseReason::Manual, Some("alice"))
            .unwrap()
            .unwrap();
        assert_eq!(closed.position.status, PositionStatus::Closed);
        assert!((closed.position.close_pnl.unwrap() - 97.96).abs() < 1e-9);
        assert!((closed.account.cash_balance - 10_095.96).abs() < 1e-6);
        assert_eq!(closed.ledger_entry.entry_type, LedgerEntryType::ClosePnl);
        assert_eq!(closed.ledger_entry.position_id.as_deref(), Some(opened.position.id.as_str()));

        let entries = store.list_ledger("alice").unwrap();
        let kinds: Vec<_> = entries.iter().map(|e| e.entry_type).collect();
        assert_eq!(
            kinds,
            vec![LedgerEntryType::Init, LedgerEntryType::OpenFee, LedgerEntryType::ClosePnl]
        );
        assert_eq!(entries[0].amount, 10_000.0);
        assert!((entries[1].amount + 2.0).abs() < 1e-9);
        assert_ledger_matches(&store, "alice");
    }

    #[test]
    fn test_balance_after_chains() {
        let store = store();
        for price in [100.0, 200.0, 300.0] {
            let opened = store
                .create_position(&input("bob", "ethusdt", PositionSide::Short, 1.0, price))
                .unwrap();
            store
                .close_position_if_open(&opened.position.id, price * 0.9, CloseReason::Manual, None)
                .unwrap()
                .unwrap();
        }

        let entries = store.list_ledger("bob").unwrap();
        let mut running = 0.0;
        for entry in &entries {
            running += entry.amount;
            assert!((entry.balance_after - running).abs() < 1e-9);
        }
        assert_ledger_matches(&store, "bob");
    }

    #[test]
    fn test_losing_close_debits_cash() {
        let store = store();
        let opened = store
            .create_position(&input("carol", "solusdt", PositionSide::Long, 10.0, 150.0))
            .unwrap();
        let closed = store
            .close_position_if_open(&opened.position.id, 140.0, CloseReason::StopLoss, None)
            .unwrap()
            .unwrap();

        // raw -100, close fee 10 * 140 * 0.0004
        assert!((closed.ledger_entry.amount - (-100.0 - 0.56)).abs() < 1e-9);
        assert_eq!(closed.position.close_reason, Some(CloseReason::StopLoss));
        assert_ledger_matches(&store, "carol");
    }

    #[test]
    fn test_list_filters_by_status() {
        let store = store();
        let first = store
            .create_position(&input("dave", "btcusdt", PositionSide::Long, 0.01, 50_000.0))
            .unwrap();
        store
            .create_position(&input("dave", "ethusdt", PositionSide::Long, 0.1, 3_000.0))
            .unwrap();
        store
            .close_position_if_open(&first.position.id, 50_000.0, CloseReason::Manual, None)
            .unwrap();

        assert_eq!(store.list_positions("dave", None).unwrap().len(), 2);
        let open = store.list_open_positions("dave").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "ethusdt");
        let closed = store
            .list_positions("dave", Some(PositionStatus::Closed))
            .unwrap();
        assert_eq!(closed[0].id, first.position.id);
    }
}

// =============================================================================
// Exactly-once closes
// =============================================================================

mod close_once_tests {
    use super::*;

    #[test]
    fn test_second_close_is_noop() {
        let store = store();
        let opened = store
            .create_position(&input("alice", "btcusdt", PositionSide::Long, 0.1, 50_000.0))
            .unwrap();

        assert!(store
            .close_position_if_open(&opened.position.id, 51_000.0, CloseReason::Manual, None)
            .unwrap()
            .is_some());
        assert!(store
            .close_position_if_open(&opened.position.id, 60_000.0, CloseReason::TakeProfit, None)
            .unwrap()
            .is_none());

        let entries = store.list_ledger("alice").unwrap();
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.entry_type == LedgerEntryType::ClosePnl)
                .count(),
            1
        );
        let position = store.get_position(&opened.position.id, None).unwrap().unwrap();
        assert_eq!(position.close_price, Some(51_000.0));
    }

    #[test]
    fn test_threads_race_on_shared_store() {
        let store = Arc::new(store());
        let opened = store
            .create_position(&input("alice", "btcusdt", PositionSide::Long, 0.1, 50_000.0))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = opened.position.id.clone();
                thread::spawn(move || {
                    store
                        .close_position_if_open(&id, 50_000.0 + i as f64 * 100.0, CloseReason::Manual, None)
                        .unwrap()
                        .is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_ledger_matches(&store, "alice");
    }

    #[test]
    fn test_two_connections_race_on_one_file() {
        let path = temp_db_path();
        let first = Arc::new(LedgerStore::new(&path, FeeSchedule::default(), 10_000.0).unwrap());
        let second = Arc::new(LedgerStore::new(&path, FeeSchedule::default(), 10_000.0).unwrap());

        let opened = first
            .create_position(&input("alice", "btcusdt", PositionSide::Short, 0.1, 50_000.0))
            .unwrap();

        let racers: Vec<_> = [first.clone(), second.clone()]
            .into_iter()
            .map(|store| {
                let id = opened.position.id.clone();
                thread::spawn(move || {
                    store
                        .close_position_if_open(&id, 49_000.0, CloseReason::Manual, None)
                        .unwrap()
                        .is_some()
                })
            })
            .collect();
        let winners = racers
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        assert_ledger_matches(&second, "alice");
        assert_eq!(second.list_ledger("alice").unwrap().len(), 3);

        drop(first);
        drop(second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_close_scoped_to_owner() {
        let store = store();
        let opened = store
            .create_position(&input("alice", "btcusdt", PositionSide::Long, 0.1, 50_000.0))
            .unwrap();

        assert!(store
            .close_position_if_open(&opened.position.id, 51_000.0, CloseReason::Manual, Some("mallory"))
            .unwrap()
            .is_none());
        assert!(store
            .get_position(&opened.position.id, None)
            .unwrap()
            .unwrap()
            .is_open());
    }

    #[test]
    fn test_bracket_edit_on_closed_position() {
        let store = store();
        let opened = store
            .create_position(&input("alice", "btcusdt", PositionSide::Long, 0.1, 50_000.0))
            .unwrap();
        store
            .close_position_if_open(&opened.position.id, 50_000.0, CloseReason::Manual, None)
            .unwrap();

        let result = store
            .update_position_brackets_if_open(&opened.position.id, Some("alice"), Some(55_000.0), None)
            .unwrap();
        assert!(result.is_none());
    }
}

// =============================================================================
// Resets & rejections
// =============================================================================

mod reset_tests {
    use super::*;

    #[test]
    fn test_reset_only_touches_caller() {
        let store = store();
        store
            .create_position(&input("alice", "btcusdt", PositionSide::Long, 0.1, 50_000.0))
            .unwrap();
        store
            .create_position(&input("bob", "btcusdt", PositionSide::Long, 0.1, 50_000.0))
            .unwrap();

        let account = store.reset_user_session("alice").unwrap();
        assert_eq!(account.cash_balance, 10_000.0);
        assert!(store.list_positions("alice", None).unwrap().is_empty());

        let ledger = store.list_ledger("alice").unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].entry_type, LedgerEntryType::Init);
        assert_eq!(ledger[0].metadata["reset"], true);
        assert_ledger_matches(&store, "alice");

        assert_eq!(store.list_positions("bob", None).unwrap().len(), 1);
        assert_eq!(store.list_ledger("bob").unwrap().len(), 2);
        assert_ledger_matches(&store, "bob");
    }

    #[test]
    fn test_reset_creates_missing_account() {
        let store = store();
        let account = store.reset_user_session("newcomer").unwrap();
        assert_eq!(account.initial_balance, 10_000.0);
        assert_eq!(store.list_ledger("newcomer").unwrap().len(), 1);
        assert_ledger_matches(&store, "newcomer");
    }

    #[test]
    fn test_insufficient_balance_writes_nothing() {
        let store = LedgerStore::new_in_memory(FeeSchedule::default(), 1.0).unwrap();
        let err = store
            .create_position(&input("pauper", "btcusdt", PositionSide::Long, 0.1, 50_000.0))
            .unwrap_err();

        assert!(matches!(err, TradingError::InsufficientBalance { .. }));
        assert!(store.get_trading_account("pauper").unwrap().is_none());
        assert!(store.list_positions("pauper", None).unwrap().is_empty());
        assert!(store.list_ledger("pauper").unwrap().is_empty());
    }

    #[test]
    fn test_validation_rejected_before_any_write() {
        let store = store();
        let mut bad = input("alice", "btcusdt", PositionSide::Short, 0.1, 50_000.0);
        bad.take_profit = Some(51_000.0);

        assert!(matches!(
            store.create_position(&bad).unwrap_err(),
            TradingError::Validation(_)
        ));
        assert!(store.get_trading_account("alice").unwrap().is_none());
    }
}
