use std::collections::BTreeMap;

use serde::Serialize;

use super::{Account, Cents, Currency};

/// Raw counters gathered from the store for an integrity check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityStats {
    pub account_count: i64,
    pub transfer_count: i64,
    pub entry_count: i64,
    /// Sum of every entry amount. Transfers only ever write offsetting pairs.
    pub entry_net: Cents,
    pub invalid_amounts: i64,
    pub dangling_transfers: i64,
}

/// Result of verifying the ledger's structural invariants.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub account_count: i64,
    pub transfer_count: i64,
    pub entry_count: i64,
    pub balance_by_currency: BTreeMap<Currency, Cents>,
    pub entry_net: Cents,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Sum balances per currency. Transfers between same-currency accounts leave
/// each total unchanged.
pub fn total_by_currency(accounts: &[Account]) -> BTreeMap<Currency, Cents> {
    accounts.iter().fold(BTreeMap::new(), |mut totals, account| {
        *totals.entry(account.currency).or_insert(0) += account.balance;
        totals
    })
}

pub fn build_integrity_report(accounts: &[Account], stats: &IntegrityStats) -> IntegrityReport {
    let mut issues = Vec::new();

    if stats.entry_count != stats.transfer_count * 2 {
        issues.push(format!(
            "{} entries recorded for {} transfers (expected {})",
            stats.entry_count,
            stats.transfer_count,
            stats.transfer_count * 2
        ));
    }
    if stats.entry_net != 0 {
        issues.push(format!(
            "entries do not net to zero (net {})",
            stats.entry_net
        ));
    }
    if stats.invalid_amounts > 0 {
        issues.push(format!(
            "{} transfers with a non-positive amount",
            stats.invalid_amounts
        ));
    }
    if stats.dangling_transfers > 0 {
        issues.push(format!(
            "{} transfers reference missing accounts",
            stats.dangling_transfers
        ));
    }

    IntegrityReport {
        account_count: stats.account_count,
        transfer_count: stats.transfer_count,
        entry_count: stats.entry_count,
        balance_by_currency: total_by_currency(accounts),
        entry_net: stats.entry_net,
        issues,
    }
}
