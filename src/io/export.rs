use anyhow::Result;
use serde::Serialize;
use std::io::Write;
use std::str::FromStr;

use crate::application::LedgerService;
use crate::domain::AccountId;

/// Output format for exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => anyhow::bail!("Invalid export format '{}'. Valid formats: csv, json", s),
        }
    }
}

/// Exporter for converting ledger data to CSV or JSON.
pub struct Exporter<'a> {
    service: &'a LedgerService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a LedgerService) -> Self {
        Self { service }
    }

    /// Export all accounts with their current balances.
    pub async fn export_accounts<W: Write>(&self, writer: W, format: ExportFormat) -> Result<usize> {
        let accounts = self.service.list_accounts(None).await?;
        if format == ExportFormat::Json {
            return write_json(writer, &accounts);
        }

        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["id", "owner", "currency", "balance", "created_at"])?;
        for account in &accounts {
            csv_writer.write_record([
                account.id.to_string(),
                account.owner.clone(),
                account.currency.to_string(),
                account.balance.to_string(),
                account.created_at.to_rfc3339(),
            ])?;
        }
        csv_writer.flush()?;
        Ok(accounts.len())
    }

    /// Export entries, for one account or the whole ledger.
    pub async fn export_entries<W: Write>(
        &self,
        writer: W,
        format: ExportFormat,
        account_id: Option<AccountId>,
    ) -> Result<usize> {
        let entries = match account_id {
            Some(id) => self.service.list_entries(id).await?,
            None => self.service.list_all_entries().await?,
        };
        if format == ExportFormat::Json {
            return write_json(writer, &entries);
        }

        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["id", "account_id", "amount", "created_at"])?;
        for entry in &entries {
            csv_writer.write_record([
                entry.id.to_string(),
                entry.account_id.to_string(),
                entry.amount.to_string(),
                entry.created_at.to_rfc3339(),
            ])?;
        }
        csv_writer.flush()?;
        Ok(entries.len())
    }

    /// Export transfers, optionally only those touching one account.
    pub async fn export_transfers<W: Write>(
        &self,
        writer: W,
        format: ExportFormat,
        account_id: Option<AccountId>,
    ) -> Result<usize> {
        let transfers = self.service.list_transfers(account_id).await?;
        if format == ExportFormat::Json {
            return write_json(writer, &transfers);
        }

        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record([
            "id",
            "from_account_id",
            "to_account_id",
            "amount",
            "created_at",
        ])?;
        for transfer in &transfers {
            csv_writer.write_record([
                transfer.id.to_string(),
                transfer.from_account_id.to_string(),
                transfer.to_account_id.to_string(),
                transfer.amount.to_string(),
                transfer.created_at.to_rfc3339(),
            ])?;
        }
        csv_writer.flush()?;
        Ok(transfers.len())
    }
}

fn write_json<W: Write, T: Serialize>(mut writer: W, rows: &[T]) -> Result<usize> {
    serde_json::to_writer_pretty(&mut writer, rows)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(rows.len())
}
