use std::fs::File;
use std::io::{stdout, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;

use crate::application::{LedgerService, TransferPolicy};
use crate::domain::{format_amount, parse_amount, AccountId, Currency, TransferResult};
use crate::io::{ExportFormat, Exporter};
use crate::storage::DbConfig;

/// simplebank - double-entry money transfers between accounts
#[derive(Parser)]
#[command(name = "simplebank")]
#[command(about = "Move money between accounts with a double-entry ledger")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "DB_SOURCE", default_value = "simplebank.db")]
    pub database: String,

    /// Connections in the database pool
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// Tries per transfer when the database reports a conflict
    #[arg(long, env = "TRANSFER_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Deadline for one transfer transaction, in milliseconds
    #[arg(long, env = "TRANSFER_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Account management commands
    #[command(subcommand)]
    Account(AccountCommands),

    /// Move money between two accounts
    Transfer {
        /// Amount to transfer (e.g., "50.00" or "50")
        amount: String,

        /// Source account id
        #[arg(long)]
        from: AccountId,

        /// Destination account id
        #[arg(long)]
        to: AccountId,

        /// Currency both accounts must hold
        #[arg(short, long)]
        currency: Currency,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the entries of an account
    Entries {
        /// Account id
        account: AccountId,
    },

    /// List transfers
    Transfers {
        /// Only transfers touching this account
        #[arg(long)]
        account: Option<AccountId>,
    },

    /// Verify ledger integrity
    Check,

    /// Export data to CSV or JSON
    Export {
        /// What to export: accounts, entries, transfers
        export_type: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,

        /// Format: csv, json
        #[arg(short, long, default_value = "csv")]
        format: ExportFormat,

        /// Restrict entries or transfers to one account
        #[arg(long)]
        account: Option<AccountId>,
    },

    /// Run concurrent transfers in both directions between two accounts
    Stress {
        /// First account id
        #[arg(long)]
        from: AccountId,

        /// Second account id
        #[arg(long)]
        to: AccountId,

        /// Total number of transfers
        #[arg(short = 'n', long, default_value_t = 100)]
        transfers: usize,

        /// Transfers in flight at once
        #[arg(short, long, default_value_t = 10)]
        concurrency: usize,

        /// Amount per transfer, in the accounts' currency
        #[arg(short, long, default_value = "0.01")]
        amount: String,
    },
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Open a new account
    Create {
        /// Account owner
        #[arg(short, long)]
        owner: String,

        /// Currency code (USD, EUR, CAD, VND, JPY, AUD)
        #[arg(short, long, default_value = "USD")]
        currency: Currency,

        /// Opening balance (e.g., "100.00")
        #[arg(short, long, default_value = "0")]
        balance: String,
    },

    /// Show one account
    Show {
        /// Account id
        id: AccountId,
    },

    /// List accounts
    List {
        /// Only accounts of this owner
        #[arg(long)]
        owner: Option<String>,
    },
}

impl Cli {
    fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.database).max_connections(self.max_connections)
    }

    fn policy(&self) -> TransferPolicy {
        TransferPolicy::default()
            .max_attempts(self.max_attempts)
            .timeout(self.timeout_ms.map(Duration::from_millis))
    }

    async fn service(&self) -> Result<LedgerService> {
        LedgerService::open(&self.db_config(), self.policy())
            .await
            .with_context(|| {
                format!(
                    "Failed to open database '{}' (run `simplebank init` first)",
                    self.database
                )
            })
    }

    pub async fn run(self) -> Result<()> {
        if matches!(self.command, Commands::Init) {
            let config = self.db_config().create_if_missing(true);
            let service = LedgerService::open(&config, self.policy()).await?;
            service.close().await;
            println!("Database initialized: {}", self.database);
            return Ok(());
        }

        let service = self.service().await?;
        let result = run_command(&service, self.command).await;
        service.close().await;
        result
    }
}

async fn run_command(service: &LedgerService, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {}

        Commands::Account(account_cmd) => run_account_command(service, account_cmd).await?,

        Commands::Transfer {
            amount,
            from,
            to,
            currency,
            json,
        } => {
            let amount = parse_amount(&amount, currency)
                .with_context(|| format!("Invalid amount format for {}", currency))?;
            let result = service.transfer(from, to, amount, currency).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_transfer_result(&result, currency);
            }
        }

        Commands::Entries { account } => run_entries_command(service, account).await?,

        Commands::Transfers { account } => run_transfers_command(service, account).await?,

        Commands::Check => run_check_command(service).await?,

        Commands::Export {
            export_type,
            output,
            format,
            account,
        } => run_export_command(service, &export_type, output.as_deref(), format, account).await?,

        Commands::Stress {
            from,
            to,
            transfers,
            concurrency,
            amount,
        } => run_stress_command(service, from, to, transfers, concurrency, &amount).await?,
    }
    Ok(())
}

async fn run_account_command(service: &LedgerService, cmd: AccountCommands) -> Result<()> {
    match cmd {
        AccountCommands::Create {
            owner,
            currency,
            balance,
        } => {
            let balance = parse_amount(&balance, currency).context("Invalid opening balance")?;
            let account = service.create_account(&owner, currency, balance).await?;
            println!(
                "Created account {}: {} ({} {})",
                account.id,
                account.owner,
                format_amount(account.balance, account.currency),
                account.currency
            );
        }

        AccountCommands::Show { id } => {
            let account = service.get_account(id).await?;
            let entries = service.list_entries(id).await?;
            println!("Account: {}", account.id);
            println!("  Owner:    {}", account.owner);
            println!("  Currency: {}", account.currency);
            println!(
                "  Balance:  {}",
                format_amount(account.balance, account.currency)
            );
            println!("  Entries:  {}", entries.len());
            println!(
                "  Created:  {}",
                account.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }

        AccountCommands::List { owner } => {
            let accounts = service.list_accounts(owner.as_deref()).await?;
            if accounts.is_empty() {
                println!("No accounts found.");
            } else {
                println!(
                    "{:>6} {:<20} {:>14} {:<8}",
                    "ID", "OWNER", "BALANCE", "CURRENCY"
                );
                println!("{}", "-".repeat(51));
                for account in accounts {
                    println!(
                        "{:>6} {:<20} {:>14} {:<8}",
                        account.id,
                        truncate(&account.owner, 20),
                        format_amount(account.balance, account.currency),
                        account.currency
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_transfer_result(result: &TransferResult, currency: Currency) {
    println!(
        "Transfer {}: {} {} from account {} to account {}",
        result.transfer.id,
        format_amount(result.transfer.amount, currency),
        currency,
        result.transfer.from_account_id,
        result.transfer.to_account_id
    );
    println!(
        "  Account {} balance: {}",
        result.from_account.id,
        format_amount(result.from_account.balance, currency)
    );
    println!(
        "  Account {} balance: {}",
        result.to_account.id,
        format_amount(result.to_account.balance, currency)
    );
}

async fn run_entries_command(service: &LedgerService, account_id: AccountId) -> Result<()> {
    let account = service.get_account(account_id).await?;
    let entries = service.list_entries(account_id).await?;

    if entries.is_empty() {
        println!("No entries found.");
        return Ok(());
    }

    println!("{:>8} {:<20} {:>14}", "ID", "DATE", "AMOUNT");
    println!("{}", "-".repeat(44));
    for entry in &entries {
        println!(
            "{:>8} {:<20} {:>14}",
            entry.id,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            format_amount(entry.amount, account.currency)
        );
    }
    println!("{}", "-".repeat(44));
    println!(
        "{:>8} {:<20} {:>14}",
        "",
        "BALANCE",
        format_amount(account.balance, account.currency)
    );
    Ok(())
}

async fn run_transfers_command(service: &LedgerService, account: Option<AccountId>) -> Result<()> {
    let transfers = service.list_transfers(account).await?;

    if transfers.is_empty() {
        println!("No transfers found.");
        return Ok(());
    }

    println!(
        "{:>8} {:<20} {:>8} {:>8} {:>12}",
        "ID", "DATE", "FROM", "TO", "AMOUNT"
    );
    println!("{}", "-".repeat(60));
    for transfer in &transfers {
        println!(
            "{:>8} {:<20} {:>8} {:>8} {:>12}",
            transfer.id,
            transfer.created_at.format("%Y-%m-%d %H:%M:%S"),
            transfer.from_account_id,
            transfer.to_account_id,
            transfer.amount
        );
    }
    Ok(())
}

async fn run_check_command(service: &LedgerService) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = service.check_integrity().await?;

    println!("Accounts:  {}", report.account_count);
    println!("Transfers: {}", report.transfer_count);
    println!("Entries:   {}", report.entry_count);
    println!();

    println!("Balance by currency:");
    for (currency, balance) in &report.balance_by_currency {
        println!(
            "  {:<6} {:>16}",
            format!("{}:", currency),
            format_amount(*balance, *currency)
        );
    }
    println!(
        "  {:<6} {:>16}  {}",
        "Net:",
        report.entry_net,
        if report.entry_net == 0 {
            "OK"
        } else {
            "UNBALANCED!"
        }
    );
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("Ledger integrity check failed");
    }

    Ok(())
}

async fn run_export_command(
    service: &LedgerService,
    export_type: &str,
    output: Option<&str>,
    format: ExportFormat,
    account: Option<AccountId>,
) -> Result<()> {
    let exporter = Exporter::new(service);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    let count = match export_type {
        "accounts" => exporter.export_accounts(writer, format).await?,
        "entries" => exporter.export_entries(writer, format, account).await?,
        "transfers" => exporter.export_transfers(writer, format, account).await?,
        _ => {
            anyhow::bail!(
                "Invalid export type '{}'. Valid types: accounts, entries, transfers",
                export_type
            );
        }
    };

    if output.is_some() {
        eprintln!("Exported {} {}", count, export_type);
    }
    Ok(())
}

/// Even-numbered transfers go `first -> second`, odd ones the other way, so
/// both lock orders are requested at the same time.
async fn run_stress_command(
    service: &LedgerService,
    first: AccountId,
    second: AccountId,
    transfers: usize,
    concurrency: usize,
    amount: &str,
) -> Result<()> {
    let account = service.get_account(first).await?;
    let currency = account.currency;
    let amount = parse_amount(amount, currency).context("Invalid amount")?;
    let concurrency = concurrency.clamp(1, transfers.max(1));

    println!(
        "Running {} transfers of {} {} between accounts {} and {} ({} workers)...",
        transfers,
        format_amount(amount, currency),
        currency,
        first,
        second,
        concurrency
    );

    let started = Instant::now();
    let mut workers = JoinSet::new();
    for worker in 0..concurrency {
        let service = service.clone();
        workers.spawn(async move {
            let mut failures = Vec::new();
            for n in (worker..transfers).step_by(concurrency) {
                let (from, to) = if n % 2 == 0 {
                    (first, second)
                } else {
                    (second, first)
                };
                if let Err(err) = service.transfer(from, to, amount, currency).await {
                    failures.push(err);
                }
            }
            failures
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = workers.join_next().await {
        failures.extend(joined.context("Stress worker panicked")?);
    }
    let elapsed = started.elapsed();

    let metrics = service.metrics();
    println!();
    println!("Elapsed:          {:.2?}", elapsed);
    println!("Transfers:        {}", metrics.transfers_total);
    println!("Succeeded:        {}", metrics.transfers_succeeded);
    println!("Failed:           {}", metrics.transfers_failed);
    println!("Conflict retries: {}", metrics.conflicts_retried);
    println!("Success rate:     {:.2}%", metrics.success_rate());
    println!("Average latency:  {:.2?}", metrics.average_latency());

    if !failures.is_empty() {
        println!("\nFailures:");
        for err in failures.iter().take(10) {
            println!("  - {}", err);
        }
        if failures.len() > 10 {
            println!("  ... and {} more", failures.len() - 10);
        }
    }

    let from_account = service.get_account(first).await?;
    let to_account = service.get_account(second).await?;
    println!();
    println!(
        "Account {} balance: {}",
        from_account.id,
        format_amount(from_account.balance, currency)
    );
    println!(
        "Account {} balance: {}",
        to_account.id,
        format_amount(to_account.balance, currency)
    );
    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
