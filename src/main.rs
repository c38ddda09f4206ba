use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[macro_use]
extern crate log;

use anyhow::{bail, Context};
use clap::Parser;
use rust_decimal::Decimal;
use serde::Deserialize;

mod features;
use features::{
    Account, AccountNumber, Cancellation, EngineConfig, Store, TransferEngine, TransferRequest,
    DEFAULT_INITIAL_CREDIT,
};

/// Applies a batch of credit transfers to a set of accounts and prints the resulting balances.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// CSV of `account_number, balance`. An empty balance opens the account with the initial credit
    #[clap(long)]
    accounts: PathBuf,

    /// CSV of `sender_account, receiver_account, amount`
    #[clap(long)]
    transfers: PathBuf,

    /// Threads applying transfers concurrently. Rows are not applied in file order
    #[clap(long, default_value_t = 4)]
    workers: usize,

    /// Write the recorded transactions to this file as JSON
    #[clap(long)]
    ledger: Option<PathBuf>,

    #[clap(long, default_value_t = DEFAULT_INITIAL_CREDIT)]
    initial_credit: Decimal,

    /// Stop starting new transfers once one is left waiting on reconciliation
    #[clap(long)]
    halt_on_inconsistency: bool,

    #[clap(long, default_value_t = 2000)]
    lock_timeout_ms: u64,

    #[clap(long, default_value_t = 5000)]
    persist_timeout_ms: u64,

    #[clap(long, default_value_t = 3)]
    persist_retries: u32,

    #[clap(long, default_value_t = 3)]
    conflict_retries: u32,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            persist_timeout: Duration::from_millis(self.persist_timeout_ms),
            persist_retries: self.persist_retries.max(1),
            conflict_retries: self.conflict_retries.max(1),
            ..EngineConfig::default()
        }
    }
}

#[derive(Deserialize, Debug)]
struct OpeningBalance {
    account_number: AccountNumber,
    balance: Option<Decimal>,
}

/// Amount is kept as written so a bad value rejects its own row only.
#[derive(Deserialize, Debug)]
struct TransferRow {
    sender_account: AccountNumber,
    receiver_account: AccountNumber,
    amount: String,
}

/// Outcome counts of one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Tally {
    applied: usize,
    rejected: usize,
    failed: usize,
}

impl Tally {
    fn merge(self, other: Tally) -> Tally {
        Tally {
            applied: self.applied + other.applied,
            rejected: self.rejected + other.rejected,
            failed: self.failed + other.failed,
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match run(&args, io::stdout()) {
        Ok(tally) => info!(
            "{} applied, {} rejected, {} failed",
            tally.applied, tally.rejected, tally.failed
        ),
        Err(e) => {
            error!("{e:#}");
            process::exit(1);
        }
    }
}

fn reader(path: &Path) -> anyhow::Result<csv::Reader<File>> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(b',')
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Unable to open {}", path.display()))
}

fn run(args: &Args, out: impl Write) -> anyhow::Result<Tally> {
    let store = Arc::new(Store::new());

    for result in reader(&args.accounts)?.deserialize() {
        let opening: OpeningBalance = result.context("Malformed account row")?;
        let balance = opening.balance.unwrap_or(args.initial_credit);
        let account = store
            .open_account(opening.account_number, balance)
            .context("Unable to open account")?;
        debug!(
            "Opened account {} with {}",
            account.account_number(),
            account.balance()
        );
    }

    let (requests, unreadable) = load_transfers(&args.transfers)?;

    let opening_total = store.total_balance();
    let engine = TransferEngine::new(store.clone(), store.clone(), args.engine_config());
    let tally = apply(
        &engine,
        &requests,
        args.workers,
        &Cancellation::new(),
        args.halt_on_inconsistency,
    );
    let tally = Tally {
        rejected: tally.rejected + unreadable,
        ..tally
    };

    let report = engine.reconcile();
    for entry in engine.pending_reconciliations() {
        error!(
            "Transfer {} still needs repair after failing to {}: {}",
            entry.transaction_id, entry.stage, entry.reason
        );
    }
    debug!(
        "Reconciliation repaired {}, {} still pending",
        report.repaired.len(),
        report.still_pending.len()
    );

    check_conservation(
        opening_total,
        store.total_balance(),
        engine.reconciliation_backlog(),
    )?;

    write_balances(out, &store.accounts())?;

    if let Some(path) = &args.ledger {
        let file = File::create(path)
            .with_context(|| format!("Unable to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &store.transactions())
            .context("Unable to write ledger")?;
    }

    Ok(tally)
}

/// Reads every transfer row. Unreadable rows are logged and counted, never fatal.
fn load_transfers(path: &Path) -> anyhow::Result<(Vec<TransferRequest>, usize)> {
    let mut requests = Vec::new();
    let mut unreadable = 0;

    for (index, result) in reader(path)?.deserialize::<TransferRow>().enumerate() {
        // Header is line 1
        let line = index + 2;
        let parsed = result.map_err(anyhow::Error::from).and_then(|row| {
            TransferRequest::parse(row.sender_account, row.receiver_account, &row.amount)
                .map_err(anyhow::Error::from)
        });
        match parsed {
            Ok(request) => requests.push(request),
            Err(e) => {
                warn!("Skipping transfer on line {line}: {e}");
                unreadable += 1;
            }
        }
    }

    Ok((requests, unreadable))
}

/// Spreads the requests over at most `workers` threads, so rows run in no particular
/// order. Rejections are logged and skipped.
fn apply(
    engine: &TransferEngine,
    requests: &[TransferRequest],
    workers: usize,
    cancellation: &Cancellation,
    halt_on_inconsistency: bool,
) -> Tally {
    let workers = workers.clamp(1, requests.len().max(1));
    let chunk = (requests.len() + workers - 1) / workers;
    if chunk == 0 {
        return Tally::default();
    }

    thread::scope(|s| {
        let handles: Vec<_> = requests
            .chunks(chunk)
            .map(|batch| {
                s.spawn(move || {
                    let mut tally = Tally::default();
                    for request in batch {
                        let outcome = if halt_on_inconsistency {
                            engine.transfer_cancellable(request, cancellation)
                        } else {
                            engine.transfer(request)
                        };
                        match outcome {
                            Ok(tx) => {
                                debug!(
                                    "Recorded {} from {} to {}",
                                    tx.id(),
                                    tx.sender_id(),
                                    tx.receiver_id()
                                );
                                tally.applied += 1;
                            }
                            Err(e) if e.is_rejection() => {
                                warn!("Rejected: {e}");
                                tally.rejected += 1;
                            }
                            Err(e) if e.needs_investigation() => {
                                error!("{e}");
                                if halt_on_inconsistency {
                                    cancellation.cancel();
                                }
                                tally.failed += 1;
                            }
                            Err(e) => {
                                warn!("{e} (retryable: {})", e.is_retryable());
                                tally.failed += 1;
                            }
                        }
                    }
                    tally
                })
            })
            .collect();

        handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .fold(Tally::default(), Tally::merge)
    })
}

fn check_conservation(opening: Decimal, closing: Decimal, backlog: usize) -> anyhow::Result<()> {
    // Parked transfers legitimately leave the total off until repaired
    if backlog == 0 && closing != opening {
        bail!("Total credit changed from {opening} to {closing}");
    }
    Ok(())
}

fn write_balances(out: impl Write, accounts: &[Account]) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    for account in accounts {
        wtr.serialize(account)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::fs;
    use tempfile::TempDir;

    fn args(dir: &TempDir, accounts: &str, transfers: &str) -> Args {
        let accounts_path = dir.path().join("accounts.csv");
        let transfers_path = dir.path().join("transfers.csv");
        fs::write(&accounts_path, format!("account_number, balance\n{accounts}")).unwrap();
        fs::write(
            &transfers_path,
            format!("sender_account, receiver_account, amount\n{transfers}"),
        )
        .unwrap();

        Args {
            accounts: accounts_path,
            transfers: transfers_path,
            workers: 2,
            ledger: None,
            initial_credit: DEFAULT_INITIAL_CREDIT,
            halt_on_inconsistency: false,
            lock_timeout_ms: 500,
            persist_timeout_ms: 500,
            persist_retries: 3,
            conflict_retries: 3,
        }
    }

    fn balances(out: Vec<u8>) -> Vec<(String, String)> {
        let mut rdr = csv::Reader::from_reader(out.as_slice());
        rdr.records()
            .map(|r| {
                let r = r.unwrap();
                (r[1].to_string(), r[2].to_string())
            })
            .collect()
    }

    #[test]
    fn bad_rows_do_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(
            &dir,
            "A, 100\nB, 0\n",
            "A, B, 10\nA, B, NaN\nA, B, ten\nA, B\nA, B, inf\n",
        );

        let mut out = Vec::new();
        let tally = run(&args, &mut out).unwrap();

        assert_eq!(
            tally,
            Tally {
                applied: 1,
                rejected: 4,
                failed: 0,
            }
        );
        assert_eq!(
            balances(out),
            vec![
                ("A".to_string(), "90".to_string()),
                ("B".to_string(), "10".to_string()),
            ]
        );
    }

    #[test]
    fn missing_balance_gets_initial_credit() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = args(&dir, "A,\nB, 5\n", "A, B, 300\n");
        args.initial_credit = dec!(1000);

        let mut out = Vec::new();
        run(&args, &mut out).unwrap();

        assert_eq!(
            balances(out),
            vec![
                ("A".to_string(), "700".to_string()),
                ("B".to_string(), "305".to_string()),
            ]
        );
    }

    #[test]
    fn engine_rejections_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(
            &dir,
            "A, 50\nB, 0\n",
            "A, B, 0\nA, A, 5\nA, Z, 5\nA, B, 51\nA, B, 20.5\n",
        );

        let mut out = Vec::new();
        let tally = run(&args, &mut out).unwrap();

        assert_eq!(tally.applied, 1);
        assert_eq!(tally.rejected, 4);
        assert_eq!(
            balances(out),
            vec![
                ("A".to_string(), "29.5".to_string()),
                ("B".to_string(), "20.5".to_string()),
            ]
        );
    }

    #[test]
    fn ledger_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = args(&dir, "A, 1000\nB, 500\n", "A, B, 300\n");
        let ledger = dir.path().join("ledger.json");
        args.ledger = Some(ledger.clone());

        run(&args, io::sink()).unwrap();

        let entries: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(ledger).unwrap()).unwrap();
        let entries = entries.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["sender"], 1);
        assert_eq!(entries[0]["receiver"], 2);
        assert_eq!(entries[0]["amount"], "300");
    }

    #[test]
    fn duplicate_account_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(&dir, "A, 1\nA, 2\n", "");
        assert!(run(&args, io::sink()).is_err());
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = args(&dir, "A, 1\n", "");
        args.transfers = dir.path().join("absent.csv");
        let err = run(&args, io::sink()).unwrap_err();
        assert!(format!("{err:#}").contains("Unable to open"));
    }

    #[test]
    fn conservation_mismatch_is_fatal_unless_repairs_pending() {
        assert!(check_conservation(dec!(100), dec!(100), 0).is_ok());
        assert!(check_conservation(dec!(100), dec!(99), 0).is_err());
        assert!(check_conservation(dec!(100), dec!(99), 1).is_ok());
    }

    #[test]
    fn oversized_worker_count_is_clamped() {
        let store = Arc::new(Store::new());
        store.open_account("A".into(), dec!(10)).unwrap();
        store.open_account("B".into(), dec!(0)).unwrap();
        let engine = TransferEngine::new(store.clone(), store.clone(), EngineConfig::default());
        let requests = vec![TransferRequest::parse("A", "B", "4").unwrap()];

        let tally = apply(&engine, &requests, usize::MAX, &Cancellation::new(), false);
        assert_eq!(tally.applied, 1);

        let tally = apply(&engine, &[], usize::MAX, &Cancellation::new(), false);
        assert_eq!(tally, Tally::default());
    }

    #[test]
    fn cancelled_batch_writes_nothing() {
        let store = Arc::new(Store::new());
        store.open_account("A".into(), dec!(10)).unwrap();
        store.open_account("B".into(), dec!(0)).unwrap();
        let engine = TransferEngine::new(store.clone(), store.clone(), EngineConfig::default());
        let requests = vec![
            TransferRequest::parse("A", "B", "1").unwrap(),
            TransferRequest::parse("B", "A", "1").unwrap(),
        ];
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let tally = apply(&engine, &requests, 2, &cancellation, true);

        assert_eq!(tally.rejected, 2);
        assert!(store.transactions().is_empty());
        assert_eq!(store.total_balance(), dec!(10));
    }
}
