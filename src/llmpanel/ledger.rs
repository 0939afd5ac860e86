//! Persistent usage ledger with a budget circuit breaker.
//!
//! Every dispatched call becomes a [`Transaction`] carrying its *estimated* cost and,
//! when the provider reports usage, its *actual* cost. The ledger answers spend
//! aggregates, estimate drift statistics, and refuses new calls once the trailing
//! hour or day would exceed its ceiling.
//!
//! # Disk Format
//!
//! Records are newline-delimited JSON, append-only. Backfilling an actual cost does
//! not rewrite earlier lines; it appends a reconciliation record that is applied
//! when the file is loaded:
//!
//! ```text
//! {"kind":"transaction","id":"6f1c…","timestamp":"2025-07-01T12:00:00Z","model":"gpt-4o","provider":"openai","input_tokens":120,"output_tokens":800,"estimated_cost":0.0083,"actual_cost":null,"context":"session:…:reviewer"}
//! {"kind":"reconciliation","id":"6f1c…","actual_cost":0.0071,"timestamp":"2025-07-01T12:00:03Z"}
//! ```
//!
//! # Example
//!
//! ```rust
//! use llmpanel::ledger::{BudgetConfig, Transaction, UsageLedger};
//!
//! let ledger = UsageLedger::in_memory(BudgetConfig::new(Some(1.0), Some(10.0)));
//! ledger.check_budget(0.25).unwrap();
//! ledger
//!     .record(Transaction::new("gpt-4o", "openai", 100, 500, 0.25, "example"))
//!     .unwrap();
//! assert_eq!(ledger.average_drift_pct(), None);
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

/// File name used by [`UsageLedger::open`].
pub const LEDGER_FILE_NAME: &str = "usage_ledger.jsonl";

/// Tolerance for floating point spend comparisons, far below one cent.
const BUDGET_EPSILON: f64 = 1e-9;

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub estimated_cost: f64,
    pub actual_cost: Option<f64>,
    /// Free-text tag describing what the call was for.
    pub context: String,
}

impl Transaction {
    pub fn new(
        model: impl Into<String>,
        provider: impl Into<String>,
        input_tokens: usize,
        output_tokens: usize,
        estimated_cost: f64,
        context: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            model: model.into(),
            provider: provider.into(),
            input_tokens,
            output_tokens,
            estimated_cost,
            actual_cost: None,
            context: context.into(),
        }
    }

    pub fn with_actual_cost(mut self, actual_cost: f64) -> Self {
        self.actual_cost = Some(actual_cost);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The cost counted against budgets: actual when reconciled, otherwise the estimate.
    pub fn effective_cost(&self) -> f64 {
        self.actual_cost.unwrap_or(self.estimated_cost)
    }

    /// Percentage by which the actual cost deviated from the estimate.
    pub fn drift_pct(&self) -> Option<f64> {
        let actual = self.actual_cost?;
        if self.estimated_cost <= 0.0 {
            return None;
        }
        Some((actual - self.estimated_cost) / self.estimated_cost * 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LedgerRecord {
    Transaction(Transaction),
    Reconciliation {
        id: Uuid,
        actual_cost: f64,
        timestamp: DateTime<Utc>,
    },
}

/// Budget ceilings in dollars; `None` disables the corresponding check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub hourly_limit: Option<f64>,
    pub daily_limit: Option<f64>,
}

impl BudgetConfig {
    pub fn new(hourly_limit: Option<f64>, daily_limit: Option<f64>) -> Self {
        Self {
            hourly_limit,
            daily_limit,
        }
    }

    /// No ceilings at all.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_hourly_limit(mut self, dollars: f64) -> Self {
        self.hourly_limit = Some(dollars);
        self
    }

    pub fn with_daily_limit(mut self, dollars: f64) -> Self {
        self.daily_limit = Some(dollars);
        self
    }
}

/// Trailing period a ceiling applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetPeriod {
    Hourly,
    Daily,
}

impl BudgetPeriod {
    fn span(&self) -> Duration {
        match self {
            BudgetPeriod::Hourly => Duration::hours(1),
            BudgetPeriod::Daily => Duration::days(1),
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetPeriod::Hourly => write!(f, "hourly"),
            BudgetPeriod::Daily => write!(f, "daily"),
        }
    }
}

/// A call would push trailing spend past a ceiling.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{period} budget exceeded: ${current_spend:.4} spent + ${estimated_cost:.4} requested > ${ceiling:.4} ceiling")]
pub struct BudgetExceeded {
    pub period: BudgetPeriod,
    /// Spend recorded in the trailing period plus estimates reserved by in-flight calls.
    pub current_spend: f64,
    /// Estimated cost of the refused call.
    pub estimated_cost: f64,
    pub ceiling: f64,
}

/// Spend in the trailing hour and day against the configured ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub hourly_spend: f64,
    pub daily_spend: f64,
    pub hourly_limit: Option<f64>,
    pub daily_limit: Option<f64>,
}

impl BudgetStatus {
    pub fn hourly_remaining(&self) -> Option<f64> {
        self.hourly_limit.map(|l| (l - self.hourly_spend).max(0.0))
    }

    pub fn daily_remaining(&self) -> Option<f64> {
        self.daily_limit.map(|l| (l - self.daily_spend).max(0.0))
    }

    /// Whether any configured ceiling has been reached.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.hourly_remaining(), Some(r) if r <= BUDGET_EPSILON)
            || matches!(self.daily_remaining(), Some(r) if r <= BUDGET_EPSILON)
    }
}

/// Aggregate report over the whole ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub transaction_count: usize,
    /// Sum of effective costs (actual where reconciled, otherwise estimated).
    pub total_spend: f64,
    pub total_estimated: f64,
    /// Sum of actual costs over reconciled rows only.
    pub total_actual: f64,
    pub average_drift_pct: Option<f64>,
    pub by_model: HashMap<String, f64>,
    pub by_provider: HashMap<String, f64>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("ledger record could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no transaction with id {0}")]
    UnknownTransaction(Uuid),
}

struct LedgerInner {
    transactions: Vec<Transaction>,
    index: HashMap<Uuid, usize>,
    /// Estimates held by outstanding [`BudgetReservation`]s.
    reserved: HashMap<Uuid, f64>,
    file_path: Option<PathBuf>,
}

impl LedgerInner {
    fn append(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        if let Some(path) = &self.file_path {
            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(path)?;
            // A torn final line from a crashed writer must not swallow this record.
            if ends_mid_line(&mut file)? {
                line.insert(0, '\n');
            }
            // One write per record keeps concurrent appenders from interleaving lines.
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    fn apply(&mut self, record: LedgerRecord) {
        match record {
            LedgerRecord::Transaction(tx) => {
                self.index.insert(tx.id, self.transactions.len());
                self.transactions.push(tx);
            }
            LedgerRecord::Reconciliation {
                id, actual_cost, ..
            } => match self.index.get(&id) {
                Some(&pos) => self.transactions[pos].actual_cost = Some(actual_cost),
                None => log::warn!("UsageLedger: reconciliation for unknown transaction {}", id),
            },
        }
    }

    fn reserved_total(&self) -> f64 {
        self.reserved.values().sum()
    }

    fn record(&mut self, transaction: Transaction) -> Result<Uuid, LedgerError> {
        let id = transaction.id;
        let record = LedgerRecord::Transaction(transaction);
        self.append(&record)?;
        self.apply(record);
        log::debug!("UsageLedger: recorded transaction {}", id);
        Ok(id)
    }

    fn spend_since(&self, since: DateTime<Utc>) -> f64 {
        self.transactions
            .iter()
            .filter(|tx| tx.timestamp > since)
            .map(Transaction::effective_cost)
            .sum()
    }
}

/// Budget held for one in-flight call. Released when recorded or dropped.
#[must_use = "dropping a reservation releases it immediately"]
pub struct BudgetReservation<'a> {
    ledger: &'a UsageLedger,
    id: Uuid,
    amount: f64,
}

impl std::fmt::Debug for BudgetReservation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetReservation")
            .field("id", &self.id)
            .field("amount", &self.amount)
            .finish_non_exhaustive()
    }
}

impl BudgetReservation<'_> {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Record the finished call's transaction and release the reservation in one step.
    pub fn record(self, transaction: Transaction) -> Result<Uuid, LedgerError> {
        let mut inner = self.ledger.lock();
        inner.reserved.remove(&self.id);
        let recorded = inner.record(transaction);
        drop(inner);
        recorded
    }
}

impl Drop for BudgetReservation<'_> {
    fn drop(&mut self) {
        self.ledger.lock().reserved.remove(&self.id);
    }
}

/// Whether the file's last byte is something other than a newline.
fn ends_mid_line(file: &mut fs::File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Append-only transaction log shared by every dispatcher in the process.
pub struct UsageLedger {
    budget: BudgetConfig,
    inner: Mutex<LedgerInner>,
}

impl UsageLedger {
    /// A ledger that lives only in memory.
    pub fn in_memory(budget: BudgetConfig) -> Self {
        Self {
            budget,
            inner: Mutex::new(LedgerInner {
                transactions: Vec::new(),
                index: HashMap::new(),
                reserved: HashMap::new(),
                file_path: None,
            }),
        }
    }

    /// Open (or create) `usage_ledger.jsonl` inside `dir`.
    pub fn open(dir: &Path, budget: BudgetConfig) -> Result<Self, LedgerError> {
        fs::create_dir_all(dir)?;
        Self::open_file(dir.join(LEDGER_FILE_NAME), budget)
    }

    /// Open (or create) a ledger at an explicit file path, loading existing records.
    pub fn open_file(path: impl Into<PathBuf>, budget: BudgetConfig) -> Result<Self, LedgerError> {
        let ledger = Self::in_memory(budget);
        {
            let mut inner = ledger.lock();
            inner.file_path = Some(path.into());
        }
        ledger.reload()?;
        Ok(ledger)
    }

    pub fn budget(&self) -> BudgetConfig {
        self.budget
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.lock().file_path.clone()
    }

    /// Re-read the backing file, picking up records appended by other writers.
    pub fn reload(&self) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        let Some(path) = inner.file_path.clone() else {
            return Ok(());
        };
        inner.transactions.clear();
        inner.index.clear();

        if !path.exists() {
            return Ok(());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerRecord>(&line) {
                Ok(record) => inner.apply(record),
                // Truncated by an interrupted append; the record never completed.
                Err(e) if e.is_eof() => log::warn!(
                    "UsageLedger: skipping incomplete record on line {} of {}: {}",
                    number + 1,
                    path.display(),
                    e
                ),
                Err(e) => return Err(e.into()),
            }
        }
        log::debug!(
            "UsageLedger: loaded {} transaction(s) from {}",
            inner.transactions.len(),
            path.display()
        );
        Ok(())
    }

    /// Append a transaction and return its id.
    pub fn record(&self, transaction: Transaction) -> Result<Uuid, LedgerError> {
        self.lock().record(transaction)
    }

    /// Backfill the provider-reported cost of an earlier transaction.
    pub fn reconcile(&self, id: Uuid, actual_cost: f64) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        if !inner.index.contains_key(&id) {
            return Err(LedgerError::UnknownTransaction(id));
        }
        let record = LedgerRecord::Reconciliation {
            id,
            actual_cost,
            timestamp: Utc::now(),
        };
        inner.append(&record)?;
        inner.apply(record);
        Ok(())
    }

    /// Refuse a call whose estimate would push trailing spend past a ceiling.
    ///
    /// Passes when `spend + estimated_cost` is exactly equal to the ceiling.
    pub fn check_budget(&self, estimated_cost: f64) -> Result<(), BudgetExceeded> {
        self.check_budget_at(estimated_cost, Utc::now())
    }

    /// [`check_budget`](Self::check_budget) evaluated at an explicit instant.
    pub fn check_budget_at(
        &self,
        estimated_cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetExceeded> {
        let inner = self.lock();
        self.evaluate_budget(&inner, estimated_cost, now)
    }

    /// Check the budget and hold `estimated_cost` against it until the returned
    /// reservation is recorded or dropped.
    ///
    /// Concurrent callers see each other's reservations, so a burst of calls can
    /// never jointly overshoot a ceiling.
    pub fn reserve(
        &self,
        estimated_cost: f64,
    ) -> Result<BudgetReservation<'_>, BudgetExceeded> {
        let mut inner = self.lock();
        self.evaluate_budget(&inner, estimated_cost, Utc::now())?;
        let id = Uuid::new_v4();
        inner.reserved.insert(id, estimated_cost);
        Ok(BudgetReservation {
            ledger: self,
            id,
            amount: estimated_cost,
        })
    }

    /// Total estimate currently held by outstanding reservations.
    pub fn reserved(&self) -> f64 {
        self.lock().reserved_total()
    }

    fn evaluate_budget(
        &self,
        inner: &LedgerInner,
        estimated_cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetExceeded> {
        let ceilings = [
            (BudgetPeriod::Hourly, self.budget.hourly_limit),
            (BudgetPeriod::Daily, self.budget.daily_limit),
        ];
        let reserved = inner.reserved_total();
        for (period, ceiling) in ceilings {
            let Some(ceiling) = ceiling else {
                continue;
            };
            let current_spend = inner.spend_since(now - period.span()) + reserved;
            if current_spend + estimated_cost > ceiling + BUDGET_EPSILON {
                let err = BudgetExceeded {
                    period,
                    current_spend,
                    estimated_cost,
                    ceiling,
                };
                log::warn!("UsageLedger: {}", err);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn budget_status(&self) -> BudgetStatus {
        let now = Utc::now();
        let inner = self.lock();
        BudgetStatus {
            hourly_spend: inner.spend_since(now - BudgetPeriod::Hourly.span()),
            daily_spend: inner.spend_since(now - BudgetPeriod::Daily.span()),
            hourly_limit: self.budget.hourly_limit,
            daily_limit: self.budget.daily_limit,
        }
    }

    /// Effective spend since `since`, or over the whole ledger when `None`.
    pub fn total_spend(&self, since: Option<DateTime<Utc>>) -> f64 {
        let inner = self.lock();
        match since {
            Some(since) => inner.spend_since(since),
            None => inner
                .transactions
                .iter()
                .map(Transaction::effective_cost)
                .sum(),
        }
    }

    pub fn spend_by_model(&self) -> HashMap<String, f64> {
        self.group_by(|tx| &tx.model)
    }

    pub fn spend_by_provider(&self) -> HashMap<String, f64> {
        self.group_by(|tx| &tx.provider)
    }

    /// Mean drift between actual and estimated cost, in percent.
    ///
    /// Only reconciled transactions count. Returns `None` when there are none, which
    /// is different from `Some(0.0)` (estimates were exactly right).
    pub fn average_drift_pct(&self) -> Option<f64> {
        let inner = self.lock();
        let drifts: Vec<f64> = inner
            .transactions
            .iter()
            .filter_map(Transaction::drift_pct)
            .collect();
        if drifts.is_empty() {
            None
        } else {
            Some(drifts.iter().sum::<f64>() / drifts.len() as f64)
        }
    }

    pub fn summary(&self) -> LedgerSummary {
        let (transaction_count, total_spend, total_estimated, total_actual) = {
            let inner = self.lock();
            let txs = &inner.transactions;
            (
                txs.len(),
                txs.iter().map(Transaction::effective_cost).sum(),
                txs.iter().map(|tx| tx.estimated_cost).sum(),
                txs.iter().filter_map(|tx| tx.actual_cost).sum(),
            )
        };
        LedgerSummary {
            transaction_count,
            total_spend,
            total_estimated,
            total_actual,
            average_drift_pct: self.average_drift_pct(),
            by_model: self.spend_by_model(),
            by_provider: self.spend_by_provider(),
        }
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock().transactions.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Transaction> {
        let inner = self.lock();
        inner.index.get(&id).map(|&pos| inner.transactions[pos].clone())
    }

    pub fn len(&self) -> usize {
        self.lock().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record, in memory and on disk.
    pub fn clear(&self) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        inner.transactions.clear();
        inner.index.clear();
        if let Some(path) = &inner.file_path {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn group_by<F>(&self, key: F) -> HashMap<String, f64>
    where
        F: Fn(&Transaction) -> &String,
    {
        let inner = self.lock();
        let mut totals: HashMap<String, f64> = HashMap::new();
        for tx in &inner.transactions {
            *totals.entry(key(tx).clone()).or_insert(0.0) += tx.effective_cost();
        }
        totals
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
