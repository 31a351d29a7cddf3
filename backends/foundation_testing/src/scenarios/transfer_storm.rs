//! Concurrent transfers between a ring of accounts.

use std::sync::Arc;

use foundation_synckit::{transfer, Account, CancelToken};

use crate::stress::{StressConfig, StressError, StressHarness, StressResult};

/// Many workers moving money between the same accounts in opposite
/// directions at once, the pattern that deadlocks with naive lock
/// ordering.
///
/// # Examples
///
/// ```
/// use foundation_synckit::CancelToken;
/// use foundation_testing::scenarios::TransferStorm;
///
/// let storm = TransferStorm::new(&[100, 200, 300]).workers(6).rounds(200);
/// let report = storm.run(&CancelToken::new()).unwrap();
///
/// assert_eq!(report.final_total, report.initial_total);
/// assert_eq!(report.completed, 1200);
/// ```
pub struct TransferStorm {
    accounts: Vec<Arc<Account>>,
    workers: usize,
    rounds: usize,
    amount: i64,
}

/// What a storm did to the accounts.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub initial_total: i64,
    pub final_total: i64,
    pub completed: usize,
    pub aborted: usize,
    pub result: StressResult,
}

impl TransferStorm {
    /// Creates one account per balance.
    ///
    /// # Panics
    ///
    /// Panics if fewer than two balances are given.
    #[must_use]
    pub fn new(balances: &[i64]) -> Self {
        assert!(balances.len() >= 2, "a transfer storm needs at least two accounts");
        Self {
            accounts: balances.iter().map(|b| Arc::new(Account::new(*b))).collect(),
            workers: 8,
            rounds: 1000,
            amount: 1,
        }
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn rounds(mut self, rounds: usize) -> Self {
        self.rounds = rounds;
        self
    }

    #[must_use]
    pub fn amount(mut self, amount: i64) -> Self {
        self.amount = amount;
        self
    }

    #[must_use]
    pub fn accounts(&self) -> &[Arc<Account>] {
        &self.accounts
    }

    fn total(&self) -> Result<i64, StressError> {
        let mut total = 0;
        for account in &self.accounts {
            total += account.balance()?;
        }
        Ok(total)
    }

    /// Runs the storm; `cancel` aborts transfers that have not yet locked
    /// both of their accounts.
    ///
    /// # Errors
    ///
    /// See [`StressHarness::run`].
    pub fn run(&self, cancel: &CancelToken) -> Result<TransferReport, StressError> {
        let initial_total = self.total()?;

        let accounts = self.accounts.clone();
        let (count, amount, cancel) = (accounts.len(), self.amount, cancel.clone());
        let config = StressConfig::new()
            .threads(self.workers)
            .iterations(self.rounds);

        let result = StressHarness::new(config).run(move |worker, round| {
            // Offset is in 1..count, so source and target always differ.
            let from = (worker + round) % count;
            let to = (from + 1 + worker % (count - 1)) % count;
            let (from, to) = if worker % 2 == 0 { (from, to) } else { (to, from) };

            match transfer(&accounts[from], &accounts[to], amount, &cancel) {
                Ok(()) => true,
                Err(err) if err.is_aborted() => false,
                Err(err) => {
                    tracing::error!("transfer storm: {err}");
                    false
                }
            }
        })?;

        Ok(TransferReport {
            initial_total,
            final_total: self.total()?,
            completed: result.successes,
            aborted: result.failures,
            result,
        })
    }
}
