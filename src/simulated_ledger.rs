use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ledger::{LedgerClient, LedgerError, LedgerResult, RevertCode, TxOutcome, TxReceipt};
use crate::models::{min_collateral_ratio_wad, mul_div, ratio_percent, Address, TransactionKind, TxHash, U256, WAD};

const SECONDS_PER_YEAR: u64 = 365 * 24 * 60 * 60;
const WRITE_LOG_LIMIT: usize = 1_000;
/// Receipts nobody waited for are dropped this long after mining.
const RECEIPT_RETENTION: Duration = Duration::from_secs(600);

/// Starting balances and timing for a [`SimulatedLedger`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub account: Address,
    pub vault_address: Address,
    pub collateral_wallet_balance: U256,
    pub musd_wallet_balance: U256,
    /// MUSD per unit of collateral, WAD-scaled.
    pub collateral_price: U256,
    /// Annual rate, WAD-scaled percent.
    pub interest_rate: U256,
    /// Time between submission and the receipt becoming available.
    pub confirmation_delay: Duration,
    /// Time after confirmation before reads observe the new state.
    pub read_lag: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            account: Address::new("0x0000000000000000000000000000000000000b0b"),
            vault_address: Address::new("0x00000000000000000000000000000000000ba017"),
            collateral_wallet_balance: U256::from(10u64) * WAD,
            musd_wallet_balance: U256::ZERO,
            collateral_price: U256::from(60_000u64) * WAD,
            interest_rate: U256::ZERO,
            confirmation_delay: Duration::from_millis(200),
            read_lag: Duration::ZERO,
        }
    }
}

/// Vault and wallet balances at one point in ledger history.
#[derive(Debug, Clone)]
struct Book {
    vault_open: bool,
    collateral: U256,
    principal: U256,
    interest: U256,
    collateral_wallet: U256,
    musd_wallet: U256,
    allowance: U256,
    price: U256,
    rate: U256,
}

impl Book {
    fn debt(&self) -> U256 {
        self.principal.saturating_add(self.interest)
    }

    fn ratio_with(&self, collateral: U256, debt: U256) -> U256 {
        let value = mul_div(collateral, self.price, WAD).unwrap_or(U256::MAX);
        ratio_percent(value, debt).unwrap_or(U256::MAX)
    }

    fn collateral_ratio(&self) -> U256 {
        self.ratio_with(self.collateral, self.debt())
    }

    fn max_withdrawable(&self) -> U256 {
        let debt = self.debt();
        if debt.is_zero() {
            return self.collateral;
        }
        if self.price.is_zero() {
            return U256::ZERO;
        }
        let min_percent = U256::from(crate::models::MIN_COLLATERAL_RATIO_PERCENT);
        let hundred = U256::from(100u64);
        // Round the required collateral up so the limit itself stays safe.
        let required_value = (debt.saturating_mul(min_percent) + hundred - U256::from(1u64)) / hundred;
        let required_collateral = (required_value.saturating_mul(WAD) + self.price - U256::from(1u64)) / self.price;
        self.collateral.saturating_sub(required_collateral)
    }
}

struct LedgerState {
    committed: Book,
    initial: Book,
    /// Confirmed books with the instant they were mined.
    commits: Vec<(Instant, Book)>,
    receipts: HashMap<TxHash, (Instant, TxOutcome)>,
    nonce: u64,
    writes: VecDeque<(TransactionKind, U256)>,
    fail_next_write: Option<LedgerError>,
    failing_reads: u32,
}

impl LedgerState {
    /// Records the committed book. Commit times never go backwards, so a
    /// later commit cannot reveal an earlier pending one ahead of time.
    fn record_commit(&mut self, at: Instant) {
        let at = self.commits.last().map_or(at, |(last, _)| (*last).max(at));
        self.commits.push((at, self.committed.clone()));
    }

    /// Drops commits hidden behind a newer one that is already visible.
    fn prune_commits(&mut self, now: Instant, read_lag: Duration) {
        let newest_visible = self
            .commits
            .iter()
            .rposition(|(mined_at, _)| *mined_at + read_lag <= now);
        if let Some(index) = newest_visible {
            self.commits.drain(..index);
        }
    }

    fn prune_receipts(&mut self, now: Instant) {
        self.receipts
            .retain(|_, (mined_at, _)| *mined_at + RECEIPT_RETENTION > now);
    }
}

/// In-process vault ledger enforcing the contract rules.
///
/// Confirmation is delayed by `confirmation_delay` and reads trail confirmed
/// state by `read_lag`, mimicking a lagging RPC replica.
pub struct SimulatedLedger {
    account: Address,
    vault_address: Address,
    confirmation_delay: Duration,
    read_lag: Duration,
    state: Mutex<LedgerState>,
}

impl SimulatedLedger {
    pub fn new(config: SandboxConfig) -> Self {
        let book = Book {
            vault_open: false,
            collateral: U256::ZERO,
            principal: U256::ZERO,
            interest: U256::ZERO,
            collateral_wallet: config.collateral_wallet_balance,
            musd_wallet: config.musd_wallet_balance,
            allowance: U256::ZERO,
            price: config.collateral_price,
            rate: config.interest_rate,
        };
        Self {
            account: config.account,
            vault_address: config.vault_address,
            confirmation_delay: config.confirmation_delay,
            read_lag: config.read_lag,
            state: Mutex::new(LedgerState {
                committed: book.clone(),
                initial: book,
                commits: Vec::new(),
                receipts: HashMap::new(),
                nonce: 0,
                writes: VecDeque::new(),
                fail_next_write: None,
                failing_reads: 0,
            }),
        }
    }

    /// The last writes accepted for submission, oldest first.
    pub async fn writes(&self) -> Vec<(TransactionKind, U256)> {
        self.state.lock().await.writes.iter().cloned().collect()
    }

    /// Makes the next write fail before submission with `error`.
    pub async fn fail_next_write(&self, error: LedgerError) {
        self.state.lock().await.fail_next_write = Some(error);
    }

    /// Makes the next `count` reads fail with a transport error.
    pub async fn fail_reads(&self, count: u32) {
        self.state.lock().await.failing_reads = count;
    }

    pub async fn set_collateral_price(&self, price: U256) {
        let mut state = self.state.lock().await;
        state.committed.price = price;
        state.record_commit(Instant::now());
        info!("Sandbox collateral price set to {}", price);
    }

    /// Accrues simple interest on the principal for `elapsed`.
    pub async fn accrue_interest(&self, elapsed: Duration) {
        let mut state = self.state.lock().await;
        let accrued = mul_div(
            state.committed.principal,
            state.committed.rate.saturating_mul(U256::from(elapsed.as_secs())),
            U256::from(100u64) * WAD * U256::from(SECONDS_PER_YEAR),
        )
        .unwrap_or(U256::ZERO);
        state.committed.interest = state.committed.interest.saturating_add(accrued);
        state.record_commit(Instant::now());
    }

    async fn read<T>(&self, f: impl FnOnce(&Book) -> T) -> LedgerResult<T> {
        let mut state = self.state.lock().await;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(LedgerError::Transport("sandbox read unavailable".to_string()));
        }
        let now = Instant::now();
        state.prune_commits(now, self.read_lag);
        let visible = state
            .commits
            .iter()
            .rev()
            .find(|(mined_at, _)| *mined_at + self.read_lag <= now)
            .map(|(_, book)| book)
            .unwrap_or(&state.initial);
        Ok(f(visible))
    }

    async fn submit(&self, kind: TransactionKind, amount: U256, apply: impl FnOnce(&mut Book) -> Result<(), (Option<RevertCode>, String)>) -> LedgerResult<TxHash> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.fail_next_write.take() {
            return Err(error);
        }

        state.prune_receipts(Instant::now());
        state.nonce += 1;
        if state.writes.len() == WRITE_LOG_LIMIT {
            state.writes.pop_front();
        }
        state.writes.push_back((kind, amount));
        let hash = tx_hash(state.nonce, kind, amount);
        let mined_at = Instant::now() + self.confirmation_delay;

        let mut book = state.committed.clone();
        let outcome = match apply(&mut book) {
            Ok(()) => {
                state.committed = book;
                state.record_commit(mined_at);
                TxOutcome::Confirmed
            }
            Err((code, reason)) => {
                debug!("Sandbox {:?} of {} will revert: {}", kind, amount, reason);
                TxOutcome::Reverted { code, reason }
            }
        };
        state.receipts.insert(hash.clone(), (mined_at, outcome));
        Ok(hash)
    }
}

fn tx_hash(nonce: u64, kind: TransactionKind, amount: U256) -> TxHash {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(format!("{:?}", kind).as_bytes());
    hasher.update(amount.to_be_bytes::<32>());
    TxHash(format!("0x{}", hex::encode(hasher.finalize())))
}

fn revert(code: RevertCode, reason: &str) -> Result<(), (Option<RevertCode>, String)> {
    Err((Some(code), reason.to_string()))
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    fn account(&self) -> Address {
        self.account.clone()
    }

    fn vault_address(&self) -> Address {
        self.vault_address.clone()
    }

    async fn get_collateral_balance(&self, _account: &Address) -> LedgerResult<U256> {
        self.read(|book| book.collateral).await
    }

    async fn get_borrowed_amount(&self, _account: &Address) -> LedgerResult<U256> {
        self.read(|book| book.principal).await
    }

    async fn get_current_debt(&self, _account: &Address) -> LedgerResult<U256> {
        self.read(Book::debt).await
    }

    async fn get_collateral_ratio(&self, _account: &Address) -> LedgerResult<U256> {
        self.read(Book::collateral_ratio).await
    }

    async fn get_interest_rate(&self) -> LedgerResult<U256> {
        self.read(|book| book.rate).await
    }

    async fn get_max_withdrawable(&self, _account: &Address) -> LedgerResult<U256> {
        self.read(Book::max_withdrawable).await
    }

    async fn get_allowance(&self, _owner: &Address, _spender: &Address) -> LedgerResult<U256> {
        self.read(|book| book.allowance).await
    }

    async fn get_collateral_price(&self) -> LedgerResult<U256> {
        self.read(|book| book.price).await
    }

    async fn get_musd_balance(&self, _account: &Address) -> LedgerResult<U256> {
        self.read(|book| book.musd_wallet).await
    }

    async fn deposit_collateral(&self, amount: U256) -> LedgerResult<TxHash> {
        self.submit(TransactionKind::Deposit, amount, |book| {
            if amount.is_zero() {
                return Err((None, "deposit amount must be positive".to_string()));
            }
            if book.collateral_wallet < amount {
                return revert(RevertCode::InsufficientBalance, "insufficient collateral in wallet");
            }
            book.collateral_wallet -= amount;
            book.collateral += amount;
            book.vault_open = true;
            Ok(())
        })
        .await
    }

    async fn borrow(&self, amount: U256) -> LedgerResult<TxHash> {
        self.submit(TransactionKind::Borrow, amount, |book| {
            if !book.vault_open {
                return revert(RevertCode::VaultNotFound, "vault does not exist");
            }
            let new_debt = book.debt().saturating_add(amount);
            if book.ratio_with(book.collateral, new_debt) < min_collateral_ratio_wad() {
                return revert(RevertCode::InsufficientCollateral, "collateral ratio below minimum");
            }
            book.principal += amount;
            book.musd_wallet += amount;
            Ok(())
        })
        .await
    }

    async fn repay(&self, amount: U256) -> LedgerResult<TxHash> {
        self.submit(TransactionKind::Repay, amount, |book| {
            if !book.vault_open {
                return revert(RevertCode::VaultNotFound, "vault does not exist");
            }
            if book.musd_wallet < amount {
                return revert(RevertCode::InsufficientBalance, "transfer amount exceeds balance");
            }
            if book.allowance < amount {
                return revert(RevertCode::AllowanceExceeded, "insufficient allowance");
            }
            if amount > book.debt() {
                return Err((None, "repayment exceeds outstanding debt".to_string()));
            }
            if book.allowance != U256::MAX {
                book.allowance -= amount;
            }
            book.musd_wallet -= amount;
            // Interest is settled before principal.
            let to_interest = amount.min(book.interest);
            book.interest -= to_interest;
            book.principal -= amount - to_interest;
            Ok(())
        })
        .await
    }

    async fn withdraw(&self, amount: U256) -> LedgerResult<TxHash> {
        self.submit(TransactionKind::Withdraw, amount, |book| {
            if !book.vault_open {
                return revert(RevertCode::VaultNotFound, "vault does not exist");
            }
            if book.collateral < amount {
                return revert(RevertCode::InsufficientCollateral, "withdrawal exceeds deposited collateral");
            }
            let remaining = book.collateral - amount;
            let debt = book.debt();
            if !debt.is_zero() && book.ratio_with(remaining, debt) < min_collateral_ratio_wad() {
                return revert(RevertCode::InsufficientCollateral, "collateral ratio below minimum");
            }
            book.collateral = remaining;
            book.collateral_wallet += amount;
            Ok(())
        })
        .await
    }

    async fn approve(&self, _spender: &Address, amount: U256) -> LedgerResult<TxHash> {
        self.submit(TransactionKind::Approve, amount, |book| {
            book.allowance = amount;
            Ok(())
        })
        .await
    }

    async fn wait_for_receipt(&self, hash: &TxHash) -> LedgerResult<TxReceipt> {
        let (mined_at, outcome) = {
            let state = self.state.lock().await;
            state.receipts.get(hash).cloned().ok_or_else(|| LedgerError::Rpc {
                code: -32000,
                message: format!("transaction {} not found", hash),
            })?
        };
        tokio::time::sleep_until(mined_at).await;
        self.state.lock().await.receipts.remove(hash);
        Ok(TxReceipt {
            hash: hash.clone(),
            outcome,
        })
    }
}
