// src/core/accounts.rs
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::connectors::traits::BrokerClient;
use crate::error::BrokerResult;
use crate::types::{AccountSnapshot, PositionSnapshot};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoneyPosition {
    /// Cached balance, refreshed on release.
    pub amount: Decimal,
    pub occupied: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Account {
    pub id: String,
    pub positions: HashMap<String, MoneyPosition>,
}

type Accounts = HashMap<String, Account>;

/// Trading accounts shared by every bot of one environment. A money
/// position (account, currency) is held by at most one bot at a time.
pub struct AccountRegistry {
    broker: Arc<dyn BrokerClient>,
    accounts: Arc<Mutex<Accounts>>,
}

/// Exclusive hold on the registry plus one freshly occupied position.
///
/// Dropping the lease without [`AccountLease::commit`] gives the position
/// back. Either way the registry lock is released on drop.
pub struct AccountLease {
    guard: OwnedMutexGuard<Accounts>,
    account_id: String,
    currency: String,
    amount: Decimal,
    discarded: bool,
    committed: bool,
}

impl AccountLease {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Cached amount at acquisition time.
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// Reverts the occupation. Safe to call any number of times.
    pub fn discard(&mut self) {
        if self.discarded {
            return;
        }
        if let Some(position) = self
            .guard
            .get_mut(&self.account_id)
            .and_then(|a| a.positions.get_mut(&self.currency))
        {
            position.occupied = false;
        }
        self.discarded = true;
    }

    /// Keeps the position occupied and unlocks the registry.
    pub fn commit(mut self) -> String {
        self.committed = !self.discarded;
        self.account_id.clone()
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        if !self.committed {
            self.discard();
        }
    }
}

impl AccountRegistry {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            accounts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Occupies the free position in `currency` with the largest cached
    /// amount. Ties go to whichever account the map yields first.
    pub async fn acquire(&self, currency: &str) -> Option<AccountLease> {
        let mut guard = Arc::clone(&self.accounts).lock_owned().await;

        let (account_id, amount) = guard
            .values()
            .filter_map(|account| {
                account
                    .positions
                    .get(currency)
                    .filter(|p| !p.occupied)
                    .map(|p| (account.id.clone(), p.amount))
            })
            .max_by(|a, b| a.1.cmp(&b.1))?;

        if let Some(position) = guard
            .get_mut(&account_id)
            .and_then(|a| a.positions.get_mut(currency))
        {
            position.occupied = true;
        }
        debug!(account = %account_id, %currency, %amount, "Account acquired");

        Some(AccountLease {
            guard,
            account_id,
            currency: currency.to_string(),
            amount,
            discarded: false,
            committed: false,
        })
    }

    /// Refreshes every cached amount of `account_id` from the broker and
    /// frees its `currency` position.
    ///
    /// The position is freed even when the refresh fails; the error is still
    /// returned so the caller can report it.
    pub async fn release(&self, account_id: &str, currency: &str) -> BrokerResult<()> {
        let fetched = self.broker.get_positions(account_id).await;

        let mut accounts = self.accounts.lock().await;
        let Some(account) = accounts.get_mut(account_id) else {
            warn!(account = %account_id, "Release of an unknown account ignored");
            return fetched.map(|_| ());
        };

        if let Ok(positions) = &fetched {
            for position in account.positions.values_mut() {
                position.amount = Decimal::ZERO;
            }
            for money in &positions.money {
                account
                    .positions
                    .entry(money.currency.clone())
                    .or_default()
                    .amount = money.amount;
            }
        }
        if let Some(position) = account.positions.get_mut(currency) {
            position.occupied = false;
        }
        debug!(account = %account_id, %currency, "Account released");

        fetched.map(|_| ())
    }

    /// Opens and funds a sandbox account. Zero amounts are skipped.
    pub async fn create_sandbox_account(
        &self,
        funding: &HashMap<String, Decimal>,
    ) -> BrokerResult<String> {
        let id = self.broker.open_sandbox_account().await?;
        let mut account = Account {
            id: id.clone(),
            positions: HashMap::new(),
        };

        for (currency, amount) in funding.iter().filter(|(_, a)| !a.is_zero()) {
            match self.broker.sandbox_pay_in(&id, currency, *amount).await {
                Ok(balance) => {
                    account.positions.insert(
                        currency.clone(),
                        MoneyPosition {
                            amount: balance,
                            occupied: false,
                        },
                    );
                }
                Err(e) => {
                    if let Err(close_err) = self.broker.close_sandbox_account(&id).await {
                        warn!(account = %id, "Failed to close half-funded account: {}", close_err);
                    }
                    return Err(e);
                }
            }
        }

        info!(account = %id, "Sandbox account registered");
        self.accounts.lock().await.insert(id.clone(), account);
        Ok(id)
    }

    /// Forgets and closes a sandbox account. Unknown ids are ignored.
    pub async fn remove_sandbox_account(&self, account_id: &str) -> BrokerResult<()> {
        if self.accounts.lock().await.remove(account_id).is_none() {
            return Ok(());
        }
        self.broker.close_sandbox_account(account_id).await
    }

    /// Registers every account the broker already has, with live balances.
    pub async fn load_existing(&self) -> BrokerResult<Vec<String>> {
        let ids = self.broker.get_accounts().await?;
        for id in &ids {
            let positions = self.broker.get_positions(id).await?;
            let account = Account {
                id: id.clone(),
                positions: positions
                    .money
                    .into_iter()
                    .map(|m| {
                        (
                            m.currency,
                            MoneyPosition {
                                amount: m.amount,
                                occupied: false,
                            },
                        )
                    })
                    .collect(),
            };
            self.accounts.lock().await.insert(id.clone(), account);
        }
        info!("Loaded {} accounts", ids.len());
        Ok(ids)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn snapshot(&self) -> Vec<AccountSnapshot> {
        let accounts = self.accounts.lock().await;
        let mut snapshot: Vec<AccountSnapshot> = accounts
            .values()
            .map(|account| {
                let mut positions: Vec<PositionSnapshot> = account
                    .positions
                    .iter()
                    .map(|(currency, p)| PositionSnapshot {
                        currency: currency.clone(),
                        amount: p.amount,
                        occupied: p.occupied,
                    })
                    .collect();
                positions.sort_by(|a, b| a.currency.cmp(&b.currency));
                AccountSnapshot {
                    id: account.id.clone(),
                    positions,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    /// Closes every sandbox account. A no-op for live environments.
    pub async fn close_all(&self) {
        if !self.broker.is_sandbox() {
            return;
        }
        for id in self.ids().await {
            if let Err(e) = self.remove_sandbox_account(&id).await {
                warn!(account = %id, "Failed to close sandbox account: {}", e);
            }
        }
    }
}
