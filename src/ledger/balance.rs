//! Balance book - one mutex per owner
//!
//! Debit/credit on a balance happens only while holding its mutex.
//! Different owners never contend.

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::{Balance, Error, Result, Store, TopupPolicy};

pub type BalanceHandle = Arc<Mutex<Balance>>;

pub struct BalanceBook {
    balances: RwLock<HashMap<String, BalanceHandle>>,
    starting: Decimal,
    policy: Option<TopupPolicy>,
    store: Arc<dyn Store>,
}

impl BalanceBook {
    pub fn new(starting: Decimal, policy: Option<TopupPolicy>, store: Arc<dyn Store>) -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
            starting,
            policy,
            store,
        }
    }

    /// Balance of `owner`, resumed from the store or created on first use.
    /// A store that cannot answer is an error; only a confirmed miss opens a
    /// new balance.
    pub fn handle(&self, owner: &str) -> Result<BalanceHandle> {
        if let Some(h) = self.balances.read().get(owner) {
            return Ok(h.clone());
        }

        let mut balances = self.balances.write();
        if let Some(h) = balances.get(owner) {
            return Ok(h.clone());
        }

        let balance = match self.store.load_balance(owner) {
            Ok(Some(b)) => b,
            Ok(None) => {
                info!("🏦 Opening sandbox balance for {} with ${}", owner, self.starting);
                Balance::new(owner, self.starting, self.policy)
            }
            Err(e) => {
                warn!("⚠️ Could not load balance for {}: {}", owner, e);
                return Err(Error::BalanceUnavailable {
                    owner: owner.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let handle = Arc::new(Mutex::new(balance));
        balances.insert(owner.to_string(), handle.clone());
        Ok(handle)
    }

    /// Copy of the current balance
    pub fn snapshot(&self, owner: &str) -> Result<Balance> {
        Ok(self.handle(owner)?.lock().clone())
    }

    pub fn owners(&self) -> Vec<String> {
        self.balances.read().keys().cloned().collect()
    }
}
