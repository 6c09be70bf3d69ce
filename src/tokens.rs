// Token Metadata and Oracle Prices
//
// Decimals are cached for the life of the process; a failed lookup falls back
// to 18 and is retried on the next request. Prices are never cached because
// they are read at each trade's own block.

use crate::contracts;
use crate::ledger::Ledger;
use crate::pricing::ONE;
use alloy_primitives::{Address, U256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const DEFAULT_DECIMALS: u8 = 18;

pub struct TokenCatalog {
    ledger: Arc<dyn Ledger>,
    price_view: Address,
    /// Tokens whose reference price is fixed at 1.0
    pinned: HashSet<Address>,
    decimals: RwLock<HashMap<Address, u8>>,
}

impl TokenCatalog {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        price_view: Address,
        pinned: impl IntoIterator<Item = Address>,
    ) -> Self {
        Self {
            ledger,
            price_view,
            pinned: pinned.into_iter().collect(),
            decimals: RwLock::new(HashMap::new()),
        }
    }

    pub async fn decimals(&self, token: Address) -> u8 {
        if let Some(decimals) = self.decimals.read().await.get(&token) {
            return *decimals;
        }

        match contracts::token_decimals(self.ledger.as_ref(), token).await {
            Ok(decimals) => {
                self.decimals.write().await.insert(token, decimals);
                decimals
            }
            Err(e) => {
                warn!(
                    "decimals() failed for {:#x}, assuming {}: {:#}",
                    token, DEFAULT_DECIMALS, e
                );
                DEFAULT_DECIMALS
            }
        }
    }

    /// Oracle price of `token` at `block`; `None` when unknown or zero
    pub async fn price(&self, token: Address, block: u64) -> Option<U256> {
        if self.pinned.contains(&token) {
            return Some(ONE);
        }

        match contracts::token_price(self.ledger.as_ref(), self.price_view, token, block).await {
            Ok(price) if price.is_zero() => None,
            Ok(price) => Some(price),
            Err(e) => {
                debug!("No oracle price for {:#x} at block {}: {:#}", token, block, e);
                None
            }
        }
    }

    pub async fn cached_decimals(&self) -> usize {
        self.decimals.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{decimals_calldata, encode_return, token_price_calldata};
    use crate::ledger::MemoryLedger;
    use alloy_primitives::address;

    const VIEW: Address = address!("00000000000000000000000000000000000000ee");
    const USDT: Address = address!("000000000000000000000000000000000000000a");
    const GOLD: Address = address!("000000000000000000000000000000000000000b");

    #[tokio::test]
    async fn test_decimals_cached_after_success_only() {
        let ledger = Arc::new(MemoryLedger::new(100));
        let catalog = TokenCatalog::new(ledger.clone(), VIEW, []);

        assert_eq!(catalog.decimals(USDT).await, DEFAULT_DECIMALS);
        assert_eq!(catalog.cached_decimals().await, 0);

        ledger.respond(USDT, decimals_calldata(), encode_return(6u16));
        assert_eq!(catalog.decimals(USDT).await, 6);
        assert_eq!(catalog.decimals(USDT).await, 6);

        let decimals_calls = ledger.calls().iter().filter(|c| c.0 == USDT).count();
        assert_eq!(decimals_calls, 2);
    }

    #[tokio::test]
    async fn test_pinned_tokens_skip_the_oracle() {
        let ledger = Arc::new(MemoryLedger::new(100));
        let catalog = TokenCatalog::new(ledger.clone(), VIEW, [USDT]);

        assert_eq!(catalog.price(USDT, 50).await, Some(ONE));
        assert!(ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_zero_or_failed_price_is_absent() {
        let ledger = Arc::new(MemoryLedger::new(100));
        let catalog = TokenCatalog::new(ledger.clone(), VIEW, []);

        assert_eq!(catalog.price(GOLD, 40).await, None);

        ledger.respond_at(VIEW, token_price_calldata(GOLD), 40, encode_return(U256::ZERO));
        ledger.respond_at(VIEW, token_price_calldata(GOLD), 41, encode_return(ONE * U256::from(2u64)));
        assert_eq!(catalog.price(GOLD, 40).await, None);
        assert_eq!(catalog.price(GOLD, 41).await, Some(ONE * U256::from(2u64)));
    }
}
