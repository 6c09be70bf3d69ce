// Read-only Contract Calls
//
// Pair token lookup, ERC20 decimals and the price view oracle, encoded with
// sol! bindings and executed through the Ledger.

use crate::ledger::Ledger;
use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{sol, SolCall, SolValue};
use eyre::WrapErr;

sol! {
    interface IUniswapV2Pair {
        function token0() external view returns (address);
        function token1() external view returns (address);
    }

    interface IERC20 {
        function decimals() external view returns (uint8);
    }

    /// Oracle returning a token's reference price with 18 decimals
    interface IPriceView {
        function getTokenPrice(address token) external view returns (uint256);
    }
}

pub fn token0_calldata() -> Bytes {
    IUniswapV2Pair::token0Call {}.abi_encode().into()
}

pub fn token1_calldata() -> Bytes {
    IUniswapV2Pair::token1Call {}.abi_encode().into()
}

pub fn decimals_calldata() -> Bytes {
    IERC20::decimalsCall {}.abi_encode().into()
}

pub fn token_price_calldata(token: Address) -> Bytes {
    IPriceView::getTokenPriceCall { token }.abi_encode().into()
}

/// `(token0, token1)` of a pair contract, read at the tip
pub async fn pair_tokens(ledger: &dyn Ledger, pair: Address) -> eyre::Result<(Address, Address)> {
    let raw0 = ledger.call(pair, token0_calldata(), None).await?;
    let raw1 = ledger.call(pair, token1_calldata(), None).await?;

    let token0 = IUniswapV2Pair::token0Call::abi_decode_returns(&raw0)
        .wrap_err_with(|| format!("token0() of {pair:#x} returned malformed data"))?;
    let token1 = IUniswapV2Pair::token1Call::abi_decode_returns(&raw1)
        .wrap_err_with(|| format!("token1() of {pair:#x} returned malformed data"))?;

    Ok((token0, token1))
}

pub async fn token_decimals(ledger: &dyn Ledger, token: Address) -> eyre::Result<u8> {
    let raw = ledger.call(token, decimals_calldata(), None).await?;
    IERC20::decimalsCall::abi_decode_returns(&raw)
        .wrap_err_with(|| format!("decimals() of {token:#x} returned malformed data"))
}

/// Oracle price of `token` as of `block`
pub async fn token_price(
    ledger: &dyn Ledger,
    price_view: Address,
    token: Address,
    block: u64,
) -> eyre::Result<U256> {
    let raw = ledger
        .call(price_view, token_price_calldata(token), Some(block))
        .await?;
    IPriceView::getTokenPriceCall::abi_decode_returns(&raw)
        .wrap_err_with(|| format!("getTokenPrice({token:#x}) returned malformed data"))
}

/// ABI-encode a single return value the way a contract would
pub fn encode_return<T: SolValue>(value: T) -> Bytes {
    value.abi_encode().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use alloy_primitives::address;

    #[test]
    fn test_call_selectors() {
        assert_eq!(hex::encode(&token0_calldata()[..4]), "0dfe1681");
        assert_eq!(hex::encode(&token1_calldata()[..4]), "d21220a7");
        assert_eq!(hex::encode(&decimals_calldata()[..4]), "313ce567");
    }

    #[tokio::test]
    async fn test_pair_tokens_and_decimals() {
        let pair = address!("00000000000000000000000000000000000000f1");
        let token0 = address!("000000000000000000000000000000000000000a");
        let token1 = address!("000000000000000000000000000000000000000b");

        let ledger = MemoryLedger::new(10);
        ledger.respond(pair, token0_calldata(), encode_return(token0));
        ledger.respond(pair, token1_calldata(), encode_return(token1));
        ledger.respond(token0, decimals_calldata(), encode_return(6u16));

        assert_eq!(pair_tokens(&ledger, pair).await.unwrap(), (token0, token1));
        assert_eq!(token_decimals(&ledger, token0).await.unwrap(), 6);
        assert!(token_decimals(&ledger, token1).await.is_err());
    }

    #[tokio::test]
    async fn test_token_price_is_read_at_block() {
        let view = address!("00000000000000000000000000000000000000ee");
        let token = address!("000000000000000000000000000000000000000c");

        let ledger = MemoryLedger::new(500);
        ledger.respond_at(
            view,
            token_price_calldata(token),
            321,
            encode_return(U256::from(42u64)),
        );

        assert_eq!(
            token_price(&ledger, view, token, 321).await.unwrap(),
            U256::from(42u64)
        );
        assert!(token_price(&ledger, view, token, 322).await.is_err());
        assert_eq!(ledger.calls().last().map(|c| c.2), Some(Some(322)));
    }
}
