// Event Decoders for Uniswap V2 Factories and Pairs
//
// PairCreated is emitted by the factory, Swap by every pair contract.

use alloy_primitives::{Address, Log, B256, U256};
use alloy_sol_types::{sol, SolEvent};

// NOTE: Event names in sol! macro MUST match on-chain names for signature calculation

sol! {
    /// Factory event announcing a new pair
    #[derive(Debug)]
    event PairCreated(address indexed token0, address indexed token1, address pair, uint256 pairIndex);

    /// V2 Swap - amounts are raw token units, exactly one side is normally non-zero per direction
    #[derive(Debug)]
    event Swap(
        address indexed sender,
        uint256 amount0In,
        uint256 amount1In,
        uint256 amount0Out,
        uint256 amount1Out,
        address indexed to
    );
}

/// topic0 of `PairCreated(address,address,address,uint256)`
pub const PAIR_CREATED_TOPIC: B256 = PairCreated::SIGNATURE_HASH;

/// topic0 of `Swap(address,uint256,uint256,uint256,uint256,address)`
pub const SWAP_TOPIC: B256 = Swap::SIGNATURE_HASH;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPairCreated {
    pub factory: Address,
    pub pair: Address,
    pub token0: Address,
    pub token1: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSwap {
    pub pair: Address,
    pub sender: Address,
    pub recipient: Address,
    pub amount0_in: U256,
    pub amount1_in: U256,
    pub amount0_out: U256,
    pub amount1_out: U256,
}

/// Try to decode a log as a factory PairCreated event.
pub fn decode_pair_created(log: &Log) -> Option<DecodedPairCreated> {
    let topic0 = log.topics().first()?;
    if *topic0 != PAIR_CREATED_TOPIC {
        return None;
    }

    let decoded = PairCreated::decode_log(log).ok()?;

    Some(DecodedPairCreated {
        factory: log.address,
        pair: decoded.data.pair,
        token0: decoded.data.token0,
        token1: decoded.data.token1,
    })
}

/// Try to decode a log as a pair Swap event.
pub fn decode_swap(log: &Log) -> Option<DecodedSwap> {
    let topic0 = log.topics().first()?;
    if *topic0 != SWAP_TOPIC {
        return None;
    }

    let decoded = Swap::decode_log(log).ok()?;

    Some(DecodedSwap {
        pair: log.address,
        sender: decoded.data.sender,
        recipient: decoded.data.to,
        amount0_in: decoded.data.amount0In,
        amount1_in: decoded.data.amount1In,
        amount0_out: decoded.data.amount0Out,
        amount1_out: decoded.data.amount1Out,
    })
}

/// Build a PairCreated log as the factory would emit it.
pub fn encode_pair_created(
    factory: Address,
    token0: Address,
    token1: Address,
    pair: Address,
    pair_index: u64,
) -> Log {
    let event = PairCreated {
        token0,
        token1,
        pair,
        pairIndex: U256::from(pair_index),
    };
    Log {
        address: factory,
        data: event.encode_log_data(),
    }
}

/// Build a Swap log as a pair contract would emit it.
pub fn encode_swap(pair: Address, swap: &DecodedSwap) -> Log {
    let event = Swap {
        sender: swap.sender,
        amount0In: swap.amount0_in,
        amount1In: swap.amount1_in,
        amount0Out: swap.amount0_out,
        amount1Out: swap.amount1_out,
        to: swap.recipient,
    };
    Log {
        address: pair,
        data: event.encode_log_data(),
    }
}
