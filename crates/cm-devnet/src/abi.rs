use alloy_dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy_json_abi::{Event, Function, StateMutability};
use alloy_primitives::{Address, B256, Bytes, Selector, U256};
use anyhow::{Context, Result};
use cm_chain_client::{RawLog, TxHash};
use std::collections::HashMap;

/// Revert reason raised by a contract method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Revert(pub(crate) String);

impl Revert {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

pub(crate) fn require(condition: bool, reason: &str) -> Result<(), Revert> {
    if condition { Ok(()) } else { Err(Revert::new(reason)) }
}

/// Selector dispatch table for one deployed contract.
pub(crate) struct ContractAbi {
    functions: HashMap<Selector, Function>,
    events: HashMap<String, Event>,
}

impl ContractAbi {
    pub(crate) fn parse(lines: &[&str]) -> Result<Self> {
        let mut functions = HashMap::new();
        let mut events = HashMap::new();
        for line in lines {
            if line.trim_start().starts_with("event ") {
                let event = Event::parse(line).with_context(|| format!("invalid event: {line}"))?;
                events.insert(event.name.clone(), event);
            } else {
                let function =
                    Function::parse(line).with_context(|| format!("invalid function: {line}"))?;
                functions.insert(function.selector(), function);
            }
        }
        Ok(Self { functions, events })
    }

    pub(crate) fn decode_call(&self, data: &[u8]) -> Result<(&Function, Vec<DynSolValue>), Revert> {
        if data.len() < 4 {
            return Err(Revert::new(""));
        }
        // Unknown selectors revert without a reason, like a contract without fallback.
        let function = self
            .functions
            .get(&Selector::from_slice(&data[..4]))
            .ok_or_else(|| Revert::new(""))?;
        let args = function
            .abi_decode_input(&data[4..])
            .map_err(|err| Revert::new(format!("invalid calldata: {err}")))?;
        Ok((function, args))
    }

    pub(crate) fn encode_output(function: &Function, values: &[DynSolValue]) -> Result<Bytes, Revert> {
        function
            .abi_encode_output(values)
            .map(Bytes::from)
            .map_err(|err| Revert::new(format!("output encoding failed: {err}")))
    }

    pub(crate) fn is_payable(function: &Function) -> bool {
        function.state_mutability == StateMutability::Payable
    }

    /// ABI-encodes an event: indexed values become topics, the rest the data.
    pub(crate) fn encode_log(
        &self,
        address: Address,
        name: &str,
        values: Vec<DynSolValue>,
        block_number: u64,
        tx_hash: TxHash,
    ) -> Result<RawLog> {
        let event = self
            .events
            .get(name)
            .with_context(|| format!("event {name} is not declared"))?;

        let mut topics = vec![event.selector()];
        let mut body = Vec::new();
        for (param, value) in event.inputs.iter().zip(values) {
            if param.indexed {
                topics.push(B256::from_slice(&value.abi_encode()));
            } else {
                body.push(value);
            }
        }

        Ok(RawLog {
            address,
            topics,
            data: Bytes::from(DynSolValue::Tuple(body).abi_encode_params()),
            block_number,
            tx_hash,
        })
    }
}

pub(crate) fn uint_arg(args: &[DynSolValue], index: usize) -> Result<U256, Revert> {
    args.get(index)
        .and_then(DynSolValue::as_uint)
        .map(|(value, _)| value)
        .ok_or_else(|| Revert::new(format!("argument {index} is not a uint")))
}

pub(crate) fn address_arg(args: &[DynSolValue], index: usize) -> Result<Address, Revert> {
    args.get(index)
        .and_then(DynSolValue::as_address)
        .ok_or_else(|| Revert::new(format!("argument {index} is not an address")))
}

pub(crate) fn bool_arg(args: &[DynSolValue], index: usize) -> Result<bool, Revert> {
    args.get(index)
        .and_then(DynSolValue::as_bool)
        .ok_or_else(|| Revert::new(format!("argument {index} is not a bool")))
}

pub(crate) fn string_arg(args: &[DynSolValue], index: usize) -> Result<String, Revert> {
    args.get(index)
        .and_then(DynSolValue::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| Revert::new(format!("argument {index} is not a string")))
}

pub(crate) fn uint(value: U256) -> DynSolValue {
    DynSolValue::Uint(value, 256)
}
