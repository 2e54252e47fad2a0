// Smart-contract runtime interface
//
// The VM is an external collaborator: a pure function from bytecode and a
// read-only execution context to a result. The chain never hands the VM a
// handle back into itself; balances are exposed through a lookup closure
// captured in the context, and state changes are applied by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::crypto::Address;

/// Read-only view the VM executes against.
pub struct ExecutionContext<'a> {
    pub caller: Address,
    pub contract: Address,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub block_height: u64,
    pub input: Option<&'a Value>,
    /// Balance lookup captured by the block builder; the VM cannot reach
    /// back into chain state through any other channel.
    pub balance_of: &'a dyn Fn(&Address) -> u64,
}

/// Outcome of one contract execution. A failed execution is a first-class
/// result, not an error: the transaction still confirms and consumes its
/// declared gas limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub gas_used: u64,
    #[serde(default)]
    pub state_changes: BTreeMap<String, Value>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl ExecutionResult {
    pub fn failure(gas_used: u64, reason: impl Into<String>) -> Self {
        ExecutionResult {
            success: false,
            gas_used,
            state_changes: BTreeMap::new(),
            logs: vec![reason.into()],
        }
    }
}

pub trait ContractRuntime: Send + Sync {
    fn execute(&self, bytecode: &[u8], ctx: &ExecutionContext<'_>) -> ExecutionResult;
}

/// Runtime that accepts every call and touches no state. Stands in when a
/// node runs without a VM attached.
pub struct NoopRuntime;

impl ContractRuntime for NoopRuntime {
    fn execute(&self, _bytecode: &[u8], ctx: &ExecutionContext<'_>) -> ExecutionResult {
        ExecutionResult {
            success: true,
            gas_used: ctx.gas_limit.min(crate::config::BASE_TX_GAS),
            state_changes: BTreeMap::new(),
            logs: Vec::new(),
        }
    }
}
