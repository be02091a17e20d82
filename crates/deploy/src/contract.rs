//! Declared contracts and their constructor arguments.

use std::fmt;

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    primitives::{Address, Bytes},
};
use serde::{Deserialize, Serialize};

/// A constructor argument as declared in the manifest.
///
/// In TOML a reference reads `{ contract = "Token" }` and a literal reads
/// `{ type = "uint256", value = "1000" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstructorArg {
    /// The deployed address of another contract.
    Ref { contract: String },
    /// A literal value with its Solidity ABI type.
    Literal {
        #[serde(rename = "type")]
        ty: String,
        value: String,
    },
}

impl ConstructorArg {
    /// Reference the address of another contract.
    pub fn reference(contract: impl Into<String>) -> Self {
        Self::Ref {
            contract: contract.into(),
        }
    }

    /// A literal of the given ABI type.
    pub fn literal(ty: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Literal {
            ty: ty.into(),
            value: value.into(),
        }
    }

    /// The name of the contract this argument depends on, if any.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            Self::Ref { contract } => Some(contract),
            Self::Literal { .. } => None,
        }
    }
}

/// A contract to deploy: its creation bytecode and constructor arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractSpec {
    /// Unique name, also the key of its deployment record.
    pub name: String,
    /// Creation bytecode, without constructor arguments.
    pub bytecode: Bytes,
    /// Constructor arguments in declaration order.
    pub args: Vec<ConstructorArg>,
}

impl ContractSpec {
    pub fn new(name: impl Into<String>, bytecode: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytecode: bytecode.into(),
            args: Vec::new(),
        }
    }

    /// Append a constructor argument.
    pub fn arg(mut self, arg: ConstructorArg) -> Self {
        self.args.push(arg);
        self
    }

    /// Names referenced by the constructor arguments, in argument order.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(ConstructorArg::dependency)
    }
}

/// A constructor argument once references have been replaced by addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedArg {
    #[serde(rename = "type")]
    pub ty: String,
    pub value: String,
}

impl ResolvedArg {
    pub fn new(ty: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            value: value.into(),
        }
    }

    /// An `address` argument holding a dependency's deployed address.
    pub fn address(address: Address) -> Self {
        Self::new("address", address.to_string())
    }

    /// Coerce the textual value into an ABI value of its declared type.
    pub fn to_sol_value(&self) -> Result<DynSolValue, String> {
        parse_literal(&self.ty, &self.value)
    }
}

impl fmt::Display for ResolvedArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ty, self.value)
    }
}

/// Parse `value` as an ABI value of type `ty`.
pub(crate) fn parse_literal(ty: &str, value: &str) -> Result<DynSolValue, String> {
    let sol_type = DynSolType::parse(ty).map_err(|e| e.to_string())?;
    if sol_type == DynSolType::Address {
        return value
            .parse::<Address>()
            .map(DynSolValue::Address)
            .map_err(|e| e.to_string());
    }
    sol_type.coerce_str(value).map_err(|e| e.to_string())
}

/// Concatenate creation bytecode with the ABI-encoded constructor arguments.
pub fn encode_init_code(bytecode: &Bytes, args: &[ResolvedArg]) -> Result<Bytes, String> {
    let values = args
        .iter()
        .map(ResolvedArg::to_sol_value)
        .collect::<Result<Vec<_>, _>>()?;

    let mut init_code = bytecode.to_vec();
    if !values.is_empty() {
        init_code.extend(DynSolValue::Tuple(values).abi_encode_params());
    }

    Ok(init_code.into())
}
