//! Declarative permission rules, as loaded from JSON policy files.
//!
//! ```json
//! [{
//!   "target": "0x...",
//!   "function": "transfer",
//!   "valueLimit": "0",
//!   "args": [
//!     { "arg": "to", "condition": "NOT_EQUAL", "value": "0x0000000000000000000000000000000000000000" },
//!     { "arg": 1, "condition": "IN_RANGE", "value": ["1", "10000000000000000000"] }
//!   ]
//! }]
//! ```

use core::str::FromStr;

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use session_policy_types::{Comparand, ParamCondition, ParamType};

use crate::{
    abi::AbiRegistry,
    errors::ConfigError,
    policy::{address_word, bool_word, uint_word, CallPolicy, Permission},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRule {
    pub target: Address,
    /// Bare function name or full signature; resolved through the [`AbiRegistry`].
    pub function: String,
    #[serde(default)]
    pub args: Vec<ArgumentRule>,
    /// Decimal or `0x` hex wei amount. Absent means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_limit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentRule {
    pub arg: ArgumentRef,
    pub condition: String,
    pub value: RuleValue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentRef {
    Index(usize),
    Name(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Single(String),
    Range([String; 2]),
}

impl CallPolicy {
    /// Build a call policy from declarative rules, resolving each function through `registry`.
    pub fn from_rules(registry: &AbiRegistry, rules: &[PermissionRule]) -> Result<Self, ConfigError> {
        let permissions = rules
            .iter()
            .map(|rule| rule.resolve(registry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CallPolicy::new(permissions))
    }
}

impl PermissionRule {
    pub fn resolve(&self, registry: &AbiRegistry) -> Result<Permission, ConfigError> {
        let function = registry.lookup(self.target, &self.function)?.clone();
        let mut permission = Permission::new(self.target, function);

        if let Some(limit) = &self.value_limit {
            let limit = U256::from_str(limit.trim()).map_err(|e| ConfigError::Invalid {
                field: "valueLimit",
                reason: e.to_string(),
            })?;
            permission = permission.with_value_limit(limit);
        }

        for rule in &self.args {
            let index = match &rule.arg {
                ArgumentRef::Index(index) => *index,
                ArgumentRef::Name(name) => permission.function.param_index(name).ok_or_else(|| {
                    ConfigError::UnknownArgument {
                        signature: permission.function.canonical(),
                        argument: name.clone(),
                    }
                })?,
            };
            let param = permission
                .function
                .params
                .get(index)
                .map(|p| p.ty.clone())
                .ok_or_else(|| ConfigError::UnknownArgument {
                    signature: permission.function.canonical(),
                    argument: index.to_string(),
                })?;
            let condition: ParamCondition = rule.condition.parse()?;
            let encode = |raw: &str| {
                encode_value(&param, raw)
                    .map_err(|reason| ConfigError::InvalidComparand { index, reason })
            };
            let comparand = match &rule.value {
                RuleValue::Single(raw) => Comparand::Word(encode(raw)?),
                RuleValue::Range([min, max]) => Comparand::Range { min: encode(min)?, max: encode(max)? },
            };
            permission = permission.with_condition(index, condition, comparand)?;
        }
        Ok(permission)
    }
}

/// Encode a textual value as the ABI word of `param`.
pub fn encode_value(param: &ParamType, raw: &str) -> Result<B256, String> {
    let raw = raw.trim();
    match param {
        ParamType::Address => raw
            .parse::<Address>()
            .map(address_word)
            .map_err(|e| format!("invalid address `{raw}`: {e}")),
        ParamType::Bool => match raw {
            "true" => Ok(bool_word(true)),
            "false" => Ok(bool_word(false)),
            _ => Err(format!("invalid bool `{raw}`")),
        },
        ParamType::Uint(bits) => {
            let value = U256::from_str(raw).map_err(|e| format!("invalid uint `{raw}`: {e}"))?;
            if *bits < 256 && !(value >> *bits).is_zero() {
                return Err(format!("`{raw}` overflows uint{bits}"));
            }
            Ok(uint_word(value))
        }
        ParamType::Int(bits) => {
            let (negative, digits) = match raw.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            let magnitude =
                U256::from_str(digits).map_err(|e| format!("invalid int `{raw}`: {e}"))?;
            let bound = U256::from(1u8) << (*bits - 1);
            let fits = if negative { magnitude <= bound } else { magnitude < bound };
            if !fits {
                return Err(format!("`{raw}` overflows int{bits}"));
            }
            let word = if negative { U256::ZERO.wrapping_sub(magnitude) } else { magnitude };
            Ok(uint_word(word))
        }
        ParamType::FixedBytes(len) => {
            let bytes = hex::decode(raw.trim_start_matches("0x"))
                .map_err(|e| format!("invalid bytes{len} `{raw}`: {e}"))?;
            if bytes.len() != *len {
                return Err(format!("expected {len} bytes, got {}", bytes.len()));
            }
            let mut word = [0u8; 32];
            word[..*len].copy_from_slice(&bytes);
            Ok(B256::from(word))
        }
        other => Err(format!("`{other}` arguments cannot carry conditions")),
    }
}
