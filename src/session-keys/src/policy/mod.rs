//! Call policies: which `(target, selector)` pairs a session may call, with which
//! arguments and how much native value.

pub mod codec;
pub mod evaluator;
pub mod rules;

use alloy_primitives::{Address, Bytes, FixedBytes, B256, U256};

use session_policy_types::{ArgumentCondition, CallPolicyVersion, Comparand, ParamCondition};

use crate::{
    abi::{word_fits, FunctionAbi},
    errors::{ConfigError, DenyReason},
};

pub use evaluator::{condition_holds, evaluate};
pub use rules::{ArgumentRef, ArgumentRule, PermissionRule, RuleValue};

/// A single call an operation wants to make from the account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Call {
    pub fn new(target: Address, data: impl Into<Bytes>) -> Self {
        Self { target, value: U256::ZERO, data: data.into() }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn selector(&self) -> Option<FixedBytes<4>> {
        (self.data.len() >= 4).then(|| FixedBytes::from_slice(&self.data[..4]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn into_result(self) -> Result<(), DenyReason> {
        match self {
            Verdict::Allow => Ok(()),
            Verdict::Deny(reason) => Err(reason),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Unconditional authority. Only valid on the sudo validator.
    Sudo,
    Call(CallPolicy),
}

impl Policy {
    pub fn is_sudo(&self) -> bool {
        matches!(self, Policy::Sudo)
    }
}

impl From<CallPolicy> for Policy {
    fn from(policy: CallPolicy) -> Self {
        Policy::Call(policy)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallPolicy {
    pub version: CallPolicyVersion,
    pub permissions: Vec<Permission>,
}

impl CallPolicy {
    pub fn new(permissions: Vec<Permission>) -> Self {
        Self { version: CallPolicyVersion::V0_0_4, permissions }
    }
}

/// Allows calls to one function on one target, subject to argument conditions and a
/// value limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permission {
    pub target: Address,
    pub function: FunctionAbi,
    pub conditions: Vec<ArgumentCondition>,
    /// `None` means unlimited; `Some(0)` forbids attaching value.
    pub value_limit: Option<U256>,
}

impl Permission {
    pub fn new(target: Address, function: FunctionAbi) -> Self {
        Self { target, function, conditions: Vec::new(), value_limit: None }
    }

    pub fn with_value_limit(mut self, limit: U256) -> Self {
        self.value_limit = Some(limit);
        self
    }

    /// Add a condition on the argument at `index`.
    pub fn with_condition(
        mut self,
        index: usize,
        condition: ParamCondition,
        comparand: Comparand,
    ) -> Result<Self, ConfigError> {
        if u8::try_from(index).is_err() {
            return Err(ConfigError::Invalid {
                field: "condition index",
                reason: format!("argument index {index} exceeds {}", u8::MAX),
            });
        }
        if self.conditions.len() >= usize::from(u8::MAX) {
            return Err(ConfigError::Invalid {
                field: "conditions",
                reason: format!("at most {} conditions per permission", u8::MAX),
            });
        }
        let condition = self.check_condition(index, condition, comparand)?;
        self.conditions.push(condition);
        Ok(self)
    }

    /// Add a condition on the argument declared as `name`.
    pub fn with_named_condition(
        self,
        name: &str,
        condition: ParamCondition,
        comparand: Comparand,
    ) -> Result<Self, ConfigError> {
        let index = self.function.param_index(name).ok_or_else(|| {
            ConfigError::UnknownArgument {
                signature: self.function.canonical(),
                argument: name.to_string(),
            }
        })?;
        self.with_condition(index, condition, comparand)
    }

    fn check_condition(
        &self,
        index: usize,
        condition: ParamCondition,
        comparand: Comparand,
    ) -> Result<ArgumentCondition, ConfigError> {
        let param = self
            .function
            .params
            .get(index)
            .ok_or_else(|| ConfigError::UnknownArgument {
                signature: self.function.canonical(),
                argument: index.to_string(),
            })?
            .ty
            .clone();
        if !param.is_word() {
            return Err(ConfigError::UnsupportedArgument {
                signature: self.function.canonical(),
                index,
                param: param.to_string(),
            });
        }

        let invalid = |reason: &str| ConfigError::InvalidComparand {
            index,
            reason: reason.to_string(),
        };
        match (condition.is_range(), comparand) {
            (false, Comparand::Word(word)) => {
                if !word_fits(&param, &word) {
                    return Err(invalid(&format!("value does not fit `{param}`")));
                }
            }
            (true, Comparand::Range { min, max }) => {
                if !word_fits(&param, &min) || !word_fits(&param, &max) {
                    return Err(invalid(&format!("bound does not fit `{param}`")));
                }
                if evaluator::ordering_key(min, param.is_signed())
                    > evaluator::ordering_key(max, param.is_signed())
                {
                    return Err(invalid("range minimum exceeds maximum"));
                }
            }
            (true, Comparand::Word(_)) => return Err(invalid("IN_RANGE needs a [min, max] pair")),
            (false, Comparand::Range { .. }) => {
                return Err(invalid(&format!("{condition} takes a single value")))
            }
        }

        Ok(ArgumentCondition { index, param, condition, comparand })
    }
}

/// ABI word of an address argument.
pub fn address_word(address: Address) -> B256 {
    address.into_word()
}

/// ABI word of a `uintN` argument.
pub fn uint_word(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<32>())
}

/// ABI word of an `intN` argument, two's complement and sign-extended.
pub fn int_word(value: i128) -> B256 {
    let magnitude = U256::from(value.unsigned_abs());
    let word = if value < 0 { U256::ZERO.wrapping_sub(magnitude) } else { magnitude };
    uint_word(word)
}

/// ABI word of a `bool` argument.
pub fn bool_word(value: bool) -> B256 {
    uint_word(U256::from(value as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> FunctionAbi {
        FunctionAbi::parse("transfer(address to, uint256 amount)").unwrap()
    }

    #[test]
    fn conditions_resolve_names() {
        let permission = Permission::new(Address::ZERO, transfer())
            .with_named_condition(
                "amount",
                ParamCondition::LessThan,
                Comparand::Word(uint_word(U256::from(5u64))),
            )
            .unwrap();
        assert_eq!(permission.conditions[0].index, 1);

        let err = Permission::new(Address::ZERO, transfer())
            .with_named_condition("value", ParamCondition::Equal, Comparand::Word(B256::ZERO))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownArgument { .. }));
    }

    #[test]
    fn comparand_shape_must_match_operator() {
        let p = Permission::new(Address::ZERO, transfer());
        assert!(p
            .clone()
            .with_condition(1, ParamCondition::InRange, Comparand::Word(B256::ZERO))
            .is_err());
        assert!(p
            .clone()
            .with_condition(
                1,
                ParamCondition::Equal,
                Comparand::Range { min: B256::ZERO, max: B256::ZERO }
            )
            .is_err());
        let reversed = Comparand::Range {
            min: uint_word(U256::from(9u64)),
            max: uint_word(U256::from(1u64)),
        };
        assert!(p.with_condition(1, ParamCondition::InRange, reversed).is_err());
    }

    #[test]
    fn rejects_dirty_comparands_and_dynamic_params() {
        let p = Permission::new(Address::ZERO, transfer());
        assert!(matches!(
            p.clone().with_condition(0, ParamCondition::Equal, Comparand::Word(B256::repeat_byte(0xff))),
            Err(ConfigError::InvalidComparand { index: 0, .. })
        ));

        let dynamic = Permission::new(Address::ZERO, FunctionAbi::parse("f(bytes)").unwrap());
        assert!(matches!(
            dynamic.with_condition(0, ParamCondition::Equal, Comparand::Word(B256::ZERO)),
            Err(ConfigError::UnsupportedArgument { .. })
        ));
    }

    #[test]
    fn signed_words_are_sign_extended() {
        assert_eq!(int_word(-1), B256::repeat_byte(0xff));
        assert_eq!(int_word(5), uint_word(U256::from(5u64)));
        assert!(word_fits(&session_policy_types::ParamType::Int(8), &int_word(-128)));
        assert!(!word_fits(&session_policy_types::ParamType::Int(8), &int_word(-129)));
    }

    #[test]
    fn condition_lists_stay_within_wire_widths() {
        let cap = Comparand::Word(uint_word(U256::from(5u8)));
        let mut permission = Permission::new(Address::ZERO, FunctionAbi::parse("f(uint256)").unwrap());
        for _ in 0..u8::MAX {
            permission = permission.with_condition(0, ParamCondition::LessThan, cap).unwrap();
        }
        assert!(matches!(
            permission.clone().with_condition(0, ParamCondition::LessThan, cap),
            Err(ConfigError::Invalid { field: "conditions", .. })
        ));
        assert!(matches!(
            Permission::new(Address::ZERO, FunctionAbi::parse("f(uint256)").unwrap())
                .with_condition(256, ParamCondition::Equal, cap),
            Err(ConfigError::Invalid { field: "condition index", .. })
        ));
    }
}
