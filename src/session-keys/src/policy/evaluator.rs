use alloy_primitives::{B256, U256};

use session_policy_types::{ArgumentCondition, Comparand, ParamCondition};

use crate::{
    errors::DenyReason,
    policy::{Call, CallPolicy, Permission, Policy, Verdict},
};

/// Evaluate a single call against a policy. Pure; no ledger access.
pub fn evaluate(policy: &Policy, call: &Call) -> Verdict {
    match policy {
        Policy::Sudo => Verdict::Allow,
        Policy::Call(call_policy) => evaluate_call_policy(call_policy, call),
    }
}

fn evaluate_call_policy(policy: &CallPolicy, call: &Call) -> Verdict {
    let selector = call.selector();
    let mut first_denial = None;

    for (index, permission) in policy.permissions.iter().enumerate() {
        if permission.target != call.target || selector != Some(permission.function.selector) {
            continue;
        }
        match check_permission(index, permission, call) {
            Ok(()) => return Verdict::Allow,
            Err(reason) => {
                first_denial.get_or_insert(reason);
            }
        }
    }

    Verdict::Deny(first_denial.unwrap_or(DenyReason::NoMatchingPermission {
        target: call.target,
        selector: selector.unwrap_or_default(),
    }))
}

fn check_permission(index: usize, permission: &Permission, call: &Call) -> Result<(), DenyReason> {
    if let Some(limit) = permission.value_limit {
        if call.value > limit {
            return Err(DenyReason::ValueLimitExceeded { value: call.value, limit });
        }
    }

    let args = permission
        .function
        .decode_arguments(&call.data)
        .map_err(DenyReason::MalformedCall)?;

    for condition in &permission.conditions {
        // Index bounds are checked when the condition is built.
        let holds = args
            .get(condition.index)
            .is_some_and(|word| condition_holds(condition, *word));
        if !holds {
            return Err(DenyReason::ConditionFailed {
                permission: index,
                argument: condition.index,
                condition: condition.condition,
            });
        }
    }
    Ok(())
}

/// Whether `word` satisfies `condition`.
pub fn condition_holds(condition: &ArgumentCondition, word: B256) -> bool {
    let signed = condition.param.is_signed();
    let lhs = ordering_key(word, signed);
    let key = |rhs: B256| ordering_key(rhs, signed);

    match (condition.condition, condition.comparand) {
        (ParamCondition::Equal, Comparand::Word(rhs)) => word == rhs,
        (ParamCondition::NotEqual, Comparand::Word(rhs)) => word != rhs,
        (ParamCondition::GreaterThan, Comparand::Word(rhs)) => lhs > key(rhs),
        (ParamCondition::GreaterThanOrEqual, Comparand::Word(rhs)) => lhs >= key(rhs),
        (ParamCondition::LessThan, Comparand::Word(rhs)) => lhs < key(rhs),
        (ParamCondition::LessThanOrEqual, Comparand::Word(rhs)) => lhs <= key(rhs),
        (ParamCondition::InRange, Comparand::Range { min, max }) => key(min) <= lhs && lhs <= key(max),
        // Shape mismatches are refused at construction.
        _ => false,
    }
}

/// Map a word to an unsigned key with the same ordering as its typed value.
///
/// Flipping the sign bit of a two's complement word turns signed order into unsigned order.
pub(crate) fn ordering_key(word: B256, signed: bool) -> U256 {
    let value = U256::from_be_bytes(word.0);
    if signed {
        value ^ (U256::from(1u8) << 255)
    } else {
        value
    }
}
