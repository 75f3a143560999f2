//! Binary encoding of policy lists.
//!
//! The same bytes feed the permission id, the approval digest and the approval artifact,
//! so encoding must stay deterministic:
//!
//! ```text
//! count u8, then per policy:
//!   0x00                                              sudo
//!   0x01 version u8, permissions u16, per permission:  call policy
//!     target (20) | signature (u16 len + utf8) | limit flag u8 [+ u256]
//!     conditions u8, per condition:
//!       index u8 | condition u8 | 0x00 word (32) or 0x01 min (32) max (32)
//! ```

use alloy_primitives::B256;

use session_policy_types::{CallPolicyVersion, Comparand, ParamCondition};

use crate::{
    abi::FunctionAbi,
    errors::{ConfigError, DecodeError},
    policy::{CallPolicy, Permission, Policy},
    utils::bytes::{read_address, read_fixed, read_str, read_u16_be, read_u256_be, read_u8, write_str},
};

const TAG_SUDO: u8 = 0x00;
const TAG_CALL: u8 = 0x01;
const COMPARAND_WORD: u8 = 0x00;
const COMPARAND_RANGE: u8 = 0x01;

/// Encode `policies`. Counts and indices must fit their wire widths.
pub fn encode_policies(policies: &[Policy]) -> Result<Vec<u8>, ConfigError> {
    let mut out = Vec::new();
    out.push(fit::<u8>("policies", policies.len())?);
    for policy in policies {
        match policy {
            Policy::Sudo => out.push(TAG_SUDO),
            Policy::Call(call_policy) => {
                out.push(TAG_CALL);
                encode_call_policy(&mut out, call_policy)?;
            }
        }
    }
    Ok(out)
}

fn encode_call_policy(out: &mut Vec<u8>, policy: &CallPolicy) -> Result<(), ConfigError> {
    out.push(policy.version as u8);
    out.extend_from_slice(&fit::<u16>("permissions", policy.permissions.len())?.to_be_bytes());
    for permission in &policy.permissions {
        out.extend_from_slice(permission.target.as_slice());
        let signature = permission.function.canonical();
        write_str(out, &signature).map_err(|_| ConfigError::Invalid {
            field: "function",
            reason: format!("signature of {} bytes does not fit the policy encoding", signature.len()),
        })?;
        match permission.value_limit {
            Some(limit) => {
                out.push(1);
                out.extend_from_slice(&limit.to_be_bytes::<32>());
            }
            None => out.push(0),
        }
        out.push(fit::<u8>("conditions", permission.conditions.len())?);
        for condition in &permission.conditions {
            out.push(fit::<u8>("condition index", condition.index)?);
            out.push(condition.condition as u8);
            match condition.comparand {
                Comparand::Word(word) => {
                    out.push(COMPARAND_WORD);
                    out.extend_from_slice(word.as_slice());
                }
                Comparand::Range { min, max } => {
                    out.push(COMPARAND_RANGE);
                    out.extend_from_slice(min.as_slice());
                    out.extend_from_slice(max.as_slice());
                }
            }
        }
    }
    Ok(())
}

fn fit<T: TryFrom<usize>>(field: &'static str, value: usize) -> Result<T, ConfigError> {
    T::try_from(value).map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("{value} does not fit the policy encoding"),
    })
}

/// Decode a policy list starting at `*i`, re-validating every condition.
pub fn decode_policies(bytes: &[u8], i: &mut usize) -> Result<Vec<Policy>, DecodeError> {
    let count = read_u8(bytes, i)?;
    let mut policies = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let policy = match read_u8(bytes, i)? {
            TAG_SUDO => Policy::Sudo,
            TAG_CALL => Policy::Call(decode_call_policy(bytes, i)?),
            other => return Err(DecodeError::UnknownTag(other)),
        };
        policies.push(policy);
    }
    Ok(policies)
}

fn decode_call_policy(bytes: &[u8], i: &mut usize) -> Result<CallPolicy, DecodeError> {
    let version = CallPolicyVersion::try_from(read_u8(bytes, i)?).map_err(DecodeError::UnknownTag)?;
    let count = read_u16_be(bytes, i)?;
    let mut permissions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let target = read_address(bytes, i)?;
        let signature = read_str(bytes, i)?;
        let function =
            FunctionAbi::parse(&signature).map_err(|e| DecodeError::InvalidPolicy(e.to_string()))?;
        let mut permission = Permission::new(target, function);
        match read_u8(bytes, i)? {
            0 => {}
            1 => permission = permission.with_value_limit(read_u256_be(bytes, i)?),
            other => return Err(DecodeError::UnknownTag(other)),
        }

        let conditions = read_u8(bytes, i)?;
        for _ in 0..conditions {
            let index = read_u8(bytes, i)? as usize;
            let condition = ParamCondition::try_from(read_u8(bytes, i)?)
                .map_err(|e| DecodeError::InvalidPolicy(e.to_string()))?;
            let comparand = match read_u8(bytes, i)? {
                COMPARAND_WORD => Comparand::Word(read_fixed::<32>(bytes, i)?),
                COMPARAND_RANGE => {
                    let min: B256 = read_fixed::<32>(bytes, i)?;
                    let max: B256 = read_fixed::<32>(bytes, i)?;
                    Comparand::Range { min, max }
                }
                other => return Err(DecodeError::UnknownTag(other)),
            };
            permission = permission
                .with_condition(index, condition, comparand)
                .map_err(|e| DecodeError::InvalidPolicy(e.to_string()))?;
        }
        permissions.push(permission);
    }
    Ok(CallPolicy { version, permissions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{address_word, uint_word};
    use alloy_primitives::{Address, U256};

    fn sample() -> Vec<Policy> {
        let permission = Permission::new(
            Address::repeat_byte(0x11),
            FunctionAbi::parse("transfer(address,uint256)").unwrap(),
        )
        .with_condition(0, ParamCondition::NotEqual, Comparand::Word(address_word(Address::ZERO)))
        .unwrap()
        .with_condition(
            1,
            ParamCondition::InRange,
            Comparand::Range { min: uint_word(U256::from(1u8)), max: uint_word(U256::from(9u8)) },
        )
        .unwrap()
        .with_value_limit(U256::ZERO);
        let unlimited = Permission::new(
            Address::repeat_byte(0x22),
            FunctionAbi::parse("deposit()").unwrap(),
        );
        vec![Policy::Call(CallPolicy::new(vec![permission, unlimited]))]
    }

    #[test]
    fn decodes_what_it_encodes() {
        let policies = sample();
        let bytes = encode_policies(&policies).unwrap();
        let mut i = 0;
        assert_eq!(decode_policies(&bytes, &mut i).unwrap(), policies);
        assert_eq!(i, bytes.len());
    }

    #[test]
    fn rejects_unknown_condition_bytes() {
        let mut bytes = encode_policies(&sample()).unwrap();
        // count, tag, version, permissions (2), target (20), then the signature length
        let sig_len = u16::from_be_bytes([bytes[25], bytes[26]]) as usize;
        // limit flag + limit, condition count, index, then the condition byte
        let at = 27 + sig_len + 33 + 1 + 1;
        bytes[at] = 0x7f;
        let mut i = 0;
        assert!(matches!(
            decode_policies(&bytes, &mut i),
            Err(DecodeError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn truncated_input_fails() {
        let bytes = encode_policies(&sample()).unwrap();
        let mut i = 0;
        assert_eq!(
            decode_policies(&bytes[..bytes.len() - 1], &mut i),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn oversized_lists_are_refused() {
        let deposit = Permission::new(Address::repeat_byte(0x22), FunctionAbi::parse("deposit()").unwrap());
        let too_many = vec![Policy::Call(CallPolicy::new(vec![deposit.clone()])); 256];
        assert!(matches!(
            encode_policies(&too_many),
            Err(ConfigError::Invalid { field: "policies", .. })
        ));
        assert!(encode_policies(&too_many[..255]).is_ok());

        let wide = vec![Policy::Call(CallPolicy::new(vec![deposit; usize::from(u16::MAX) + 1]))];
        assert!(matches!(
            encode_policies(&wide),
            Err(ConfigError::Invalid { field: "permissions", .. })
        ));
    }
}
