//! Kernel v3 / ERC-4337 encodings.
//!
//! Validation ids, nonce keys, `execute` call data, validator (un)install call data and the
//! v0.7 user operation hash.

use alloy_primitives::{Address, Bytes, FixedBytes, B256, U256};
use alloy_sol_types::{SolCall, SolValue};

use crate::{
    errors::CallDecodeError,
    kernel::{
        constants::{
            CALLTYPE_BATCH, CALLTYPE_SINGLE, HOOK_NOT_REQUIRED, VALIDATION_MODE_DEFAULT,
            VALIDATION_TYPE_PERMISSION, VALIDATION_TYPE_ROOT,
        },
        interfaces::{Execution, IKernel, PackedUserOperation, ValidationConfig},
        PermissionId, ValidationId,
    },
    policy::Call,
    utils::crypto::keccak256_bytes,
};

/// Permission id of a session: `keccak256(session || policyBytes)[0..4]`.
pub fn permission_id(session: Address, policy_bytes: &[u8]) -> PermissionId {
    let mut buf = Vec::with_capacity(20 + policy_bytes.len());
    buf.extend_from_slice(session.as_slice());
    buf.extend_from_slice(policy_bytes);
    FixedBytes::from_slice(&keccak256_bytes(&buf)[..4])
}

/// `0x02 || permissionId || 0x00..` as a 21-byte validation id.
pub fn permission_validation_id(permission_id: PermissionId) -> ValidationId {
    let mut id = [0u8; 21];
    id[0] = VALIDATION_TYPE_PERMISSION;
    id[1..5].copy_from_slice(permission_id.as_slice());
    FixedBytes(id)
}

/// The root validator's id. For EIP-7702 accounts the root is the account's own EOA key.
pub fn root_validation_id() -> ValidationId {
    let mut id = [0u8; 21];
    id[0] = VALIDATION_TYPE_ROOT;
    FixedBytes(id)
}

/// 192-bit EntryPoint nonce key: `mode (1) || validationId (21) || key (2)`.
pub fn nonce_key(validation_id: ValidationId) -> U256 {
    let mut key = [0u8; 32];
    key[8] = VALIDATION_MODE_DEFAULT;
    key[9..30].copy_from_slice(validation_id.as_slice());
    U256::from_be_bytes(key)
}

/// Validation id encoded in the top 192 bits of a full EntryPoint nonce.
pub fn validation_id_of_nonce(nonce: U256) -> ValidationId {
    let bytes = nonce.to_be_bytes::<32>();
    FixedBytes::from_slice(&bytes[1..22])
}

/// `key << 64 | sequence`.
pub fn full_nonce(key: U256, sequence: u64) -> U256 {
    (key << 64) | U256::from(sequence)
}

fn exec_mode(call_type: u8) -> B256 {
    let mut mode = [0u8; 32];
    mode[0] = call_type;
    FixedBytes(mode)
}

/// `execute(execMode, executionCalldata)` for one call (packed) or several (ABI batch).
pub fn encode_execute(calls: &[Call]) -> Bytes {
    let (mode, payload) = match calls {
        [call] => {
            let mut packed = Vec::with_capacity(52 + call.data.len());
            packed.extend_from_slice(call.target.as_slice());
            packed.extend_from_slice(&call.value.to_be_bytes::<32>());
            packed.extend_from_slice(&call.data);
            (exec_mode(CALLTYPE_SINGLE), packed)
        }
        _ => {
            let executions: Vec<Execution> = calls
                .iter()
                .map(|c| Execution { target: c.target, value: c.value, callData: c.data.clone() })
                .collect();
            (exec_mode(CALLTYPE_BATCH), executions.abi_encode())
        }
    };
    IKernel::executeCall { execMode: mode, executionCalldata: payload.into() }
        .abi_encode()
        .into()
}

/// Inverse of [`encode_execute`].
pub fn decode_execute(calldata: &[u8]) -> Result<Vec<Call>, CallDecodeError> {
    if calldata.len() < 4 {
        return Err(CallDecodeError::MissingSelector);
    }
    if calldata[..4] != IKernel::executeCall::SELECTOR {
        return Err(CallDecodeError::SelectorMismatch);
    }
    let call = IKernel::executeCall::abi_decode(calldata, true)
        .map_err(|_| CallDecodeError::Truncated)?;
    let payload = call.executionCalldata.as_ref();
    match call.execMode[0] {
        CALLTYPE_SINGLE => {
            if payload.len() < 52 {
                return Err(CallDecodeError::Truncated);
            }
            Ok(vec![Call {
                target: Address::from_slice(&payload[..20]),
                value: U256::from_be_slice(&payload[20..52]),
                data: Bytes::copy_from_slice(&payload[52..]),
            }])
        }
        CALLTYPE_BATCH => {
            let executions = Vec::<Execution>::abi_decode(payload, true)
                .map_err(|_| CallDecodeError::Truncated)?;
            Ok(executions
                .into_iter()
                .map(|e| Call { target: e.target, value: e.value, data: e.callData })
                .collect())
        }
        _ => Err(CallDecodeError::SelectorMismatch),
    }
}

/// `installValidations` for a single permission validator with no hook.
pub fn encode_install_validation(
    validation_id: ValidationId,
    validation_nonce: u32,
    validation_data: Bytes,
) -> Bytes {
    IKernel::installValidationsCall {
        vIds: vec![validation_id],
        configs: vec![ValidationConfig { nonce: validation_nonce, hook: HOOK_NOT_REQUIRED }],
        validationData: vec![validation_data],
        hookData: vec![Bytes::new()],
    }
    .abi_encode()
    .into()
}

pub fn encode_uninstall_validation(validation_id: ValidationId) -> Bytes {
    IKernel::uninstallValidationCall {
        vId: validation_id,
        deinitData: Bytes::new(),
        hookDeinitData: Bytes::new(),
    }
    .abi_encode()
    .into()
}

/// Two 128-bit values packed into one word, high half first.
pub fn pack_u128_pair(high: u128, low: u128) -> B256 {
    let mut word = [0u8; 32];
    word[..16].copy_from_slice(&high.to_be_bytes());
    word[16..].copy_from_slice(&low.to_be_bytes());
    FixedBytes(word)
}

/// ERC-4337 v0.7 user operation hash. The signature field is not covered.
pub fn user_op_hash(op: &PackedUserOperation, entry_point: Address, chain_id: u64) -> B256 {
    let inner = (
        op.sender,
        op.nonce,
        keccak256_bytes(&op.initCode),
        keccak256_bytes(&op.callData),
        op.accountGasLimits,
        op.preVerificationGas,
        op.gasFees,
        keccak256_bytes(&op.paymasterAndData),
    )
        .abi_encode();
    let outer = (keccak256_bytes(&inner), entry_point, U256::from(chain_id)).abi_encode();
    keccak256_bytes(&outer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(byte: u8, value: u64) -> Call {
        Call {
            target: Address::repeat_byte(byte),
            value: U256::from(value),
            data: Bytes::from(vec![0xde, 0xad, byte]),
        }
    }

    #[test]
    fn validation_ids_and_nonce_keys() {
        let pid = FixedBytes::from([1, 2, 3, 4]);
        let vid = permission_validation_id(pid);
        assert_eq!(vid[0], VALIDATION_TYPE_PERMISSION);
        assert_eq!(&vid[1..5], &[1, 2, 3, 4]);
        assert!(vid[5..].iter().all(|b| *b == 0));

        let nonce = full_nonce(nonce_key(vid), 9);
        assert_eq!(validation_id_of_nonce(nonce), vid);
        assert_eq!(nonce & U256::from(u64::MAX), U256::from(9u64));

        assert_eq!(nonce_key(root_validation_id()), U256::ZERO);
    }

    #[test]
    fn permission_id_depends_on_session_and_policy() {
        let a = permission_id(Address::repeat_byte(1), b"policy");
        assert_eq!(a, permission_id(Address::repeat_byte(1), b"policy"));
        assert_ne!(a, permission_id(Address::repeat_byte(2), b"policy"));
        assert_ne!(a, permission_id(Address::repeat_byte(1), b"policy2"));
    }

    #[test]
    fn execute_single_and_batch() {
        let single = vec![call(1, 5)];
        let encoded = encode_execute(&single);
        assert_eq!(&encoded[..4], IKernel::executeCall::SELECTOR.as_slice());
        assert_eq!(decode_execute(&encoded).unwrap(), single);

        let batch = vec![call(1, 0), call(2, 7), call(3, 0)];
        assert_eq!(decode_execute(&encode_execute(&batch)).unwrap(), batch);
    }

    #[test]
    fn rejects_foreign_calldata() {
        assert_eq!(decode_execute(&[0xa9, 0x05]), Err(CallDecodeError::MissingSelector));
        let uninstall = encode_uninstall_validation(root_validation_id());
        assert_eq!(decode_execute(&uninstall), Err(CallDecodeError::SelectorMismatch));
    }

    #[test]
    fn packs_gas_words() {
        let word = pack_u128_pair(1, 2);
        assert_eq!(word[15], 1);
        assert_eq!(word[31], 2);
    }
}
