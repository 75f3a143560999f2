use std::sync::Arc;

use alloy_primitives::{Address, Bytes, U256};

use crate::{
    abi::{selector_of, AbiRegistry},
    account::{Account, SessionValidator},
    approval,
    errors::DenyReason,
    kernel::{EntryPointVersion, KernelVersion},
    policy::{address_word, uint_word, Call, CallPolicy, PermissionRule, Policy, Verdict},
    signer::{LocalSigner, Signer},
    utils::kernel::{decode_execute, encode_execute, validation_id_of_nonce, full_nonce, nonce_key},
};

const TOKEN: Address = Address::repeat_byte(0x7c);
const TEN_TOKENS: u128 = 10_000_000_000_000_000_000;

fn transfer(to: Address, amount: U256) -> Call {
    let mut data = selector_of("transfer(address,uint256)").to_vec();
    data.extend_from_slice(address_word(to).as_slice());
    data.extend_from_slice(uint_word(amount).as_slice());
    Call::new(TOKEN, data)
}

fn capped_transfer_policy() -> Policy {
    let rules: Vec<PermissionRule> = serde_json::from_value(serde_json::json!([{
        "target": TOKEN,
        "function": "transfer",
        "args": [
            { "arg": "to", "condition": "NOT_EQUAL", "value": "0x0000000000000000000000000000000000000000" },
            { "arg": "amount", "condition": "LESS_THAN_OR_EQUAL", "value": TEN_TOKENS.to_string() }
        ],
        "valueLimit": "0"
    }]))
    .unwrap();
    let mut registry = AbiRegistry::new();
    registry.register_erc20(TOKEN).unwrap();
    Policy::Call(CallPolicy::from_rules(&registry, &rules).unwrap())
}

fn sample_calls(recipient: Address) -> Vec<Call> {
    vec![
        transfer(recipient, U256::from(TEN_TOKENS)),
        transfer(recipient, U256::from(TEN_TOKENS + 1)),
        transfer(Address::ZERO, U256::from(1u8)),
        transfer(recipient, U256::from(1u8)).with_value(U256::from(1u8)),
        Call::new(TOKEN, Bytes::from(vec![0xde, 0xad])),
        Call::new(Address::repeat_byte(0x01), transfer(recipient, U256::from(1u8)).data),
    ]
}

#[test]
fn test_decoded_artifact_enforces_the_same_policy() {
    let owner = Arc::new(LocalSigner::random());
    let account = Account::create(owner, 11155111, EntryPointVersion::V07, KernelVersion::V3_1);
    let session_key = Arc::new(LocalSigner::random());
    let original = SessionValidator::new(session_key.address(), vec![capped_transfer_policy()], None).unwrap();

    let artifact = approval::serialize(&account, &original).unwrap();
    let rebuilt = approval::deserialize(&artifact, session_key.clone()).unwrap();
    let decoded = rebuilt.regular().unwrap();

    assert_eq!(decoded.permission_id(), original.permission_id());
    assert_eq!(decoded.policies(), original.policies());
    for call in sample_calls(session_key.address()) {
        assert_eq!(decoded.evaluate(&call), original.evaluate(&call));
    }
}

#[test]
fn test_capped_transfer_scenario() {
    let session = Address::repeat_byte(0x5e);
    let validator = SessionValidator::new(session, vec![capped_transfer_policy()], None).unwrap();
    let verdicts: Vec<bool> = sample_calls(session).iter().map(|c| validator.evaluate(c).is_allow()).collect();
    assert_eq!(verdicts, vec![true, false, false, false, false, false]);

    match validator.evaluate(&transfer(session, U256::from(1u8)).with_value(U256::from(1u8))) {
        Verdict::Deny(DenyReason::ValueLimitExceeded { value, limit }) => {
            assert_eq!(value, U256::from(1u8));
            assert_eq!(limit, U256::ZERO);
        }
        other => panic!("unexpected verdict {other:?}"),
    }
}

#[test]
fn test_install_data_matches_artifact_policies() {
    let session = Address::repeat_byte(0x5e);
    let validator = SessionValidator::new(session, vec![capped_transfer_policy()], Some(1_900_000_000)).unwrap();
    let restored = SessionValidator::from_install_data(&validator.install_data()).unwrap();
    assert_eq!(restored.validation_id(), validator.validation_id());
    assert_eq!(restored.valid_until(), Some(1_900_000_000));
    assert_eq!(restored.policy_bytes(), validator.policy_bytes());
}

#[test]
fn test_batch_execution_keeps_call_order() {
    let calls = sample_calls(Address::repeat_byte(0x5e));
    let decoded = decode_execute(&encode_execute(&calls)).unwrap();
    assert_eq!(decoded, calls);

    let single = vec![calls[0].clone()];
    assert_eq!(decode_execute(&encode_execute(&single)).unwrap(), single);
}

#[test]
fn test_session_nonce_routes_to_its_validator() {
    let validator = SessionValidator::new(Address::repeat_byte(0x5e), vec![capped_transfer_policy()], None).unwrap();
    let nonce = full_nonce(nonce_key(validator.validation_id()), 7);
    assert_eq!(validation_id_of_nonce(nonce), validator.validation_id());
}
