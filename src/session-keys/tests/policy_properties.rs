use std::sync::Arc;

use alloy_primitives::{Address, U256};
use proptest::prelude::*;
use session_keys::{
    abi::FunctionAbi,
    approval,
    policy::{address_word, condition_holds, int_word, uint_word},
    Account, Call, CallPolicy, EntryPointVersion, KernelVersion, LocalSigner, Permission, Policy,
    SessionValidator, Signer,
};
use session_policy_types::{ArgumentCondition, Comparand, ParamCondition, ParamType};

fn uint_condition(condition: ParamCondition, comparand: Comparand) -> ArgumentCondition {
    ArgumentCondition { index: 0, param: ParamType::Uint(256), condition, comparand }
}

fn int_condition(condition: ParamCondition, comparand: Comparand) -> ArgumentCondition {
    ArgumentCondition { index: 0, param: ParamType::Int(128), condition, comparand }
}

fn expected<T: Ord>(condition: ParamCondition, lhs: T, rhs: T) -> bool {
    match condition {
        ParamCondition::Equal => lhs == rhs,
        ParamCondition::NotEqual => lhs != rhs,
        ParamCondition::GreaterThan => lhs > rhs,
        ParamCondition::GreaterThanOrEqual => lhs >= rhs,
        ParamCondition::LessThan => lhs < rhs,
        ParamCondition::LessThanOrEqual => lhs <= rhs,
        ParamCondition::InRange => unreachable!("range operators take two bounds"),
    }
}

fn single_word_operator() -> impl Strategy<Value = ParamCondition> {
    prop::sample::select(
        ParamCondition::ALL.into_iter().filter(|op| !op.is_range()).collect::<Vec<_>>(),
    )
}

fn encode_call(target: Address, selector: &[u8], words: &[U256]) -> Call {
    let mut data = selector.to_vec();
    for word in words {
        data.extend_from_slice(uint_word(*word).as_slice());
    }
    Call::new(target, data)
}

const MIXED: &str = "mixed(uint256 amount, int64 delta, address to)";

fn mixed_word(index: usize, raw: i64) -> alloy_primitives::B256 {
    match index {
        0 => uint_word(U256::from(raw as u64)),
        1 => int_word(raw.into()),
        _ => address_word(Address::left_padding_from(&(raw as u64).to_be_bytes())),
    }
}

/// A valid condition on one of the `MIXED` arguments.
fn mixed_condition() -> impl Strategy<Value = (usize, ParamCondition, Comparand)> {
    (0usize..3, prop::sample::select(ParamCondition::ALL.to_vec()), any::<i64>(), any::<i64>()).prop_map(
        |(index, op, a, b)| {
            let comparand = if op.is_range() {
                // The int64 argument orders signed, the others unsigned.
                let (lo, hi) = if index == 1 {
                    (a.min(b), a.max(b))
                } else if (a as u64) <= (b as u64) {
                    (a, b)
                } else {
                    (b, a)
                };
                Comparand::Range { min: mixed_word(index, lo), max: mixed_word(index, hi) }
            } else {
                Comparand::Word(mixed_word(index, a))
            };
            (index, op, comparand)
        },
    )
}

fn mixed_permission() -> impl Strategy<Value = Permission> {
    (
        1u8..4,
        prop::option::of(any::<u64>()),
        prop::collection::vec(mixed_condition(), 0..4),
    )
        .prop_map(|(target, limit, conditions)| {
            let mut permission =
                Permission::new(Address::repeat_byte(target), FunctionAbi::parse(MIXED).unwrap());
            if let Some(limit) = limit {
                permission = permission.with_value_limit(U256::from(limit));
            }
            for (index, op, comparand) in conditions {
                permission = permission.with_condition(index, op, comparand).unwrap();
            }
            permission
        })
}

fn mixed_policies() -> impl Strategy<Value = Vec<Policy>> {
    prop::collection::vec(
        prop::collection::vec(mixed_permission(), 1..4).prop_map(|p| Policy::Call(CallPolicy::new(p))),
        1..3,
    )
}

proptest! {
    #[test]
    fn unsigned_operators_follow_integer_order(
        op in single_word_operator(),
        lhs in any::<u128>(),
        rhs in any::<u128>(),
        high in any::<bool>(),
    ) {
        // Exercise the top bit too; unsigned words must not be sign-interpreted.
        let shift = if high { U256::from(1u8) << 255 } else { U256::ZERO };
        let (lhs, rhs) = (U256::from(lhs) | shift, U256::from(rhs));
        let condition = uint_condition(op, Comparand::Word(uint_word(rhs)));
        prop_assert_eq!(condition_holds(&condition, uint_word(lhs)), expected(op, lhs, rhs));
    }

    #[test]
    fn signed_operators_follow_twos_complement(
        op in single_word_operator(),
        lhs in any::<i128>(),
        rhs in any::<i128>(),
    ) {
        let condition = int_condition(op, Comparand::Word(int_word(rhs)));
        prop_assert_eq!(condition_holds(&condition, int_word(lhs)), expected(op, lhs, rhs));
    }

    #[test]
    fn in_range_is_inclusive(value in any::<i64>(), a in any::<i64>(), b in any::<i64>()) {
        let (min, max) = (a.min(b), a.max(b));
        let signed = int_condition(
            ParamCondition::InRange,
            Comparand::Range { min: int_word(min.into()), max: int_word(max.into()) },
        );
        prop_assert_eq!(condition_holds(&signed, int_word(value.into())), (min..=max).contains(&value));

        let (umin, umax, uvalue) = (min as u64, max as u64, value as u64);
        let (umin, umax) = (umin.min(umax), umin.max(umax));
        let unsigned = uint_condition(
            ParamCondition::InRange,
            Comparand::Range { min: uint_word(U256::from(umin)), max: uint_word(U256::from(umax)) },
        );
        prop_assert_eq!(
            condition_holds(&unsigned, uint_word(U256::from(uvalue))),
            (umin..=umax).contains(&uvalue)
        );
    }

    #[test]
    fn conditions_are_anded_and_permissions_ored(
        a in any::<u64>(),
        b in any::<u64>(),
        cap_a in any::<u64>(),
        cap_b in any::<u64>(),
    ) {
        let target = Address::repeat_byte(0x33);
        let function = FunctionAbi::parse("pair(uint256 a, uint256 b)").unwrap();
        let both = Permission::new(target, function.clone())
            .with_named_condition("a", ParamCondition::LessThanOrEqual, Comparand::Word(uint_word(U256::from(cap_a))))
            .unwrap()
            .with_named_condition("b", ParamCondition::LessThanOrEqual, Comparand::Word(uint_word(U256::from(cap_b))))
            .unwrap();
        let only_b = Permission::new(target, function.clone())
            .with_named_condition("b", ParamCondition::Equal, Comparand::Word(uint_word(U256::from(b))))
            .unwrap();

        let call = encode_call(target, function.selector.as_slice(), &[U256::from(a), U256::from(b)]);

        let strict = SessionValidator::new(
            Address::repeat_byte(0x5e),
            vec![Policy::Call(CallPolicy::new(vec![both.clone()]))],
            None,
        ).unwrap();
        prop_assert_eq!(strict.evaluate(&call).is_allow(), a <= cap_a && b <= cap_b);

        // The second permission always matches `b`, so the policy as a whole allows.
        let either = SessionValidator::new(
            Address::repeat_byte(0x5e),
            vec![Policy::Call(CallPolicy::new(vec![both, only_b]))],
            None,
        ).unwrap();
        prop_assert!(either.evaluate(&call).is_allow());
    }

    #[test]
    fn unknown_targets_never_match(byte in 1u8..=255, amount in any::<u64>()) {
        let function = FunctionAbi::parse("transfer(address to, uint256 amount)").unwrap();
        let permission = Permission::new(Address::ZERO, function.clone());
        let validator = SessionValidator::new(
            Address::repeat_byte(0x5e),
            vec![Policy::Call(CallPolicy::new(vec![permission]))],
            None,
        ).unwrap();
        let call = encode_call(
            Address::repeat_byte(byte),
            function.selector.as_slice(),
            &[U256::ZERO, U256::from(amount)],
        );
        prop_assert!(!validator.evaluate(&call).is_allow());
    }

    #[test]
    fn attached_value_respects_the_limit(
        limit in prop_oneof![Just(None), Just(Some(0u64)), any::<u64>().prop_map(Some)],
        value in prop_oneof![Just(0u64), any::<u64>()],
    ) {
        let target = Address::repeat_byte(0x44);
        let function = FunctionAbi::parse("deposit()").unwrap();
        let mut permission = Permission::new(target, function.clone());
        if let Some(limit) = limit {
            permission = permission.with_value_limit(U256::from(limit));
        }
        let validator = SessionValidator::new(
            Address::repeat_byte(0x5e),
            vec![Policy::Call(CallPolicy::new(vec![permission]))],
            None,
        ).unwrap();

        let call = encode_call(target, function.selector.as_slice(), &[]).with_value(U256::from(value));
        // No limit means unlimited; a zero limit still allows value-free calls.
        let allowed = limit.map_or(true, |limit| value <= limit);
        prop_assert_eq!(validator.evaluate(&call).is_allow(), allowed);
    }

    #[test]
    fn transported_policies_decide_like_the_originals(
        policies in mixed_policies(),
        valid_until in prop::option::of(1u64..=u64::MAX),
        target in 1u8..4,
        amount in any::<u64>(),
        delta in any::<i64>(),
        to in any::<u64>(),
        value in any::<u64>(),
    ) {
        let session_key = Arc::new(LocalSigner::random());
        let original = SessionValidator::new(session_key.address(), policies, valid_until).unwrap();

        let installed = SessionValidator::from_install_data(&original.install_data()).unwrap();
        let owner = Account::create(Arc::new(LocalSigner::random()), 1, EntryPointVersion::V07, KernelVersion::V3_1);
        let artifact = approval::serialize(&owner, &original).unwrap();
        let agent = approval::deserialize(&artifact, session_key).unwrap();
        let approved = agent.regular().unwrap();

        for decoded in [&installed, approved] {
            prop_assert_eq!(decoded.permission_id(), original.permission_id());
            prop_assert_eq!(decoded.valid_until(), original.valid_until());
            prop_assert_eq!(decoded.policies(), original.policies());
        }

        let function = FunctionAbi::parse(MIXED).unwrap();
        let mut data = function.selector.to_vec();
        data.extend_from_slice(mixed_word(0, amount as i64).as_slice());
        data.extend_from_slice(mixed_word(1, delta).as_slice());
        data.extend_from_slice(mixed_word(2, to as i64).as_slice());
        let call = Call::new(Address::repeat_byte(target), data).with_value(U256::from(value));
        let verdict = original.evaluate(&call);
        prop_assert_eq!(installed.evaluate(&call), verdict.clone());
        prop_assert_eq!(approved.evaluate(&call), verdict);
    }
}
