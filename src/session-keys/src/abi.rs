use std::collections::HashMap;

use alloy_primitives::{Address, FixedBytes, B256, U256};

use session_policy_types::ParamType;

use crate::{
    errors::{CallDecodeError, ConfigError},
    utils::crypto::keccak256_bytes,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbiParam {
    pub name: Option<String>,
    pub ty: ParamType,
}

/// A function's declared parameter list and selector.
///
/// Equality ignores parameter names; they never reach the wire.
#[derive(Clone, Debug)]
pub struct FunctionAbi {
    pub name: String,
    pub params: Vec<AbiParam>,
    pub selector: FixedBytes<4>,
}

impl PartialEq for FunctionAbi {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.selector == other.selector
            && self.params.len() == other.params.len()
            && self.params.iter().zip(&other.params).all(|(a, b)| a.ty == b.ty)
    }
}

impl Eq for FunctionAbi {}

impl FunctionAbi {
    /// Parse `name(type [name], ...)`, eg `transfer(address to, uint256 amount)`.
    pub fn parse(signature: &str) -> Result<Self, ConfigError> {
        let sig = signature.trim();
        let invalid = || ConfigError::InvalidSignature(signature.to_string());

        let open = sig.find('(').ok_or_else(invalid)?;
        let inner = sig[open + 1..].strip_suffix(')').ok_or_else(invalid)?;
        let name = sig[..open].trim();
        let valid_name = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name || inner.contains('(') {
            return Err(invalid());
        }

        let mut params = Vec::new();
        if !inner.trim().is_empty() {
            for part in inner.split(',') {
                let mut words = part.split_whitespace();
                let ty: ParamType = words.next().ok_or_else(invalid)?.parse()?;
                let mut param_name = None;
                for word in words {
                    match word {
                        "memory" | "calldata" | "storage" => {}
                        w if param_name.is_none() => param_name = Some(w.to_string()),
                        _ => return Err(invalid()),
                    }
                }
                params.push(AbiParam { name: param_name, ty });
            }
        }

        let mut abi = Self { name: name.to_string(), params, selector: FixedBytes::ZERO };
        abi.selector = selector_of(&abi.canonical());
        Ok(abi)
    }

    /// Canonical signature used for the selector: `transfer(address,uint256)`.
    pub fn canonical(&self) -> String {
        let types: Vec<String> = self.params.iter().map(|p| p.ty.to_string()).collect();
        format!("{}({})", self.name, types.join(","))
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name.as_deref() == Some(name))
    }

    fn head_len(&self) -> usize {
        self.params.iter().map(|p| p.ty.head_words()).sum::<usize>() * 32
    }

    /// Decode the head word of every parameter in `calldata`.
    ///
    /// Static words are checked against their declared type (no dirty high bits, bools in
    /// {0, 1}); dynamic parameters must point inside the call data.
    pub fn decode_arguments(&self, calldata: &[u8]) -> Result<Vec<B256>, CallDecodeError> {
        if calldata.len() < 4 {
            return Err(CallDecodeError::MissingSelector);
        }
        if calldata[..4] != self.selector[..] {
            return Err(CallDecodeError::SelectorMismatch);
        }
        let body = &calldata[4..];
        let head_len = self.head_len();
        if body.len() < head_len {
            return Err(CallDecodeError::Truncated);
        }

        let mut words = Vec::with_capacity(self.params.len());
        let mut offset = 0usize;
        for (index, param) in self.params.iter().enumerate() {
            let word = B256::from_slice(&body[offset..offset + 32]);
            if param.ty.is_dynamic() {
                let ptr = U256::from_be_bytes(word.0);
                let end = ptr.checked_add(U256::from(32));
                if ptr < U256::from(head_len) || end.map_or(true, |end| end > U256::from(body.len())) {
                    return Err(CallDecodeError::BadOffset { index });
                }
            } else {
                let elements = param.ty.head_words();
                let elem_ty = match &param.ty {
                    ParamType::FixedArray(inner, _) => inner.as_ref(),
                    ty => ty,
                };
                for k in 0..elements {
                    let at = offset + k * 32;
                    let elem = B256::from_slice(&body[at..at + 32]);
                    if elem_ty.is_word() && !word_fits(elem_ty, &elem) {
                        return Err(CallDecodeError::DirtyWord { index });
                    }
                }
            }
            words.push(word);
            offset += param.ty.head_words() * 32;
        }
        Ok(words)
    }
}

/// First four bytes of `keccak256(canonical)`.
pub fn selector_of(canonical: &str) -> FixedBytes<4> {
    FixedBytes::from_slice(&keccak256_bytes(canonical.as_bytes())[..4])
}

/// Whether `word` is a valid ABI encoding of an elementary value of type `ty`.
pub(crate) fn word_fits(ty: &ParamType, word: &B256) -> bool {
    let value = U256::from_be_bytes(word.0);
    match ty {
        ParamType::Address => word[..12].iter().all(|b| *b == 0),
        ParamType::Bool => value <= U256::from(1u8),
        ParamType::Uint(bits) => *bits == 256 || (value >> *bits).is_zero(),
        ParamType::Int(bits) => {
            if *bits == 256 {
                return true;
            }
            // Sign extension: every bit above `bits - 1` equals the sign bit.
            let high = value >> (*bits - 1);
            high.is_zero() || high == (U256::MAX >> (*bits - 1))
        }
        ParamType::FixedBytes(len) => word[*len..].iter().all(|b| *b == 0),
        _ => true,
    }
}

/// Maps `(target, function)` to declared parameter types.
#[derive(Clone, Debug, Default)]
pub struct AbiRegistry {
    functions: HashMap<(Address, String), FunctionAbi>,
}

impl AbiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target: Address, signature: &str) -> Result<&FunctionAbi, ConfigError> {
        let abi = FunctionAbi::parse(signature)?;
        let key = (target, abi.canonical());
        Ok(self.functions.entry(key).or_insert(abi))
    }

    /// `transfer`, `approve` and `transferFrom` of an ERC-20 token.
    pub fn register_erc20(&mut self, token: Address) -> Result<(), ConfigError> {
        self.register(token, "transfer(address to, uint256 amount)")?;
        self.register(token, "approve(address spender, uint256 amount)")?;
        self.register(token, "transferFrom(address from, address to, uint256 amount)")?;
        Ok(())
    }

    /// Look up by full signature (`transfer(address,uint256)`) or, when unambiguous for the
    /// target, by bare name (`transfer`).
    pub fn lookup(&self, target: Address, function: &str) -> Result<&FunctionAbi, ConfigError> {
        let unknown = || ConfigError::UnknownFunction {
            target,
            signature: function.to_string(),
        };

        if function.contains('(') {
            let canonical = FunctionAbi::parse(function)?.canonical();
            return self.functions.get(&(target, canonical)).ok_or_else(unknown);
        }

        let mut matches = self
            .functions
            .iter()
            .filter(|((t, _), abi)| *t == target && abi.name == function.trim())
            .map(|(_, abi)| abi);
        match (matches.next(), matches.next()) {
            (Some(abi), None) => Ok(abi),
            _ => Err(unknown()),
        }
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
