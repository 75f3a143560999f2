use core::{fmt, str::FromStr};

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

/// Comparison operators for argument conditions.
///
/// Wire bytes follow the call-policy `ParamCondition` numbering; `InRange` is
/// an extension that compares against an inclusive `[min, max]` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ParamCondition {
    Equal = 0x00,
    GreaterThan = 0x01,
    LessThan = 0x02,
    GreaterThanOrEqual = 0x03,
    LessThanOrEqual = 0x04,
    NotEqual = 0x05,
    InRange = 0x06,
}

impl ParamCondition {
    pub const ALL: [ParamCondition; 7] = [
        ParamCondition::Equal,
        ParamCondition::GreaterThan,
        ParamCondition::LessThan,
        ParamCondition::GreaterThanOrEqual,
        ParamCondition::LessThanOrEqual,
        ParamCondition::NotEqual,
        ParamCondition::InRange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamCondition::Equal => "EQUAL",
            ParamCondition::GreaterThan => "GREATER_THAN",
            ParamCondition::LessThan => "LESS_THAN",
            ParamCondition::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            ParamCondition::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            ParamCondition::NotEqual => "NOT_EQUAL",
            ParamCondition::InRange => "IN_RANGE",
        }
    }

    /// Whether the operator takes a `[min, max]` comparand instead of a single word.
    pub fn is_range(self) -> bool {
        matches!(self, ParamCondition::InRange)
    }
}

impl fmt::Display for ParamCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when an operator byte or name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown condition operator `{0}`")]
pub struct UnknownCondition(pub String);

impl TryFrom<u8> for ParamCondition {
    type Error = UnknownCondition;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ParamCondition::*;
        let op = match value {
            0x00 => Equal,
            0x01 => GreaterThan,
            0x02 => LessThan,
            0x03 => GreaterThanOrEqual,
            0x04 => LessThanOrEqual,
            0x05 => NotEqual,
            0x06 => InRange,
            _ => return Err(UnknownCondition(format!("0x{value:02x}"))),
        };
        Ok(op)
    }
}

impl FromStr for ParamCondition {
    type Err = UnknownCondition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ParamCondition::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownCondition(wanted.to_string()))
    }
}

/// Solidity parameter types understood by the calldata decoder.
///
/// Tuples are not supported.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParamType {
    Address,
    Bool,
    Uint(usize),
    Int(usize),
    FixedBytes(usize),
    Bytes,
    String,
    Array(Box<ParamType>),
    FixedArray(Box<ParamType>, usize),
}

impl ParamType {
    pub fn is_dynamic(&self) -> bool {
        match self {
            ParamType::Bytes | ParamType::String | ParamType::Array(_) => true,
            ParamType::FixedArray(inner, _) => inner.is_dynamic(),
            _ => false,
        }
    }

    /// Number of 32-byte words the parameter occupies in the head section.
    pub fn head_words(&self) -> usize {
        match self {
            ParamType::FixedArray(inner, len) if !inner.is_dynamic() => inner.head_words() * len,
            _ => 1,
        }
    }

    /// Elementary static types that fit in a single ABI word; only these can carry conditions.
    pub fn is_word(&self) -> bool {
        matches!(
            self,
            ParamType::Address
                | ParamType::Bool
                | ParamType::Uint(_)
                | ParamType::Int(_)
                | ParamType::FixedBytes(_)
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, ParamType::Int(_))
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Address => f.write_str("address"),
            ParamType::Bool => f.write_str("bool"),
            ParamType::Uint(bits) => write!(f, "uint{bits}"),
            ParamType::Int(bits) => write!(f, "int{bits}"),
            ParamType::FixedBytes(len) => write!(f, "bytes{len}"),
            ParamType::Bytes => f.write_str("bytes"),
            ParamType::String => f.write_str("string"),
            ParamType::Array(inner) => write!(f, "{inner}[]"),
            ParamType::FixedArray(inner, len) => write!(f, "{inner}[{len}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported parameter type `{0}`")]
pub struct UnknownParamType(pub String);

impl FromStr for ParamType {
    type Err = UnknownParamType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unknown = || UnknownParamType(s.to_string());

        if let Some(stripped) = s.strip_suffix(']') {
            let open = stripped.rfind('[').ok_or_else(unknown)?;
            let inner: ParamType = stripped[..open].parse()?;
            let size = &stripped[open + 1..];
            if size.is_empty() {
                return Ok(ParamType::Array(Box::new(inner)));
            }
            let len: usize = size.parse().map_err(|_| unknown())?;
            if len == 0 {
                return Err(unknown());
            }
            return Ok(ParamType::FixedArray(Box::new(inner), len));
        }

        let ty = match s {
            "address" => ParamType::Address,
            "bool" => ParamType::Bool,
            "string" => ParamType::String,
            "bytes" => ParamType::Bytes,
            "uint" => ParamType::Uint(256),
            "int" => ParamType::Int(256),
            _ => {
                if let Some(bits) = s.strip_prefix("uint") {
                    ParamType::Uint(parse_bits(bits).ok_or_else(unknown)?)
                } else if let Some(bits) = s.strip_prefix("int") {
                    ParamType::Int(parse_bits(bits).ok_or_else(unknown)?)
                } else if let Some(len) = s.strip_prefix("bytes") {
                    let len: usize = len.parse().map_err(|_| unknown())?;
                    if !(1..=32).contains(&len) {
                        return Err(unknown());
                    }
                    ParamType::FixedBytes(len)
                } else {
                    return Err(unknown());
                }
            }
        };
        Ok(ty)
    }
}

fn parse_bits(bits: &str) -> Option<usize> {
    let bits: usize = bits.parse().ok()?;
    (bits % 8 == 0 && (8..=256).contains(&bits)).then_some(bits)
}

/// Right-hand side of an argument condition, as raw 32-byte ABI words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparand {
    Word(B256),
    Range { min: B256, max: B256 },
}

/// A single argument check inside a permission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgumentCondition {
    /// Position of the argument in the function's parameter list.
    pub index: usize,
    /// Declared type of the argument, used for signedness.
    pub param: ParamType,
    pub condition: ParamCondition,
    pub comparand: Comparand,
}

/// Call-policy encoding versions this build understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CallPolicyVersion {
    #[serde(rename = "0.0.4")]
    V0_0_4 = 0x04,
}

impl TryFrom<u8> for CallPolicyVersion {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x04 => Ok(CallPolicyVersion::V0_0_4),
            other => Err(other),
        }
    }
}
