//! Minimal big-endian parsing helpers.
//!
//! These helpers are used for parsing approval artifacts and policy install data.

use std::num::TryFromIntError;

use alloy_primitives::{Address, FixedBytes, U256};

use crate::errors::DecodeError;

pub fn read_vec(bytes: &[u8], i: &mut usize, len: usize) -> Result<Vec<u8>, DecodeError> {
    if bytes.len() < *i + len {
        return Err(DecodeError::Truncated);
    }
    let out = bytes[*i..*i + len].to_vec();
    *i += len;
    Ok(out)
}

pub fn read_u8(bytes: &[u8], i: &mut usize) -> Result<u8, DecodeError> {
    let b = *bytes.get(*i).ok_or(DecodeError::Truncated)?;
    *i += 1;
    Ok(b)
}

pub fn read_u16_be(bytes: &[u8], i: &mut usize) -> Result<u16, DecodeError> {
    Ok(u16::from_be_bytes(read_array(bytes, i)?))
}

pub fn read_u64_be(bytes: &[u8], i: &mut usize) -> Result<u64, DecodeError> {
    Ok(u64::from_be_bytes(read_array(bytes, i)?))
}

pub fn read_u256_be(bytes: &[u8], i: &mut usize) -> Result<U256, DecodeError> {
    if bytes.len() < *i + 32 {
        return Err(DecodeError::Truncated);
    }
    let out = U256::from_be_slice(&bytes[*i..*i + 32]);
    *i += 32;
    Ok(out)
}

pub fn read_fixed<const N: usize>(bytes: &[u8], i: &mut usize) -> Result<FixedBytes<N>, DecodeError> {
    Ok(FixedBytes(read_array(bytes, i)?))
}

pub fn read_address(bytes: &[u8], i: &mut usize) -> Result<Address, DecodeError> {
    if bytes.len() < *i + 20 {
        return Err(DecodeError::Truncated);
    }
    let addr = Address::from_slice(&bytes[*i..*i + 20]);
    *i += 20;
    Ok(addr)
}

/// Reads a `u16`-length-prefixed UTF-8 string.
pub fn read_str(bytes: &[u8], i: &mut usize) -> Result<String, DecodeError> {
    let len = read_u16_be(bytes, i)? as usize;
    let raw = read_vec(bytes, i, len)?;
    String::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)
}

/// Length-prefixed UTF-8. Strings longer than `u16::MAX` bytes do not fit.
pub fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<(), TryFromIntError> {
    buf.extend_from_slice(&u16::try_from(s.len())?.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_array<const N: usize>(bytes: &[u8], i: &mut usize) -> Result<[u8; N], DecodeError> {
    if bytes.len() < *i + N {
        return Err(DecodeError::Truncated);
    }
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[*i..*i + N]);
    *i += N;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_advance_the_cursor() {
        let mut buf = vec![0x01, 0x00, 0x02];
        write_str(&mut buf, "ok").unwrap();
        let mut i = 0;
        assert_eq!(read_u8(&buf, &mut i), Ok(1));
        assert_eq!(read_u16_be(&buf, &mut i), Ok(2));
        assert_eq!(read_str(&buf, &mut i).as_deref(), Ok("ok"));
        assert_eq!(i, buf.len());
        assert_eq!(read_u8(&buf, &mut i), Err(DecodeError::Truncated));
    }

    #[test]
    fn truncated_word_is_rejected() {
        let mut i = 0;
        assert_eq!(read_u256_be(&[0u8; 31], &mut i), Err(DecodeError::Truncated));
        assert_eq!(i, 0);
    }
}
