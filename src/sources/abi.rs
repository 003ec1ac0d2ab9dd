//! Minimal Solidity ABI support for the handful of calls we make.
//!
//! Positions passed to [`AbiDecoder`] are absolute byte offsets into the
//! return data; dynamic members are resolved relative to their enclosing
//! tuple, per the Solidity ABI.

use anyhow::{anyhow, bail, Context, Result};
use num_bigint::BigUint;
use sha3::{Digest, Keccak256};

pub const WORD: usize = 32;

/// First four bytes of keccak256 of the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn push_u64_word(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&[0u8; 24]);
    out.extend_from_slice(&value.to_be_bytes());
}

/// Calldata for `f(uint256[])`.
pub fn encode_uint256_array_call(selector: [u8; 4], values: &[u64]) -> String {
    let mut out = Vec::with_capacity(4 + WORD * (2 + values.len()));
    out.extend_from_slice(&selector);
    push_u64_word(&mut out, WORD as u64);
    push_u64_word(&mut out, values.len() as u64);
    for v in values {
        push_u64_word(&mut out, *v);
    }
    format!("0x{}", hex::encode(out))
}

/// Calldata for `f(address,uint256)`.
pub fn encode_address_uint_call(selector: [u8; 4], address: &str, value: u64) -> Result<String> {
    let addr = parse_address(address)?;
    let mut out = Vec::with_capacity(4 + WORD * 2);
    out.extend_from_slice(&selector);
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&addr);
    push_u64_word(&mut out, value);
    Ok(format!("0x{}", hex::encode(out)))
}

pub fn parse_address(address: &str) -> Result<[u8; 20]> {
    let trimmed = address.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if body.len() != 40 {
        bail!("invalid address {:?}: expected 20 bytes", address);
    }
    let bytes = hex::decode(body).with_context(|| format!("invalid address {:?}", address))?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// `base + rel` for offsets read out of return data.
pub fn offset(base: usize, rel: usize) -> Result<usize> {
    base.checked_add(rel)
        .ok_or_else(|| anyhow!("offset {} + {} overflows", base, rel))
}

/// Position of the `i`th word after `base`.
pub fn slot(base: usize, i: usize) -> Result<usize> {
    WORD.checked_mul(i)
        .ok_or_else(|| anyhow!("word index {} overflows", i))
        .and_then(|rel| offset(base, rel))
}

/// Decode an `eth_call` hex result into bytes.
pub fn decode_hex_result(result: &str) -> Result<Vec<u8>> {
    let body = result.trim().trim_start_matches("0x");
    hex::decode(body).context("failed to decode hex response")
}

pub struct AbiDecoder<'a> {
    data: &'a [u8],
}

impl<'a> AbiDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn word(&self, pos: usize) -> Result<&'a [u8]> {
        let end = pos
            .checked_add(WORD)
            .ok_or_else(|| anyhow!("word offset overflow at {}", pos))?;
        self.data.get(pos..end).ok_or_else(|| {
            anyhow!(
                "return data too short: need {} bytes, have {}",
                end,
                self.data.len()
            )
        })
    }

    pub fn uint(&self, pos: usize) -> Result<BigUint> {
        Ok(BigUint::from_bytes_be(self.word(pos)?))
    }

    /// A uint256 word that must fit in 64 bits.
    pub fn uint_u64(&self, pos: usize) -> Result<u64> {
        let word = self.word(pos)?;
        if word[..24].iter().any(|b| *b != 0) {
            bail!("uint256 at {} does not fit in u64", pos);
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&word[24..32]);
        Ok(u64::from_be_bytes(buf))
    }

    /// Offsets and lengths.
    pub fn usize_at(&self, pos: usize) -> Result<usize> {
        let value = self.uint_u64(pos)?;
        usize::try_from(value).map_err(|_| anyhow!("offset {} out of range", value))
    }

    pub fn uint16(&self, pos: usize) -> Result<u16> {
        let value = self.uint_u64(pos)?;
        u16::try_from(value).map_err(|_| anyhow!("uint16 at {} out of range: {}", pos, value))
    }

    /// int16 is sign-extended to 256 bits; the low two bytes carry the value.
    pub fn int16(&self, pos: usize) -> Result<i16> {
        let word = self.word(pos)?;
        Ok(i16::from_be_bytes([word[30], word[31]]))
    }

    pub fn bool(&self, pos: usize) -> Result<bool> {
        match self.uint_u64(pos)? {
            0 => Ok(false),
            1 => Ok(true),
            other => bail!("invalid bool {} at {}", other, pos),
        }
    }

    /// Lowercase 0x-prefixed address.
    pub fn address(&self, pos: usize) -> Result<String> {
        let word = self.word(pos)?;
        Ok(format!("0x{}", hex::encode(&word[12..32])))
    }

    /// `string` whose length word sits at `pos`.
    pub fn string(&self, pos: usize) -> Result<String> {
        let len = self.usize_at(pos)?;
        let start = offset(pos, WORD)?;
        let bytes = start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| anyhow!("string at {} overruns return data", pos))?;
        String::from_utf8(bytes.to_vec()).with_context(|| format!("string at {} is not UTF-8", pos))
    }

    /// `uint16[]` whose length word sits at `pos`.
    pub fn u16_array(&self, pos: usize) -> Result<Vec<u16>> {
        let len = self.usize_at(pos)?;
        let first = offset(pos, WORD)?;
        (0..len).map(|i| self.uint16(slot(first, i)?)).collect()
    }

    /// Fixed `uint16[N]` laid out inline starting at `pos`.
    pub fn u16_fixed(&self, pos: usize, n: usize) -> Result<Vec<u16>> {
        (0..n).map(|i| self.uint16(slot(pos, i)?)).collect()
    }

    /// Fixed `int16[N]` laid out inline starting at `pos`.
    pub fn i16_fixed(&self, pos: usize, n: usize) -> Result<Vec<i16>> {
        (0..n).map(|i| self.int16(slot(pos, i)?)).collect()
    }

    /// Absolute positions of the elements of a top-level dynamic array of
    /// dynamic tuples returned as the only output.
    pub fn dynamic_tuple_array(&self) -> Result<Vec<usize>> {
        let array_pos = self.usize_at(0)?;
        let len = self.usize_at(array_pos)?;
        let base = offset(array_pos, WORD)?;
        (0..len)
            .map(|i| offset(base, self.usize_at(slot(base, i)?)?))
            .collect()
    }
}
