//! LZ4 block compression into a caller-provided buffer.
//!
//! The hash table lives in the caller's workspace so a stride compression
//! performs no allocation of its own.

use super::constants::{HASH_SIZE_U32, LAST_LITERALS, MAX_DISTANCE, MF_LIMIT, MIN_MATCH};
use crate::{Error, Result};

const HASH_LOG: u32 = 14;
const HASH_MASK: usize = HASH_SIZE_U32 - 1;

/// Acceleration factor for faster skipping.
const SKIP_TRIGGER: usize = 6;

/// Fast hash using Knuth multiplicative method.
#[inline(always)]
fn hash(val: u32) -> usize {
    (val.wrapping_mul(2_654_435_761) >> (32 - HASH_LOG)) as usize & HASH_MASK
}

#[inline(always)]
fn read_u32(input: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([input[pos], input[pos + 1], input[pos + 2], input[pos + 3]])
}

/// Bounded output cursor. Every write is checked so the compressor can never
/// run past the staging buffer.
struct Sink<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Sink<'_> {
    fn overflow(&self, extra: usize) -> Error {
        Error::BufferTooSmall { needed: self.pos + extra, available: self.buf.len() }
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        if self.pos >= self.buf.len() {
            return Err(self.overflow(1));
        }
        self.buf[self.pos] = byte;
        self.pos += 1;
        Ok(())
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(self.overflow(bytes.len()));
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    /// Emit variable-length encoding.
    fn length(&mut self, mut len: usize) -> Result<()> {
        while len >= 255 {
            self.push(255)?;
            len -= 255;
        }
        self.push(len as u8)
    }
}

/// Count matching bytes between `earlier` and `ip`, stopping at `limit`.
#[inline(always)]
fn count_match(input: &[u8], earlier: usize, ip: usize, limit: usize) -> usize {
    let mut n = 0;
    while ip + n + 8 <= limit {
        let a = u64::from_le_bytes(input[earlier + n..earlier + n + 8].try_into().unwrap_or([0; 8]));
        let b = u64::from_le_bytes(input[ip + n..ip + n + 8].try_into().unwrap_or([0; 8]));
        let diff = a ^ b;
        if diff != 0 {
            return n + (diff.trailing_zeros() as usize >> 3);
        }
        n += 8;
    }
    while ip + n < limit && input[earlier + n] == input[ip + n] {
        n += 1;
    }
    n
}

/// Compress `input` in LZ4 block format into `output`.
///
/// `table` is the codec working memory and must hold at least
/// [`HASH_SIZE_U32`] entries. Returns the number of bytes written.
///
/// # Errors
///
/// Returns [`Error::BufferTooSmall`] if `output` cannot hold the result and
/// [`Error::InvalidInput`] if the table is undersized or the input is larger
/// than a match offset can address in the hash table.
pub fn compress_into(input: &[u8], output: &mut [u8], table: &mut [u32]) -> Result<usize> {
    if table.len() < HASH_SIZE_U32 {
        return Err(Error::InvalidInput(format!(
            "hash table needs {HASH_SIZE_U32} entries, got {}",
            table.len()
        )));
    }
    if u32::try_from(input.len()).is_err() {
        return Err(Error::InvalidInput(format!("input of {} bytes is too large", input.len())));
    }

    let mut out = Sink { buf: output, pos: 0 };
    if input.is_empty() {
        return Ok(0);
    }

    let input_len = input.len();
    if input_len <= MF_LIMIT {
        // Too short for compression, emit as literals
        emit_last_literals(&mut out, input)?;
        return Ok(out.pos);
    }

    let table = &mut table[..HASH_SIZE_U32];
    table.fill(0);

    let match_limit = input_len - LAST_LITERALS;
    let mf_limit = input_len - MF_LIMIT;

    let mut anchor = 0usize;
    let mut ip = 1usize;

    loop {
        let mut candidate;
        let mut acceleration = 1usize;

        // Find a match
        loop {
            let step = acceleration >> SKIP_TRIGGER;
            let next_ip = ip + step + 1;
            if next_ip > mf_limit {
                emit_last_literals(&mut out, &input[anchor..])?;
                return Ok(out.pos);
            }

            let sequence = read_u32(input, ip);
            let h = hash(sequence);
            candidate = table[h] as usize;
            table[h] = ip as u32;

            if candidate < ip
                && ip - candidate <= MAX_DISTANCE
                && read_u32(input, candidate) == sequence
            {
                break;
            }

            ip = next_ip;
            acceleration += 1;
        }

        // Extend backward
        while ip > anchor && candidate > 0 && input[ip - 1] == input[candidate - 1] {
            ip -= 1;
            candidate -= 1;
        }

        let literal_len = ip - anchor;
        let token_pos = out.pos;
        out.push(0)?;
        if literal_len >= 15 {
            out.length(literal_len - 15)?;
        }
        out.extend(&input[anchor..ip])?;

        let offset = (ip - candidate) as u16;
        out.extend(&offset.to_le_bytes())?;

        ip += MIN_MATCH;
        let match_len = count_match(input, candidate + MIN_MATCH, ip, match_limit);
        ip += match_len;

        out.buf[token_pos] = ((literal_len.min(15) as u8) << 4) | match_len.min(15) as u8;
        if match_len >= 15 {
            out.length(match_len - 15)?;
        }

        anchor = ip;

        if ip < mf_limit {
            table[hash(read_u32(input, ip - 2))] = (ip - 2) as u32;
        }
    }
}

/// Emit final literals (no match follows).
fn emit_last_literals(out: &mut Sink<'_>, literals: &[u8]) -> Result<()> {
    let len = literals.len();
    out.push((len.min(15) as u8) << 4)?;
    if len >= 15 {
        out.length(len - 15)?;
    }
    out.extend(literals)
}
