//! LZ4 block decompression with bounded output.

use super::constants::MIN_MATCH;
use crate::{Error, Result};

/// Read a run of 255-continued length bytes.
fn read_length(input: &[u8], ip: &mut usize, what: &str) -> Result<usize> {
    let mut len = 0usize;
    loop {
        let byte = *input
            .get(*ip)
            .ok_or_else(|| Error::CorruptedData(format!("unexpected end of input in {what}")))?;
        *ip += 1;
        len += byte as usize;
        if byte != 255 {
            return Ok(len);
        }
    }
}

/// Decompress LZ4 block format data.
///
/// Never writes past `output`; a stream that would do so is rejected.
///
/// # Returns
///
/// The number of bytes written to output.
///
/// # Errors
///
/// Returns [`Error::CorruptedData`] for malformed input and
/// [`Error::BufferTooSmall`] if the data would not fit in `output`.
pub fn decompress(input: &[u8], output: &mut [u8]) -> Result<usize> {
    if input.is_empty() {
        return Ok(0);
    }

    let mut ip = 0usize;
    let mut op = 0usize;

    loop {
        let token = *input
            .get(ip)
            .ok_or_else(|| Error::CorruptedData("unexpected end of input".to_string()))?;
        ip += 1;

        // Decode literal length
        let mut literal_len = (token >> 4) as usize;
        if literal_len == 15 {
            literal_len += read_length(input, &mut ip, "literal length")?;
        }

        if literal_len > 0 {
            if ip + literal_len > input.len() {
                return Err(Error::CorruptedData("literal extends past input".to_string()));
            }
            if op + literal_len > output.len() {
                return Err(Error::BufferTooSmall {
                    needed: op + literal_len,
                    available: output.len(),
                });
            }
            output[op..op + literal_len].copy_from_slice(&input[ip..ip + literal_len]);
            ip += literal_len;
            op += literal_len;
        }

        // End of block: no offset follows the last literals
        if ip >= input.len() {
            break;
        }

        if ip + 2 > input.len() {
            return Err(Error::CorruptedData("unexpected end of input at offset".to_string()));
        }
        let offset = u16::from_le_bytes([input[ip], input[ip + 1]]) as usize;
        ip += 2;

        if offset == 0 {
            return Err(Error::CorruptedData("zero offset".to_string()));
        }
        if offset > op {
            return Err(Error::CorruptedData(format!(
                "offset {offset} exceeds output position {op}"
            )));
        }

        let mut match_len = (token & 0x0F) as usize + MIN_MATCH;
        if (token & 0x0F) == 15 {
            match_len += read_length(input, &mut ip, "match length")?;
        }

        if op + match_len > output.len() {
            return Err(Error::BufferTooSmall { needed: op + match_len, available: output.len() });
        }

        let src = op - offset;
        if offset >= match_len {
            output.copy_within(src..src + match_len, op);
        } else {
            // Overlapping match repeats the last `offset` bytes
            for i in 0..match_len {
                output[op + i] = output[src + i];
            }
        }
        op += match_len;
    }

    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompress_empty() {
        let mut output = [0u8; 100];
        assert_eq!(decompress(&[], &mut output).unwrap(), 0);
    }

    #[test]
    fn test_decompress_literals_only() {
        let input = [0x30, b'a', b'b', b'c'];
        let mut output = [0u8; 8];
        assert_eq!(decompress(&input, &mut output).unwrap(), 3);
        assert_eq!(&output[..3], b"abc");
    }

    #[test]
    fn test_decompress_zero_offset() {
        let input = [0x10, b'A', 0x00, 0x00];
        let mut output = [0u8; 100];
        let err = decompress(&input, &mut output).unwrap_err();
        assert!(err.to_string().contains("zero offset"));
    }

    #[test]
    fn test_decompress_offset_before_start() {
        let input = [0x10, b'A', 0x05, 0x00];
        let mut output = [0u8; 100];
        let err = decompress(&input, &mut output).unwrap_err();
        assert!(err.to_string().contains("exceeds output position"));
    }

    #[test]
    fn test_decompress_truncated_offset() {
        let input = [0x14, b'A', 0x01];
        let mut output = [0u8; 100];
        assert!(decompress(&input, &mut output).is_err());
    }

    #[test]
    fn test_decompress_overlapping_rle() {
        // One literal 'z' then a match of 4+4 bytes at offset 1
        let input = [0x14, b'z', 0x01, 0x00, 0x00];
        let mut output = [0u8; 16];
        let n = decompress(&input, &mut output).unwrap();
        assert_eq!(n, 9);
        assert!(output[..9].iter().all(|&b| b == b'z'));
    }

    #[test]
    fn test_decompress_output_bounded() {
        let input = [0x1F, b'z', 0x01, 0x00, 0xFF, 0x10, 0x00];
        let mut output = [0u8; 64];
        let err = decompress(&input, &mut output).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { available: 64, .. }));
    }
}
