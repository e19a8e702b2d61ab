//! Script Op Reader
//!
//! Walks a locking script one operation at a time. Push-data operations carry
//! their payload; every other opcode is a zero-length operation.

use thiserror::Error;

pub const OP_0: u8 = 0x00;
pub const OP_DATA_1: u8 = 0x01;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_IF: u8 = 0x63;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

/// Length of a standard pay-to-public-key-hash locking script
pub const P2PKH_LEN: usize = 25;

/// Errors that can occur while reading script operations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Cursor {pos} past end of script ({len} bytes)")]
    EndOfScript { pos: usize, len: usize },

    #[error("Push of {wanted} bytes at {pos} exceeds remaining script")]
    DataTooSmall { pos: usize, wanted: usize },
}

/// A single decoded script operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptOp<'a> {
    pub op_code: u8,
    pub data: &'a [u8],
}

impl ScriptOp<'_> {
    /// True for `OP_RETURN` or a one-byte push of `|`
    pub fn is_bitcom_separator(&self) -> bool {
        self.op_code == OP_RETURN || self.is_pipe()
    }

    /// True for a one-byte push of `|`
    pub fn is_pipe(&self) -> bool {
        self.op_code == OP_DATA_1 && self.data.first() == Some(&b'|')
    }
}

/// Read the operation at `*pos` and advance the cursor past it.
///
/// The cursor is left untouched when an error is returned.
pub fn read_op<'a>(script: &'a [u8], pos: &mut usize) -> Result<ScriptOp<'a>, ScriptError> {
    let start = *pos;
    let op_code = *script.get(start).ok_or(ScriptError::EndOfScript {
        pos: start,
        len: script.len(),
    })?;

    let (header, len) = match op_code {
        OP_PUSHDATA1 => (2, read_len(script, start, 1)?),
        OP_PUSHDATA2 => (3, read_len(script, start, 2)?),
        OP_PUSHDATA4 => (5, read_len(script, start, 4)?),
        0x01..=0x4b => (1, op_code as usize),
        _ => {
            *pos = start + 1;
            return Ok(ScriptOp { op_code, data: &[] });
        }
    };

    let data_start = start + header;
    let data = data_start
        .checked_add(len)
        .and_then(|end| script.get(data_start..end))
        .ok_or(ScriptError::DataTooSmall {
            pos: start,
            wanted: len,
        })?;

    *pos = data_start + len;
    Ok(ScriptOp { op_code, data })
}

/// Little-endian length field of `width` bytes following the opcode at `start`
fn read_len(script: &[u8], start: usize, width: usize) -> Result<usize, ScriptError> {
    let field = script
        .get(start + 1..start + 1 + width)
        .ok_or(ScriptError::DataTooSmall {
            pos: start,
            wanted: width,
        })?;
    Ok(field
        .iter()
        .rev()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize))
}

/// Decode a whole script into data elements. Pushes yield their payload,
/// any other opcode yields itself as a single byte.
pub fn decode_parts(script: &[u8]) -> Result<Vec<Vec<u8>>, ScriptError> {
    let mut parts = Vec::new();
    let mut pos = 0;
    while pos < script.len() {
        let op = read_op(script, &mut pos)?;
        if is_push(op.op_code) {
            parts.push(op.data.to_vec());
        } else {
            parts.push(vec![op.op_code]);
        }
    }
    Ok(parts)
}

fn is_push(op_code: u8) -> bool {
    (0x01..=OP_PUSHDATA4).contains(&op_code)
}

/// Extract the 20-byte hash if `script` starts with a standard P2PKH template
pub fn p2pkh_hash(script: &[u8]) -> Option<&[u8]> {
    let prefix = script.get(..P2PKH_LEN)?;
    let matches = prefix[0] == OP_DUP
        && prefix[1] == OP_HASH160
        && prefix[2] == 0x14
        && prefix[23] == OP_EQUALVERIFY
        && prefix[24] == OP_CHECKSIG;
    matches.then(|| &prefix[3..23])
}
