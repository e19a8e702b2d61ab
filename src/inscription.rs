//! Ord Envelope Decoding
//!
//! Content inscriptions live inside `OP_FALSE OP_IF "ord" ... OP_ENDIF`.
//! Within the envelope, `OP_0 <content>` carries the body and
//! `OP_1 <mime>` the declared content type.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::debug;

use crate::bsv20::TokenParser;
use crate::script::{read_op, OP_0, OP_1, OP_ENDIF};
use crate::txo::{File, Inscription, TxoData, TxoTag};

/// Marker word pushed right after `OP_FALSE OP_IF`
pub const ORD_MARKER: &[u8] = b"ord";

/// Content larger than this is never classified
pub const MAX_CLASSIFY_SIZE: usize = 1024;

/// Declared content types are truncated to this many bytes
pub const MAX_MIME_LEN: usize = 256;

/// Below this height plain-text inscriptions may also carry token operations
pub const BSV20_MIGRATION_HEIGHT: u32 = 793_000;

const TOKEN_MIME_PREFIX: &str = "application/bsv-20";
const PLAIN_TEXT_MIME_PREFIX: &str = "text/plain";
const JSON_MIME_PREFIX: &str = "application/json";

/// Decode the envelope body starting right after the `ord` marker and record
/// the inscription, any token operation, and its tags on `data`.
pub fn parse_inscription(
    script: &[u8],
    pos: &mut usize,
    height: Option<u32>,
    tokens: &dyn TokenParser,
    data: &mut TxoData,
) {
    let mut file = File::default();

    loop {
        let Ok(op) = read_op(script, pos) else {
            break;
        };
        match op.op_code {
            OP_0 => match read_op(script, pos) {
                Ok(body) => file.content = body.data.to_vec(),
                Err(_) => break,
            },
            OP_1 => match read_op(script, pos) {
                Ok(mime) => {
                    if let Ok(mime) = std::str::from_utf8(mime.data) {
                        file.mime_type = truncate_on_char(mime, MAX_MIME_LEN).to_string();
                    }
                }
                Err(_) => break,
            },
            OP_ENDIF => break,
            _ => {}
        }
    }
    file.seal();

    let mut inscription = Inscription {
        file,
        ..Default::default()
    };
    classify(&mut inscription, height, tokens, data);
    data.types.insert(TxoTag::Inscription);
    data.inscription = Some(inscription);
}

fn classify(
    inscription: &mut Inscription,
    height: Option<u32>,
    tokens: &dyn TokenParser,
    data: &mut TxoData,
) {
    let content = &inscription.file.content;
    if content.len() > MAX_CLASSIFY_SIZE || content.contains(&0) {
        return;
    }
    let Ok(text) = std::str::from_utf8(content) else {
        return;
    };

    let mime = inscription.file.mime_type.to_lowercase();
    let is_token = mime.starts_with(TOKEN_MIME_PREFIX);
    let is_plain = mime.starts_with(PLAIN_TEXT_MIME_PREFIX);

    if is_token || is_plain || mime.starts_with(JSON_MIME_PREFIX) {
        if let Ok(json) = serde_json::from_str::<Value>(text) {
            inscription.json = Some(json);
            data.types.insert(TxoTag::Json);

            let legacy_plain = is_plain && height.is_some_and(|h| h < BSV20_MIGRATION_HEIGHT);
            if is_token || legacy_plain {
                match tokens.parse(content, height) {
                    Some(token) => {
                        data.bsv20 = Some(token);
                        data.types.insert(TxoTag::Bsv20);
                    }
                    None => debug!("inscription json is not a token operation"),
                }
            }
        }
    }

    if mime.starts_with("text") {
        if inscription.json.is_none() {
            data.types.insert(TxoTag::Text);
        }
        let words = words(text);
        if !words.is_empty() {
            inscription.words = Some(words);
        }
        inscription.text = Some(text.to_string());
    }
}

/// Distinct words longer than one byte, split on ASCII non-word characters
pub fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| w.len() > 1)
        .map(str::to_string)
        .collect()
}

fn truncate_on_char(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsv20::Bsv20Parser;
    use crate::script::OP_PUSHDATA2;
    use sha2::{Digest, Sha256};

    fn push(script: &mut Vec<u8>, data: &[u8]) {
        if data.len() < 0x4c {
            script.push(data.len() as u8);
        } else {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
        script.extend_from_slice(data);
    }

    /// Envelope body as it appears after the `ord` marker
    fn body(mime: &[u8], content: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_1];
        push(&mut script, mime);
        script.push(OP_0);
        push(&mut script, content);
        script.push(OP_ENDIF);
        script
    }

    fn parse(script: &[u8], height: Option<u32>) -> (TxoData, usize) {
        let mut data = TxoData::default();
        let mut pos = 0;
        parse_inscription(script, &mut pos, height, &Bsv20Parser, &mut data);
        (data, pos)
    }

    #[test]
    fn test_plain_text_inscription() {
        let script = body(b"text/plain", b"hello");
        let (data, pos) = parse(&script, Some(800_000));
        let ins = data.inscription.unwrap();

        assert_eq!(ins.file.content, b"hello");
        assert_eq!(ins.file.mime_type, "text/plain");
        assert_eq!(ins.file.size, 5);
        assert_eq!(ins.text.as_deref(), Some("hello"));
        assert_eq!(ins.words, Some(BTreeSet::from(["hello".to_string()])));
        assert!(data.types.contains(&TxoTag::Inscription));
        assert!(data.types.contains(&TxoTag::Text));
        assert_eq!(pos, script.len());
    }

    #[test]
    fn test_json_inscription() {
        let script = body(b"application/json", br#"{"name":"x"}"#);
        let (data, _) = parse(&script, None);
        let ins = data.inscription.unwrap();
        assert_eq!(ins.json, Some(serde_json::json!({"name": "x"})));
        assert!(ins.text.is_none());
        assert!(data.types.contains(&TxoTag::Json));
        assert!(!data.types.contains(&TxoTag::Text));
        assert!(data.bsv20.is_none());
    }

    #[test]
    fn test_token_inscription() {
        let content = br#"{"p":"bsv-20","op":"mint","tick":"ordi","amt":"1000"}"#;
        let script = body(b"application/bsv-20", content);
        let (data, _) = parse(&script, Some(800_000));
        let token = data.bsv20.unwrap();
        assert_eq!(token.ticker, "ordi");
        assert_eq!(token.amount, Some(1000));
        assert!(data.types.contains(&TxoTag::Bsv20));
        assert!(data.types.contains(&TxoTag::Json));
    }

    #[test]
    fn test_plain_text_token_only_before_migration() {
        let content = br#"{"p":"bsv-20","op":"mint","tick":"ordi","amt":"1"}"#;
        let script = body(b"text/plain;charset=utf-8", content);

        let (early, _) = parse(&script, Some(BSV20_MIGRATION_HEIGHT - 1));
        assert!(early.bsv20.is_some());

        let (late, _) = parse(&script, Some(BSV20_MIGRATION_HEIGHT));
        assert!(late.bsv20.is_none());
        assert!(late.types.contains(&TxoTag::Json));

        let (unconfirmed, _) = parse(&script, None);
        assert!(unconfirmed.bsv20.is_none());
    }

    #[test]
    fn test_mime_prefix_is_case_insensitive() {
        let script = body(b"TEXT/PLAIN", b"some words here");
        let (data, _) = parse(&script, None);
        assert!(data.types.contains(&TxoTag::Text));
        assert_eq!(data.inscription.unwrap().words.unwrap().len(), 3);
    }

    #[test]
    fn test_binary_inscription_is_not_classified() {
        let script = body(b"image/png", &[0x89, b'P', b'N', b'G', 0x00, 0x01]);
        let (data, _) = parse(&script, None);
        let ins = data.inscription.unwrap();
        assert!(ins.text.is_none() && ins.json.is_none());
        assert_eq!(data.types, BTreeSet::from([TxoTag::Inscription]));
        assert_eq!(ins.file.hash.as_slice(), Sha256::digest([0x89, b'P', b'N', b'G', 0x00, 0x01]).as_slice());
    }

    #[test]
    fn test_large_text_is_not_classified() {
        let content = vec![b'a'; MAX_CLASSIFY_SIZE + 1];
        let script = body(b"text/plain", &content);
        let (data, _) = parse(&script, None);
        let ins = data.inscription.unwrap();
        assert!(ins.text.is_none());
        assert_eq!(ins.file.size as usize, MAX_CLASSIFY_SIZE + 1);
        assert_eq!(data.types, BTreeSet::from([TxoTag::Inscription]));
    }

    #[test]
    fn test_long_mime_is_truncated() {
        let mime = vec![b'x'; 300];
        let script = body(&mime, b"data");
        let (data, _) = parse(&script, None);
        assert_eq!(data.inscription.unwrap().file.mime_type.len(), MAX_MIME_LEN);
    }

    #[test]
    fn test_invalid_utf8_mime_is_dropped() {
        let script = body(&[0xff, 0xfe], b"data");
        let (data, _) = parse(&script, None);
        assert!(data.inscription.unwrap().file.mime_type.is_empty());
    }

    #[test]
    fn test_truncated_envelope_still_records_inscription() {
        let mut script = vec![OP_0];
        script.extend_from_slice(&[0x10, b'a']);
        let (data, _) = parse(&script, None);
        let ins = data.inscription.unwrap();
        assert!(ins.file.content.is_empty());
        assert_eq!(ins.file.size, 0);
        assert!(data.types.contains(&TxoTag::Inscription));
    }

    #[test]
    fn test_words_split_on_non_word_chars() {
        let words = words("Hello, hello world! a b_c x");
        assert_eq!(
            words,
            BTreeSet::from(["Hello".to_string(), "hello".to_string(), "world".to_string(), "b_c".to_string()])
        );
    }

    #[test]
    fn test_words_single_chars_excluded() {
        assert!(words("a b c").is_empty());
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let s = "ééé";
        assert_eq!(truncate_on_char(s, 3), "é");
        assert_eq!(truncate_on_char(s, 10), s);
    }
}
