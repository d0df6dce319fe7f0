//! Header and transfer encodings used by MIME writers: RFC 2047 encoded
//! words, quoted-printable and RFC 2231 parameter values

use std::borrow::Cow;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use encoding_rs::Encoding;

/// Raw bytes carried by one encoded word, so that the word stays within the
/// 75 character limit once base64 encoded
const ENCODED_WORD_CHUNK: usize = 45;

/// Whether header text must be written as encoded words to survive a
/// decode unchanged
pub fn needs_encoded_words(text: &str) -> bool {
    !text.is_ascii() || text.contains("=?")
}

/// Split `text` into UTF-8 base64 encoded words. Chunks never split a
/// character.
pub fn encode_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if i + c.len_utf8() - start > ENCODED_WORD_CHUNK {
            words.push(encode_word(&text[start..i]));
            start = i;
        }
    }
    if start < text.len() || words.is_empty() {
        words.push(encode_word(&text[start..]));
    }
    words
}

fn encode_word(chunk: &str) -> String {
    format!("=?utf-8?b?{}?=", STANDARD.encode(chunk))
}

/// Decode every encoded word in an unfolded header value.
///
/// Whitespace between two adjacent encoded words is dropped. Everything
/// else, including words that fail to decode, is kept as written.
pub fn decode_header_text(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }

    let is_space = |c: char| c == ' ' || c == '\t';
    let mut out = String::with_capacity(value.len());
    let mut after_word = false;
    let mut rest = value;
    while !rest.is_empty() {
        let word_start = rest.len() - rest.trim_start_matches(is_space).len();
        let (space, tail) = rest.split_at(word_start);
        let word_end = tail.find(is_space).unwrap_or(tail.len());
        let (word, tail) = tail.split_at(word_end);
        rest = tail;

        match ew_decode(word) {
            Some(decoded) => {
                if !after_word {
                    out.push_str(space);
                }
                out.push_str(&decoded);
                after_word = true;
            }
            None => {
                out.push_str(space);
                out.push_str(word);
                after_word = false;
            }
        }
    }
    out
}

/// Decode `=?charset?encoding?text?=`, or `None` if `word` is not a
/// decodable encoded word
fn ew_decode(word: &str) -> Option<String> {
    let inner = word.strip_prefix("=?")?.strip_suffix("?=")?;
    let mut fields = inner.splitn(3, '?');
    let charset = fields.next()?;
    let encoding = fields.next()?;
    let text = fields.next()?;
    if text.contains('?') {
        return None;
    }

    // RFC 2231 allows a language suffix: utf-8*en
    let charset = charset.split('*').next().unwrap_or(charset);
    let bytes = match encoding {
        "b" | "B" => STANDARD.decode(text).ok()?,
        "q" | "Q" => qp_decode(text.replace('_', " ").as_bytes()),
        _ => return None,
    };
    decode_charset(charset, &bytes)
}

/// Decode quoted-printable content.
///
/// Soft line breaks are removed with either line ending. Invalid escapes
/// pass through untouched.
pub fn qp_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut rest = input;
    while let Some((&b, tail)) = rest.split_first() {
        if b != b'=' {
            out.push(b);
            rest = tail;
        } else if let Some(after) = tail.strip_prefix(b"\r\n") {
            rest = after;
        } else if let Some(after) = tail.strip_prefix(b"\n") {
            rest = after;
        } else if let Some(byte) = tail.get(..2).and_then(hex_byte) {
            out.push(byte);
            rest = &tail[2..];
        } else {
            out.push(b'=');
            rest = tail;
        }
    }
    out
}

/// Decode an RFC 2231 extended value: `charset'language'percent-encoded`
pub fn rfc2231_decode(value: &str) -> Option<String> {
    let mut fields = value.splitn(3, '\'');
    let charset = fields.next()?;
    let _language = fields.next()?;
    let encoded = fields.next()?;

    let mut bytes = Vec::with_capacity(encoded.len());
    let mut rest = encoded.as_bytes();
    while let Some((&b, tail)) = rest.split_first() {
        match tail.get(..2).and_then(hex_byte) {
            Some(byte) if b == b'%' => {
                bytes.push(byte);
                rest = &tail[2..];
            }
            _ => {
                bytes.push(b);
                rest = tail;
            }
        }
    }

    let charset = if charset.is_empty() { "utf-8" } else { charset };
    decode_charset(charset, &bytes)
}

/// Decode `bytes` in the named charset, failing on malformed input
pub fn decode_charset(charset: &str, bytes: &[u8]) -> Option<String> {
    Encoding::for_label_no_replacement(charset.trim().as_bytes())?
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(Cow::into_owned)
}

fn hex_byte(pair: &[u8]) -> Option<u8> {
    let digit = |b: u8| char::from(b).to_digit(16);
    let value = digit(pair[0])? * 16 + digit(pair[1])?;
    u8::try_from(value).ok()
}
