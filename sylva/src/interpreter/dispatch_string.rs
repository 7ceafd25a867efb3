//! String opcodes, the encryption family, and print.
//!
//! The crypto opcodes use HMAC-SHA256 tags and a SHA256-counter keystream;
//! they are convenience primitives for entity-level integrity checks, not a
//! substitute for a vetted protocol.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::intern;
use crate::node::{NodeId, NodeKind};
use crate::value::EvalResult;

use super::Interpreter;

type HmacSha256 = Hmac<Sha256>;

impl Interpreter {
    // -----------------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------------

    /// `(explode s)` — one single-character string per element.
    pub(crate) fn op_explode(&mut self, n: NodeId) -> EvalResult {
        let Some(text) = self.interpret_into_string(self.manager.child(n, 0)) else {
            return EvalResult::NULL;
        };
        let out = self.manager.alloc(NodeKind::List);
        for c in text.chars() {
            let node = self.manager.alloc_string(&c.to_string());
            self.manager.push_child(out, node);
        }
        EvalResult::node(out, true)
    }

    /// `(split s separator max?)`.
    pub(crate) fn op_split(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(text) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let separator = self
            .interpret_into_string(children.get(1).copied())
            .unwrap_or_else(|| " ".to_string());
        let max = children
            .get(2)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|v| *v >= 1.0)
            .map(|v| v as usize);

        let pieces: Vec<&str> = match (max, separator.is_empty()) {
            (_, true) => vec![text.as_str()],
            (Some(max), false) => text.splitn(max, &separator).collect(),
            (None, false) => text.split(&separator).collect(),
        };
        let out = self.manager.alloc(NodeKind::List);
        for piece in pieces {
            let node = self.manager.alloc_string(piece);
            self.manager.push_child(out, node);
        }
        EvalResult::node(out, true)
    }

    /// `(substr s start length?)` — character-based; a negative start
    /// counts from the end.
    pub(crate) fn op_substr(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(text) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let chars: Vec<char> = text.chars().collect();
        let start = self.interpret_into_number(children.get(1).copied());
        let start = if start.is_nan() {
            0
        } else if start < 0.0 {
            chars.len().saturating_sub((-start) as usize)
        } else {
            (start as usize).min(chars.len())
        };
        let length = children
            .get(2)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|v| !v.is_nan() && *v >= 0.0)
            .map(|v| v as usize)
            .unwrap_or(chars.len() - start.min(chars.len()));

        let end = (start + length).min(chars.len());
        let sliced: String = chars[start..end].iter().collect();
        EvalResult::string(intern::intern(&sliced))
    }

    /// `(concat a b ...)` — string concatenation with coercion.
    pub(crate) fn op_concat(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let mut out = String::new();
        for &child in &children {
            if let Some(piece) = self.interpret_into_string(Some(child)) {
                out.push_str(&piece);
            }
        }
        self.string_result(&out, immediate_ok)
    }

    // -----------------------------------------------------------------------
    // Encryption
    // -----------------------------------------------------------------------

    /// `(crypto_sign message key)` — hex HMAC-SHA256 tag.
    pub(crate) fn op_crypto_sign(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(message) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let Some(key) = self.interpret_into_string(children.get(1).copied()) else {
            return EvalResult::NULL;
        };
        match sign(&message, &key) {
            Some(tag) => EvalResult::string(intern::intern(&tag)),
            None => EvalResult::NULL,
        }
    }

    /// `(crypto_sign_verify message key tag)` — constant-time comparison of
    /// the recomputed tag.
    pub(crate) fn op_crypto_sign_verify(
        &mut self,
        n: NodeId,
        immediate_ok: bool,
    ) -> EvalResult {
        let children = self.manager.children_of(n);
        let message = self.interpret_into_string(children.first().copied());
        let key = self.interpret_into_string(children.get(1).copied());
        let tag = self.interpret_into_string(children.get(2).copied());
        let valid = match (message, key, tag) {
            (Some(message), Some(key), Some(tag)) => sign(&message, &key)
                .map(|expected| constant_time_eq(expected.as_bytes(), tag.as_bytes()))
                .unwrap_or(false),
            _ => false,
        };
        self.boolean_result(valid, immediate_ok)
    }

    /// `(encrypt plaintext key nonce?)` — XOR with a SHA256-counter
    /// keystream; hex output.
    pub(crate) fn op_encrypt(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(plaintext) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let Some(key) = self.interpret_into_string(children.get(1).copied()) else {
            return EvalResult::NULL;
        };
        let nonce = self
            .interpret_into_string(children.get(2).copied())
            .unwrap_or_default();
        let bytes = keystream_xor(plaintext.as_bytes(), &key, &nonce);
        EvalResult::string(intern::intern(&hex_encode(&bytes)))
    }

    /// `(decrypt ciphertext key nonce?)` — inverse of `encrypt`; null when
    /// the ciphertext is not valid hex or the plaintext is not UTF-8.
    pub(crate) fn op_decrypt(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let Some(ciphertext) = self.interpret_into_string(children.first().copied()) else {
            return EvalResult::NULL;
        };
        let Some(key) = self.interpret_into_string(children.get(1).copied()) else {
            return EvalResult::NULL;
        };
        let nonce = self
            .interpret_into_string(children.get(2).copied())
            .unwrap_or_default();
        let Some(bytes) = hex_decode(&ciphertext) else {
            return EvalResult::NULL;
        };
        let plain = keystream_xor(&bytes, &key, &nonce);
        match String::from_utf8(plain) {
            Ok(text) => EvalResult::string(intern::intern(&text)),
            Err(_) => EvalResult::NULL,
        }
    }

    // -----------------------------------------------------------------------
    // I/O
    // -----------------------------------------------------------------------

    /// `(print value...)` — writes each value to stdout; code prints via
    /// the unparser.
    pub(crate) fn op_print(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        for &child in &children {
            let result = self.interpret(Some(child), true);
            match self.value_to_string(&result) {
                Some(text) => print!("{}", text),
                None => print!("(null)"),
            }
            self.free_result(result);
        }
        use std::io::Write;
        if std::io::stdout().flush().is_err() {
            log::warn!("print: could not flush stdout");
        }
        EvalResult::NULL
    }
}

fn sign(message: &str, key: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    mac.update(message.as_bytes());
    Some(hex_encode(&mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len_eq = a.len() == b.len();
    let mut xor = 0u8;
    for i in 0..a.len().min(b.len()) {
        xor |= a[i] ^ b[i];
    }
    len_eq && xor == 0
}

/// XOR with SHA256(key || nonce || counter) blocks.
fn keystream_xor(data: &[u8], key: &str, nonce: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut counter: u64 = 0;
    let mut block = [0u8; 32];
    for (i, &byte) in data.iter().enumerate() {
        let offset = i % 32;
        if offset == 0 {
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(nonce.as_bytes());
            hasher.update(counter.to_le_bytes());
            block.copy_from_slice(&hasher.finalize());
            counter += 1;
        }
        out.push(byte ^ block[offset]);
    }
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let data = [0u8, 1, 127, 128, 255];
        assert_eq!(hex_decode(&hex_encode(&data)).unwrap(), data);
        assert_eq!(hex_decode("zz"), None);
        assert_eq!(hex_decode("abc"), None);
    }

    #[test]
    fn keystream_is_symmetric() {
        let cipher = keystream_xor(b"attack at dawn", "key", "n1");
        let plain = keystream_xor(&cipher, "key", "n1");
        assert_eq!(plain, b"attack at dawn");
        let wrong = keystream_xor(&cipher, "other", "n1");
        assert_ne!(wrong, b"attack at dawn");
    }

    #[test]
    fn signing_is_deterministic_and_keyed() {
        let a = sign("message", "key").unwrap();
        let b = sign("message", "key").unwrap();
        let c = sign("message", "other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(constant_time_eq(a.as_bytes(), b.as_bytes()));
        assert!(!constant_time_eq(a.as_bytes(), c.as_bytes()));
    }
}
