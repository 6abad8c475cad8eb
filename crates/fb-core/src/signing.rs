//! HMAC-SHA256 signing over canonical JSON.
//!
//! Canonical form is the compact serialization of a `serde_json::Value`
//! with every object's keys in sorted order. `serde_json`'s `Map` is
//! BTreeMap-backed, so any value round-tripped through `Value` serializes
//! with sorted keys; the helpers here rely on that.

use ring::hmac;
use subtle::ConstantTimeEq;

/// Compact, key-sorted serialization of a JSON value.
pub fn canonical_json(value: &serde_json::Value) -> String {
    // Map keys are already sorted; compact form has no insignificant
    // whitespace, so this is deterministic for equal values.
    value.to_string()
}

/// Hex-encoded `HMAC-SHA256(secret, canonical_json(value))`.
pub fn sign_value(value: &serde_json::Value, secret: &str) -> String {
    sign_bytes(canonical_json(value).as_bytes(), secret)
}

/// Hex-encoded `HMAC-SHA256(secret, body)` over raw bytes.
pub fn sign_bytes(body: &[u8], secret: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    hex::encode(tag.as_ref())
}

/// Verify a hex signature against a value, in constant time.
pub fn verify_value(value: &serde_json::Value, signature: &str, secret: &str) -> bool {
    constant_time_eq(&sign_value(value, secret), signature)
}

/// Constant-time string equality; also rejects length mismatches without
/// leaking where they differ.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"zebra": 1, "alpha": 2, "mid": {"b": 1, "a": 2}}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"alpha":2,"mid":{"a":2,"b":1},"zebra":1}"#);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let v = json!({"packet_id": "ho_abc", "hot_tokens": 42});
        let sig = sign_value(&v, "secret-token");
        assert!(verify_value(&v, &sig, "secret-token"));
        assert!(!verify_value(&v, &sig, "other-token"));
    }

    #[test]
    fn signature_is_stable_across_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(sign_value(&a, "k"), sign_value(&b, "k"));
    }

    #[test]
    fn tampered_value_fails_verification() {
        let v = json!({"data": "original"});
        let sig = sign_value(&v, "k");
        let tampered = json!({"data": "changed"});
        assert!(!verify_value(&tampered, &sig, "k"));
    }

    #[test]
    fn body_signature_matches_known_format() {
        let sig = sign_bytes(b"{\"event\": \"test\"}", "my-secret");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("abc", "abc"));
    }
}
