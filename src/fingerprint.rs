//! Deterministic request fingerprints for cache keying.
//!
//! A fingerprint is the hex SHA-256 of a canonical, length-prefixed encoding
//! of the semantic request fields:
//!
//! | Field | Encoding |
//! |-------|----------|
//! | `model_id` | `u64` length (LE) + UTF-8 bytes |
//! | `prompt_text` | `u64` length (LE) + UTF-8 bytes |
//! | `temperature` | `f32::to_bits` (LE) |
//! | `max_output_tokens` | `u32` (LE) |
//! | `top_p` | `f32::to_bits` (LE) |
//! | `stop_sequences` | `u64` count, then each as a length-prefixed string |
//!
//! Floats are compared by exact bit pattern, so `0.5` and `0.50000006` differ.
//! The `streaming` flag is not part of the key: cached results
//! always hold fully assembled text.
//!
//! Length prefixes make the encoding injective: `("ab", "c")` and `("a", "bc")`
//! cannot collide structurally.

use sha2::{Digest, Sha256};

use crate::traits::GenerationRequest;

/// Domain tag so fingerprints from a future encoding never alias this one.
const FINGERPRINT_VERSION: &[u8] = b"edgequake-fp-v1";

/// Pure function from request to cache key.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFingerprinter;

impl RequestFingerprinter {
    /// Create a fingerprinter.
    pub fn new() -> Self {
        Self
    }

    /// Compute the fingerprint of a request.
    ///
    /// # Example
    ///
    /// ```
    /// use edgequake_orchestrator::{GenerationRequest, RequestFingerprinter};
    ///
    /// let fp = RequestFingerprinter::new();
    /// let a = GenerationRequest::new("model-a", "Hello");
    /// let b = a.clone().with_streaming(true);
    /// assert_eq!(fp.fingerprint(&a), fp.fingerprint(&b));
    /// assert_eq!(fp.fingerprint(&a).len(), 64);
    /// ```
    pub fn fingerprint(&self, request: &GenerationRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION);
        write_str(&mut hasher, &request.model_id);
        write_str(&mut hasher, &request.prompt_text);
        hasher.update(request.temperature.to_bits().to_le_bytes());
        hasher.update(request.max_output_tokens.to_le_bytes());
        hasher.update(request.top_p.to_bits().to_le_bytes());
        hasher.update((request.stop_sequences.len() as u64).to_le_bytes());
        for stop in &request.stop_sequences {
            write_str(&mut hasher, stop);
        }
        format!("{:x}", hasher.finalize())
    }
}

fn write_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GenerationRequest {
        GenerationRequest::new("model-a", "Hello")
            .with_temperature(0.5)
            .with_max_output_tokens(50)
            .with_top_p(1.0)
    }

    #[test]
    fn test_deterministic() {
        let fp = RequestFingerprinter::new();
        assert_eq!(fp.fingerprint(&base()), fp.fingerprint(&base()));
        assert_eq!(
            RequestFingerprinter.fingerprint(&base()),
            fp.fingerprint(&base())
        );
    }

    #[test]
    fn test_hex_sha256_shape() {
        let key = RequestFingerprinter::new().fingerprint(&base());
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_every_field_changes_key() {
        let fp = RequestFingerprinter::new();
        let reference = fp.fingerprint(&base());

        let variants = vec![
            GenerationRequest {
                model_id: "model-b".into(),
                ..base()
            },
            GenerationRequest {
                prompt_text: "Hello!".into(),
                ..base()
            },
            base().with_temperature(0.6),
            base().with_max_output_tokens(51),
            base().with_top_p(0.9),
            base().with_stop_sequences(["END"]),
        ];

        for variant in variants {
            assert_ne!(fp.fingerprint(&variant), reference, "{:?}", variant);
        }
    }

    #[test]
    fn test_streaming_flag_ignored() {
        let fp = RequestFingerprinter::new();
        assert_eq!(
            fp.fingerprint(&base()),
            fp.fingerprint(&base().with_streaming(true))
        );
    }

    #[test]
    fn test_float_bits_exact() {
        let fp = RequestFingerprinter::new();
        let a = base().with_temperature(0.5);
        let b = base().with_temperature(f32::from_bits(0.5f32.to_bits() + 1));
        assert_ne!(fp.fingerprint(&a), fp.fingerprint(&b));
    }

    #[test]
    fn test_field_boundaries_unambiguous() {
        let fp = RequestFingerprinter::new();
        let a = GenerationRequest::new("ab", "c");
        let b = GenerationRequest::new("a", "bc");
        assert_ne!(fp.fingerprint(&a), fp.fingerprint(&b));

        let a = base().with_stop_sequences(["ab", "c"]);
        let b = base().with_stop_sequences(["a", "bc"]);
        assert_ne!(fp.fingerprint(&a), fp.fingerprint(&b));
    }

    #[test]
    fn test_stop_sequence_order_matters() {
        let fp = RequestFingerprinter::new();
        let a = base().with_stop_sequences(["x", "y"]);
        let b = base().with_stop_sequences(["y", "x"]);
        assert_ne!(fp.fingerprint(&a), fp.fingerprint(&b));
    }
}
