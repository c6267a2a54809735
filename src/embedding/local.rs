use sha2::{Digest, Sha256};

use super::{EmbedError, EmbeddingProvider, ensure_embeddable, normalize_vector};

pub const LOCAL_BACKEND: &str = "local-hash-v1";

/// Offline embedder that hashes word and bigram features into a fixed-size
/// vector. Output depends only on the text, so repeated runs are identical.
#[derive(Debug, Clone)]
pub struct LocalHashEmbedder {
    model_id: String,
    dimensions: usize,
}

impl LocalHashEmbedder {
    pub fn new(model_id: String, dimensions: usize) -> Self {
        Self {
            model_id,
            dimensions: dimensions.max(8),
        }
    }
}

impl EmbeddingProvider for LocalHashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn backend(&self) -> &str {
        LOCAL_BACKEND
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        ensure_embeddable(text)?;

        let tokens = tokenize_payload(text);
        if tokens.is_empty() {
            return Err(EmbedError::permanent(
                "summary text has no alphanumeric content",
            ));
        }

        Ok(embed_features(&tokens, self.dimensions))
    }
}

fn embed_features(tokens: &[String], dims: usize) -> Vec<f32> {
    let mut vector = vec![0_f32; dims];

    for token in tokens {
        let hash = stable_hash(token);
        let index = (hash as usize) % dims;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
        vector[index] += sign * weight;
    }

    normalize_vector(&mut vector);
    vector
}

// `DefaultHasher` is not stable across Rust releases; vectors must be.
fn stable_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn tokenize_payload(payload: &str) -> Vec<String> {
    let words = payload
        .split_whitespace()
        .map(|value| {
            value
                .chars()
                .filter(|character| character.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|value| !value.is_empty())
        .collect::<Vec<String>>();

    let mut features = Vec::<String>::with_capacity(words.len() * 2);
    for (index, word) in words.iter().enumerate() {
        features.push(format!("w:{word}"));
        if let Some(next) = words.get(index + 1) {
            features.push(format!("b:{word}_{next}"));
        }
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FailureKind;

    fn dot(left: &[f32], right: &[f32]) -> f64 {
        left.iter()
            .zip(right)
            .map(|(l, r)| f64::from(*l) * f64::from(*r))
            .sum()
    }

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let embedder = LocalHashEmbedder::new("local".to_string(), 64);
        let first = embedder.embed("Summary: license expired in 2023").unwrap();
        let second = embedder.embed("Summary: license expired in 2023").unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!((dot(&first, &first) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn case_and_punctuation_do_not_change_the_vector() {
        let embedder = LocalHashEmbedder::new("local".to_string(), 128);
        let left = embedder.embed("High risk: Sanctions hit!").unwrap();
        let right = embedder.embed("high RISK sanctions hit").unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn related_texts_score_higher_than_unrelated_ones() {
        let embedder = LocalHashEmbedder::new("local".to_string(), 384);
        let base = embedder
            .embed("provider license suspended by state medical board")
            .unwrap();
        let near = embedder
            .embed("provider license suspended by the medical board")
            .unwrap();
        let far = embedder.embed("quarterly revenue grew steadily").unwrap();

        assert!(dot(&base, &near) > dot(&base, &far));
    }

    #[test]
    fn blank_or_symbol_only_text_is_a_permanent_failure() {
        let embedder = LocalHashEmbedder::new("local".to_string(), 32);
        assert_eq!(
            embedder.embed("   ").unwrap_err().kind(),
            FailureKind::Permanent
        );
        assert_eq!(
            embedder.embed("--- !!").unwrap_err().kind(),
            FailureKind::Permanent
        );
    }

    #[test]
    fn dimensions_have_a_floor() {
        let embedder = LocalHashEmbedder::new("local".to_string(), 2);
        assert_eq!(embedder.dimensions(), 8);
    }
}
