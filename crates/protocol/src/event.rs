//! Token events delivered to clients

use serde::{Deserialize, Serialize};

/// Data of the final SSE frame
pub const EOS_SENTINEL: &str = "<EOS>";

/// Maximum number of alternatives carried by one event
pub const MAX_ALTERNATIVES: usize = 5;

/// A candidate token the sampler did not pick. Serialized as a two-element
/// JSON array `[text, probability]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative(pub String, pub f32);

impl Alternative {
    pub fn text(&self) -> &str {
        &self.0
    }

    pub fn probability(&self) -> f32 {
        self.1
    }
}

/// One token emitted by the generation engine.
///
/// Field names on the wire are the ones existing clients already parse:
///
/// ```json
/// {"token": 15043, "word": "Hello", "probability": 0.91, "place": 0,
///  "top5": [["Hello", 0.91], ["Hi", 0.04]]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEvent {
    /// Vocabulary id of the token
    #[serde(rename = "token")]
    pub token_id: u32,
    /// Decoded text fragment
    #[serde(rename = "word")]
    pub text: String,
    /// Probability the sampler assigned to this token
    pub probability: f32,
    /// Position of this token among the ranked candidates (0 = most likely)
    #[serde(rename = "place")]
    pub rank_in_vocab: u32,
    /// Most likely candidates, best first
    #[serde(rename = "top5", default)]
    pub alternatives: Vec<Alternative>,
}

impl TokenEvent {
    pub fn new(token_id: u32, text: impl Into<String>, probability: f32, rank_in_vocab: u32) -> Self {
        Self {
            token_id,
            text: text.into(),
            probability,
            rank_in_vocab,
            alternatives: Vec::new(),
        }
    }

    /// Attach candidates, keeping at most [`MAX_ALTERNATIVES`]
    pub fn with_alternatives(mut self, alternatives: impl IntoIterator<Item = Alternative>) -> Self {
        self.alternatives = alternatives.into_iter().take(MAX_ALTERNATIVES).collect();
        self
    }

    /// JSON text of this event
    pub fn to_json(&self) -> String {
        // Plain struct of strings and numbers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_json_shape() {
        let event = TokenEvent::new(42, "llo", 0.5, 1)
            .with_alternatives([Alternative("llo".into(), 0.5), Alternative("y".into(), 0.25)]);

        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "token": 42,
                "word": "llo",
                "probability": 0.5,
                "place": 1,
                "top5": [["llo", 0.5], ["y", 0.25]],
            })
        );
    }

    #[test]
    fn test_alternatives_capped() {
        let alternatives = (0..8).map(|i| Alternative(format!("t{i}"), 0.1));
        let event = TokenEvent::new(1, "t0", 0.1, 0).with_alternatives(alternatives);
        assert_eq!(event.alternatives.len(), MAX_ALTERNATIVES);
        assert_eq!(event.alternatives[4].text(), "t4");
    }

    #[test]
    fn test_event_parses_without_top5() {
        let event: TokenEvent =
            serde_json::from_str(r#"{"token":3,"word":"!","probability":0.7,"place":0}"#).unwrap();
        assert_eq!(event, TokenEvent::new(3, "!", 0.7, 0));
    }
}
