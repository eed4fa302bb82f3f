//! Generation command broadcast from the leader to every rank

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

use crate::error::{ProtocolError, Result};

/// Fixed part of an encoded command: round(8) + max_gen_len(4) +
/// temperature(4) + top_p(4) + prompt_len(4)
const COMMAND_FIXED_LEN: usize = 24;

/// Inputs of one generation call. Every rank must run the engine with
/// exactly these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Prompt text
    pub prompt: String,
    /// Maximum tokens to generate
    pub max_gen_len: u32,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Nucleus sampling threshold
    pub top_p: f32,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>, max_gen_len: u32, temperature: f32, top_p: f32) -> Self {
        Self {
            prompt: prompt.into(),
            max_gen_len,
            temperature,
            top_p,
        }
    }

    /// Check the value ranges every engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.max_gen_len == 0 {
            return Err(ProtocolError::InvalidField {
                field: "max_gen_len",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ProtocolError::InvalidField {
                field: "temperature",
                reason: format!("must be a finite value >= 0, got {}", self.temperature),
            });
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ProtocolError::InvalidField {
                field: "top_p",
                reason: format!("must be within [0, 1], got {}", self.top_p),
            });
        }
        Ok(())
    }
}

/// One round's command. The round id lets followers detect stale or
/// duplicated broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Round id, strictly increasing from 1
    pub round: u64,
    /// Generation inputs
    pub params: GenerationParams,
}

impl Command {
    pub fn new(round: u64, params: GenerationParams) -> Self {
        Self { round, params }
    }

    /// Encode to payload bytes
    pub fn encode(&self) -> Vec<u8> {
        let prompt = self.params.prompt.as_bytes();
        let mut buf = Vec::with_capacity(COMMAND_FIXED_LEN + prompt.len());

        buf.write_u64::<LittleEndian>(self.round).unwrap();
        buf.write_u32::<LittleEndian>(self.params.max_gen_len).unwrap();
        buf.write_f32::<LittleEndian>(self.params.temperature).unwrap();
        buf.write_f32::<LittleEndian>(self.params.top_p).unwrap();
        buf.write_u32::<LittleEndian>(prompt.len() as u32).unwrap();
        buf.extend_from_slice(prompt);

        buf
    }

    /// Decode from payload bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < COMMAND_FIXED_LEN {
            return Err(ProtocolError::InvalidPayloadLength {
                expected: COMMAND_FIXED_LEN,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);

        let round = cursor.read_u64::<LittleEndian>()?;
        let max_gen_len = cursor.read_u32::<LittleEndian>()?;
        let temperature = cursor.read_f32::<LittleEndian>()?;
        let top_p = cursor.read_f32::<LittleEndian>()?;
        let prompt_len = cursor.read_u32::<LittleEndian>()? as usize;

        let expected = COMMAND_FIXED_LEN + prompt_len;
        if data.len() != expected {
            return Err(ProtocolError::InvalidPayloadLength {
                expected,
                got: data.len(),
            });
        }

        let mut prompt = vec![0u8; prompt_len];
        cursor.read_exact(&mut prompt)?;
        let prompt = String::from_utf8(prompt).map_err(|_| ProtocolError::InvalidUtf8("prompt"))?;

        let params = GenerationParams {
            prompt,
            max_gen_len,
            temperature,
            top_p,
        };
        params.validate()?;

        Ok(Self { round, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip_preserves_every_field() {
        let command = Command::new(7, GenerationParams::new("Héllo, wörld", 3, 0.7, 1.0));
        let decoded = Command::decode(&command.encode()).unwrap();
        assert_eq!(decoded, command);
        assert_eq!(decoded.params.temperature.to_bits(), 0.7f32.to_bits());
    }

    #[test]
    fn test_empty_prompt_is_encodable() {
        let command = Command::new(1, GenerationParams::new("", 1, 0.0, 0.0));
        assert_eq!(Command::decode(&command.encode()).unwrap(), command);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let encoded = Command::new(1, GenerationParams::new("abcdef", 4, 0.5, 0.9)).encode();
        let result = Command::decode(&encoded[..encoded.len() - 2]);
        assert!(matches!(result, Err(ProtocolError::InvalidPayloadLength { .. })));

        let result = Command::decode(&encoded[..10]);
        assert!(matches!(result, Err(ProtocolError::InvalidPayloadLength { .. })));
    }

    #[test]
    fn test_invalid_utf8_prompt_rejected() {
        let mut encoded = Command::new(1, GenerationParams::new("ab", 4, 0.5, 0.9)).encode();
        let last = encoded.len() - 1;
        encoded[last] = 0xFF;
        assert!(matches!(
            Command::decode(&encoded),
            Err(ProtocolError::InvalidUtf8("prompt"))
        ));
    }

    #[test]
    fn test_validate_ranges() {
        assert!(GenerationParams::new("x", 1, 0.0, 0.0).validate().is_ok());
        assert!(GenerationParams::new("x", 1, 2.5, 1.0).validate().is_ok());

        for bad in [
            GenerationParams::new("x", 0, 0.7, 1.0),
            GenerationParams::new("x", 1, -0.1, 1.0),
            GenerationParams::new("x", 1, f32::NAN, 1.0),
            GenerationParams::new("x", 1, f32::INFINITY, 1.0),
            GenerationParams::new("x", 1, 0.7, 1.01),
            GenerationParams::new("x", 1, 0.7, -0.5),
        ] {
            assert!(
                matches!(bad.validate(), Err(ProtocolError::InvalidField { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_decode_rejects_out_of_range_values() {
        let mut command = Command::new(3, GenerationParams::new("x", 5, 0.7, 1.0));
        command.params.max_gen_len = 0;
        assert!(matches!(
            Command::decode(&command.encode()),
            Err(ProtocolError::InvalidField { field: "max_gen_len", .. })
        ));
    }
}
