use rtlgen_session::GenerationParameters;
use serde::Deserialize;
use std::path::Path;

/// The sampling defaults a checkpoint ships in `generation_config.json`.
///
/// Only the settings a session leaves unset are taken from here. The
/// temperature and sampling flag are always chosen by the session.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    repetition_penalty: Option<f32>,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

/// An error reading `generation_config.json`.
#[derive(Debug, thiserror::Error)]
pub enum GenerationConfigError {
    /// The file could not be read.
    #[error("Failed to read generation config: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not a generation config.
    #[error("Failed to parse generation config: {0}")]
    Json(#[from] serde_json::Error),
}

impl GenerationConfig {
    /// Read the config from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GenerationConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse the config from json.
    pub fn parse(json: &str) -> Result<Self, GenerationConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The parameters to fall back to, see [`GenerationParameters::with_fallback`].
    pub fn parameters(&self) -> GenerationParameters {
        let mut parameters = GenerationParameters::default();
        if let Some(top_k) = self.top_k {
            parameters = parameters.with_top_k(top_k);
        }
        if let Some(top_p) = self.top_p {
            parameters = parameters.with_top_p(top_p);
        }
        if let Some(repetition_penalty) = self.repetition_penalty {
            parameters = parameters.with_repetition_penalty(repetition_penalty);
        }
        parameters
    }

    /// Every end of sequence token id the config lists.
    pub fn eos_token_ids(&self) -> &[u32] {
        match &self.eos_token_id {
            Some(TokenIds::Single(id)) => std::slice::from_ref(id),
            Some(TokenIds::Many(ids)) => ids,
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_a_qwen_generation_config() {
        let config = GenerationConfig::parse(
            r#"{
                "bos_token_id": 151643,
                "do_sample": true,
                "eos_token_id": [151645, 151643],
                "pad_token_id": 151643,
                "repetition_penalty": 1.1,
                "temperature": 0.7,
                "top_k": 20,
                "top_p": 0.8,
                "transformers_version": "4.37.0"
            }"#,
        )
        .unwrap();
        assert_eq!(config.eos_token_ids(), &[151645, 151643]);

        let parameters = config.parameters();
        assert_eq!(parameters.top_k(), Some(20));
        assert_eq!(parameters.top_p(), Some(0.8));
        assert_eq!(parameters.repetition_penalty(), Some(1.1));
        // the session's own temperature is kept
        assert_eq!(parameters.temperature(), 0.1);
    }

    #[test]
    fn everything_is_optional() {
        let config = GenerationConfig::parse(r#"{"eos_token_id": 2}"#).unwrap();
        assert_eq!(config.eos_token_ids(), &[2]);
        assert_eq!(config.parameters(), GenerationParameters::default());
        assert_eq!(GenerationConfig::default().eos_token_ids(), &[] as &[u32]);
    }
}
