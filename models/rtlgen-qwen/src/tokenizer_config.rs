use serde::Deserialize;
use std::path::Path;

/// The parts of a Hugging Face `tokenizer_config.json` needed to render prompts.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    chat_template: Option<ChatTemplateField>,
    #[serde(default)]
    bos_token: Option<TokenField>,
    #[serde(default)]
    eos_token: Option<TokenField>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ChatTemplateField {
    Single(String),
    Named(Vec<NamedChatTemplate>),
}

#[derive(Debug, Clone, Deserialize)]
struct NamedChatTemplate {
    name: String,
    template: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenField {
    Text(String),
    AddedToken { content: String },
}

impl TokenField {
    fn as_str(&self) -> &str {
        match self {
            TokenField::Text(text) => text,
            TokenField::AddedToken { content } => content,
        }
    }
}

/// An error reading `tokenizer_config.json`.
#[derive(Debug, thiserror::Error)]
pub enum TokenizerConfigError {
    /// The file could not be read.
    #[error("Failed to read tokenizer config: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not a tokenizer config.
    #[error("Failed to parse tokenizer config: {0}")]
    Json(#[from] serde_json::Error),
}

impl TokenizerConfig {
    /// Read the config from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TokenizerConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse the config from json.
    pub fn parse(json: &str) -> Result<Self, TokenizerConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The default chat template. Configs with several named templates use the one named `default`.
    pub fn chat_template(&self) -> Option<&str> {
        match self.chat_template.as_ref()? {
            ChatTemplateField::Single(template) => Some(template),
            ChatTemplateField::Named(templates) => templates
                .iter()
                .find(|template| template.name == "default")
                .or_else(|| templates.first())
                .map(|template| template.template.as_str()),
        }
    }

    /// The beginning of sequence token, if the tokenizer has one.
    pub fn bos_token(&self) -> Option<&str> {
        self.bos_token.as_ref().map(TokenField::as_str)
    }

    /// The end of sequence token, if the tokenizer has one.
    pub fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_ref().map(TokenField::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_a_qwen_config() {
        let config = TokenizerConfig::parse(
            r#"{
                "add_prefix_space": false,
                "bos_token": null,
                "chat_template": "{% for message in messages %}{{ message.content }}{% endfor %}",
                "eos_token": "<|im_end|>",
                "model_max_length": 131072,
                "pad_token": "<|endoftext|>"
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.chat_template(),
            Some("{% for message in messages %}{{ message.content }}{% endfor %}")
        );
        assert_eq!(config.bos_token(), None);
        assert_eq!(config.eos_token(), Some("<|im_end|>"));
    }

    #[test]
    fn reads_added_token_objects() {
        let config = TokenizerConfig::parse(
            r#"{
                "bos_token": {"__type": "AddedToken", "content": "<s>", "lstrip": false},
                "eos_token": {"__type": "AddedToken", "content": "</s>", "lstrip": false}
            }"#,
        )
        .unwrap();
        assert_eq!(config.bos_token(), Some("<s>"));
        assert_eq!(config.eos_token(), Some("</s>"));
        assert_eq!(config.chat_template(), None);
    }

    #[test]
    fn picks_the_default_named_template() {
        let config = TokenizerConfig::parse(
            r#"{
                "chat_template": [
                    {"name": "tool_use", "template": "tools"},
                    {"name": "default", "template": "chat"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.chat_template(), Some("chat"));
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(
            TokenizerConfig::parse("not json"),
            Err(TokenizerConfigError::Json(_))
        ));
    }
}
