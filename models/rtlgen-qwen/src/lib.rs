//! # rtlgen-qwen
//!
//! Runs quantized (GGUF) Qwen checkpoints with [Candle](https://github.com/huggingface/candle)
//! to generate Verilog from natural-language instructions.
//!
//! ## Usage
//!
//! ```rust, no_run
//! use rtlgen_qwen::{CheckpointSource, Qwen};
//! use rtlgen_session::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = Qwen::builder()
//!         .with_source(CheckpointSource::qwen_verilog_stage4()?)
//!         .with_max_seq_len(2048)
//!         .build()
//!         .await?;
//!     let (generator, formatter) = model.into_parts();
//!     Session::new(generator, formatter).run(std::io::stdin().lock(), std::io::stdout())?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod chat_template;
mod generation_config;
mod model;
mod source;
mod token_stream;
mod tokenizer_config;

#[cfg(test)]
mod test_util;

pub use crate::chat_template::{QwenChatFormatter, CHATML_TEMPLATE};
pub use crate::generation_config::{GenerationConfig, GenerationConfigError};
pub use crate::model::{QwenError, QwenModel};
pub use crate::source::*;
pub use crate::token_stream::TokenOutputStreamError;
pub use crate::tokenizer_config::{TokenizerConfig, TokenizerConfigError};

use crate::model::QwenWeights;
use candle_core::{quantized::gguf_file, Device};
use rtlgen_common::{BackendPreference, Cache, CacheError, FileSource, ModelLoadingProgress};
use std::path::PathBuf;
use std::sync::Arc;
use tokenizers::Tokenizer;

/// The context window used when none is configured.
pub const DEFAULT_MAX_SEQ_LEN: usize = 2048;

/// An error that can occur while loading a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum QwenLoadingError {
    /// A checkpoint file could not be fetched.
    #[error("Failed to fetch checkpoint file: {0}")]
    Cache(#[from] CacheError),
    /// The tokenizer could not be loaded.
    #[error("Failed to load tokenizer: {0}")]
    Tokenizer(tokenizers::Error),
    /// The tokenizer config could not be loaded.
    #[error(transparent)]
    TokenizerConfig(#[from] TokenizerConfigError),
    /// The generation config could not be loaded.
    #[error(transparent)]
    GenerationConfig(#[from] GenerationConfigError),
    /// The weights file could not be opened.
    #[error("Failed to open checkpoint weights {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    /// Candle could not read the weights.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    /// The gguf metadata has no `general.architecture` key.
    #[error("The checkpoint does not declare its architecture")]
    MissingArchitecture,
    /// The checkpoint uses an architecture that cannot be run.
    #[error("Unsupported model architecture {0:?}, expected qwen2 or llama")]
    UnsupportedArchitecture(String),
    /// The chat template does not compile.
    #[error("Invalid chat template: {0}")]
    ChatTemplate(#[from] minijinja::Error),
    /// None of the known end of sequence tokens are in the vocabulary.
    #[error("The tokenizer has no end of sequence token")]
    NoStopToken,
}

/// A loaded checkpoint: the model and the chat template that goes with it.
pub struct Qwen {
    model: QwenModel,
    formatter: QwenChatFormatter,
}

impl Qwen {
    /// Create a new builder for a checkpoint.
    pub fn builder() -> QwenBuilder {
        QwenBuilder::default()
    }

    /// Split into the generator and the formatter a session drives.
    pub fn into_parts(self) -> (QwenModel, QwenChatFormatter) {
        (self.model, self.formatter)
    }
}

/// A builder with configuration for a checkpoint.
pub struct QwenBuilder {
    source: CheckpointSource,
    device: Option<Device>,
    backend: BackendPreference,
    max_seq_len: usize,
    cache: Cache,
}

impl Default for QwenBuilder {
    fn default() -> Self {
        Self {
            source: CheckpointSource::default(),
            device: None,
            backend: BackendPreference::default(),
            max_seq_len: DEFAULT_MAX_SEQ_LEN,
            cache: Cache::default(),
        }
    }
}

impl QwenBuilder {
    /// Set the source for the checkpoint.
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = source;
        self
    }

    /// Set the device to run the model with. (Defaults to the first accelerator the backend preference allows)
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Set which backends may be used when no device is set.
    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = backend;
        self
    }

    /// Set the maximum number of prompt and generated tokens. The checkpoint's own limit still applies.
    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    /// Set the cache Hugging Face files are downloaded into.
    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = cache;
        self
    }

    fn get_device(&self) -> candle_core::Result<Device> {
        match self.device.clone() {
            Some(device) => Ok(device),
            None => self.backend.device(),
        }
    }

    /// Build the model with a handler for progress as the download and loading progresses.
    pub async fn build_with_loading_handler(
        self,
        mut handler: impl FnMut(ModelLoadingProgress),
    ) -> Result<Qwen, QwenLoadingError> {
        let device = self.get_device()?;
        let source = &self.source;

        let description = format!("Tokenizer ({})", source.tokenizer);
        let mut create_progress = ModelLoadingProgress::downloading_progress(description);
        let tokenizer_path = self
            .cache
            .get(&source.tokenizer, |progress| handler(create_progress(progress)))
            .await?;
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(QwenLoadingError::Tokenizer)?;

        let tokenizer_config = match &source.tokenizer_config {
            Some(config_source) => {
                let description = format!("Tokenizer config ({config_source})");
                let mut create_progress = ModelLoadingProgress::downloading_progress(description);
                let path = self
                    .cache
                    .get(config_source, |progress| handler(create_progress(progress)))
                    .await?;
                TokenizerConfig::load(path)?
            }
            None => TokenizerConfig::default(),
        };

        let generation_config = match &source.generation_config {
            Some(config_source) => {
                let description = format!("Generation config ({config_source})");
                let mut create_progress = ModelLoadingProgress::downloading_progress(description);
                let path = self
                    .cache
                    .get(config_source, |progress| handler(create_progress(progress)))
                    .await?;
                GenerationConfig::load(path)?
            }
            None => GenerationConfig::default(),
        };

        let is_remote = matches!(source.model, FileSource::HuggingFace { .. });
        if is_remote && !self.cache.exists(&source.model) {
            tracing::info!("{} is not cached yet, downloading it", source.model);
        }

        let description = format!("Model ({})", source.model);
        let mut create_progress = ModelLoadingProgress::downloading_progress(description);
        let model_path = self
            .cache
            .get(&source.model, |progress| handler(create_progress(progress)))
            .await?;

        handler(ModelLoadingProgress::loading(0.));
        let mut file = std::fs::File::open(&model_path)
            .map_err(|err| QwenLoadingError::Io(model_path.clone(), err))?;
        let content = gguf_file::Content::read(&mut file)?;

        let architecture = content
            .metadata
            .get("general.architecture")
            .ok_or(QwenLoadingError::MissingArchitecture)?
            .to_string()?
            .clone();
        let checkpoint_context_length = content
            .metadata
            .get(&format!("{architecture}.context_length"))
            .and_then(|value| {
                value
                    .to_u32()
                    .map(|length| length as usize)
                    .or_else(|_| value.to_u64().map(|length| length as usize))
                    .ok()
            });
        let gguf_chat_template = content
            .metadata
            .get("tokenizer.chat_template")
            .and_then(|value| value.to_string().ok())
            .cloned();
        let eos_token_id = content
            .metadata
            .get("tokenizer.ggml.eos_token_id")
            .and_then(|value| value.to_u32().ok());

        let context_length = match checkpoint_context_length {
            Some(limit) if limit < self.max_seq_len => {
                tracing::warn!(
                    "The checkpoint only supports {limit} tokens of context, lowering the maximum sequence length from {}",
                    self.max_seq_len
                );
                limit
            }
            _ => self.max_seq_len,
        };

        tracing::info!(
            "Loading {architecture} weights from {} onto {device:?}",
            model_path.display()
        );
        let weights = QwenWeights::from_gguf(&architecture, content, &mut file, &device)?;
        handler(ModelLoadingProgress::loading(1.));

        let stop_tokens = model::stop_tokens(
            &tokenizer,
            tokenizer_config.eos_token(),
            eos_token_id
                .into_iter()
                .chain(generation_config.eos_token_ids().iter().copied()),
        );
        if stop_tokens.is_empty() {
            return Err(QwenLoadingError::NoStopToken);
        }

        let chat_template = match tokenizer_config.chat_template() {
            Some(template) => template.to_string(),
            None => match gguf_chat_template {
                Some(template) => template,
                None => {
                    tracing::info!("The checkpoint has no chat template, using ChatML");
                    CHATML_TEMPLATE.to_string()
                }
            },
        };
        let formatter = QwenChatFormatter::new(
            chat_template,
            tokenizer_config.bos_token().unwrap_or_default(),
            tokenizer_config.eos_token().unwrap_or("<|im_end|>"),
        )?;

        let model = QwenModel::new(
            weights,
            Arc::new(tokenizer),
            device,
            stop_tokens,
            context_length,
        )
        .with_checkpoint_parameters(generation_config.parameters());
        Ok(Qwen { model, formatter })
    }

    /// Build the model (this will download any files that are not already cached)
    pub async fn build(self) -> Result<Qwen, QwenLoadingError> {
        self.build_with_loading_handler(ModelLoadingProgress::multi_bar_loading_indicator())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_checkpoint_files_fail_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let source = CheckpointSource::new(
            rtlgen_common::FileSource::local(dir.path().join("model.gguf")),
            rtlgen_common::FileSource::local(dir.path().join("tokenizer.json")),
        );
        let result = Qwen::builder()
            .with_source(source)
            .with_device(Device::Cpu)
            .build_with_loading_handler(|_| {})
            .await;
        assert!(matches!(
            result,
            Err(QwenLoadingError::Cache(CacheError::MissingLocalFile(_)))
        ));
    }

    #[tokio::test]
    async fn a_broken_generation_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf"), b"not read yet").unwrap();
        std::fs::write(
            dir.path().join("tokenizer.json"),
            crate::test_util::TOKENIZER_JSON,
        )
        .unwrap();
        std::fs::write(dir.path().join("generation_config.json"), "{ not json").unwrap();
        let result = Qwen::builder()
            .with_source(CheckpointSource::from_dir(dir.path()).unwrap())
            .with_device(Device::Cpu)
            .build_with_loading_handler(|_| {})
            .await;
        assert!(matches!(
            result,
            Err(QwenLoadingError::GenerationConfig(GenerationConfigError::Json(_)))
        ));
    }

    #[tokio::test]
    async fn files_that_are_not_gguf_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf"), b"definitely not gguf").unwrap();
        std::fs::write(
            dir.path().join("tokenizer.json"),
            r#"{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [],
                "normalizer": null,
                "pre_tokenizer": {"type": "Whitespace"},
                "post_processor": null,
                "decoder": null,
                "model": {"type": "WordLevel", "vocab": {"<unk>": 0, "<|im_end|>": 1}, "unk_token": "<unk>"}
            }"#,
        )
        .unwrap();
        let result = Qwen::builder()
            .with_source(CheckpointSource::from_dir(dir.path()).unwrap())
            .with_device(Device::Cpu)
            .build_with_loading_handler(|_| {})
            .await;
        assert!(matches!(result, Err(QwenLoadingError::Candle(_))));
    }
}
