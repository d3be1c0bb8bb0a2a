use rtlgen_common::FileSource;
use std::path::{Path, PathBuf};

/// Where the fine-tuned Verilog checkpoint is mounted by default.
pub const DEFAULT_CHECKPOINT_DIR: &str = "/content/drive/MyDrive/qwen_verilog_stage4_final";
/// The storage mount that holds [`DEFAULT_CHECKPOINT_DIR`].
pub const DEFAULT_MOUNT_POINT: &str = "/content/drive";

const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// An error finding the files of a checkpoint on disk.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The checkpoint path does not exist.
    #[error("Checkpoint {0} does not exist")]
    NotFound(PathBuf),
    /// No quantized weights were found.
    #[error("No .gguf weights found in {0}")]
    NoWeights(PathBuf),
    /// No tokenizer was found next to the weights.
    #[error("No tokenizer.json found in {0}")]
    NoTokenizer(PathBuf),
    /// The checkpoint directory could not be listed.
    #[error("Failed to read checkpoint directory {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// The files that make up a quantized checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointSource {
    pub(crate) model: FileSource,
    pub(crate) tokenizer: FileSource,
    pub(crate) tokenizer_config: Option<FileSource>,
    pub(crate) generation_config: Option<FileSource>,
}

impl Default for CheckpointSource {
    fn default() -> Self {
        Self::qwen_2_5_coder_1_5b_instruct()
    }
}

impl CheckpointSource {
    /// Create a new source from the gguf weights and a `tokenizer.json`.
    pub fn new(model: FileSource, tokenizer: FileSource) -> Self {
        Self {
            model,
            tokenizer,
            tokenizer_config: None,
            generation_config: None,
        }
    }

    /// Set the `tokenizer_config.json` that holds the chat template and special tokens.
    pub fn with_tokenizer_config(
        mut self,
        tokenizer_config: impl Into<Option<FileSource>>,
    ) -> Self {
        self.tokenizer_config = tokenizer_config.into();
        self
    }

    /// Set the `generation_config.json` that holds the checkpoint's sampling defaults.
    pub fn with_generation_config(
        mut self,
        generation_config: impl Into<Option<FileSource>>,
    ) -> Self {
        self.generation_config = generation_config.into();
        self
    }

    /// The quantized weights.
    pub fn model(&self) -> &FileSource {
        &self.model
    }

    /// The tokenizer.
    pub fn tokenizer(&self) -> &FileSource {
        &self.tokenizer
    }

    /// The tokenizer config, if any.
    pub fn tokenizer_config(&self) -> Option<&FileSource> {
        self.tokenizer_config.as_ref()
    }

    /// The generation config, if any.
    pub fn generation_config(&self) -> Option<&FileSource> {
        self.generation_config.as_ref()
    }

    /// Find the checkpoint at `path`: either a directory holding the files, or
    /// a `.gguf` file with the tokenizer next to it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        if path.is_dir() {
            return Self::from_dir(path);
        }
        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::with_siblings(FileSource::local(path), dir)
    }

    /// Find the weights, tokenizer and tokenizer config in a checkpoint directory.
    ///
    /// If the directory holds several `.gguf` files the first one by name is used.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Err(CheckpointError::NotFound(dir.to_path_buf()));
        }
        let entries =
            std::fs::read_dir(dir).map_err(|err| CheckpointError::Io(dir.to_path_buf(), err))?;
        let mut weights = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|err| CheckpointError::Io(dir.to_path_buf(), err))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "gguf") {
                weights.push(path);
            }
        }
        weights.sort();
        let mut weights = weights.into_iter();
        let model = weights
            .next()
            .ok_or_else(|| CheckpointError::NoWeights(dir.to_path_buf()))?;
        let skipped: Vec<_> = weights.collect();
        if !skipped.is_empty() {
            tracing::warn!(
                "Found {} gguf files in {}, using {}",
                skipped.len() + 1,
                dir.display(),
                model.display()
            );
        }

        Self::with_siblings(FileSource::local(model), dir)
    }

    fn with_siblings(model: FileSource, dir: &Path) -> Result<Self, CheckpointError> {
        let tokenizer = dir.join(TOKENIZER_FILE);
        if !tokenizer.is_file() {
            return Err(CheckpointError::NoTokenizer(dir.to_path_buf()));
        }
        let optional = |name: &str| {
            let path = dir.join(name);
            path.is_file().then(|| FileSource::local(path))
        };
        Ok(Self::new(model, FileSource::local(tokenizer))
            .with_tokenizer_config(optional(TOKENIZER_CONFIG_FILE))
            .with_generation_config(optional(GENERATION_CONFIG_FILE)))
    }

    /// The fine-tuned Verilog checkpoint at its default mount location.
    pub fn qwen_verilog_stage4() -> Result<Self, CheckpointError> {
        Self::from_dir(DEFAULT_CHECKPOINT_DIR)
    }

    /// A preset for Qwen2.5 Coder 1.5B Instruct, quantized to 4 bits
    pub fn qwen_2_5_coder_1_5b_instruct() -> Self {
        Self::new(
            FileSource::huggingface(
                "Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF",
                "main",
                "qwen2.5-coder-1.5b-instruct-q4_k_m.gguf",
            ),
            FileSource::huggingface("Qwen/Qwen2.5-Coder-1.5B-Instruct", "main", TOKENIZER_FILE),
        )
        .with_tokenizer_config(FileSource::huggingface(
            "Qwen/Qwen2.5-Coder-1.5B-Instruct",
            "main",
            TOKENIZER_CONFIG_FILE,
        ))
        .with_generation_config(FileSource::huggingface(
            "Qwen/Qwen2.5-Coder-1.5B-Instruct",
            "main",
            GENERATION_CONFIG_FILE,
        ))
    }
}
