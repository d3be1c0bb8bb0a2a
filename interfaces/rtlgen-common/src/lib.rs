//! Shared plumbing for rtlgen: where checkpoint files live, how they are fetched,
//! and which device the model runs on.

#![warn(missing_docs)]

use std::{fmt::Display, path::PathBuf, str::FromStr};

mod backend;
pub use backend::*;
mod cache;
pub use cache::*;
mod progress;
pub use progress::*;
mod storage;
pub use storage::*;

/// A source for a file, either from Hugging Face or a local path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileSource {
    /// A file from Hugging Face
    HuggingFace {
        /// The model id to use
        model_id: String,
        /// The revision to use
        revision: String,
        /// The file to use
        file: String,
    },
    /// A local file
    Local(PathBuf),
}

impl Display for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSource::HuggingFace {
                model_id,
                revision,
                file,
            } => write!(f, "hf://{}/{}/{}", model_id, revision, file),
            FileSource::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// An `hf://` url that does not name a model, revision and file.
#[derive(Debug, thiserror::Error)]
#[error("Invalid Hugging Face source {0:?}, expected hf://<owner>/<model>/<revision>/<file>")]
pub struct FileSourceParseError(String);

impl FromStr for FileSource {
    type Err = FileSourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix("hf://") else {
            return Ok(Self::Local(PathBuf::from(s)));
        };
        let mut parts = rest.splitn(4, '/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(model), Some(revision), Some(file))
                if [owner, model, revision, file].iter().all(|part| !part.is_empty()) =>
            {
                Ok(Self::huggingface(format!("{owner}/{model}"), revision, file))
            }
            _ => Err(FileSourceParseError(s.to_string())),
        }
    }
}

impl FileSource {
    /// Create a new source for a file from Hugging Face
    pub fn huggingface(
        model_id: impl ToString,
        revision: impl ToString,
        file: impl ToString,
    ) -> Self {
        Self::HuggingFace {
            model_id: model_id.to_string(),
            revision: revision.to_string(),
            file: file.to_string(),
        }
    }

    /// Create a new source for a local file
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local(path.into())
    }

    /// The file name this source points at, without any directories.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            FileSource::HuggingFace { file, .. } => file.rsplit('/').next(),
            FileSource::Local(path) => path.file_name().and_then(|name| name.to_str()),
        }
    }
}

/// Wrap a closure in a release pool if the metal feature is enabled
pub fn maybe_autoreleasepool<T>(f: impl FnOnce() -> T) -> T {
    #[cfg(feature = "metal")]
    // Metal buffers created outside of a pool are never released https://github.com/huggingface/candle/issues/2271
    {
        metal::objc::rc::autoreleasepool(f)
    }
    #[cfg(not(feature = "metal"))]
    {
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_huggingface_sources() {
        let source: FileSource = "hf://Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF/main/qwen2.5-coder-1.5b-instruct-q4_k_m.gguf"
            .parse()
            .unwrap();
        assert_eq!(
            source,
            FileSource::huggingface(
                "Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF",
                "main",
                "qwen2.5-coder-1.5b-instruct-q4_k_m.gguf"
            )
        );
        assert_eq!(
            source.to_string(),
            "hf://Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF/main/qwen2.5-coder-1.5b-instruct-q4_k_m.gguf"
        );
    }

    #[test]
    fn nested_files_keep_their_directories() {
        let source: FileSource = "hf://owner/model/main/quantized/model.gguf".parse().unwrap();
        assert_eq!(
            source,
            FileSource::huggingface("owner/model", "main", "quantized/model.gguf")
        );
        assert_eq!(source.file_name(), Some("model.gguf"));
    }

    #[test]
    fn plain_paths_are_local() {
        let source: FileSource = "/content/drive/MyDrive/model.gguf".parse().unwrap();
        assert_eq!(source, FileSource::local("/content/drive/MyDrive/model.gguf"));
        assert_eq!(source.file_name(), Some("model.gguf"));
    }

    #[test]
    fn incomplete_huggingface_sources_are_rejected() {
        assert!("hf://owner/model".parse::<FileSource>().is_err());
        assert!("hf://owner//main/file".parse::<FileSource>().is_err());
    }
}
