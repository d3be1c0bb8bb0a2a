//! Settings for a run: defaults, overridden by an optional TOML file, overridden by flags.

use std::path::{Path, PathBuf};

use rtlgen_common::{
    BackendPreference, FileSource, FileSourceParseError, StorageError, StorageMount,
};
use rtlgen_qwen::{
    CheckpointError, CheckpointSource, DEFAULT_CHECKPOINT_DIR, DEFAULT_MAX_SEQ_LEN,
    DEFAULT_MOUNT_POINT,
};
use rtlgen_session::{
    GenerationParameters, SessionSettings, DEFAULT_MAX_NEW_TOKENS, SYSTEM_PROMPT,
};
use serde::Deserialize;

use crate::args::Args;

/// An error loading the settings or locating the checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid {field} in config file: {source}")]
    Source {
        field: &'static str,
        #[source]
        source: FileSourceParseError,
    },
    #[error("Temperature must be a finite, non-negative number, got {0}")]
    InvalidTemperature(f32),
    #[error("The maximum sequence length must be at least 1")]
    EmptyContext,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// The contents of a config file. Every key is optional.
///
/// ```toml
/// checkpoint = "/content/drive/MyDrive/qwen_verilog_stage4_final"
/// max_tokens = 512
/// temperature = 0.2
/// ```
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub checkpoint: Option<String>,
    pub tokenizer: Option<String>,
    pub mount: Option<PathBuf>,
    pub max_seq_len: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub do_sample: Option<bool>,
    pub system_prompt: Option<String>,
    pub seed: Option<u64>,
    pub save_dir: Option<PathBuf>,
    pub cpu: Option<bool>,
    pub debug_log: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Read(path.to_path_buf(), err))?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse(path.to_path_buf(), err))
    }
}

/// The resolved settings for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub checkpoint: FileSource,
    pub tokenizer: Option<FileSource>,
    pub mount: Option<PathBuf>,
    pub max_seq_len: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub do_sample: bool,
    pub system_prompt: String,
    pub seed: Option<u64>,
    pub save_dir: Option<PathBuf>,
    pub cpu: bool,
    pub debug_log: Option<PathBuf>,
    /// The file the settings were read from, if any.
    pub config_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checkpoint: FileSource::local(DEFAULT_CHECKPOINT_DIR),
            tokenizer: None,
            mount: None,
            max_seq_len: DEFAULT_MAX_SEQ_LEN,
            max_tokens: DEFAULT_MAX_NEW_TOKENS,
            temperature: GenerationParameters::default().temperature(),
            do_sample: true,
            system_prompt: SYSTEM_PROMPT.to_string(),
            seed: None,
            save_dir: None,
            cpu: false,
            debug_log: None,
            config_file: None,
        }
    }
}

fn parse_source(field: &'static str, value: &str) -> Result<FileSource, ConfigError> {
    value
        .parse()
        .map_err(|source| ConfigError::Source { field, source })
}

impl Config {
    /// Read the config file named by the arguments (if any) and apply the arguments on top.
    pub fn load(args: Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(file, args)
    }

    /// Layer the file over the defaults and the arguments over the file.
    pub fn merge(file: FileConfig, args: Args) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let checkpoint = match (args.checkpoint, file.checkpoint) {
            (Some(checkpoint), _) => checkpoint,
            (None, Some(checkpoint)) => parse_source("checkpoint", &checkpoint)?,
            (None, None) => defaults.checkpoint,
        };
        let tokenizer = match (args.tokenizer, file.tokenizer) {
            (Some(tokenizer), _) => Some(tokenizer),
            (None, Some(tokenizer)) => Some(parse_source("tokenizer", &tokenizer)?),
            (None, None) => None,
        };
        let mount = args.mount.or(file.mount).or_else(|| match &checkpoint {
            FileSource::Local(path) if path.starts_with(DEFAULT_MOUNT_POINT) => {
                Some(PathBuf::from(DEFAULT_MOUNT_POINT))
            }
            _ => None,
        });

        let temperature = args
            .temperature
            .or(file.temperature)
            .unwrap_or(defaults.temperature);
        if !temperature.is_finite() || temperature < 0. {
            return Err(ConfigError::InvalidTemperature(temperature));
        }
        let max_seq_len = args
            .max_seq_len
            .or(file.max_seq_len)
            .unwrap_or(defaults.max_seq_len);
        if max_seq_len == 0 {
            return Err(ConfigError::EmptyContext);
        }

        Ok(Self {
            checkpoint,
            tokenizer,
            mount,
            max_seq_len,
            max_tokens: args
                .max_tokens
                .or(file.max_tokens)
                .unwrap_or(defaults.max_tokens),
            temperature,
            do_sample: !args.greedy && file.do_sample.unwrap_or(defaults.do_sample),
            system_prompt: args
                .system_prompt
                .or(file.system_prompt)
                .unwrap_or(defaults.system_prompt),
            seed: args.seed.or(file.seed),
            save_dir: args.save_dir.or(file.save_dir),
            cpu: args.cpu || file.cpu.unwrap_or(defaults.cpu),
            debug_log: args.debug_log.or(file.debug_log),
            config_file: args.config,
        })
    }

    pub fn parameters(&self) -> GenerationParameters {
        GenerationParameters::default()
            .with_temperature(self.temperature)
            .with_do_sample(self.do_sample)
            .with_max_new_tokens(self.max_tokens)
            .with_seed(self.seed)
    }

    pub fn settings(&self) -> SessionSettings {
        SessionSettings::default()
            .with_system_prompt(self.system_prompt.clone())
            .with_parameters(self.parameters())
    }

    pub fn backend(&self) -> BackendPreference {
        if self.cpu {
            BackendPreference::cpu_only()
        } else {
            BackendPreference::from_env()
        }
    }

    /// Find the checkpoint files, checking the storage mount first for local checkpoints.
    pub fn checkpoint_source(&self) -> Result<CheckpointSource, ConfigError> {
        match &self.checkpoint {
            FileSource::Local(path) => {
                if let Some(tokenizer) = &self.tokenizer {
                    tracing::warn!(
                        "Ignoring tokenizer {tokenizer}, local checkpoints use the tokenizer.json next to the weights"
                    );
                }
                let path = match &self.mount {
                    Some(root) => StorageMount::acquire(root)?.resolve(path)?,
                    None => path.clone(),
                };
                Ok(CheckpointSource::from_path(path)?)
            }
            FileSource::HuggingFace {
                model_id, revision, ..
            } => {
                let tokenizer = self.tokenizer.clone().unwrap_or_else(|| {
                    FileSource::huggingface(model_id, revision, "tokenizer.json")
                });
                Ok(CheckpointSource::new(self.checkpoint.clone(), tokenizer))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    fn args(flags: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("rtlgen").chain(flags.iter().copied())).unwrap()
    }

    fn file(contents: &str) -> FileConfig {
        toml::from_str(contents).unwrap()
    }

    #[test]
    fn defaults_match_the_interactive_script() {
        let config = Config::merge(FileConfig::default(), Args::default()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_seq_len, 2048);
        assert_eq!(config.max_tokens, 1024);
        assert_eq!(config.temperature, 0.1);
        assert!(config.do_sample);
        assert_eq!(
            config.system_prompt,
            "You are an expert Verilog and RTL design engineer."
        );
        // the default checkpoint lives on the mounted drive, so the mount is checked
        assert_eq!(config.mount, Some(PathBuf::from("/content/drive")));
    }

    #[test]
    fn flags_override_the_file() {
        let file = file(
            r#"
            checkpoint = "/models/verilog"
            max_tokens = 512
            temperature = 0.7
            seed = 3
            "#,
        );
        let config = Config::merge(file, args(&["--max-tokens", "64", "--greedy"])).unwrap();
        assert_eq!(config.checkpoint, FileSource::local("/models/verilog"));
        assert_eq!(config.mount, None);
        assert_eq!(config.max_tokens, 64);
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.seed, Some(3));
        assert!(!config.do_sample);
    }

    #[test]
    fn parameters_carry_the_settings() {
        let config = Config::merge(
            file("do_sample = false\nsystem_prompt = \"Write SystemVerilog.\""),
            args(&["--temperature", "0.3", "--seed", "9"]),
        )
        .unwrap();
        let settings = config.settings();
        assert_eq!(settings.system_prompt(), "Write SystemVerilog.");
        let parameters = settings.parameters();
        assert_eq!(parameters.temperature(), 0.3);
        assert!(!parameters.do_sample());
        assert_eq!(parameters.max_new_tokens(), 1024);
        assert_eq!(parameters.seed(), Some(9));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Config::merge(FileConfig::default(), args(&["--temperature=-0.5"])),
            Err(ConfigError::InvalidTemperature(_))
        ));
        assert!(matches!(
            Config::merge(FileConfig::default(), args(&["--max-seq-len", "0"])),
            Err(ConfigError::EmptyContext)
        ));
        assert!(matches!(
            Config::merge(file("checkpoint = \"hf://Qwen\""), Args::default()),
            Err(ConfigError::Source { field: "checkpoint", .. })
        ));
        assert!(toml::from_str::<FileConfig>("max_tokns = 3").is_err());
    }

    #[test]
    fn loads_the_config_file_named_by_the_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtlgen.toml");
        std::fs::write(&path, "max_tokens = 32\ncpu = true\n").unwrap();
        let config = Config::load(args(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(config.max_tokens, 32);
        assert_eq!(config.config_file, Some(path.clone()));
        assert!(config.cpu);
        assert_eq!(config.backend(), BackendPreference::cpu_only());

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load(args(&["--config", missing.to_str().unwrap()])),
            Err(ConfigError::Read(_, _))
        ));
    }

    #[test]
    fn local_checkpoints_are_found_on_the_mount() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("qwen_verilog_stage4_final");
        std::fs::create_dir(&checkpoint).unwrap();
        std::fs::write(checkpoint.join("model.gguf"), b"").unwrap();
        std::fs::write(checkpoint.join("tokenizer.json"), b"").unwrap();

        let config = Config::merge(
            FileConfig::default(),
            args(&[
                "--mount",
                dir.path().to_str().unwrap(),
                "--checkpoint",
                "qwen_verilog_stage4_final",
            ]),
        )
        .unwrap();
        let source = config.checkpoint_source().unwrap();
        assert_eq!(
            source.model(),
            &FileSource::local(checkpoint.join("model.gguf"))
        );

        // a tokenizer flag does not replace the one next to the weights
        let with_tokenizer = Config {
            tokenizer: Some(FileSource::local("/elsewhere/tokenizer.json")),
            ..config.clone()
        };
        assert_eq!(
            with_tokenizer.checkpoint_source().unwrap().tokenizer(),
            &FileSource::local(checkpoint.join("tokenizer.json"))
        );

        let unmounted = Config {
            mount: Some(dir.path().join("drive")),
            ..config
        };
        assert!(matches!(
            unmounted.checkpoint_source(),
            Err(ConfigError::Storage(StorageError::NotMounted(_)))
        ));
    }

    #[test]
    fn hugging_face_checkpoints_default_to_a_tokenizer_in_the_same_repo() {
        let config = Config::merge(
            FileConfig::default(),
            args(&["--checkpoint", "hf://acme/verilog-GGUF/main/model-q4_k_m.gguf"]),
        )
        .unwrap();
        let source = config.checkpoint_source().unwrap();
        assert_eq!(
            source.tokenizer(),
            &FileSource::huggingface("acme/verilog-GGUF", "main", "tokenizer.json")
        );
        assert_eq!(source.tokenizer_config(), None);
    }
}
