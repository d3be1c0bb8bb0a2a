use std::path::PathBuf;

use rtlgen_common::FileSource;

/// Generate Verilog from natural-language instructions with a fine-tuned Qwen checkpoint
#[derive(clap::Parser, Debug, Clone, Default)]
#[command(name = "rtlgen", version, about, long_about = None)]
pub struct Args {
    /// Read settings from a TOML file. Flags override the file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// The checkpoint directory, a .gguf file, or hf://<owner>/<model>/<revision>/<file>
    #[arg(long)]
    pub checkpoint: Option<FileSource>,

    /// The tokenizer.json to use with an hf:// checkpoint
    #[arg(long)]
    pub tokenizer: Option<FileSource>,

    /// The storage mount that must be readable before a local checkpoint is loaded
    #[arg(long)]
    pub mount: Option<PathBuf>,

    /// The maximum number of prompt and generated tokens
    #[arg(long)]
    pub max_seq_len: Option<usize>,

    /// The maximum number of tokens to generate per instruction
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// The sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Always pick the most likely token instead of sampling
    #[arg(long)]
    pub greedy: bool,

    /// Replace the system message sent with every instruction
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Seed the sampler so runs are repeatable
    #[arg(long)]
    pub seed: Option<u64>,

    /// Save every generated module as a .v file in this directory
    #[arg(long)]
    pub save_dir: Option<PathBuf>,

    /// Run on the CPU even if an accelerator is available
    #[arg(long)]
    pub cpu: bool,

    /// Also write debug logs to this file
    #[arg(long)]
    pub debug_log: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn no_flags_leaves_everything_to_the_config() {
        let args = Args::try_parse_from(["rtlgen"]).unwrap();
        assert!(args.checkpoint.is_none());
        assert!(args.max_tokens.is_none());
        assert!(!args.greedy);
        assert!(!args.cpu);
    }

    #[test]
    fn parses_checkpoint_sources() {
        let args = Args::try_parse_from([
            "rtlgen",
            "--checkpoint",
            "hf://Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF/main/qwen2.5-coder-1.5b-instruct-q4_k_m.gguf",
            "--max-tokens",
            "256",
            "--greedy",
        ])
        .unwrap();
        assert_eq!(
            args.checkpoint,
            Some(FileSource::huggingface(
                "Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF",
                "main",
                "qwen2.5-coder-1.5b-instruct-q4_k_m.gguf"
            ))
        );
        assert_eq!(args.max_tokens, Some(256));
        assert!(args.greedy);

        let args = Args::try_parse_from(["rtlgen", "--checkpoint", "./weights"]).unwrap();
        assert_eq!(args.checkpoint, Some(FileSource::local("./weights")));
    }

    #[test]
    fn rejects_incomplete_hugging_face_sources() {
        assert!(Args::try_parse_from(["rtlgen", "--checkpoint", "hf://Qwen/model"]).is_err());
    }

    #[test]
    fn rejects_negative_budgets() {
        assert!(Args::try_parse_from(["rtlgen", "--max-tokens", "-1"]).is_err());
    }
}
