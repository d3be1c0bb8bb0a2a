use std::collections::HashSet;
use std::io::{Read, Seek};
use std::sync::Arc;
use std::time::Instant;

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::{quantized_llama, quantized_qwen2};
use rand::SeedableRng;
use rtlgen_common::maybe_autoreleasepool;
use rtlgen_session::{GenerationParameters, ModelFeedback, TextGenerator};
use tokenizers::Tokenizer;

use crate::token_stream::{sample_token, TokenOutputStream, TokenOutputStreamError};
use crate::QwenLoadingError;

/// Tokens that end a ChatML turn, checked in addition to the configured end of sequence token.
const CHATML_STOP_TOKENS: [&str; 2] = ["<|im_end|>", "<|endoftext|>"];

/// An error that can occur when running a [`QwenModel`].
#[derive(Debug, thiserror::Error)]
pub enum QwenError {
    /// An error from candle while running the model.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    /// An error from tokenizers while encoding the prompt.
    #[error("Tokenizer error: {0}")]
    Tokenizer(tokenizers::Error),
    /// An error while sampling or decoding generated tokens.
    #[error(transparent)]
    TokenStream(#[from] TokenOutputStreamError),
    /// The prompt encoded to no tokens.
    #[error("Cannot run the model on an empty prompt")]
    EmptyPrompt,
    /// The prompt alone fills the context window.
    #[error(
        "The prompt is {prompt_tokens} tokens long, but the context window only holds {context_length}"
    )]
    ContextOverflow {
        /// The number of tokens in the prompt
        prompt_tokens: usize,
        /// The maximum sequence length of the model
        context_length: usize,
    },
}

/// The transformer architectures a checkpoint can use.
pub(crate) enum QwenWeights {
    Qwen2(quantized_qwen2::ModelWeights),
    Llama(quantized_llama::ModelWeights),
}

impl QwenWeights {
    pub(crate) fn from_gguf<R: Read + Seek>(
        architecture: &str,
        content: gguf_file::Content,
        reader: &mut R,
        device: &Device,
    ) -> Result<Self, QwenLoadingError> {
        match architecture {
            "qwen2" => Ok(Self::Qwen2(quantized_qwen2::ModelWeights::from_gguf(
                content, reader, device,
            )?)),
            "llama" => Ok(Self::Llama(quantized_llama::ModelWeights::from_gguf(
                content, reader, device,
            )?)),
            other => Err(QwenLoadingError::UnsupportedArchitecture(other.to_string())),
        }
    }

    /// Run the tokens starting at position `start`, returning the logits of the last one.
    fn forward(
        &mut self,
        tokens: &[u32],
        start: usize,
        device: &Device,
    ) -> candle_core::Result<Vec<f32>> {
        if tokens.is_empty() {
            candle_core::bail!("Cannot run model on empty input");
        }
        let input = Tensor::new(tokens, device)?.unsqueeze(0)?;
        let logits = match self {
            Self::Qwen2(model) => model.forward(&input, start)?,
            Self::Llama(model) => model.forward(&input, start)?,
        };
        logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1()
    }
}

/// A loaded, quantized checkpoint that generates text synchronously.
pub struct QwenModel {
    weights: QwenWeights,
    device: Device,
    decoder: Decoder,
    checkpoint_parameters: GenerationParameters,
}

impl QwenModel {
    pub(crate) fn new(
        weights: QwenWeights,
        tokenizer: Arc<Tokenizer>,
        device: Device,
        stop_tokens: HashSet<u32>,
        context_length: usize,
    ) -> Self {
        Self {
            weights,
            device,
            decoder: Decoder::new(tokenizer, stop_tokens, context_length),
            checkpoint_parameters: GenerationParameters::default(),
        }
    }

    /// Use the checkpoint's sampling defaults for anything a request leaves unset.
    pub(crate) fn with_checkpoint_parameters(mut self, parameters: GenerationParameters) -> Self {
        self.checkpoint_parameters = parameters;
        self
    }

    /// The device the weights live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The maximum number of prompt and generated tokens.
    pub fn context_length(&self) -> usize {
        self.decoder.context_length
    }
}

/// Collect the ids of every stop token the tokenizer knows about.
pub(crate) fn stop_tokens(
    tokenizer: &Tokenizer,
    eos_token: Option<&str>,
    eos_token_ids: impl IntoIterator<Item = u32>,
) -> HashSet<u32> {
    eos_token
        .into_iter()
        .chain(CHATML_STOP_TOKENS)
        .filter_map(|token| tokenizer.token_to_id(token))
        .chain(eos_token_ids)
        .collect()
}

impl TextGenerator for QwenModel {
    type Error = QwenError;

    fn generate(
        &mut self,
        prompt: &str,
        parameters: &GenerationParameters,
        on_token: &mut dyn FnMut(&str) -> ModelFeedback,
    ) -> Result<(), Self::Error> {
        let parameters = parameters
            .clone()
            .with_fallback(&self.checkpoint_parameters);
        let Self {
            weights,
            device,
            decoder,
            ..
        } = self;
        decoder.generate(
            |tokens, start| maybe_autoreleasepool(|| weights.forward(tokens, start, device)),
            prompt,
            &parameters,
            on_token,
        )
    }
}

/// The decode loop, independent of the weights that produce the logits.
pub(crate) struct Decoder {
    tokenizer: Arc<Tokenizer>,
    stop_tokens: HashSet<u32>,
    context_length: usize,
}

impl Decoder {
    pub(crate) fn new(
        tokenizer: Arc<Tokenizer>,
        stop_tokens: HashSet<u32>,
        context_length: usize,
    ) -> Self {
        Self {
            tokenizer,
            stop_tokens,
            context_length,
        }
    }

    /// Continue `prompt`. `forward` runs tokens starting at a position and returns the logits
    /// of the last one.
    pub(crate) fn generate(
        &self,
        mut forward: impl FnMut(&[u32], usize) -> candle_core::Result<Vec<f32>>,
        prompt: &str,
        parameters: &GenerationParameters,
        on_token: &mut dyn FnMut(&str) -> ModelFeedback,
    ) -> Result<(), QwenError> {
        // the chat template already contains every special token the model needs
        let encoded = self
            .tokenizer
            .encode(prompt, false)
            .map_err(QwenError::Tokenizer)?;
        let mut tokens = encoded.get_ids().to_vec();
        let prompt_tokens = tokens.len();
        if prompt_tokens == 0 {
            return Err(QwenError::EmptyPrompt);
        }
        if prompt_tokens >= self.context_length {
            return Err(QwenError::ContextOverflow {
                prompt_tokens,
                context_length: self.context_length,
            });
        }

        let max_new_tokens = parameters.max_new_tokens() as usize;
        let budget = max_new_tokens.min(self.context_length - prompt_tokens);
        if budget < max_new_tokens {
            tracing::warn!(
                "Only {budget} of the requested {max_new_tokens} tokens fit in the {} token context window",
                self.context_length
            );
        }
        tracing::debug!("Generating up to {budget} tokens after a {prompt_tokens} token prompt");

        let mut sampler = parameters.sampler();
        let mut rng = match parameters.seed() {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };
        let mut stream = TokenOutputStream::new(self.tokenizer.clone());
        let start_time = Instant::now();
        // the number of tokens already in the key/value cache
        let mut cached = 0;

        for _ in 0..budget {
            let (start, input) = if parameters.use_cache() {
                (cached, &tokens[cached..])
            } else {
                (0, &tokens[..])
            };
            let logits = forward(input, start)?;
            cached = tokens.len();

            let next_token = sample_token(&mut sampler, &mut rng, &tokens, logits)?;
            if self.stop_tokens.contains(&next_token) {
                tracing::trace!("Stop token {next_token} sampled");
                break;
            }
            tokens.push(next_token);

            if let Some(text) = stream.next_token(next_token)? {
                if on_token(&text) == ModelFeedback::Stop {
                    tracing::trace!("Generation stopped by the consumer");
                    return Ok(());
                }
            }
        }

        if let Some(text) = stream.flush()? {
            on_token(&text);
        }

        let generated = stream.len();
        let elapsed = start_time.elapsed().as_secs_f64();
        tracing::debug!(
            "Generated {generated} tokens in {elapsed:.2}s ({:.2} tokens/s)",
            generated as f64 / elapsed.max(f64::EPSILON)
        );

        Ok(())
    }
}
