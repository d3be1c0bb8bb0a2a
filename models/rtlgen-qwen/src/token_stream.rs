use std::sync::Arc;

use llm_samplers::types::{HasSamplerResources, Logits, Sampler, SamplerError};
use thiserror::Error;
use tokenizers::tokenizer::Tokenizer;

/// An error that can occur when performing streaming detokenization.
#[derive(Debug, Error)]
pub enum TokenOutputStreamError {
    /// An error that can occur when decoding.
    #[error("Tokenization error: {0}")]
    TokenizationError(tokenizers::Error),

    /// An error that can occur when sampling.
    #[error("Sampler error: {0}")]
    SamplerError(Box<dyn std::error::Error + Send + Sync>),

    /// The sampler did not sample any tokens.
    #[error("No token sampled")]
    NoTokenSampled,
}

/// Wraps a tokenizer so generated tokens can be shown as soon as they form
/// complete text, instead of after the whole response is decoded.
pub(crate) struct TokenOutputStream {
    tokenizer: Arc<Tokenizer>,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl TokenOutputStream {
    pub(crate) fn new(tokenizer: Arc<Tokenizer>) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, TokenOutputStreamError> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(TokenOutputStreamError::TokenizationError)
    }

    /// Add a token, returning any text it completes.
    pub(crate) fn next_token(
        &mut self,
        token: u32,
    ) -> Result<Option<String>, TokenOutputStreamError> {
        let prev_text = self.decode(&self.tokens[self.prev_index..self.current_index])?;
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;
        // a trailing replacement character means a multi-byte character is only partly decoded
        if text.len() > prev_text.len() && !text.ends_with('\u{FFFD}') {
            if let Some(new_text) = text.get(prev_text.len()..) {
                let new_text = new_text.to_string();
                self.prev_index = self.current_index;
                self.current_index = self.tokens.len();
                return Ok(Some(new_text));
            }
        }
        Ok(None)
    }

    /// Any text that is still held back.
    pub(crate) fn flush(&mut self) -> Result<Option<String>, TokenOutputStreamError> {
        let prev_text = self.decode(&self.tokens[self.prev_index..self.current_index])?;
        let text = self.decode(&self.tokens[self.prev_index..])?;
        self.prev_index = self.current_index;
        self.current_index = self.tokens.len();
        Ok(text
            .get(prev_text.len()..)
            .filter(|rest| !rest.is_empty())
            .map(str::to_string))
    }

    /// The number of tokens seen so far.
    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
    }
}

struct SamplerResources<'a, 'b, R: rand::Rng> {
    rng: &'a mut R,
    previous_tokens: &'b [u32],
}

impl<R> std::fmt::Debug for SamplerResources<'_, '_, R>
where
    R: rand::Rng,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerResources")
            .field("previous_tokens", &self.previous_tokens)
            .finish()
    }
}

impl<R> HasSamplerResources for SamplerResources<'_, '_, R>
where
    R: rand::Rng,
{
    fn with_rng_mut(
        &mut self,
        fun: &mut dyn FnMut(&mut dyn rand::RngCore),
    ) -> Result<(), SamplerError> {
        fun(self.rng);
        Ok(())
    }

    fn with_last_tokens(&self, fun: &mut dyn FnMut(&[u32])) -> Result<(), SamplerError> {
        fun(self.previous_tokens);
        Ok(())
    }
}

/// Samples the next token from raw logits.
pub(crate) fn sample_token(
    sampler: &mut impl Sampler,
    rng: &mut impl rand::Rng,
    previous_tokens: &[u32],
    logits: Vec<f32>,
) -> Result<u32, TokenOutputStreamError> {
    let mut logits = Logits::try_from_iter(logits)
        .map_err(|err| TokenOutputStreamError::SamplerError(err.into()))?;
    logits
        .sample_token(
            &mut SamplerResources {
                previous_tokens,
                rng,
            },
            sampler,
        )
        .map_err(|err| TokenOutputStreamError::SamplerError(err.into()))?
        .ok_or(TokenOutputStreamError::NoTokenSampled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rtlgen_session::GenerationParameters;

    #[test]
    fn split_characters_are_held_back_until_complete() {
        let mut stream = TokenOutputStream::new(crate::test_util::tokenizer());
        assert_eq!(stream.next_token(0).unwrap().as_deref(), Some("a"));
        // the first byte of `é`
        assert_eq!(stream.next_token(2).unwrap(), None);
        assert_eq!(stream.next_token(3).unwrap().as_deref(), Some("é"));
        // special tokens produce no text
        assert_eq!(stream.next_token(5).unwrap(), None);
        assert_eq!(stream.next_token(1).unwrap().as_deref(), Some("b"));
        assert_eq!(stream.flush().unwrap(), None);
        assert_eq!(stream.len(), 5);
    }

    #[test]
    fn flush_emits_an_incomplete_character() {
        let mut stream = TokenOutputStream::new(crate::test_util::tokenizer());
        assert_eq!(stream.next_token(0).unwrap().as_deref(), Some("a"));
        assert_eq!(stream.next_token(2).unwrap(), None);
        assert_eq!(stream.flush().unwrap().as_deref(), Some("\u{FFFD}"));
        assert_eq!(stream.flush().unwrap(), None);
    }

    #[test]
    fn greedy_sampling_follows_the_logits() {
        let mut sampler = GenerationParameters::default()
            .with_do_sample(false)
            .sampler();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let token = sample_token(&mut sampler, &mut rng, &[], vec![0.1, 0.2, 3.0, -1.0]).unwrap();
        assert_eq!(token, 2);
    }

    #[test]
    fn seeded_sampling_is_repeatable() {
        let parameters = GenerationParameters::default().with_temperature(1.5);
        let logits = vec![0.5, 0.4, 0.6, 0.55, 0.45];
        let draw = |seed| {
            let mut sampler = parameters.sampler();
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            (0..16)
                .map(|_| sample_token(&mut sampler, &mut rng, &[], logits.clone()).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }
}
