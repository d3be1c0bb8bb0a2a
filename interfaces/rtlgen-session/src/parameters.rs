use llm_samplers::prelude::*;

/// The token budget used when the caller does not pick one.
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 1024;
/// The top k cutoff used when neither the caller nor the checkpoint picks one.
pub const DEFAULT_TOP_K: usize = 50;
/// How many previous tokens the repetition penalty looks at.
pub const REPETITION_PENALTY_RANGE: usize = 64;

/// Parameters to use when generating text.
///
/// `top_k`, `top_p` and `repetition_penalty` may be left unset so a
/// checkpoint's own generation config can fill them in with [`GenerationParameters::with_fallback`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParameters {
    pub(crate) temperature: f32,
    pub(crate) do_sample: bool,
    pub(crate) max_new_tokens: u32,
    pub(crate) top_k: Option<usize>,
    pub(crate) top_p: Option<f32>,
    pub(crate) repetition_penalty: Option<f32>,
    pub(crate) use_cache: bool,
    pub(crate) seed: Option<u64>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            do_sample: true,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            top_k: None,
            top_p: None,
            repetition_penalty: None,
            use_cache: true,
            seed: None,
        }
    }
}

impl GenerationParameters {
    /// Create a sampler chain from the generation parameters.
    ///
    /// Without sampling (or with a non-positive temperature) the most likely token is always picked.
    /// The repetition penalty applies with and without sampling.
    pub fn sampler(&self) -> SamplerChain {
        let mut chain = SamplerChain::new();
        if let Some(penalty) = self.repetition_penalty.filter(|penalty| *penalty != 1.0) {
            chain = chain
                + SampleRepetition::default()
                    .penalty(penalty)
                    .last_n(REPETITION_PENALTY_RANGE);
        }
        if !self.do_sample || self.temperature <= 0. {
            return chain + SampleGreedy::default();
        }
        chain = chain + SampleTemperature::default().temperature(self.temperature);
        let top_k = self.top_k.unwrap_or(DEFAULT_TOP_K);
        if top_k > 0 {
            chain = chain + SampleTopK::default().k(top_k);
        }
        let top_p = self.top_p.unwrap_or(1.0);
        if top_p < 1.0 {
            chain = chain + SampleTopP::default().p(top_p);
        }
        chain + SampleRandDistrib::default()
    }

    /// Take any of `top_k`, `top_p` and `repetition_penalty` that are not set here from `fallback`.
    pub fn with_fallback(mut self, fallback: &GenerationParameters) -> Self {
        self.top_k = self.top_k.or(fallback.top_k);
        self.top_p = self.top_p.or(fallback.top_p);
        self.repetition_penalty = self.repetition_penalty.or(fallback.repetition_penalty);
        self
    }

    /// Set the temperature to use when generating text.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set whether tokens are sampled. When false the most likely token is always picked.
    pub fn with_do_sample(mut self, do_sample: bool) -> Self {
        self.do_sample = do_sample;
        self
    }

    /// Set the maximum number of tokens to generate.
    pub fn with_max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Only sample from the `top_k` most likely tokens. Zero turns the cutoff off.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Only sample from the smallest set of tokens whose probability adds up to `top_p`.
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Scale down the logits of tokens seen recently. `1.0` leaves them unchanged.
    pub fn with_repetition_penalty(mut self, repetition_penalty: f32) -> Self {
        self.repetition_penalty = Some(repetition_penalty);
        self
    }

    /// Set whether the key/value cache is reused between decoding steps.
    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Seed the random number generator used for sampling.
    pub fn with_seed(mut self, seed: impl Into<Option<u64>>) -> Self {
        self.seed = seed.into();
        self
    }

    /// Get the temperature to use when generating text.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Get whether tokens are sampled.
    pub fn do_sample(&self) -> bool {
        self.do_sample
    }

    /// Get the maximum number of tokens to generate.
    pub fn max_new_tokens(&self) -> u32 {
        self.max_new_tokens
    }

    /// Get the top k cutoff, if one is set.
    pub fn top_k(&self) -> Option<usize> {
        self.top_k
    }

    /// Get the nucleus sampling cutoff, if one is set.
    pub fn top_p(&self) -> Option<f32> {
        self.top_p
    }

    /// Get the repetition penalty, if one is set.
    pub fn repetition_penalty(&self) -> Option<f32> {
        self.repetition_penalty
    }

    /// Get whether the key/value cache is reused.
    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    /// Get the sampling seed.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_samplers::types::{HasSamplerResources, Logits, SamplerError};
    use rand::SeedableRng;

    struct Resources {
        rng: rand::rngs::StdRng,
        last_tokens: Vec<u32>,
    }

    impl std::fmt::Debug for Resources {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Resources").finish()
        }
    }

    impl HasSamplerResources for Resources {
        fn with_rng_mut(
            &mut self,
            fun: &mut dyn FnMut(&mut dyn rand::RngCore),
        ) -> Result<(), SamplerError> {
            fun(&mut self.rng);
            Ok(())
        }

        fn with_last_tokens(&self, fun: &mut dyn FnMut(&[u32])) -> Result<(), SamplerError> {
            fun(&self.last_tokens);
            Ok(())
        }
    }

    fn sample(parameters: &GenerationParameters, logits: &[f32], seed: u64) -> u32 {
        sample_after(parameters, logits, seed, &[])
    }

    fn sample_after(
        parameters: &GenerationParameters,
        logits: &[f32],
        seed: u64,
        last_tokens: &[u32],
    ) -> u32 {
        let mut sampler = parameters.sampler();
        let mut logits = Logits::try_from_iter(logits.iter().copied()).unwrap();
        let mut resources = Resources {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
            last_tokens: last_tokens.to_vec(),
        };
        logits
            .sample_token(&mut resources, &mut sampler)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn defaults_match_the_verilog_session() {
        let parameters = GenerationParameters::default();
        assert_eq!(parameters.temperature(), 0.1);
        assert!(parameters.do_sample());
        assert_eq!(parameters.max_new_tokens(), 1024);
        assert!(parameters.use_cache());
    }

    #[test]
    fn low_temperature_concentrates_on_the_best_token() {
        let parameters = GenerationParameters::default();
        for seed in 0..32 {
            assert_eq!(sample(&parameters, &[1.0, 4.0, 2.0, 0.5], seed), 1);
        }
    }

    #[test]
    fn greedy_sampling_picks_the_maximum() {
        let parameters = GenerationParameters::default().with_do_sample(false);
        assert_eq!(sample(&parameters, &[0.3, 0.1, 0.9, 0.8], 0), 2);
    }

    #[test]
    fn top_k_of_one_is_deterministic() {
        let parameters = GenerationParameters::default()
            .with_temperature(5.0)
            .with_top_k(1);
        for seed in 0..8 {
            assert_eq!(sample(&parameters, &[0.3, 2.0, 1.9], seed), 1);
        }
    }

    #[test]
    fn unset_cutoffs_come_from_the_fallback() {
        let checkpoint = GenerationParameters::default()
            .with_top_k(20)
            .with_top_p(0.8)
            .with_repetition_penalty(1.05);
        let parameters = GenerationParameters::default()
            .with_top_k(5)
            .with_fallback(&checkpoint);
        assert_eq!(parameters.top_k(), Some(5));
        assert_eq!(parameters.top_p(), Some(0.8));
        assert_eq!(parameters.repetition_penalty(), Some(1.05));
        assert_eq!(parameters.temperature(), 0.1);

        let unset = GenerationParameters::default().with_fallback(&GenerationParameters::default());
        assert_eq!(unset.top_k(), None);
        assert_eq!(unset.top_p(), None);
    }

    #[test]
    fn repetition_penalty_applies_without_sampling() {
        let parameters = GenerationParameters::default()
            .with_do_sample(false)
            .with_repetition_penalty(4.0);
        let logits = [2.0, 1.0, 0.5];
        assert_eq!(sample_after(&parameters, &logits, 0, &[]), 0);
        assert_eq!(sample_after(&parameters, &logits, 0, &[0]), 1);
    }
}
