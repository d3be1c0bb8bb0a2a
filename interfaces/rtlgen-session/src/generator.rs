use crate::GenerationParameters;

/// What a token consumer wants the generator to do next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFeedback {
    /// Keep generating
    Continue,
    /// Stop generating
    Stop,
}

/// A loaded model that can continue a prompt.
///
/// Generation is synchronous: the call returns once the token budget is used,
/// a stop token is produced, or `on_token` asks to stop.
pub trait TextGenerator {
    /// The error returned when generation fails
    type Error: std::error::Error + Send + Sync + 'static;

    /// Continue `prompt`, calling `on_token` with each decoded fragment as soon as it is
    /// available. The prompt itself is never passed to `on_token`.
    fn generate(
        &mut self,
        prompt: &str,
        parameters: &GenerationParameters,
        on_token: &mut dyn FnMut(&str) -> ModelFeedback,
    ) -> Result<(), Self::Error>;
}

impl<G: TextGenerator + ?Sized> TextGenerator for Box<G> {
    type Error = G::Error;

    fn generate(
        &mut self,
        prompt: &str,
        parameters: &GenerationParameters,
        on_token: &mut dyn FnMut(&str) -> ModelFeedback,
    ) -> Result<(), Self::Error> {
        (**self).generate(prompt, parameters, on_token)
    }
}
