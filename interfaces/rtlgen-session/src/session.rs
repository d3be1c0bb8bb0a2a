use std::io::{BufRead, Write};
use std::time::Instant;

use crate::{
    ChatFormatter, ChatMessage, GenerationParameters, ModelFeedback, OutputDirectory,
    TextGenerator,
};

/// The system message every request starts with.
pub const SYSTEM_PROMPT: &str = "You are an expert Verilog and RTL design engineer.";
/// The line that ends the session, compared case-insensitively after trimming.
pub const EXIT_KEYWORD: &str = "quit";
/// Printed before every line is read.
pub const INPUT_PROMPT: &str = "\nEnter instruction (or \"quit\" to exit): ";
/// The width of the `=` lines around the echoed prompt.
pub const BANNER_WIDTH: usize = 50;

/// Returns true if the line asks the session to end.
pub fn is_exit_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(EXIT_KEYWORD)
}

/// The header printed before the generated text of a request.
pub fn banner(instruction: &str) -> String {
    let separator = "=".repeat(BANNER_WIDTH);
    format!("\n{separator}\nPROMPT: {instruction}\n{separator}\n")
}

/// An error that ends the session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError<F, G> {
    /// The chat template could not be rendered.
    #[error("Failed to render the chat prompt: {0}")]
    Format(#[source] F),
    /// The model failed while generating.
    #[error("Generation failed: {0}")]
    Generation(#[source] G),
    /// Reading instructions or writing output failed.
    #[error("Failed to read input or write output: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a session is in its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The checkpoint is still being loaded. No [`Session`] exists yet.
    Loading,
    /// Waiting for (or answering) instructions.
    Ready,
    /// The exit keyword was read or the input ended.
    Terminated,
}

/// Settings that shape every request of a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    system_prompt: String,
    parameters: GenerationParameters,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            system_prompt: SYSTEM_PROMPT.to_string(),
            parameters: GenerationParameters::default(),
        }
    }
}

impl SessionSettings {
    /// Replace the system message.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Replace the generation parameters. Their `max_new_tokens` is the budget [`Session::run`] uses.
    pub fn with_parameters(mut self, parameters: GenerationParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// The system message.
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// The generation parameters.
    pub fn parameters(&self) -> &GenerationParameters {
        &self.parameters
    }
}

/// An interactive generation session: one loaded model, one chat formatter, one request at a time.
pub struct Session<G, F> {
    generator: G,
    formatter: F,
    settings: SessionSettings,
    output_directory: Option<OutputDirectory>,
    state: SessionState,
}

impl<G, F> Session<G, F>
where
    G: TextGenerator,
    F: ChatFormatter,
{
    /// Create a session that is ready for instructions.
    pub fn new(generator: G, formatter: F) -> Self {
        Self {
            generator,
            formatter,
            settings: SessionSettings::default(),
            output_directory: None,
            state: SessionState::Ready,
        }
    }

    /// Set the settings for every request.
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Also save every finished generation as a Verilog file.
    pub fn with_output_directory(mut self, output_directory: OutputDirectory) -> Self {
        self.output_directory = Some(output_directory);
        self
    }

    /// The current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The settings for every request.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// The generator this session drives.
    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// The messages sent to the model for an instruction.
    pub fn messages(&self, instruction: &str) -> [ChatMessage; 2] {
        [
            ChatMessage::system(self.settings.system_prompt.clone()),
            ChatMessage::user(instruction),
        ]
    }

    /// Generate a response to one instruction, streaming it to `out` after a banner.
    ///
    /// `max_tokens` is passed to the generator unchanged, including zero.
    pub fn generate(
        &mut self,
        instruction: &str,
        max_tokens: u32,
        out: &mut impl Write,
    ) -> Result<(), SessionError<F::Error, G::Error>> {
        let messages = self.messages(instruction);
        let prompt = self
            .formatter
            .format_chat(&messages, true)
            .map_err(SessionError::Format)?;
        tracing::trace!("Rendered prompt: {prompt:?}");

        out.write_all(banner(instruction).as_bytes())?;
        out.flush()?;

        let parameters = self
            .settings
            .parameters
            .clone()
            .with_max_new_tokens(max_tokens);

        let keep_text = self.output_directory.is_some();
        let mut text = String::new();
        let mut fragments = 0usize;
        let mut write_error = None;
        let start = Instant::now();
        let mut on_token = |fragment: &str| {
            fragments += 1;
            if keep_text {
                text.push_str(fragment);
            }
            match out.write_all(fragment.as_bytes()).and_then(|_| out.flush()) {
                Ok(()) => ModelFeedback::Continue,
                Err(err) => {
                    write_error = Some(err);
                    ModelFeedback::Stop
                }
            }
        };
        self.generator
            .generate(&prompt, &parameters, &mut on_token)
            .map_err(SessionError::Generation)?;
        if let Some(err) = write_error {
            return Err(err.into());
        }
        tracing::debug!(
            "Streamed {fragments} fragments in {:.2}s",
            start.elapsed().as_secs_f32()
        );

        writeln!(out)?;
        out.flush()?;

        if let Some(output_directory) = &mut self.output_directory {
            output_directory.save(&text)?;
        }

        Ok(())
    }

    /// Read instructions from `input` until the exit keyword (or the end of input),
    /// generating a response to every other line with the default token budget.
    pub fn run(
        &mut self,
        mut input: impl BufRead,
        mut out: impl Write,
    ) -> Result<(), SessionError<F::Error, G::Error>> {
        let max_tokens = self.settings.parameters.max_new_tokens();
        let mut line = String::new();
        loop {
            out.write_all(INPUT_PROMPT.as_bytes())?;
            out.flush()?;

            line.clear();
            if input.read_line(&mut line)? == 0 {
                tracing::info!("Input closed, ending the session");
                break;
            }
            let instruction = line
                .strip_suffix('\n')
                .map(|line| line.strip_suffix('\r').unwrap_or(line))
                .unwrap_or(&line);
            if is_exit_command(instruction) {
                break;
            }
            self.generate(instruction, max_tokens, &mut out)?;
        }
        self.state = SessionState::Terminated;
        tracing::debug!("Session state: {:?}", self.state);
        Ok(())
    }
}
