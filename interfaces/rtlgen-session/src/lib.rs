//! # rtlgen-session
//!
//! The interactive loop that turns natural-language instructions into Verilog.
//!
//! A [`Session`] owns a [`TextGenerator`] (a loaded model) and a [`ChatFormatter`]
//! (the model's chat template). For every instruction it builds a fixed
//! system/user message pair, renders it, and streams the generated text.
//!
//! ```rust, no_run
//! # fn run<G: rtlgen_session::TextGenerator, F: rtlgen_session::ChatFormatter>(generator: G, formatter: F) {
//! use rtlgen_session::Session;
//!
//! let mut session = Session::new(generator, formatter);
//! session
//!     .run(std::io::stdin().lock(), std::io::stdout())
//!     .unwrap();
//! # }
//! ```

#![warn(missing_docs)]

mod chat;
pub use chat::*;
mod generator;
pub use generator::*;
pub mod output;
pub use output::OutputDirectory;
mod parameters;
pub use parameters::*;
mod session;
pub use session::*;
