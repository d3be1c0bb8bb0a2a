use clap::Parser;
use rtlgen_qwen::Qwen;
use rtlgen_session::{OutputDirectory, Session, SessionState};

mod args;
mod config;
mod logging;

use args::Args;
use config::Config;

fn main() -> anyhow::Result<()> {
    let config = Config::load(Args::parse())?;
    logging::init(config.debug_log.as_deref())?;
    if let Some(path) = &config.config_file {
        tracing::debug!("Loaded config from {}", path.display());
    }
    tracing::debug!("Session state: {:?}", SessionState::Loading);

    let source = config.checkpoint_source()?;
    tracing::info!("Loading checkpoint {}", source.model());

    // only the download cache is async
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let model = runtime.block_on(
        Qwen::builder()
            .with_source(source)
            .with_backend(config.backend())
            .with_max_seq_len(config.max_seq_len)
            .build(),
    )?;
    drop(runtime);

    let (generator, formatter) = model.into_parts();
    tracing::info!(
        "Model loaded on {:?} with a {} token context window",
        generator.device(),
        generator.context_length()
    );
    let mut session = Session::new(generator, formatter).with_settings(config.settings());
    if let Some(save_dir) = &config.save_dir {
        let output_directory = OutputDirectory::create(save_dir.clone())?;
        tracing::info!(
            "Saving generated modules to {}",
            output_directory.path().display()
        );
        session = session.with_output_directory(output_directory);
    }
    tracing::debug!("Session state: {:?}", session.state());

    session.run(std::io::stdin().lock(), std::io::stdout().lock())?;
    tracing::debug!("Session state: {:?}", session.state());
    Ok(())
}
