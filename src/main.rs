use lora_llama::LlamaLoader;
use therapy_chat::{initialize, run, SessionConfig};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Layer the LoRA adapter over the base model instead of loading the merged fine-tune.
const USE_ADAPTER: bool = false;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = SessionConfig::default().with_use_adapter(USE_ADAPTER);
    let mut session = initialize(&LlamaLoader::new(), &config)?;

    let stdin = std::io::stdin();
    run(
        &mut session,
        config.exit_command(),
        stdin.lock(),
        std::io::stdout(),
    )?;

    Ok(())
}
