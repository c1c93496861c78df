mod app;
mod cli;
mod config;
mod paths;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Streamed text owns stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => paths::config_file()?,
    };
    let cfg = config::Config::load_optional(&config_path)?.unwrap_or_default();
    tracing::debug!(?config_path, backend = ?cfg.backend, "resolved config");

    let client = app::build_client(&args, &cfg)?;
    let interrupts = app::Interrupts::install();

    match &args.cmd {
        Some(cli::Command::Repl) => app::cmd_repl(&client, &cfg, &interrupts).await,
        Some(cli::Command::Complete { file, line, column }) => {
            app::cmd_complete(&client, file, *line, *column, &interrupts).await
        }
        None => {
            let prompt = args.prompt.join(" ");
            if prompt.trim().is_empty() {
                anyhow::bail!("No prompt provided. Try: wingman \"Hello\" or `wingman repl`");
            }
            app::cmd_prompt(&client, &cfg, &prompt, &interrupts).await
        }
    }
}
