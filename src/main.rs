use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sheaf_offline::app::App;
use sheaf_offline::commands::Cli;
use sheaf_offline::config::Config;
use sheaf_offline::sync::Connectivity;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let cli = Cli::parse();
  let config = Config::load(cli.config.as_deref())?;

  // File logging; stdout is reserved for command output
  let log_dir = config.data_dir()?;
  std::fs::create_dir_all(&log_dir)?;
  let file_appender = tracing_appender::rolling::daily(&log_dir, "sheaf-offline.log");
  let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_env("SHEAF_LOG").unwrap_or_else(|_| "info".into()))
    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
    .init();

  info!(command = ?cli.command, server = %config.server.url, "starting");

  // The coordinator's first probe is the reconnect edge for long-running commands
  let app = if cli.offline || cli.command.runs_coordinator() {
    App::open(&config, Connectivity::Offline)?
  } else {
    App::connect(&config).await?
  };

  let mut stdout = std::io::stdout();
  app.execute(cli.command, &mut stdout).await?;

  Ok(())
}
