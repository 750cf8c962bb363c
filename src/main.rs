use clap::Parser;

use garage_bot::config::Config;
use garage_bot::error::Result;
use garage_bot::logging;

#[derive(Parser, Debug)]
#[command(name = "garage-bot")]
#[command(about = "Chat-first vehicle running-cost tracker with maintenance reminders")]
struct Cli {
    #[arg(long, default_value = "garage.db", env = "GARAGE_DB")]
    db: String,

    #[arg(long, env = "GARAGE_CONFIG")]
    config: Option<String>,

    #[arg(long, default_value = "127.0.0.1:7878", env = "GARAGE_BIND")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing("garage_bot");

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    garage_bot::daemon::run(config, cli.db, cli.bind).await
}
