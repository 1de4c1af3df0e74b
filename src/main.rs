use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use hoon_language_server::config::{Config, Overrides};
use hoon_language_server::logging;

#[derive(Parser, Debug)]
#[command(
    name = "hoon-language-server",
    version,
    about = "Language Server for Hoon",
    long_about = "Language Server for Hoon.\n\n\
        Speaks LSP on stdio and forwards requests to the %language-server agent \
        on a running urbit ship over its HTTP API.\n\n\
        Examples:\n  \
        hoon-language-server\n  \
        hoon-language-server --port 8081 --code lidlut-tabwed-pillex-ridrup\n  \
        hoon-language-server --config ~/.config/hoon-language-server/config.toml"
)]
struct Cli {
    #[arg(long, short, help = "HTTP port of the running urbit [default: 8080]")]
    port: Option<u16>,

    #[arg(
        long,
        short,
        value_name = "MS",
        help = "Milliseconds to wait before connecting to the ship [default: 0]"
    )]
    delay: Option<u64>,

    #[arg(long, help = "Base URL of the ship [default: http://localhost]")]
    url: Option<String>,

    #[arg(long, help = "Ship name, with or without ~ [default: zod]")]
    ship: Option<String>,

    #[arg(
        long,
        env = "HOON_LS_CODE",
        hide_env_values = true,
        help = "Login code (+code) of the ship"
    )]
    code: Option<String>,

    #[arg(long, help = "Path to a TOML config file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Log file [default: /tmp/hoon-language-server.log]")]
    log_file: Option<PathBuf>,

    /// Accepted for editors that always pass it; stdio is the only transport
    #[arg(long, hide = true)]
    stdio: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            delay_ms: self.delay,
            url: self.url.clone(),
            ship: self.ship.clone(),
            code: self.code.clone(),
            log_file: self.log_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    config.apply(cli.overrides());

    logging::init(&config.logging);
    tracing::info!(
        version = hoon_language_server::VERSION,
        port = config.ship.port,
        ship = %config.ship.name,
        "starting"
    );

    match hoon_language_server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
