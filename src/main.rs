use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use varinject::server::{self, AppState};
use varinject::{driver, AgentCodeGenerator, EnvironmentConfig, ExtractorConfig, GenerateOptions, Mode, PageExtractor};

#[derive(Parser)]
#[command(
    name = "varinject",
    about = "Page structure extraction and variant-injection agents for A/B experiments",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on
        #[arg(long, env = "VARINJECT_ADDR", default_value = "127.0.0.1:3001")]
        addr: SocketAddr,
        /// Environment preset baked into generated agents
        #[arg(long, env = "VARINJECT_MODE", default_value = "development")]
        mode: String,
        /// Override the preset's API base URL
        #[arg(long, env = "VARINJECT_API_BASE")]
        api_base: Option<String>,
        #[command(flatten)]
        extract: ExtractArgs,
    },
    /// Extract one page and print the result as JSON
    Extract {
        url: String,
        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,
        #[command(flatten)]
        extract: ExtractArgs,
    },
    /// Print the canonical agent for an experiment
    Generate {
        experiment_id: String,
        #[arg(long, env = "VARINJECT_MODE", default_value = "development")]
        mode: String,
        #[arg(long, env = "VARINJECT_API_BASE")]
        api_base: Option<String>,
        /// CSP nonce to embed
        #[arg(long)]
        nonce: Option<String>,
    },
}

#[derive(clap::Args)]
struct ExtractArgs {
    /// Page driver: "static" or "cdp" (when built with the cdp feature)
    #[arg(long)]
    backend: Option<String>,
    /// Navigation budget in milliseconds
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,
}

impl ExtractArgs {
    fn extractor(&self) -> Result<PageExtractor> {
        let config = ExtractorConfig {
            timeout_ms: self.timeout_ms,
            ..Default::default()
        };
        let driver = match &self.backend {
            Some(name) => driver::driver_by_name(name, &config)?,
            None => driver::default_driver(&config)?,
        };
        log::info!("using {} page driver", driver.name());
        Ok(PageExtractor::new(config, driver)?)
    }
}

fn environment(mode: &str, api_base: Option<String>) -> Result<EnvironmentConfig> {
    let mode: Mode = mode.parse()?;
    let env = EnvironmentConfig::for_mode(mode);
    Ok(match api_base {
        Some(base) => env.with_api_base(base),
        None => env,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            addr,
            mode,
            api_base,
            extract,
        } => {
            let generator = AgentCodeGenerator::new(environment(&mode, api_base)?);
            let state = Arc::new(AppState::new(extract.extractor()?, generator));
            server::serve(addr, state).await
        }
        Commands::Extract {
            url,
            pretty,
            extract,
        } => {
            let result = extract
                .extractor()?
                .extract(&url)
                .await
                .with_context(|| format!("extracting {}", url))?;
            let json = if pretty {
                serde_json::to_string_pretty(result.as_ref())?
            } else {
                serde_json::to_string(result.as_ref())?
            };
            println!("{}", json);
            Ok(())
        }
        Commands::Generate {
            experiment_id,
            mode,
            api_base,
            nonce,
        } => {
            let generator = AgentCodeGenerator::new(environment(&mode, api_base)?);
            let opts = GenerateOptions {
                nonce,
                ..Default::default()
            };
            print!("{}", generator.generate(&experiment_id, &opts));
            Ok(())
        }
    }
}
