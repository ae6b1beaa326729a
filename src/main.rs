use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use infratriage::config::Config;
use infratriage::report::ExitStatus;
use infratriage::{detect, MonitorOptions};

#[derive(Parser)]
#[command(
    name = "infratriage",
    about = "Continuous infrastructure triage over Prometheus metrics",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (falls back to $INFRATRIAGE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every rule once and print a JSON report
    Monitor {
        #[command(flatten)]
        engine: EngineArgs,

        /// Also write the report to this file
        #[arg(long)]
        export_file: Option<PathBuf>,

        /// Save the detected problems as a baseline
        #[arg(long)]
        save_baseline: Option<PathBuf>,

        /// Compare detected problems against a saved baseline
        #[arg(long)]
        compare_baseline: Option<PathBuf>,

        /// Exit 1 if the comparison finds new problems
        #[arg(long, requires = "compare_baseline")]
        fail_on_drift: bool,

        /// Exit 1 if any problem is at or above this severity (WARNING, CRITICAL, FATAL)
        #[arg(long)]
        fail_on: Option<String>,
    },

    /// Run the orchestrator continuously and serve the HTTP API
    Serve {
        #[command(flatten)]
        engine: EngineArgs,

        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// List the registered detection rules
    Rules,
}

/// Flags shared by every subcommand that talks to the backend.
#[derive(Args)]
struct EngineArgs {
    /// Prometheus base URL
    #[arg(long)]
    prometheus_url: Option<String>,

    /// Prometheus request timeout in seconds
    #[arg(long)]
    prometheus_timeout: Option<u64>,

    /// Maximum concurrent rule executions (0 = unlimited)
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Per-rule execution timeout in seconds
    #[arg(long)]
    detector_timeout: Option<u64>,

    /// Refresh interval in seconds
    #[arg(long)]
    refresh_interval: Option<u64>,

    /// Minimum severity to report (WARNING, CRITICAL, FATAL)
    #[arg(long)]
    min_severity: Option<String>,
}

impl EngineArgs {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.prometheus_url {
            config.backend.url = Some(v);
        }
        if let Some(v) = self.prometheus_timeout {
            config.backend.timeout_secs = v;
        }
        if let Some(v) = self.max_concurrency {
            config.engine.max_concurrency = v;
        }
        if let Some(v) = self.detector_timeout {
            config.engine.detector_timeout_secs = v;
        }
        if let Some(v) = self.refresh_interval {
            config.engine.refresh_interval_secs = v;
        }
        if let Some(v) = self.min_severity {
            config.report.min_severity = v;
        }
    }
}

fn init_tracing(config: Option<&Config>) {
    let level = config.map_or("info", |c| c.logging.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.is_some_and(|c| c.logging.json) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli, mut config: Config) -> Result<ExitStatus> {
    match cli.command {
        Commands::Monitor {
            engine,
            export_file,
            save_baseline,
            compare_baseline,
            fail_on_drift,
            fail_on,
        } => {
            engine.apply(&mut config);
            if fail_on.is_some() {
                config.report.fail_on = fail_on;
            }
            config.validate()?;

            let provider = infratriage::build_provider(&config)?;
            let registry = detect::default_registry().await;
            let opts = MonitorOptions {
                export_file,
                save_baseline,
                compare_baseline,
                fail_on_drift,
            };
            let mut stdout = std::io::stdout().lock();
            infratriage::monitor(&config, provider, registry, &opts, &mut stdout).await
        }
        Commands::Serve { engine, bind } => {
            engine.apply(&mut config);
            tracing::info!(%bind, "Starting infratriage daemon");
            infratriage::serve(config, &bind).await?;
            Ok(ExitStatus::Ok)
        }
        Commands::Rules => {
            let registry = detect::default_registry().await;
            let mut rules = registry.all().await;
            rules.sort_by(|a, b| a.name().cmp(b.name()));

            println!("{:<32} | {:<8} | Entity types", "Rule", "Interval");
            println!("{:-<32}-|-{:-<8}-|-{:-<24}", "", "", "");
            for rule in rules {
                println!(
                    "{:<32} | {:<8} | {}",
                    rule.name(),
                    format!("{}s", rule.interval().as_secs()),
                    rule.entity_types().join(", ")
                );
            }
            Ok(ExitStatus::Ok)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(None);
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(ExitStatus::InvalidConfig.code());
        }
    };
    init_tracing(Some(&config));

    let status = match run(cli, config).await {
        Ok(status) => status,
        Err(e) => {
            let status = ExitStatus::for_error(&e);
            tracing::error!(error = %format!("{e:#}"), "infratriage failed");
            status
        }
    };
    std::process::exit(status.code());
}
