use billing_core::config::BillingConfig;
use billing_core::interfaces::csv::scenario_reader::ScenarioReader;
use billing_core::interfaces::csv::timeline_writer::TimelineWriter;
use billing_core::interfaces::simulation::ScenarioRunner;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenario CSV file (`action,subject,value` rows)
    scenario: PathBuf,

    /// JSON config file. Missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides how long a backend call may wait for its callback.
    #[arg(long)]
    transaction_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut config = BillingConfig::load(cli.config.as_deref()).into_diagnostic()?;
    if let Some(timeout) = cli.transaction_timeout_ms {
        config.transaction_timeout_ms = timeout;
    }
    config.validate().into_diagnostic()?;

    let file = File::open(cli.scenario).into_diagnostic()?;
    let reader = ScenarioReader::new(file);
    let stdout = io::stdout();
    let mut writer = TimelineWriter::new(stdout.lock());
    let mut runner = ScenarioRunner::new(config);

    for step_result in reader.steps() {
        match step_result {
            Ok(step) => match runner.apply(&step).await {
                Ok(row) => writer.write_row(&row).into_diagnostic()?,
                Err(e) => eprintln!("Error applying step: {}", e),
            },
            Err(e) => {
                eprintln!("Error reading step: {}", e);
            }
        }
    }

    runner.finish().await;
    writer.flush().into_diagnostic()?;

    Ok(())
}
