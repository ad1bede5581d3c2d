use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use scot_covid19_data::app::{App, ExportTarget, ProgressSink, UpdateOptions};
use scot_covid19_data::config::ConfigLoader;
use scot_covid19_data::domain::SourceId;
use scot_covid19_data::error::DataError;
use scot_covid19_data::fetch::HttpFetcher;
use scot_covid19_data::output::{JsonOutput, OutputMode, TextOutput};
use scot_covid19_data::store::Store;

#[derive(Parser)]
#[command(name = "scot-covid19")]
#[command(about = "Scottish and UK COVID-19 data: download, normalise and export")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./scot-covid19.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print machine-readable summaries on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download changed sources and reload the datasets")]
    Update(UpdateArgs),
    #[command(about = "Compare local and upstream revisions without downloading")]
    Check,
    #[command(about = "Write outputs from the cached data")]
    Export(ExportArgs),
    #[command(about = "Update, then export everything")]
    Run(UpdateArgs),
}

#[derive(Args)]
struct UpdateArgs {
    #[arg(long)]
    force: bool,

    #[arg(long)]
    only: Option<SourceId>,
}

#[derive(Args)]
struct ExportArgs {
    #[arg(long, value_enum, default_value = "all")]
    target: ExportTarget,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<DataError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DataError) -> u8 {
    match error {
        DataError::MissingConfig(_)
        | DataError::ConfigRead(_)
        | DataError::ConfigParse(_)
        | DataError::ConfigInvalid(_)
        | DataError::UnknownSource(_)
        | DataError::UnknownNation(_) => 2,
        DataError::Fetch { .. } | DataError::FetchStatus { .. } | DataError::RevisionNotFound { .. } => 3,
        DataError::Parse { .. }
        | DataError::Unparseable { .. }
        | DataError::UnknownEntity { .. }
        | DataError::SchemaAmbiguity { .. }
        | DataError::MissingFile(_)
        | DataError::DatasetUnavailable(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = Store::from_config(&config)?;
    let fetcher = HttpFetcher::new(&config.http)?;
    let app = App::new(store, fetcher, config);
    let sink: &dyn ProgressSink = match mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &TextOutput,
    };

    match cli.command {
        Commands::Update(args) => {
            let result = app.update(&update_options(args), sink)?;
            match mode {
                OutputMode::Json => JsonOutput::print_update(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_update(&result),
            }
        }
        Commands::Check => {
            let result = app.check(sink)?;
            match mode {
                OutputMode::Json => JsonOutput::print_check(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_check(&result),
            }
        }
        Commands::Export(args) => {
            let loaded = app.load(sink);
            if matches!(mode, OutputMode::Text) {
                TextOutput::print_load(&loaded);
            }
            let result = app.export(args.target, sink)?;
            match mode {
                OutputMode::Json => JsonOutput::print_export(&result).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_export(&result),
            }
        }
        Commands::Run(args) => {
            let updated = app.update(&update_options(args), sink)?;
            let exported = app.export(ExportTarget::All, sink)?;
            match mode {
                OutputMode::Json => {
                    JsonOutput::print_update(&updated).into_diagnostic()?;
                    JsonOutput::print_export(&exported).into_diagnostic()?;
                }
                OutputMode::Text => {
                    TextOutput::print_update(&updated);
                    TextOutput::print_export(&exported);
                }
            }
        }
    }
    Ok(())
}

fn update_options(args: UpdateArgs) -> UpdateOptions {
    UpdateOptions {
        force: args.force,
        only: args.only,
    }
}
