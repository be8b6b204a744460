use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use de_profundis::app::{App, Grants};
use de_profundis::cancel::CancelToken;
use de_profundis::config::{CleanEntry, Config, ConfigLoader};
use de_profundis::confirm::{AlwaysDecline, AssumeYes, Confirm, TerminalPrompt};
use de_profundis::error::SyncError;
use de_profundis::fetch::HttpFetcher;
use de_profundis::manifest::open_source;
use de_profundis::output::{JsonOutput, OutputMode, status_lines};
use de_profundis::summary::RunSummary;
use de_profundis::tui::Tui;

#[derive(Parser)]
#[command(name = "de-profundis")]
#[command(about = "De profundiS: datasets synchronizer for a local scratch mirror")]
#[command(version, author)]
struct Cli {
    /// JSON config file (default: ./de-profundis.json when present)
    #[arg(long)]
    config: Option<String>,

    /// Directory containing the 'scratch/' folder (default: home directory)
    #[arg(long)]
    root: Option<String>,

    #[arg(long, alias = "spreadsheet_id")]
    spreadsheet_id: Option<String>,

    /// Where the downloaded spreadsheet copy is saved
    #[arg(long, alias = "spreadsheet_filename")]
    spreadsheet_filename: Option<String>,

    /// Read the manifest from a local CSV instead of the spreadsheet
    #[arg(long)]
    manifest: Option<String>,

    /// Only these datasets are synchronized
    #[arg(long, num_args = 1.., value_name = "DATASET")]
    include: Option<Vec<String>>,

    /// These datasets are skipped
    #[arg(long, num_args = 1.., value_name = "DATASET")]
    exclude: Option<Vec<String>>,

    #[arg(long, alias = "include_projects", num_args = 1.., value_name = "PROJECT")]
    include_projects: Option<Vec<String>>,

    #[arg(long, alias = "exclude_projects", num_args = 1.., value_name = "PROJECT")]
    exclude_projects: Option<Vec<String>>,

    #[arg(long, alias = "include_tasks", num_args = 1.., value_name = "TASK")]
    include_tasks: Option<Vec<String>>,

    #[arg(long, alias = "exclude_tasks", num_args = 1.., value_name = "TASK")]
    exclude_tasks: Option<Vec<String>>,

    /// Projects the scratch hierarchy is built for besides the selected ones
    #[arg(long, alias = "extra_projects", num_args = 1.., value_name = "PROJECT")]
    extra_projects: Option<Vec<String>>,

    /// Unzip freshly downloaded archives (default: true)
    #[arg(long, value_name = "BOOL")]
    unzip: Option<bool>,

    /// Delete archives once extracted (default: true, asks first)
    #[arg(long, alias = "delete_zip", value_name = "BOOL")]
    delete_zip: Option<bool>,

    /// Erase then rebuild the 'scratch/' folder
    #[arg(long, alias = "do_reset_scratch")]
    do_reset_scratch: bool,

    #[arg(long, alias = "do_build_scratch")]
    do_build_scratch: bool,

    #[arg(long, alias = "do_erase_scratch")]
    do_erase_scratch: bool,

    /// Erase the 'datasets/' folder
    #[arg(long, alias = "do_erase")]
    do_erase: bool,

    /// Extract every archive of the selected datasets
    #[arg(long, alias = "do_unzip")]
    do_unzip: bool,

    /// Delete every extracted archive of the selected datasets
    #[arg(long, alias = "do_delete_zip")]
    do_delete_zip: bool,

    /// Clean 'checkpoints/' files, for all projects or only the listed ones
    #[arg(long, alias = "clean_checkpoints", num_args = 0.., value_name = "PROJECT")]
    clean_checkpoints: Option<Vec<String>>,

    #[arg(long, alias = "clean_logs", num_args = 0.., value_name = "PROJECT")]
    clean_logs: Option<Vec<String>>,

    #[arg(long, alias = "clean_outputs", num_args = 0.., value_name = "PROJECT")]
    clean_outputs: Option<Vec<String>>,

    #[arg(long, alias = "max_concurrency")]
    max_concurrency: Option<usize>,

    /// Aggregate download ceiling in bytes per second
    #[arg(long, alias = "bandwidth_limit")]
    bandwidth_limit: Option<u64>,

    /// Confirm every destructive action
    #[arg(long, short = 'y')]
    yes: bool,

    /// Never prompt (declines unless --yes) and print the summary as JSON
    #[arg(long)]
    non_interactive: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    /// Live status table; q or Esc cancels the run
    #[arg(long, alias = "visual_gui")]
    visual_gui: bool,
}

impl Cli {
    fn overrides(&self) -> Config {
        Config {
            root: self.root.clone(),
            spreadsheet_id: self.spreadsheet_id.clone(),
            spreadsheet_filename: self.spreadsheet_filename.clone(),
            manifest_path: self.manifest.clone(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            include_projects: self.include_projects.clone(),
            exclude_projects: self.exclude_projects.clone(),
            include_tasks: self.include_tasks.clone(),
            exclude_tasks: self.exclude_tasks.clone(),
            extra_projects: self.extra_projects.clone(),
            unzip: self.unzip,
            delete_zip: self.delete_zip,
            do_reset_scratch: flag(self.do_reset_scratch),
            do_build_scratch: flag(self.do_build_scratch),
            do_erase_scratch: flag(self.do_erase_scratch),
            do_erase: flag(self.do_erase),
            do_unzip: flag(self.do_unzip),
            do_delete_zip: flag(self.do_delete_zip),
            clean_checkpoints: self.clean_checkpoints.clone().map(CleanEntry::Projects),
            clean_logs: self.clean_logs.clone().map(CleanEntry::Projects),
            clean_outputs: self.clean_outputs.clone().map(CleanEntry::Projects),
            max_concurrency: self.max_concurrency,
            bandwidth_limit: self.bandwidth_limit,
            verbose: flag(self.verbose),
            visual_gui: flag(self.visual_gui),
        }
    }
}

/// Unset flags leave the config file value in place.
fn flag(value: bool) -> Option<bool> {
    value.then_some(true)
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<SyncError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::ConflictingFilter { .. }
        | SyncError::InvalidConfig(_)
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_) => 2,
        SyncError::ManifestUnavailable(_) | SyncError::ManifestRow { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    let cli = Cli::parse();
    let resolved = ConfigLoader::resolve(cli.config.as_deref(), cli.overrides());

    let (verbose, visual) = match &resolved {
        Ok(config) => (config.verbose, config.visual_gui),
        Err(_) => (cli.verbose, false),
    };
    let default_level = match (visual, verbose) {
        (true, _) => "off",
        (false, true) => "debug",
        (false, false) => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = resolved?;
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let confirm: Box<dyn Confirm> = match (cli.yes, output_mode) {
        (true, _) => Box::new(AssumeYes),
        (false, OutputMode::NonInteractive) => Box::new(AlwaysDecline),
        (false, OutputMode::Interactive) => Box::new(TerminalPrompt),
    };
    // Prompts happen before any view takes over the terminal.
    let grants = Grants::request(&config, confirm.as_ref());

    let app = App::new(open_source(&config.manifest)?, HttpFetcher::new(None)?);
    let cancel = CancelToken::new();

    let summary = if config.visual_gui && output_mode == OutputMode::Interactive {
        let mut tui = Tui::new();
        let run_config = config.clone();
        let run_cancel = cancel.clone();
        let summary = tui.run(cancel, move |sink| {
            app.run(&run_config, grants, &run_cancel, sink)
        })?;
        tui.show_summary(&summary)?;
        summary
    } else {
        app.run(&config, grants, &cancel, &JsonOutput)?
    };

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_summary(&summary).into_diagnostic()?,
        OutputMode::Interactive => print_summary(&summary),
    }

    if summary.has_failures() {
        return Ok(ExitCode::from(4));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}De profundiS summary{reset}");
    for line in status_lines(summary) {
        println!("  {line}");
    }
    println!(
        "{green}Transferred {} bytes in {:.1}s ({} selected, {} filtered out){reset}",
        summary.bytes_transferred, summary.elapsed_secs, summary.selected, summary.dropped
    );
    if summary.cancelled {
        println!("{yellow}Run cancelled; partial downloads resume on the next run{reset}");
    }
    for action in &summary.lifecycle.declined {
        println!("{yellow}Declined: {action}{reset}");
    }
    for sweep in &summary.lifecycle.sweeps {
        println!(
            "{cyan}{}: removed {} path(s){reset}",
            sweep.action,
            sweep.report.removed.len()
        );
        for failure in &sweep.report.failed {
            println!("{red}   could not remove {}: {}{reset}", failure.path, failure.error);
        }
    }
    if let Some(built) = &summary.lifecycle.built {
        println!(
            "{cyan}Scratch: {} created, {} already present{reset}",
            built.created.len(),
            built.existing.len()
        );
        for failure in &built.failed {
            println!("{red}   could not create {}: {}{reset}", failure.path, failure.error);
        }
    }
    for failure in &summary.failures {
        println!(
            "{red}{} {} [{:?}]: {}{reset}",
            de_profundis::domain::DatasetStatus::Error.icon(),
            failure.id,
            failure.stage,
            failure.cause
        );
    }
}
