use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use dme_bulk_uploader::client::{DmeClient, DmeHttpClient};
use dme_bulk_uploader::config::{Config, ConfigLoader};
use dme_bulk_uploader::dispatcher::{
    AutoConfirm, BatchDispatcher, CancelFlag, Confirmer, RunOutcome, StdinConfirmer,
};
use dme_bulk_uploader::domain::{ArchivePath, ArchiveType, UploadMode};
use dme_bulk_uploader::error::DmeError;
use dme_bulk_uploader::metadata::{BasicContentExtractor, MetadataResolver};
use dme_bulk_uploader::output::{JsonOutput, OutputMode, SummaryOutput};
use dme_bulk_uploader::registrar::Registrar;
use dme_bulk_uploader::sink::FileSinkFactory;
use dme_bulk_uploader::storage::PresignedHttpStorage;

const EXIT_INVALID_INPUT: u8 = 2;
const EXIT_NOTHING_TO_DO: u8 = 3;
const EXIT_COLLECTION_FAILURE: u8 = 4;
const EXIT_RUN_ERRORS: u8 = 5;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "dme-upload")]
#[command(about = "Bulk registration and upload of a local directory tree into a data management archive")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to dme-upload.json in the current directory, if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    server_url: Option<String>,

    #[arg(long, global = true)]
    token_file: Option<PathBuf>,

    #[arg(long, global = true)]
    timeout_seconds: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Register and upload a directory tree")]
    Upload(UploadArgs),
    #[command(about = "Delete one data object from the archive")]
    Delete(DeleteArgs),
}

#[derive(Args)]
struct UploadArgs {
    /// Local directory to register
    #[arg(long)]
    source: Option<PathBuf>,

    /// Newline-delimited list of paths relative to the source to register instead of walking it
    #[arg(long)]
    file_list: Option<PathBuf>,

    /// Archive collection the tree is registered under
    #[arg(long)]
    destination: Option<String>,

    #[arg(long = "include")]
    include_patterns: Vec<String>,

    #[arg(long = "exclude")]
    exclude_patterns: Vec<String>,

    #[arg(long)]
    include_file: Option<PathBuf>,

    #[arg(long)]
    exclude_file: Option<PathBuf>,

    /// Register only entries that have a metadata file
    #[arg(long)]
    metadata_only: bool,

    #[arg(long)]
    no_checksum: bool,

    #[arg(long)]
    extract_metadata: bool,

    #[arg(long)]
    metadata_file: Option<PathBuf>,

    #[arg(long)]
    archive_type: Option<ArchiveType>,

    #[arg(long)]
    upload_mode: Option<UploadMode>,

    #[arg(long)]
    threads: Option<usize>,

    #[arg(long)]
    part_size: Option<u64>,

    #[arg(long)]
    multipart_threshold: Option<u64>,

    #[arg(long)]
    pool_size: Option<usize>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    backoff_seconds: Option<u64>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    yes: bool,

    /// Scan and report without registering anything
    #[arg(long)]
    test_run: bool,
}

#[derive(Args)]
struct DeleteArgs {
    /// Archive path of the data object
    path: String,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<DmeError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(EXIT_RUN_ERRORS)
        }
    }
}

fn map_exit_code(error: &DmeError) -> u8 {
    match error {
        DmeError::SourceNotFound(_)
        | DmeError::ConfigRead(_)
        | DmeError::ConfigParse(_)
        | DmeError::InvalidConfig(_)
        | DmeError::MissingCredentials
        | DmeError::ListRead { .. }
        | DmeError::InvalidGlobPattern { .. }
        | DmeError::InvalidArchivePath { .. } => EXIT_INVALID_INPUT,
        DmeError::Confirmation(_) => EXIT_NOTHING_TO_DO,
        DmeError::CollectionRegistration { .. } => EXIT_COLLECTION_FAILURE,
        DmeError::Cancelled => EXIT_CANCELLED,
        _ => EXIT_RUN_ERRORS,
    }
}

fn run() -> miette::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let mut config = ConfigLoader::load(cli.config.as_deref())?;
    if cli.server_url.is_some() {
        config.server_url = cli.server_url;
    }
    if cli.token_file.is_some() {
        config.token = None;
        config.token_file = cli.token_file;
    }
    if cli.timeout_seconds.is_some() {
        config.timeout_seconds = cli.timeout_seconds;
    }

    match cli.command {
        Commands::Upload(args) => run_upload(apply_overrides(config, args), output_mode),
        Commands::Delete(args) => run_delete(config, args, output_mode),
    }
}

fn apply_overrides(mut config: Config, args: UploadArgs) -> Config {
    fn set<T>(slot: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *slot = value;
        }
    }

    set(&mut config.source, args.source);
    set(&mut config.file_list, args.file_list);
    set(&mut config.destination_base_path, args.destination);
    config.include_patterns.extend(args.include_patterns);
    config.exclude_patterns.extend(args.exclude_patterns);
    set(&mut config.include_pattern_file, args.include_file);
    set(&mut config.exclude_pattern_file, args.exclude_file);
    set(&mut config.metadata_file, args.metadata_file);
    set(&mut config.archive_type, args.archive_type);
    set(&mut config.upload_mode, args.upload_mode);
    set(&mut config.threads, args.threads);
    set(&mut config.part_size, args.part_size);
    set(&mut config.multipart_threshold, args.multipart_threshold);
    set(&mut config.multipart_pool_size, args.pool_size);
    set(&mut config.max_attempts, args.max_attempts);
    set(&mut config.backoff_seconds, args.backoff_seconds);
    set(&mut config.log_dir, args.log_dir);
    if args.metadata_only {
        config.metadata_only = Some(true);
    }
    if args.no_checksum {
        config.checksum = Some(false);
    }
    if args.extract_metadata {
        config.extract_metadata = Some(true);
    }
    if args.yes {
        config.confirm = Some(false);
    }
    if args.test_run {
        config.test_run = Some(true);
    }
    config
}

fn run_upload(config: Config, output_mode: OutputMode) -> miette::Result<u8> {
    let resolved = ConfigLoader::resolve_config(config)?;

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, finishing in-flight work");
        handler_flag.cancel();
    })
    .into_diagnostic()?;

    let connection = &resolved.connection;
    let client: Arc<dyn DmeClient> = Arc::new(DmeHttpClient::new(
        &connection.server_url,
        &connection.token,
        connection.timeout,
    )?);
    let storage = Arc::new(PresignedHttpStorage::new(connection.timeout)?);
    let resolver = MetadataResolver::new().with_extractor(Arc::new(BasicContentExtractor));
    let registrar = Registrar::new(
        client,
        storage,
        resolver,
        resolved.transfer.clone(),
        cancel.clone(),
    );
    let sinks = Arc::new(FileSinkFactory::new(&resolved.log_dir)?);
    let confirmer: Arc<dyn Confirmer> = if resolved.confirm {
        Arc::new(StdinConfirmer)
    } else {
        Arc::new(AutoConfirm(true))
    };

    let mut dispatcher = BatchDispatcher::new(&resolved, registrar, sinks, confirmer, cancel)?;
    let outcome = dispatcher.run()?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_outcome(&outcome).into_diagnostic()?,
        OutputMode::Human => SummaryOutput::print_outcome(&outcome).into_diagnostic()?,
    }

    Ok(match &outcome {
        RunOutcome::NothingToDo | RunOutcome::Declined => EXIT_NOTHING_TO_DO,
        RunOutcome::TestRun { .. } => 0,
        RunOutcome::Completed { cancelled: true, .. } => EXIT_CANCELLED,
        RunOutcome::Completed { report, .. } if report.is_success() => 0,
        RunOutcome::Completed { .. } => EXIT_RUN_ERRORS,
    })
}

fn run_delete(config: Config, args: DeleteArgs, output_mode: OutputMode) -> miette::Result<u8> {
    let connection = ConfigLoader::resolve_connection(&config)?;
    let path: ArchivePath = args.path.parse()?;
    let client = DmeHttpClient::new(&connection.server_url, &connection.token, connection.timeout)?;
    client.delete_data_object(&path)?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_json(&serde_json::json!({
            "deleted": path.as_str(),
        }))
        .into_diagnostic()?,
        OutputMode::Human => println!("Deleted {path}"),
    }
    Ok(0)
}
