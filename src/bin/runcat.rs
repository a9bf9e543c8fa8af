use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use corpus_run_catalog::accounting::{MissingRunsMap, missing_for_run_key, missing_runs};
use corpus_run_catalog::config::{ConfigLoader, ResolvedConfig};
use corpus_run_catalog::domain::{
    AnnotationOutput, AnnotationPipeline, DocumentCollection, ExternalId, IdentifierType, RunKey,
};
use corpus_run_catalog::error::CatalogError;
use corpus_run_catalog::loader::BulkLoader;
use corpus_run_catalog::manifest::manifest_source;
use corpus_run_catalog::output::{self, OutputMode};
use corpus_run_catalog::runner::{CommandRunner, run_missing};
use corpus_run_catalog::store::CatalogStore;
use corpus_run_catalog::summary::summarize;

#[derive(Parser)]
#[command(name = "runcat")]
#[command(about = "Catalog of corpus documents and the annotation runs applied to them")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./runcat.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Catalog directory, overriding the config
    #[arg(long, global = true)]
    catalog_dir: Option<Utf8PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Register the collections listed in the config")]
    Init,
    #[command(about = "Manage document collections")]
    Collection(CollectionArgs),
    #[command(about = "Manage annotation pipelines")]
    Pipeline(PipelineArgs),
    #[command(about = "Look up documents")]
    Document(DocumentArgs),
    #[command(about = "Record annotation outputs")]
    Output(OutputArgs),
    #[command(about = "Report documents missing declared run keys")]
    Missing(MissingArgs),
    #[command(about = "Run an external annotation command over missing documents")]
    Run(RunArgs),
    #[command(about = "Show counts per collection and run key")]
    Summary,
    #[command(about = "Load local artifacts listed in a corpus manifest")]
    Load(LoadArgs),
    #[command(about = "Fold the journal into a fresh snapshot")]
    Compact,
}

impl Commands {
    /// Commands that only query the catalog and can run next to a writer.
    fn is_read_only(&self) -> bool {
        match self {
            Commands::Collection(args) => matches!(
                args.command,
                CollectionCommand::List
                    | CollectionCommand::Show { .. }
                    | CollectionCommand::RunKeys { .. }
                    | CollectionCommand::Documents { .. }
            ),
            Commands::Pipeline(args) => matches!(args.command, PipelineCommand::List),
            Commands::Document(args) => !matches!(args.command, DocumentCommand::SetText { .. }),
            Commands::Missing(_) | Commands::Summary => true,
            Commands::Init
            | Commands::Output(_)
            | Commands::Run(_)
            | Commands::Load(_)
            | Commands::Compact => false,
        }
    }
}

#[derive(Args)]
struct CollectionArgs {
    #[command(subcommand)]
    command: CollectionCommand,
}

#[derive(Subcommand)]
enum CollectionCommand {
    Add {
        short_name: String,
        #[arg(long)]
        long_name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "run-key")]
        run_keys: Vec<RunKey>,
    },
    List,
    Show {
        short_name: String,
    },
    RunKeys {
        short_name: String,
    },
    AddRunKey {
        short_name: String,
        run_key: RunKey,
    },
    RemoveRunKey {
        short_name: String,
        run_key: RunKey,
    },
    Documents {
        short_name: String,
    },
}

#[derive(Args)]
struct PipelineArgs {
    #[command(subcommand)]
    command: PipelineCommand,
}

#[derive(Subcommand)]
enum PipelineCommand {
    Add(PipelineFields),
    List,
}

#[derive(Args, Clone)]
struct PipelineFields {
    #[arg(long)]
    name: String,
    #[arg(long)]
    version: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value = "")]
    implementation: String,
}

impl From<PipelineFields> for AnnotationPipeline {
    fn from(fields: PipelineFields) -> Self {
        AnnotationPipeline {
            name: fields.name,
            description: fields.description,
            implementation: fields.implementation,
            version: fields.version,
        }
    }
}

#[derive(Args)]
struct DocumentArgs {
    #[command(subcommand)]
    command: DocumentCommand,
}

#[derive(Subcommand)]
enum DocumentCommand {
    Get {
        id_type: IdentifierType,
        value: String,
    },
    Files {
        id_type: IdentifierType,
        value: String,
        run_key: RunKey,
    },
    SetText {
        id: ExternalId,
        text_file: Utf8PathBuf,
    },
}

#[derive(Args)]
struct OutputArgs {
    #[command(subcommand)]
    command: OutputCommand,
}

#[derive(Subcommand)]
enum OutputCommand {
    Add {
        /// Document identifier, e.g. PMC13900 or pmid:11250746
        id: ExternalId,
        run_key: RunKey,
        file_path: Utf8PathBuf,
        #[arg(long, default_value_t = 0)]
        count: u64,
        /// RFC 3339 timestamp; defaults to now
        #[arg(long)]
        timestamp: Option<chrono::DateTime<chrono::Utc>>,
    },
}

#[derive(Args)]
struct MissingArgs {
    collection: String,
    #[arg(long)]
    run_key: Option<RunKey>,
}

#[derive(Args)]
struct RunArgs {
    collection: String,
    run_key: RunKey,
    #[command(flatten)]
    pipeline: PipelineFields,
    #[arg(long)]
    limit: Option<usize>,
    /// Program and arguments to run per document
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct LoadArgs {
    /// Manifest path or http(s) URL; defaults to the configured manifest URL
    #[arg(long)]
    manifest: Option<String>,
    #[arg(long)]
    source_dir: Utf8PathBuf,
    #[arg(long)]
    collection: String,
    #[arg(long)]
    library_root: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CatalogError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CatalogError) -> u8 {
    match error {
        CatalogError::NotFound { .. } | CatalogError::MissingConfig => 2,
        CatalogError::StoreIo { .. }
        | CatalogError::Filesystem(_)
        | CatalogError::ManifestHttp(_)
        | CatalogError::ManifestStatus { .. } => 3,
        CatalogError::Conflict { .. } => 4,
        CatalogError::StoreLocked(_) | CatalogError::ReadOnly(_) => 5,
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

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(dir) = cli.catalog_dir {
        config.catalog_dir = dir;
    }

    let store = if cli.command.is_read_only() {
        CatalogStore::open_read_only(&config.catalog_dir)?
    } else {
        CatalogStore::open_with(&config.catalog_dir, config.store_options)?
    };
    run_command(cli.command, &store, &config, mode)
}

fn run_command(
    command: Commands,
    store: &CatalogStore,
    config: &ResolvedConfig,
    mode: OutputMode,
) -> miette::Result<()> {
    match command {
        Commands::Init => {
            if config.source.is_none() {
                return Err(CatalogError::MissingConfig.into());
            }
            let mut registered = Vec::new();
            for collection in &config.collections {
                registered.push(store.add_document_collection(collection)?);
            }
            output::print(mode, &registered).into_diagnostic()
        }
        Commands::Collection(args) => run_collection(args.command, store, mode),
        Commands::Pipeline(args) => match args.command {
            PipelineCommand::Add(fields) => {
                let pipeline = store.add_annotation_pipeline(&fields.into())?;
                output::print(mode, &pipeline).into_diagnostic()
            }
            PipelineCommand::List => {
                output::print(mode, &store.get_annotation_pipelines()).into_diagnostic()
            }
        },
        Commands::Document(args) => match args.command {
            DocumentCommand::Get { id_type, value } => {
                let document = store.get_document_by_id(id_type, &value)?;
                output::print(mode, &document).into_diagnostic()
            }
            DocumentCommand::Files {
                id_type,
                value,
                run_key,
            } => {
                let files = store.get_annotation_files_for_document_id(id_type, &value, &run_key)?;
                output::print(mode, &files).into_diagnostic()
            }
            DocumentCommand::SetText { id, text_file } => {
                store.set_document_text_file(&id, &text_file)?;
                output::print(mode, &store.get_document(&id)?).into_diagnostic()
            }
        },
        Commands::Output(args) => match args.command {
            OutputCommand::Add {
                id,
                run_key,
                file_path,
                count,
                timestamp,
            } => {
                let document = store.get_document(&id)?;
                let mut output = AnnotationOutput::new(run_key, file_path, count);
                if let Some(timestamp) = timestamp {
                    output.timestamp = timestamp;
                }
                store.add_annotation_output(&document, &output)?;
                output::print(mode, &document).into_diagnostic()
            }
        },
        Commands::Missing(args) => {
            let report = match args.run_key {
                Some(run_key) => {
                    let documents = missing_for_run_key(store, &args.collection, &run_key)?;
                    MissingRunsMap {
                        collection: args.collection,
                        missing: [(run_key, documents)].into_iter().collect(),
                    }
                }
                None => missing_runs(store, &args.collection)?,
            };
            output::print(mode, &report).into_diagnostic()
        }
        Commands::Run(args) => {
            let mut command = args.command.into_iter();
            let program = command
                .next()
                .ok_or_else(|| miette::Report::msg("run requires a command after `--`"))?;
            let runner = CommandRunner::new(args.pipeline.into(), program, command.collect());
            let report = run_missing(store, &args.collection, &args.run_key, &runner, args.limit)?;
            output::print(mode, &report).into_diagnostic()
        }
        Commands::Summary => output::print(mode, &summarize(store)?).into_diagnostic(),
        Commands::Load(args) => {
            let location = args.manifest.unwrap_or_else(|| config.manifest_url.clone());
            let source = manifest_source(&location)?;
            let library_root = args
                .library_root
                .unwrap_or_else(|| config.library_root.clone());
            let loader = BulkLoader::new(store, library_root);
            let report = loader.load_from(source.as_ref(), &args.source_dir, &args.collection)?;
            store.compact()?;
            output::print(mode, &report).into_diagnostic()
        }
        Commands::Compact => {
            store.compact()?;
            output::print(mode, &store.counts()).into_diagnostic()
        }
    }
}

fn run_collection(
    command: CollectionCommand,
    store: &CatalogStore,
    mode: OutputMode,
) -> miette::Result<()> {
    match command {
        CollectionCommand::Add {
            short_name,
            long_name,
            description,
            run_keys,
        } => {
            let collection = DocumentCollection {
                short_name,
                long_name,
                description,
                run_keys: run_keys.into_iter().collect(),
            };
            let stored = store.add_document_collection(&collection)?;
            output::print(mode, &stored).into_diagnostic()
        }
        CollectionCommand::List => {
            output::print(mode, &store.get_document_collections()).into_diagnostic()
        }
        CollectionCommand::Show { short_name } => {
            let collection = store.get_document_collection_by_short_name(&short_name)?;
            output::print(mode, &collection).into_diagnostic()
        }
        CollectionCommand::RunKeys { short_name } => {
            let keys = store.get_document_collection_run_keys(&short_name)?;
            output::print(mode, &keys).into_diagnostic()
        }
        CollectionCommand::AddRunKey {
            short_name,
            run_key,
        } => {
            store.add_run_key_to_document_collection(&short_name, &run_key)?;
            let keys = store.get_document_collection_run_keys(&short_name)?;
            output::print(mode, &keys).into_diagnostic()
        }
        CollectionCommand::RemoveRunKey {
            short_name,
            run_key,
        } => {
            store.remove_run_key_from_document_collection(&short_name, &run_key)?;
            let keys = store.get_document_collection_run_keys(&short_name)?;
            output::print(mode, &keys).into_diagnostic()
        }
        CollectionCommand::Documents { short_name } => {
            let documents = store.get_documents_in_collection(&short_name)?;
            output::print(mode, &documents).into_diagnostic()
        }
    }
}
