use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use gwas_assoc_manager::alleles::MyVariantHttpClient;
use gwas_assoc_manager::app::Engine;
use gwas_assoc_manager::backend::PrsHttpClient;
use gwas_assoc_manager::cache::ResponseCache;
use gwas_assoc_manager::config::{self, RunOptions};
use gwas_assoc_manager::domain::{RefGenome, SuperPopulation, ValueKind};
use gwas_assoc_manager::error::GwasError;
use gwas_assoc_manager::output::JsonOutput;
use gwas_assoc_manager::retry::RetryPolicy;
use gwas_assoc_manager::store::WorkingStore;

#[derive(Parser)]
#[command(name = "gwas-am")]
#[command(about = "Aggregates GWAS associations and reference tables from a PRS backend")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch associations and supporting tables for a study selection")]
    Fetch(FetchArgs),
    #[command(about = "Ingest an uploaded GWAS summary table")]
    Gwas(GwasArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long, value_enum, default_value = "hg19")]
    ref_gen: RefGenome,

    #[arg(long, value_enum, default_value = "eur")]
    super_pop: SuperPopulation,

    #[arg(long, default_value = "ukbb")]
    maf_cohort: String,

    /// Trait to search for; repeat for several.
    #[arg(long = "trait")]
    traits: Vec<String>,

    /// Study type filter (HI, LC or O); repeat for several.
    #[arg(long = "study-type")]
    study_types: Vec<String>,

    /// Ethnicity filter; repeat for several.
    #[arg(long = "ethnicity")]
    ethnicities: Vec<String>,

    /// Sex filter; repeat for several.
    #[arg(long = "sex")]
    sexes: Vec<String>,

    /// Reported value type filter (beta or or); repeat for both.
    #[arg(long = "value-type", value_enum)]
    value_types: Vec<ValueKind>,

    /// Explicit study accession; repeat for several.
    #[arg(long = "study-id")]
    study_ids: Vec<String>,
}

#[derive(Args)]
struct GwasArgs {
    /// The GWAS summary table (.tsv/.txt, optionally .gz or .zip).
    file: Utf8PathBuf,

    /// Reference genome the uploaded table's positions use.
    #[arg(long, value_enum, default_value = "hg19")]
    gwas_ref_gen: RefGenome,

    /// Reference genome the run's artifacts should use.
    #[arg(long, value_enum, default_value = "hg19")]
    ref_gen: RefGenome,

    #[arg(long, value_enum, default_value = "eur")]
    super_pop: SuperPopulation,

    #[arg(long, default_value = "ukbb")]
    maf_cohort: String,

    /// Whether the table reports beta coefficients or odds ratios.
    #[arg(long, value_enum, default_value = "beta")]
    value_kind: ValueKind,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(gwas) = report.downcast_ref::<GwasError>() {
            return ExitCode::from(map_exit_code(gwas));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &GwasError) -> u8 {
    match error {
        GwasError::MissingColumns(_)
        | GwasError::InvalidCohort(_)
        | GwasError::InvalidEthnicities { .. }
        | GwasError::InvalidStudyType(_)
        | GwasError::InvalidRefGenome(_)
        | GwasError::InvalidSuperPopulation(_)
        | GwasError::InvalidValueKind(_)
        | GwasError::InputFormat(_) => 2,
        GwasError::BackendHttp(_)
        | GwasError::BackendStatus { .. }
        | GwasError::ServerTimeout(_)
        | GwasError::AnnotationHttp(_) => 3,
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

    let store = WorkingStore::new().into_diagnostic()?;
    let cache = ResponseCache::new(store.response_cache_root());
    let backend = PrsHttpClient::new(cache.clone()).into_diagnostic()?;
    let annotations = MyVariantHttpClient::new().into_diagnostic()?;
    let engine = Engine::new(store, backend, annotations, cache, RetryPolicy::default());

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, engine),
        Commands::Gwas(args) => run_gwas(args, engine),
    }
}

fn run_fetch(
    args: FetchArgs,
    engine: Engine<PrsHttpClient, MyVariantHttpClient>,
) -> miette::Result<()> {
    // the ethnicity list is only needed to validate ethnicity filters
    let available = if args.ethnicities.is_empty() {
        Vec::new()
    } else {
        engine.cached_ethnicities().into_diagnostic()?
    };

    let options = RunOptions {
        ref_gen: args.ref_gen,
        super_pop: args.super_pop,
        maf_cohort: args.maf_cohort,
        traits: non_empty(args.traits),
        study_types: non_empty(args.study_types),
        ethnicities: non_empty(args.ethnicities),
        sexes: non_empty(args.sexes),
        value_types: non_empty(args.value_types),
        study_ids: args.study_ids,
    };
    let run = config::resolve(options, &available).into_diagnostic()?;

    if run.filters.is_empty() && run.study_ids.is_empty() {
        let summary = engine.refresh_reference_data(&run).into_diagnostic()?;
        JsonOutput::print_refresh(&summary).into_diagnostic()
    } else {
        let summary = engine.fetch_filtered_associations(&run).into_diagnostic()?;
        JsonOutput::print_filtered(&summary).into_diagnostic()
    }
}

fn run_gwas(
    args: GwasArgs,
    engine: Engine<PrsHttpClient, MyVariantHttpClient>,
) -> miette::Result<()> {
    let options = RunOptions {
        ref_gen: args.ref_gen,
        super_pop: args.super_pop,
        maf_cohort: args.maf_cohort,
        ..RunOptions::default()
    };
    let run = config::resolve(options, &[]).into_diagnostic()?;

    let summary = engine
        .ingest_gwas(&args.file, args.gwas_ref_gen, args.value_kind, &run)
        .into_diagnostic()?;
    JsonOutput::print_ingest(&summary).into_diagnostic()
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    if values.is_empty() { None } else { Some(values) }
}
