use std::error::Error;
use std::path::PathBuf;

use serde_json::json;
use shutter_host_core::catalog::candidates::{
    list_available_collections, CandidateQuery, CandidateSource,
};
use shutter_host_core::catalog::client::StdioCatalogClient;
use shutter_host_core::catalog::probe::{probe_catalog, CatalogProbeReport, DEFAULT_PROBE_SAMPLE};
use shutter_host_core::catalog::CatalogGateway;
use shutter_host_core::config::{
    default_app_root, load_host_config, process_env, HostConfig, HostSettingsOverlay,
};
use shutter_host_core::llm::http::{build_provider, OllamaProvider};
use shutter_host_core::llm::ProviderKind;
use shutter_host_core::pipeline::orchestrator::{BatchOptions, BatchOrchestrator};
use shutter_host_core::pipeline::prompts::{PromptLibrary, PromptVariant};
use shutter_host_core::pipeline::runlog::RunLogWriter;
use shutter_host_core::pipeline::OperationMode;
use shutter_host_core::worker::bundle::{BundleLayout, ProcessEnvironmentResolver};
use shutter_host_core::worker::discovery::{CliDiscovery, CliLocation, CLI_BINARY};
use shutter_host_core::worker::WorkerLaunch;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn Error>>;

fn main() -> CliResult<()> {
    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (globals, rest) = parse_global_args(cli_args.as_slice())?;
    init_tracing(globals.log_json);

    let command = parse_command(rest.as_slice())?;
    if command == CliCommand::Help {
        print_usage();
        return Ok(());
    }

    let app_root = globals.app_root.clone().unwrap_or_else(default_app_root);
    let config = load_host_config(
        app_root.as_path(),
        globals.settings.as_deref(),
        &process_env(),
        &globals.overlay,
    )?;

    match command {
        CliCommand::Help => Ok(()),
        CliCommand::Run(args) => run_batch_cli(&config, args),
        CliCommand::Probe(args) => run_probe_cli(&config, args),
        CliCommand::CheckDeps => run_check_deps_cli(),
        CliCommand::ListCollections => run_list_collections_cli(&config),
        CliCommand::ListModels => run_list_models_cli(&config),
        CliCommand::ListPrompts => run_list_prompts_cli(&config),
        CliCommand::PullModel { model } => run_pull_model_cli(&config, model),
    }
}

fn init_tracing(json_output: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    let _ = if json_output {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[derive(Debug, Clone, PartialEq, Default)]
struct GlobalArgs {
    app_root: Option<PathBuf>,
    settings: Option<String>,
    log_json: bool,
    overlay: HostSettingsOverlay,
}

#[derive(Debug, Clone, PartialEq)]
struct RunCliArgs {
    mode: OperationMode,
    options: BatchOptions,
}

#[derive(Debug, Clone, PartialEq)]
struct ProbeCliArgs {
    query: CandidateQuery,
    sample: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum CliCommand {
    Help,
    Run(RunCliArgs),
    Probe(ProbeCliArgs),
    CheckDeps,
    ListCollections,
    ListModels,
    ListPrompts,
    PullModel { model: String },
}

fn missing_value(flag: &str) -> Box<dyn Error> {
    std::io::Error::other(format!("Missing value for {flag}")).into()
}

fn invalid_value(flag: &str, value: &str) -> Box<dyn Error> {
    std::io::Error::other(format!("Invalid value for {flag}: {value}")).into()
}

/// Pulls the flags every subcommand shares out of `args`; the rest is
/// returned in order for the subcommand parser.
fn parse_global_args(args: &[String]) -> CliResult<(GlobalArgs, Vec<String>)> {
    let mut globals = GlobalArgs::default();
    let mut rest = Vec::new();

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> CliResult<String> {
            let Some(value) = args.get(idx + 1) else {
                return Err(missing_value(flag));
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                globals.app_root = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--settings" => {
                globals.settings = Some(needs_value(i)?);
                i += 2;
            }
            "--appimage" => {
                globals.overlay.appimage_path = Some(needs_value(i)?);
                i += 2;
            }
            "--provider" => {
                globals.overlay.llm_provider = Some(needs_value(i)?);
                i += 2;
            }
            "--url" => {
                globals.overlay.llm_url = Some(needs_value(i)?);
                i += 2;
            }
            "--model" => {
                globals.overlay.llm_model = Some(needs_value(i)?);
                i += 2;
            }
            "--timeout" => {
                let value = needs_value(i)?;
                let secs = value
                    .parse::<f64>()
                    .map_err(|_| invalid_value(flag, value.as_str()))?;
                globals.overlay.response_timeout_secs = Some(secs);
                i += 2;
            }
            "--max-workers" => {
                let value = needs_value(i)?;
                let workers = value
                    .parse::<usize>()
                    .map_err(|_| invalid_value(flag, value.as_str()))?;
                globals.overlay.vision_max_workers = Some(workers);
                i += 2;
            }
            "--log-json" => {
                globals.log_json = true;
                i += 1;
            }
            _ => {
                rest.push(args[i].clone());
                i += 1;
            }
        }
    }
    Ok((globals, rest))
}

fn parse_command(args: &[String]) -> CliResult<CliCommand> {
    if args.is_empty()
        || args
            .iter()
            .any(|arg| matches!(arg.as_str(), "-h" | "--help" | "help"))
    {
        return Ok(CliCommand::Help);
    }

    let tail = &args[1..];
    match args[0].as_str() {
        "run" => Ok(CliCommand::Run(parse_run_cli_args(tail)?)),
        "probe" => Ok(CliCommand::Probe(parse_probe_cli_args(tail)?)),
        "check-deps" => no_extra_args(tail).map(|_| CliCommand::CheckDeps),
        "list-collections" => no_extra_args(tail).map(|_| CliCommand::ListCollections),
        "list-models" => no_extra_args(tail).map(|_| CliCommand::ListModels),
        "list-prompts" => no_extra_args(tail).map(|_| CliCommand::ListPrompts),
        "pull-model" => {
            let model = tail
                .first()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| std::io::Error::other("Missing model name for pull-model"))?;
            no_extra_args(&tail[1..])?;
            Ok(CliCommand::PullModel { model })
        }
        unknown => Err(std::io::Error::other(format!(
            "Unknown command: {unknown}\n\nUse --help for usage."
        ))
        .into()),
    }
}

fn no_extra_args(args: &[String]) -> CliResult<()> {
    match args.first() {
        Some(unknown) => Err(std::io::Error::other(format!(
            "Unknown argument: {unknown}\n\nUse --help for usage."
        ))
        .into()),
        None => Ok(()),
    }
}

/// Candidate filter flags shared by `run` and `probe`.
#[derive(Debug, Default)]
struct QueryFlags {
    source: Option<String>,
    collection: Option<String>,
    path_contains: Option<String>,
    tag: Option<String>,
    min_rating: Option<i64>,
    only_raw: bool,
}

impl QueryFlags {
    /// Returns how many arguments were consumed, or `None` for a flag that
    /// is not a query flag.
    fn accept(&mut self, args: &[String], i: usize) -> CliResult<Option<usize>> {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> CliResult<String> {
            let Some(value) = args.get(idx + 1) else {
                return Err(missing_value(flag));
            };
            Ok(value.clone())
        };

        match flag {
            "--source" => self.source = Some(needs_value(i)?),
            "--collection" => self.collection = Some(needs_value(i)?),
            "--path-contains" => self.path_contains = Some(needs_value(i)?),
            "--tag" => self.tag = Some(needs_value(i)?),
            "--min-rating" => {
                let value = needs_value(i)?;
                self.min_rating = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| invalid_value(flag, value.as_str()))?,
                );
            }
            "--only-raw" => {
                self.only_raw = true;
                return Ok(Some(1));
            }
            _ => return Ok(None),
        }
        Ok(Some(2))
    }

    fn into_query(self) -> CliResult<CandidateQuery> {
        let kind = self.source.unwrap_or_else(|| String::from("all"));
        let value = match kind.as_str() {
            "collection" => self.collection,
            "path" => self.path_contains,
            "tag" => self.tag,
            _ => None,
        };
        let source = CandidateSource::parse(kind.as_str(), value.as_deref())?;
        let mut query = CandidateQuery {
            source,
            only_raw: self.only_raw,
            ..CandidateQuery::default()
        };
        if let Some(min_rating) = self.min_rating {
            query.min_rating = min_rating;
        }
        Ok(query)
    }
}

fn parse_run_cli_args(args: &[String]) -> CliResult<RunCliArgs> {
    let mut mode = None::<OperationMode>;
    let mut options = BatchOptions::default();
    let mut query = QueryFlags::default();

    let mut i = 0usize;
    while i < args.len() {
        if let Some(consumed) = query.accept(args, i)? {
            i += consumed;
            continue;
        }
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> CliResult<String> {
            let Some(value) = args.get(idx + 1) else {
                return Err(missing_value(flag));
            };
            Ok(value.clone())
        };

        match flag {
            "--mode" => {
                let value = needs_value(i)?;
                mode = Some(
                    OperationMode::parse(value.as_str())
                        .ok_or_else(|| invalid_value(flag, value.as_str()))?,
                );
                i += 2;
            }
            "--limit" => {
                let value = needs_value(i)?;
                options.limit = value
                    .parse::<usize>()
                    .ok()
                    .filter(|limit| *limit > 0)
                    .ok_or_else(|| invalid_value(flag, value.as_str()))?;
                i += 2;
            }
            "--prompt-variant" => {
                let value = needs_value(i)?;
                options.prompt_variant = PromptVariant::parse(value.as_str())
                    .ok_or_else(|| invalid_value(flag, value.as_str()))?;
                i += 2;
            }
            "--prompt-file" => {
                options.prompt_override = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--target-dir" => {
                options.target_dir = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--text-only" => {
                options.text_only = true;
                i += 1;
            }
            "--dry-run" => {
                options.dry_run = true;
                i += 1;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    let mode = mode.ok_or_else(|| std::io::Error::other("Missing required --mode"))?;
    options.query = query.into_query()?;
    Ok(RunCliArgs { mode, options })
}

fn parse_probe_cli_args(args: &[String]) -> CliResult<ProbeCliArgs> {
    let mut sample = DEFAULT_PROBE_SAMPLE;
    let mut query = QueryFlags::default();

    let mut i = 0usize;
    while i < args.len() {
        if let Some(consumed) = query.accept(args, i)? {
            i += consumed;
            continue;
        }
        let flag = args[i].as_str();
        match flag {
            "--sample" => {
                let value = args.get(i + 1).ok_or_else(|| missing_value(flag))?;
                sample = value
                    .parse::<usize>()
                    .map_err(|_| invalid_value(flag, value.as_str()))?;
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    Ok(ProbeCliArgs {
        query: query.into_query()?,
        sample,
    })
}

/// Works out how to start the catalog worker: an explicit bundle wins,
/// otherwise a bundle is only mounted when no other form of the catalog CLI
/// can be found.
fn worker_launch(config: &HostConfig) -> WorkerLaunch {
    let resolver = ProcessEnvironmentResolver::new(BundleLayout::default());
    let discovered_bundle = match config.worker.appimage_path.as_ref() {
        Some(_) => None,
        None => match CliDiscovery::from_env().discover() {
            Some(CliLocation::Bundle(path)) => Some(path),
            Some(location) => {
                info!(
                    source = location.source(),
                    cli = %location.command_line(),
                    "catalog cli located"
                );
                None
            }
            None => {
                warn!(binary = CLI_BINARY, "catalog cli not found; worker may fail to export");
                None
            }
        },
    };
    let bundle = config
        .worker
        .appimage_path
        .as_deref()
        .or(discovered_bundle.as_deref());

    resolver
        .resolve(config.worker.command.clone(), bundle)
        .with_cwd(config.app_root.clone())
}

fn connect_catalog(config: &HostConfig) -> CliResult<StdioCatalogClient> {
    let mut client = StdioCatalogClient::start(worker_launch(config), config.worker.response_timeout)?;
    let server = client.initialize(
        config.worker.protocol_version.as_str(),
        json!({}),
        &config.worker.client_info(),
    )?;
    info!(server = %server.get("serverInfo").cloned().unwrap_or_default(), "catalog worker ready");
    Ok(client)
}

fn run_batch_cli(config: &HostConfig, args: RunCliArgs) -> CliResult<()> {
    let mut options = args.options;
    options.max_workers = config.vision.max_workers;

    let provider = build_provider(&config.llm)?;
    let mut client = connect_catalog(config)?;
    let progress = |completed: usize, total: usize, label: &str| {
        info!(completed, total, "{label}");
    };

    let outcome = BatchOrchestrator::new(
        &mut client,
        provider.as_ref(),
        config.llm.provider,
        PromptLibrary::new(config.paths.prompt_dir.clone()),
        RunLogWriter::new(config.paths.log_dir.clone()),
    )
    .with_progress(&progress)
    .run(args.mode, &options);
    client.close();

    let reports = outcome?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

fn run_probe_cli(config: &HostConfig, args: ProbeCliArgs) -> CliResult<()> {
    let discovery = CliDiscovery::from_env();
    let report = CatalogProbeReport::from_dependencies(discovery.dependency_status(&["lua", CLI_BINARY]));

    let report = match connect_catalog(config) {
        Ok(mut client) => {
            let report = probe_catalog(
                &mut client,
                report,
                config.worker.protocol_version.as_str(),
                &config.worker.client_info(),
                &args.query,
                args.sample,
            );
            client.close();
            report
        }
        Err(error) => CatalogProbeReport {
            error: Some(error.to_string()),
            ..report
        },
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_check_deps_cli() -> CliResult<()> {
    let status = CliDiscovery::from_env().dependency_status(&["lua", CLI_BINARY]);
    let missing = status
        .iter()
        .filter(|(_, location)| location.is_none())
        .map(|(name, _)| name.clone())
        .collect::<Vec<_>>();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": missing.is_empty(),
            "dependencies": status,
            "missing": missing,
        }))?
    );
    Ok(())
}

fn run_list_collections_cli(config: &HostConfig) -> CliResult<()> {
    let mut client = connect_catalog(config)?;
    let collections = list_available_collections(&mut client);
    client.close();
    println!("{}", serde_json::to_string_pretty(&collections?)?);
    Ok(())
}

fn run_list_models_cli(config: &HostConfig) -> CliResult<()> {
    let provider = build_provider(&config.llm)?;
    let models = provider.list_models()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "provider": config.llm.provider.as_str(),
            "models": models,
        }))?
    );
    Ok(())
}

fn run_list_prompts_cli(config: &HostConfig) -> CliResult<()> {
    let library = PromptLibrary::new(config.paths.prompt_dir.clone());
    let prompts = library.summaries();
    for prompt in prompts.iter().filter(|p| !p.missing_header_keys.is_empty()) {
        warn!(file = %prompt.file, missing = ?prompt.missing_header_keys, "prompt header incomplete");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "dir": library.dir().display().to_string(),
            "prompts": prompts,
        }))?
    );
    Ok(())
}

fn run_pull_model_cli(config: &HostConfig, model: String) -> CliResult<()> {
    if config.llm.provider != ProviderKind::Ollama {
        return Err(std::io::Error::other(format!(
            "pull-model is only supported for the ollama provider (configured: {})",
            config.llm.provider.as_str()
        ))
        .into());
    }
    let provider = OllamaProvider::new(&config.llm)?;
    let statuses = provider.pull_model(model.as_str())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "model": model,
            "statuses": statuses,
        }))?
    );
    Ok(())
}

fn print_usage() {
    eprintln!(
        concat!(
            "Usage:\n",
            "  shutter-host [GLOBAL FLAGS] <command> [FLAGS]\n\n",
            "Commands:\n",
            "  run --mode rating|tagging|export|treatment|full [QUERY FLAGS] [--limit N] ",
            "[--text-only] [--dry-run] [--prompt-variant basic|advanced] [--prompt-file PATH] ",
            "[--target-dir PATH]\n",
            "  probe [QUERY FLAGS] [--sample N]\n",
            "  check-deps\n",
            "  list-collections\n",
            "  list-models\n",
            "  list-prompts\n",
            "  pull-model <model>\n\n",
            "Query flags:\n",
            "  --source all|collection|path|tag [--collection PATH] [--path-contains TEXT] ",
            "[--tag TAG] [--min-rating N] [--only-raw]\n\n",
            "Global flags:\n",
            "  --app-root PATH --settings PATH --appimage PATH --provider ollama|openai-compat ",
            "--url URL --model NAME --timeout SECS --max-workers N --log-json\n\n",
            "Defaults:\n",
            "  settings: <app-root>/config/host.settings.toml, overridden by <app-root>/.env, ",
            "the environment and then flags\n"
        )
    );
}
