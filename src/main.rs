mod console;

use std::{
    io::{self, IsTerminal},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{CommandFactory, Parser};
use sysinfo::System;
use tracing::{debug, error, metadata::LevelFilter, warn};

use console::{format_bytes, ConsoleSink};
use zimage_gen::{
    app::{ensure_installed, require_complete, run_install, Session},
    cli::Cli,
    core::{
        events::{EventSink, TracingSink},
        paths::AppPaths,
        settings::Settings,
    },
    engine::{CommandInvoker, EngineAssets, EngineOptions},
    error::{Error, Result, EXIT_CANCELLED},
    models::{
        default_engine_url, uninstall, AssetCatalog, AssetStatus, HttpDownloader,
        InstallationReport, InstallationVerifier, ModelVariant,
    },
};

fn setup_logging(verbose: bool) {
    let filter = std::env::var("ZIMAGE_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(if verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        });

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// First Ctrl-C asks the current step to stop; the second one exits.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
        if cancel.swap(true, Ordering::SeqCst) {
            std::process::exit(i32::from(EXIT_CANCELLED));
        }
        eprintln!("\nInterrupted, stopping after the current step (Ctrl-C again to quit)");
    });
    if let Err(error) = result {
        warn!("could not install Ctrl-C handler: {error}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::from(error.exit_code())
        }
    }
}

struct Context {
    paths: AppPaths,
    settings: Settings,
    catalog: AssetCatalog,
    verifier: InstallationVerifier,
    output_dir: PathBuf,
    cancel: Arc<AtomicBool>,
}

fn run(cli: Cli) -> Result<()> {
    let mut paths = AppPaths::resolve();
    if let Some(root) = &cli.cache_dir {
        paths = paths.with_cache_root(root);
    }
    paths.ensure()?;

    let mut settings = Settings::load_or_init(&paths.config_file())?;
    settings.apply_process_env();
    cli.apply_to(&mut settings);
    debug!(?settings, "effective settings");

    let engine_url = settings
        .engine_archive_url
        .clone()
        .unwrap_or_else(|| default_engine_url(settings.use_cuda));
    let catalog = AssetCatalog::for_variant(settings.model_variant, &engine_url);
    let verifier = InstallationVerifier::new(paths.cache_root());
    let output_dir = settings.resolved_output_dir(paths.output_dir());
    let context = Context {
        paths,
        settings,
        catalog,
        verifier,
        output_dir,
        cancel: Arc::new(AtomicBool::new(false)),
    };

    if cli.list_models {
        print_models(context.settings.model_variant);
        return Ok(());
    }
    if cli.info {
        print_info(&context);
        return Ok(());
    }
    if cli.check {
        let report = context.verifier.check(&context.catalog);
        print_report(&report);
        return require_complete(&report);
    }
    if let Some(key) = &cli.remove {
        match uninstall(&context.catalog, context.paths.cache_root(), key)? {
            Some(path) => println!("removed {}", path.display()),
            None => println!("{key} is not installed"),
        }
        return Ok(());
    }

    install_interrupt_handler(context.cancel.clone());
    if cli.install {
        let fetcher = HttpDownloader::new(context.cancel.clone())?;
        return run_install(
            &context.catalog,
            &context.verifier,
            &fetcher,
            install_events().as_ref(),
        );
    }
    if cli.prompt.is_none() && !cli.interactive {
        let _ = Cli::command().print_help();
        return Ok(());
    }

    let fetcher = HttpDownloader::new(context.cancel.clone())?;
    let installed = ensure_installed(
        &context.catalog,
        &context.verifier,
        context.settings.auto_download,
        &fetcher,
        install_events().as_ref(),
    );
    match installed {
        Err(error @ Error::IncompleteInstall { .. }) => {
            print_report(&context.verifier.check(&context.catalog));
            return Err(error);
        }
        other => other?,
    }

    let candidates = context.paths.engine_search_paths(
        context.settings.engine_path.as_deref(),
        &context.settings.engine_search_paths,
    );
    let invoker = CommandInvoker::locate(&candidates, EngineOptions::from(&context.settings))?
        .with_leading_args(context.settings.engine_args.clone())
        .with_timeout(context.settings.generation_timeout());
    let assets = EngineAssets::from_catalog(&context.catalog, context.paths.cache_root())?;
    let session = Session {
        settings: &context.settings,
        output_dir: &context.output_dir,
        invoker: &invoker,
        assets: &assets,
        cancel: &context.cancel,
        seed: cli.seed(),
        negative_prompt: cli.negative_prompt.clone(),
    };

    if cli.interactive {
        return session.interactive(io::stdin().lock(), io::stdout().lock());
    }
    let prompt = cli.prompt.as_deref().unwrap_or_default();
    let written = session.generate(prompt, cli.output.clone())?;
    println!("{}", written.display());
    Ok(())
}

/// A redrawn progress line for a terminal, plain log lines otherwise.
fn install_events() -> Box<dyn EventSink> {
    if io::stderr().is_terminal() {
        Box::new(ConsoleSink::new())
    } else {
        Box::new(TracingSink)
    }
}

fn print_models(selected: ModelVariant) {
    for (variant, summary) in ModelVariant::ALL.iter().zip(ModelVariant::summaries()) {
        let marker = if *variant == selected { "*" } else { " " };
        println!(
            "{marker} {:<6} {:>9}  {:<28} {}",
            summary.key,
            format_bytes(summary.approx_bytes),
            summary.name,
            summary.recommended_tier.unwrap_or_default()
        );
    }
}

fn print_report(report: &InstallationReport) {
    for check in &report.assets {
        let status = match &check.status {
            AssetStatus::Valid => "ok".to_string(),
            AssetStatus::Absent => "missing".to_string(),
            AssetStatus::Invalid(reason) => format!("invalid ({reason})"),
        };
        println!("{:<14} {:<40} {}", check.key, status, check.path.display());
    }
}

fn print_info(context: &Context) {
    let paths = &context.paths;
    println!("zimage-gen {}", env!("CARGO_PKG_VERSION"));
    print_path("cache", paths.cache_root());
    print_path("models", &paths.models_dir());
    print_path("engine dir", &paths.bin_dir());
    print_path("config", &paths.config_file());
    print_path("output", &context.output_dir);
    println!("{:<12} {}", "model", context.settings.model_variant);
    for asset in context.catalog.summary() {
        println!(
            "{:<12} {:>9}  {}",
            asset.key,
            format_bytes(asset.approx_bytes),
            asset.name
        );
    }

    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_usage();
    println!(
        "{:<12} {} {}",
        "os",
        System::name().unwrap_or_default(),
        System::os_version().unwrap_or_default()
    );
    println!("{:<12} {}", "cpus", system.cpus().len());
    println!(
        "{:<12} {} total, {} available",
        "memory",
        format_bytes(system.total_memory()),
        format_bytes(system.available_memory())
    );
}

fn print_path(label: &str, path: &Path) {
    println!("{label:<12} {}", path.display());
}
