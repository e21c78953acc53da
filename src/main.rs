use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use atlas_backend_core::api::server::{build_router_with_state_and_cors, serve, AppState};
use atlas_backend_core::config::{default_app_root, load_app_config, AppConfig};
use atlas_backend_core::engine::command::CommandMacroEngine;
use atlas_backend_core::engine::EngineHandle;
use atlas_backend_core::llm::AnthropicBackend;
use atlas_backend_core::pipeline::macro_script::{ConversionTemplate, MacroTemplate};
use atlas_backend_core::pipeline::preview::EnginePreviewGenerator;
use atlas_backend_core::pipeline::runtime::EngineMacroOrchestrator;
use atlas_backend_core::worker::cleanup::{spawn_cleanup_worker, CleanupScheduler};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    if matches!(cli_args.first().map(String::as_str), Some("validate-config")) {
        run_validate_config_cli(cli_args.into_iter().skip(1).collect::<Vec<_>>())?;
        return Ok(());
    }
    if !cli_args.is_empty() {
        let serve_args = parse_serve_cli_args(cli_args.as_slice())?;
        if serve_args.help {
            print_serve_usage();
            return Ok(());
        }
        return run_server(serve_args.app_root).await;
    }

    run_server(default_app_root()).await
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

async fn run_server(app_root: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_app_config(app_root.as_path())?;
    let addr: SocketAddr = config.bind.parse()?;
    let (macro_template, conversion_template) = load_templates(&config, app_root.as_path())?;

    let work_root = config.paths.resolved_work_root();
    tokio::fs::create_dir_all(work_root.as_path()).await?;

    let engine_config = config.engine.clone();
    let scratch_dir = work_root.join("engine");
    let engine = tokio::task::spawn_blocking(move || {
        EngineHandle::start_with_retries(
            Box::new(CommandMacroEngine::new(&engine_config, scratch_dir)),
            engine_config.start_retries,
            Duration::from_secs(engine_config.start_retry_delay_secs),
        )
    })
    .await??;
    let engine = Arc::new(engine);

    let shutdown_token = CancellationToken::new();
    let (cleanup, cleanup_rx) = CleanupScheduler::channel(config.cleanup.delay());
    let cleanup_worker = spawn_cleanup_worker(cleanup_rx, shutdown_token.clone());

    if config.llm.api_key.trim().is_empty() {
        warn!("no LLM API key configured; generation streams will report an error");
    }

    let state = AppState::new(
        Arc::new(EngineMacroOrchestrator::new(
            engine.clone(),
            macro_template,
            work_root.clone(),
            config.paths.output_categories.clone(),
            cleanup.clone(),
        )),
        Arc::new(EnginePreviewGenerator::new(
            engine.clone(),
            conversion_template,
            work_root.clone(),
            &config.readiness,
            cleanup,
        )),
        Arc::new(AnthropicBackend::new(&config.llm)),
        config.llm.clone(),
    );
    let app = build_router_with_state_and_cors(state, config.cors_origins.as_slice());

    let served = serve(addr, app, shutdown_signal()).await;

    info!("shutting down");
    shutdown_token.cancel();
    if let Err(join_error) = cleanup_worker.await {
        warn!(error = %join_error, "cleanup worker ended abnormally");
    }
    engine.shutdown();
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(signal_error) = tokio::signal::ctrl_c().await {
        warn!(error = %signal_error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn load_templates(
    config: &AppConfig,
    app_root: &Path,
) -> Result<(MacroTemplate, ConversionTemplate), Box<dyn std::error::Error>> {
    let macro_template = match config.paths.macro_template.as_deref() {
        Some(path) => MacroTemplate::load(app_root.join(path).as_path())?,
        None => MacroTemplate::default(),
    };
    let conversion_template = match config.paths.conversion_template.as_deref() {
        Some(path) => ConversionTemplate::load(app_root.join(path).as_path())?,
        None => ConversionTemplate::default(),
    };
    Ok((macro_template, conversion_template))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServeCliArgs {
    app_root: PathBuf,
    help: bool,
}

fn parse_serve_cli_args(args: &[String]) -> Result<ServeCliArgs, Box<dyn std::error::Error>> {
    let mut app_root = default_app_root();
    let mut help = false;

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                app_root = PathBuf::from(needs_value(i)?);
                i += 2;
            }
            "-h" | "--help" => {
                help = true;
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

    Ok(ServeCliArgs { app_root, help })
}

fn run_validate_config_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = parse_serve_cli_args(args.as_slice())?;
    if parsed.help {
        print_validate_config_usage();
        return Ok(());
    }

    let config = load_app_config(parsed.app_root.as_path())?;
    config.bind.parse::<SocketAddr>()?;
    load_templates(&config, parsed.app_root.as_path())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "app_root": parsed.app_root.display().to_string(),
            "llm_api_key_configured": !config.llm.api_key.trim().is_empty(),
            "config": config
        }))?
    );
    Ok(())
}

fn print_serve_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  cargo run -- [--app-root PATH]\n",
        "  cargo run -- validate-config [--app-root PATH]\n\n",
        "Defaults:\n",
        "  --app-root defaults to the current directory\n",
        "  config file: <app_root>/config/atlas.toml (override with ATLAS_CONFIG)\n"
    ));
}

fn print_validate_config_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  cargo run -- validate-config [--app-root PATH]\n\n",
        "Loads the layered config and templates, then prints the effective config.\n"
    ));
}
