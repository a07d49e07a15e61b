use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use judge_eval::evaluator::{CompileRequest, ExecuteLimits, ExecuteRequest, CONSOLE_INPUT_NAME};
use judge_eval::sandbox::{check_can_run, isolate_version, AUDIT_TARGET};
use judge_eval::{EngineConfig, Evaluator};

/// Time limit for the optional trial run, in seconds
const TRIAL_TIME_LIMIT_SECS: f64 = 1.0;
/// Memory limit for the optional trial run, in KB
const TRIAL_MEMORY_LIMIT_KB: u32 = 256 * 1024;

/// Console logging, plus a separate append-only audit log when one is configured
fn init_tracing(audit_log: Option<&Path>) -> Result<()> {
    let mut console_filter = EnvFilter::from_default_env().add_directive("judge_eval=info".parse()?);

    let audit_layer = match audit_log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open audit log {:?}", path))?;
            console_filter = console_filter.add_directive(format!("{}=off", AUDIT_TARGET).parse()?);
            let audit = fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(Targets::new().with_target(AUDIT_TARGET, LevelFilter::INFO));
            Some(audit)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(console_filter))
        .with(audit_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env().context("Invalid engine configuration")?;
    init_tracing(config.audit_log_path.as_deref())?;

    info!("Using isolate at {:?}", config.isolate_path);
    info!("isolate version: {}", isolate_version(&config.isolate_path).await);

    let evaluator = Evaluator::from_config(&config).context("Failed to load language registry")?;
    for language in evaluator.registry().iter() {
        match &language.disabled {
            None => info!("Language {} ({}) is available", language.name, language.printable_name),
            Some(reason) => warn!("Language {} is disabled: {}", language.name, reason),
        }
    }

    if !check_can_run(&config.isolate_path).await {
        bail!("Cannot create isolate boxes on this host");
    }
    info!("Sandbox check passed");

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            ctrl_c_token.cancel();
        }
    });

    let versions = evaluator
        .language_versions(&token)
        .await
        .context("Failed to query language versions")?;
    for (name, version) in &versions {
        info!("Language {} version: {}", name, version);
    }

    let mut args = std::env::args().skip(1);
    if let Some(source) = args.next() {
        let input = args.next().map(PathBuf::from);
        trial_run(&evaluator, &token, PathBuf::from(source), input).await?;
    }

    evaluator
        .scheduler()
        .close(&token)
        .await
        .context("Failed to drain box scheduler")?;
    Ok(())
}

/// Compile `source` and run it once in console mode
async fn trial_run(
    evaluator: &Evaluator,
    token: &CancellationToken,
    source: PathBuf,
    input: Option<PathBuf>,
) -> Result<()> {
    let file_name = source.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let Some(language) = evaluator.registry().by_extension(file_name) else {
        bail!("No enabled language for {:?}", source);
    };
    let code = tokio::fs::read(&source)
        .await
        .with_context(|| format!("Failed to read {:?}", source))?;

    let compiled = evaluator
        .compile(
            token,
            &CompileRequest {
                language: language.name.clone(),
                code_files: BTreeMap::from([(language.source_name.clone(), code)]),
                ..Default::default()
            },
        )
        .await?;
    if !compiled.success {
        bail!("Compilation failed:\n{}{}", compiled.output, compiled.other);
    }
    if !compiled.output.is_empty() {
        info!("Compiler output:\n{}", compiled.output);
    }

    let input = match input {
        Some(path) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?,
        None => Vec::new(),
    };

    let resp = evaluator
        .execute(
            token,
            &ExecuteRequest {
                language: language.name.clone(),
                artifact: compiled.artifact.unwrap_or_default(),
                input,
                input_name: CONSOLE_INPUT_NAME.to_string(),
                output_name: "stdout".to_string(),
                limits: ExecuteLimits {
                    time_limit_secs: TRIAL_TIME_LIMIT_SECS,
                    memory_limit_kb: TRIAL_MEMORY_LIMIT_KB,
                },
                memory_quota: TRIAL_MEMORY_LIMIT_KB.min(evaluator.scheduler().memory_budget_kb()),
            },
        )
        .await?;

    info!(
        "Finished in {:.3}s using {} KB{}",
        resp.time,
        resp.memory_kb,
        if resp.comments.is_empty() {
            String::new()
        } else {
            format!(" ({})", resp.comments)
        }
    );
    if let Some(output) = resp.output {
        print!("{}", String::from_utf8_lossy(&output));
    }
    Ok(())
}
