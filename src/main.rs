//! model-race CLI.
//!
//! Runs one race for a query: previews every candidate, ranks them with
//! the judge, streams the winning full answer to stdout, and emits a
//! structured summary through tracing.
//!
//! Exit codes: 0 success, 2 configuration error, 3 all previews failed,
//! 4 judge failed, 5 budget exceeded, 6 all full attempts failed.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_model_race::client::HttpModelClient;
use tokio_model_race::config::{export_schema, Strategy};
use tokio_model_race::judge::{LlmJudge, StaticJudge};
use tokio_model_race::{
    init_tracing, metrics, Judge, ModelClient, Query, RaceConfig, RaceError, RaceOrchestrator,
    ScriptedClient,
};
use tracing::{error, info};

struct CliArgs {
    query: Option<String>,
    config_path: Option<String>,
    models: Option<String>,
    judge_model: Option<String>,
    strategy: Option<String>,
    offline: bool,
    print_schema: bool,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut out = CliArgs {
        query: None,
        config_path: None,
        models: None,
        judge_model: None,
        strategy: None,
        offline: false,
        print_schema: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => out.config_path = Some(args.next().ok_or("--config needs a path")?),
            "--models" => out.models = Some(args.next().ok_or("--models needs a list")?),
            "--judge-model" => {
                out.judge_model = Some(args.next().ok_or("--judge-model needs an id")?)
            }
            "--strategy" => out.strategy = Some(args.next().ok_or("--strategy needs a value")?),
            "--offline" => out.offline = true,
            "--schema" => out.print_schema = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if other.starts_with("--") => return Err(format!("unknown flag {other}")),
            other => {
                if out.query.is_some() {
                    return Err("only one query argument is allowed".into());
                }
                out.query = Some(other.to_string());
            }
        }
    }
    Ok(out)
}

fn print_usage() {
    println!(
        "model-race [QUERY] [--config FILE] [--models a,b,c] [--judge-model ID] \
         [--strategy baseline|bandit] [--offline] [--schema]"
    );
}

fn build_config(args: &CliArgs) -> Result<RaceConfig, RaceError> {
    let mut cfg = match &args.config_path {
        Some(path) => RaceConfig::load_from_file(Path::new(path))
            .map_err(|e| RaceError::Config(e.to_string()))?,
        None => RaceConfig::default(),
    };
    cfg.apply_env().map_err(|e| RaceError::Config(e.to_string()))?;
    if let Some(models) = &args.models {
        cfg.candidate_models = models
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(judge) = &args.judge_model {
        cfg.judge_model = judge.clone();
    }
    if let Some(strategy) = &args.strategy {
        cfg.strategy = strategy.parse().map_err(RaceError::Config)?;
    }
    cfg.validate().map_err(|e| RaceError::Config(e.to_string()))?;
    Ok(cfg)
}

/// Offline demo backends: scripted clients with staggered speeds and a
/// static judge, so the pipeline can be exercised without any network.
fn offline_participants(cfg: &RaceConfig) -> (Vec<Arc<dyn ModelClient>>, Arc<dyn Judge>) {
    let clients: Vec<Arc<dyn ModelClient>> = cfg
        .candidate_models
        .iter()
        .enumerate()
        .map(|(i, name)| {
            Arc::new(
                ScriptedClient::new(name.clone())
                    .with_first_token_delay(Duration::from_millis(20 * (i as u64 + 1)))
                    .with_batch_delay(Duration::from_millis(2))
                    .with_total_tokens(160),
            ) as Arc<dyn ModelClient>
        })
        .collect();
    let pairs: Vec<(&str, f64)> = cfg
        .candidate_models
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), 0.9 - 0.15 * i as f64))
        .collect();
    (clients, Arc::new(StaticJudge::from_pairs(&pairs)))
}

fn http_participants(
    cfg: &RaceConfig,
) -> Result<(Vec<Arc<dyn ModelClient>>, Arc<dyn Judge>), RaceError> {
    let base_url = std::env::var("MODEL_RACE_BASE_URL")
        .map_err(|_| RaceError::Config("MODEL_RACE_BASE_URL not set (or pass --offline)".into()))?;
    let api_key = std::env::var("MODEL_RACE_API_KEY").ok();

    let make = |name: &str| {
        let mut client = HttpModelClient::new(name, name).with_base_url(base_url.clone());
        if let Some(key) = &api_key {
            client = client.with_api_key(key.clone());
        }
        Arc::new(client)
    };

    let clients = cfg
        .candidate_models
        .iter()
        .map(|name| make(name) as Arc<dyn ModelClient>)
        .collect();
    let judge: Arc<dyn Judge> = Arc::new(
        LlmJudge::new(make(&cfg.judge_model)).with_retry_limit(cfg.judge_retry_limit),
    );
    Ok((clients, judge))
}

async fn run() -> Result<(), RaceError> {
    let args = parse_args().map_err(RaceError::Config)?;

    if args.print_schema {
        let schema = export_schema().map_err(|e| RaceError::Config(e.to_string()))?;
        println!("{schema}");
        return Ok(());
    }

    let cfg = build_config(&args)?;
    let query_text = args
        .query
        .ok_or_else(|| RaceError::Config("no query supplied".into()))?;

    if let Err(e) = metrics::init_metrics() {
        error!(error = %e, "metrics init failed, continuing without metrics");
    }

    let (clients, judge) = if args.offline {
        offline_participants(&cfg)
    } else {
        http_participants(&cfg)?
    };

    info!(
        models = ?cfg.candidate_models,
        strategy = ?cfg.strategy,
        "starting race"
    );

    let mut builder = RaceOrchestrator::builder(cfg.clone()).judge(judge);
    for client in clients {
        builder = builder.client(client);
    }
    let orchestrator = builder.build().await?;

    let result = orchestrator.run(&Query::new(query_text)).await?;

    println!("{}", result.answer);
    info!(
        winner = %result.winner,
        total_full_tokens = result.summary.total_full_tokens,
        fallbacks = result.summary.fallbacks,
        wall_clock_s = result.summary.wall_clock_s,
        "race finished"
    );
    if cfg.strategy == Strategy::Bandit {
        info!(
            latency = ?orchestrator.latency_metrics().snapshot(),
            "post-race latency snapshot"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(phase = ?e.phase(), error = %e, "race failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
