//! reqmux CLI: exercise the dispatch core and inspect engine profiles.

use anyhow::Context;
use clap::{Parser, Subcommand};
use reqmux::config::{Config, EngineProfile, ProfileSet};
use reqmux::engine::Engine;
use reqmux::host::{self, ItemKey, MapEnv, TASK_ID_NOTE};
use reqmux::telemetry::{TelemetryConfig, init_telemetry};
use reqmux::{Admitted, EngineId, LoopConfig, LoopStats, Registry, Rejected, Wait, run_engine};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Host variable naming the engine type a request should go to.
const ENGINE_TYPE_VAR: &str = "engine-type";

#[derive(Parser)]
#[command(name = "reqmux", about = "Engine registry and push/pull dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push synthetic requests through lazily created engines
    Simulate {
        /// Number of requests to push
        #[arg(long, default_value_t = 100)]
        requests: u32,
        /// Engine types, assigned to requests round-robin
        #[arg(long, value_delimiter = ',', default_value = "proxy")]
        types: Vec<String>,
        /// Capacity for types without a profile
        #[arg(long, default_value_t = 4)]
        capacity: usize,
        /// Maximum engines per type before pushes back off
        #[arg(long, default_value_t = 4)]
        max_engines: usize,
        /// Simulated processing time per request, in milliseconds
        #[arg(long, default_value_t = 5)]
        work_ms: u64,
        /// Directory of engine profile TOML files
        #[arg(long)]
        profiles: Option<PathBuf>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate and list engine profiles
    Profiles {
        /// Directory of engine profile TOML files
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "reqmux".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Simulate {
            requests,
            types,
            capacity,
            max_engines,
            work_ms,
            profiles,
            json,
        } => {
            let profiles = load_profiles(profiles.or_else(|| config.profiles_dir.clone()))?;
            let sim = Simulation {
                requests,
                types,
                capacity,
                max_engines: max_engines.max(1),
                work: Duration::from_millis(work_ms),
            };
            cmd_simulate(&config, &profiles, sim, json).await
        }
        Command::Profiles { dir } => {
            let dir = dir
                .or_else(|| config.profiles_dir.clone())
                .context("no profile directory given (use --dir or REQMUX_PROFILES_DIR)")?;
            cmd_profiles(&ProfileSet::load_from_dir(&dir)?)
        }
    }
}

fn load_profiles(dir: Option<PathBuf>) -> anyhow::Result<ProfileSet> {
    match dir {
        Some(dir) => Ok(ProfileSet::load_from_dir(&dir)?),
        None => Ok(ProfileSet::empty()),
    }
}

/// One synthetic request on a multiplexed connection.
#[derive(Debug)]
struct Request {
    key: String,
    stream: u32,
}

impl Request {
    fn new(stream: u32) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            stream,
        }
    }
}

impl ItemKey for Request {
    fn item_key(&self) -> &str {
        &self.key
    }
}

struct Simulation {
    requests: u32,
    types: Vec<String>,
    capacity: usize,
    max_engines: usize,
    work: Duration,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    pushed: u32,
    queued: u32,
    engines_created: u32,
    backoffs: u32,
    init_failures: u32,
    engines: Vec<EngineRun>,
    events: u64,
}

#[derive(Debug, Serialize)]
struct EngineRun {
    id: EngineId,
    engine_type: String,
    stats: LoopStats,
}

async fn cmd_simulate(
    config: &Config,
    profiles: &ProfileSet,
    sim: Simulation,
    json: bool,
) -> anyhow::Result<()> {
    anyhow::ensure!(!sim.types.is_empty(), "at least one engine type is required");

    let registry: Registry<Request> = Registry::with_event_capacity(config.event_capacity);
    let mut env = MapEnv::new();
    let mut loops = JoinSet::new();
    let mut summary = Summary::default();

    for n in 0..sim.requests {
        let request = Request::new(n * 2 + 1);
        let wanted = &sim.types[n as usize % sim.types.len()];
        env.set(&request.key, ENGINE_TYPE_VAR, wanted.as_str())
            .set(&request.key, TASK_ID_NOTE, format!("{}-{}", &request.key[..8], request.stream))
            .set_multiplexed(&request.key, true);
        let engine_type = host::engine_type_for(&env, &request, ENGINE_TYPE_VAR, &sim.types[0]);

        let profile = profiles
            .get(&engine_type)
            .cloned()
            .unwrap_or_else(|| EngineProfile::new(engine_type.as_str(), sim.capacity));

        let mut request = request;
        loop {
            let result = if registry.engines(&engine_type).len() < sim.max_engines {
                registry.push_or_init(&engine_type, request, |setup| {
                    profile.apply(setup);
                    setup.start_in_flight();
                    Ok(())
                })
            } else {
                registry.push(&engine_type, request)
            };

            match result {
                Ok(Admitted::Queued { engine }) => {
                    debug!(%engine, "request queued");
                    summary.queued += 1;
                }
                Ok(Admitted::Created { engine, first }) => {
                    summary.engines_created += 1;
                    let loop_config = LoopConfig {
                        poll: Wait::from_timeout(config.pull_timeout),
                        max_idle_polls: profile.max_idle_polls,
                    };
                    let work = sim.work;
                    loops.spawn_blocking(move || {
                        let mut backend = |engine: &Engine<Request>,
                                           request: Request|
                         -> reqmux::Result<()> {
                            simulate_request(engine, &request, work);
                            Ok(())
                        };
                        let stats = run_engine(&engine, first, &mut backend, loop_config);
                        EngineRun {
                            id: engine.id(),
                            engine_type: engine.engine_type().to_string(),
                            stats,
                        }
                    });
                }
                Err(Rejected::NoCapacity(back)) => {
                    summary.backoffs += 1;
                    request = back;
                    tokio::time::sleep(sim.work).await;
                    continue;
                }
                Err(Rejected::InitFailed { item, error }) => {
                    warn!(stream = item.stream, "dropping request: {error}");
                    summary.init_failures += 1;
                }
            }
            break;
        }
        summary.pushed += 1;
    }

    info!(engines = registry.len(), "all requests pushed, shutting down");
    registry.shutdown();

    while let Some(run) = loops.join_next().await {
        summary.engines.push(run?);
    }
    summary.engines.sort_by_key(|run| run.id);
    summary.events = registry.last_event_seq();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn simulate_request(engine: &Engine<Request>, request: &Request, work: Duration) {
    debug!(
        engine = %engine.id(),
        stream = request.stream,
        window = engine.settings().req_window_bytes(),
        "processing request"
    );
    std::thread::sleep(work);
}

fn print_summary(summary: &Summary) {
    println!(
        "pushed {} (queued {}, engines created {}, backoffs {}, init failures {})",
        summary.pushed,
        summary.queued,
        summary.engines_created,
        summary.backoffs,
        summary.init_failures
    );
    println!();
    println!(
        "{:<12}  {:<12}  {:>9}  {:>6}  {:>10}",
        "ENGINE", "TYPE", "PROCESSED", "FAILED", "IDLE_POLLS"
    );
    println!("{}", "-".repeat(57));
    for run in &summary.engines {
        println!(
            "{:<12}  {:<12}  {:>9}  {:>6}  {:>10}",
            run.id.to_string(),
            run.engine_type,
            run.stats.processed,
            run.stats.failed,
            run.stats.idle_polls
        );
    }
    println!("\n{} lifecycle event(s)", summary.events);
}

fn cmd_profiles(profiles: &ProfileSet) -> anyhow::Result<()> {
    if profiles.is_empty() {
        println!("No engine profiles found.");
        return Ok(());
    }

    println!(
        "{:<16}  {:>8}  {:>11}  {:>15}  IDLE_POLLS",
        "TYPE", "CAPACITY", "WINDOW", "REQ_WINDOW"
    );
    println!("{}", "-".repeat(70));
    for profile in profiles.profiles() {
        let settings = profile.settings();
        println!(
            "{:<16}  {:>8}  {:>11}  {:>15}  {}",
            profile.engine_type,
            profile.capacity,
            settings.window_bytes(),
            settings.req_window_bytes(),
            profile
                .max_idle_polls
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    println!("\n{} profile(s)", profiles.len());
    Ok(())
}
