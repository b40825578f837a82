//! Rune Launch - declarative service-dependency launcher
//!
//! This is the main CLI entry point for Rune Launch.

use clap::{Args, Parser, Subcommand};
use rune_launch::error::{LaunchError, Result, EXIT_OK};
use rune_launch::launcher::{LaunchReport, Launcher, LauncherConfig, ProbePolicy};
use rune_launch::plan::{DeploymentPlan, ImageSource};
use rune_launch::runtime::{ContainerRuntime, DockerRuntime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Rune Launch - bring compose services up in dependency order
#[derive(Parser)]
#[command(name = "rune-launch")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Launch compose services in dependency order", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ProjectArgs {
    /// Compose file, repeat to merge (later files win)
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,
    /// Project name
    #[arg(short = 'p', long = "project-name", env = "RUNE_LAUNCH_PROJECT")]
    project: Option<String>,
}

#[derive(Args)]
struct EngineArgs {
    /// Container engine CLI
    #[arg(long, default_value = "docker")]
    docker: String,
    /// Upper bound for other engine commands, in seconds
    #[arg(long, value_name = "SECS")]
    command_timeout: Option<u64>,
}

impl EngineArgs {
    fn runtime(&self, project: &str) -> DockerRuntime {
        let runtime = DockerRuntime::new(project).binary(&self.docker);
        match self.command_timeout {
            Some(secs) => runtime.command_timeout(Duration::from_secs(secs)),
            None => runtime,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build, start and wait for every service
    Up {
        #[command(flatten)]
        project: ProjectArgs,
        /// Services launched at once
        #[arg(short = 'j', long, env = "RUNE_LAUNCH_CONCURRENCY")]
        concurrency: Option<usize>,
        /// Readiness probes per service
        #[arg(long)]
        probe_attempts: Option<u32>,
        /// Delay before the second probe, in milliseconds
        #[arg(long, value_name = "MS")]
        probe_base_delay: Option<u64>,
        /// Total readiness budget per service, in seconds
        #[arg(long, value_name = "SECS")]
        probe_timeout: Option<u64>,
        /// Stop started services when a launch fails
        #[arg(long)]
        teardown_on_failure: bool,
        /// Stop started services when interrupted
        #[arg(long)]
        teardown_on_abort: bool,
        /// Upper bound for one image build or pull, in seconds
        #[arg(long, value_name = "SECS")]
        build_timeout: Option<u64>,
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Stop and remove the project's containers
    Down {
        #[command(flatten)]
        project: ProjectArgs,
        /// Remove named volumes
        #[arg(short, long)]
        volumes: bool,
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Validate the descriptor and print the launch plan
    Config {
        #[command(flatten)]
        project: ProjectArgs,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(command: Commands) -> Result<i32> {
    let working_dir = std::env::current_dir()?;

    match command {
        Commands::Up {
            project,
            concurrency,
            probe_attempts,
            probe_base_delay,
            probe_timeout,
            teardown_on_failure,
            teardown_on_abort,
            build_timeout,
            engine,
        } => {
            let plan = load_plan(&project, &working_dir)?;

            let mut probe = ProbePolicy::default();
            if let Some(attempts) = probe_attempts {
                probe.max_attempts = attempts.max(1);
            }
            if let Some(ms) = probe_base_delay {
                probe.base_delay = Duration::from_millis(ms);
            }
            if let Some(secs) = probe_timeout {
                probe.timeout = Duration::from_secs(secs);
            }
            let mut config = LauncherConfig {
                probe,
                ..LauncherConfig::default()
            };
            if let Some(n) = concurrency {
                config.concurrency = n.max(1);
            }

            let mut runtime = engine.runtime(&plan.project);
            if let Some(secs) = build_timeout {
                runtime = runtime.build_timeout(Duration::from_secs(secs));
            }
            let runtime = Arc::new(runtime);
            let version = runtime.ping().await.map_err(|e| {
                LaunchError::Runtime(format!("{} is not usable: {}", engine.docker, e))
            })?;
            tracing::debug!("Container engine version {}", version);

            let launcher = Launcher::new(plan, runtime.clone(), config);

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping launch");
                    interrupt.cancel();
                }
            });

            let report = launcher.run(cancel).await?;
            print_report(&report);

            let teardown = if report.cancelled {
                teardown_on_abort
            } else {
                !report.failures.is_empty() && teardown_on_failure
            };
            if teardown {
                if let Err(e) = launcher.teardown(false).await {
                    tracing::warn!("Teardown incomplete: {}", e);
                }
                if let Err(e) = runtime.remove_network().await {
                    tracing::warn!("Failed to remove network: {}", e);
                }
            }

            report.into_result()?;
            Ok(EXIT_OK)
        }

        Commands::Down {
            project,
            volumes,
            engine,
        } => {
            let plan = load_plan(&project, &working_dir)?;
            down(&plan, &engine.runtime(&plan.project), volumes).await?;
            println!("Stopped project {}", plan.project);
            Ok(EXIT_OK)
        }

        Commands::Config { project, json } => {
            let plan = load_plan(&project, &working_dir)?;
            if json {
                let view = serde_json::json!({
                    "project": plan.project,
                    "working_dir": plan.working_dir,
                    "launch_order": plan.graph.levels(),
                    "services": plan.services,
                    "volumes": plan.volumes,
                });
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_plan(&plan);
            }
            Ok(EXIT_OK)
        }
    }
}

fn load_plan(args: &ProjectArgs, working_dir: &Path) -> Result<DeploymentPlan> {
    DeploymentPlan::load(&args.files, args.project.as_deref(), working_dir)
}

/// Remove the project's containers in reverse dependency order, then its
/// volumes and network
async fn down(plan: &DeploymentPlan, docker: &DockerRuntime, remove_volumes: bool) -> Result<()> {
    let mut errors = Vec::new();

    for name in plan.graph.topological_order().iter().rev() {
        let instance = docker.instance_handle(name);
        tracing::info!("Stopping {}", instance);
        if let Err(e) = docker.stop(&instance).await {
            tracing::warn!("Failed to stop {}: {}", instance, e);
            errors.push(format!("{}: {}", name, e.message()));
        }
    }

    if remove_volumes {
        for volume in plan.volumes.values().filter(|v| !v.external) {
            let handle = docker.volume_handle(volume);
            tracing::info!("Removing volume {}", handle.name);
            if let Err(e) = docker.remove_volume(&handle).await {
                tracing::warn!("Failed to remove volume {}: {}", handle.name, e);
                errors.push(format!("volume {}: {}", volume.name, e.message()));
            }
        }
    }

    if let Err(e) = docker.remove_network().await {
        tracing::warn!("Failed to remove network {}: {}", docker.network_name(), e);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(LaunchError::Runtime(errors.join("; ")))
    }
}

fn print_report(report: &LaunchReport) {
    println!("{:<24} {:<10} DETAIL", "SERVICE", "STATE");
    for record in &report.services {
        let detail = match (&record.cause, &record.instance) {
            (Some(cause), _) => cause.to_string(),
            (None, Some(instance)) => instance.id.clone(),
            (None, None) => String::new(),
        };
        println!("{:<24} {:<10} {}", record.name, record.state, detail);
    }
    if !report.skipped.is_empty() {
        println!("Not launched: {}", report.skipped.join(", "));
    }
}

fn print_plan(plan: &DeploymentPlan) {
    println!("Project: {}", plan.project);
    for (level, services) in plan.graph.levels().iter().enumerate() {
        println!("Level {}:", level);
        for name in services {
            let Some(service) = plan.service(name) else {
                continue;
            };
            let source = match &service.source {
                ImageSource::Build(build) => format!("build {}", build.context),
                ImageSource::Image(image) => image.to_string(),
            };
            println!("  {:<22} {:<40} ready on {}", name, source, service.readiness);
        }
    }
    for volume in plan.volumes.values() {
        let users = plan.services_using(&volume.name);
        println!("Volume {} used by {}", volume.name, users.join(", "));
    }
}
