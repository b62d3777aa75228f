use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use tokio_util::sync::CancellationToken;
use llamadispatch::{
    config::{apply_env_overrides, Config},
    dispatcher::runtime::DispatcherRuntime,
    goal_store::GoalSummary,
    logging,
    metrics::MonitorSummary,
    pool::{run_autoscaler, PoolDashboard},
    scenario::Scenario,
    CycleOutcome,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scenario for a fixed number of cycles and print each outcome
    Run(RunArgs),
    /// Run a scenario in the background until Ctrl-C
    Serve(ServeArgs),
    /// Print the effective configuration as TOML
    Config {
        /// Config file (defaults to the user config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Scenario file describing agents, goals, skills and plans
    #[arg(short, long)]
    scenario: PathBuf,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of dispatcher cycles
    #[arg(short = 'n', long, default_value_t = 100)]
    cycles: usize,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Args)]
struct ServeArgs {
    /// Scenario file describing agents, goals, skills and plans
    #[arg(short, long)]
    scenario: PathBuf,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Serve(args) => serve(args).await,
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            apply_env_overrides(&mut config);
            config.validate()?;
            Ok(config)
        }
        None => Ok(Config::load()?),
    }
}

fn setup(config: Option<&Path>, log_level: Option<String>) -> Result<Config> {
    let mut config = load_config(config)?;
    if let Some(level) = log_level {
        config.log_level = level;
    }
    logging::init(&config.log_level)?;
    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = setup(args.config.as_deref(), args.log_level)?;
    let scenario = Scenario::from_file(&args.scenario)
        .await
        .with_context(|| format!("Failed to load scenario {}", args.scenario.display()))?;
    let system = scenario.build(&config).await?;

    println!("\n{}", "LlamaDispatch".bright_green().bold());
    println!(
        "{} {}  {} {}  {} {:?}\n",
        "agents:".bright_white(),
        system.registry.len(),
        "goals:".bright_white(),
        scenario.goals.len(),
        "strategy:".bright_white(),
        config.dispatcher.strategy
    );

    let cancel = CancellationToken::new();
    let autoscaler = tokio::spawn(run_autoscaler(Arc::clone(&system.registry), cancel.child_token()));

    for cycle in 1..=args.cycles {
        let outcome = system.dispatcher.run_cycle_guarded().await;
        print_outcome(cycle, &outcome);

        let goals = system.dispatcher.goal_store().status_summary().await;
        if goals.pending == 0 && goals.active == 0 {
            println!("\n{}", "All goals settled".bright_green());
            break;
        }
        tokio::time::sleep(config.dispatcher.cycle_interval()).await;
    }

    cancel.cancel();
    let report = system
        .bus
        .shutdown(config.shutdown.grace_period(), config.shutdown.join_timeout())
        .await;
    let _ = autoscaler.await;

    print_goals(&system.dispatcher.goal_store().status_summary().await);
    print_dashboard(&system.dispatcher.pool_dashboard());
    print_summary(&system.monitor.status_summary().await);
    if !report.forced.is_empty() {
        println!("{} {}", "Forced shutdown:".yellow(), report.forced.join(", "));
    }
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = setup(args.config.as_deref(), args.log_level)?;
    let scenario = Scenario::from_file(&args.scenario).await?;
    let system = scenario.build(&config).await?;

    let runtime = DispatcherRuntime::start(
        Arc::clone(&system.dispatcher),
        system.bus.clone(),
        config.goals.clone(),
        config.shutdown.clone(),
    );
    println!("{}", "Dispatcher running, press Ctrl-C to stop".bright_cyan());
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    let report = runtime.shutdown().await;
    print_goals(&system.dispatcher.goal_store().status_summary().await);
    print_dashboard(&system.dispatcher.pool_dashboard());
    print_summary(&system.monitor.status_summary().await);
    if !report.aborted.is_empty() {
        println!("{} {}", "Aborted tasks:".yellow(), report.aborted.join(", "));
    }
    Ok(())
}

fn print_outcome(cycle: usize, outcome: &CycleOutcome) {
    let marker = if outcome.succeeded { "ok".green() } else { "!!".red() };
    let goal = outcome.goal_id.as_deref().unwrap_or("-");
    println!(
        "{:>4} {} {:<12} {:?}  {}",
        cycle,
        marker,
        goal.bright_white(),
        outcome.event,
        outcome.detail.dimmed()
    );
}

fn print_goals(goals: &GoalSummary) {
    println!("\n{}", "Goals".bright_yellow().bold());
    println!(
        "  completed {}  failed {}  cancelled {}  pending {}  active {}",
        goals.completed.to_string().green(),
        goals.failed.to_string().red(),
        goals.cancelled,
        goals.pending,
        goals.active
    );
}

fn print_dashboard(dashboard: &PoolDashboard) {
    println!("\n{}", "Agent pool".bright_yellow().bold());
    println!(
        "  {} agents across {} personas",
        dashboard.total_agents, dashboard.total_personas
    );
    for (persona, stats) in &dashboard.personas {
        println!(
            "  {:<14} agents {} (busy {})  success {:.2}  queue {} (avg {:.1})  bounds [{}, {}]",
            persona.bright_white(),
            stats.agent_count,
            stats.busy_agents,
            stats.average_success_rate,
            stats.current_queue_length,
            stats.average_queue_length,
            stats.scaling_config.min,
            stats.scaling_config.max
        );
    }
}

fn print_summary(summary: &MonitorSummary) {
    println!("\n{}", "Performance".bright_yellow().bold());
    println!(
        "  goals {}  goal success {:.0}%  delegation success {:.0}%  avg completion {:.2}s",
        summary.total_goals_processed,
        summary.goal_success_rate * 100.0,
        summary.delegation_success_rate * 100.0,
        summary.avg_goal_completion_secs
    );
    for agent in &summary.top_agents {
        println!(
            "  {:<14} tasks {}  success {:.2}  reliability {:.2}",
            agent.agent.bright_white(),
            agent.total_tasks,
            agent.success_rate(),
            agent.reliability_score()
        );
    }
}
