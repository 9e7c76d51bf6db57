use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use deep_research::config::Role;
use deep_research::events::{Event, EventBus, EventPayload, Filter};
use deep_research::gateway::ProviderRegistry;
use deep_research::model::{Phase, PlanItem, Session};
use deep_research::{Database, Orchestrator, OrchestratorConfig, SessionStore, Settings};

#[derive(Parser)]
#[command(name = "research")]
#[command(about = "Plan, research and synthesize reports with parallel agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: nearest .research.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session database path
    #[arg(long, env = "RESEARCH_DB", global = true)]
    db: Option<PathBuf>,

    /// Research units allowed in flight
    #[arg(long, global = true)]
    max_parallel: Option<usize>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a research session and draft its plan
    Run {
        /// The research question
        query: String,
        /// Report language (detected from the query when omitted)
        #[arg(long, short)]
        language: Option<String>,
        /// Confirm the drafted plan and keep going
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Confirm a drafted plan and run research and synthesis
    Confirm {
        /// Session id or unique prefix
        session: String,
        /// Plan item to skip (repeatable)
        #[arg(long = "skip")]
        skip: Vec<String>,
        /// JSON file with replacement or additional plan items
        #[arg(long)]
        modifications: Option<PathBuf>,
    },
    /// Send a drafted plan back to the planner with feedback
    Revise {
        session: String,
        feedback: String,
    },
    /// Continue an interrupted session from its last checkpoint
    Resume { session: String },
    /// Cancel a session
    Cancel { session: String },
    /// List recent sessions
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only sessions in this phase
        #[arg(long)]
        phase: Option<Phase>,
    },
    /// Show one session
    Show {
        session: String,
        /// Print the whole session as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show configured providers and role bindings
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from_path(path)?,
        None => Settings::load()?,
    };
    if let Some(db) = cli.db {
        settings.database_path = db;
    }
    if let Some(max) = cli.max_parallel {
        settings.max_parallel_agents = max;
    }
    settings.validate().context("Invalid configuration")?;
    let settings = Arc::new(settings);

    let registry = Arc::new(ProviderRegistry::from_settings(&settings));
    if let Commands::Providers = cli.command {
        print_providers(&settings, &registry);
        return Ok(());
    }

    let db = Database::open_at(&settings.database_path)
        .with_context(|| format!("Failed to open {}", settings.database_path.display()))?;
    let bus = EventBus::new();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::from_settings(&settings),
        registry.clone(),
        Arc::new(db.clone()),
        bus.clone(),
    );

    let outcome = run_command(cli.command, &orchestrator, &db, &bus).await;
    registry.close().await;
    outcome
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_command(command: Commands, orchestrator: &Orchestrator, db: &Database, bus: &EventBus) -> Result<()> {
    match command {
        Commands::Run { query, language, yes } => {
            let printer = EventPrinter::spawn(bus);
            let mut session = interruptible(orchestrator, orchestrator.start(&query, language.as_deref())).await;
            let review_id = match &session {
                Ok(drafted) if yes && drafted.phase == Phase::PlanReview => Some(drafted.id.clone()),
                _ => None,
            };
            if let Some(id) = review_id {
                session = interruptible(orchestrator, orchestrator.confirm(&id, &[], &[])).await;
            }
            printer.finish().await;
            report(&session?)
        }

        Commands::Confirm {
            session,
            skip,
            modifications,
        } => {
            let modifications = match modifications {
                Some(path) => load_modifications(&path)?,
                None => Vec::new(),
            };
            let printer = EventPrinter::spawn(bus);
            let outcome = interruptible(orchestrator, orchestrator.confirm(&session, &skip, &modifications)).await;
            printer.finish().await;
            report(&outcome?)
        }

        Commands::Revise { session, feedback } => {
            let printer = EventPrinter::spawn(bus);
            let outcome = interruptible(orchestrator, orchestrator.revise(&session, &feedback)).await;
            printer.finish().await;
            report(&outcome?)
        }

        Commands::Resume { session } => {
            let printer = EventPrinter::spawn(bus);
            let outcome = interruptible(orchestrator, orchestrator.resume(&session)).await;
            printer.finish().await;
            report(&outcome?)
        }

        Commands::Cancel { session } => {
            orchestrator.cancel(&session).await?;
            println!("Cancelled {}", session);
            Ok(())
        }

        Commands::List { limit, phase } => {
            let sessions = db.list_summaries(limit, phase).await?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for session in sessions {
                println!(
                    "{}  {:<12}  {}  {}",
                    short_id(&session.id),
                    session.phase.to_string(),
                    session.updated_at.format("%Y-%m-%d %H:%M"),
                    preview(&session.query, 60)
                );
            }
            Ok(())
        }

        Commands::Show { session, json } => {
            let session = orchestrator.get(&session).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                print_session(&session);
            }
            Ok(())
        }

        Commands::Providers => Ok(()),
    }
}

/// Await an operation, cancelling every active run on Ctrl-C
async fn interruptible<F>(orchestrator: &Orchestrator, operation: F) -> Result<Session>
where
    F: Future<Output = deep_research::Result<Session>>,
{
    tokio::pin!(operation);

    tokio::select! {
        outcome = &mut operation => return Ok(outcome?),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, cancelling...");
            for id in orchestrator.active_sessions() {
                if let Err(e) = orchestrator.cancel(&id).await {
                    tracing::warn!(session_id = %id, "Failed to cancel: {}", e);
                }
            }
        }
    }

    Ok(operation.await?)
}

fn load_modifications(path: &Path) -> Result<Vec<PlanItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid plan items in {}", path.display()))
}

fn report(session: &Session) -> Result<()> {
    match session.phase {
        Phase::PlanReview => {
            if let Some(plan) = &session.plan {
                print_plan(plan.items.as_slice());
            }
            println!();
            println!("Session {} is waiting for review.", session.id);
            println!("  research confirm {} [--skip <item-id>]", short_id(&session.id));
            println!("  research revise {} \"<feedback>\"", short_id(&session.id));
            Ok(())
        }
        Phase::Completed => {
            println!();
            println!("{}", session.final_report.as_deref().unwrap_or(""));
            Ok(())
        }
        Phase::Cancelled => {
            println!(
                "Session {} cancelled with {} result(s) kept.",
                session.id,
                session.results.len()
            );
            Ok(())
        }
        Phase::Failed => bail!(
            "Session {} failed: {}",
            session.id,
            session.error.as_deref().unwrap_or("unknown error")
        ),
        phase => {
            println!("Session {} is {}.", session.id, phase);
            Ok(())
        }
    }
}

fn print_session(session: &Session) {
    println!("Session:  {}", session.id);
    println!("Query:    {}", session.query);
    println!("Language: {}", session.language);
    println!("Phase:    {}", session.phase);
    println!("Created:  {}", session.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated:  {}", session.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(error) = &session.error {
        println!("Error:    {}", error);
    }
    if let Some(plan) = &session.plan {
        println!();
        println!("{}", plan.understanding);
        print_plan(plan.items.as_slice());
    }
    println!();
    println!("Results:  {}", session.results.len());
    if let Some(report) = &session.final_report {
        println!();
        println!("{}", report);
    }
}

fn print_plan(items: &[PlanItem]) {
    println!();
    println!("Plan:");
    for item in items {
        println!("  [{}] P{} {:<11} {}", item.id, item.priority, item.status.to_string(), item.topic);
        if !item.description.is_empty() {
            println!("        {}", preview(&item.description, 100));
        }
    }
}

fn print_providers(settings: &Settings, registry: &ProviderRegistry) {
    println!("Providers: {}", registry.providers().join(", "));
    println!();
    for role in Role::ALL {
        match registry.binding(role) {
            Some(binding) => println!(
                "  {:<12} {} ({}, logical model '{}')",
                role.to_string(),
                binding.model,
                binding.provider,
                settings.role(role).model
            ),
            None => println!("  {:<12} (unbound)", role.to_string()),
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > max {
        format!("{}...", line.chars().take(max).collect::<String>())
    } else {
        line.to_string()
    }
}

// ============================================================================
// Event printing
// ============================================================================

/// Prints bus events as they arrive until finished
struct EventPrinter {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl EventPrinter {
    fn spawn(bus: &EventBus) -> Self {
        let mut subscription = bus.stream(Filter::all());
        let stop = CancellationToken::new();
        let token = stop.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = subscription.recv() => match event {
                        Some(event) => print_event(&event),
                        None => return,
                    },
                    _ = token.cancelled() => break,
                }
            }
            while let Some(event) = subscription.try_recv() {
                print_event(&event);
            }
        });

        Self { stop, task }
    }

    /// Print what is still queued, then stop
    async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::debug!("Event printer ended abnormally: {}", e);
        }
    }
}

fn print_event(event: &Event) {
    match &event.payload {
        EventPayload::PhaseChange { new_phase, .. } => {
            println!("==> {} [{}]", new_phase, short_id(&event.session_id));
        }
        EventPayload::PlanDraft { plan } => {
            println!("    plan drafted with {} item(s)", plan.items.len());
        }
        EventPayload::PlanUpdated { plan } => {
            println!("    plan confirmed with {} item(s)", plan.items.len());
        }
        EventPayload::AgentStarted {
            plan_item_id, topic, ..
        } => {
            println!("    [{}] started: {}", plan_item_id, topic);
        }
        EventPayload::AgentProgress { progress } => {
            if !progress.current_action.is_empty() {
                println!(
                    "    [{}] {:>3.0}% {}",
                    progress.plan_item_id, progress.progress_percent, progress.current_action
                );
            }
        }
        EventPayload::AgentCompleted { result } => {
            println!(
                "    [{}] done: confidence {:.2}, {} source(s), {:.1}s",
                result.plan_item_id,
                result.confidence,
                result.sources.len(),
                result.execution_time.as_secs_f64()
            );
        }
        EventPayload::AgentFailed {
            plan_item_id,
            code,
            error,
            ..
        } => {
            println!("    [{}] failed ({}): {}", plan_item_id, code, error);
        }
        EventPayload::SynthesisStarted { total_results } => {
            println!("    synthesizing {} result(s)", total_results);
        }
        EventPayload::SynthesisProgress { .. } | EventPayload::ReportReady { .. } => {}
        EventPayload::CheckpointSaved {
            completed_items,
            pending_items,
            ..
        } => {
            tracing::debug!(completed_items, pending_items, "Checkpoint saved");
        }
        EventPayload::Error {
            error_code,
            error_message,
            ..
        } => {
            eprintln!("    error [{}]: {}", error_code, error_message);
        }
        EventPayload::SessionCancelled { reason } => {
            println!("    {}", reason);
        }
    }
}
