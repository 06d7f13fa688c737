use std::error::Error;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use screening_client::{
    app_state::AppState,
    config::AppConfig,
    models::job::{BulkEvaluationJob, JobPhase, OrchestratorSnapshot},
    services::{
        api_client::SessionEvent, evaluation::EvaluationApi,
        orchestrator::BulkEvaluationOrchestrator, results::ResultsNavigator,
    },
};

#[derive(Parser)]
#[command(name = "screening-client", version, about = "Screening console API client")]
struct Cli {
    /// Override API_BASE_URL
    #[arg(long)]
    base_url: Option<String>,

    /// Override SESSION_FILE
    #[arg(long)]
    session_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "SCREENING_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Clear the stored session
    Logout,
    /// Run a bulk AI evaluation and wait for it to settle
    Evaluate {
        #[arg(long)]
        job_key: String,
        #[arg(long)]
        prompt_id: String,
        /// Candidate to evaluate (repeatable)
        #[arg(long = "candidate", required = true)]
        candidates: Vec<String>,
    },
    /// Print the current progress of a bulk evaluation
    Progress {
        #[arg(long)]
        job_key: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let overrides = [
        cli.base_url.map(|v| ("API_BASE_URL".to_string(), v)),
        cli.session_file.map(|v| ("SESSION_FILE".to_string(), v)),
    ];
    let config = AppConfig::from_env_with_overrides(overrides.into_iter().flatten())?;
    let state = AppState::new(config)?;

    match cli.command {
        Command::Login { email, password } => {
            state.api.sign_in(&email, &password).await?;
            println!("Signed in as {email}");
        }
        Command::Logout => {
            state.api.sign_out()?;
            println!("Signed out");
        }
        Command::Progress { job_key } => {
            let progress = state.evaluation.fetch_progress(&job_key).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Command::Evaluate {
            job_key,
            prompt_id,
            candidates,
        } => {
            let job = BulkEvaluationJob::new(job_key, prompt_id, &candidates);
            evaluate(&state, job).await?;
        }
    }

    Ok(())
}

async fn evaluate(state: &AppState, job: BulkEvaluationJob) -> Result<(), Box<dyn Error>> {
    let (navigator, mut done_rx) = ResultsNavigator::new(state.clone());

    let orchestrator = BulkEvaluationOrchestrator::new(
        Arc::clone(&state.evaluation),
        navigator,
        state.config.orchestrator(),
    );
    let mut snapshots = orchestrator.subscribe();
    let mut session_events = state.api.subscribe();

    orchestrator.submit(job).await?;

    loop {
        tokio::select! {
            done = &mut done_rx => {
                let results = done?;
                println!(
                    "Evaluation complete: {} completed, {} failed. Results: {}",
                    results.progress.completed, results.progress.failed, results.location
                );
                return Ok(());
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Err("orchestrator stopped unexpectedly".into());
                }
                let snapshot = snapshots.borrow_and_update().clone();
                render(&snapshot);
                match snapshot.phase {
                    JobPhase::TimedOut => {
                        return Err(snapshot
                            .last_error
                            .unwrap_or_else(|| "evaluation timed out".to_string())
                            .into());
                    }
                    JobPhase::Cancelled => return Err("evaluation cancelled".into()),
                    _ => {}
                }
            }
            event = session_events.recv() => match event {
                Ok(SessionEvent::Invalidated { reason }) => {
                    orchestrator.cancel();
                    return Err(format!(
                        "session expired ({reason}); run `screening-client login` again"
                    )
                    .into());
                }
                Ok(SessionEvent::Refreshed) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err("session event channel closed".into());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                orchestrator.cancel();
                println!("Evaluation cancelled; the server keeps processing the batch.");
                return Ok(());
            }
        }
    }
}

fn render(snapshot: &OrchestratorSnapshot) {
    let job_key = snapshot.job_key.as_deref().unwrap_or("-");
    match snapshot.progress {
        Some(progress) => println!(
            "[{}] {job_key}: {}/{} processed ({:.0}%), {} failed",
            snapshot.phase,
            progress.processed(),
            progress.total,
            snapshot.percent_complete(),
            progress.failed
        ),
        None => println!("[{}] {job_key}", snapshot.phase),
    }

    if snapshot.stalled {
        eprintln!(
            "warning: {} consecutive progress checks failed; the job may be stalled",
            snapshot.consecutive_failures
        );
    }
}
