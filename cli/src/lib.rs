use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use interp_session::InterpreterSession;
use interp_session::SessionConfig;
use interp_session::Status;
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Run script files through one long-lived interpreter session.
///
/// Every script must print `END_OF_SCRIPT` as its last line of output.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// TOML file with session settings; defaults are used when omitted.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Profile loaded by the interpreter before any script runs.
    #[arg(long, short = 'p')]
    pub profile: Option<PathBuf>,

    /// Give up on a script that has not finished after this long.
    #[arg(long, default_value_t = 60_000)]
    pub timeout_ms: u64,

    #[arg(long, default_value_t = 100)]
    pub poll_interval_ms: u64,

    #[arg(required = true)]
    pub scripts: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Finished(Status),
    TimedOut,
}

impl ScriptOutcome {
    pub fn succeeded(self) -> bool {
        self == ScriptOutcome::Finished(Status::Success)
    }
}

/// Runs every script and returns whether all of them succeeded.
pub async fn run_main(cli: Cli) -> anyhow::Result<bool> {
    // Honor `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(profile) = cli.profile.clone() {
        config.profile = Some(profile);
    }

    let session = InterpreterSession::create(config)
        .await
        .context("failed to start interpreter session")?;
    let caller_id = format!("cli-{}", std::process::id());
    if !session.try_lock(&caller_id) {
        anyhow::bail!("interpreter session is already locked");
    }

    run_locked(&session, &caller_id, &cli).await
}

/// Runs the scripts on a session already locked for `caller_id`, then
/// unlocks and closes it, also when a script could not be run.
pub async fn run_locked(
    session: &InterpreterSession,
    caller_id: &str,
    cli: &Cli,
) -> anyhow::Result<bool> {
    let result = run_scripts(session, caller_id, cli).await;

    if let Err(err) = session.unlock(caller_id) {
        warn!("failed to unlock interpreter session: {err}");
    }
    let closed = session.close().await;
    let all_succeeded = result?;
    closed?;
    Ok(all_succeeded)
}

async fn run_scripts(
    session: &InterpreterSession,
    caller_id: &str,
    cli: &Cli,
) -> anyhow::Result<bool> {
    let deadline = Duration::from_millis(cli.timeout_ms);
    let poll_interval = Duration::from_millis(cli.poll_interval_ms);
    let mut all_succeeded = true;
    for path in &cli.scripts {
        let script = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read script {}", path.display()))?;
        let outcome = run_script(session, caller_id, script, deadline, poll_interval).await;
        info!("{} finished: {outcome:?}", path.display());

        let output = session.output_lines(caller_id).await?;
        let errors = session.error_lines(caller_id).await?;
        print_lines(&output, &errors).await?;
        if !outcome.succeeded() {
            warn!("{} did not succeed: {outcome:?}", path.display());
            all_succeeded = false;
            if outcome == ScriptOutcome::TimedOut {
                break;
            }
        }
    }
    Ok(all_succeeded)
}

/// Submits `script` and polls until it settles or `deadline` passes.
pub async fn run_script(
    session: &InterpreterSession,
    caller_id: &str,
    script: String,
    deadline: Duration,
    poll_interval: Duration,
) -> ScriptOutcome {
    let status = session.submit(caller_id, script).await;
    if status.is_terminal() {
        return ScriptOutcome::Finished(status);
    }

    let give_up_at = Instant::now() + deadline;
    loop {
        let status = session.poll(caller_id).await;
        if status.is_terminal() {
            return ScriptOutcome::Finished(status);
        }
        if Instant::now() >= give_up_at {
            return ScriptOutcome::TimedOut;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn print_lines(output: &[String], errors: &[String]) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    for line in output {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;

    let mut stderr = tokio::io::stderr();
    for line in errors {
        stderr.write_all(line.as_bytes()).await?;
        stderr.write_all(b"\n").await?;
    }
    stderr.flush().await
}
