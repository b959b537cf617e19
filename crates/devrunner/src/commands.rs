use crate::cli::{Commands, StartArgs};
use crate::settings::Settings;
use anyhow::{Context, Result, bail};
use console::style;
use devrunner::browser::default_notifier;
use devrunner::{DevRunner, NoopNotifier, ProcessState, StartOutcome, create_supervisor};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(250);
const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const FAILURE_TAIL_LINES: usize = 20;

pub async fn dispatch(command: Commands, settings: &Settings, token: CancellationToken) -> Result<()> {
    match command {
        Commands::Start(args) | Commands::Run(args) => start(settings, args, token).await,
        Commands::Stop => stop(settings).await,
        Commands::Restart => restart(settings, token).await,
        Commands::Status => status(settings).await,
        Commands::Logs { lines } => logs(settings, lines).await,
        Commands::Clean => clean(settings).await,
        Commands::Build { time } => build(settings, time).await,
    }
}

fn supervisor(settings: &Settings, foreground: bool, token: CancellationToken) -> Result<DevRunner> {
    let config = if foreground {
        settings.attached()
    } else {
        settings.supervisor.clone()
    };
    Ok(create_supervisor(config, default_notifier(settings.open_browser))?
        .with_cancellation_token(token))
}

fn quiet_supervisor(settings: &Settings) -> Result<DevRunner> {
    Ok(create_supervisor(
        settings.supervisor.clone(),
        Arc::new(NoopNotifier),
    )?)
}

/// Last lines of the latest session, for errors raised without a captured tail
pub async fn failure_tail(settings: &Settings) -> Vec<String> {
    let supervisor = match quiet_supervisor(settings) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            debug!("Cannot read session logs: {}", e);
            return Vec::new();
        }
    };
    supervisor
        .logs(FAILURE_TAIL_LINES)
        .await
        .unwrap_or_else(|e| {
            debug!("Cannot read session logs: {}", e);
            Vec::new()
        })
}

async fn start(settings: &Settings, args: StartArgs, token: CancellationToken) -> Result<()> {
    let supervisor = supervisor(settings, args.foreground, token.clone())?;
    println!(
        "{} {} at {}",
        style("Starting").green().bold(),
        supervisor.config().name,
        supervisor.url()
    );

    let outcome = if args.force {
        supervisor.force_start().await?
    } else {
        supervisor.start().await?
    };
    print_started(&supervisor, &outcome).await;

    if args.foreground {
        run_foreground(&supervisor, settings, token).await
    } else {
        Ok(())
    }
}

async fn restart(settings: &Settings, token: CancellationToken) -> Result<()> {
    // A fresh invocation knows no pid, so restarting means clearing the port
    let supervisor = supervisor(settings, false, token)?;
    println!(
        "{} {} at {}",
        style("Restarting").green().bold(),
        supervisor.config().name,
        supervisor.url()
    );
    let outcome = supervisor.force_start().await?;
    print_started(&supervisor, &outcome).await;
    Ok(())
}

async fn print_started(supervisor: &DevRunner, outcome: &StartOutcome) {
    let handle = outcome.handle();
    let verb = if outcome.was_started() {
        "Running"
    } else {
        "Already running"
    };
    println!(
        "{} {} (pid {})",
        style(verb).green().bold(),
        supervisor.url(),
        handle.pid
    );
    if let Ok(path) = supervisor.log_path().await {
        println!("  {} {}", style("log:").dim(), path.display());
    }
}

/// Stream the session log until Ctrl-C or until the server exits, then stop
async fn run_foreground(supervisor: &DevRunner, settings: &Settings, token: CancellationToken) -> Result<()> {
    println!("{}", style("Press Ctrl-C to stop").dim());

    let mut follower = match supervisor.log_path().await {
        Ok(path) => Some(LogFollower::new(path)),
        Err(e) => {
            warn!("Not following output: {}", e);
            None
        }
    };
    let mut follow_tick = tokio::time::interval(FOLLOW_INTERVAL);
    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);

    let exited = loop {
        tokio::select! {
            _ = token.cancelled() => break false,
            _ = follow_tick.tick() => {
                if let Some(follower) = follower.as_mut() {
                    if let Err(e) = follower.pump().await {
                        debug!("Log follow failed: {}", e);
                    }
                }
            }
            _ = status_tick.tick() => {
                if supervisor.status().await.state == ProcessState::Stopped {
                    break true;
                }
            }
        }
    };

    if let Some(follower) = follower.as_mut() {
        let _ = follower.pump().await;
    }

    if exited {
        bail!("{} exited", supervisor.config().name);
    }

    println!("\n{}", style("Stopping...").yellow().bold());
    match tokio::time::timeout(settings.shutdown_timeout, supervisor.stop()).await {
        Ok(result) => {
            result?;
            println!("{}", style("Stopped").green().bold());
            Ok(())
        }
        Err(_) => bail!(
            "shutdown did not finish within {:?}",
            settings.shutdown_timeout
        ),
    }
}

async fn stop(settings: &Settings) -> Result<()> {
    let supervisor = quiet_supervisor(settings)?;
    let binding = supervisor.config().binding.clone();
    let report = supervisor.clear_port().await?;

    if report.swept.is_empty() {
        println!("Nothing is listening on {}", binding);
    } else {
        let pids = report
            .swept
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{} {} (killed pids: {})",
            style("Stopped").green().bold(),
            binding,
            pids
        );
    }
    Ok(())
}

async fn status(settings: &Settings) -> Result<()> {
    let supervisor = quiet_supervisor(settings)?;
    let report = supervisor.status().await;

    if report.port_open {
        println!("{} {}", style("Running").green().bold(), report.url);
        match supervisor.port_occupants().await {
            Ok(occupants) => {
                for occupant in occupants {
                    println!("  pid {}", occupant);
                    let command = occupant.command_line();
                    if !command.is_empty() {
                        println!("    {}", style(command).dim());
                    }
                }
            }
            Err(e) => debug!("Cannot list port occupants: {}", e),
        }
    } else {
        println!(
            "{} (nothing listening on {})",
            style("Not running").yellow().bold(),
            report.binding
        );
    }

    if let Ok(path) = supervisor.log_path().await {
        println!("  {} {}", style("log:").dim(), path.display());
    }
    Ok(())
}

async fn logs(settings: &Settings, lines: usize) -> Result<()> {
    let supervisor = quiet_supervisor(settings)?;
    let path = supervisor.log_path().await?;
    let tail = supervisor.logs(lines).await?;

    eprintln!("{}", style(format!("==> {} <==", path.display())).dim());
    let mut stdout = tokio::io::stdout();
    for line in tail {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;
    Ok(())
}

async fn clean(settings: &Settings) -> Result<()> {
    let mut removed = 0;
    for path in &settings.clean_paths {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            continue;
        }
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("failed to remove {}", path.display()))?;
        info!(path = %path.display(), "Removed build output");
        println!("{} {}", style("Removed").green(), path.display());
        removed += 1;
    }
    if removed == 0 {
        println!("Nothing to clean");
    }
    Ok(())
}

async fn build(settings: &Settings, time: bool) -> Result<()> {
    let Some((program, args)) = settings.build_command.split_first() else {
        bail!("build command is empty");
    };
    let config = &settings.supervisor;

    let mut cmd = Command::new(program);
    cmd.args(args).envs(&config.env);
    if let Some(dir) = &config.working_directory {
        cmd.current_dir(dir);
    }

    println!(
        "{} {}",
        style("Building:").green().bold(),
        settings.build_command.join(" ")
    );
    let started = Instant::now();
    let status = cmd
        .status()
        .await
        .with_context(|| format!("failed to run {}", program))?;
    let elapsed = started.elapsed().as_secs_f64();

    if status.success() {
        if time {
            println!("Build completed in {:.2} seconds", elapsed);
        }
        Ok(())
    } else {
        if time {
            println!("Build failed after {:.2} seconds", elapsed);
        }
        bail!("build failed with {}", status)
    }
}

/// Copies bytes appended to a log file onto stdout
struct LogFollower {
    path: PathBuf,
    offset: u64,
}

impl LogFollower {
    fn new(path: PathBuf) -> Self {
        Self { path, offset: 0 }
    }

    async fn pump(&mut self) -> std::io::Result<()> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        if len < self.offset {
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        (&mut file).take(len - self.offset).read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(&buf).await?;
        stdout.flush().await
    }
}
