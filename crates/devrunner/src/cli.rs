use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dev-runner")]
#[command(version, about = "Start, stop and watch a local development web server", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Clear the port and start the server in the background (default)
    dev-runner

    # Start only if the port is free
    dev-runner start

    # Run attached and stop on Ctrl-C
    dev-runner run --foreground

    # Inspect
    dev-runner status
    dev-runner logs 100

    # Housekeeping
    dev-runner stop
    dev-runner clean
    dev-runner build --time
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Args, Debug, Default, Clone)]
pub struct GlobalArgs {
    /// Configuration file (defaults to ./dev-runner.json when present)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Port the server listens on
    #[arg(short, long, value_name = "PORT", global = true)]
    pub port: Option<u16>,

    /// Host the server listens on
    #[arg(long, value_name = "HOST", global = true)]
    pub host: Option<String>,

    /// Directory for session log files
    #[arg(long, value_name = "DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    /// Grace period before force-killing (2, 2s, 500ms)
    #[arg(long, value_name = "DURATION", global = true)]
    pub grace_period: Option<String>,

    /// Do not open or refresh a browser tab
    #[arg(long, global = true)]
    pub no_browser: bool,

    /// Show debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Diagnostic log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StartArgs {
    /// Kill whatever holds the port before starting
    #[arg(short, long)]
    pub force: bool,

    /// Stay attached, stream the log and stop on Ctrl-C
    #[arg(long)]
    pub foreground: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the server
    Start(StartArgs),

    /// Same as start
    Run(StartArgs),

    /// Stop the server and free its port
    Stop,

    /// Stop, then start again
    Restart,

    /// Show whether the server is running
    Status,

    /// Print the last lines of the latest session log
    Logs {
        /// Number of lines
        #[arg(default_value_t = 50)]
        lines: usize,
    },

    /// Remove build output directories
    Clean,

    /// Build the project
    Build {
        /// Report how long the build took
        #[arg(long)]
        time: bool,
    },
}

impl Cli {
    /// Bare `dev-runner` clears the port and starts in the background
    pub fn subcommand(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Start(StartArgs {
            force: true,
            foreground: false,
        }))
    }
}
