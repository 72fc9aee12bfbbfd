//! device-farm CLI - run a command against a reserved farm device.
//!
//! This is the main binary entry point. See the `device_farm` library
//! for the core functionality.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use device_farm::{
    Config, ConsoleStatus, JobResult, Launcher, ReservationClient, ReservationRequest, Session,
    SharedStatus, SystemLauncher,
};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Exit code when the farm could not provide a device and the job never ran.
const EXIT_NOT_COMPLETED: u8 = 2;

// CLI
#[derive(Parser)]
#[command(name = "device-farm")]
#[command(version)]
#[command(about = "Reserve a shared Android device from a device farm")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reserve a device, run a command against it, then release it
    Run {
        #[command(flatten)]
        farm: FarmArgs,
        /// Command to run; ANDROID_IP, ANDROID_PORT and ANDROID_SERIAL are set
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Reserve a device, print it, and release it
    Reserve {
        #[command(flatten)]
        farm: FarmArgs,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

/// Flags that override the config file and environment.
#[derive(Args, Debug)]
struct FarmArgs {
    /// Coordinator URL
    #[arg(long)]
    api_url: Option<String>,
    /// Device tag to request
    #[arg(long)]
    tag: Option<String>,
    /// Job id reported to the coordinator (random if omitted)
    #[arg(long)]
    job_id: Option<String>,
    /// Android SDK root
    #[arg(long)]
    sdk_root: Option<PathBuf>,
    /// Directory for logcat.txt and screencap.png
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
    /// Seconds to wait for a device
    #[arg(long)]
    reservation_timeout: Option<u64>,
    /// Skip the teardown screenshot
    #[arg(long)]
    no_screencap: bool,
}

impl FarmArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(api_url) = &self.api_url {
            config.api_url.clone_from(api_url);
        }
        if let Some(tag) = &self.tag {
            config.tag.clone_from(tag);
        }
        if let Some(root) = &self.sdk_root {
            config.sdk_root = Some(root.clone());
        }
        if let Some(dir) = &self.artifacts_dir {
            config.artifacts_dir.clone_from(dir);
        }
        if let Some(secs) = self.reservation_timeout {
            config.reservation_timeout = secs;
        }
        if self.no_screencap {
            config.capture_screen = false;
        }
    }

    fn resolve(&self) -> Result<(Config, ReservationRequest)> {
        let mut config = Config::load()?;
        self.apply(&mut config);
        if config.tag.is_empty() {
            anyhow::bail!("No device tag configured (use --tag or DEVICE_FARM_TAG)");
        }
        let job_id = self
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let request = ReservationRequest::new(config.tag.clone(), job_id);
        Ok((config, request))
    }
}

fn exit_code(result: JobResult) -> ExitCode {
    match result {
        JobResult::Success => ExitCode::SUCCESS,
        JobResult::Failure => ExitCode::FAILURE,
        JobResult::NotCompleted => ExitCode::from(EXIT_NOT_COMPLETED),
    }
}

/// Log to stderr, or to `DEVICE_FARM_LOG_FILE` when set.
fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("DEVICE_FARM_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Warning: cannot open log file {path}: {e}"),
        }
    }
    builder.init();
}

/// Cancel `token` on Ctrl-C / SIGTERM.
fn install_signal_handler(token: &CancellationToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        log::info!("Interrupt received, cancelling");
        token.cancel();
    })
    .context("Failed to install signal handler")
}

async fn run(farm: &FarmArgs, command: &[String], cancel: &CancellationToken) -> Result<ExitCode> {
    let (config, request) = farm.resolve()?;
    let status: SharedStatus = Arc::new(ConsoleStatus::stdout());
    let launcher: Arc<dyn Launcher> = Arc::new(SystemLauncher);

    let session =
        match Session::open(&config, &request, launcher, Arc::clone(&status), cancel).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                status.status("Cancelled while waiting for a device");
                return Ok(exit_code(JobResult::NotCompleted));
            }
            Err(e) => return Ok(exit_code(JobResult::from_error(&e))),
        };

    let (program, args) = command.split_first().context("No command given")?;
    log::info!("[Run] Running {} on {}", program, session.device().serial());
    let outcome = tokio::process::Command::new(program)
        .args(args)
        .envs(session.env())
        .status()
        .await;

    let report = session.close().await;
    for error in &report.errors {
        log::warn!("[Run] Teardown: {}", error);
    }

    let exit = outcome.with_context(|| format!("Failed to run {program}"))?;
    let code = exit.code().unwrap_or(1);
    log::info!(
        "[Run] {} exited with {} ({:?})",
        program,
        code,
        JobResult::from_exit_code(code)
    );
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

async fn reserve(farm: &FarmArgs, cancel: &CancellationToken) -> Result<ExitCode> {
    use device_farm::status::messages;

    let (config, request) = farm.resolve()?;
    let status: SharedStatus = Arc::new(ConsoleStatus::stdout());

    let mut client = match ReservationClient::connect(
        &config.api_url,
        &request,
        config.connect_timeout(),
        Arc::clone(&status),
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            status.status(&messages::failure(&e));
            return Ok(exit_code(JobResult::from_error(&e)));
        }
    };

    let result = client
        .await_reservation(config.reservation_timeout(), config.poll_interval(), cancel)
        .await;
    client.release().await;

    match result {
        Ok(Some(device)) => {
            let address = device.address();
            let summary = serde_json::json!({
                "ip": address.ip_literal(),
                "port": address.port(),
                "serial": address.serial(),
                "tag": device.tag(),
                "url": device.url(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        Ok(None) => Ok(exit_code(JobResult::NotCompleted)),
        Err(e) => {
            status.status(&messages::failure(&e));
            Ok(exit_code(JobResult::from_error(&e)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Run { farm, command } => {
            install_signal_handler(&cancel)?;
            run(&farm, &command, &cancel).await
        }
        Commands::Reserve { farm } => {
            install_signal_handler(&cancel)?;
            reserve(&farm, &cancel).await
        }
        Commands::Config { save } => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save()?;
                log::info!("[Config] Saved to {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
