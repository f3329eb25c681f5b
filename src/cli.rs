//! Command-line front-end.
//!
//! One verb, `grpc`, runs the lease server. Daemon mode re-launches the
//! server as a detached child process and exits, optionally leaving the
//! child's process ID in a PID file. Startup problems print one
//! diagnostic line to stderr and exit with status 1.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{ExitCode, Stdio};

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::{server, Error, Result};

/// Top-level arguments of the `easyflake` binary.
#[derive(Debug, Parser)]
#[command(
    name = "easyflake",
    version,
    about = "Snowflake-style ID generation toolkit"
)]
pub struct Cli {
    /// Log debug-level detail.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Disable coloured output.
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gRPC server handing out node-ID leases.
    Grpc(GrpcArgs),
}

/// Options of the `grpc` verb.
///
/// `-h` selects the host here; help stays reachable through `--help`.
#[derive(Debug, Args)]
#[command(disable_help_flag = true)]
pub struct GrpcArgs {
    /// Address to listen on.
    #[arg(short = 'h', long, default_value = "[::]")]
    pub host: String,

    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = 50051)]
    pub port: u16,

    /// Detach from the terminal and serve in the background.
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Write the server's process ID to this file; requires --daemon.
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Print help.
    #[arg(long, action = ArgAction::HelpLong, help = "Print help")]
    help: Option<bool>,
}

/// Parse the process arguments and run to completion.
///
/// This is the whole of `main`: returns exit status 0 on a clean
/// shutdown, 1 after a startup failure.
#[must_use]
pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let no_color = cli.no_color;
    init_logging(cli.debug, no_color);

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            fatal(&err.to_string(), no_color);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Grpc(args) => grpc(&args),
    }
}

fn grpc(args: &GrpcArgs) -> Result<()> {
    validate_grpc_args(args)?;

    let addr = listen_addr(&args.host, args.port)?;
    // Surface an occupied port before detaching anything.
    drop(TcpListener::bind(addr)?);

    if args.daemon {
        return spawn_daemon(args);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(server::serve(addr, shutdown_signal()))
}

/// The PID file is meaningless without a daemon to point at.
fn validate_grpc_args(args: &GrpcArgs) -> Result<()> {
    if args.pid_file.is_some() && !args.daemon {
        return Err(Error::InvalidConfig(
            "if the --pid-file option is set, the -d or --daemon option must also be set \
             to daemonize the server"
                .into(),
        ));
    }
    Ok(())
}

fn listen_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::InvalidConfig(format!("cannot resolve listen address {host:?}")))
}

/// Re-launch the server as a detached child and return immediately.
fn spawn_daemon(args: &GrpcArgs) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("grpc")
        .arg("--host")
        .arg(&args.host)
        .arg("--port")
        .arg(args.port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so terminal signals stay with the parent.
        command.process_group(0);
    }

    let child = command.spawn()?;
    if let Some(path) = &args.pid_file {
        std::fs::write(path, format!("{}\n", child.id()))?;
    }
    tracing::info!("lease server detached with pid {}", child.id());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    tracing::error!("failed to install SIGTERM handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            () = terminate => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn init_logging(debug: bool, no_color: bool) {
    let default_filter = if debug { "easyflake=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!no_color)
        .with_writer(std::io::stderr)
        .try_init();
}

/// One line to stderr, red unless colours are off.
fn fatal(message: &str, no_color: bool) {
    if no_color {
        eprintln!("[ERROR] {message}");
    } else {
        eprintln!("\x1b[31m[ERROR] {message}\x1b[0m");
    }
}
