//! Entry point for the podlite stager.
//!
//! One binary, three roles picked by `argv[0]` or subcommand:
//! - `stager` (default): the pod supervisor
//! - `run <app>`: the Enter helper, installed as `/opt/stager/run`
//! - `init`: the init container's process, installed as `/init/init`

#[cfg(not(target_os = "linux"))]
compile_error!("the podlite stager is Linux-only; build with a Linux target");

mod config;
mod graph;
mod init;
mod layout;
mod run;
mod state;
mod supervisor;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use podlite_shared::constants::stager::RUN_CONFIG_ENV;
use podlite_shared::container::{set_child_subreaper, LibcontainerFactory};
use podlite_shared::PodliteResult;

use layout::Layout;
use supervisor::{Supervisor, SupervisorOptions, TeardownReason};

/// Podlite stager - supervises the apps of one pod
#[derive(Parser, Debug)]
#[command(author, version, about = "Podlite stager - in-pod supervisor")]
struct StagerArgs {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Start and supervise the pod described by /manifest
    Stager,
    /// Run a process in an app's container, configured through STAGER_RUN_CONFIG
    Run { app: String },
    /// Hold the pod's namespaces as PID 1
    Init,
}

/// Picks the role from the invoked name, falling back to the arguments.
fn command_from_args(args: Vec<String>) -> Command {
    let invoked = args
        .first()
        .and_then(|a| Path::new(a).file_name())
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match invoked {
        "run" if args.len() > 1 => Command::Run {
            app: args[1].clone(),
        },
        "init" => Command::Init,
        _ => StagerArgs::parse_from(args).command.unwrap_or(Command::Stager),
    }
}

fn init_tracing(default_level: &str) {
    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .try_init()
    {
        eprintln!("[ERROR] Failed to initialize tracing: {}", e);
    }
}

fn main() -> ExitCode {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("[PANIC] Stager panicked: {}", panic_info);
        std::process::exit(1);
    }));

    let command = command_from_args(std::env::args().collect());
    // The run helper shares stdio with the user's process, so it stays quiet.
    init_tracing(if command == Command::Stager { "info" } else { "error" });

    let runtime = match command {
        Command::Stager => tokio::runtime::Builder::new_multi_thread().enable_all().build(),
        _ => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build(),
    };
    let runtime = match runtime {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[ERROR] Failed to start the async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match command {
            Command::Stager => supervise().await,
            Command::Run { app } => run_app(&app).await,
            Command::Init => init::pause().await.map(|()| 0),
        }
    });
    match result {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            tracing::error!(error = %e, "Stager failed");
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn supervise() -> PodliteResult<i32> {
    set_child_subreaper()?;
    let layout = Layout::default();
    let factory = Arc::new(LibcontainerFactory::new(layout.containers())?);
    let opts = SupervisorOptions {
        cgroup_parent: own_cgroup(),
        env: std::env::vars().collect(),
        ..Default::default()
    };

    let supervisor = Supervisor::new(layout, factory, opts);
    match supervisor.run().await? {
        TeardownReason::Signal => Ok(0),
        TeardownReason::InitExited => {
            eprintln!("The stager init process has exited. Stager exiting.");
            Ok(1)
        }
    }
}

async fn run_app(app: &str) -> PodliteResult<i32> {
    let layout = Layout::default();
    let factory = LibcontainerFactory::new(layout.containers())?;
    let config = std::env::var(RUN_CONFIG_ENV).ok();
    run::run(app, config.as_deref(), &layout, &factory).await
}

/// The stager's own cgroup v2 path, under which the pod's cgroups nest.
fn own_cgroup() -> Option<String> {
    let cgroups = procfs::process::Process::myself().ok()?.cgroups().ok()?;
    cgroups
        .0
        .into_iter()
        .find(|c| c.hierarchy == 0)
        .map(|c| c.pathname)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn role_from_invoked_name() {
        assert_eq!(
            command_from_args(args(&["/opt/stager/run", "web"])),
            Command::Run { app: "web".into() }
        );
        assert_eq!(command_from_args(args(&["/init"])), Command::Init);
        assert_eq!(command_from_args(args(&["/stager"])), Command::Stager);
    }

    #[test]
    fn role_from_subcommand() {
        assert_eq!(
            command_from_args(args(&["podlite-stager", "run", "db"])),
            Command::Run { app: "db".into() }
        );
        assert_eq!(command_from_args(args(&["podlite-stager", "init"])), Command::Init);
    }
}
