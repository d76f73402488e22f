//! Scripted stand-in for the stager process.
//!
//! The first process of a pod's container plays the stager: it reports
//! ready by connecting to `ready.sock` and exits cleanly on SIGTERM. Later
//! processes play the run helper: they read their configuration from the
//! Enter FIFO and then act out the script registered for the command.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use podlite_shared::constants::stager::{READY_SOCKET, RUN_CONFIG_ENV};
use podlite_shared::container::{ExitStatus, ProcessSpec};
use podlite_shared::schema::RunApp;

use crate::container::{Behavior, StartContext, StartHook};

/// What an entered command does once it has its configuration.
#[derive(Debug, Clone)]
pub enum CommandScript {
    /// Writes `stdout` and exits with `code`.
    Output { stdout: Vec<u8>, code: i32 },
    /// Runs until killed.
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterMode {
    Read,
    /// The helper never opens the FIFO.
    NeverRead,
}

/// A run helper invocation that read its configuration.
#[derive(Debug, Clone)]
pub struct Entered {
    pub container_id: String,
    pub app: String,
    pub run_app: RunApp,
    /// Everything written to the process's stdin.
    pub stdin: Vec<u8>,
}

struct Script {
    ready: AtomicBool,
    mode: Mutex<EnterMode>,
    commands: Mutex<HashMap<String, CommandScript>>,
    entered: Mutex<Vec<Entered>>,
}

#[derive(Clone)]
pub struct ScriptedStager {
    script: Arc<Script>,
}

impl Default for ScriptedStager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedStager {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script {
                ready: AtomicBool::new(true),
                mode: Mutex::new(EnterMode::Read),
                commands: Mutex::new(HashMap::new()),
                entered: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether stagers started from now on report ready.
    pub fn set_ready(&self, ready: bool) {
        self.script.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_enter_mode(&self, mode: EnterMode) {
        *self.script.mode.lock() = mode;
    }

    /// Scripts the command whose `exec[0]` is `exec`. Unscripted commands
    /// exit 0 without output.
    pub fn on_command(&self, exec: &str, script: CommandScript) {
        self.script.commands.lock().insert(exec.to_string(), script);
    }

    pub fn entered(&self) -> Vec<Entered> {
        self.script.entered.lock().clone()
    }

    pub fn hook(&self) -> StartHook {
        let script = Arc::clone(&self.script);
        Arc::new(move |ctx: StartContext, spec: ProcessSpec| {
            if ctx.first {
                if script.ready.load(Ordering::SeqCst) {
                    let socket = ctx.rootfs.join(READY_SOCKET.trim_start_matches('/'));
                    std::thread::spawn(move || {
                        if let Ok(stream) = UnixStream::connect(&socket) {
                            drop(stream);
                        }
                    });
                }
                return Behavior::exit_on_term(0);
            }

            let config = spec
                .env
                .iter()
                .find(|(name, _)| name == RUN_CONFIG_ENV)
                .map(|(_, value)| ctx.rootfs.join(value.trim_start_matches('/')));
            let Some(config) = config else {
                ctx.process.exit(ExitStatus::exited(0));
                return Behavior::default();
            };

            let mode = *script.mode.lock();
            let script = Arc::clone(&script);
            std::thread::spawn(move || match mode {
                EnterMode::Read => script.run_helper(ctx, spec, config),
                EnterMode::NeverRead => {
                    ctx.process.wait_blocking();
                    drop(spec);
                }
            });
            Behavior::default()
        })
    }
}

impl Script {
    fn run_helper(&self, ctx: StartContext, mut spec: ProcessSpec, config: PathBuf) {
        let run_app: Option<RunApp> = File::open(&config)
            .ok()
            .and_then(|file| serde_json::from_reader(file).ok());
        let Some(run_app) = run_app else {
            ctx.process.exit(ExitStatus::exited(1));
            return;
        };

        let mut stdin = Vec::new();
        if let Some(fd) = spec.stdin.take() {
            let _ = File::from(fd).read_to_end(&mut stdin);
        }

        let exec = run_app.exec.first().cloned().unwrap_or_default();
        self.entered.lock().push(Entered {
            container_id: ctx.container_id.clone(),
            app: spec.args.get(1).cloned().unwrap_or_default(),
            run_app,
            stdin,
        });

        let command = self.commands.lock().get(&exec).cloned();
        match command {
            Some(CommandScript::Output { stdout, code }) => {
                if let Some(fd) = spec.stdout.take() {
                    let _ = File::from(fd).write_all(&stdout);
                }
                drop(spec);
                ctx.process.exit(ExitStatus::exited(code));
            }
            Some(CommandScript::Hang) => {
                ctx.process.wait_blocking();
                drop(spec);
            }
            None => {
                drop(spec);
                ctx.process.exit(ExitStatus::exited(0));
            }
        }
    }
}
