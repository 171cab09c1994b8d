// ABOUTME: Command execution inside sandboxes: foreground with timeout, background handles, process control
// ABOUTME: Foreground commands under a timeout record their pid so the process tree can be killed on expiry

use crate::constants::SCRATCH_DIR;
use crate::engine::{ExecSpec, StreamKind};
use crate::error::{Result, SandboxError};
use crate::lifecycle::SandboxManager;
use crate::sandbox::Sandbox;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runs the command as a child, recording the wrapper pid in `$0` for the killer
const TRACKED_SCRIPT: &str = r#"echo $$ > "$0"; "$@"; status=$?; rm -f "$0"; exit $status"#;

/// Replaces itself with the command so the recorded pid is the command's own
const BACKGROUND_SCRIPT: &str = r#"echo $$ > "$0"; log="$1"; shift; exec "$@" > "$log" 2>&1"#;

/// Kills the recorded process tree, then exits 0 once the process is gone.
/// Exits `NO_PIDFILE` while the wrapper has not recorded a pid.
const TERMINATE_SCRIPT: &str = r#"pid=$(cat "$0" 2>/dev/null) || exit 3
[ -n "$pid" ] || exit 3
kill_tree() {
  for c in $(cat /proc/$1/task/*/children 2>/dev/null); do kill_tree "$c"; done
  kill -KILL "$1" 2>/dev/null
}
kill_tree "$pid"
rm -f "$0"
for i in 1 2 3 4 5; do
  state=$(sed 's/.*) //' /proc/$pid/stat 2>/dev/null | cut -c1)
  { [ -z "$state" ] || [ "$state" = Z ]; } && exit 0
  sleep 0.2
done
exit 1"#;

const NO_PIDFILE: i64 = 3;

/// Rounds of looking for the pid of a timed out command before giving up on it
const TERMINATE_ATTEMPTS: u32 = 5;

/// Inspections of a finished exec before its missing exit code is an error
const SETTLE_ATTEMPTS: u32 = 10;
const SETTLE_MAX_DELAY: Duration = Duration::from_millis(500);

const ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Identity a command runs as; never validated against the image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecUser {
    #[default]
    Default,
    Root,
    Named(String),
}

impl ExecUser {
    fn engine_user(&self) -> Option<String> {
        match self {
            ExecUser::Default => None,
            ExecUser::Root => Some("root".to_string()),
            ExecUser::Named(name) => Some(name.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecTimeout {
    /// Use the configured default
    #[default]
    Default,
    After(Duration),
    Never,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub user: ExecUser,
    /// Run through `/bin/sh -c` instead of as a literal argv
    pub shell: bool,
    pub timeout: ExecTimeout,
}

impl RunOptions {
    pub fn as_root() -> Self {
        Self {
            user: ExecUser::Root,
            ..Default::default()
        }
    }

    /// Root with no timeout wrapper, for short control commands whose argv must reach the engine as is
    pub(crate) fn control() -> Self {
        Self {
            timeout: ExecTimeout::Never,
            ..Self::as_root()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Exited { code: i64 },
    Killed { signal: i64 },
}

impl ProcessStatus {
    fn from_exit_code(code: i64) -> Self {
        // Shells report death by signal N as 128 + N
        if code > 128 && code <= 128 + 64 {
            ProcessStatus::Killed { signal: code - 128 }
        } else {
            ProcessStatus::Exited { code }
        }
    }
}

/// Passive reference to a detached command; refresh it with `poll`
#[derive(Debug, Clone, Serialize)]
pub struct ProcessHandle {
    /// Engine exec id
    pub process_id: String,
    /// Pid inside the sandbox, when it could be read back
    pub pid: Option<u32>,
    pub sandbox_id: String,
    pub started_at: DateTime<Utc>,
    pub command: String,
    /// Combined stdout/stderr of the process, inside the sandbox
    pub log_path: String,
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub user: String,
    pub state: String,
    pub command: String,
}

pub struct CommandExecutor {
    manager: Arc<SandboxManager>,
}

impl CommandExecutor {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    /// Run a command and wait for it; a non-zero exit is returned, not raised
    pub async fn run(&self, token: &str, command: &str, options: RunOptions) -> Result<ExecOutput> {
        let argv = build_argv(command, options.shell)?;
        let sandbox = self.manager.resolve(token).await?;
        self.run_in(&sandbox, argv, &options).await
    }

    /// Run a pre-split argv; `options.shell` is ignored
    pub async fn run_argv(
        &self,
        token: &str,
        argv: Vec<String>,
        options: RunOptions,
    ) -> Result<ExecOutput> {
        if argv.is_empty() {
            return Err(SandboxError::InvalidRequest("empty command".to_string()));
        }
        let sandbox = self.manager.resolve(token).await?;
        self.run_in(&sandbox, argv, &options).await
    }

    pub(crate) async fn run_in(
        &self,
        sandbox: &Sandbox,
        argv: Vec<String>,
        options: &RunOptions,
    ) -> Result<ExecOutput> {
        let limit = match options.timeout {
            ExecTimeout::Default => self.manager.settings().exec_timeout,
            ExecTimeout::After(limit) => Some(limit),
            ExecTimeout::Never => None,
        };
        let command = shell_words::join(&argv);

        let pidfile = limit.map(|_| scratch_path("exec", "pid"));
        let argv = match &pidfile {
            Some(pidfile) => wrap(TRACKED_SCRIPT, &[pidfile.as_str()], argv),
            None => argv,
        };
        let spec = ExecSpec {
            argv,
            env: options.env.clone(),
            working_dir: options.cwd.clone(),
            user: options.user.engine_user(),
        };

        debug!("Running in {}: {}", sandbox.name, command);
        let engine = self.manager.engine();
        let mut session = engine
            .exec(&sandbox.id, &spec)
            .await
            .map_err(|e| e.gone_as(&sandbox.name))?;

        let mut output = ExecOutput::default();
        let collect = async {
            while let Some(chunk) = session.output.next().await {
                let chunk = chunk?;
                match chunk.stream {
                    StreamKind::Stdout => output.stdout.extend_from_slice(&chunk.data),
                    StreamKind::Stderr => output.stderr.extend_from_slice(&chunk.data),
                }
            }
            Ok::<(), SandboxError>(())
        };

        match (limit, pidfile) {
            (Some(limit), Some(pidfile)) => match tokio::time::timeout(limit, collect).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        "Command in {} exceeded {:?}, terminating: {}",
                        sandbox.name, limit, command
                    );
                    self.terminate(sandbox, &session.exec_id, &pidfile).await;
                    return Err(SandboxError::Timeout {
                        command,
                        timeout: limit,
                        output: Box::new(output),
                    });
                }
            },
            _ => collect.await?,
        }

        output.exit_code = self.wait_exit_code(&session.exec_id).await?;
        debug!("Command in {} exited with {}", sandbox.name, output.exit_code);
        Ok(output)
    }

    /// The exec record can lag the end of its output stream by a moment
    async fn wait_exit_code(&self, exec_id: &str) -> Result<i64> {
        let engine = self.manager.engine();
        let mut delay = Duration::from_millis(20);
        for _ in 0..SETTLE_ATTEMPTS {
            let state = engine.inspect_exec(exec_id).await?;
            if !state.running {
                if let Some(code) = state.exit_code {
                    return Ok(code);
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(SETTLE_MAX_DELAY);
        }
        Err(SandboxError::engine_call(
            engine.kind().to_string(),
            "inspect exec",
            None,
            format!("exec {} finished its output but never reported an exit code", exec_id),
        ))
    }

    /// Kill the process tree of a timed out command.
    ///
    /// The pidfile is missing both before the wrapper has written it and after the command
    /// exits, so a missing pidfile is retried while the exec is still running.
    async fn terminate(&self, sandbox: &Sandbox, exec_id: &str, pidfile: &str) {
        for attempt in 1..=TERMINATE_ATTEMPTS {
            match self.run_terminate(sandbox, pidfile).await {
                Ok(0) => {
                    debug!("Timed out process in {} terminated", sandbox.name);
                    return;
                }
                Ok(NO_PIDFILE) => match self.manager.engine().inspect_exec(exec_id).await {
                    Ok(state) if !state.running => {
                        debug!("Timed out process in {} exited on its own", sandbox.name);
                        return;
                    }
                    Ok(_) => debug!(
                        "No pid recorded yet for timed out process in {} (attempt {})",
                        sandbox.name, attempt
                    ),
                    Err(e) => {
                        warn!("Could not inspect timed out process in {}: {}", sandbox.name, e);
                        return;
                    }
                },
                Ok(code) => {
                    warn!(
                        "Timed out process in {} may still be running (terminate exited {})",
                        sandbox.name, code
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "Could not terminate timed out process in {}: {}",
                        sandbox.name, e
                    );
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
        }
        warn!(
            "Timed out process in {} never recorded its pid and may still be running",
            sandbox.name
        );
    }

    async fn run_terminate(&self, sandbox: &Sandbox, pidfile: &str) -> Result<i64> {
        let spec = ExecSpec {
            argv: wrap(TERMINATE_SCRIPT, &[pidfile], Vec::new()),
            user: ExecUser::Root.engine_user(),
            ..Default::default()
        };
        let mut session = self.manager.engine().exec(&sandbox.id, &spec).await?;
        while session.output.next().await.is_some() {}
        self.wait_exit_code(&session.exec_id).await
    }

    /// Launch a command detached; returns once the engine has started it
    pub async fn run_background(
        &self,
        token: &str,
        command: &str,
        options: RunOptions,
    ) -> Result<ProcessHandle> {
        let argv = build_argv(command, options.shell)?;
        let sandbox = self.manager.resolve(token).await?;

        let pidfile = scratch_path("bg", "pid");
        let log_path = scratch_path("bg", "log");
        let spec = ExecSpec {
            argv: wrap(
                BACKGROUND_SCRIPT,
                &[pidfile.as_str(), log_path.as_str()],
                argv,
            ),
            env: options.env.clone(),
            working_dir: options.cwd.clone(),
            user: options.user.engine_user(),
        };

        let engine = self.manager.engine();
        let process_id = engine
            .exec_detached(&sandbox.id, &spec)
            .await
            .map_err(|e| e.gone_as(token))?;
        let started_at = Utc::now();
        let pid = self.read_pid(&sandbox, &pidfile).await;

        info!(
            "Started background process {} in {}: {}",
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
            sandbox.name,
            command
        );

        Ok(ProcessHandle {
            process_id,
            pid,
            sandbox_id: sandbox.id,
            started_at,
            command: command.to_string(),
            log_path,
            status: ProcessStatus::Running,
        })
    }

    async fn read_pid(&self, sandbox: &Sandbox, pidfile: &str) -> Option<u32> {
        let options = RunOptions::control();
        for _ in 0..10 {
            let argv = vec!["cat".to_string(), pidfile.to_string()];
            match self.run_in(sandbox, argv, &options).await {
                Ok(output) if output.success() => {
                    if let Ok(pid) = output.stdout_text().trim().parse::<u32>() {
                        return Some(pid);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Could not read {}: {}", pidfile, e);
                    return None;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None
    }

    /// Refresh a handle from the engine's exec record
    pub async fn poll(&self, handle: &mut ProcessHandle) -> Result<ProcessStatus> {
        handle.status = self.exec_status(&handle.sandbox_id, &handle.process_id).await?;
        Ok(handle.status)
    }

    /// Status of a background exec by id, for callers that only kept the id
    pub async fn poll_exec(&self, token: &str, process_id: &str) -> Result<ProcessStatus> {
        let sandbox = self.manager.resolve(token).await?;
        self.exec_status(&sandbox.id, process_id).await
    }

    async fn exec_status(&self, sandbox_id: &str, process_id: &str) -> Result<ProcessStatus> {
        match self.manager.engine().inspect_exec(process_id).await {
            // Not settled until the record carries an exit code
            Ok(state) => Ok(match (state.running, state.exit_code) {
                (false, Some(code)) => ProcessStatus::from_exit_code(code),
                _ => ProcessStatus::Running,
            }),
            Err(e) if e.is_engine_not_found() => {
                // Exec records vanish with their container
                self.manager.resolve(sandbox_id).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Processes visible inside the sandbox
    pub async fn list_processes(&self, token: &str) -> Result<Vec<ProcessInfo>> {
        let argv = ["ps", "-eo", "pid,user,stat,args"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.run_argv(token, argv, RunOptions::control()).await?;
        if !output.success() {
            return Err(SandboxError::InvalidRequest(format!(
                "ps failed in '{}': {}",
                token,
                output.stderr_text().trim()
            )));
        }
        Ok(parse_ps(&output.stdout_text()))
    }

    /// Signal a process inside the sandbox; `Ok(false)` when it does not exist
    pub async fn kill_process(&self, token: &str, pid: u32, signal: Option<&str>) -> Result<bool> {
        let signal = signal.unwrap_or("TERM");
        if signal.is_empty() || !signal.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SandboxError::InvalidRequest(format!(
                "invalid signal '{}'",
                signal
            )));
        }
        let argv = vec![
            "kill".to_string(),
            "-s".to_string(),
            signal.to_string(),
            pid.to_string(),
        ];
        let output = self.run_argv(token, argv, RunOptions::control()).await?;
        if output.success() {
            info!("Sent {} to {} in {}", signal, pid, token);
        }
        Ok(output.success())
    }
}

fn build_argv(command: &str, shell: bool) -> Result<Vec<String>> {
    if command.trim().is_empty() {
        return Err(SandboxError::InvalidRequest("empty command".to_string()));
    }
    if shell {
        return Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
    }
    shell_words::split(command)
        .map_err(|e| SandboxError::InvalidRequest(format!("cannot parse command: {}", e)))
}

/// `/bin/sh -c SCRIPT ARG0 ARGS... ARGV...`
fn wrap(script: &str, args: &[&str], argv: Vec<String>) -> Vec<String> {
    let mut wrapped = vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
    wrapped.extend(args.iter().map(|a| a.to_string()));
    wrapped.extend(argv);
    wrapped
}

pub(crate) fn scratch_path(kind: &str, extension: &str) -> String {
    format!(
        "{}/.csbx-{}-{}.{}",
        SCRATCH_DIR,
        kind,
        nanoid::nanoid!(12, &ID_ALPHABET),
        extension
    )
}

fn parse_ps(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse::<u32>().ok()?;
            let user = fields.next()?.to_string();
            let state = fields.next()?.to_string();
            let command = fields.collect::<Vec<_>>().join(" ");
            Some(ProcessInfo {
                pid,
                user,
                state,
                command,
            })
        })
        .collect()
}
