// ABOUTME: CLI commands for running commands and managing processes inside a sandbox
// ABOUTME: exec mirrors the command's stdout/stderr and exits with its exit code

use super::utils::{parse_key_val, print_json, process_table, status};
use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::*;
use csbx_sandbox::{
    ExecTimeout, ExecUser, ProcessStatus, RunOptions, SandboxClient, SandboxError,
};
use serde_json::json;
use std::io::{self, Write};
use std::time::Duration;

#[derive(Args)]
pub struct ExecArgs {
    sandbox: String,

    /// Command line; split like a shell would, without expansion, unless --shell
    command: String,

    /// Working directory inside the sandbox
    #[arg(long)]
    cwd: Option<String>,

    /// Run as this user
    #[arg(long, conflicts_with = "root")]
    user: Option<String>,

    /// Run as root
    #[arg(long)]
    root: bool,

    /// Run through /bin/sh -c (pipes, redirections, variables)
    #[arg(long)]
    shell: bool,

    /// Environment variable KEY=VALUE
    #[arg(short, long = "env", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Seconds before the command is killed, 0 for no limit (default: CSBX_EXEC_TIMEOUT_SECS or 60)
    #[arg(long)]
    timeout: Option<u64>,

    /// Start detached and print a process handle
    #[arg(long)]
    background: bool,

    #[arg(long)]
    json: bool,
}

impl ExecArgs {
    fn options(&self) -> RunOptions {
        let user = if self.root {
            ExecUser::Root
        } else {
            match &self.user {
                Some(user) if user == "root" => ExecUser::Root,
                Some(user) => ExecUser::Named(user.clone()),
                None => ExecUser::Default,
            }
        };
        let timeout = match self.timeout {
            None => ExecTimeout::Default,
            Some(0) => ExecTimeout::Never,
            Some(secs) => ExecTimeout::After(Duration::from_secs(secs)),
        };
        RunOptions {
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            user,
            shell: self.shell,
            timeout,
        }
    }
}

#[derive(Subcommand)]
pub enum ProcessCommands {
    /// List processes running in a sandbox
    Ps {
        sandbox: String,
        #[arg(long)]
        json: bool,
    },

    /// Send a signal to a process in a sandbox
    KillProcess {
        sandbox: String,
        pid: u32,

        /// Signal name or number (default: TERM)
        #[arg(short, long)]
        signal: Option<String>,
    },

    /// Show the status of a background command started with exec --background
    ExecStatus {
        sandbox: String,
        process_id: String,
        #[arg(long)]
        json: bool,
    },
}

pub async fn exec(client: &SandboxClient, args: ExecArgs) -> Result<()> {
    let options = args.options();

    if args.background {
        let handle = client
            .commands
            .run_background(&args.sandbox, &args.command, options)
            .await?;
        if args.json {
            print_json(&handle)?;
        } else {
            status(format!(
                "Started in background (pid {})",
                handle
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ));
            eprintln!("  Output: {}", handle.log_path);
            println!("{}", handle.process_id);
        }
        return Ok(());
    }

    let output = match client
        .commands
        .run(&args.sandbox, &args.command, options)
        .await
    {
        Ok(output) => output,
        Err(SandboxError::Timeout {
            timeout, output, ..
        }) => {
            io::stdout().write_all(&output.stdout)?;
            io::stderr().write_all(&output.stderr)?;
            bail!("command killed after {}s", timeout.as_secs_f64());
        }
        Err(e) => return Err(e.into()),
    };

    if args.json {
        print_json(&json!({
            "exit_code": output.exit_code,
            "stdout": output.stdout_text(),
            "stderr": output.stderr_text(),
        }))?;
    } else {
        io::stdout().write_all(&output.stdout)?;
        io::stderr().write_all(&output.stderr)?;
    }
    io::stdout().flush()?;

    if !output.success() {
        std::process::exit(i32::try_from(output.exit_code).unwrap_or(1));
    }
    Ok(())
}

impl ProcessCommands {
    pub async fn execute(self, client: &SandboxClient) -> Result<()> {
        match self {
            ProcessCommands::Ps { sandbox, json } => {
                let processes = client.commands.list_processes(&sandbox).await?;
                if json {
                    print_json(&processes)?;
                } else {
                    println!("{}", process_table(&processes));
                }
            }
            ProcessCommands::KillProcess {
                sandbox,
                pid,
                signal,
            } => {
                if client
                    .commands
                    .kill_process(&sandbox, pid, signal.as_deref())
                    .await?
                {
                    status(format!("Signalled process {}", pid));
                } else {
                    bail!("no process {} in {}", pid, sandbox);
                }
            }
            ProcessCommands::ExecStatus {
                sandbox,
                process_id,
                json,
            } => {
                let process_status = client.commands.poll_exec(&sandbox, &process_id).await?;
                if json {
                    print_json(&process_status)?;
                } else {
                    match process_status {
                        ProcessStatus::Running => println!("{}", "running".green()),
                        ProcessStatus::Exited { code } => println!("exited ({})", code),
                        ProcessStatus::Killed { signal } => {
                            println!("{} (signal {})", "killed".red(), signal)
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
