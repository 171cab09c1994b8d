// ABOUTME: CLI commands for sandbox lifecycle (create, kill, list, info, pause, resume, export)
// ABOUTME: Also hosts the git-clone and git-push bridges since they act on a whole sandbox

use super::utils::{
    colored_state, note, parse_key_val, parse_mount, ports_summary, print_json, sandbox_table,
    status,
};
use anyhow::Result;
use clap::{Args, Subcommand};
use colored::*;
use csbx_sandbox::constants::LABEL_METADATA_PREFIX;
use csbx_sandbox::{
    CreateSandboxRequest, ExportRequest, GitCloneRequest, GitPushRequest, Mount, PortMapping,
    Sandbox, SandboxClient,
};
use std::path::PathBuf;
use std::time::Duration;

/// Tokens are read from here when `--token` is not given
const TOKEN_ENV_VARS: [&str; 2] = ["GITHUB_TOKEN", "GIT_TOKEN"];

#[derive(Args)]
pub struct CreateArgs {
    /// Image to create the sandbox from (default: CSBX_DEFAULT_TEMPLATE or docker-sandbox:base)
    #[arg(short, long)]
    template: Option<String>,

    /// Sandbox name (generated when omitted)
    #[arg(short, long)]
    name: Option<String>,

    /// Port mapping HOST:CONTAINER, or PORT for the same port on both sides
    #[arg(short, long = "port")]
    ports: Vec<PortMapping>,

    /// Environment variable KEY=VALUE
    #[arg(short, long = "env", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Metadata label KEY=VALUE, usable as a list filter
    #[arg(short, long = "meta", value_parser = parse_key_val)]
    meta: Vec<(String, String)>,

    /// Bind a host directory, HOST:CONTAINER[:MODE] with MODE like ro, rw or rw,Z (default: rw,Z)
    #[arg(long = "mount", value_parser = parse_mount)]
    mounts: Vec<Mount>,

    /// Sandbox lifetime in seconds, recorded for external cleanup; 0 records none
    #[arg(long, default_value_t = 1800)]
    timeout: u64,
}

impl CreateArgs {
    fn into_request(self) -> CreateSandboxRequest {
        CreateSandboxRequest {
            template: self.template,
            name: self.name,
            ports: self.ports,
            mounts: self.mounts,
            env: self.env.into_iter().collect(),
            metadata: self.meta.into_iter().collect(),
            timeout: (self.timeout > 0).then(|| Duration::from_secs(self.timeout)),
        }
    }
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Create a new sandbox
    Create(CreateArgs),

    /// Stop and remove a sandbox
    Kill {
        /// Sandbox name, ID or ID prefix
        sandbox: String,
    },

    /// List sandboxes
    List {
        /// Only sandboxes whose metadata KEY has VALUE
        #[arg(short, long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,

        /// Show at most this many, oldest first
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show sandbox details
    Info {
        sandbox: String,

        #[arg(long)]
        json: bool,
    },

    /// Print the host URL for a container port
    GetHost {
        sandbox: String,
        port: u16,
    },

    /// Freeze every process in a sandbox
    Pause { sandbox: String },

    /// Thaw a paused sandbox
    Resume { sandbox: String },

    /// Save a sandbox directory as a .tar.gz on the host
    Export {
        sandbox: String,

        /// Directory to write the archive to
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Archive name without extension (default: <sandbox>-<timestamp>)
        #[arg(short, long)]
        name: Option<String>,

        /// Directory inside the sandbox (default: the working root)
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Clone a git repository into a sandbox over HTTPS
    GitClone {
        sandbox: String,
        url: String,

        #[arg(short, long)]
        branch: Option<String>,

        /// Directory to clone under (default: the working root)
        #[arg(short, long)]
        path: Option<String>,

        /// Checkout directory name (default: the repository name)
        #[arg(short, long)]
        dir: Option<String>,

        /// Access token (default: GITHUB_TOKEN or GIT_TOKEN)
        #[arg(short, long)]
        token: Option<String>,
    },

    /// Commit a sandbox directory and push it to a remote branch
    GitPush {
        sandbox: String,
        url: String,

        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Directory to push (default: the working root)
        #[arg(short, long)]
        path: Option<String>,

        /// Commit message (default: generated with a timestamp)
        #[arg(short, long)]
        message: Option<String>,

        /// Access token (default: GITHUB_TOKEN or GIT_TOKEN)
        #[arg(short, long)]
        token: Option<String>,

        #[arg(short, long)]
        force: bool,

        /// Push the directory as new history instead of on top of the remote branch
        #[arg(long)]
        no_clone: bool,
    },
}

fn token_from_env(explicit: Option<String>) -> Option<String> {
    explicit.or_else(|| {
        TOKEN_ENV_VARS
            .iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    })
}

/// `csbx init`: create and print only the ID, for `ID=$(csbx init)`
pub async fn init(client: &SandboxClient, args: CreateArgs) -> Result<()> {
    note("Initializing new sandbox...");
    let sandbox = client.sandboxes.create(args.into_request()).await?;
    status(format!("Sandbox {} ready", sandbox.name.bold()));
    println!("{}", sandbox.id);
    Ok(())
}

impl SandboxCommands {
    pub async fn execute(self, client: &SandboxClient) -> Result<()> {
        match self {
            SandboxCommands::Create(args) => {
                let sandbox = client.sandboxes.create(args.into_request()).await?;
                status(format!("Sandbox created: {}", sandbox.name.bold()));
                println!("{}", sandbox.id);
            }
            SandboxCommands::Kill { sandbox } => {
                let killed = client.sandboxes.kill(&sandbox).await?;
                status(format!("Sandbox {} killed", killed.describe()));
            }
            SandboxCommands::List { meta, limit, json } => {
                let filters: Vec<String> = meta
                    .into_iter()
                    .map(|(k, v)| format!("{}{}={}", LABEL_METADATA_PREFIX, k, v))
                    .collect();
                let mut sandboxes = client.sandboxes.list(&filters).await?;
                sandboxes.truncate(limit);
                if json {
                    print_json(&sandboxes)?;
                } else if sandboxes.is_empty() {
                    note("No sandboxes found.");
                } else {
                    println!("{}", sandbox_table(&sandboxes));
                }
            }
            SandboxCommands::Info { sandbox, json } => {
                let sandbox = client.sandboxes.get(&sandbox).await?;
                if json {
                    print_json(&sandbox)?;
                } else {
                    print_info(&sandbox);
                }
            }
            SandboxCommands::GetHost { sandbox, port } => {
                println!("{}", client.sandboxes.get_host(&sandbox, port).await?);
            }
            SandboxCommands::Pause { sandbox } => {
                let paused = client.sandboxes.pause(&sandbox).await?;
                status(format!("Sandbox {} paused", paused.name));
            }
            SandboxCommands::Resume { sandbox } => {
                let resumed = client.sandboxes.resume(&sandbox).await?;
                status(format!("Sandbox {} resumed", resumed.name));
            }
            SandboxCommands::Export {
                sandbox,
                output_dir,
                name,
                path,
            } => {
                note(format!("Exporting {}...", sandbox));
                let artifact = client
                    .sandboxes
                    .export(
                        &sandbox,
                        ExportRequest {
                            output_dir,
                            name,
                            path,
                        },
                    )
                    .await?;
                status(format!(
                    "Exported {} bytes",
                    artifact.byte_count.to_string().bold()
                ));
                println!("{}", artifact.path.display());
            }
            SandboxCommands::GitClone {
                sandbox,
                url,
                branch,
                path,
                dir,
                token,
            } => {
                note(format!("Cloning {}...", url));
                let checkout = client
                    .git
                    .clone(
                        &sandbox,
                        GitCloneRequest {
                            url,
                            branch,
                            path,
                            directory: dir,
                            token: token_from_env(token),
                        },
                    )
                    .await?;
                status("Repository cloned");
                println!("{}", checkout);
            }
            SandboxCommands::GitPush {
                sandbox,
                url,
                branch,
                path,
                message,
                token,
                force,
                no_clone,
            } => {
                note(format!("Pushing to {} ({})...", url, branch));
                let outcome = client
                    .git
                    .push(
                        &sandbox,
                        GitPushRequest {
                            url,
                            branch: Some(branch),
                            path,
                            message,
                            token: token_from_env(token),
                            force,
                            no_clone,
                        },
                    )
                    .await?;
                if !outcome.committed {
                    note("Nothing new to commit; pushed the existing history");
                }
                status(format!("Pushed branch {}", outcome.branch.bold()));
            }
        }
        Ok(())
    }
}

fn print_info(sandbox: &Sandbox) {
    println!("{}", sandbox.name.bold().cyan());
    println!("  {:<10} {}", "ID:", sandbox.id);
    println!("  {:<10} {}", "State:", colored_state(sandbox.state));
    println!("  {:<10} {}", "Template:", sandbox.template);
    println!("  {:<10} {}", "Container:", sandbox.container_name);
    println!(
        "  {:<10} {}",
        "Created:",
        sandbox.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  {:<10} {}", "Ports:", ports_summary(sandbox));
    println!("  {:<10} {}", "Workdir:", sandbox.working_root);
    if let Some(timeout) = sandbox.timeout() {
        println!("  {:<10} {}s", "Timeout:", timeout.as_secs());
    }
    let metadata = sandbox.metadata();
    if !metadata.is_empty() {
        println!("  Metadata:");
        for (key, value) in metadata {
            println!("    {} = {}", key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: CreateArgs,
    }

    fn request(argv: &[&str]) -> CreateSandboxRequest {
        Harness::parse_from(std::iter::once("create").chain(argv.iter().copied()))
            .args
            .into_request()
    }

    #[test]
    fn test_create_defaults_record_half_hour_timeout() {
        let request = request(&[]);
        assert_eq!(request.timeout, Some(Duration::from_secs(1800)));
        assert!(request.mounts.is_empty());
    }

    #[test]
    fn test_create_with_mounts_and_no_timeout() {
        let request = request(&[
            "--mount",
            "/srv/app:/home/user/app",
            "--mount",
            "/srv/data:/home/user/data:ro",
            "--timeout",
            "0",
        ]);
        assert_eq!(request.timeout, None);
        assert_eq!(
            request.mounts,
            vec![
                Mount::new("/srv/app", "/home/user/app"),
                Mount {
                    mode: "ro".to_string(),
                    ..Mount::new("/srv/data", "/home/user/data")
                },
            ]
        );
    }
}
