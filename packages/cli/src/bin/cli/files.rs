// ABOUTME: CLI commands for files inside a sandbox and host transfers
// ABOUTME: read writes raw bytes to stdout; write takes content as an argument or from stdin

use super::utils::{file_table, format_size, note, print_json, status};
use anyhow::{bail, Result};
use clap::Subcommand;
use csbx_sandbox::{SandboxClient, WriteOptions};
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum FilesCommands {
    /// List a directory
    Ls {
        sandbox: String,
        #[arg(default_value = ".")]
        path: String,
        #[arg(long)]
        json: bool,
    },

    /// Print a file's content
    Read { sandbox: String, path: String },

    /// Write a file, replacing it if it exists
    Write {
        sandbox: String,
        path: String,
        content: Option<String>,

        /// Read the content from stdin
        #[arg(long, conflicts_with = "content")]
        stdin: bool,

        /// Permission bits in octal, e.g. 755
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,

        /// chown the file to USER or USER:GROUP
        #[arg(long)]
        owner: Option<String>,
    },

    /// Exit 0 if the path exists, 1 otherwise
    Exists { sandbox: String, path: String },

    /// Show size, mode and type of a path
    Info {
        sandbox: String,
        path: String,
        #[arg(long)]
        json: bool,
    },

    /// Remove a file, or a directory with -r
    Rm {
        sandbox: String,
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },

    /// Create a directory
    Mkdir {
        sandbox: String,
        path: String,
        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },

    /// Move or rename a path
    Mv {
        sandbox: String,
        from: String,
        to: String,
    },

    /// Copy a host file or directory into the sandbox
    Upload {
        sandbox: String,
        local: PathBuf,
        remote: String,
    },

    /// Copy a sandbox file or directory to the host
    Download {
        sandbox: String,
        remote: String,
        local: PathBuf,
    },
}

fn parse_mode(raw: &str) -> Result<u32, String> {
    u32::from_str_radix(raw.trim_start_matches("0o"), 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("invalid octal mode '{}'", raw))
}

impl FilesCommands {
    pub async fn execute(self, client: &SandboxClient) -> Result<()> {
        match self {
            FilesCommands::Ls {
                sandbox,
                path,
                json,
            } => {
                let entries = client.files.list(&sandbox, &path).await?;
                if json {
                    print_json(&entries)?;
                } else if entries.is_empty() {
                    note("(empty)");
                } else {
                    println!("{}", file_table(&entries));
                }
            }
            FilesCommands::Read { sandbox, path } => {
                let mut out = io::stdout();
                client.files.read_into(&sandbox, &path, &mut out).await?;
                out.flush()?;
            }
            FilesCommands::Write {
                sandbox,
                path,
                content,
                stdin,
                mode,
                owner,
            } => {
                let options = WriteOptions { mode, owner };
                let written = match (content, stdin) {
                    (Some(content), _) => {
                        client
                            .files
                            .write(&sandbox, &path, content.as_bytes(), options)
                            .await?;
                        content.len() as u64
                    }
                    (None, true) => {
                        let mut buffer = Vec::new();
                        io::Read::read_to_end(&mut io::stdin(), &mut buffer)?;
                        client
                            .files
                            .write(&sandbox, &path, &buffer, options)
                            .await?;
                        buffer.len() as u64
                    }
                    (None, false) => bail!("provide the content as an argument or use --stdin"),
                };
                status(format!("Wrote {} to {}", format_size(written), path));
            }
            FilesCommands::Exists { sandbox, path } => {
                if client.files.exists(&sandbox, &path).await? {
                    println!("true");
                } else {
                    println!("false");
                    std::process::exit(1);
                }
            }
            FilesCommands::Info {
                sandbox,
                path,
                json,
            } => {
                let entry = client.files.stat(&sandbox, &path).await?;
                if json {
                    print_json(&entry)?;
                } else {
                    println!("{}", file_table(std::slice::from_ref(&entry)));
                }
            }
            FilesCommands::Rm {
                sandbox,
                path,
                recursive,
            } => {
                client.files.remove(&sandbox, &path, recursive).await?;
                status(format!("Removed {}", path));
            }
            FilesCommands::Mkdir {
                sandbox,
                path,
                parents,
            } => {
                client.files.mkdir(&sandbox, &path, parents).await?;
                status(format!("Created {}", path));
            }
            FilesCommands::Mv { sandbox, from, to } => {
                client.files.move_path(&sandbox, &from, &to).await?;
                status(format!("Moved {} to {}", from, to));
            }
            FilesCommands::Upload {
                sandbox,
                local,
                remote,
            } => {
                let transfer = client.files.upload(&sandbox, &local, &remote).await?;
                status(format!(
                    "Uploaded {} to {} ({})",
                    transfer.source_path,
                    transfer.destination_path,
                    format_size(transfer.byte_count)
                ));
            }
            FilesCommands::Download {
                sandbox,
                remote,
                local,
            } => {
                let transfer = client.files.download(&sandbox, &remote, &local).await?;
                status(format!(
                    "Downloaded {} to {} ({})",
                    transfer.source_path,
                    transfer.destination_path,
                    format_size(transfer.byte_count)
                ));
            }
        }
        Ok(())
    }
}
