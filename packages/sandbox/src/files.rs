// ABOUTME: File operations inside sandboxes and tar-stream upload/download between host and sandbox
// ABOUTME: Downloads spool to temp storage and only appear at the destination once complete

use crate::archive::tar_stream;
use crate::engine::ArchiveStream;
use crate::error::{Result, SandboxError};
use crate::exec::{CommandExecutor, ExecOutput, RunOptions};
use crate::sandbox::Sandbox;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// size|raw mode (hex)|mtime|path; understood by GNU and busybox stat
const STAT_FORMAT: &str = "%s|%f|%Y|%n";

/// Spooled transfers stay in memory up to this size, then spill to disk
const SPOOL_THRESHOLD: usize = 8 * 1024 * 1024;

/// Symlink hops followed by `read`
const MAX_LINK_HOPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    /// Permission bits only
    pub mode: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferDescriptor {
    pub source_path: String,
    pub destination_path: String,
    pub is_directory: bool,
    /// Payload bytes of regular files moved
    pub byte_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Defaults to 0644
    pub mode: Option<u32>,
    /// `user` or `user:group` to chown the file to after writing
    pub owner: Option<String>,
}

pub struct FileTransfer {
    executor: Arc<CommandExecutor>,
}

impl FileTransfer {
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self { executor }
    }

    async fn sandbox(&self, token: &str) -> Result<Sandbox> {
        self.executor.manager().resolve(token).await
    }

    async fn run(&self, sandbox: &Sandbox, argv: &[&str], options: RunOptions) -> Result<ExecOutput> {
        let argv = argv.iter().map(|s| s.to_string()).collect();
        self.executor.run_in(sandbox, argv, &options).await
    }

    /// Feed a producer's archive into `dest_dir`; an engine rejection wins over the packing error it caused
    async fn copy_archive<T>(
        &self,
        sandbox: &Sandbox,
        token: &str,
        dest_dir: &str,
        target: &str,
        archive: ArchiveStream,
        packed: JoinHandle<io::Result<T>>,
    ) -> Result<T> {
        let upload = self
            .executor
            .manager()
            .engine()
            .copy_in(&sandbox.id, dest_dir, archive)
            .await;
        let packed = packed
            .await
            .map_err(|e| SandboxError::transfer(target, e))?;
        match (upload, packed) {
            (Err(e), _) => Err(e.at_path(token, dest_dir)),
            (Ok(()), Err(e)) => Err(SandboxError::transfer(target, e)),
            (Ok(()), Ok(value)) => Ok(value),
        }
    }

    pub async fn stat(&self, token: &str, path: &str) -> Result<FileEntry> {
        let sandbox = self.sandbox(token).await?;
        let path = sandbox_path(&sandbox, path);
        self.stat_in(&sandbox, token, &path).await
    }

    async fn stat_in(&self, sandbox: &Sandbox, token: &str, path: &str) -> Result<FileEntry> {
        let output = self
            .run(sandbox, &["stat", "-c", STAT_FORMAT, path], RunOptions::default())
            .await?;
        if !output.success() {
            return Err(command_failure(token, path, "stat", &output));
        }
        output
            .stdout_text()
            .lines()
            .find_map(parse_stat_line)
            .ok_or_else(|| {
                SandboxError::InvalidRequest(format!("unexpected stat output for {}", path))
            })
    }

    pub async fn exists(&self, token: &str, path: &str) -> Result<bool> {
        match self.stat(token, path).await {
            Ok(_) => Ok(true),
            Err(SandboxError::PathNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Directory entries (not recursive); a file path lists just that file
    pub async fn list(&self, token: &str, path: &str) -> Result<Vec<FileEntry>> {
        let sandbox = self.sandbox(token).await?;
        let path = sandbox_path(&sandbox, path);
        let target = self.stat_in(&sandbox, token, &path).await?;
        if !target.is_dir {
            return Ok(vec![target]);
        }

        let output = self
            .run(
                &sandbox,
                &[
                    "find",
                    &path,
                    "-mindepth",
                    "1",
                    "-maxdepth",
                    "1",
                    "-exec",
                    "stat",
                    "-c",
                    STAT_FORMAT,
                    "{}",
                    "+",
                ],
                RunOptions::default(),
            )
            .await?;
        if !output.success() && output.stdout.is_empty() {
            return Err(command_failure(token, &path, "list", &output));
        }

        let mut entries: Vec<FileEntry> = output
            .stdout_text()
            .lines()
            .filter_map(parse_stat_line)
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn read(&self, token: &str, path: &str) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.read_into(token, path, &mut content).await?;
        Ok(content)
    }

    /// Stream a file's content into `writer`, following symlinks
    pub async fn read_into<W: Write + Send>(
        &self,
        token: &str,
        path: &str,
        writer: &mut W,
    ) -> Result<u64> {
        let sandbox = self.sandbox(token).await?;
        let mut path = sandbox_path(&sandbox, path);

        for _ in 0..MAX_LINK_HOPS {
            let stream = self
                .executor
                .manager()
                .engine()
                .copy_out(&sandbox.id, &path)
                .await
                .map_err(|e| e.at_path(token, &path))?;
            let mut spool = spool_archive(stream, token, &path).await?;

            let mut archive = tar::Archive::new(&mut spool);
            let mut entries = archive.entries()?;
            let mut entry = match entries.next() {
                Some(entry) => entry?,
                None => return Err(SandboxError::transfer(&path, "empty archive")),
            };

            match entry.header().entry_type() {
                tar::EntryType::Directory => {
                    return Err(SandboxError::InvalidRequest(format!(
                        "{} is a directory",
                        path
                    )))
                }
                tar::EntryType::Symlink => {
                    let target = entry
                        .link_name()?
                        .map(|t| t.to_string_lossy().to_string())
                        .unwrap_or_default();
                    debug!("{} is a symlink to {}", path, target);
                    path = follow_link(&path, &target);
                }
                _ => {
                    let copied = io::copy(&mut entry, writer)?;
                    debug!("Read {} bytes from {}:{}", copied, sandbox.name, path);
                    return Ok(copied);
                }
            }
        }

        Err(SandboxError::InvalidRequest(format!(
            "too many levels of symbolic links at {}",
            path
        )))
    }

    pub async fn write(
        &self,
        token: &str,
        path: &str,
        content: &[u8],
        options: WriteOptions,
    ) -> Result<()> {
        self.write_from(token, path, content, options).await
    }

    /// Write everything `reader` yields to `path`, replacing any existing file
    pub async fn write_from<R: Read + Send>(
        &self,
        token: &str,
        path: &str,
        mut reader: R,
        options: WriteOptions,
    ) -> Result<()> {
        let sandbox = self.sandbox(token).await?;
        let path = sandbox_path(&sandbox, path);
        let (parent, name) = split_path(&path)?;

        // The tar header needs the size up front; the spool spills to disk past the threshold
        let mut spool = tempfile::spooled_tempfile(SPOOL_THRESHOLD);
        let size = io::copy(&mut reader, &mut spool)?;
        spool.seek(SeekFrom::Start(0))?;

        let mode = options.mode.unwrap_or(0o644);
        let (archive, packed) = tar_stream(path.clone(), move |builder| {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(size);
            header.set_mode(mode);
            header.set_mtime(Utc::now().timestamp().max(0) as u64);
            header.set_cksum();
            builder.append_data(&mut header, &name, &mut spool)
        });
        self.copy_archive(&sandbox, token, &parent, &path, archive, packed)
            .await?;

        if let Some(owner) = &options.owner {
            let output = self
                .run(&sandbox, &["chown", owner, &path], RunOptions::as_root())
                .await?;
            if !output.success() {
                return Err(command_failure(token, &path, "chown", &output));
            }
        }

        debug!("Wrote {} bytes to {}:{}", size, sandbox.name, path);
        Ok(())
    }

    pub async fn mkdir(&self, token: &str, path: &str, parents: bool) -> Result<()> {
        let sandbox = self.sandbox(token).await?;
        let path = sandbox_path(&sandbox, path);
        let mut argv = vec!["mkdir"];
        if parents {
            argv.push("-p");
        }
        argv.push(&path);
        let output = self.run(&sandbox, &argv, RunOptions::default()).await?;
        if !output.success() {
            return Err(command_failure(token, &path, "mkdir", &output));
        }
        Ok(())
    }

    pub async fn remove(&self, token: &str, path: &str, recursive: bool) -> Result<()> {
        let sandbox = self.sandbox(token).await?;
        let path = sandbox_path(&sandbox, path);
        let target = self.stat_in(&sandbox, token, &path).await?;
        if target.is_dir && !target.is_symlink && !recursive {
            return Err(SandboxError::InvalidRequest(format!(
                "{} is a directory, remove it recursively",
                path
            )));
        }

        let flags = if recursive { "-rf" } else { "-f" };
        let output = self
            .run(&sandbox, &["rm", flags, &path], RunOptions::default())
            .await?;
        if !output.success() {
            return Err(command_failure(token, &path, "remove", &output));
        }
        Ok(())
    }

    pub async fn move_path(&self, token: &str, from: &str, to: &str) -> Result<()> {
        let sandbox = self.sandbox(token).await?;
        let from = sandbox_path(&sandbox, from);
        let to = sandbox_path(&sandbox, to);
        let output = self
            .run(&sandbox, &["mv", &from, &to], RunOptions::default())
            .await?;
        if !output.success() {
            return Err(command_failure(token, &from, "move", &output));
        }
        Ok(())
    }

    /// Copy a host file or directory to `remote`; directories merge into an existing one
    pub async fn upload(
        &self,
        token: &str,
        local: &Path,
        remote: &str,
    ) -> Result<TransferDescriptor> {
        let metadata = fs::symlink_metadata(local).map_err(|e| {
            SandboxError::InvalidRequest(format!("cannot read {}: {}", local.display(), e))
        })?;
        let sandbox = self.sandbox(token).await?;
        let remote = sandbox_path(&sandbox, remote);
        let (parent, name) = split_path(&remote)?;

        let source = local.to_path_buf();
        let (archive, packed) = tar_stream(remote.clone(), move |builder| {
            builder.follow_symlinks(false);
            pack_local(builder, &source, &name)
        });
        let byte_count = self
            .copy_archive(&sandbox, token, &parent, &remote, archive, packed)
            .await
            .map_err(|e| match e {
                SandboxError::EngineCall { message, .. } => SandboxError::transfer(&remote, message),
                other => other,
            })?;

        info!(
            "Uploaded {} to {}:{} ({} bytes)",
            local.display(),
            sandbox.name,
            remote,
            byte_count
        );
        Ok(TransferDescriptor {
            source_path: local.display().to_string(),
            destination_path: remote,
            is_directory: metadata.is_dir(),
            byte_count,
        })
    }

    /// Copy `remote` to a host path; nothing appears at `local` unless the whole archive arrived
    pub async fn download(
        &self,
        token: &str,
        remote: &str,
        local: &Path,
    ) -> Result<TransferDescriptor> {
        let sandbox = self.sandbox(token).await?;
        let remote = sandbox_path(&sandbox, remote);

        if local.is_dir() && !local.is_symlink() {
            return Err(SandboxError::InvalidRequest(format!(
                "{} already exists as a directory",
                local.display()
            )));
        }
        let local_parent = match local.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&local_parent)?;

        let stream = self
            .executor
            .manager()
            .engine()
            .copy_out(&sandbox.id, &remote)
            .await
            .map_err(|e| e.at_path(token, &remote))?;
        let spool = spool_archive(stream, token, &remote).await?;

        let destination = local.to_path_buf();
        let (is_directory, byte_count) =
            tokio::task::spawn_blocking(move || unpack_to(spool, &local_parent, &destination))
                .await
                .map_err(|e| SandboxError::transfer(&remote, e))?
                .map_err(|e| SandboxError::transfer(&remote, e))?;

        info!(
            "Downloaded {}:{} to {} ({} bytes)",
            sandbox.name,
            remote,
            local.display(),
            byte_count
        );
        Ok(TransferDescriptor {
            source_path: remote,
            destination_path: local.display().to_string(),
            is_directory,
            byte_count,
        })
    }
}

/// Absolute path inside the sandbox; relative paths hang off the working root
fn sandbox_path(sandbox: &Sandbox, path: &str) -> String {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new(&sandbox.working_root).join(path)
    };

    let mut parts: Vec<String> = Vec::new();
    for component in joined.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

fn split_path(path: &str) -> Result<(String, String)> {
    match path.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => {
            let parent = if parent.is_empty() { "/" } else { parent };
            Ok((parent.to_string(), name.to_string()))
        }
        _ => Err(SandboxError::InvalidRequest(format!(
            "{} does not name a file",
            path
        ))),
    }
}

fn follow_link(path: &str, target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }
    let parent = split_path(path)
        .map(|(parent, _)| parent)
        .unwrap_or_else(|_| "/".to_string());
    let mut parts: Vec<&str> = parent.split('/').filter(|p| !p.is_empty()).collect();
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parse_stat_line(line: &str) -> Option<FileEntry> {
    let mut fields = line.splitn(4, '|');
    let size = fields.next()?.trim().parse::<u64>().ok()?;
    let raw_mode = u32::from_str_radix(fields.next()?.trim(), 16).ok()?;
    let mtime = fields.next()?.trim().parse::<i64>().ok()?;
    let path = fields.next()?.to_string();

    let file_type = raw_mode & 0o170000;
    let name = path
        .rsplit('/')
        .find(|p| !p.is_empty())
        .unwrap_or("/")
        .to_string();
    Some(FileEntry {
        name,
        path,
        size,
        mode: raw_mode & 0o7777,
        is_dir: file_type == 0o040000,
        is_symlink: file_type == 0o120000,
        modified: Utc.timestamp_opt(mtime, 0).single().unwrap_or_else(Utc::now),
    })
}

fn command_failure(token: &str, path: &str, operation: &str, output: &ExecOutput) -> SandboxError {
    let stderr = output.stderr_text();
    let message = stderr.trim();
    if message.contains("No such file") || message.contains("can't stat") {
        SandboxError::PathNotFound {
            token: token.to_string(),
            path: path.to_string(),
        }
    } else if message.contains("Permission denied") || message.contains("Operation not permitted")
    {
        SandboxError::PermissionDenied {
            token: token.to_string(),
            path: path.to_string(),
            message: message.to_string(),
        }
    } else {
        SandboxError::InvalidRequest(format!(
            "{} {} failed with exit code {}: {}",
            operation, path, output.exit_code, message
        ))
    }
}

/// Drain an archive stream into temp storage; a broken stream is a transfer failure
async fn spool_archive(
    mut stream: ArchiveStream,
    token: &str,
    path: &str,
) -> Result<tempfile::SpooledTempFile> {
    let mut spool = tempfile::spooled_tempfile(SPOOL_THRESHOLD);
    let mut received = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            // Nothing arrived yet: the engine refused the path itself
            Err(e) if received == 0 => return Err(e.at_path(token, path)),
            Err(e) => return Err(SandboxError::transfer(path, e)),
        };
        received += chunk.len();
        spool.write_all(&chunk)?;
    }
    spool.seek(SeekFrom::Start(0))?;
    Ok(spool)
}

/// Tar `source` under `name`; returns the payload size of the regular files
fn pack_local<W: Write>(builder: &mut tar::Builder<W>, source: &Path, name: &str) -> io::Result<u64> {
    let mut byte_count = 0;
    pack_entry(builder, source, Path::new(name), &mut byte_count)?;
    Ok(byte_count)
}

fn pack_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    source: &Path,
    name: &Path,
    byte_count: &mut u64,
) -> io::Result<()> {
    let metadata = fs::symlink_metadata(source)?;
    builder.append_path_with_name(source, name)?;
    if metadata.is_file() {
        *byte_count += metadata.len();
    } else if metadata.is_dir() {
        let mut children: Vec<_> = fs::read_dir(source)?.collect::<io::Result<_>>()?;
        children.sort_by_key(|entry| entry.file_name());
        for child in children {
            pack_entry(builder, &child.path(), &name.join(child.file_name()), byte_count)?;
        }
    }
    Ok(())
}

/// Unpack into a hidden staging dir beside `destination`, then rename the root entry into place
fn unpack_to(
    mut spool: tempfile::SpooledTempFile,
    parent: &Path,
    destination: &Path,
) -> io::Result<(bool, u64)> {
    let mut byte_count = 0;
    let mut root: Option<(PathBuf, bool)> = None;
    {
        let mut archive = tar::Archive::new(&mut spool);
        for entry in archive.entries()? {
            let entry = entry?;
            if entry.header().entry_type().is_file() {
                byte_count += entry.header().size()?;
            }
            if root.is_none() {
                let first = entry
                    .path()?
                    .components()
                    .find(|c| matches!(c, Component::Normal(_)))
                    .map(|c| PathBuf::from(c.as_os_str()));
                if let Some(first) = first {
                    root = Some((first, entry.header().entry_type().is_dir()));
                }
            }
        }
    }
    let (root, is_directory) =
        root.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty archive"))?;

    spool.seek(SeekFrom::Start(0))?;
    let staging = tempfile::Builder::new()
        .prefix(".csbx-download-")
        .tempdir_in(parent)?;
    let mut archive = tar::Archive::new(&mut spool);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.unpack(staging.path())?;

    if destination.is_symlink() || destination.is_file() {
        fs::remove_file(destination)?;
    }
    fs::rename(staging.path().join(root), destination)?;
    Ok((is_directory, byte_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxState;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::HashMap;

    fn sandbox() -> Sandbox {
        Sandbox {
            id: "abc".to_string(),
            name: "web".to_string(),
            container_name: "csbx-web".to_string(),
            template: "alpine:latest".to_string(),
            state: SandboxState::Running,
            created_at: Utc::now(),
            port_map: Vec::new(),
            labels: HashMap::new(),
            working_root: "/home/user".to_string(),
        }
    }

    #[rstest]
    #[case("notes.txt", "/home/user/notes.txt")]
    #[case("/etc/hosts", "/etc/hosts")]
    #[case("src/../README.md", "/home/user/README.md")]
    #[case("/tmp/dir/", "/tmp/dir")]
    fn test_sandbox_path(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sandbox_path(&sandbox(), raw), expected);
    }

    #[rstest]
    #[case("/home/user/a.txt", "../b.txt", "/home/b.txt")]
    #[case("/home/user/a.txt", "b.txt", "/home/user/b.txt")]
    #[case("/home/user/a.txt", "/etc/hosts", "/etc/hosts")]
    fn test_follow_link(#[case] path: &str, #[case] target: &str, #[case] expected: &str) {
        assert_eq!(follow_link(path, target), expected);
    }

    #[test]
    fn test_parse_stat_line() {
        let entry = parse_stat_line("1234|81a4|1714557600|/home/user/notes|draft.txt").unwrap();
        assert_eq!(entry.size, 1234);
        assert_eq!(entry.mode, 0o644);
        assert!(!entry.is_dir);
        assert!(!entry.is_symlink);
        assert_eq!(entry.path, "/home/user/notes|draft.txt");
        assert_eq!(entry.name, "notes|draft.txt");

        let dir = parse_stat_line("4096|41ed|1714557600|/home/user/src").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.mode, 0o755);

        let link = parse_stat_line("11|a1ff|1714557600|/home/user/latest").unwrap();
        assert!(link.is_symlink);
    }

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("/home/user/a.txt").unwrap(),
            ("/home/user".to_string(), "a.txt".to_string())
        );
        assert_eq!(
            split_path("/a.txt").unwrap(),
            ("/".to_string(), "a.txt".to_string())
        );
        assert!(split_path("/").is_err());
    }

    #[test]
    fn test_command_failure_classification() {
        let missing = ExecOutput {
            exit_code: 1,
            stdout: Vec::new(),
            stderr: b"stat: cannot stat '/nope': No such file or directory".to_vec(),
        };
        assert!(matches!(
            command_failure("web", "/nope", "stat", &missing),
            SandboxError::PathNotFound { .. }
        ));

        let denied = ExecOutput {
            exit_code: 1,
            stdout: Vec::new(),
            stderr: b"mkdir: cannot create directory '/root/x': Permission denied".to_vec(),
        };
        assert!(matches!(
            command_failure("web", "/root/x", "mkdir", &denied),
            SandboxError::PermissionDenied { .. }
        ));
    }

    #[test]
    fn test_pack_local_keeps_symlinks_and_counts_payload() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        std::os::unix::fs::symlink("a.txt", root.join("link")).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        let byte_count = pack_local(&mut builder, &root, "proj").unwrap();
        assert_eq!(byte_count, 5);

        let archive = builder.into_inner().unwrap();
        let mut archive = tar::Archive::new(archive.as_slice());
        let entries: Vec<(String, tar::EntryType)> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().to_string(),
                    e.header().entry_type(),
                )
            })
            .collect();
        assert_eq!(
            entries,
            vec![
                ("proj".to_string(), tar::EntryType::Directory),
                ("proj/a.txt".to_string(), tar::EntryType::Regular),
                ("proj/link".to_string(), tar::EntryType::Symlink),
            ]
        );
    }
}
