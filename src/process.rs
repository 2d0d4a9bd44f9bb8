//! External process invocation
//!
//! Every worker (extractor, downloader, post-processor, archiver, transcoder)
//! is launched through a [`ProcessLauncher`]. The production launcher spawns a
//! `tokio::process::Command`, drains its output into the log and reports the
//! exit code; tests substitute their own launcher.

use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Names of the placeholders available in argument templates
pub mod token {
    /// Member id of the work item
    pub const MEMBER_ID: &str = "memberId";
    /// Forward page number
    pub const PAGE: &str = "page";
    /// Reverse file index
    pub const FILE_INDEX: &str = "fileIndex";
    /// `identifier|communication-address|task-address`
    pub const IPC_ADDRESS: &str = "ipcAddress";
    /// Worker log folder
    pub const LOG_PATH: &str = "logPath";
    /// Downloader input folder
    pub const DOWNLOAD_INPUT_PATH: &str = "downloadInputPath";
    /// Worker database folder
    pub const DATABASE_PATH: &str = "databasePath";
    /// Member-data dump file
    pub const MEMBER_DATA_LIST: &str = "memberDataList";
    /// Every listed member id
    pub const MEMBER_IDS: &str = "memberIds";
    /// Unarchiver destination folder
    pub const DESTINATION: &str = "destination";
    /// Archive file or directory being processed
    pub const ARCHIVE: &str = "archive";
    /// File name of the archive being processed
    pub const ARCHIVE_NAME: &str = "archiveName";
    /// Every archive or directory (all-at-once mode)
    pub const ARCHIVES: &str = "archives";
}

#[allow(clippy::expect_used)]
static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("token pattern is valid"));

#[allow(clippy::expect_used)]
static PERCENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").expect("percent pattern is valid"));

/// Value substituted for a `${name}` placeholder
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenValue {
    /// Replaced in place
    Single(String),
    /// Expanded into one argument per element when an argument is exactly
    /// the placeholder, otherwise joined with spaces
    List(Vec<String>),
}

/// Placeholder values for one command line
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tokens {
    values: HashMap<String, TokenValue>,
}

impl Tokens {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single-valued placeholder
    pub fn with(mut self, name: &str, value: impl ToString) -> Self {
        self.values
            .insert(name.to_string(), TokenValue::Single(value.to_string()));
        self
    }

    /// Add a path placeholder
    pub fn with_path(self, name: &str, path: &Path) -> Self {
        self.with(name, path.display())
    }

    /// Add a list-valued placeholder
    pub fn with_list<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.values.insert(
            name.to_string(),
            TokenValue::List(values.into_iter().map(|v| v.to_string()).collect()),
        );
        self
    }

    /// Substitute placeholders in every argument of `template`
    ///
    /// Unknown placeholders are left untouched.
    pub fn expand(&self, template: &[String]) -> Vec<String> {
        let mut args = Vec::with_capacity(template.len());
        for arg in template {
            if let Some(caps) = TOKEN_PATTERN.captures(arg)
                && caps.get(0).is_some_and(|m| m.as_str() == arg.as_str())
                && let Some(TokenValue::List(items)) = self.values.get(&caps[1])
            {
                args.extend(items.iter().cloned());
                continue;
            }

            let expanded = TOKEN_PATTERN.replace_all(arg, |caps: &regex::Captures<'_>| {
                match self.values.get(&caps[1]) {
                    Some(TokenValue::Single(value)) => value.clone(),
                    Some(TokenValue::List(items)) => items.join(" "),
                    None => caps[0].to_string(),
                }
            });
            args.push(expanded.into_owned());
        }
        args
    }
}

/// Extract a `NN%` progress figure from a line of tool output
pub fn parse_percent_progress(line: &str) -> Option<u8> {
    PERCENT_PATTERN
        .captures(line)
        .and_then(|caps| caps[1].parse::<u16>().ok())
        .filter(|value| *value <= 100)
        .map(|value| value as u8)
}

/// Resolve an executable path, searching `PATH` for bare names
pub fn resolve_executable(executable: &Path) -> Result<PathBuf> {
    if executable.components().count() > 1 || executable.is_absolute() {
        if executable.exists() {
            return Ok(executable.to_path_buf());
        }
        return Err(Error::ExternalTool(format!(
            "executable not found: {}",
            executable.display()
        )));
    }
    which::which(executable).map_err(|e| {
        Error::ExternalTool(format!("{} not found in PATH: {}", executable.display(), e))
    })
}

/// A fully expanded command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to run
    pub program: PathBuf,
    /// Arguments, already expanded
    pub args: Vec<String>,
    /// Working directory (inherits ours when None)
    pub working_dir: Option<PathBuf>,
    /// Short description used in logs
    pub label: String,
    /// Scan output for `NN%` progress figures
    pub report_progress: bool,
}

impl CommandSpec {
    /// Create a spec for `program` with `args`
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let program = program.into();
        let label = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        Self {
            program,
            args,
            working_dir: None,
            label,
            report_progress: false,
        }
    }

    /// Set the working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the log label
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Enable progress scanning of the output
    pub fn with_progress(mut self) -> Self {
        self.report_progress = true;
        self
    }
}

/// Launches external processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run `spec` to completion and return its exit code
    ///
    /// Dropping the returned future kills the process.
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<i32>;
}

/// Launcher backed by `tokio::process`
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioProcessLauncher;

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<i32> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        tracing::debug!(
            label = %spec.label,
            program = %spec.program.display(),
            args = ?spec.args,
            "launching process"
        );
        let mut child = command.spawn()?;

        let stdout = drain(child.stdout.take(), &spec.label, spec.report_progress);
        let stderr = drain(child.stderr.take(), &spec.label, spec.report_progress);
        let (status, _, _) = tokio::join!(child.wait(), stdout, stderr);
        let status = status?;

        let code = exit_code(&status);
        tracing::debug!(label = %spec.label, code, "process exited");
        Ok(code)
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

async fn drain<R>(stream: Option<R>, label: &str, report_progress: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut segments = (&mut reader).split(b'\n');
    let mut last_percent = None;
    loop {
        let segment = match segments.next_segment().await {
            Ok(Some(segment)) => segment,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(label, error = %e, "failed to read process output, discarding the rest");
                break;
            }
        };
        let text = String::from_utf8_lossy(&segment);
        // progress meters redraw the line with carriage returns
        for line in text.split('\r').map(str::trim).filter(|l| !l.is_empty()) {
            if report_progress
                && let Some(percent) = parse_percent_progress(line)
            {
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    tracing::info!(label, percent, "progress");
                }
                continue;
            }
            tracing::trace!(label, line, "output");
        }
    }

    // the child blocks on a full pipe unless it is read to the end
    drop(segments);
    if let Err(e) = tokio::io::copy_buf(&mut reader, &mut tokio::io::sink()).await {
        tracing::debug!(label, error = %e, "stopped draining process output");
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Fails the first read, then serves `data` and records reaching the end
    struct FailsOnce {
        failed: bool,
        data: &'static [u8],
        reached_end: Arc<AtomicBool>,
    }

    impl AsyncRead for FailsOnce {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if !self.failed {
                self.failed = true;
                return Poll::Ready(Err(std::io::Error::other("broken read")));
            }
            if self.data.is_empty() {
                self.reached_end.store(true, Ordering::SeqCst);
                return Poll::Ready(Ok(()));
            }
            let n = self.data.len().min(buf.remaining());
            buf.put_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn drain_reads_to_the_end_after_a_read_error() {
        let reached_end = Arc::new(AtomicBool::new(false));
        let stream = FailsOnce {
            failed: false,
            data: b"\xff\xfe not utf-8\n42%\nmore output\n",
            reached_end: Arc::clone(&reached_end),
        };
        drain(Some(stream), "test", true).await;
        assert!(reached_end.load(Ordering::SeqCst));
    }

    fn template(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn expands_single_tokens_in_place() {
        let tokens = Tokens::new()
            .with(token::MEMBER_ID, 42)
            .with(token::FILE_INDEX, 3)
            .with(token::LOG_PATH, "/logs");
        let args = tokens.expand(&template(&[
            "-s",
            "${memberId}",
            "-l${logPath}/extractor.${memberId}.p${fileIndex}.log",
        ]));
        assert_eq!(args, vec!["-s", "42", "-l/logs/extractor.42.p3.log"]);
    }

    #[test]
    fn list_token_expands_into_separate_arguments() {
        let tokens = Tokens::new().with_list(token::MEMBER_IDS, [1, 2, 3]);
        let args = tokens.expand(&template(&["q", "${memberIds}", "x=${memberIds}"]));
        assert_eq!(args, vec!["q", "1", "2", "3", "x=1 2 3"]);
    }

    #[test]
    fn unknown_tokens_are_kept() {
        let args = Tokens::new().expand(&template(&["${nope}", "plain"]));
        assert_eq!(args, vec!["${nope}", "plain"]);
    }

    #[test]
    fn percent_progress_parsing() {
        assert_eq!(parse_percent_progress("  93% 41 + file.jpg"), Some(93));
        assert_eq!(parse_percent_progress("5%"), Some(5));
        assert_eq!(parse_percent_progress("100%"), Some(100));
        assert_eq!(parse_percent_progress("no progress here"), None);
        assert_eq!(parse_percent_progress("% only"), None);
    }

    #[test]
    fn command_spec_defaults_label_to_file_name() {
        let spec = CommandSpec::new("/usr/bin/7z", vec![]);
        assert_eq!(spec.label, "7z");
        assert!(spec.working_dir.is_none());
        let spec = spec.working_dir("/tmp").label("archive 1").with_progress();
        assert_eq!(spec.label, "archive 1");
        assert!(spec.report_progress);
    }

    #[test]
    fn resolve_missing_executable_fails() {
        let err = resolve_executable(Path::new("/definitely/not/here/tool")).unwrap_err();
        assert!(matches!(err, Error::ExternalTool(_)));
        assert!(resolve_executable(Path::new("nonexistent-stagehand-tool-xyz")).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_launcher_reports_exit_code() {
        let launcher = TokioProcessLauncher;
        let ok = CommandSpec::new("sh", template(&["-c", "echo 50%; exit 0"])).with_progress();
        assert_eq!(launcher.run(&ok).await.unwrap(), 0);

        let failing = CommandSpec::new("sh", template(&["-c", "echo oops >&2; exit 7"]));
        assert_eq!(launcher.run(&failing).await.unwrap(), 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_launcher_uses_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("sh", template(&["-c", "touch marker"])).working_dir(dir.path());
        assert_eq!(TokioProcessLauncher.run(&spec).await.unwrap(), 0);
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn tokio_launcher_spawn_failure_is_io_error() {
        let spec = CommandSpec::new("nonexistent-stagehand-tool-xyz", vec![]);
        let err = TokioProcessLauncher.run(&spec).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
