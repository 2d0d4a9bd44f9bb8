//! Phase scheduler
//!
//! Drives a run through its fixed phase order:
//!
//! 1. unarchive existing archives (auto-archive only)
//! 2. dump member data (single extractor call) and parse members/pages
//! 3. extract pages, with the download-input queue timer running
//! 4. flush the download-input queue
//! 5. download pages
//! 6. post-process pages (or members)
//! 7. re-enumerate, archive, copy to repository, clean up (auto-archive only)
//!
//! Each parallel phase is a join barrier: the next phase starts only after
//! every item of the previous one has finished.

pub mod archive;
pub mod members;
pub mod phase;

pub use phase::run_phase;

use crate::broker::FfmpegRunner;
use crate::config::{ArchiverConfig, Config};
use crate::context::OrchestrationContext;
use crate::download_queue::{AppendSink, FileAppendSink};
use crate::error::{PipelineError, Result};
use crate::ipc::ProgressRegistry;
use crate::process::{
    CommandSpec, ProcessLauncher, TokioProcessLauncher, Tokens, resolve_executable, token,
};
use crate::types::{ItemOutcome, Member, Page, PhaseReport, PhaseToggles, RunSummary};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identifier the member-data dump uses in its handshake
const MEMBER_DATA_IDENTIFIER: &str = "memberdata";

/// How the extractor is launched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractorCommand {
    /// Program (interpreter or extractor executable)
    pub program: PathBuf,
    /// Arguments placed before the expanded template (the script path)
    pub leading_args: Vec<String>,
    /// Working directory for extractor, downloader and sub-work processes
    pub working_dir: PathBuf,
}

impl ExtractorCommand {
    /// Resolve the extractor from the configuration
    ///
    /// A configured script that exists wins over the executable. An explicit
    /// executable path that does not exist is fatal; a bare name missing from
    /// `PATH` is only logged.
    pub fn resolve(config: &Config) -> std::result::Result<Self, PipelineError> {
        let extractor = &config.extractor;
        if let Some(script) = &extractor.python_script {
            if script.is_file() {
                return Ok(Self {
                    program: extractor.python_executable.clone(),
                    leading_args: vec![script.display().to_string()],
                    working_dir: parent_or_current(script),
                });
            }
            tracing::warn!(script = %script.display(), "extractor script not found, using executable");
        }

        let executable = &extractor.executable;
        let explicit = executable.components().count() > 1 || executable.is_absolute();
        match resolve_executable(executable) {
            Ok(_) => {}
            Err(e) if explicit => return Err(PipelineError::ExtractorUnavailable(e.to_string())),
            Err(e) => tracing::warn!(error = %e, "extractor not found, launches will fail"),
        }
        Ok(Self {
            program: executable.clone(),
            leading_args: Vec::new(),
            working_dir: parent_or_current(executable),
        })
    }

    fn spec(&self, args: Vec<String>) -> CommandSpec {
        let mut full = self.leading_args.clone();
        full.extend(args);
        CommandSpec::new(&self.program, full).working_dir(&self.working_dir)
    }
}

fn parent_or_current(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Launches processes on behalf of phase items
#[derive(Clone)]
struct Worker {
    launcher: Arc<dyn ProcessLauncher>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(&self, spec: CommandSpec) -> ItemOutcome {
        tokio::select! {
            result = self.launcher.run(&spec) => match result {
                Ok(code) => {
                    if code != 0 {
                        tracing::warn!(label = %spec.label, code, "process exited with failure");
                    }
                    ItemOutcome::from_exit_code(code)
                }
                Err(e) => {
                    tracing::error!(label = %spec.label, error = %e, "failed to launch process");
                    ItemOutcome::Failed {
                        exit_code: None,
                        reason: format!("failed to launch {}: {}", spec.program.display(), e),
                    }
                }
            },
            _ = self.cancel.cancelled() => ItemOutcome::Failed {
                exit_code: None,
                reason: "cancelled".into(),
            },
        }
    }
}

/// Per-page command line builder
struct PageCommand {
    program: PathBuf,
    leading_args: Vec<String>,
    working_dir: PathBuf,
    template: Vec<String>,
    tokens: Tokens,
    communication: String,
    task: String,
    kind: &'static str,
}

impl PageCommand {
    fn spec(&self, page: &Page) -> CommandSpec {
        let identifier = page.identifier();
        let tokens = self
            .tokens
            .clone()
            .with(token::MEMBER_ID, page.member)
            .with(token::PAGE, page.number)
            .with(token::FILE_INDEX, page.file_index)
            .with(
                token::IPC_ADDRESS,
                format!("{}|{}|{}", identifier, self.communication, self.task),
            );
        let mut args = self.leading_args.clone();
        args.extend(tokens.expand(&self.template));
        CommandSpec::new(&self.program, args)
            .working_dir(&self.working_dir)
            .label(format!("{} {}", self.kind, page))
    }
}

/// A configured pipeline, ready to run
pub struct Pipeline {
    config: Arc<Config>,
    launcher: Arc<dyn ProcessLauncher>,
    sink: Arc<dyn AppendSink>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Create a pipeline launching real processes and writing real files
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            launcher: Arc::new(TokioProcessLauncher),
            sink: Arc::new(FileAppendSink),
            cancel,
        }
    }

    /// Replace the process launcher
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Replace the download-input sink
    pub fn with_sink(mut self, sink: Arc<dyn AppendSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run every enabled phase
    ///
    /// Per-item failures are reported in the summary; only fatal conditions
    /// (unreadable list file, failed or missing member-data dump, endpoint bind failure,
    /// unavailable extractor, cancellation) return an error.
    pub async fn run(&self, toggles: PhaseToggles) -> Result<RunSummary> {
        let config = &self.config;
        let extractor = ExtractorCommand::resolve(config)?;
        let member_ids = members::read_list_file(&config.list_file)?;
        tracing::info!(members = member_ids.len(), toggles = ?toggles, "starting run");

        for folder in config.required_folders() {
            tokio::fs::create_dir_all(folder).await?;
        }

        let runner = FfmpegRunner::new(
            Arc::clone(&self.launcher),
            config.subwork.executable.clone(),
            extractor.working_dir.clone(),
        );
        let mut context = OrchestrationContext::new(
            config,
            Arc::new(runner),
            Arc::clone(&self.sink),
            self.cancel.child_token(),
        );
        context
            .start(
                &config.ipc.communication_address(),
                &config.ipc.task_address(),
            )
            .await?;

        let result = self
            .run_phases(&context, &extractor, &member_ids, toggles)
            .await;
        context.stop().await;

        match &result {
            Ok(summary) => tracing::info!(
                members = summary.members,
                pages = summary.pages,
                processed = summary.processed_notifications,
                "run finished"
            ),
            Err(e) => tracing::error!(fatal = true, error = %e, code = e.error_code(), "run aborted"),
        }
        result
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled.into());
        }
        Ok(())
    }

    fn worker(&self) -> Worker {
        Worker {
            launcher: Arc::clone(&self.launcher),
            cancel: self.cancel.clone(),
        }
    }

    fn base_tokens(&self) -> Tokens {
        let config = &self.config;
        Tokens::new()
            .with_path(token::LOG_PATH, &config.log_folder)
            .with_path(token::DOWNLOAD_INPUT_PATH, &config.download_input_folder)
            .with_path(token::DATABASE_PATH, &config.database_folder)
            .with_path(token::MEMBER_DATA_LIST, &config.member_data_file)
    }

    async fn run_phases(
        &self,
        context: &OrchestrationContext,
        extractor: &ExtractorCommand,
        member_ids: &[crate::types::MemberId],
        toggles: PhaseToggles,
    ) -> Result<RunSummary> {
        let config = &self.config;
        let mut summary = RunSummary::default();

        if config.auto_archive && !toggles.skip_unarchive {
            self.check_cancelled()?;
            summary.phases.push(self.unarchive(member_ids).await);
        }

        self.check_cancelled()?;
        summary
            .phases
            .push(self.dump_member_data(context, extractor, member_ids).await?);
        let members = members::read_member_data(&config.member_data_file, config.max_images_per_page)?;
        let pages: Vec<Page> = members.iter().flat_map(|m| m.pages.iter().copied()).collect();
        summary.members = members.len();
        summary.pages = pages.len();
        summary.items = members.iter().map(|m| u64::from(m.total_items)).sum();
        tracing::info!(
            members = summary.members,
            pages = summary.pages,
            items = summary.items,
            "member data parsed"
        );

        if !toggles.skip_extract {
            self.check_cancelled()?;
            let queue = context.queue();
            queue.begin_timer(config.extractor.flush_delay, config.extractor.flush_period);
            let command = self.page_command(
                context,
                "extract",
                extractor,
                extractor.program.clone(),
                extractor.leading_args.clone(),
                config.extractor.parameters.clone(),
            );
            let outcomes = self
                .page_phase("extract", pages.clone(), config.parallelism.extractor, command, Some(context.progress()))
                .await;
            summary.phases.push(PhaseReport::from_outcomes("extract", &outcomes));
            queue.end_timer().await;
        }
        let flushed = context.queue().flush().await;
        if flushed.retried > 0 {
            tracing::warn!(destinations = flushed.retried, "download input could not be fully written");
        }

        if !toggles.skip_download {
            self.check_cancelled()?;
            let command = self.page_command(
                context,
                "download",
                extractor,
                config.downloader.executable.clone(),
                Vec::new(),
                config.downloader.parameters.clone(),
            );
            let outcomes = self
                .page_phase("download", pages.clone(), config.parallelism.downloader, command, None)
                .await;
            summary.phases.push(PhaseReport::from_outcomes("download", &outcomes));
        }

        if !toggles.skip_postprocess {
            self.check_cancelled()?;
            let targets = postprocess_targets(&members, config.postprocessor.per_page);
            let command = self.page_command(
                context,
                "postprocess",
                extractor,
                extractor.program.clone(),
                extractor.leading_args.clone(),
                config.postprocessor.parameters.clone(),
            );
            let outcomes = self
                .page_phase(
                    "postprocess",
                    targets,
                    config.parallelism.postprocessor,
                    command,
                    Some(context.progress()),
                )
                .await;
            summary.phases.push(PhaseReport::from_outcomes("postprocess", &outcomes));
        }

        if config.auto_archive && !toggles.skip_rearchive {
            self.check_cancelled()?;
            let (report, ok) = self.rearchive().await;
            if let Some(report) = report {
                summary.phases.push(report);
            }
            summary.archive_chain_ok = Some(ok);
        }

        summary.processed_notifications = context.progress().processed();
        Ok(summary)
    }

    async fn dump_member_data(
        &self,
        context: &OrchestrationContext,
        extractor: &ExtractorCommand,
        member_ids: &[crate::types::MemberId],
    ) -> Result<PhaseReport> {
        let dump = &self.config.member_data_file;
        if tokio::fs::try_exists(dump).await? {
            tracing::info!(path = %dump.display(), "removing previous member data dump");
            tokio::fs::remove_file(dump).await?;
        }

        let tokens = self
            .base_tokens()
            .with_list(token::MEMBER_IDS, member_ids.iter())
            .with(token::IPC_ADDRESS, context.ipc_address(MEMBER_DATA_IDENTIFIER));
        let spec = extractor
            .spec(tokens.expand(&self.config.member_list_extractor.parameters))
            .label("member data dump");

        tracing::info!(members = member_ids.len(), "retrieving member data");
        let outcome = self.worker().run(spec).await;
        if let ItemOutcome::Failed { reason, .. } = outcome {
            return Err(PipelineError::MemberDataExtractionFailed(reason).into());
        }
        Ok(PhaseReport::from_outcomes("member-data", &[outcome]))
    }

    fn page_command(
        &self,
        context: &OrchestrationContext,
        kind: &'static str,
        extractor: &ExtractorCommand,
        program: PathBuf,
        leading_args: Vec<String>,
        template: Vec<String>,
    ) -> Arc<PageCommand> {
        Arc::new(PageCommand {
            program,
            leading_args,
            working_dir: extractor.working_dir.clone(),
            template,
            tokens: self.base_tokens(),
            communication: context.communication_address().unwrap_or_default().to_string(),
            task: context.task_address().unwrap_or_default().to_string(),
            kind,
        })
    }

    async fn page_phase(
        &self,
        name: &str,
        pages: Vec<Page>,
        max_parallel: usize,
        command: Arc<PageCommand>,
        progress: Option<&Arc<ProgressRegistry>>,
    ) -> Vec<ItemOutcome> {
        let worker = self.worker();
        let progress = progress.cloned();
        run_phase(name, pages, max_parallel, move |page: Page| {
            let worker = worker.clone();
            let command = Arc::clone(&command);
            let progress = progress.clone();
            async move {
                let handle = progress.map(|registry| registry.register(page.identifier()));
                let outcome = worker.run(command.spec(&page)).await;
                if let Some(handle) = &handle {
                    handle.finish(outcome.is_success());
                }
                outcome
            }
        })
        .await
    }

    async fn unarchive(&self, member_ids: &[crate::types::MemberId]) -> PhaseReport {
        let archive = &self.config.archive;
        let copied = match archive::copy_from_repository(archive, member_ids).await {
            Ok(copied) => copied,
            Err(e) => {
                tracing::error!(error = %e, "failed to copy existing archives");
                return PhaseReport::from_outcomes(
                    "unarchive",
                    &[ItemOutcome::Failed {
                        exit_code: None,
                        reason: e.to_string(),
                    }],
                );
            }
        };
        tracing::info!(archives = copied.len(), "unarchiving existing archives");
        let outcomes = self
            .run_archiver(
                "unarchive",
                &self.config.unarchiver,
                copied,
                self.config.parallelism.unarchiver,
            )
            .await;
        PhaseReport::from_outcomes("unarchive", &outcomes)
    }

    async fn rearchive(&self) -> (Option<PhaseReport>, bool) {
        let archive = &self.config.archive;
        let directories = match archive::reenumerate_directories(archive) {
            Ok(directories) => directories,
            Err(e) => {
                tracing::error!(error = %e, "failed to enumerate member directories");
                return (None, false);
            }
        };

        let outcomes = self
            .run_archiver(
                "archive",
                &self.config.archiver,
                directories.clone(),
                self.config.parallelism.archiver,
            )
            .await;
        let report = PhaseReport::from_outcomes("archive", &outcomes);
        let mut successful = report.all_succeeded();

        if let Err(e) = archive::copy_to_repository(archive, &directories).await {
            tracing::error!(error = %e, "failed to copy archives to the repository");
            successful = false;
        }

        if successful && archive.delete_working_after_execution {
            tracing::info!("every archive step succeeded, deleting working folders");
            if let Err(e) = archive::delete_working_folders(archive).await {
                tracing::error!(error = %e, "failed to delete working folders");
            }
        } else if !successful {
            tracing::warn!("archive chain had failures, keeping working folders");
        }

        (Some(report), successful)
    }

    async fn run_archiver(
        &self,
        name: &str,
        archiver: &ArchiverConfig,
        targets: Vec<PathBuf>,
        max_parallel: usize,
    ) -> Vec<ItemOutcome> {
        let working_dir = self.config.archive.working_folder.clone();
        let base = Tokens::new().with_path(token::DESTINATION, &working_dir);
        let worker = self.worker();

        if archiver.all_at_once {
            if targets.is_empty() {
                return Vec::new();
            }
            let tokens = base.with_list(token::ARCHIVES, targets.iter().map(|t| t.display()));
            let spec = CommandSpec::new(&archiver.executable, tokens.expand(&archiver.parameters))
                .working_dir(&working_dir)
                .label(format!("{name} (all)"))
                .with_progress();
            return vec![worker.run(spec).await];
        }

        let executable = archiver.executable.clone();
        let template = Arc::new(archiver.parameters.clone());
        let label = name.to_string();
        run_phase(name, targets, max_parallel, move |target: PathBuf| {
            let tokens = base
                .clone()
                .with_path(token::ARCHIVE, &target)
                .with(
                    token::ARCHIVE_NAME,
                    target
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                );
            let spec = CommandSpec::new(&executable, tokens.expand(&template))
                .working_dir(&working_dir)
                .label(format!("{} {}", label, target.display()))
                .with_progress();
            let worker = worker.clone();
            async move { worker.run(spec).await }
        })
        .await
    }
}

/// Pages the post-processor runs for: every page, or each member's first page
pub fn postprocess_targets(members: &[Member], per_page: bool) -> Vec<Page> {
    if per_page {
        return members.iter().flat_map(|m| m.pages.iter().copied()).collect();
    }
    tracing::info!("post-processing once per member");
    let mut seen = HashSet::new();
    members
        .iter()
        .flat_map(|m| m.pages.first().copied())
        .filter(|page| seen.insert(page.member))
        .collect()
}
