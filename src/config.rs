//! Configuration types for stagehand
//!
//! The configuration is a single JSON document. Every field has a default, so an
//! empty object (`{}`) is a valid configuration; `--generate-config` writes the
//! fully populated defaults for editing.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bounds on concurrent executions per phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelismConfig {
    /// Concurrent page extractions (default: 8)
    #[serde(default = "default_extractor_parallelism")]
    pub extractor: usize,

    /// Concurrent downloader processes (default: 4)
    #[serde(default = "default_downloader_parallelism")]
    pub downloader: usize,

    /// Concurrent post-processor processes (default: 16)
    #[serde(default = "default_postprocessor_parallelism")]
    pub postprocessor: usize,

    /// Concurrent brokered sub-work executions (default: 4)
    #[serde(default = "default_subwork_parallelism")]
    pub subwork: usize,

    /// Concurrent unarchiver processes (default: 4)
    #[serde(default = "default_archiver_parallelism")]
    pub unarchiver: usize,

    /// Concurrent archiver processes (default: 4)
    #[serde(default = "default_archiver_parallelism")]
    pub archiver: usize,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            extractor: default_extractor_parallelism(),
            downloader: default_downloader_parallelism(),
            postprocessor: default_postprocessor_parallelism(),
            subwork: default_subwork_parallelism(),
            unarchiver: default_archiver_parallelism(),
            archiver: default_archiver_parallelism(),
        }
    }
}

/// Control-plane endpoint settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Host the ROUTER sockets bind to (default: "127.0.0.1")
    #[serde(default = "default_ipc_host")]
    pub host: String,

    /// Port of the Communication endpoint (default: 6974)
    #[serde(default = "default_communication_port")]
    pub communication_port: u16,

    /// Port of the Task Request endpoint (default: 7469)
    #[serde(default = "default_task_port")]
    pub task_port: u16,
}

impl IpcConfig {
    /// `tcp://` address of the Communication endpoint
    pub fn communication_address(&self) -> String {
        format!("tcp://{}:{}", self.host, self.communication_port)
    }

    /// `tcp://` address of the Task Request endpoint
    pub fn task_address(&self) -> String {
        format!("tcp://{}:{}", self.host, self.task_port)
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            host: default_ipc_host(),
            communication_port: default_communication_port(),
            task_port: default_task_port(),
        }
    }
}

/// Extractor (page retrieval) settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Extractor executable (default: "extractor")
    #[serde(default = "default_extractor_executable")]
    pub executable: PathBuf,

    /// Script run through `python_executable` instead of `executable`, if it exists
    #[serde(default)]
    pub python_script: Option<PathBuf>,

    /// Interpreter used for `python_script` (default: "python3")
    #[serde(default = "default_python_executable")]
    pub python_executable: PathBuf,

    /// Argument template for page extraction
    #[serde(default = "default_extractor_parameters")]
    pub parameters: Vec<String>,

    /// Delay before the first download-input flush, in milliseconds (default: 1000)
    #[serde(default = "default_flush_delay", with = "millis_serde")]
    pub flush_delay: Duration,

    /// Period between download-input flushes, in milliseconds (default: 5000)
    #[serde(default = "default_flush_period", with = "millis_serde")]
    pub flush_period: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            executable: default_extractor_executable(),
            python_script: None,
            python_executable: default_python_executable(),
            parameters: default_extractor_parameters(),
            flush_delay: default_flush_delay(),
            flush_period: default_flush_period(),
        }
    }
}

/// Member-data dump settings (single extractor call before the page phases)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberListExtractorConfig {
    /// Argument template for the member-data dump
    #[serde(default = "default_member_list_parameters")]
    pub parameters: Vec<String>,
}

impl Default for MemberListExtractorConfig {
    fn default() -> Self {
        Self {
            parameters: default_member_list_parameters(),
        }
    }
}

/// Downloader settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Downloader executable (default: "aria2c")
    #[serde(default = "default_downloader_executable")]
    pub executable: PathBuf,

    /// Argument template for the download phase
    #[serde(default = "default_downloader_parameters")]
    pub parameters: Vec<String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            executable: default_downloader_executable(),
            parameters: default_downloader_parameters(),
        }
    }
}

/// Post-processor settings (runs the extractor in post-processing mode)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostprocessorConfig {
    /// Argument template for post-processing
    #[serde(default = "default_postprocessor_parameters")]
    pub parameters: Vec<String>,

    /// Run once per page (true) or once per member (false) (default: true)
    #[serde(default = "default_true")]
    pub per_page: bool,
}

impl Default for PostprocessorConfig {
    fn default() -> Self {
        Self {
            parameters: default_postprocessor_parameters(),
            per_page: true,
        }
    }
}

/// Brokered sub-work (transcoding) settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubworkConfig {
    /// Transcoder executable (default: "ffmpeg")
    #[serde(default = "default_ffmpeg_executable")]
    pub executable: PathBuf,

    /// Kill an execution after this many seconds (None = no deadline)
    #[serde(default, with = "optional_duration_serde")]
    pub timeout: Option<Duration>,
}

impl Default for SubworkConfig {
    fn default() -> Self {
        Self {
            executable: default_ffmpeg_executable(),
            timeout: None,
        }
    }
}

/// Archive repository and working folder layout
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Folder the unarchiver extracts into and the archiver reads from
    #[serde(default = "default_working_folder")]
    pub working_folder: PathBuf,

    /// Folder existing archives are copied to before unarchiving
    #[serde(default = "default_backup_folder")]
    pub backup_folder: PathBuf,

    /// Repository folder holding the archives between runs
    #[serde(default = "default_archive_folder")]
    pub archive_folder: PathBuf,

    /// Wildcard selecting archives in the repository (default: "*.7z")
    #[serde(default = "default_archive_wildcard")]
    pub archive_format_wildcard: String,

    /// Optional regex archive file names must also match
    #[serde(default)]
    pub archive_format_regex: Option<String>,

    /// Only search the top level of the repository (default: true)
    #[serde(default = "default_true")]
    pub search_top_directory_only: bool,

    /// Wildcard selecting member directories in the working folder (default: "*")
    #[serde(default = "default_directory_wildcard")]
    pub directory_format_wildcard: String,

    /// Optional regex directory names must also match
    #[serde(default)]
    pub directory_format_regex: Option<String>,

    /// Extension the archiver produces, without dot (default: "7z")
    #[serde(default = "default_archive_extension")]
    pub archive_extension: String,

    /// Delete working and backup folders after a fully successful archive chain
    #[serde(default)]
    pub delete_working_after_execution: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            working_folder: default_working_folder(),
            backup_folder: default_backup_folder(),
            archive_folder: default_archive_folder(),
            archive_format_wildcard: default_archive_wildcard(),
            archive_format_regex: None,
            search_top_directory_only: true,
            directory_format_wildcard: default_directory_wildcard(),
            directory_format_regex: None,
            archive_extension: default_archive_extension(),
            delete_working_after_execution: false,
        }
    }
}

/// Archiver or unarchiver invocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Archiver executable (default: "7z")
    #[serde(default = "default_archiver_executable")]
    pub executable: PathBuf,

    /// Argument template
    pub parameters: Vec<String>,

    /// Invoke once with every archive (`${archives}`) instead of once per archive
    #[serde(default)]
    pub all_at_once: bool,
}

impl ArchiverConfig {
    fn default_archiver() -> Self {
        Self {
            executable: default_archiver_executable(),
            parameters: vec![
                "a".into(),
                "-t7z".into(),
                "-mx=9".into(),
                "-bsp1".into(),
                "${archive}.7z".into(),
                "${archive}".into(),
            ],
            all_at_once: false,
        }
    }

    fn default_unarchiver() -> Self {
        Self {
            executable: default_archiver_executable(),
            parameters: vec![
                "x".into(),
                "-aoa".into(),
                "-bsp1".into(),
                "-o${destination}".into(),
                "${archive}".into(),
            ],
            all_at_once: false,
        }
    }
}

/// Main configuration
///
/// Fields are organized into sub-configs per external collaborator. Folder paths
/// may be relative in the document; [`Config::sanitize_paths`] makes them absolute
/// so that tokens handed to workers never depend on their working directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// File listing one member id per line (default: "list.txt")
    #[serde(default = "default_list_file")]
    pub list_file: PathBuf,

    /// Member-data dump produced by the member list extractor (default: "memberdata.txt")
    #[serde(default = "default_member_data_file")]
    pub member_data_file: PathBuf,

    /// Folder for worker log files (default: "logs")
    #[serde(default = "default_log_folder")]
    pub log_folder: PathBuf,

    /// Folder for downloader input files (default: "download-input")
    #[serde(default = "default_download_input_folder")]
    pub download_input_folder: PathBuf,

    /// Folder for per-page worker databases (default: "databases")
    #[serde(default = "default_database_folder")]
    pub database_folder: PathBuf,

    /// Items per extractor page (default: 48)
    #[serde(default = "default_max_images_per_page")]
    pub max_images_per_page: u32,

    /// Enable the unarchive / re-archive steps
    #[serde(default)]
    pub auto_archive: bool,

    /// Per-phase parallelism bounds
    #[serde(default)]
    pub parallelism: ParallelismConfig,

    /// Control-plane endpoints
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Page extractor
    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Member-data dump
    #[serde(default)]
    pub member_list_extractor: MemberListExtractorConfig,

    /// Downloader
    #[serde(default)]
    pub downloader: DownloaderConfig,

    /// Post-processor
    #[serde(default)]
    pub postprocessor: PostprocessorConfig,

    /// Brokered sub-work
    #[serde(default)]
    pub subwork: SubworkConfig,

    /// Archive folders and filters
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Archiver
    #[serde(default = "ArchiverConfig::default_archiver")]
    pub archiver: ArchiverConfig,

    /// Unarchiver
    #[serde(default = "ArchiverConfig::default_unarchiver")]
    pub unarchiver: ArchiverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            list_file: default_list_file(),
            member_data_file: default_member_data_file(),
            log_folder: default_log_folder(),
            download_input_folder: default_download_input_folder(),
            database_folder: default_database_folder(),
            max_images_per_page: default_max_images_per_page(),
            auto_archive: false,
            parallelism: ParallelismConfig::default(),
            ipc: IpcConfig::default(),
            extractor: ExtractorConfig::default(),
            member_list_extractor: MemberListExtractorConfig::default(),
            downloader: DownloaderConfig::default(),
            postprocessor: PostprocessorConfig::default(),
            subwork: SubworkConfig::default(),
            archive: ArchiveConfig::default(),
            archiver: ArchiverConfig::default_archiver(),
            unarchiver: ArchiverConfig::default_unarchiver(),
        }
    }
}

impl Config {
    /// Load, validate and sanitize a configuration document
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let mut config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        config.sanitize_paths()?;
        Ok(config)
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(&Config::default())?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let bounds = [
            ("parallelism.extractor", self.parallelism.extractor),
            ("parallelism.downloader", self.parallelism.downloader),
            ("parallelism.postprocessor", self.parallelism.postprocessor),
            ("parallelism.subwork", self.parallelism.subwork),
            ("parallelism.unarchiver", self.parallelism.unarchiver),
            ("parallelism.archiver", self.parallelism.archiver),
        ];
        for (key, value) in bounds {
            if value == 0 {
                return Err(Error::Config {
                    message: format!("{key} must be at least 1"),
                    key: Some(key.to_string()),
                });
            }
        }

        if self.max_images_per_page == 0 {
            return Err(Error::Config {
                message: "max_images_per_page must be at least 1".into(),
                key: Some("max_images_per_page".into()),
            });
        }

        if self.ipc.communication_port == self.ipc.task_port && self.ipc.task_port != 0 {
            return Err(Error::Config {
                message: "communication and task endpoints must use different ports".into(),
                key: Some("ipc.task_port".into()),
            });
        }

        for (key, pattern) in [
            ("archive.archive_format_regex", &self.archive.archive_format_regex),
            ("archive.directory_format_regex", &self.archive.directory_format_regex),
        ] {
            if let Some(pattern) = pattern
                && let Err(e) = regex::Regex::new(pattern)
            {
                return Err(Error::Config {
                    message: format!("invalid regex: {e}"),
                    key: Some(key.to_string()),
                });
            }
        }

        Ok(())
    }

    /// Make every folder path absolute
    pub fn sanitize_paths(&mut self) -> Result<()> {
        self.list_file = std::path::absolute(&self.list_file)?;
        self.member_data_file = std::path::absolute(&self.member_data_file)?;
        self.log_folder = std::path::absolute(&self.log_folder)?;
        self.download_input_folder = std::path::absolute(&self.download_input_folder)?;
        self.database_folder = std::path::absolute(&self.database_folder)?;
        if self.auto_archive {
            self.archive.working_folder = std::path::absolute(&self.archive.working_folder)?;
            self.archive.backup_folder = std::path::absolute(&self.archive.backup_folder)?;
            self.archive.archive_folder = std::path::absolute(&self.archive.archive_folder)?;
        }
        Ok(())
    }

    /// Folders that must exist before the run starts
    pub fn required_folders(&self) -> Vec<&Path> {
        let mut folders = vec![
            self.log_folder.as_path(),
            self.download_input_folder.as_path(),
            self.database_folder.as_path(),
        ];
        if self.auto_archive {
            folders.push(self.archive.archive_folder.as_path());
            folders.push(self.archive.backup_folder.as_path());
            folders.push(self.archive.working_folder.as_path());
        }
        folders
    }
}

fn default_true() -> bool {
    true
}

fn default_extractor_parallelism() -> usize {
    8
}

fn default_downloader_parallelism() -> usize {
    4
}

fn default_postprocessor_parallelism() -> usize {
    16
}

fn default_subwork_parallelism() -> usize {
    4
}

fn default_archiver_parallelism() -> usize {
    4
}

fn default_ipc_host() -> String {
    "127.0.0.1".into()
}

fn default_communication_port() -> u16 {
    6974
}

fn default_task_port() -> u16 {
    7469
}

fn default_extractor_executable() -> PathBuf {
    PathBuf::from("extractor")
}

fn default_python_executable() -> PathBuf {
    PathBuf::from("python3")
}

fn default_extractor_parameters() -> Vec<String> {
    [
        "-s",
        "1",
        "${memberId}",
        "--sp=${page}",
        "--ep=${page}",
        "-x",
        "--pipe=${ipcAddress}",
        "--db=${databasePath}/${memberId}.p${fileIndex}.db",
        "-l",
        "${logPath}/extractor.${memberId}.p${fileIndex}.log",
        "--aria2=${downloadInputPath}/${memberId}.p${fileIndex}.txt",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_member_list_parameters() -> Vec<String> {
    [
        "-s",
        "q",
        "${memberDataList}",
        "${memberIds}",
        "-x",
        "-l",
        "${logPath}/dump-members.log",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_postprocessor_parameters() -> Vec<String> {
    [
        "-s",
        "1",
        "${memberId}",
        "--sp=${page}",
        "--ep=${page}",
        "-x",
        "--pipe=${ipcAddress}",
        "--db=${databasePath}/${memberId}.p${fileIndex}.db",
        "-l",
        "${logPath}/postprocessor.${memberId}.p${fileIndex}.log",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_downloader_executable() -> PathBuf {
    PathBuf::from("aria2c")
}

fn default_downloader_parameters() -> Vec<String> {
    [
        "-i${downloadInputPath}/${memberId}.p${fileIndex}.txt",
        "-l${logPath}/downloader.${memberId}.p${fileIndex}.log",
        "-j16",
        "-x2",
        "-m0",
        "-Rtrue",
        "--allow-overwrite=true",
        "--auto-file-renaming=false",
        "--auto-save-interval=15",
        "--conditional-get=true",
        "--retry-wait=10",
        "--no-file-allocation-limit=2M",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_ffmpeg_executable() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_archiver_executable() -> PathBuf {
    PathBuf::from("7z")
}

fn default_flush_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_flush_period() -> Duration {
    Duration::from_millis(5000)
}

fn default_working_folder() -> PathBuf {
    PathBuf::from("working")
}

fn default_backup_folder() -> PathBuf {
    PathBuf::from("backup")
}

fn default_archive_folder() -> PathBuf {
    PathBuf::from("archives")
}

fn default_archive_wildcard() -> String {
    "*.7z".into()
}

fn default_directory_wildcard() -> String {
    "*".into()
}

fn default_archive_extension() -> String {
    "7z".into()
}

fn default_list_file() -> PathBuf {
    PathBuf::from("list.txt")
}

fn default_member_data_file() -> PathBuf {
    PathBuf::from("memberdata.txt")
}

fn default_log_folder() -> PathBuf {
    PathBuf::from("logs")
}

fn default_download_input_folder() -> PathBuf {
    PathBuf::from("download-input")
}

fn default_database_folder() -> PathBuf {
    PathBuf::from("databases")
}

fn default_max_images_per_page() -> u32 {
    48
}

// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper (seconds)
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
