//! Archive repository steps
//!
//! Existing archives are copied from the repository into the backup folder
//! before the run and unarchived into the working folder. After the run the
//! member directories are re-archived and the archives copied back. Files that
//! would be overwritten are renamed to `<name>.<n>.bak` first.

use crate::config::ArchiveConfig;
use crate::error::{Error, Result};
use crate::types::MemberId;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

/// Rename an existing file to the first free `<path>.<n>.bak`
///
/// Returns the new name, or `path` unchanged if it did not exist.
pub async fn rolling_rename(path: &Path) -> Result<PathBuf> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(path.to_path_buf());
    }
    let mut n = 1u32;
    let renamed = loop {
        let candidate = PathBuf::from(format!("{}.{}.bak", path.display(), n));
        if !tokio::fs::try_exists(&candidate).await? {
            break candidate;
        }
        n += 1;
    };
    tokio::fs::rename(path, &renamed).await?;
    Ok(renamed)
}

fn compile(pattern: Option<&str>, key: &str) -> Result<Option<Regex>> {
    match pattern.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => Regex::new(p).map(Some).map_err(|e| Error::Config {
            message: format!("invalid regex: {e}"),
            key: Some(key.to_string()),
        }),
        None => Ok(None),
    }
}

fn glob_in(folder: &Path, recursive: bool, wildcard: &str) -> Result<Vec<PathBuf>> {
    let mut pattern = glob::Pattern::escape(&folder.display().to_string());
    if recursive {
        pattern.push_str("/**");
    }
    pattern.push('/');
    pattern.push_str(wildcard);

    let entries = glob::glob(&pattern).map_err(|e| Error::Config {
        message: format!("invalid wildcard {wildcard:?}: {e}"),
        key: None,
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => tracing::warn!(error = %e, "skipping unreadable path"),
        }
    }
    Ok(paths)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Repository archives belonging to `members`
///
/// An archive matches when its wildcard and optional regex match and its
/// file stem is one of the member ids.
pub fn find_repository_archives(config: &ArchiveConfig, members: &[MemberId]) -> Result<Vec<PathBuf>> {
    let regex = compile(
        config.archive_format_regex.as_deref(),
        "archive.archive_format_regex",
    )?;
    let wanted: HashSet<String> = members.iter().map(|m| m.to_string()).collect();

    tracing::info!(
        wildcard = %config.archive_format_wildcard,
        folder = %config.archive_folder.display(),
        "searching archive repository"
    );
    let found: BTreeSet<PathBuf> = glob_in(
        &config.archive_folder,
        !config.search_top_directory_only,
        &config.archive_format_wildcard,
    )?
    .into_iter()
    .filter(|path| path.is_file())
    .filter(|path| {
        path.file_stem()
            .is_some_and(|stem| wanted.contains(stem.to_string_lossy().as_ref()))
    })
    .filter(|path| regex.as_ref().is_none_or(|re| re.is_match(&file_name(path))))
    .collect();
    Ok(found.into_iter().collect())
}

/// Copy the members' archives from the repository into the backup folder
///
/// Returns the copied files in the backup folder.
pub async fn copy_from_repository(config: &ArchiveConfig, members: &[MemberId]) -> Result<Vec<PathBuf>> {
    let archives = find_repository_archives(config, members)?;
    let mut copied = Vec::with_capacity(archives.len());
    for archive in archives {
        let destination = config.backup_folder.join(file_name(&archive));
        if tokio::fs::try_exists(&destination).await? {
            let renamed = rolling_rename(&destination).await?;
            tracing::warn!(
                destination = %destination.display(),
                renamed = %renamed.display(),
                "backup already exists, renamed"
            );
        }
        tokio::fs::copy(&archive, &destination).await?;
        tracing::info!(from = %archive.display(), to = %destination.display(), "archive copied from repository");
        copied.push(destination);
    }
    Ok(copied)
}

/// Top-level member directories of the working folder
pub fn reenumerate_directories(config: &ArchiveConfig) -> Result<Vec<PathBuf>> {
    let regex = compile(
        config.directory_format_regex.as_deref(),
        "archive.directory_format_regex",
    )?;
    let mut directories: Vec<PathBuf> = glob_in(
        &config.working_folder,
        false,
        &config.directory_format_wildcard,
    )?
    .into_iter()
    .filter(|path| path.is_dir())
    .filter(|path| regex.as_ref().is_none_or(|re| re.is_match(&file_name(path))))
    .collect();
    directories.sort();
    directories.dedup();
    tracing::info!(count = directories.len(), "member directories enumerated");
    Ok(directories)
}

/// Archive produced for a member directory
pub fn archive_path(directory: &Path, extension: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", directory.display(), extension))
}

/// Copy the archives of `directories` into the repository
pub async fn copy_to_repository(config: &ArchiveConfig, directories: &[PathBuf]) -> Result<()> {
    for directory in directories {
        let archive = archive_path(directory, &config.archive_extension);
        let destination = config.archive_folder.join(file_name(&archive));
        if tokio::fs::try_exists(&destination).await? {
            let renamed = rolling_rename(&destination).await?;
            tracing::warn!(
                destination = %destination.display(),
                renamed = %renamed.display(),
                "repository archive already exists, renamed"
            );
        }
        tokio::fs::copy(&archive, &destination).await?;
        tracing::info!(from = %archive.display(), to = %destination.display(), "archive copied to repository");
    }
    Ok(())
}

/// Remove the working and backup folders
pub async fn delete_working_folders(config: &ArchiveConfig) -> Result<()> {
    for folder in [&config.working_folder, &config.backup_folder] {
        tracing::info!(folder = %folder.display(), "deleting folder");
        tokio::fs::remove_dir_all(folder).await?;
    }
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout() -> (TempDir, ArchiveConfig) {
        let root = tempfile::tempdir().unwrap();
        let config = ArchiveConfig {
            working_folder: root.path().join("working"),
            backup_folder: root.path().join("backup"),
            archive_folder: root.path().join("archives"),
            ..ArchiveConfig::default()
        };
        for dir in [&config.working_folder, &config.backup_folder, &config.archive_folder] {
            std::fs::create_dir_all(dir).unwrap();
        }
        (root, config)
    }

    #[tokio::test]
    async fn rolling_rename_picks_first_free_slot() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.7z");
        std::fs::write(&file, "v3").unwrap();
        std::fs::write(dir.path().join("a.7z.1.bak"), "v1").unwrap();

        let renamed = rolling_rename(&file).await.unwrap();
        assert_eq!(renamed, dir.path().join("a.7z.2.bak"));
        assert!(!file.exists());
        assert_eq!(std::fs::read_to_string(renamed).unwrap(), "v3");
    }

    #[tokio::test]
    async fn rolling_rename_of_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("none.7z");
        assert_eq!(rolling_rename(&file).await.unwrap(), file);
    }

    #[test]
    fn finds_only_listed_members_archives() {
        let (_root, mut config) = layout();
        for name in ["1.7z", "2.7z", "3.zip", "notes.7z"] {
            std::fs::write(config.archive_folder.join(name), name).unwrap();
        }
        std::fs::create_dir_all(config.archive_folder.join("nested")).unwrap();
        std::fs::write(config.archive_folder.join("nested").join("4.7z"), "4").unwrap();

        let members = [MemberId(1), MemberId(3), MemberId(4)];
        let found = find_repository_archives(&config, &members).unwrap();
        assert_eq!(found, vec![config.archive_folder.join("1.7z")]);

        config.search_top_directory_only = false;
        let found = find_repository_archives(&config, &members).unwrap();
        assert_eq!(found.len(), 2);

        config.archive_format_regex = Some("^4".into());
        let found = find_repository_archives(&config, &members).unwrap();
        assert_eq!(found, vec![config.archive_folder.join("nested").join("4.7z")]);
    }

    #[tokio::test]
    async fn copy_from_repository_backs_up_existing() {
        let (_root, config) = layout();
        std::fs::write(config.archive_folder.join("1.7z"), "new").unwrap();
        std::fs::write(config.backup_folder.join("1.7z"), "old").unwrap();

        let copied = copy_from_repository(&config, &[MemberId(1)]).await.unwrap();
        assert_eq!(copied, vec![config.backup_folder.join("1.7z")]);
        assert_eq!(std::fs::read_to_string(&copied[0]).unwrap(), "new");
        assert_eq!(
            std::fs::read_to_string(config.backup_folder.join("1.7z.1.bak")).unwrap(),
            "old"
        );
    }

    #[test]
    fn reenumerates_matching_directories_only() {
        let (_root, mut config) = layout();
        std::fs::create_dir(config.working_folder.join("10")).unwrap();
        std::fs::create_dir(config.working_folder.join("20")).unwrap();
        std::fs::create_dir(config.working_folder.join("tmp")).unwrap();
        std::fs::write(config.working_folder.join("30"), "file").unwrap();

        let dirs = reenumerate_directories(&config).unwrap();
        assert_eq!(dirs.len(), 3);

        config.directory_format_regex = Some(r"^\d+$".into());
        let dirs = reenumerate_directories(&config).unwrap();
        assert_eq!(
            dirs,
            vec![config.working_folder.join("10"), config.working_folder.join("20")]
        );
    }

    #[tokio::test]
    async fn copy_to_repository_and_cleanup() {
        let (_root, config) = layout();
        let dir = config.working_folder.join("10");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(archive_path(&dir, "7z"), "archive").unwrap();
        std::fs::write(config.archive_folder.join("10.7z"), "previous").unwrap();

        copy_to_repository(&config, std::slice::from_ref(&dir)).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(config.archive_folder.join("10.7z")).unwrap(),
            "archive"
        );
        assert!(config.archive_folder.join("10.7z.1.bak").exists());

        delete_working_folders(&config).await.unwrap();
        assert!(!config.working_folder.exists());
        assert!(!config.backup_folder.exists());
        assert!(config.archive_folder.exists());
    }

    #[tokio::test]
    async fn copy_to_repository_fails_when_archive_missing() {
        let (_root, config) = layout();
        let dir = config.working_folder.join("99");
        assert!(copy_to_repository(&config, &[dir]).await.is_err());
    }
}
