//! Directory layout of the WIP and final repositories.

use bpo_core::BranchArch;
use bpo_core::package::apk_name;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::{RepoError, RepoResult};

static APK_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>.+)-(?P<version>[^-]+-r\d+)\.apk$").expect("valid apk name pattern")
});

pub const INDEX_NAME: &str = "APKINDEX.tar.gz";

/// Name and version parsed from an apk file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApkFile {
    pub file_name: String,
    pub name: String,
    pub version: String,
}

impl ApkFile {
    /// `hello-world-1-r4.apk` → name `hello-world`, version `1-r4`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = APK_NAME.captures(file_name)?;
        Some(Self {
            file_name: file_name.to_string(),
            name: caps["name"].to_string(),
            version: caps["version"].to_string(),
        })
    }
}

/// `<root>/<branch>/<arch>/` for the WIP and final trees.
#[derive(Debug, Clone)]
pub struct RepoLayout {
    wip: PathBuf,
    final_root: PathBuf,
}

impl RepoLayout {
    pub fn new(wip: impl Into<PathBuf>, final_root: impl Into<PathBuf>) -> Self {
        Self {
            wip: wip.into(),
            final_root: final_root.into(),
        }
    }

    pub fn wip_dir(&self, key: &BranchArch) -> PathBuf {
        self.wip.join(&key.branch).join(&key.arch)
    }

    pub fn final_dir(&self, key: &BranchArch) -> PathBuf {
        self.final_root.join(&key.branch).join(&key.arch)
    }

    pub fn wip_apk(&self, key: &BranchArch, pkgname: &str, version: &str) -> PathBuf {
        self.wip_dir(key).join(apk_name(pkgname, version))
    }

    pub fn final_apk(&self, key: &BranchArch, pkgname: &str, version: &str) -> PathBuf {
        self.final_dir(key).join(apk_name(pkgname, version))
    }

    pub fn final_index(&self, key: &BranchArch) -> PathBuf {
        self.final_dir(key).join(INDEX_NAME)
    }
}

/// Sorted `*.apk` file names in a directory. A missing directory is empty.
pub async fn list_apks(dir: &Path) -> RepoResult<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RepoError::io(dir)(e)),
    };

    let mut ret = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(RepoError::io(dir))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_file = entry
            .file_type()
            .await
            .map_err(RepoError::io(dir))?
            .is_file();
        if name.ends_with(".apk") && is_file {
            ret.push(name);
        }
    }
    ret.sort();
    Ok(ret)
}

/// Artifact names must be plain file names that stay inside the target dir.
pub fn validate_file_name(name: &str) -> RepoResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(RepoError::InvalidName(name.to_string()));
    }
    Ok(())
}
