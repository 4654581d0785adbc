//! Staging and promotion between the WIP and final repositories.

use bpo_core::{BranchArch, JobArtifact, Package};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::layout::{ApkFile, INDEX_NAME, list_apks, validate_file_name};
use crate::{RepoError, RepoLayout, RepoResult, RepoTools};

/// What a promotion moved and removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Promotion {
    /// Apks moved from WIP into final.
    pub promoted: Vec<String>,
    /// Apks removed from final because a newer version replaced them.
    pub removed: Vec<String>,
}

pub struct RepoManager {
    layout: RepoLayout,
    tools: Arc<dyn RepoTools>,
}

impl RepoManager {
    pub fn new(layout: RepoLayout, tools: Arc<dyn RepoTools>) -> Self {
        Self { layout, tools }
    }

    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    /// Write built packages into the WIP repository. Only apks named in
    /// `wanted` are written, anything else the job left behind is skipped.
    /// Returns the staged file names. A bad file name rejects the whole
    /// upload before anything is written.
    pub async fn stage(
        &self,
        key: &BranchArch,
        artifacts: &[JobArtifact],
        wanted: &BTreeSet<String>,
    ) -> RepoResult<Vec<String>> {
        for artifact in artifacts {
            validate_file_name(&artifact.name)?;
        }

        let dir = self.layout.wip_dir(key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(RepoError::io(&dir))?;

        let mut staged = Vec::new();
        for artifact in artifacts {
            if !artifact.name.ends_with(".apk") {
                debug!(key = %key, file = %artifact.name, "Skipping non-apk artifact");
                continue;
            }
            if !wanted.contains(&artifact.name) {
                warn!(key = %key, file = %artifact.name, "Skipping apk of an untracked package");
                continue;
            }

            let tmp = dir.join(tmp_name(&format!(".{}", artifact.name)));
            let target = dir.join(&artifact.name);
            tokio::fs::write(&tmp, &artifact.data)
                .await
                .map_err(RepoError::io(&tmp))?;
            tokio::fs::rename(&tmp, &target)
                .await
                .map_err(RepoError::io(&target))?;
            staged.push(artifact.name.clone());
        }

        info!(key = %key, files = ?staged, "Staged artifacts in WIP repository");
        Ok(staged)
    }

    pub async fn wip_has(&self, key: &BranchArch, pkgname: &str, version: &str) -> bool {
        is_file(&self.layout.wip_apk(key, pkgname, version)).await
    }

    pub async fn final_has(&self, key: &BranchArch, pkgname: &str, version: &str) -> bool {
        is_file(&self.layout.final_apk(key, pkgname, version)).await
    }

    /// Delete WIP apks of reported packages whose version no longer matches
    /// the reported one. `expected` maps pkgname to version.
    pub async fn remove_outdated_wip(
        &self,
        key: &BranchArch,
        expected: &HashMap<String, String>,
    ) -> RepoResult<Vec<String>> {
        let dir = self.layout.wip_dir(key);
        let mut removed = Vec::new();

        for file_name in list_apks(&dir).await? {
            let Some(apk) = ApkFile::parse(&file_name) else {
                continue;
            };
            let outdated = expected
                .get(&apk.name)
                .is_some_and(|version| *version != apk.version);
            if outdated {
                let path = dir.join(&file_name);
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(RepoError::io(&path))?;
                info!(key = %key, file = %file_name, "Removed outdated WIP apk");
                removed.push(file_name);
            }
        }
        Ok(removed)
    }

    /// Move the apks of `batch` from WIP into final and publish a new
    /// signed index. Final apks of a batch package with another version are
    /// removed, other WIP apks stay where they are. Nothing in final changes
    /// unless indexing and signing worked. Calling this again after a
    /// partial failure completes the promotion.
    pub async fn promote(&self, key: &BranchArch, batch: &[Package]) -> RepoResult<Promotion> {
        let wip_dir = self.layout.wip_dir(key);
        let final_dir = self.layout.final_dir(key);

        let mut promoted = BTreeSet::new();
        for package in batch {
            if self.wip_has(key, &package.pkgname, &package.version).await {
                promoted.insert(package.apk_name());
            } else if !self.final_has(key, &package.pkgname, &package.version).await {
                return Err(RepoError::MissingArtifact(format!(
                    "{}/{}",
                    key,
                    package.apk_name()
                )));
            }
        }

        let versions: HashMap<&str, &str> = batch
            .iter()
            .map(|p| (p.pkgname.as_str(), p.version.as_str()))
            .collect();
        let final_apks = list_apks(&final_dir).await?;
        let superseded: Vec<String> = final_apks
            .iter()
            .filter(|f| {
                ApkFile::parse(f).is_some_and(|apk| {
                    versions
                        .get(apk.name.as_str())
                        .is_some_and(|version| *version != apk.version)
                })
            })
            .cloned()
            .collect();

        let mut index_input: Vec<PathBuf> = final_apks
            .iter()
            .filter(|f| !superseded.contains(*f) && !promoted.contains(*f))
            .map(|f| final_dir.join(f))
            .collect();
        index_input.extend(promoted.iter().map(|f| wip_dir.join(f)));

        tokio::fs::create_dir_all(&final_dir)
            .await
            .map_err(RepoError::io(&final_dir))?;
        let tmp_index = final_dir.join(tmp_name(&format!(".{}", INDEX_NAME)));

        if let Err(e) = self.index_and_sign(key, &final_dir, &tmp_index, &index_input).await {
            warn!(key = %key, error = %e, "Failed to index and sign repository");
            remove_if_exists(&tmp_index).await;
            return Err(e);
        }

        for file_name in &promoted {
            let src = wip_dir.join(file_name);
            let dst = final_dir.join(file_name);
            tokio::fs::rename(&src, &dst)
                .await
                .map_err(RepoError::io(&dst))?;
        }

        let index = self.layout.final_index(key);
        tokio::fs::rename(&tmp_index, &index)
            .await
            .map_err(RepoError::io(&index))?;

        for file_name in &superseded {
            let path = final_dir.join(file_name);
            tokio::fs::remove_file(&path)
                .await
                .map_err(RepoError::io(&path))?;
        }

        info!(
            key = %key,
            promoted = promoted.len(),
            removed = superseded.len(),
            "Published repository"
        );
        Ok(Promotion {
            promoted: promoted.into_iter().collect(),
            removed: superseded,
        })
    }

    async fn index_and_sign(
        &self,
        key: &BranchArch,
        cwd: &Path,
        output: &Path,
        apks: &[PathBuf],
    ) -> RepoResult<()> {
        self.tools.index(&key.arch, cwd, output, apks).await?;
        self.tools.sign(output).await
    }
}

/// Temporary name next to the final file, so the rename stays on one
/// filesystem.
fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}.tmp-{n}")
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_file())
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
    }
}
