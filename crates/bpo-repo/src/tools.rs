//! Repository tools: `apk.static` for indexing and `abuild-sign.noinclude`
//! for signing. Both are extracted from pinned apk archives at startup.

use async_trait::async_trait;
use bpo_config::SignConfig;
use flate2::read::MultiGzDecoder;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{RepoError, RepoResult};

/// Tool archives and the files extracted from each of them.
const TOOLS: &[(&str, &[&str])] = &[
    ("apk-tools-static", &["sbin/apk.static"]),
    (
        "abuild-sign-noinclude",
        &["usr/bin/abuild-sign.noinclude", "usr/bin/abuild-tar.static"],
    ),
];

/// Recreate `<temp>/repo_tools/bin` and extract the tools into it.
/// Returns the bin dir.
pub fn prepare_tools(tools_dir: &Path, temp_dir: &Path) -> RepoResult<PathBuf> {
    let root = temp_dir.join("repo_tools");
    if root.exists() {
        fs::remove_dir_all(&root).map_err(RepoError::io(&root))?;
    }
    let bin_dir = root.join("bin");
    fs::create_dir_all(&bin_dir).map_err(RepoError::io(&bin_dir))?;

    for (pkgname, paths) in TOOLS {
        extract_tool_apk(tools_dir, &bin_dir, pkgname, paths)?;
    }

    info!(bin_dir = %bin_dir.display(), "Repository tools ready");
    Ok(bin_dir)
}

/// The one archive matching `<tools_dir>/<pkgname>-*.apk`.
fn find_tool_apk(tools_dir: &Path, pkgname: &str) -> RepoResult<PathBuf> {
    let prefix = format!("{}-", pkgname);
    let pattern = tools_dir.join(format!("{}*.apk", prefix));

    let entries = fs::read_dir(tools_dir).map_err(RepoError::io(tools_dir))?;
    let mut results = Vec::new();
    for entry in entries {
        let entry = entry.map_err(RepoError::io(tools_dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".apk") {
            results.push(entry.path());
        }
    }

    match results.as_slice() {
        [one] => Ok(one.clone()),
        _ => Err(RepoError::ToolArchive(format!(
            "there must be exactly one file that matches: {} (found {})",
            pattern.display(),
            results.len()
        ))),
    }
}

fn extract_tool_apk(
    tools_dir: &Path,
    bin_dir: &Path,
    pkgname: &str,
    paths: &[&str],
) -> RepoResult<()> {
    let apk = find_tool_apk(tools_dir, pkgname)?;
    let file = File::open(&apk).map_err(RepoError::io(&apk))?;

    // apks are several gzip streams with one tar segment each
    let mut archive = tar::Archive::new(MultiGzDecoder::new(file));
    archive.set_ignore_zeros(true);

    let mut remaining: Vec<&str> = paths.to_vec();
    for entry in archive.entries().map_err(RepoError::io(&apk))? {
        let mut entry = entry.map_err(RepoError::io(&apk))?;
        let path = entry.path().map_err(RepoError::io(&apk))?.into_owned();
        let Some(pos) = remaining.iter().position(|p| Path::new(p) == path) else {
            continue;
        };
        remaining.remove(pos);

        let Some(basename) = path.file_name() else {
            continue;
        };
        let target = bin_dir.join(basename);
        debug!(apk = %apk.display(), path = %path.display(), "Extracting tool");

        let mut out = File::create(&target).map_err(RepoError::io(&target))?;
        io::copy(&mut entry, &mut out).map_err(RepoError::io(&target))?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
            .map_err(RepoError::io(&target))?;
    }

    if !remaining.is_empty() {
        return Err(RepoError::ToolArchive(format!(
            "{} does not contain: {}",
            apk.display(),
            remaining.join(", ")
        )));
    }
    Ok(())
}

/// Index generation and signing, as used by promotion.
#[async_trait]
pub trait RepoTools: Send + Sync {
    /// Write an index of `apks` for `arch` to `output`.
    async fn index(&self, arch: &str, cwd: &Path, output: &Path, apks: &[PathBuf]) -> RepoResult<()>;

    /// Sign an index file in place.
    async fn sign(&self, index: &Path) -> RepoResult<()>;
}

/// The real tools, run from the extracted bin dir.
pub struct ApkTools {
    bin_dir: PathBuf,
    sign: Option<SignConfig>,
}

impl ApkTools {
    pub fn new(bin_dir: PathBuf, sign: Option<SignConfig>) -> Self {
        Self { bin_dir, sign }
    }

    fn path_env(&self) -> OsString {
        let mut path = OsString::from(self.bin_dir.as_os_str());
        if let Some(current) = std::env::var_os("PATH") {
            path.push(":");
            path.push(current);
        }
        path
    }

    async fn run(&self, tool: &str, cwd: &Path, args: &[OsString]) -> RepoResult<()> {
        debug!(tool, cwd = %cwd.display(), args = ?args, "Running repository tool");

        let output = Command::new(tool)
            .args(args)
            .current_dir(cwd)
            .env("PATH", self.path_env())
            .output()
            .await
            .map_err(|e| RepoError::Tool {
                tool: tool.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(RepoError::Tool {
                tool: tool.to_string(),
                message: format!(
                    "exit status {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RepoTools for ApkTools {
    async fn index(&self, arch: &str, cwd: &Path, output: &Path, apks: &[PathBuf]) -> RepoResult<()> {
        // The description changes on every run, mirrors use it to detect
        // index updates.
        let description = chrono::Utc::now().naive_utc().to_string();

        let mut args: Vec<OsString> = vec![
            "-q".into(),
            "index".into(),
            "--output".into(),
            output.into(),
            "--rewrite-arch".into(),
            arch.into(),
            "--description".into(),
            description.into(),
        ];
        args.extend(apks.iter().map(OsString::from));

        self.run("apk.static", cwd, &args).await
    }

    async fn sign(&self, index: &Path) -> RepoResult<()> {
        let sign = self.sign.as_ref().ok_or_else(|| RepoError::Tool {
            tool: "abuild-sign.noinclude".to_string(),
            message: "no signing key configured".to_string(),
        })?;

        let cwd = index.parent().unwrap_or_else(|| Path::new("."));
        let args: Vec<OsString> = vec![
            "-p".into(),
            sign.public_key.clone().into(),
            "-k".into(),
            sign.private_key.clone().into(),
            index.into(),
        ];

        self.run("abuild-sign.noinclude", cwd, &args).await
    }
}
