//! Test doubles and a scheduler fixture.

use async_trait::async_trait;
use bpo_config::parse_system_config;
use bpo_core::{
    BranchArch, DependencyReport, Error, JobArtifact, JobBackend, JobId, JobStatus, JobTasks,
    Package, PackageStatus, ReportEntry, Result,
};
use bpo_db::Store;
use bpo_repo::{RepoError, RepoLayout, RepoManager, RepoResult, RepoTools};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::Scheduler;

const CONFIG: &str = r#"
branch "master" {
    arches "x86_64"
}
branch "v20.05" ignore-errors=#true {
    arches "x86_64" "aarch64"
}
retry-count-max 3
"#;

struct MockJob {
    name: String,
    tasks: JobTasks,
    status: JobStatus,
    output: Vec<JobArtifact>,
}

/// Job backend that records submitted jobs. Tests decide how they end.
#[derive(Default)]
pub struct MockBackend {
    polling: bool,
    fail_dispatch: AtomicBool,
    next_id: AtomicU64,
    jobs: Mutex<Vec<(JobId, MockJob)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn polling() -> Self {
        Self {
            polling: true,
            ..Self::default()
        }
    }

    pub fn fail_dispatch(&self, fail: bool) {
        self.fail_dispatch.store(fail, Ordering::SeqCst);
    }

    pub fn jobs_named(&self, name: &str) -> Vec<JobId> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, job)| job.name == name)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn tasks(&self, job_id: &JobId) -> JobTasks {
        self.with_job(job_id, |job| job.tasks.clone()).unwrap()
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.with_job(job_id, |job| job.status)
    }

    pub fn finish(&self, job_id: &JobId, status: JobStatus, output: Vec<JobArtifact>) {
        self.with_job(job_id, |job| {
            job.status = status;
            job.output = output;
        })
        .unwrap();
    }

    /// Drop a job, as a restarted backend would.
    pub fn forget(&self, job_id: &JobId) {
        self.jobs.lock().unwrap().retain(|(id, _)| id != job_id);
    }

    fn with_job<T>(&self, job_id: &JobId, f: impl FnOnce(&mut MockJob) -> T) -> Option<T> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.iter_mut().find(|(id, _)| id == job_id).map(|(_, job)| f(job))
    }
}

#[async_trait]
impl JobBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn script_setup(&self, branch: Option<&str>) -> String {
        format!("echo setup {}\n", branch.unwrap_or(""))
    }

    async fn run_job(&self, name: &str, tasks: &JobTasks) -> Result<JobId> {
        if self.fail_dispatch.load(Ordering::SeqCst) {
            return Err(Error::ExecutionFailed("backend unavailable".to_string()));
        }
        let job_id = JobId::from(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.jobs.lock().unwrap().push((
            job_id.clone(),
            MockJob {
                name: name.to_string(),
                tasks: tasks.clone(),
                status: JobStatus::Building,
                output: Vec::new(),
            },
        ));
        Ok(job_id)
    }

    async fn get_status(&self, job_id: &JobId) -> Result<JobStatus> {
        self.status(job_id)
            .ok_or_else(|| Error::NotFound(format!("mock job {}", job_id)))
    }

    fn get_link(&self, job_id: &JobId) -> String {
        format!("mock://{}", job_id)
    }

    fn requires_polling(&self) -> bool {
        self.polling
    }

    async fn collect_output(&self, job_id: &JobId) -> Result<Vec<JobArtifact>> {
        self.with_job(job_id, |job| job.output.clone())
            .ok_or_else(|| Error::NotFound(format!("mock job {}", job_id)))
    }
}

/// Index and sign without the apk tools. The index lists the apk names.
#[derive(Default)]
pub struct FakeTools {
    fail_sign: AtomicBool,
}

impl FakeTools {
    pub fn fail_sign(&self, fail: bool) {
        self.fail_sign.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RepoTools for FakeTools {
    async fn index(&self, _arch: &str, _cwd: &Path, output: &Path, apks: &[PathBuf]) -> RepoResult<()> {
        let names: Vec<String> = apks
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        std::fs::write(output, names.join("\n")).map_err(|e| RepoError::Io {
            path: output.to_path_buf(),
            source: e,
        })
    }

    async fn sign(&self, _index: &Path) -> RepoResult<()> {
        if self.fail_sign.load(Ordering::SeqCst) {
            return Err(RepoError::Tool {
                tool: "abuild-sign.noinclude".to_string(),
                message: "no key".to_string(),
            });
        }
        Ok(())
    }
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub backend: Arc<MockBackend>,
    pub tools: Arc<FakeTools>,
    pub store: Store,
    pub layout: RepoLayout,
    pub key: BranchArch,
    _tmp: tempfile::TempDir,
}

impl Harness {
    pub async fn package(&self, pkgname: &str) -> Package {
        self.store
            .packages
            .get(pkgname, &self.key.arch, &self.key.branch)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no package {}", pkgname))
    }

    pub async fn status(&self, pkgname: &str) -> PackageStatus {
        self.package(pkgname).await.status
    }

    pub async fn job_of(&self, pkgname: &str) -> JobId {
        self.package(pkgname).await.job_id.unwrap()
    }

    pub async fn list(&self) -> Vec<Package> {
        self.store
            .packages
            .list(&self.key.arch, &self.key.branch)
            .await
            .unwrap()
    }

    /// Number of audit log entries with this action.
    pub async fn actions(&self, action: &str) -> usize {
        self.store.logs.with_action(action).await.unwrap().len()
    }

    pub fn final_files(&self) -> Vec<String> {
        ls(&self.layout.final_dir(&self.key))
    }

    pub fn wip_files(&self) -> Vec<String> {
        ls(&self.layout.wip_dir(&self.key))
    }
}

fn ls(dir: &Path) -> Vec<String> {
    let mut ret: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    ret.sort();
    ret
}

pub async fn harness() -> Harness {
    harness_with(MockBackend::new()).await
}

pub async fn harness_with(backend: MockBackend) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = parse_system_config(CONFIG).unwrap();
    config.paths.temp = tmp.path().join("temp");
    config.paths.repo_wip = tmp.path().join("wip");
    config.paths.repo_final = tmp.path().join("final");

    let store = Store::in_memory().await.unwrap();
    let backend = Arc::new(backend);
    let tools = Arc::new(FakeTools::default());
    let layout = RepoLayout::new(&config.paths.repo_wip, &config.paths.repo_final);
    let repo = RepoManager::new(layout.clone(), tools.clone());

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        backend.clone(),
        repo,
        Arc::new(config),
    ));

    Harness {
        scheduler,
        backend,
        tools,
        store,
        layout,
        key: BranchArch::new("master", "x86_64"),
        _tmp: tmp,
    }
}

pub fn entry(pkgname: &str, version: &str, depends: &[&str]) -> ReportEntry {
    ReportEntry {
        pkgname: pkgname.to_string(),
        version: version.to_string(),
        repo: Some("main".to_string()),
        depends: depends.iter().map(|d| d.to_string()).collect(),
    }
}

pub fn report(key: &BranchArch, entries: Vec<ReportEntry>) -> DependencyReport {
    DependencyReport::from_sections(BTreeMap::from([(key.clone(), entries)]))
}

pub fn apk(pkgname: &str, version: &str) -> JobArtifact {
    JobArtifact::new(bpo_core::package::apk_name(pkgname, version), b"apk".to_vec())
}
