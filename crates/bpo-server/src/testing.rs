//! Router fixture backed by an in-memory store and a recording backend.

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use bpo_config::parse_system_config;
use bpo_core::{BranchArch, JobBackend, JobId, JobStatus, JobTasks, Result};
use bpo_db::Store;
use bpo_repo::{RepoLayout, RepoManager, RepoResult, RepoTools};
use bpo_scheduler::Scheduler;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use crate::auth::hash_token;
use crate::{AppState, routes};

const CONFIG: &str = r#"
branch "master" {
    arches "x86_64"
}
retry-count-max 3
"#;

const BOUNDARY: &str = "bpo-test-boundary";

/// Backend that accepts every job and never finishes one on its own.
#[derive(Default)]
pub struct RecordingBackend {
    jobs: Mutex<Vec<(JobId, String)>>,
}

impl RecordingBackend {
    pub fn jobs_named(&self, name: &str) -> Vec<JobId> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, n)| n == name)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl JobBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn script_setup(&self, _branch: Option<&str>) -> String {
        String::new()
    }

    async fn run_job(&self, name: &str, _tasks: &JobTasks) -> Result<JobId> {
        let mut jobs = self.jobs.lock().unwrap();
        let job_id = JobId::from(jobs.len() as u64 + 1);
        jobs.push((job_id.clone(), name.to_string()));
        Ok(job_id)
    }

    async fn get_status(&self, _job_id: &JobId) -> Result<JobStatus> {
        Ok(JobStatus::Building)
    }

    fn get_link(&self, job_id: &JobId) -> String {
        format!("recording://{}", job_id)
    }
}

/// Writes an empty index and skips signing.
pub struct NoopTools;

#[async_trait]
impl RepoTools for NoopTools {
    async fn index(&self, _arch: &str, _cwd: &Path, output: &Path, _apks: &[PathBuf]) -> RepoResult<()> {
        std::fs::write(output, b"").map_err(|e| bpo_repo::RepoError::Io {
            path: output.to_path_buf(),
            source: e,
        })
    }

    async fn sign(&self, _index: &Path) -> RepoResult<()> {
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub scheduler: Arc<Scheduler>,
    pub backend: Arc<RecordingBackend>,
    pub store: Store,
    pub layout: RepoLayout,
    _tmp: tempfile::TempDir,
}

impl TestApp {
    /// POST a raw body. Returns the status and the JSON body, if any.
    pub async fn post(
        &self,
        uri: &str,
        headers: &[(&str, &str)],
        body: String,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method("POST").uri(uri);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.send(request.body(Body::from(body)).unwrap()).await
    }

    /// POST a multipart upload with one `file[]` field per file.
    pub async fn post_files(
        &self,
        uri: &str,
        headers: &[(&str, &str)],
        files: &[(&str, &[u8])],
    ) -> (StatusCode, serde_json::Value) {
        let mut body = Vec::new();
        for (name, data) in files {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"file[]\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    BOUNDARY, name
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        let mut request = Request::builder().method("POST").uri(uri).header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.send(request.body(Body::from(body)).unwrap()).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(request).await
    }

    pub fn final_apk(&self, pkgname: &str, version: &str) -> PathBuf {
        self.layout
            .final_apk(&BranchArch::new("master", "x86_64"), pkgname, version)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }
}

pub async fn app() -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = parse_system_config(CONFIG).unwrap();
    config.paths.temp = tmp.path().join("temp");
    config.paths.repo_wip = tmp.path().join("wip");
    config.paths.repo_final = tmp.path().join("final");
    config.tokens.job_callback = Some(hash_token("callback-secret"));
    config.tokens.push_hook_gitlab = Some(hash_token("gitlab-secret"));

    let store = Store::in_memory().await.unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let layout = RepoLayout::new(&config.paths.repo_wip, &config.paths.repo_final);
    let repo = RepoManager::new(layout.clone(), Arc::new(NoopTools));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        backend.clone(),
        repo,
        Arc::new(config),
    ));

    TestApp {
        router: routes::router(AppState::new(scheduler.clone())),
        scheduler,
        backend,
        store,
        layout,
        _tmp: tmp,
    }
}
