//! Local job backend.
//!
//! Every job gets its own directory below the work dir. Task scripts run one
//! after another with `sh -e -c`, output goes to `log.txt` in the job dir
//! and files the job wants to hand back are written to `output/`.
//!
//! Only the most recent finished jobs are remembered. Older ones are
//! forgotten and their `output/` dir is removed, the log stays.

use async_trait::async_trait;
use bpo_core::job::shell_quote;
use bpo_core::{Error, JobArtifact, JobBackend, JobId, JobStatus, JobTasks, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Finished jobs kept for status queries and output collection.
const KEEP_FINISHED: usize = 256;

#[derive(Debug, Clone)]
struct LocalJob {
    name: String,
    dir: PathBuf,
    status: JobStatus,
}

#[derive(Debug, Default)]
struct Jobs {
    all: HashMap<JobId, LocalJob>,
    /// Finished job ids, oldest first.
    finished: VecDeque<JobId>,
}

impl Jobs {
    /// Record a status change. Returns the dirs of the jobs forgotten to
    /// keep at most `keep` finished ones.
    fn set_status(&mut self, job_id: &JobId, status: JobStatus, keep: usize) -> Vec<PathBuf> {
        let Some(job) = self.all.get_mut(job_id) else {
            return Vec::new();
        };
        job.status = status;
        if !status.is_terminal() {
            return Vec::new();
        }

        self.finished.push_back(job_id.clone());
        let mut forgotten = Vec::new();
        while self.finished.len() > keep {
            let Some(old) = self.finished.pop_front() else {
                break;
            };
            if let Some(job) = self.all.remove(&old) {
                debug!(job_id = %old, job = %job.name, "Forgetting finished job");
                forgotten.push(job.dir);
            }
        }
        forgotten
    }
}

/// Runs jobs on this machine. Completion has to be polled.
pub struct LocalBackend {
    work_dir: PathBuf,
    pmaports: PathBuf,
    pmbootstrap: PathBuf,
    keep_finished: usize,
    jobs: Arc<RwLock<Jobs>>,
}

impl LocalBackend {
    pub fn new(work_dir: PathBuf, pmaports: PathBuf, pmbootstrap: PathBuf) -> Self {
        Self {
            work_dir,
            pmaports,
            pmbootstrap,
            keep_finished: KEEP_FINISHED,
            jobs: Arc::new(RwLock::new(Jobs::default())),
        }
    }

    /// Change how many finished jobs are remembered.
    pub fn with_keep_finished(mut self, keep: usize) -> Self {
        self.keep_finished = keep;
        self
    }

    fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.work_dir.join(job_id.as_str())
    }
}

#[async_trait]
impl JobBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn script_setup(&self, branch: Option<&str>) -> String {
        let mut script = String::from(
            "ln -sfn \"$BPO_PMAPORTS\" pmaports\n\
             ln -sfn \"$BPO_PMBOOTSTRAP\" pmbootstrap\n\
             mkdir -p \"$BPO_OUTPUT_DIR\"\n",
        );
        if let Some(branch) = branch {
            script.push_str(&format!("echo branch: {}\n", shell_quote(branch)));
        }
        script
    }

    async fn run_job(&self, name: &str, tasks: &JobTasks) -> Result<JobId> {
        let job_id = JobId::generate();
        let dir = self.job_dir(&job_id);
        let output_dir = dir.join("output");

        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("create {}: {}", output_dir.display(), e)))?;

        self.jobs.write().await.all.insert(
            job_id.clone(),
            LocalJob {
                name: name.to_string(),
                dir: dir.clone(),
                status: JobStatus::Queued,
            },
        );

        let env = vec![
            ("BPO_JOB_ID".to_string(), job_id.to_string()),
            ("BPO_JOB_NAME".to_string(), name.to_string()),
            ("BPO_OUTPUT_DIR".to_string(), output_dir.display().to_string()),
            ("BPO_PMAPORTS".to_string(), self.pmaports.display().to_string()),
            ("BPO_PMBOOTSTRAP".to_string(), self.pmbootstrap.display().to_string()),
        ];
        let tasks: Vec<(String, String)> = tasks
            .iter()
            .map(|(n, s)| (n.to_string(), s.to_string()))
            .collect();

        info!(job_id = %job_id, job = name, tasks = tasks.len(), "Starting local job");

        let jobs = self.jobs.clone();
        let keep = self.keep_finished;
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            jobs.write()
                .await
                .set_status(&spawned_id, JobStatus::Building, keep);
            let status = run_tasks(&dir, &env, &tasks).await;
            info!(job_id = %spawned_id, status = ?status, "Local job finished");
            let mut state = jobs.write().await;
            for old_dir in state.set_status(&spawned_id, status, keep) {
                remove_output_dir(&old_dir).await;
            }
        });

        Ok(job_id)
    }

    async fn get_status(&self, job_id: &JobId) -> Result<JobStatus> {
        self.jobs
            .read()
            .await
            .all
            .get(job_id)
            .map(|job| job.status)
            .ok_or_else(|| Error::NotFound(format!("local job {}", job_id)))
    }

    fn get_link(&self, job_id: &JobId) -> String {
        format!("file://{}", self.job_dir(job_id).join("log.txt").display())
    }

    fn requires_polling(&self) -> bool {
        true
    }

    async fn collect_output(&self, job_id: &JobId) -> Result<Vec<JobArtifact>> {
        let job = self
            .jobs
            .read()
            .await
            .all
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("local job {}", job_id)))?;

        debug!(job_id = %job_id, job = %job.name, "Collecting output");
        read_output_dir(&job.dir.join("output")).await
    }
}

async fn remove_output_dir(job_dir: &Path) {
    let dir = job_dir.join("output");
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove job output"),
    }
}

/// Run the tasks in order. The first failing task ends the job.
async fn run_tasks(dir: &Path, env: &[(String, String)], tasks: &[(String, String)]) -> JobStatus {
    let log_path = dir.join("log.txt");

    for (name, script) in tasks {
        let (stdout, stderr) = match open_log(&log_path).await {
            Ok(files) => files,
            Err(e) => {
                warn!(path = %log_path.display(), error = %e, "Failed to open job log");
                return JobStatus::Failed;
            }
        };

        debug!(task = %name, "Running task");
        let result = Command::new("sh")
            .arg("-e")
            .arg("-c")
            .arg(script)
            .current_dir(dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .await;

        match result {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(task = %name, code = ?status.code(), "Task failed");
                return JobStatus::Failed;
            }
            Err(e) => {
                warn!(task = %name, error = %e, "Failed to spawn task");
                return JobStatus::Failed;
            }
        }
    }

    JobStatus::Succeeded
}

/// The job log opened for appending, once for stdout and once for stderr.
async fn open_log(path: &Path) -> std::io::Result<(std::fs::File, std::fs::File)> {
    let log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let stderr = log.try_clone().await?;
    Ok((log.into_std().await, stderr.into_std().await))
}

async fn read_output_dir(dir: &Path) -> Result<Vec<JobArtifact>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::Internal(format!("read {}: {}", dir.display(), e)))?;

    let mut artifacts = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    {
        let is_file = entry
            .file_type()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .is_file();
        if !is_file {
            continue;
        }
        let path = entry.path();
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Internal(format!("read {}: {}", path.display(), e)))?;
        artifacts.push(JobArtifact::new(
            entry.file_name().to_string_lossy().into_owned(),
            data,
        ));
    }

    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn backend(dir: &Path) -> LocalBackend {
        LocalBackend::new(
            dir.join("local_jobs"),
            dir.join("pmaports"),
            dir.join("pmbootstrap"),
        )
    }

    async fn wait(backend: &LocalBackend, job_id: &JobId) -> JobStatus {
        for _ in 0..200 {
            let status = backend.get_status(job_id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[tokio::test]
    async fn test_successful_job_output() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path());

        let mut tasks = JobTasks::new();
        tasks.push("setup", &backend.script_setup(Some("master")));
        tasks.push(
            "build",
            r#"
            echo "$BPO_JOB_NAME" > "$BPO_OUTPUT_DIR/name.txt"
            printf apk > "$BPO_OUTPUT_DIR/hello-world-1-r4.apk"
            "#,
        );

        let job_id = backend.run_job("build_package", &tasks).await.unwrap();
        assert_eq!(wait(&backend, &job_id).await, JobStatus::Succeeded);

        let output = backend.collect_output(&job_id).await.unwrap();
        let names: Vec<_> = output.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["hello-world-1-r4.apk", "name.txt"]);
        assert_eq!(&output[1].data[..], b"build_package\n");
        assert!(backend.get_link(&job_id).ends_with("log.txt"));
    }

    #[tokio::test]
    async fn test_first_failing_task_stops_the_job() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path());

        let mut tasks = JobTasks::new();
        tasks.push("one", "mkdir -p \"$BPO_OUTPUT_DIR\"\n");
        tasks.push("two", "false\n");
        tasks.push("three", "touch \"$BPO_OUTPUT_DIR/marker\"\n");

        let job_id = backend.run_job("broken", &tasks).await.unwrap();
        assert_eq!(wait(&backend, &job_id).await, JobStatus::Failed);
        assert!(backend.collect_output(&job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_old_finished_jobs_are_forgotten() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path()).with_keep_finished(1);

        let mut tasks = JobTasks::new();
        tasks.push("build", "printf apk > \"$BPO_OUTPUT_DIR/hello-world-1-r4.apk\"\n");

        let first = backend.run_job("build_package", &tasks).await.unwrap();
        assert_eq!(wait(&backend, &first).await, JobStatus::Succeeded);
        let second = backend.run_job("build_package", &tasks).await.unwrap();
        assert_eq!(wait(&backend, &second).await, JobStatus::Succeeded);

        assert!(matches!(
            backend.get_status(&first).await,
            Err(Error::NotFound(_))
        ));
        let first_dir = tmp.path().join("local_jobs").join(first.as_str());
        assert!(!first_dir.join("output").exists());
        assert!(first_dir.join("log.txt").exists());

        assert_eq!(backend.collect_output(&second).await.unwrap().len(), 1);
        assert_eq!(backend.jobs.read().await.all.len(), 1);
    }

    #[tokio::test]
    async fn test_setup_quotes_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path());
        assert!(backend.script_setup(Some("a b")).contains("echo branch: 'a b'\n"));
        assert!(backend.script_setup(Some("bad\0branch")).contains("echo branch: ''\n"));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path());
        let unknown = JobId::from("nope");

        assert!(matches!(
            backend.get_status(&unknown).await,
            Err(Error::NotFound(_))
        ));
        assert!(backend.collect_output(&unknown).await.is_err());
        backend.abort(&unknown).await.unwrap();
    }
}
