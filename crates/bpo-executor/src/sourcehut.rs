//! builds.sr.ht job backend.
//!
//! Jobs are submitted as YAML build manifests. Their last task uploads the
//! results back through the job callbacks, so there is nothing to poll.

use async_trait::async_trait;
use bpo_config::SecretConfig;
use bpo_core::job::shell_quote;
use bpo_core::{Error, JobBackend, JobId, JobStatus, JobTasks, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

const IMAGE: &str = "alpine/edge";
const PACKAGES: &[&str] = &["coreutils", "procps", "py3-requests"];
const SOURCES: &[&str] = &[
    "https://gitlab.postmarketos.org/postmarketOS/pmbootstrap.git",
    "https://gitlab.postmarketos.org/postmarketOS/pmaports.git",
];
const OUTPUT_DIR: &str = "/home/build/output";

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    manifest: &'a str,
    note: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
}

/// Submits jobs to builds.sr.ht.
pub struct SourcehutBackend {
    client: reqwest::Client,
    api_url: Url,
    user: String,
    token: String,
    secrets: Vec<SecretConfig>,
}

impl SourcehutBackend {
    pub fn new(api_url: Url, user: String, token: String, secrets: Vec<SecretConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            user,
            token,
            secrets,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .map_err(|e| Error::Internal(format!("invalid sourcehut url: {}", e)))
    }

    /// Assemble the build manifest for a job.
    pub fn manifest(&self, name: &str, tasks: &JobTasks) -> String {
        let mut ret = format!("image: {}\npackages:\n", IMAGE);
        for package in PACKAGES {
            ret.push_str(&format!("- {}\n", package));
        }
        ret.push_str("sources:\n");
        for source in SOURCES {
            ret.push_str(&format!("- {}\n", source));
        }
        ret.push_str(&format!(
            "environment:\n  BPO_JOB_NAME: \"{}\"\n  BPO_OUTPUT_DIR: \"{}\"\n",
            name, OUTPUT_DIR
        ));
        ret.push_str(&get_secrets_by_job_name(&self.secrets, name));
        ret.push_str("tasks:\n");
        for (task, script) in tasks.iter() {
            ret.push_str(&format!("- {}: |\n", task));
            for line in script.lines() {
                if line.is_empty() {
                    ret.push('\n');
                } else {
                    ret.push_str(&format!("    {}\n", line));
                }
            }
        }
        ret
    }
}

/// The `secrets:` manifest block for a job: the secrets every job gets,
/// followed by the ones configured for this job name.
pub fn get_secrets_by_job_name(secrets: &[SecretConfig], name: &str) -> String {
    let mut ret = String::from("secrets:\n");
    for secret in secrets.iter().filter(|s| s.job.is_none()) {
        ret.push_str(&format!("- {}\n", secret.id));
    }
    for secret in secrets.iter().filter(|s| s.job.as_deref() == Some(name)) {
        ret.push_str(&format!("- {}\n", secret.id));
    }
    ret
}

fn parse_status(status: &str) -> Result<JobStatus> {
    match status {
        "pending" | "queued" => Ok(JobStatus::Queued),
        "running" => Ok(JobStatus::Building),
        "success" => Ok(JobStatus::Succeeded),
        "failed" | "timeout" | "cancelled" => Ok(JobStatus::Failed),
        other => Err(Error::Internal(format!("unknown sourcehut job status: {}", other))),
    }
}

#[async_trait]
impl JobBackend for SourcehutBackend {
    fn name(&self) -> &'static str {
        "sourcehut"
    }

    fn script_setup(&self, branch: Option<&str>) -> String {
        let mut script = String::from("mkdir -p \"$BPO_OUTPUT_DIR\"\n");
        if let Some(branch) = branch {
            script.push_str(&format!("git -C pmaports checkout {}\n", shell_quote(branch)));
        }
        script.push_str("yes '' | ./pmbootstrap/pmbootstrap.py --aports=\"$PWD/pmaports\" -q init\n");
        script
    }

    async fn run_job(&self, name: &str, tasks: &JobTasks) -> Result<JobId> {
        let manifest = self.manifest(name, tasks);
        debug!(job = name, manifest = %manifest, "Submitting sourcehut job");

        let response = self
            .client
            .post(self.endpoint("api/jobs")?)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&SubmitRequest {
                manifest: &manifest,
                note: name,
            })
            .send()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("sourcehut request failed: {}", e)))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::ExecutionFailed(format!(
                "sourcehut rejected job {}: {}",
                name, text
            )));
        }

        let submitted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("invalid sourcehut response: {}", e)))?;

        let job_id = JobId::from(submitted.id);
        info!(job_id = %job_id, job = name, "Submitted sourcehut job");
        Ok(job_id)
    }

    async fn get_status(&self, job_id: &JobId) -> Result<JobStatus> {
        let response = self
            .client
            .get(self.endpoint(&format!("api/jobs/{}", job_id))?)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("sourcehut request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("sourcehut job {}", job_id)));
        }
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::ExecutionFailed(format!(
                "failed to get status of job {}: {}",
                job_id, text
            )));
        }

        let job: JobResponse = response
            .json()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("invalid sourcehut response: {}", e)))?;
        parse_status(&job.status)
    }

    fn get_link(&self, job_id: &JobId) -> String {
        format!("https://builds.sr.ht/~{}/job/{}", self.user, job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> Vec<SecretConfig> {
        vec![
            SecretConfig {
                id: "f00d".to_string(),
                job: None,
            },
            SecretConfig {
                id: "c4f3".to_string(),
                job: Some("sign_index".to_string()),
            },
        ]
    }

    fn backend() -> SourcehutBackend {
        SourcehutBackend::new(
            Url::parse("https://builds.sr.ht").unwrap(),
            "postmarketOS".to_string(),
            "token".to_string(),
            secrets(),
        )
    }

    #[test]
    fn test_secrets_by_job_name() {
        assert_eq!(
            get_secrets_by_job_name(&secrets(), "any_job_name"),
            "secrets:\n- f00d\n"
        );
        assert_eq!(
            get_secrets_by_job_name(&secrets(), "sign_index"),
            "secrets:\n- f00d\n- c4f3\n"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(parse_status("pending").unwrap(), JobStatus::Queued);
        assert_eq!(parse_status("queued").unwrap(), JobStatus::Queued);
        assert_eq!(parse_status("running").unwrap(), JobStatus::Building);
        assert_eq!(parse_status("success").unwrap(), JobStatus::Succeeded);
        for failed in ["failed", "timeout", "cancelled"] {
            assert_eq!(parse_status(failed).unwrap(), JobStatus::Failed);
        }
        assert!(parse_status("exploded").is_err());
    }

    #[test]
    fn test_link() {
        assert_eq!(
            backend().get_link(&JobId::from(94567u64)),
            "https://builds.sr.ht/~postmarketOS/job/94567"
        );
    }

    #[test]
    fn test_setup_always_names_a_branch() {
        let backend = backend();
        assert!(backend
            .script_setup(Some("feature; reboot"))
            .contains("git -C pmaports checkout 'feature; reboot'\n"));
        assert!(backend
            .script_setup(Some("bad\0branch"))
            .contains("git -C pmaports checkout ''\n"));
        assert!(!backend.script_setup(None).contains("checkout"));
    }

    #[test]
    fn test_manifest_layout() {
        let backend = backend();
        let mut tasks = JobTasks::new();
        tasks.push("setup", &backend.script_setup(Some("master")));
        tasks.push("build", "echo one\n\necho two\n");

        let manifest = backend.manifest("build_package", &tasks);
        assert!(manifest.starts_with("image: alpine/edge\npackages:\n"));
        assert!(manifest.contains("  BPO_JOB_NAME: \"build_package\"\n"));
        assert!(manifest.contains("secrets:\n- f00d\ntasks:\n"));
        assert!(manifest.contains("- setup: |\n    mkdir -p \"$BPO_OUTPUT_DIR\"\n    git -C pmaports checkout master\n"));
        assert!(manifest.ends_with("- build: |\n    echo one\n\n    echo two\n"));
    }
}
