//! System configuration parsing.
//!
//! ```kdl
//! server host="127.0.0.1" port=5000
//! database "bpo.db"
//! paths {
//!     temp "_temp"
//!     repo-final "_repo_final"
//!     repo-wip "_repo_wip"
//!     tools "data/tools"
//! }
//! branch "master" {
//!     arches "x86_64" "aarch64"
//! }
//! branch "v20.05" ignore-errors=#true {
//!     arches "x86_64"
//! }
//! retry-count-max 3
//! job-service "sourcehut" user="postmarketOS" {
//!     secret "f00d"
//!     secret "c4f3" job="sign_index"
//! }
//! sign private-key="/keys/build.rsa" public-key="build.postmarketos.org.rsa.pub"
//! tokens {
//!     job-callback "<sha256 hex>"
//!     push-hook-gitlab "<sha256 hex>"
//! }
//! ```

use crate::kdl_ext::{
    get_all_string_args, get_bool_prop, get_first_bool_arg, get_first_int_arg,
    get_first_string_arg, get_int_prop, get_string_prop,
};
use crate::{ConfigError, ConfigResult};
use bpo_core::BranchArch;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use url::Url;

const DEFAULT_PMAPORTS: &str = "../pmbootstrap/aports";
const DEFAULT_PMBOOTSTRAP: &str = "../pmbootstrap";

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    /// Path to the sqlite database.
    pub database: PathBuf,
    /// Where published and signed packages can be downloaded from.
    pub mirror: Option<String>,
    pub paths: PathsConfig,
    pub branches: Vec<BranchConfig>,
    /// How often a build may fail before the package stays failed.
    pub retry_count_max: u32,
    /// Query missing packages at startup instead of waiting for a push.
    pub auto_get_repo_missing: bool,
    /// Interval of the status polling loop, for backends that need one.
    pub poll_interval_secs: u64,
    pub job_service: JobServiceConfig,
    pub sign: Option<SignConfig>,
    pub tokens: TokensConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Scratch space for tools and local jobs. Gets wiped.
    pub temp: PathBuf,
    pub repo_final: PathBuf,
    pub repo_wip: PathBuf,
    /// Directory holding the pinned tool archives.
    pub tools: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub name: String,
    pub arches: Vec<String>,
    /// Failures on this branch do not count towards the health badge.
    pub ignore_errors: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobServiceConfig {
    Local {
        pmaports: PathBuf,
        pmbootstrap: PathBuf,
    },
    Sourcehut {
        user: String,
        api_url: Url,
        secrets: Vec<SecretConfig>,
    },
}

/// A secret id, either needed by all jobs or only by the named job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretConfig {
    pub id: String,
    pub job: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignConfig {
    pub private_key: PathBuf,
    pub public_key: String,
}

/// sha256 hex digests of the shared tokens accepted at the boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokensConfig {
    pub job_callback: Option<String>,
    pub push_hook_gitlab: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            database: PathBuf::from("bpo.db"),
            mirror: None,
            paths: PathsConfig {
                temp: PathBuf::from("_temp"),
                repo_final: PathBuf::from("_repo_final"),
                repo_wip: PathBuf::from("_repo_wip"),
                tools: PathBuf::from("data/tools"),
            },
            branches: Vec::new(),
            retry_count_max: 3,
            auto_get_repo_missing: false,
            poll_interval_secs: 10,
            job_service: JobServiceConfig::default_local(),
            sign: None,
            tokens: TokensConfig::default(),
        }
    }
}

impl JobServiceConfig {
    fn default_local() -> Self {
        JobServiceConfig::Local {
            pmaports: PathBuf::from(DEFAULT_PMAPORTS),
            pmbootstrap: PathBuf::from(DEFAULT_PMBOOTSTRAP),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobServiceConfig::Local { .. } => "local",
            JobServiceConfig::Sourcehut { .. } => "sourcehut",
        }
    }
}

impl SystemConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_system_config(&text)
    }

    pub fn branch(&self, name: &str) -> Option<&BranchConfig> {
        self.branches.iter().find(|b| b.name == name)
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.branches.iter().map(|b| b.name.clone()).collect()
    }

    /// Every configured (branch, arch) pair.
    pub fn keys(&self) -> Vec<BranchArch> {
        self.branches
            .iter()
            .flat_map(|b| b.arches.iter().map(|a| BranchArch::new(&b.name, a)))
            .collect()
    }

    /// The (branch, arch) pairs of one branch. Empty for unknown branches.
    pub fn keys_for_branch(&self, branch: &str) -> Vec<BranchArch> {
        self.branch(branch)
            .map(|b| b.arches.iter().map(|a| BranchArch::new(&b.name, a)).collect())
            .unwrap_or_default()
    }

    pub fn ignore_errors_branches(&self) -> Vec<String> {
        self.branches
            .iter()
            .filter(|b| b.ignore_errors)
            .map(|b| b.name.clone())
            .collect()
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut seen_branches = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                if let Some(host) = get_string_prop(node, "host") {
                    config.server.host = host;
                }
                if let Some(port) = get_int_prop(node, "port") {
                    config.server.port = u16::try_from(port).map_err(|_| ConfigError::InvalidValue {
                        field: "server port".to_string(),
                        message: format!("{} is out of range", port),
                    })?;
                }
            }
            "database" => {
                config.database = required_path(node, "database")?;
            }
            "mirror" => {
                config.mirror = get_first_string_arg(node).filter(|m| !m.is_empty());
            }
            "paths" => parse_paths(node, &mut config.paths)?,
            "branch" => {
                let branch = parse_branch(node)?;
                if !seen_branches.insert(branch.name.clone()) {
                    return Err(ConfigError::Duplicate(format!("branch '{}'", branch.name)));
                }
                config.branches.push(branch);
            }
            "retry-count-max" => {
                config.retry_count_max = positive_int(node, "retry-count-max")?;
            }
            "auto-get-repo-missing" => {
                config.auto_get_repo_missing = get_first_bool_arg(node).unwrap_or(true);
            }
            "poll-interval-secs" => {
                config.poll_interval_secs = positive_int(node, "poll-interval-secs")?.into();
            }
            "job-service" => {
                config.job_service = parse_job_service(node)?;
            }
            "sign" => {
                let private_key = get_string_prop(node, "private-key")
                    .ok_or_else(|| ConfigError::MissingField("sign private-key".to_string()))?;
                let public_key = get_string_prop(node, "public-key")
                    .ok_or_else(|| ConfigError::MissingField("sign public-key".to_string()))?;
                config.sign = Some(SignConfig {
                    private_key: PathBuf::from(private_key),
                    public_key,
                });
            }
            "tokens" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "job-callback" => config.tokens.job_callback = get_first_string_arg(child),
                            "push-hook-gitlab" => {
                                config.tokens.push_hook_gitlab = get_first_string_arg(child)
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if config.branches.is_empty() {
        return Err(ConfigError::MissingField("branch".to_string()));
    }

    Ok(config)
}

fn parse_paths(node: &KdlNode, paths: &mut PathsConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "temp" => paths.temp = required_path(child, "paths temp")?,
                "repo-final" => paths.repo_final = required_path(child, "paths repo-final")?,
                "repo-wip" => paths.repo_wip = required_path(child, "paths repo-wip")?,
                "tools" => paths.tools = required_path(child, "paths tools")?,
                _ => {}
            }
        }
    }
    Ok(())
}

fn parse_branch(node: &KdlNode) -> ConfigResult<BranchConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("branch name".to_string()))?;
    let ignore_errors = get_bool_prop(node, "ignore-errors").unwrap_or(false);

    let arches = node
        .children()
        .and_then(|c| c.nodes().iter().find(|n| n.name().value() == "arches"))
        .map(get_all_string_args)
        .unwrap_or_default();

    if arches.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "arches for branch '{}'",
            name
        )));
    }

    Ok(BranchConfig {
        name,
        arches,
        ignore_errors,
    })
}

fn parse_job_service(node: &KdlNode) -> ConfigResult<JobServiceConfig> {
    let kind = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job-service type".to_string()))?;

    match kind.as_str() {
        "local" => {
            let mut pmaports = PathBuf::from(DEFAULT_PMAPORTS);
            let mut pmbootstrap = PathBuf::from(DEFAULT_PMBOOTSTRAP);
            if let Some(children) = node.children() {
                for child in children.nodes() {
                    match child.name().value() {
                        "pmaports" => pmaports = required_path(child, "local pmaports")?,
                        "pmbootstrap" => pmbootstrap = required_path(child, "local pmbootstrap")?,
                        _ => {}
                    }
                }
            }
            Ok(JobServiceConfig::Local {
                pmaports,
                pmbootstrap,
            })
        }
        "sourcehut" => {
            let user = get_string_prop(node, "user").unwrap_or_else(|| "postmarketOS".to_string());
            let mut api_url = "https://builds.sr.ht".to_string();
            let mut secrets = Vec::new();

            if let Some(children) = node.children() {
                for child in children.nodes() {
                    match child.name().value() {
                        "api-url" => {
                            api_url = get_first_string_arg(child).ok_or_else(|| {
                                ConfigError::MissingField("sourcehut api-url".to_string())
                            })?;
                        }
                        "secret" => {
                            let id = get_first_string_arg(child).ok_or_else(|| {
                                ConfigError::MissingField("sourcehut secret id".to_string())
                            })?;
                            secrets.push(SecretConfig {
                                id,
                                job: get_string_prop(child, "job"),
                            });
                        }
                        _ => {}
                    }
                }
            }

            let api_url = Url::parse(&api_url).map_err(|e| ConfigError::InvalidValue {
                field: "sourcehut api-url".to_string(),
                message: e.to_string(),
            })?;

            Ok(JobServiceConfig::Sourcehut {
                user,
                api_url,
                secrets,
            })
        }
        _ => Err(ConfigError::InvalidValue {
            field: "job-service".to_string(),
            message: format!("unknown job service: {}", kind),
        }),
    }
}

fn required_path(node: &KdlNode, field: &str) -> ConfigResult<PathBuf> {
    get_first_string_arg(node)
        .map(PathBuf::from)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn positive_int(node: &KdlNode, field: &str) -> ConfigResult<u32> {
    let value = get_first_int_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a positive integer, got {}", value),
        })
}
