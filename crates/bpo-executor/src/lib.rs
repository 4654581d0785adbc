//! Job backends for the bpo build coordinator.
//!
//! - Local: runs task scripts in-process, completion is polled
//! - Sourcehut: submits build manifests to builds.sr.ht, results arrive
//!   through callbacks

pub mod local;
pub mod sourcehut;

pub use local::LocalBackend;
pub use sourcehut::{SourcehutBackend, get_secrets_by_job_name};

use bpo_config::{JobServiceConfig, SystemConfig};
use bpo_core::{Error, JobBackend, Result};
use std::sync::Arc;

/// Build the backend selected in the configuration.
///
/// The sourcehut backend needs an API token, which is never part of the
/// configuration file.
pub fn from_config(
    config: &SystemConfig,
    sourcehut_token: Option<String>,
) -> Result<Arc<dyn JobBackend>> {
    match &config.job_service {
        JobServiceConfig::Local {
            pmaports,
            pmbootstrap,
        } => Ok(Arc::new(LocalBackend::new(
            config.paths.temp.join("local_jobs"),
            pmaports.clone(),
            pmbootstrap.clone(),
        ))),
        JobServiceConfig::Sourcehut {
            user,
            api_url,
            secrets,
        } => {
            let token = sourcehut_token.ok_or_else(|| {
                Error::InvalidInput("sourcehut job service requires an API token".to_string())
            })?;
            Ok(Arc::new(SourcehutBackend::new(
                api_url.clone(),
                user.clone(),
                token,
                secrets.clone(),
            )))
        }
    }
}
