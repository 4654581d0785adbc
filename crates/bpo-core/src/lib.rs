//! Core domain types and traits for the bpo build coordinator.
//!
//! This crate contains:
//! - Package, image and push types and their status enums
//! - The job backend trait and job types
//! - Dependency report parsing
//! - Audit log entries

pub mod error;
pub mod id;
pub mod image;
pub mod job;
pub mod log;
pub mod package;
pub mod push;
pub mod report;

pub use error::{Error, Result};
pub use id::JobId;
pub use image::{Image, ImageStatus};
pub use job::{JobArtifact, JobBackend, JobStatus, JobTasks};
pub use log::LogEntry;
pub use package::{BranchArch, Package, PackageStatus};
pub use push::{CommitInfo, Push, PushEvent};
pub use report::{DependencyReport, ReportEntry};
