//! Repository traits and implementations.

pub mod image;
pub mod log;
pub mod package;
pub mod push;

pub use image::{ImageRepo, SqliteImageRepo};
pub use log::{LogRecord, LogRepo, SqliteLogRepo};
pub use package::{PackageRepo, SqlitePackageRepo, UpsertChange, Upserted};
pub use push::{PushRepo, SqlitePushRepo};
