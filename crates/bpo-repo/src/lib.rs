//! Package repositories for the bpo build coordinator.
//!
//! Built packages land in the WIP repository first. Once a whole batch of a
//! branch and architecture is built, it gets promoted into the final
//! repository together with a freshly generated and signed index.

pub mod error;
pub mod layout;
pub mod manager;
pub mod tools;

pub use error::{RepoError, RepoResult};
pub use layout::{ApkFile, RepoLayout};
pub use manager::{Promotion, RepoManager};
pub use tools::{ApkTools, RepoTools, prepare_tools};
