//! Registry data model — repositories, builds, and release tags.

pub mod build;
pub mod repository;
pub mod tag;

pub use build::Build;
pub use repository::{RepoId, Repository};
pub use tag::Tag;
