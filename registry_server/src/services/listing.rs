//! Paged, newest-first views of a repository's builds.

use crate::error::{RegistryError, RegistryResult};
use crate::models::Repository;

pub const BUILDS_PER_PAGE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPage {
    /// Commit hashes on this page, newest push first.
    pub order: Vec<String>,
    pub page: usize,
    pub page_count: usize,
}

/// Commit hashes sorted by push date, newest first. Empty keys are skipped;
/// equal push dates keep map order.
pub fn sorted_commits(repo: &Repository) -> Vec<&String> {
    let mut commits: Vec<&String> = repo.builds.keys().filter(|k| !k.is_empty()).collect();
    commits.sort_by(|a, b| repo.builds[*b].push_date.cmp(&repo.builds[*a].push_date));
    commits
}

pub fn page_count(repo: &Repository, per_page: usize) -> usize {
    let per_page = per_page.max(1);
    let total = repo.builds.keys().filter(|k| !k.is_empty()).count();
    total.div_ceil(per_page)
}

/// Build keys for the 1-based `page`.
pub fn paginate(repo: &Repository, page: usize, per_page: usize) -> RegistryResult<BuildPage> {
    let per_page = per_page.max(1);
    let page_count = page_count(repo, per_page);
    if page < 1 || page > page_count {
        return Err(RegistryError::invalid(format!(
            "Invalid page {page}, {} has {page_count} page(s)",
            repo.id()
        )));
    }

    let order = sorted_commits(repo)
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .cloned()
        .collect();
    Ok(BuildPage {
        order,
        page,
        page_count,
    })
}
