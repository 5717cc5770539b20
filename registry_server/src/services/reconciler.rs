//! Build reconciliation — merge the CI engine's build list with local
//! artifact state, apply retention, and recompute derived keys.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::{RegistryError, RegistryResult};
use crate::models::{Build, RepoId, Repository};
use crate::registry::Registry;
use crate::services::drone_service::SourceBuild;
use crate::services::retention::MaxAge;
use crate::storage::BlobStore;

/// Builds fetched per repository and cycle. Older builds are invisible to
/// reconciliation.
pub const SOURCE_PAGE_SIZE: usize = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub listed: usize,
    pub expired: usize,
    pub delete_failures: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reconciled: usize,
    pub failed: usize,
}

/// Register repositories the CI engine reports that the registry has not
/// seen yet. Known repositories are left as they are.
pub async fn sync_repositories(registry: &Registry) -> RegistryResult<usize> {
    let repos = registry
        .source
        .list_active_repositories()
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "Couldn't list repositories");
            RegistryError::upstream(e)
        })?;

    let mut added = 0;
    for source_repo in repos {
        let id = RepoId::new(&source_repo.namespace, &source_repo.name);
        if registry
            .store
            .insert_if_absent(Repository::new(&id, source_repo.link))
        {
            tracing::info!(namespace = %id.namespace, name = %id.name, "Discovered repository");
            added += 1;
        }
    }
    crate::metrics::repositories(registry.store.len());
    Ok(added)
}

/// Reconcile one repository under its lock. The caller snapshots.
pub async fn reconcile(registry: &Registry, id: &RepoId) -> RegistryResult<ReconcileOutcome> {
    let _guard = registry.store.lock(id).await;
    reconcile_locked(registry, id, Utc::now()).await
}

/// Reconcile a repository whose lock the caller already holds. If the CI
/// source fails, the stored repository is left untouched.
pub async fn reconcile_locked(
    registry: &Registry,
    id: &RepoId,
    now: DateTime<Utc>,
) -> RegistryResult<ReconcileOutcome> {
    let mut repo = registry
        .store
        .get(id)
        .ok_or_else(|| RegistryError::not_found(format!("Repository not found: {id}")))?;

    let started = Instant::now();
    let records = match registry
        .source
        .list_builds(&id.namespace, &id.name, SOURCE_PAGE_SIZE)
        .await
    {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(
                namespace = %id.namespace,
                name = %id.name,
                error = %e,
                "Couldn't list builds"
            );
            crate::metrics::reconciled("upstream_error");
            return Err(RegistryError::upstream(e));
        }
    };

    let outcome = merge_builds(
        &mut repo,
        records,
        registry.blobs.as_ref(),
        registry.max_age,
        now,
    )
    .await;
    registry.store.upsert(repo);

    crate::metrics::reconciled("ok");
    crate::metrics::reconcile_duration(started.elapsed().as_millis() as u64);
    tracing::debug!(
        namespace = %id.namespace,
        name = %id.name,
        listed = outcome.listed,
        expired = outcome.expired,
        "Reconciled builds"
    );
    Ok(outcome)
}

/// Overlay the CI engine's records on the stored builds.
///
/// Builds the source no longer lists are kept. For listed builds the
/// source's fields win while artifact path, last artifact change and tags
/// carry over.
pub async fn merge_builds(
    repo: &mut Repository,
    records: Vec<SourceBuild>,
    blobs: &dyn BlobStore,
    max_age: MaxAge,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    for record in records {
        if record.commit_hash.is_empty() {
            tracing::debug!(
                namespace = %repo.namespace,
                name = %repo.name,
                id = record.external_id,
                "Skipping build without commit hash"
            );
            continue;
        }
        outcome.listed += 1;

        let mut candidate = candidate_from(&record);
        if let Some(previous) = repo.builds.remove(&record.commit_hash) {
            candidate.artifact_path = previous.artifact_path;
            candidate.last_artifact_change = previous.last_artifact_change;
            candidate.tags = previous.tags;
        }
        if candidate.last_artifact_change.is_none() {
            candidate.last_artifact_change = Some(candidate.push_date);
        }
        if !candidate.branch.is_empty() {
            repo.branches.insert(candidate.branch.clone());
        }
        repo.builds.insert(record.commit_hash, candidate);
    }

    for (commit, build) in repo.builds.iter_mut() {
        let Some(path) = build.artifact_path.clone() else {
            continue;
        };
        if !max_age.is_expired_at(build.last_change(), now) {
            continue;
        }
        match blobs.delete_subtree(&path).await {
            Ok(()) => {
                tracing::info!(
                    namespace = %repo.namespace,
                    name = %repo.name,
                    commit = %commit,
                    %max_age,
                    "Deleted expired artifacts"
                );
                build.artifact_path = None;
                outcome.expired += 1;
                crate::metrics::artifacts_expired();
            }
            Err(e) => {
                // Path stays set so the next cycle retries.
                tracing::warn!(
                    namespace = %repo.namespace,
                    name = %repo.name,
                    commit = %commit,
                    error = %e,
                    "Couldn't delete expired artifacts"
                );
                outcome.delete_failures += 1;
                crate::metrics::artifact_delete_failed();
            }
        }
    }

    refresh_latest(repo, blobs).await;
    outcome
}

fn candidate_from(record: &SourceBuild) -> Build {
    let branch = if record.target_branch.is_empty() {
        record.source_branch.clone()
    } else {
        record.target_branch.clone()
    };
    Build {
        external_id: record.external_id,
        branch,
        title: record.title.lines().next().unwrap_or_default().to_string(),
        link: record.link.clone(),
        push_date: DateTime::from_timestamp(record.updated_unix, 0).unwrap_or_default(),
        last_artifact_change: None,
        artifact_path: None,
        tags: Default::default(),
    }
}

/// Recompute `latest_build` and `latest_non_empty_build`.
///
/// Ties on push date go to the build enumerated last.
pub async fn refresh_latest(repo: &mut Repository, blobs: &dyn BlobStore) {
    let mut latest: Option<(&String, DateTime<Utc>)> = None;
    let mut latest_non_empty: Option<(&String, DateTime<Utc>)> = None;

    for (commit, build) in &repo.builds {
        if latest.is_none_or(|(_, date)| build.push_date >= date) {
            latest = Some((commit, build.push_date));
        }
        if latest_non_empty.is_some_and(|(_, date)| build.push_date < date) {
            continue;
        }
        if build.is_empty() {
            continue;
        }
        if has_files(blobs, build.artifact_path.as_deref().unwrap_or_default()).await {
            latest_non_empty = Some((commit, build.push_date));
        }
    }

    let latest = latest.map(|(commit, _)| commit.clone());
    let latest_non_empty = latest_non_empty.map(|(commit, _)| commit.clone());
    repo.latest_build = latest;
    repo.latest_non_empty_build = latest_non_empty;
}

async fn has_files(blobs: &dyn BlobStore, path: &str) -> bool {
    blobs
        .list_dir(path)
        .await
        .map(|files| !files.is_empty())
        .unwrap_or(false)
}

/// Discover repositories, then reconcile each one with a time bound and
/// snapshot once. A failing repository does not stop the sweep.
pub async fn sweep(registry: &Registry, per_repository_timeout: Duration) -> SweepReport {
    if let Err(e) = sync_repositories(registry).await {
        tracing::warn!(error = %e, "Repository discovery failed, reconciling known repositories");
    }

    let mut report = SweepReport::default();
    for id in registry.store.ids() {
        match tokio::time::timeout(per_repository_timeout, reconcile(registry, &id)).await {
            Ok(Ok(_)) => report.reconciled += 1,
            Ok(Err(e)) => {
                tracing::warn!(
                    namespace = %id.namespace,
                    name = %id.name,
                    error = %e,
                    "Reconciliation failed"
                );
                report.failed += 1;
            }
            Err(_) => {
                tracing::warn!(
                    namespace = %id.namespace,
                    name = %id.name,
                    timeout_ms = per_repository_timeout.as_millis() as u64,
                    "Reconciliation timed out"
                );
                crate::metrics::reconciled("timeout");
                report.failed += 1;
            }
        }
    }

    if let Err(e) = registry.store.snapshot().await {
        tracing::error!(error = %e, "Couldn't persist registry after sweep");
    }
    tracing::info!(reconciled = report.reconciled, failed = report.failed, "Sweep finished");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tag;
    use crate::services::testing::{fixture, put_file, source_build};

    const DAY: i64 = 24 * 3600;

    fn acme() -> RepoId {
        RepoId::new("acme", "widget")
    }

    async fn seed_artifacts(fx: &crate::services::testing::Fixture, commit: &str) -> String {
        let path = format!("acme/widget/{commit}");
        fx.registry.blobs.create_dir(&path).await.unwrap();
        put_file(fx.registry.blobs.as_ref(), &format!("{path}/app.bin"), b"bits").await;
        path
    }

    #[tokio::test]
    async fn discovery_adds_unknown_repositories_once() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        assert_eq!(sync_repositories(&fx.registry).await.unwrap(), 1);
        assert_eq!(sync_repositories(&fx.registry).await.unwrap(), 0);
        let repo = fx.registry.store.get(&acme()).unwrap();
        assert_eq!(repo.link, "https://git.example/acme/widget");
        assert!(!repo.has_secret());
    }

    #[tokio::test]
    async fn derived_keys_follow_push_date() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        sync_repositories(&fx.registry).await.unwrap();
        fx.source.set_builds(
            &acme(),
            vec![
                source_build("c3", 3_000, "main"),
                source_build("c1", 1_000, "main"),
                source_build("c2", 2_000, ""),
            ],
        );

        // Only the oldest build has artifacts.
        let path = seed_artifacts(&fx, "c1").await;
        let mut repo = fx.registry.store.get(&acme()).unwrap();
        let mut build = Build::unlisted(DateTime::from_timestamp(1_000, 0).unwrap());
        build.artifact_path = Some(path);
        repo.builds.insert("c1".into(), build);
        fx.registry.store.upsert(repo);

        reconcile(&fx.registry, &acme()).await.unwrap();
        let repo = fx.registry.store.get(&acme()).unwrap();
        assert_eq!(repo.latest_build.as_deref(), Some("c3"));
        assert_eq!(repo.latest_non_empty_build.as_deref(), Some("c1"));
        // Empty target branch falls back to the source branch.
        assert_eq!(repo.builds["c2"].branch, "feature");
        assert_eq!(
            repo.branches.iter().cloned().collect::<Vec<_>>(),
            vec!["feature".to_string(), "main".to_string()]
        );
        assert_eq!(repo.builds["c3"].title, "Commit c3");
    }

    #[tokio::test]
    async fn empty_directory_is_not_latest_non_empty() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        sync_repositories(&fx.registry).await.unwrap();
        fx.source.set_builds(
            &acme(),
            vec![source_build("c1", 1_000, "main"), source_build("c2", 2_000, "main")],
        );

        let full = seed_artifacts(&fx, "c1").await;
        fx.registry.blobs.create_dir("acme/widget/c2").await.unwrap();
        let mut repo = fx.registry.store.get(&acme()).unwrap();
        for (commit, path) in [("c1", full), ("c2", "acme/widget/c2".to_string())] {
            let mut build = Build::unlisted(Utc::now());
            build.artifact_path = Some(path);
            repo.builds.insert(commit.into(), build);
        }
        fx.registry.store.upsert(repo);

        reconcile(&fx.registry, &acme()).await.unwrap();
        let repo = fx.registry.store.get(&acme()).unwrap();
        assert_eq!(repo.latest_build.as_deref(), Some("c2"));
        assert_eq!(repo.latest_non_empty_build.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let fx = fixture("30d");
        fx.source.add_repo("acme", "widget");
        sync_repositories(&fx.registry).await.unwrap();
        let now = Utc::now().timestamp();
        fx.source.set_builds(
            &acme(),
            vec![source_build("a", now - 100, "main"), source_build("b", now - 50, "dev")],
        );

        reconcile(&fx.registry, &acme()).await.unwrap();
        let first = fx.registry.store.get(&acme()).unwrap();
        reconcile(&fx.registry, &acme()).await.unwrap();
        let second = fx.registry.store.get(&acme()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn carried_over_state_survives_and_unlisted_builds_are_kept() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        sync_repositories(&fx.registry).await.unwrap();

        let path = seed_artifacts(&fx, "old").await;
        let changed = DateTime::from_timestamp(5_000, 0).unwrap();
        let mut repo = fx.registry.store.get(&acme()).unwrap();
        let mut old = Build::unlisted(DateTime::from_timestamp(10, 0).unwrap());
        old.artifact_path = Some(path.clone());
        old.last_artifact_change = Some(changed);
        old.tags.insert("release".into(), Tag { ready: true, ..Tag::default() });
        repo.builds.insert("old".into(), old);
        let gone = Build::unlisted(DateTime::from_timestamp(20, 0).unwrap());
        repo.builds.insert("gone".into(), gone);
        fx.registry.store.upsert(repo);

        fx.source.set_builds(&acme(), vec![source_build("old", 4_000, "main")]);
        reconcile(&fx.registry, &acme()).await.unwrap();

        let repo = fx.registry.store.get(&acme()).unwrap();
        let old = &repo.builds["old"];
        assert_eq!(old.artifact_path.as_deref(), Some(path.as_str()));
        assert_eq!(old.last_artifact_change, Some(changed));
        assert!(old.tags["release"].ready);
        assert_eq!(old.push_date, DateTime::from_timestamp(4_000, 0).unwrap());
        assert!(repo.builds.contains_key("gone"));
    }

    #[tokio::test]
    async fn unset_last_change_defaults_to_push_date() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        sync_repositories(&fx.registry).await.unwrap();
        fx.source.set_builds(&acme(), vec![source_build("a", 7_000, "main")]);
        reconcile(&fx.registry, &acme()).await.unwrap();
        let repo = fx.registry.store.get(&acme()).unwrap();
        assert_eq!(
            repo.builds["a"].last_artifact_change,
            DateTime::from_timestamp(7_000, 0)
        );
    }

    #[tokio::test]
    async fn expired_artifacts_are_deleted_and_path_cleared() {
        let fx = fixture("1d");
        fx.source.add_repo("acme", "widget");
        sync_repositories(&fx.registry).await.unwrap();
        let now = Utc::now().timestamp();
        fx.source.set_builds(
            &acme(),
            vec![
                source_build("stale", now - 3 * DAY, "main"),
                source_build("fresh", now - 60, "main"),
            ],
        );

        let stale = seed_artifacts(&fx, "stale").await;
        let fresh = seed_artifacts(&fx, "fresh").await;
        let mut repo = fx.registry.store.get(&acme()).unwrap();
        for (commit, path) in [("stale", stale.clone()), ("fresh", fresh.clone())] {
            let mut build = Build::unlisted(Utc::now());
            build.artifact_path = Some(path);
            repo.builds.insert(commit.into(), build);
        }
        fx.registry.store.upsert(repo);

        let outcome = reconcile(&fx.registry, &acme()).await.unwrap();
        assert_eq!(outcome.expired, 1);

        let repo = fx.registry.store.get(&acme()).unwrap();
        assert_eq!(repo.builds["stale"].artifact_path, None);
        assert!(!fx.registry.blobs.exists(&stale).await);
        assert_eq!(repo.builds["fresh"].artifact_path.as_deref(), Some(fresh.as_str()));
        assert_eq!(repo.latest_non_empty_build.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn failed_delete_keeps_path_for_retry() {
        let fx = fixture("1h");
        fx.source.add_repo("acme", "widget");
        sync_repositories(&fx.registry).await.unwrap();
        let now = Utc::now().timestamp();
        fx.source.set_builds(&acme(), vec![source_build("stale", now - DAY, "main")]);

        let stale = seed_artifacts(&fx, "stale").await;
        let mut repo = fx.registry.store.get(&acme()).unwrap();
        let mut build = Build::unlisted(Utc::now());
        build.artifact_path = Some(stale.clone());
        build.last_artifact_change = DateTime::from_timestamp(now - DAY, 0);
        repo.builds.insert("stale".into(), build);
        fx.registry.store.upsert(repo);

        fx.blobs.fail_deletes(true);
        let outcome = reconcile(&fx.registry, &acme()).await.unwrap();
        assert_eq!(outcome.delete_failures, 1);
        let repo = fx.registry.store.get(&acme()).unwrap();
        assert_eq!(repo.builds["stale"].artifact_path.as_deref(), Some(stale.as_str()));

        fx.blobs.fail_deletes(false);
        reconcile(&fx.registry, &acme()).await.unwrap();
        let repo = fx.registry.store.get(&acme()).unwrap();
        assert_eq!(repo.builds["stale"].artifact_path, None);
    }

    #[tokio::test]
    async fn upstream_failure_leaves_state_untouched() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        sync_repositories(&fx.registry).await.unwrap();
        fx.source.set_builds(&acme(), vec![source_build("a", 1_000, "main")]);
        reconcile(&fx.registry, &acme()).await.unwrap();
        let before = fx.registry.store.get(&acme()).unwrap();

        fx.source.set_down(true);
        let err = reconcile(&fx.registry, &acme()).await.unwrap_err();
        assert!(matches!(err, RegistryError::UpstreamUnavailable(_)));
        assert_eq!(fx.registry.store.get(&acme()).unwrap(), before);
    }

    #[tokio::test]
    async fn sweep_continues_past_failing_repository() {
        let fx = fixture("");
        fx.source.add_repo("acme", "widget");
        sync_repositories(&fx.registry).await.unwrap();
        // Known locally but no longer reported: reconciles with an empty list.
        fx.registry
            .store
            .upsert(Repository::new(&RepoId::new("acme", "legacy"), ""));
        fx.source.set_builds(&acme(), vec![source_build("a", 1_000, "main")]);

        let report = sweep(&fx.registry, Duration::from_secs(5)).await;
        assert_eq!(report, SweepReport { reconciled: 2, failed: 0 });
        assert!(fx.dir.path().join("storage.json").exists());

        fx.source.set_down(true);
        let report = sweep(&fx.registry, Duration::from_secs(5)).await;
        assert_eq!(report, SweepReport { reconciled: 0, failed: 2 });
    }

    #[tokio::test]
    async fn sweep_isolates_a_failing_repository() {
        let fx = fixture("");
        let broken = RepoId::new("broken", "app");
        fx.source.add_repo("acme", "widget");
        fx.source.add_repo("broken", "app");
        fx.source.set_builds(&acme(), vec![source_build("a", 1_000, "main")]);
        fx.source.set_builds(&broken, vec![source_build("b", 1_000, "main")]);
        fx.source.fail_repo(&broken);

        let report = sweep(&fx.registry, Duration::from_secs(5)).await;
        assert_eq!(report, SweepReport { reconciled: 1, failed: 1 });
        assert!(fx.registry.store.get(&acme()).unwrap().builds.contains_key("a"));
        assert!(fx.registry.store.get(&broken).unwrap().builds.is_empty());
    }

    #[tokio::test]
    async fn sweep_bounds_a_stalled_repository() {
        let fx = fixture("");
        let slow = RepoId::new("slow", "app");
        fx.source.add_repo("slow", "app");
        fx.source.add_repo("acme", "widget");
        fx.source.set_builds(&acme(), vec![source_build("a", 1_000, "main")]);
        fx.source.stall_repo(&slow);

        let report = sweep(&fx.registry, Duration::from_millis(100)).await;
        assert_eq!(report, SweepReport { reconciled: 1, failed: 1 });
        assert!(fx.registry.store.get(&acme()).unwrap().builds.contains_key("a"));
        assert!(fx.registry.store.get(&slow).unwrap().builds.is_empty());

        // The timed-out reconcile released the repository lock.
        let lock = fx.registry.store.lock(&slow);
        assert!(tokio::time::timeout(Duration::from_secs(1), lock).await.is_ok());
    }
}
