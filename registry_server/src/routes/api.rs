//! REST API for repositories, builds, artifacts and tags.

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, Request, State};
use axum::http::header::CONTENT_DISPOSITION;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::error::{RegistryError, RegistryResult};
use crate::models::tag::DEFAULT_TAG;
use crate::models::{Build, RepoId, Repository, Tag};
use crate::routes::AppState;
use crate::services::artifact_service::UploadedFile;
use crate::services::{artifact_service, key_service, listing, tag_service};
use crate::storage::{human_size, StagedBlob};

#[derive(Debug, Serialize)]
pub struct FileJson {
    pub name: String,
    /// Human-readable, e.g. `1.5M`.
    pub size: String,
}

/// JSON response for a build with its files.
#[derive(Debug, Serialize)]
pub struct BuildJson {
    pub id: i64,
    pub commit: String,
    pub name: String,
    pub date: DateTime<Utc>,
    pub link: String,
    pub branch: String,
    pub files: Vec<FileJson>,
    pub tags: BTreeMap<String, Tag>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoJson {
    pub namespace: String,
    pub name: String,
    pub link: String,
    pub build_page_count: usize,
    pub branches: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPageJson {
    pub order: Vec<String>,
    pub builds: BTreeMap<String, BuildJson>,
    pub page_count: usize,
}

#[derive(Debug, Serialize)]
pub struct PushJson {
    pub id: i64,
    pub link: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSummaryJson {
    pub namespace: String,
    pub name: String,
    pub latest_commit: String,
    pub latest_push: PushJson,
    pub secret: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewKeyRequest {
    #[serde(default)]
    pub new_secret: bool,
}

#[derive(Debug, Serialize)]
pub struct NewKeyResponse {
    /// Long-lived repository refresh token, exchanged at `/repo/{ns}/{name}/token`.
    pub key: String,
}

async fn build_json(state: &AppState, commit: &str, build: &Build) -> BuildJson {
    let files = artifact_service::build_files(&state.registry, build)
        .await
        .into_iter()
        .map(|f| FileJson {
            name: f.name,
            size: human_size(f.size),
        })
        .collect();
    BuildJson {
        id: build.external_id,
        commit: commit.to_string(),
        name: build.title.clone(),
        date: build.push_date,
        link: build.link.clone(),
        branch: build.branch.clone(),
        files,
        tags: build.tags.clone(),
    }
}

fn find_repo(state: &AppState, id: &RepoId) -> RegistryResult<Repository> {
    state
        .registry
        .store
        .get(id)
        .ok_or_else(|| RegistryError::not_found(format!("Repository not found: {id}")))
}

async fn serve_path(path: PathBuf, req: Request) -> Response {
    match ServeFile::new(path).oneshot(req).await {
        Ok(res) => res.map(Body::new),
        Err(never) => match never {},
    }
}

fn body_json<T>(body: Result<Json<T>, JsonRejection>) -> RegistryResult<T> {
    body.map(|Json(v)| v)
        .map_err(|e| RegistryError::invalid(format!("Invalid request body: {}", e.body_text())))
}

// ── Public reads ──

pub async fn repo_info(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> RegistryResult<Json<RepoJson>> {
    let repo = find_repo(&state, &RepoId::new(namespace, name))?;
    Ok(Json(RepoJson {
        build_page_count: listing::page_count(&repo, state.builds_per_page),
        branches: repo.branches.iter().cloned().collect(),
        namespace: repo.namespace,
        name: repo.name,
        link: repo.link,
    }))
}

pub async fn list_builds(
    State(state): State<AppState>,
    Path((namespace, name, page)): Path<(String, String, String)>,
) -> RegistryResult<Json<BuildPageJson>> {
    let page: usize = page
        .parse()
        .map_err(|_| RegistryError::invalid(format!("Invalid page: {page:?}")))?;
    let repo = find_repo(&state, &RepoId::new(namespace, name))?;
    let page = listing::paginate(&repo, page, state.builds_per_page)?;

    let mut builds = BTreeMap::new();
    for commit in &page.order {
        if let Some(build) = repo.builds.get(commit) {
            builds.insert(commit.clone(), build_json(&state, commit, build).await);
        }
    }
    Ok(Json(BuildPageJson {
        order: page.order,
        builds,
        page_count: page.page_count,
    }))
}

pub async fn get_build(
    State(state): State<AppState>,
    Path((namespace, name, commit)): Path<(String, String, String)>,
) -> RegistryResult<Json<BuildJson>> {
    let id = RepoId::new(namespace, name);
    let repo = find_repo(&state, &id)?;
    let build = repo
        .builds
        .get(&commit)
        .ok_or_else(|| RegistryError::not_found(format!("Build not found: {id}@{commit}")))?;
    Ok(Json(build_json(&state, &commit, build).await))
}

pub async fn get_latest(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> RegistryResult<Json<BuildJson>> {
    let id = RepoId::new(namespace, name);
    let repo = find_repo(&state, &id)?;
    let (commit, build) = repo
        .latest_non_empty()
        .ok_or_else(|| RegistryError::not_found(format!("No builds with artifacts in {id}")))?;
    Ok(Json(build_json(&state, commit, build).await))
}

pub async fn get_latest_file(
    State(state): State<AppState>,
    Path((namespace, name, query)): Path<(String, String, String)>,
    req: Request,
) -> RegistryResult<Response> {
    let id = RepoId::new(namespace, name);
    let (file_name, path) = artifact_service::find_latest_file(&state.registry, &id, &query).await?;

    let mut res = serve_path(path, req).await;
    let disposition = format!("attachment; filename=\"{}\"", file_name.replace('"', "'"));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        res.headers_mut().insert(CONTENT_DISPOSITION, value);
    }
    Ok(res)
}

pub async fn get_build_file(
    State(state): State<AppState>,
    Path((namespace, name, commit, file)): Path<(String, String, String, String)>,
    req: Request,
) -> RegistryResult<Response> {
    let id = RepoId::new(namespace, name);
    let path = artifact_service::resolve_file(&state.registry, &id, &commit, &file).await?;
    Ok(serve_path(path, req).await)
}

pub async fn get_tag(
    State(state): State<AppState>,
    Path((namespace, name, commit, tag)): Path<(String, String, String, String)>,
) -> RegistryResult<Json<Tag>> {
    let id = RepoId::new(namespace, name);
    tag_service::get_tag(&state.registry, &id, &commit, &tag).map(Json)
}

// ── Build-token writes ──

fn form_error(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::invalid(format!("Form error: {e}"))
}

/// Stream one multipart field into `blob`.
async fn write_field(
    mut blob: StagedBlob,
    field: &mut Field<'_>,
) -> RegistryResult<(String, u64)> {
    while let Some(chunk) = field.chunk().await.map_err(form_error)? {
        blob.write_chunk(&chunk).await?;
    }
    Ok(blob.finish().await?)
}

/// Stage every file field of the form. Fields without a file name are
/// skipped. Files staged before a failure are left in `files`.
async fn stage_files(
    state: &AppState,
    multipart: &mut Multipart,
    files: &mut Vec<UploadedFile>,
) -> RegistryResult<()> {
    while let Some(mut field) = multipart.next_field().await.map_err(form_error)? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let name = field
            .name()
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or(file_name);

        let blob = state.registry.blobs.stage().await?;
        let staging = blob.name().to_string();
        match write_field(blob, &mut field).await {
            Ok((staged, size)) => files.push(UploadedFile { name, staged, size }),
            Err(e) => {
                if let Err(io) = state.registry.blobs.discard_staged(&staging).await {
                    tracing::warn!(file = %name, error = %io, "Failed to remove staged upload");
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

pub async fn upload(
    State(state): State<AppState>,
    Path((namespace, name, commit)): Path<(String, String, String)>,
    multipart: Result<Multipart, MultipartRejection>,
) -> RegistryResult<StatusCode> {
    let mut multipart = multipart
        .map_err(|e| RegistryError::invalid(format!("Invalid upload: {}", e.body_text())))?;
    let id = RepoId::new(namespace, name);

    let mut files = Vec::new();
    if let Err(e) = stage_files(&state, &mut multipart, &mut files).await {
        artifact_service::discard_upload(&state.registry, &files).await;
        return Err(e);
    }

    artifact_service::ingest(&state.registry, &id, &commit, files).await?;
    Ok(StatusCode::OK)
}

pub async fn set_default_tag(
    State(state): State<AppState>,
    Path((namespace, name, commit)): Path<(String, String, String)>,
    body: Result<Json<Tag>, JsonRejection>,
) -> RegistryResult<Json<Tag>> {
    let incoming = body_json(body)?;
    let id = RepoId::new(namespace, name);
    tag_service::set_tag(&state.registry, &id, &commit, DEFAULT_TAG, incoming)
        .await
        .map(Json)
}

pub async fn set_tag(
    State(state): State<AppState>,
    Path((namespace, name, commit, tag)): Path<(String, String, String, String)>,
    body: Result<Json<Tag>, JsonRejection>,
) -> RegistryResult<Json<Tag>> {
    let incoming = body_json(body)?;
    let id = RepoId::new(namespace, name);
    tag_service::set_tag(&state.registry, &id, &commit, &tag, incoming)
        .await
        .map(Json)
}

// ── Admin ──

pub async fn new_key(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    body: Result<Json<NewKeyRequest>, JsonRejection>,
) -> RegistryResult<Json<NewKeyResponse>> {
    let req = body_json(body)?;
    let id = RepoId::new(namespace, name);
    let key =
        key_service::issue_repository_key(&state.registry, &state.repo_codec, &id, req.new_secret)
            .await?;
    Ok(Json(NewKeyResponse { key }))
}

pub async fn list_repos(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, RepoSummaryJson>> {
    let summary = state
        .registry
        .store
        .list()
        .into_iter()
        .map(|repo| {
            let latest = repo.latest();
            let latest_push = PushJson {
                id: latest.map(|(_, b)| b.external_id).unwrap_or_default(),
                link: latest.map(|(_, b)| b.link.clone()).unwrap_or_default(),
                date: latest.map(|(_, b)| b.push_date),
            };
            let summary = RepoSummaryJson {
                latest_commit: latest.map(|(c, _)| c.clone()).unwrap_or_default(),
                latest_push,
                secret: repo.has_secret(),
                namespace: repo.namespace.clone(),
                name: repo.name.clone(),
            };
            (repo.id().key(), summary)
        })
        .collect();
    Json(summary)
}
