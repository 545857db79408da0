//! Request handlers.
//!
//! Store calls are synchronous and may fsync, so every handler body runs on
//! the blocking pool.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::ids::{ApplicationId, PolicyId, SubjectId};
use crate::policy::{Policy, PolicySet};
use crate::session::Session;

use super::error::{ApiError, ApiResult};
use super::AppState;

/// Header naming the calling application.
pub const APPLICATION_ID_HEADER: &str = "application-id";

/// Path alias for the session's own subject.
pub const CURRENT_SUBJECT: &str = "current";

/// Optional `applicationId` query parameter.
#[derive(Debug, Default, Deserialize)]
pub struct ApplicationQuery {
    /// Application scoping the request.
    #[serde(rename = "applicationId")]
    pub application_id: Option<String>,
}

/// Links of a user view.
#[derive(Debug, Serialize)]
pub struct UserLinks {
    /// Path of the user's policies.
    pub policies: String,
}

/// One user in a `GET /users/:id` response.
#[derive(Debug, Serialize)]
pub struct UserView {
    /// Id as addressed in the path.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Related resources.
    pub links: UserLinks,
}

/// Body of `GET /users/:id`.
#[derive(Debug, Serialize)]
pub struct UsersResponse {
    /// The addressed user.
    pub users: Vec<UserView>,
}

/// Body of the policy listings.
#[derive(Debug, Serialize)]
pub struct PoliciesResponse {
    /// Policies ordered by id.
    pub policies: Vec<Policy>,
}

/// User fields accepted by `PUT /users/:id`.
#[derive(Debug, Deserialize)]
pub struct UserUpdate {
    /// Requested policies inside the application scope.
    pub policies: Option<Vec<String>>,
}

/// Body of `PUT /users/:id`.
#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    /// The update.
    pub user: Option<UserUpdate>,
}

/// User as stored after an update.
#[derive(Debug, Serialize)]
pub struct UpdatedUser {
    /// Id as addressed in the path.
    pub id: String,
    /// Display name.
    pub name: String,
    /// All consented policies after the update.
    pub policies: PolicySet,
}

/// Body returned by `PUT /users/:id`.
#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    /// The updated user.
    pub user: UpdatedUser,
}

async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ApiResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(crate::error::RelayError::internal(format!("handler task failed: {e}"))))?
}

fn session(state: &AppState, headers: &HeaderMap) -> ApiResult<Session> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing session"))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("expected a bearer session token"))?;
    Ok(state.sessions.verify(token)?)
}

/// Query parameter wins over the header.
fn application_id(query: &ApplicationQuery, headers: &HeaderMap) -> ApiResult<Option<ApplicationId>> {
    let raw = match &query.application_id {
        Some(raw) => Some(raw.as_str()),
        None => headers.get(APPLICATION_ID_HEADER).and_then(|v| v.to_str().ok()),
    };
    match raw {
        Some(raw) if !raw.trim().is_empty() => Ok(Some(ApplicationId::parse(raw)?)),
        _ => Ok(None),
    }
}

/// Maps the path id to a subject the session may act on.
fn target_subject(raw: &str, session: &Session) -> ApiResult<SubjectId> {
    if raw == CURRENT_SUBJECT {
        return Ok(session.subject_id.clone());
    }
    let id = SubjectId::parse(raw)?;
    if id != session.subject_id && !session.admin {
        return Err(ApiError::unauthorized("Current user is not authorized to do this"));
    }
    Ok(id)
}

/// Policies an application needs; all applications' when none is given.
/// An unknown application has an empty scope.
fn scope(state: &AppState, application: Option<&ApplicationId>) -> ApiResult<PolicySet> {
    match application {
        Some(id) => Ok(state
            .applications
            .get_application(id)?
            .map(|app| app.needed_set())
            .unwrap_or_default()),
        None => Ok(state
            .applications
            .list_applications()?
            .iter()
            .fold(PolicySet::new(), |acc, app| acc.union(&app.needed_set()))),
    }
}

/// `GET /policies[?applicationId=]`
pub async fn list_policies(
    State(state): State<AppState>,
    Query(query): Query<ApplicationQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<PoliciesResponse>> {
    let application = application_id(&query, &headers)?;
    tracing::debug!(application = ?application.as_ref().map(ApplicationId::as_str), "listing policies");

    blocking(move || {
        let policies = match application {
            Some(app) => {
                let filter = scope(&state, Some(&app))?;
                state.policies.list_policies(Some(&filter))?
            }
            None => state.policies.list_policies(None)?,
        };
        Ok(Json(PoliciesResponse { policies }))
    })
    .await
}

/// `GET /users/:id`
pub async fn get_user(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<UsersResponse>> {
    let session = session(&state, &headers)?;
    let subject_id = target_subject(&raw_id, &session)?;
    tracing::debug!(subject_id = %subject_id, "get subject");

    blocking(move || {
        let subject = state
            .subjects
            .get_subject(&subject_id)?
            .ok_or_else(|| ApiError::subject_not_found(subject_id.as_str()))?;
        Ok(Json(UsersResponse {
            users: vec![UserView {
                links: UserLinks {
                    policies: format!("/users/{raw_id}/policies"),
                },
                id: raw_id,
                name: subject.name,
            }],
        }))
    })
    .await
}

/// `GET /users/:id/policies[?applicationId=]`
pub async fn get_user_policies(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Query(query): Query<ApplicationQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<PoliciesResponse>> {
    let session = session(&state, &headers)?;
    let subject_id = target_subject(&raw_id, &session)?;
    let application = application_id(&query, &headers)?;
    tracing::debug!(subject_id = %subject_id, "get subject policies");

    blocking(move || {
        let subject = state
            .subjects
            .get_subject(&subject_id)?
            .ok_or_else(|| ApiError::subject_not_found(subject_id.as_str()))?;
        let mut filter = subject.policies;
        if let Some(app) = application {
            filter = filter.intersection(&scope(&state, Some(&app))?);
        }
        let policies = state.policies.list_policies(Some(&filter))?;
        Ok(Json(PoliciesResponse { policies }))
    })
    .await
}

/// `PUT /users/:id` with `{"user": {"policies": [...]}}`
///
/// Only policies inside the application scope are replaced:
/// `new = (stored − scope) ∪ (requested ∩ scope)`.
pub async fn put_user(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Query(query): Query<ApplicationQuery>,
    headers: HeaderMap,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> ApiResult<Json<UpdateResponse>> {
    let session = session(&state, &headers)?;
    let subject_id = target_subject(&raw_id, &session)?;
    let application = application_id(&query, &headers)?;

    let Json(request) = body.map_err(|_| ApiError::bad_request("user"))?;
    let requested = request
        .user
        .and_then(|user| user.policies)
        .ok_or_else(|| ApiError::bad_request("user.policies"))?
        .iter()
        .map(|raw| PolicyId::parse(raw))
        .collect::<Result<PolicySet, _>>()?;

    blocking(move || {
        let scope = scope(&state, application.as_ref())?;
        let mut subject = state
            .subjects
            .get_subject(&subject_id)?
            .ok_or_else(|| ApiError::subject_not_found(subject_id.as_str()))?;

        subject.policies = subject
            .policies
            .difference(&scope)
            .union(&requested.intersection(&scope));

        let result = state.subjects.update_subject(&subject_id, subject.clone())?;
        if result.matched == 0 {
            return Err(ApiError::subject_not_found(subject_id.as_str()));
        }
        tracing::debug!(
            subject_id = %subject_id,
            changed = result.changed,
            policies = subject.policies.len(),
            "subject consent updated"
        );

        Ok(Json(UpdateResponse {
            user: UpdatedUser {
                id: raw_id,
                name: subject.name,
                policies: subject.policies,
            },
        }))
    })
    .await
}
