//! A HTTP+JSON API for the coordination service.
//!
//! Envelope payloads travel as standard base64 strings. Errors of the coordination service are
//! answered with a status code derived from their [`ErrorKind`] and a JSON body of the form
//! `{"error": "<kind>", "message": "<text>"}`.

use std::{convert::Infallible, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn};
use tracing_futures::Instrument;
use warp::{
    filters::{body::BodyDeserializeError, BoxedFilter},
    http::StatusCode,
    reject::{self, Reject, Rejection},
    reply::{self, Reply, Response},
    Filter,
};

use crate::{
    catalog::{NewProject, TaskSpec},
    common::{EnvelopeId, ProjectId, RunId, SiteId},
    error::{CoordinationError, CoordinationResult, ErrorKind},
    registry::SiteStatus,
    relay::{Envelope, EnvelopeKind, Outgoing},
    services::{CoordinationService, RunView},
    settings::ApiSettings,
    state_machine::RunState,
};

#[derive(Deserialize)]
struct RegisterSiteRequest {
    name: String,
    #[serde(default)]
    description: String,
    declared_identity: String,
}

#[derive(Deserialize)]
struct UpdateSiteRequest {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct SiteLookupQuery {
    uid: String,
}

#[derive(Deserialize)]
struct InboxQuery {
    #[serde(default)]
    since: u64,
    run: Option<RunId>,
}

#[derive(Deserialize)]
struct ProjectLookupQuery {
    name: String,
}

#[derive(Deserialize)]
struct UpdateTasksRequest {
    initiator: SiteId,
    tasks: Vec<TaskSpec>,
}

#[derive(Deserialize)]
struct JoinProjectRequest {
    site_id: SiteId,
}

#[derive(Deserialize)]
struct CreateRunRequest {
    project_id: ProjectId,
    initiator: SiteId,
}

#[derive(Deserialize)]
struct InitiatorRequest {
    initiator: SiteId,
}

#[derive(Deserialize)]
struct StopRunRequest {
    initiator: SiteId,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct FailRunRequest {
    reason: String,
}

#[derive(Deserialize)]
struct SubmitResultRequest {
    round: u32,
    sender: SiteId,
    /// Base64 encoded.
    payload: String,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    round: u32,
    sender: SiteId,
    recipient: SiteId,
    kind: EnvelopeKind,
    /// Base64 encoded.
    payload: String,
}

#[derive(Serialize)]
struct SiteCreated {
    site_id: SiteId,
    status: SiteStatus,
}

#[derive(Serialize)]
struct HeartbeatReply {
    last_seen: DateTime<Utc>,
}

#[derive(Serialize)]
struct StatusReply {
    status: SiteStatus,
}

#[derive(Serialize)]
struct ProjectCreated {
    project_id: ProjectId,
}

#[derive(Serialize)]
struct RunCreated {
    run_id: RunId,
    state: RunState,
}

#[derive(Serialize)]
struct RunTransition {
    run_id: RunId,
    state: RunState,
    round: u32,
}

impl From<RunView> for RunTransition {
    fn from(view: RunView) -> Self {
        Self {
            run_id: view.run_id,
            state: view.state,
            round: view.round,
        }
    }
}

#[derive(Serialize)]
struct EnvelopeSent {
    envelope_id: EnvelopeId,
}

#[derive(Serialize)]
struct EnvelopeReply {
    envelope_id: EnvelopeId,
    run_id: RunId,
    round: u32,
    sender_id: SiteId,
    recipient_id: SiteId,
    kind: EnvelopeKind,
    /// Base64 encoded.
    payload: String,
    created_at: DateTime<Utc>,
    delivered: bool,
}

impl From<Envelope> for EnvelopeReply {
    fn from(envelope: Envelope) -> Self {
        Self {
            envelope_id: envelope.id,
            run_id: envelope.run_id,
            round: envelope.round,
            sender_id: envelope.sender,
            recipient_id: envelope.recipient,
            kind: envelope.kind,
            payload: STANDARD.encode(&envelope.payload),
            created_at: envelope.created_at,
            delivered: envelope.delivered,
        }
    }
}

#[derive(Serialize)]
struct ErrorReply {
    error: String,
    message: String,
}

/// Starts a HTTP server at the configured address.
///
/// # Errors
/// Fails if the server cannot be bound to the address.
pub async fn serve(
    api_settings: ApiSettings,
    service: Arc<CoordinationService>,
) -> Result<(), RestError> {
    let (address, server) =
        warp::serve(routes(&api_settings, service)).try_bind_ephemeral(api_settings.bind_address)?;
    info!(%address, "REST API listening");
    server.await;
    Ok(())
}

/// Builds the routes of the API.
pub fn routes(
    api_settings: &ApiSettings,
    service: Arc<CoordinationService>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let limit = api_settings.max_body_size;
    authorized(api_settings.auth_token.clone())
        .and(
            site_routes(service.clone(), limit)
                .or(project_routes(service.clone(), limit))
                .unify()
                .or(run_routes(service, limit))
                .unify(),
        )
        .recover(handle_reject)
        .unify()
        .with(warp::log("http"))
}

fn site_routes(service: Arc<CoordinationService>, limit: u64) -> BoxedFilter<(Response,)> {
    let register = warp::path!("sites")
        .and(warp::post())
        .and(json_body::<RegisterSiteRequest>(limit))
        .and(with_service(service.clone()))
        .and_then(handle_register_site);

    let lookup = warp::path!("sites" / "lookup")
        .and(warp::get())
        .and(warp::query::<SiteLookupQuery>())
        .and(with_service(service.clone()))
        .and_then(|query: SiteLookupQuery, service: Arc<CoordinationService>| async move {
            ok(reply_json(service.lookup_site(&query.uid).await, StatusCode::OK))
        });

    let get = warp::path!("sites" / SiteId)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(|site: SiteId, service: Arc<CoordinationService>| async move {
            ok(reply_json(service.get_site(site).await, StatusCode::OK))
        });

    let update = warp::path!("sites" / SiteId)
        .and(warp::put())
        .and(json_body::<UpdateSiteRequest>(limit))
        .and(with_service(service.clone()))
        .and_then(
            |site: SiteId,
             request: UpdateSiteRequest,
             service: Arc<CoordinationService>| async move {
                let result = service
                    .update_site(site, &request.name, &request.description)
                    .await;
                ok(reply_json(result, StatusCode::OK))
            },
        );

    let deregister = warp::path!("sites" / SiteId)
        .and(warp::delete())
        .and(with_service(service.clone()))
        .and_then(handle_deregister_site);

    let heartbeat = warp::path!("sites" / SiteId / "heartbeat")
        .and(warp::post())
        .and(with_service(service.clone()))
        .and_then(|site: SiteId, service: Arc<CoordinationService>| async move {
            let result = service
                .heartbeat(site)
                .await
                .map(|last_seen| HeartbeatReply { last_seen });
            ok(reply_json(result, StatusCode::OK))
        });

    let unreachable = warp::path!("sites" / SiteId / "unreachable")
        .and(warp::post())
        .and(with_service(service.clone()))
        .and_then(|site: SiteId, service: Arc<CoordinationService>| async move {
            let result = service
                .mark_unreachable(site)
                .await
                .map(|status| StatusReply { status });
            ok(reply_json(result, StatusCode::OK))
        });

    let projects = warp::path!("sites" / SiteId / "projects")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(|site: SiteId, service: Arc<CoordinationService>| async move {
            ok(reply_json(service.list_projects(site).await, StatusCode::OK))
        });

    let inbox = warp::path!("sites" / SiteId / "inbox")
        .and(warp::get())
        .and(warp::query::<InboxQuery>())
        .and(with_service(service))
        .and_then(handle_poll_inbox);

    register
        .or(lookup)
        .unify()
        .or(get)
        .unify()
        .or(update)
        .unify()
        .or(deregister)
        .unify()
        .or(heartbeat)
        .unify()
        .or(unreachable)
        .unify()
        .or(projects)
        .unify()
        .or(inbox)
        .unify()
        .boxed()
}

fn project_routes(service: Arc<CoordinationService>, limit: u64) -> BoxedFilter<(Response,)> {
    let create = warp::path!("projects")
        .and(warp::post())
        .and(json_body::<NewProject>(limit))
        .and(with_service(service.clone()))
        .and_then(|new: NewProject, service: Arc<CoordinationService>| async move {
            let result = service
                .create_project(new)
                .await
                .map(|project| ProjectCreated {
                    project_id: project.id,
                });
            ok(reply_json(result, StatusCode::CREATED))
        });

    let lookup = warp::path!("projects" / "lookup")
        .and(warp::get())
        .and(warp::query::<ProjectLookupQuery>())
        .and(with_service(service.clone()))
        .and_then(|query: ProjectLookupQuery, service: Arc<CoordinationService>| async move {
            ok(reply_json(service.lookup_project(&query.name).await, StatusCode::OK))
        });

    let get = warp::path!("projects" / ProjectId)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(|project: ProjectId, service: Arc<CoordinationService>| async move {
            ok(reply_json(service.get_project(project).await, StatusCode::OK))
        });

    let tasks = warp::path!("projects" / ProjectId / "tasks")
        .and(warp::put())
        .and(json_body::<UpdateTasksRequest>(limit))
        .and(with_service(service.clone()))
        .and_then(
            |project: ProjectId,
             request: UpdateTasksRequest,
             service: Arc<CoordinationService>| async move {
                let result = service
                    .update_tasks(project, request.initiator, request.tasks)
                    .await;
                ok(reply_json(result, StatusCode::OK))
            },
        );

    let join = warp::path!("projects" / ProjectId / "participants")
        .and(warp::post())
        .and(json_body::<JoinProjectRequest>(limit))
        .and(with_service(service.clone()))
        .and_then(
            |project: ProjectId,
             request: JoinProjectRequest,
             service: Arc<CoordinationService>| async move {
                let result = service.join_project(project, request.site_id).await;
                ok(reply_json(result, StatusCode::OK))
            },
        );

    let leave = warp::path!("projects" / ProjectId / "participants" / SiteId)
        .and(warp::delete())
        .and(with_service(service.clone()))
        .and_then(
            |project: ProjectId, site: SiteId, service: Arc<CoordinationService>| async move {
                ok(reply_json(
                    service.leave_project(project, site).await,
                    StatusCode::OK,
                ))
            },
        );

    let runs = warp::path!("projects" / ProjectId / "runs")
        .and(warp::get())
        .and(with_service(service))
        .and_then(|project: ProjectId, service: Arc<CoordinationService>| async move {
            ok(reply_json(service.list_runs(project).await, StatusCode::OK))
        });

    create
        .or(lookup)
        .unify()
        .or(get)
        .unify()
        .or(tasks)
        .unify()
        .or(join)
        .unify()
        .or(leave)
        .unify()
        .or(runs)
        .unify()
        .boxed()
}

fn run_routes(service: Arc<CoordinationService>, limit: u64) -> BoxedFilter<(Response,)> {
    let create = warp::path!("runs")
        .and(warp::post())
        .and(json_body::<CreateRunRequest>(limit))
        .and(with_service(service.clone()))
        .and_then(|request: CreateRunRequest, service: Arc<CoordinationService>| async move {
            let result = service
                .create_run(request.project_id, request.initiator)
                .instrument(info_span!("create_run", project_id = %request.project_id))
                .await
                .map(|view| RunCreated {
                    run_id: view.run_id,
                    state: view.state,
                });
            ok(reply_json(result, StatusCode::CREATED))
        });

    let get = warp::path!("runs" / RunId)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(|run: RunId, service: Arc<CoordinationService>| async move {
            ok(reply_json(service.get_run(run).await, StatusCode::OK))
        });

    let results = warp::path!("runs" / RunId / "results")
        .and(warp::post())
        .and(json_body::<SubmitResultRequest>(limit))
        .and(with_service(service.clone()))
        .and_then(handle_submit_result);

    let messages = warp::path!("runs" / RunId / "messages")
        .and(warp::post())
        .and(json_body::<SendMessageRequest>(limit))
        .and(with_service(service.clone()))
        .and_then(handle_send_message);

    let transitions = ["start", "advance", "complete", "stop", "fail"]
        .iter()
        .map(|action| transition_route(service.clone(), limit, *action))
        .fold(results.or(messages).unify().boxed(), |routes, transition| {
            routes.or(transition).unify().boxed()
        });

    create.or(get).unify().or(transitions).unify().boxed()
}

/// The route of one transition of a run, e.g. `POST /runs/{id}/start`.
fn transition_route(
    service: Arc<CoordinationService>,
    limit: u64,
    action: &'static str,
) -> BoxedFilter<(Response,)> {
    warp::path("runs")
        .and(warp::path::param::<RunId>())
        .and(warp::path(action))
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<serde_json::Value>(limit))
        .and(warp::any().map(move || action))
        .and(with_service(service))
        .and_then(handle_transition)
        .boxed()
}

async fn handle_register_site(
    request: RegisterSiteRequest,
    service: Arc<CoordinationService>,
) -> Result<Response, Infallible> {
    let result = service
        .register_site(
            &request.name,
            &request.description,
            &request.declared_identity,
        )
        .await
        .map(|site| SiteCreated {
            site_id: site.id,
            status: site.status,
        });
    ok(reply_json(result, StatusCode::CREATED))
}

async fn handle_deregister_site(
    site: SiteId,
    service: Arc<CoordinationService>,
) -> Result<Response, Infallible> {
    ok(match service.deregister_site(site).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => reply_error(&err),
    })
}

async fn handle_poll_inbox(
    site: SiteId,
    query: InboxQuery,
    service: Arc<CoordinationService>,
) -> Result<Response, Infallible> {
    let result = service
        .poll_inbox(site, EnvelopeId::from(query.since), query.run)
        .instrument(info_span!("poll_inbox", site_id = %site, since = query.since))
        .await
        .map(|envelopes| {
            envelopes
                .into_iter()
                .map(EnvelopeReply::from)
                .collect::<Vec<_>>()
        });
    ok(reply_json(result, StatusCode::OK))
}

/// Handles the `start`, `advance`, `complete`, `stop` and `fail` transitions of a run.
async fn handle_transition(
    run: RunId,
    body: serde_json::Value,
    action: &'static str,
    service: Arc<CoordinationService>,
) -> Result<Response, Infallible> {
    let result = async {
        match action {
            "start" => {
                let request: InitiatorRequest = parse(body)?;
                service.start_run(run, request.initiator).await
            }
            "advance" => {
                let request: InitiatorRequest = parse(body)?;
                service.advance_round(run, request.initiator).await
            }
            "complete" => {
                let request: InitiatorRequest = parse(body)?;
                service.complete_run(run, request.initiator).await
            }
            "stop" => {
                let request: StopRunRequest = parse(body)?;
                service
                    .stop_run(run, request.initiator, &request.reason)
                    .await
            }
            "fail" => {
                let request: FailRunRequest = parse(body)?;
                service.fail_run(run, &request.reason).await
            }
            _ => Err(CoordinationError::validation(format!(
                "unknown run action {}",
                action
            ))),
        }
    }
    .instrument(info_span!("run_transition", run_id = %run, action))
    .await;
    ok(reply_json(result.map(RunTransition::from), StatusCode::OK))
}

async fn handle_submit_result(
    run: RunId,
    request: SubmitResultRequest,
    service: Arc<CoordinationService>,
) -> Result<Response, Infallible> {
    let result = async {
        let payload = decode_payload(&request.payload)?;
        service
            .submit_result(run, request.round, request.sender, payload.into())
            .await
    }
    .instrument(info_span!("submit_result", run_id = %run, round = request.round))
    .await
    .map(|envelope_id| EnvelopeSent { envelope_id });
    ok(reply_json(result, StatusCode::CREATED))
}

async fn handle_send_message(
    run: RunId,
    request: SendMessageRequest,
    service: Arc<CoordinationService>,
) -> Result<Response, Infallible> {
    let result = async {
        let payload = decode_payload(&request.payload)?;
        service
            .send_message(Outgoing {
                run_id: run,
                round: request.round,
                sender: request.sender,
                recipient: request.recipient,
                kind: request.kind,
                payload: payload.into(),
            })
            .await
    }
    .instrument(info_span!("send_message", run_id = %run, kind = ?request.kind))
    .await
    .map(|envelope_id| EnvelopeSent { envelope_id });
    ok(reply_json(result, StatusCode::CREATED))
}

fn decode_payload(payload: &str) -> CoordinationResult<Vec<u8>> {
    STANDARD
        .decode(payload)
        .map_err(|err| CoordinationError::validation(format!("payload is not base64: {}", err)))
}

fn parse<T: DeserializeOwned>(body: serde_json::Value) -> CoordinationResult<T> {
    serde_json::from_value(body)
        .map_err(|err| CoordinationError::validation(format!("malformed request: {}", err)))
}

fn ok(response: Response) -> Result<Response, Infallible> {
    Ok(response)
}

fn reply_json<T: Serialize>(result: CoordinationResult<T>, status: StatusCode) -> Response {
    match result {
        Ok(body) => reply::with_status(reply::json(&body), status).into_response(),
        Err(err) => reply_error(&err),
    }
}

fn reply_error(err: &CoordinationError) -> Response {
    let kind = err.kind();
    warn!("request rejected: {}", err);
    reply_status(status_of(kind), &format!("{:?}", kind), &err.to_string())
}

fn reply_status(status: StatusCode, error: &str, message: &str) -> Response {
    let body = ErrorReply {
        error: error.to_string(),
        message: message.to_string(),
    };
    reply::with_status(reply::json(&body), status).into_response()
}

fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::UnknownSiteError
        | ErrorKind::UnknownProjectError
        | ErrorKind::UnknownRunError => StatusCode::NOT_FOUND,
        ErrorKind::AuthorizationError => StatusCode::FORBIDDEN,
        ErrorKind::ConflictError => StatusCode::CONFLICT,
        ErrorKind::InvalidStateError => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// Converts the coordination service into a `warp` filter.
fn with_service(
    service: Arc<CoordinationService>,
) -> impl Filter<Extract = (Arc<CoordinationService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// Extracts a JSON body of at most `limit` bytes.
fn json_body<T: DeserializeOwned + Send>(
    limit: u64,
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(limit).and(warp::body::json())
}

/// Checks the bearer token of a request, if a token is configured.
fn authorized(token: Option<String>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and_then(move |header: Option<String>| {
            let token = token.clone();
            async move {
                let presented = header
                    .as_deref()
                    .and_then(|value| value.strip_prefix("Bearer "));
                match token {
                    Some(expected) if presented != Some(expected.as_str()) => {
                        Err(reject::custom(Unauthorized))
                    }
                    _ => Ok(()),
                }
            }
        })
        .untuple_one()
}

#[derive(Debug)]
struct Unauthorized;

impl Reject for Unauthorized {}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: Rejection) -> Result<Response, Infallible> {
    let (status, error, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "NotFound", "not found".to_string())
    } else if err.find::<Unauthorized>().is_some() {
        (
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "missing or invalid bearer token".to_string(),
        )
    } else if let Some(e) = err.find::<BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "ValidationError", e.to_string())
    } else if let Some(e) = err.find::<reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, "ValidationError", e.to_string())
    } else if err.find::<reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "ValidationError",
            "request body too large".to_string(),
        )
    } else if err.find::<reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            "ValidationError",
            "content length required".to_string(),
        )
    } else if err.find::<reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "ValidationError",
            "expected a JSON body".to_string(),
        )
    } else if err.find::<reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "NotFound",
            "method not allowed".to_string(),
        )
    } else {
        error!("unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            "internal error".to_string(),
        )
    };
    Ok(reply_status(status, error, &message))
}

#[derive(Debug, Error)]
/// Errors of the rest server.
pub enum RestError {
    #[error("failed to bind the REST API: {0}")]
    Bind(#[from] warp::Error),
}
