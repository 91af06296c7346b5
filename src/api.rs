//! Action-tagged request/response contract for capture and identity
//!
//! A request is one JSON object `{ "action": "...", ...params }`. Every
//! response carries `success`, the action's payload fields and, on failure,
//! `error` (plus `details` for internal failures). [`ResponseStatus`] tells an
//! HTTP layer which status code to use; this module does no I/O itself.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use kartwall::api::CaptureApi;
//! # async fn handle(api: Arc<CaptureApi>, body: &str) {
//! let response = api.handle_json(body).await;
//! let status = response.status.http_status();
//! let body = serde_json::to_string(&response).unwrap_or_default();
//! # let _ = (status, body);
//! # }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, error};

use crate::capture::LapCaptureService;
use crate::identity::{DriverIdentityAggregator, LinkRequest};
use crate::types::{LinkingStatus, Lookup, RawSessionPayload, SessionId, SessionPayload};
use crate::{KartwallError, Result};

/// Sessions returned by `get_recent_sessions` when the limit is absent or zero.
pub const DEFAULT_RECENT_LIMIT: usize = 5;
/// Recent sessions included in a driver race summary.
pub const RACE_SUMMARY_SESSIONS: usize = 10;
/// Recent sessions included in a short driver summary.
pub const DRIVER_SUMMARY_SESSIONS: usize = 5;

const INTERNAL_ERROR: &str = "Error processing lap capture request";
const CAPTURE_STRUCTURE: &str = "driver_centric_with_lap_by_lap";
const NO_RACE_DATA: &str = "No race data found for this driver";

/// Every action name the dispatcher understands.
pub const ACTIONS: &[&str] = &[
    "process_lap_data",
    "get_driver_progression",
    "get_recent_sessions",
    "get_session_progression",
    "get_lap_by_lap_data",
    "get_driver_race_summary",
    "get_driver_summary",
    "cleanup_old_records",
    "list_drivers",
    "link_driver",
];

/// Parameters are optional at this layer so that a missing one becomes a
/// validation error naming the parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CaptureRequest {
    ProcessLapData {
        session_data: Option<RawSessionPayload>,
    },
    GetDriverProgression {
        web_user_id: Option<String>,
        session_id: Option<String>,
    },
    GetRecentSessions {
        web_user_id: Option<String>,
        limit: Option<usize>,
    },
    GetSessionProgression {
        session_id: Option<String>,
    },
    GetLapByLapData {
        web_user_id: Option<String>,
        session_id: Option<String>,
    },
    GetDriverRaceSummary {
        web_user_id: Option<String>,
    },
    GetDriverSummary {
        web_user_id: Option<String>,
    },
    CleanupOldRecords,
    ListDrivers,
    LinkDriver {
        driver_name: Option<String>,
        web_user_id: Option<String>,
        linking_status: Option<LinkingStatus>,
        first_name: Option<String>,
        last_name: Option<String>,
        alias: Option<String>,
    },
}

/// How the HTTP layer should report a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseStatus {
    #[default]
    Ok,
    CallerError,
    InternalError,
}

impl ResponseStatus {
    pub fn http_status(self) -> u16 {
        match self {
            ResponseStatus::Ok => 200,
            ResponseStatus::CallerError => 400,
            ResponseStatus::InternalError => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureResponse {
    pub success: bool,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip)]
    pub status: ResponseStatus,
}

impl CaptureResponse {
    fn ok(payload: Value) -> Self {
        Self::with_success(true, payload)
    }

    fn with_success(success: bool, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            other => Map::from_iter([("data".to_string(), other)]),
        };
        Self { success, payload, error: None, details: None, status: ResponseStatus::Ok }
    }

    fn caller_error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Map::new(),
            error: Some(message.into()),
            details: None,
            status: ResponseStatus::CallerError,
        }
    }

    fn internal_error(details: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Map::new(),
            error: Some(INTERNAL_ERROR.to_string()),
            details: Some(details.into()),
            status: ResponseStatus::InternalError,
        }
    }

    fn from_error(err: KartwallError) -> Self {
        if err.is_caller_error() {
            debug!(error = %err, "Rejected lap capture request");
            Self::caller_error(err.to_string())
        } else {
            error!(error = %err, "Lap capture request failed");
            Self::internal_error(err.to_string())
        }
    }
}

/// Dispatches [`CaptureRequest`]s onto the capture service and identity layer.
pub struct CaptureApi {
    capture: Arc<LapCaptureService>,
    identity: Arc<DriverIdentityAggregator>,
}

impl CaptureApi {
    pub fn new(capture: Arc<LapCaptureService>, identity: Arc<DriverIdentityAggregator>) -> Self {
        Self { capture, identity }
    }

    pub fn capture(&self) -> &Arc<LapCaptureService> {
        &self.capture
    }

    pub fn identity(&self) -> &Arc<DriverIdentityAggregator> {
        &self.identity
    }

    /// Handle a raw JSON request body.
    pub async fn handle_json(&self, body: &str) -> CaptureResponse {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => self.handle_value(value).await,
            Err(err) => CaptureResponse::caller_error(format!("Invalid request body: {err}")),
        }
    }

    /// Handle an already parsed JSON request.
    pub async fn handle_value(&self, value: Value) -> CaptureResponse {
        let action = value.get("action").and_then(Value::as_str).map(str::to_owned);
        match action.as_deref() {
            None => return CaptureResponse::caller_error("Action is required"),
            Some(action) if !ACTIONS.contains(&action) => {
                debug!(action, "Unknown lap capture action");
                return CaptureResponse::caller_error("Invalid action");
            }
            Some(_) => {}
        }

        match serde_json::from_value::<CaptureRequest>(value) {
            Ok(request) => self.dispatch(request).await,
            Err(err) => CaptureResponse::caller_error(format!("Invalid request parameters: {err}")),
        }
    }

    pub async fn dispatch(&self, request: CaptureRequest) -> CaptureResponse {
        self.run(request).await.unwrap_or_else(CaptureResponse::from_error)
    }

    async fn run(&self, request: CaptureRequest) -> Result<CaptureResponse> {
        match request {
            CaptureRequest::ProcessLapData { session_data } => {
                let raw = session_data.ok_or_else(|| KartwallError::missing("sessionData"))?;
                let payload = SessionPayload::validate(raw)?;
                let drivers_count = payload.drivers.len();
                let report = self.capture.process_lap_data(payload).await?;
                let mut response = CaptureResponse::ok(serde_json::to_value(&report)?);
                response.payload.extend([
                    ("message".to_string(), json!("Lap data processed successfully")),
                    ("driversCount".to_string(), json!(drivers_count)),
                    ("dataStructure".to_string(), json!(CAPTURE_STRUCTURE)),
                ]);
                Ok(response)
            }

            CaptureRequest::GetDriverProgression { web_user_id, session_id } => {
                let (user, session) = user_and_session(web_user_id, session_id)?;
                let progression = self.capture.get_driver_lap_progression(&user, &session).await?;
                Ok(CaptureResponse::ok(json!({ "totalLaps": progression.len(), "progression": progression })))
            }

            CaptureRequest::GetRecentSessions { web_user_id, limit } => {
                let user = required(web_user_id, "webUserId")?;
                let limit = match limit {
                    Some(limit) if limit > 0 => limit,
                    _ => DEFAULT_RECENT_LIMIT,
                };
                let sessions = self.capture.get_recent_session_laps(&user, limit).await?;
                Ok(CaptureResponse::ok(json!({ "totalSessions": sessions.len(), "sessions": sessions })))
            }

            CaptureRequest::GetSessionProgression { session_id } => {
                let session = SessionId::new(required(session_id, "sessionId")?);
                let progression = self.capture.get_session_position_progression(&session).await?;
                Ok(CaptureResponse::ok(json!({ "sessionId": session, "progression": progression })))
            }

            CaptureRequest::GetLapByLapData { web_user_id, session_id } => {
                let (user, session) = user_and_session(web_user_id, session_id)?;
                let outcome = self.capture.get_session_lap_by_lap(&user, &session).await;
                let mut response = CaptureResponse::with_success(
                    outcome.success,
                    json!({
                        "dataSource": outcome.source,
                        "totalLaps": outcome.laps.len(),
                        "laps": outcome.laps,
                    }),
                );
                response.error = outcome.error;
                Ok(response)
            }

            CaptureRequest::GetDriverRaceSummary { web_user_id } => {
                let user = required(web_user_id, "webUserId")?;
                let Lookup::Found(summary) = self.identity.get_driver_by_external_id(&user).await? else {
                    return Ok(CaptureResponse::ok(json!({
                        "message": NO_RACE_DATA,
                        "driverData": null,
                        "stats": null,
                    })));
                };

                let recent: Vec<_> =
                    summary.sessions.iter().rev().take(RACE_SUMMARY_SESSIONS).collect();
                let profile = &summary.profile;
                Ok(CaptureResponse::ok(json!({
                    "driverData": {
                        "driverName": profile.driver_name,
                        "firstName": profile.first_name,
                        "lastName": profile.last_name,
                        "alias": profile.alias,
                        "linkingStatus": profile.linking_status,
                        "totalSessions": summary.sessions.len(),
                    },
                    "stats": summary.stats,
                    "recentSessions": recent,
                })))
            }

            CaptureRequest::GetDriverSummary { web_user_id } => {
                let user = required(web_user_id, "webUserId")?;
                let Lookup::Found(summary) = self.identity.get_driver_by_external_id(&user).await? else {
                    return Ok(CaptureResponse::ok(json!({ "message": NO_RACE_DATA, "driver": null })));
                };

                let recent: Vec<_> =
                    summary.sessions.iter().rev().take(DRIVER_SUMMARY_SESSIONS).collect();
                Ok(CaptureResponse::ok(json!({
                    "driver": summary.profile,
                    "sessionsCount": summary.sessions.len(),
                    "recentSessions": recent,
                })))
            }

            CaptureRequest::CleanupOldRecords => {
                let deleted = self.capture.cleanup_old_records().await?;
                Ok(CaptureResponse::ok(json!({
                    "message": format!("Cleaned up {deleted} old records"),
                    "deletedCount": deleted,
                })))
            }

            CaptureRequest::ListDrivers => {
                let drivers = self.identity.list_all_drivers().await?;
                Ok(CaptureResponse::ok(json!({ "totalDrivers": drivers.len(), "drivers": drivers })))
            }

            CaptureRequest::LinkDriver {
                driver_name,
                web_user_id,
                linking_status,
                first_name,
                last_name,
                alias,
            } => {
                let mut request = LinkRequest::new(
                    required(driver_name, "driverName")?,
                    required(web_user_id, "webUserId")?,
                );
                request.linking_status = linking_status.unwrap_or(LinkingStatus::Linked);
                request.first_name = first_name;
                request.last_name = last_name;
                request.alias = alias;

                let profile = self.identity.link_identity(request).await?;
                Ok(CaptureResponse::ok(json!({ "driver": profile })))
            }
        }
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(KartwallError::missing(field)),
    }
}

fn user_and_session(web_user_id: Option<String>, session_id: Option<String>) -> Result<(String, SessionId)> {
    match (web_user_id, session_id) {
        (Some(user), Some(session)) if !user.trim().is_empty() && !session.trim().is_empty() => {
            Ok((user, SessionId::new(session)))
        }
        _ => Err(KartwallError::validation("webUserId and sessionId", "are required")),
    }
}
