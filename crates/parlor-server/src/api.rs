//! HTTP API for users, rooms and message history.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parlor_core::ids::{RoomId, UserId};
use parlor_store::messages::{MessageRepo, MessageRow};
use parlor_store::rooms::{RoomRepo, RoomRow};
use parlor_store::users::{SignIn, UserRepo, UserRow};
use parlor_store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::server::AppState;

/// Errors surfaced to HTTP clients as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(format!("{} not found", capitalize(&what))),
            StoreError::Conflict(detail) => Self::Conflict(detail),
            other => Self::Store(other),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Store(e) => {
                error!(error = %e, "store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            Self::Store(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// "room room_x" -> "Room room_x"
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn required(value: Option<String>, message: &str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(message.to_string()))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/chatRoom", get(get_room_by_query).post(create_room))
        .route("/chatRoom/all", get(list_rooms))
        .route("/chatRoom/verify-password", post(verify_password))
        .route("/chatRoom/message", get(list_messages).post(create_message))
        .route("/chatRoom/{room_id}", get(get_room))
        .route("/user", get(get_user).post(sign_in))
}

async fn list_rooms(State(state): State<AppState>) -> Result<Json<Vec<RoomRow>>, ApiError> {
    Ok(Json(RoomRepo::new(state.db.clone()).list()?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupQuery {
    group_id: Option<String>,
}

async fn get_room_by_query(
    State(state): State<AppState>,
    Query(query): Query<GroupQuery>,
) -> Result<Json<RoomRow>, ApiError> {
    let id = required(query.group_id, "groupId is required")?;
    Ok(Json(RoomRepo::new(state.db.clone()).get(&RoomId::from_raw(id))?))
}

async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomRow>, ApiError> {
    Ok(Json(RoomRepo::new(state.db.clone()).get(&RoomId::from_raw(room_id))?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    name: Option<String>,
    password: Option<String>,
    created_by: Option<UserId>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomResponse {
    room_id: RoomId,
}

async fn create_room(
    State(state): State<AppState>,
    body: Result<Json<CreateRoomRequest>, JsonRejection>,
) -> Result<Json<CreateRoomResponse>, ApiError> {
    let Json(body) = body?;
    const MISSING: &str = "Name and password are required";
    let name = required(body.name, MISSING)?;
    let password = required(body.password, MISSING)?;

    let room = RoomRepo::new(state.db.clone()).create(&name, &password, body.created_by.as_ref())?;
    Ok(Json(CreateRoomResponse { room_id: room.id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyPasswordRequest {
    room_id: Option<String>,
    password: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    message: &'static str,
}

async fn verify_password(
    State(state): State<AppState>,
    body: Result<Json<VerifyPasswordRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(body) = body?;
    const MISSING: &str = "Room ID and password are required";
    let room_id = required(body.room_id, MISSING)?;
    let password = required(body.password, MISSING)?;

    let valid = RoomRepo::new(state.db.clone()).verify_password(&RoomId::from_raw(room_id), &password)?;
    Ok(Json(if valid {
        StatusResponse {
            status: "success",
            message: "Password is valid",
        }
    } else {
        StatusResponse {
            status: "error",
            message: "Invalid password",
        }
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMessageRequest {
    content: Option<String>,
    sender_id: Option<String>,
    room_id: Option<String>,
}

#[derive(Serialize)]
struct MessageResponse {
    success: bool,
    message: MessageRow,
}

async fn create_message(
    State(state): State<AppState>,
    body: Result<Json<CreateMessageRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Json(body) = body?;
    const MISSING: &str = "Missing required fields";
    let content = required(body.content, MISSING)?;
    let sender_id = required(body.sender_id, MISSING)?;
    let room_id = required(body.room_id, MISSING)?;
    if content.chars().count() > state.config.max_content_len {
        return Err(ApiError::BadRequest(format!(
            "Message exceeds {} characters",
            state.config.max_content_len
        )));
    }

    let message = MessageRepo::new(state.db.clone()).create(
        &RoomId::from_raw(room_id),
        &UserId::from_raw(sender_id),
        &content,
    )?;
    Ok(Json(MessageResponse {
        success: true,
        message,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    room_id: Option<String>,
}

#[derive(Serialize)]
struct HistoryResponse {
    success: bool,
    messages: Vec<MessageRow>,
}

async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let room_id = required(query.room_id, "Room ID is required")?;
    let messages = MessageRepo::new(state.db.clone()).list_for_room(&RoomId::from_raw(room_id))?;
    Ok(Json(HistoryResponse {
        success: true,
        messages,
    }))
}

#[derive(Deserialize)]
struct SignInRequest {
    name: Option<String>,
}

#[derive(Serialize)]
struct SignInResponse {
    status: &'static str,
    message: &'static str,
    user: UserRow,
}

async fn sign_in(
    State(state): State<AppState>,
    body: Result<Json<SignInRequest>, JsonRejection>,
) -> Result<Json<SignInResponse>, ApiError> {
    let Json(body) = body?;
    let name = required(body.name, "name is required")?;

    let (user, outcome) = UserRepo::new(state.db.clone()).find_or_create(name.trim())?;
    let message = match outcome {
        SignIn::Existing => "User has signed in",
        SignIn::Created => "User has signed up",
    };
    Ok(Json(SignInResponse {
        status: "success",
        message,
        user,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserQuery {
    user_id: Option<String>,
}

async fn get_user(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UserRow>, ApiError> {
    let user_id = required(query.user_id, "userId is required")?;
    Ok(Json(UserRepo::new(state.db.clone()).get(&UserId::from_raw(user_id))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_404() {
        let err: ApiError = StoreError::NotFound("room room_x".into()).into();
        assert!(matches!(err, ApiError::NotFound(ref m) if m == "Room room_x not found"));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn other_store_errors_map_to_500() {
        let err: ApiError = StoreError::Database("disk full".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bad_request_is_400() {
        let err = ApiError::BadRequest("groupId is required".into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn required_rejects_blank() {
        assert!(required(None, "x").is_err());
        assert!(required(Some("  ".into()), "x").is_err());
        assert_eq!(required(Some("ok".into()), "x").unwrap(), "ok");
    }

    #[test]
    fn capitalize_first_letter() {
        assert_eq!(capitalize("user u1"), "User u1");
        assert_eq!(capitalize(""), "");
    }
}
