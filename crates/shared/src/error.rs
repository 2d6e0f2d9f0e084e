use crate::adapters::mcp::McpErrorMsg;
use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use rmcp::ErrorData;
use serde::Serialize;
use thiserror::Error;
use utoipa::{IntoResponses, PartialSchema, ToSchema};

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The gateway's unified error taxonomy.
///
/// Variants fall into two groups: the chat/tool-dispatch error kinds named by the
/// external contract (`Authentication` through `Misconfigured`, mirrored 1:1 on
/// `ChatErrorKind`), and infrastructure wrapper variants (`Repository`, `SqliteError`,
/// ...) carried over from the plumbing this crate is built on.
#[derive(Error, Debug, Serialize)]
pub enum CommonError {
    #[error("user is not authenticated to perform this action.")]
    Authentication {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("user is not authorized to perform this action.")]
    Authorization {
        msg: String,
        #[serde(skip)]
        #[source]
        source: anyhow::Error,
    },
    #[error("permission denied")]
    PermissionDenied {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("could not find resource")]
    NotFound {
        msg: String,
        lookup_id: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("invalid request")]
    InvalidRequest {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("too many requests")]
    RateLimit {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("conversation is too long for this model's context window")]
    ContextTooLong {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("content was filtered by the upstream provider")]
    ContentFiltered {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("upstream provider returned a server error")]
    ServerError {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("network error talking to upstream")]
    NetworkError {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("mcp session is stale and must be recreated")]
    StaleSession {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("resource is misconfigured")]
    Misconfigured {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("invalid response")]
    InvalidResponse {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("repository error")]
    Repository {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("unknown error")]
    Unknown(
        #[serde(skip)]
        #[from]
        anyhow::Error,
    ),
    #[error("sqlite database error")]
    SqliteError {
        #[serde(skip)]
        #[from]
        #[source]
        source: libsql::Error,
    },
    #[error("tokio channel error")]
    TokioChannelError {
        #[serde(skip)]
        #[source]
        source: DynError,
    },
    #[error("io error")]
    IoError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::io::Error,
    },
    #[error("url parse error")]
    UrlParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: url::ParseError,
    },
    #[error("serde json error")]
    SerdeSerializationError {
        #[serde(skip)]
        #[from]
        #[source]
        source: serde_json::Error,
    },
    #[error("axum error")]
    AxumError {
        #[serde(skip)]
        #[from]
        #[source]
        source: axum::Error,
    },
    #[error("address parse error")]
    AddrParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("libsql migration error")]
    LibsqlMigrationError {
        #[serde(skip)]
        #[from]
        #[source]
        source: libsql_migration::errors::LibsqlDirMigratorError,
    },
    #[error("var error")]
    VarError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::env::VarError,
    },
    #[error("reqwest error")]
    ReqwestError {
        #[serde(skip)]
        #[from]
        #[source]
        source: reqwest::Error,
    },
}

impl CommonError {
    /// The external error-kind discriminator (§7 of the gateway spec). Infrastructure
    /// wrapper variants all surface as `Unknown` to callers outside this process.
    pub fn kind(&self) -> ChatErrorKind {
        match self {
            CommonError::Authentication { .. } => ChatErrorKind::Authentication,
            CommonError::PermissionDenied { .. } | CommonError::Authorization { .. } => {
                ChatErrorKind::PermissionDenied
            }
            CommonError::NotFound { .. } => ChatErrorKind::NotFound,
            CommonError::InvalidRequest { .. } => ChatErrorKind::InvalidRequest,
            CommonError::RateLimit { .. } => ChatErrorKind::RateLimit,
            CommonError::ContextTooLong { .. } => ChatErrorKind::ContextTooLong,
            CommonError::ContentFiltered { .. } => ChatErrorKind::ContentFiltered,
            CommonError::ServerError { .. } => ChatErrorKind::ServerError,
            CommonError::NetworkError { .. } => ChatErrorKind::NetworkError,
            CommonError::StaleSession { .. } => ChatErrorKind::StaleSession,
            CommonError::Misconfigured { .. } => ChatErrorKind::Misconfigured,
            _ => ChatErrorKind::Unknown,
        }
    }

    /// Build the client-facing envelope for this error (§7 "User-visible mapping").
    pub fn to_chat_error_response(&self) -> ChatErrorResponse {
        let kind = self.kind();
        ChatErrorResponse {
            is_retryable: kind.is_retryable(),
            message: kind.user_message(self.to_string()),
            code: kind,
            original_error: Some(self.to_string()),
        }
    }

    pub fn rate_limit(msg: impl Into<String>) -> Self {
        CommonError::RateLimit {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn server_error(msg: impl Into<String>) -> Self {
        CommonError::ServerError {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn network_error(msg: impl Into<String>) -> Self {
        CommonError::NetworkError {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn stale_session(msg: impl Into<String>) -> Self {
        CommonError::StaleSession {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn misconfigured(msg: impl Into<String>) -> Self {
        CommonError::Misconfigured {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        CommonError::InvalidRequest {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn not_found(msg: impl Into<String>, lookup_id: impl Into<String>) -> Self {
        CommonError::NotFound {
            msg: msg.into(),
            lookup_id: lookup_id.into(),
            source: None,
        }
    }
}

/// External error-kind discriminator, carried on `ChatErrorResponse`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize, schemars::JsonSchema, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ChatErrorKind {
    Authentication,
    PermissionDenied,
    NotFound,
    InvalidRequest,
    RateLimit,
    ContextTooLong,
    ContentFiltered,
    ServerError,
    NetworkError,
    StaleSession,
    Misconfigured,
    Unknown,
}

impl ChatErrorKind {
    /// Fixed subset of kinds eligible for automatic retry (§7).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatErrorKind::RateLimit | ChatErrorKind::ServerError | ChatErrorKind::NetworkError
        )
    }

    /// Fixed human-readable message per kind; `detail` is appended for context when present.
    pub fn user_message(&self, detail: impl AsRef<str>) -> String {
        let base = match self {
            ChatErrorKind::Authentication => "Authentication failed.",
            ChatErrorKind::PermissionDenied => {
                "You do not have permission to perform this action."
            }
            ChatErrorKind::NotFound => "The requested resource could not be found.",
            ChatErrorKind::InvalidRequest => "The request was invalid.",
            ChatErrorKind::RateLimit => "Too many requests. Please slow down and try again.",
            ChatErrorKind::ContextTooLong => {
                "Your conversation is too long for this model. Please start a new conversation or remove earlier messages."
            }
            ChatErrorKind::ContentFiltered => {
                "The response was filtered by the upstream provider's safety system."
            }
            ChatErrorKind::ServerError => "The upstream provider returned a server error.",
            ChatErrorKind::NetworkError => {
                "A network error occurred while talking to the upstream provider."
            }
            ChatErrorKind::StaleSession => "The tool session expired and is being recreated.",
            ChatErrorKind::Misconfigured => "This resource is misconfigured.",
            ChatErrorKind::Unknown => "An unexpected error occurred.",
        };
        let detail = detail.as_ref();
        if detail.is_empty() || detail == base {
            base.to_string()
        } else {
            format!("{base} ({detail})")
        }
    }
}

/// Client-facing error envelope (§7).
#[derive(Debug, Clone, Serialize, serde::Deserialize, schemars::JsonSchema, ToSchema)]
pub struct ChatErrorResponse {
    pub code: ChatErrorKind,
    pub message: String,
    pub is_retryable: bool,
    pub original_error: Option<String>,
}

impl<T: Send + Sync + 'static> From<tokio::sync::mpsc::error::SendError<T>> for CommonError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CommonError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl<T: Send + Sync + 'static + std::fmt::Debug> From<tokio::sync::broadcast::error::SendError<T>>
    for CommonError
{
    fn from(e: tokio::sync::broadcast::error::SendError<T>) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl From<tokio::sync::broadcast::error::RecvError> for CommonError {
    fn from(e: tokio::sync::broadcast::error::RecvError) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl From<rustls::Error> for CommonError {
    fn from(err: rustls::Error) -> Self {
        CommonError::InvalidRequest {
            msg: "TLS error".to_string(),
            source: Some(anyhow::Error::from(err)),
        }
    }
}

impl ToSchema for CommonError {
    fn name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("Error")
    }

    fn schemas(
        _schemas: &mut Vec<(
            String,
            utoipa::openapi::RefOr<utoipa::openapi::schema::Schema>,
        )>,
    ) {
    }
}

impl PartialSchema for CommonError {
    fn schema() -> utoipa::openapi::RefOr<utoipa::openapi::schema::Schema> {
        utoipa::openapi::ObjectBuilder::new()
            .property(
                "name",
                utoipa::openapi::ObjectBuilder::new()
                    .schema_type(utoipa::openapi::schema::Type::String),
            )
            .required("name")
            .property(
                "message",
                utoipa::openapi::ObjectBuilder::new()
                    .schema_type(utoipa::openapi::schema::Type::String),
            )
            .required("message")
            .into()
    }
}

impl IntoResponses for CommonError {
    fn responses() -> std::collections::BTreeMap<
        String,
        utoipa::openapi::RefOr<utoipa::openapi::response::Response>,
    > {
        let mut responses = std::collections::BTreeMap::new();

        let error_content = utoipa::openapi::ContentBuilder::new()
            .schema(Some(CommonError::schema()))
            .build();

        responses.insert(
            "401".to_string(),
            utoipa::openapi::ResponseBuilder::new()
                .description("Authentication error")
                .content("application/json", error_content.clone())
                .into(),
        );
        responses.insert(
            "403".to_string(),
            utoipa::openapi::ResponseBuilder::new()
                .description("Authorization error")
                .content("application/json", error_content.clone())
                .into(),
        );
        responses.insert(
            "404".to_string(),
            utoipa::openapi::ResponseBuilder::new()
                .description("Resource not found")
                .content("application/json", error_content.clone())
                .into(),
        );
        responses.insert(
            "400".to_string(),
            utoipa::openapi::ResponseBuilder::new()
                .description("Invalid request")
                .content("application/json", error_content.clone())
                .into(),
        );
        responses.insert(
            "429".to_string(),
            utoipa::openapi::ResponseBuilder::new()
                .description("Rate limited")
                .content("application/json", error_content.clone())
                .into(),
        );
        responses.insert(
            "500".to_string(),
            utoipa::openapi::ResponseBuilder::new()
                .description("Server error")
                .content("application/json", error_content)
                .into(),
        );

        responses
    }
}

impl IntoResponse for CommonError {
    fn into_response(self) -> Response {
        let status = match self {
            CommonError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            CommonError::Authorization { .. } | CommonError::PermissionDenied { .. } => {
                StatusCode::FORBIDDEN
            }
            CommonError::NotFound { .. } => StatusCode::NOT_FOUND,
            CommonError::InvalidRequest { .. } | CommonError::Misconfigured { .. } => {
                StatusCode::BAD_REQUEST
            }
            CommonError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            CommonError::ContextTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CommonError::ContentFiltered { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CommonError::StaleSession { .. } => StatusCode::CONFLICT,
            CommonError::ServerError { .. }
            | CommonError::NetworkError { .. }
            | CommonError::InvalidResponse { .. }
            | CommonError::Unknown(_)
            | CommonError::Repository { .. }
            | CommonError::SqliteError { .. }
            | CommonError::TokioChannelError { .. }
            | CommonError::IoError { .. }
            | CommonError::SerdeSerializationError { .. }
            | CommonError::UrlParseError { .. }
            | CommonError::AxumError { .. }
            | CommonError::LibsqlMigrationError { .. }
            | CommonError::VarError { .. }
            | CommonError::ReqwestError { .. }
            | CommonError::AddrParseError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(self.to_chat_error_response());
        (status, body).into_response()
    }
}

impl From<CommonError> for ErrorData {
    fn from(error: CommonError) -> ErrorData {
        match error {
            CommonError::NotFound {
                msg,
                lookup_id: _,
                source: _,
            } => ErrorData::resource_not_found(msg, None),
            CommonError::InvalidRequest { msg, source: _ } => {
                ErrorData::invalid_request(msg, None)
            }
            other => ErrorData::internal_error(other.to_string(), None),
        }
    }
}

impl McpErrorMsg for CommonError {
    fn to_mcp_error(&self) -> String {
        self.to_string()
    }
}
