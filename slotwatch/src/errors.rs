use crate::pipeline::hierarchy::HierarchyError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// An upstream client could not be constructed (credentials, base URL, TLS setup)
    #[error("failed to initialize {service} client: {cause:#}")]
    ClientInit { service: &'static str, cause: anyhow::Error },

    /// A paginated listing failed part-way through
    #[error("failed to list {resource} under {parent}: {cause:#}")]
    Pagination {
        resource: &'static str,
        parent: String,
        cause: anyhow::Error,
    },

    /// A folder or organization subtree could not be expanded
    #[error(transparent)]
    Expansion(#[from] HierarchyError),

    /// A single upstream call failed outside of a listing
    #[error("{operation} failed: {cause:#}")]
    Upstream { operation: String, cause: anyhow::Error },

    /// Alert message template failed to load or render
    #[error("failed to render alert message: {0}")]
    Template(#[from] minijinja::Error),

    /// Snapshot could not be written to blob storage
    #[error("failed to store snapshot {key}: {message}")]
    Storage { key: String, message: String },

    /// Chat webhook rejected or never received the alert
    #[error("failed to deliver message to {service}: {message}")]
    Webhook { service: String, message: String },

    /// Configuration is inconsistent or incomplete
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ClientInit { .. } | Error::Pagination { .. } | Error::Expansion(_) | Error::Upstream { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Error::Template(_) | Error::Storage { .. } | Error::Webhook { .. } | Error::Config { .. } | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns a caller-safe message without upstream response bodies
    pub fn user_message(&self) -> String {
        match self {
            Error::ClientInit { service, .. } => format!("Upstream {service} service is unavailable"),
            Error::Pagination { resource, .. } => format!("Failed to list {resource}"),
            Error::Expansion(_) => "Failed to resolve reservation assignees".to_string(),
            Error::Upstream { .. } => "Upstream request failed".to_string(),
            Error::Template(_) | Error::Storage { .. } | Error::Webhook { .. } | Error::Config { .. } | Error::Other(_) => {
                "Internal server error".to_string()
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::ClientInit { .. } | Error::Pagination { .. } | Error::Expansion(_) | Error::Upstream { .. } => {
                tracing::error!("Upstream error: {:#}", self);
            }
            _ => {
                tracing::error!("Internal service error: {:#}", self);
            }
        }

        (self.status_code(), self.user_message()).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
