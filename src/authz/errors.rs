use std::collections::BTreeSet;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Permission denied: {message}")]
    #[diagnostic(code(gatekeeper::authz::permission_denied))]
    PermissionDenied {
        message: String,
        /// Type of the actee, for attribute-level denials
        type_name: Option<String>,
        /// Attributes that were requested but not authorized
        denied: BTreeSet<String>,
    },

    #[error("Not logged in")]
    #[diagnostic(
        code(gatekeeper::authz::not_logged_in),
        help("The supplied auth token is not valid; authenticate again or act as a guest")
    )]
    NotLoggedIn,

    #[error("Unauthorizable type `{0}`")]
    #[diagnostic(
        code(gatekeeper::authz::unauthorizable_type),
        help("ACL privileges may only name registered entity types or managers")
    )]
    UnauthorizableType(String),

    #[error("Unknown check predicate `{0}`")]
    #[diagnostic(
        code(gatekeeper::authz::unknown_predicate),
        help("Register the predicate with the PredicateRegistry before building the index")
    )]
    UnknownPredicate(String),

    #[error("Invalid parameters for predicate `{predicate}`: {message}")]
    #[diagnostic(code(gatekeeper::authz::invalid_predicate_params))]
    InvalidPredicateParams { predicate: String, message: String },

    #[error("Unsupported ACL record version {version} (acl {id})")]
    #[diagnostic(
        code(gatekeeper::authz::record_version),
        help("Migrate the stored ACL record to the current schema version")
    )]
    UnsupportedRecordVersion { id: i64, version: u32 },

    #[error("Check predicate `{predicate}` failed: {message}")]
    #[diagnostic(code(gatekeeper::authz::predicate_failed))]
    PredicateFailed { predicate: String, message: String },

    #[error("Invalid type registry: {0}")]
    #[diagnostic(
        code(gatekeeper::authz::type_registry),
        help("Entity parents must be declared and must not form a cycle")
    )]
    InvalidTypeRegistry(String),

    #[error("Organization key must be an integer, got `{0}`")]
    #[diagnostic(code(gatekeeper::authz::org_key))]
    InvalidOrgKey(String),

    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(gatekeeper::authz::policy_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(gatekeeper::authz::invalid_policy),
        help("Policy files may contain `entity`, `manager`, `role`, `org`, `member` and `org-role` nodes")
    )]
    InvalidPolicy(String),

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(gatekeeper::authz::kdl_parse),
        help("Check your KDL file syntax, see https://kdl.dev")
    )]
    KdlParse(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(gatekeeper::authz::io))]
    Io(#[from] std::io::Error),
}

impl AuthzError {
    pub(crate) fn denied(message: impl Into<String>) -> Self {
        AuthzError::PermissionDenied {
            message: message.into(),
            type_name: None,
            denied: BTreeSet::new(),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, AuthzError::PermissionDenied { .. })
    }
}

/// Signals a check predicate may raise instead of a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    /// The predicate does not apply to this actee.
    #[error("invalid actee type: {0}")]
    InvalidActeeType(String),

    /// The predicate expected an attribute in the update map that was absent.
    #[error("attribute `{0}` not updated")]
    AttributeNotUpdated(String),

    #[error("not logged in")]
    NotLoggedIn,

    /// Anything else; a misbehaving predicate is a configuration bug.
    #[error("{0}")]
    Failed(String),
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthzError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            AuthzError::NotLoggedIn => StatusCode::UNAUTHORIZED,
            AuthzError::InvalidPolicy(_)
            | AuthzError::KdlParse(_)
            | AuthzError::InvalidOrgKey(_)
            | AuthzError::UnauthorizableType(_)
            | AuthzError::UnknownPredicate(_)
            | AuthzError::InvalidPredicateParams { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            AuthzError::PermissionDenied {
                type_name, denied, ..
            } => json!({
                "error": self.to_string(),
                "type": type_name,
                "denied": denied,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
