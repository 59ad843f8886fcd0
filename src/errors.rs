use miette::Diagnostic;
use thiserror::Error;

use crate::authz::errors::AuthzError;

#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(gatekeeper::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(gatekeeper::config))]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Authz(#[from] AuthzError),

    #[error("Bad address `{0}`")]
    #[diagnostic(
        code(gatekeeper::address),
        help("server.host must be an IP address, e.g. 127.0.0.1")
    )]
    BadAddress(String),
}
