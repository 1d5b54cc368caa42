use thiserror::Error;

use super::types::CrlSourceId;

/// Failure to obtain a usable CRL from a single source.
///
/// Cloneable because one in-flight fetch result is handed to every caller
/// coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out fetching CRL from {0}")]
    Timeout(String),

    #[error("CRL not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed CRL: {0}")]
    Malformed(String),
}

/// Errors surfaced to the caller of a revocation check or to the code
/// assembling a checker.
#[derive(Error, Debug)]
pub enum RevocationError {
    #[error("CRL fetch failed for {} source(s): {}", .0.len(), describe_failures(.0))]
    FetchFailed(Vec<(CrlSourceId, FetchError)>),

    #[error("certificate parsing failed: {0}")]
    Certificate(String),

    #[error("invalid revocation configuration: {0}")]
    Config(String),

    #[error("HTTP client initialization failed: {0}")]
    HttpClient(#[from] reqwest::Error),
}

fn describe_failures(failures: &[(CrlSourceId, FetchError)]) -> String {
    failures
        .iter()
        .map(|(source, error)| format!("{source}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenient Result type alias
pub type CheckerResult<T> = Result<T, RevocationError>;
