use http::StatusCode;
use std::fmt;

/// Error taxonomy for the federating gateway.
///
/// Task-level endpoint failures never surface here — they are absorbed into
/// statistics and tagged task results. This enum covers everything that can
/// decide the status of a client request.
#[derive(Debug)]
pub enum FederatorError {
    /// Malformed client parameters or POST body; the message names the
    /// offending value.
    ClientInput(String),
    /// The resolver answered with no routes, or every dispatched task
    /// produced no bytes.
    NoData,
    /// The routing resolver is unreachable or returned a malformed body.
    Routing(String),
    /// A request-slot acquisition timed out.
    CapacityRefused(String),
    /// The client disconnected or the request deadline elapsed.
    Cancelled,
    Redis(redis::RedisError),
    Http(reqwest::Error),
    Internal(String),
}

impl fmt::Display for FederatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FederatorError::ClientInput(msg) => write!(f, "bad request: {}", msg),
            FederatorError::NoData => write!(f, "no data available"),
            FederatorError::Routing(msg) => write!(f, "routing error: {}", msg),
            FederatorError::CapacityRefused(url) => {
                write!(f, "no request slot available for {}", url)
            }
            FederatorError::Cancelled => write!(f, "request cancelled"),
            FederatorError::Redis(e) => write!(f, "redis error: {}", e),
            FederatorError::Http(e) => write!(f, "http error: {}", e),
            FederatorError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for FederatorError {}

impl From<redis::RedisError> for FederatorError {
    fn from(e: redis::RedisError) -> Self {
        FederatorError::Redis(e)
    }
}

impl From<reqwest::Error> for FederatorError {
    fn from(e: reqwest::Error) -> Self {
        FederatorError::Http(e)
    }
}

impl FederatorError {
    /// Map the error to the client-facing HTTP status. `nodata` is the
    /// client-selected no-content code (204 or 404).
    pub fn http_status(&self, nodata: u16) -> StatusCode {
        match self {
            FederatorError::ClientInput(_) => StatusCode::BAD_REQUEST,
            FederatorError::NoData => {
                StatusCode::from_u16(nodata).unwrap_or(StatusCode::NO_CONTENT)
            }
            FederatorError::Routing(_)
            | FederatorError::Redis(_)
            | FederatorError::Http(_)
            | FederatorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FederatorError::CapacityRefused(_) => StatusCode::SERVICE_UNAVAILABLE,
            // The client is gone; the status is never observed.
            FederatorError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
