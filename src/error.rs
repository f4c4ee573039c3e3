// Error taxonomy shared by every reducer in the pipeline.
// Helpers return CompetitionError; reducers flatten it to "<status> <message>".

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompetitionError {
    /// Malformed payload or a violated business rule (400)
    #[error("{0}")]
    Validation(String),

    /// Quota exceeded, duplicate registration, unique-key collision (409)
    #[error("{0}")]
    Conflict(String),

    /// Referenced row does not exist in the caller's school (404)
    #[error("{0}")]
    NotFound(String),

    /// Caller is not the gateway or has no staff session (403)
    #[error("{0}")]
    Unauthorized(String),
}

impl CompetitionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CompetitionError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CompetitionError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CompetitionError::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        CompetitionError::Unauthorized(msg.into())
    }

    /// HTTP-style status surfaced to the caller
    pub fn status(&self) -> u16 {
        match self {
            CompetitionError::Validation(_) => 400,
            CompetitionError::Unauthorized(_) => 403,
            CompetitionError::NotFound(_) => 404,
            CompetitionError::Conflict(_) => 409,
        }
    }

    /// Wire form returned from reducers, e.g. "409 quota exceeded: ..."
    pub fn to_reducer_error(&self) -> String {
        format!("{} {}", self.status(), self)
    }
}

pub type PipelineResult<T> = Result<T, CompetitionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(CompetitionError::validation("x").status(), 400);
        assert_eq!(CompetitionError::unauthorized("x").status(), 403);
        assert_eq!(CompetitionError::not_found("x").status(), 404);
        assert_eq!(CompetitionError::conflict("x").status(), 409);
    }

    #[test]
    fn test_reducer_error_format() {
        let err = CompetitionError::conflict("already registered");
        assert_eq!(err.to_reducer_error(), "409 already registered");
    }
}
