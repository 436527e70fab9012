//! JSON response marshaling.
//!
//! Handlers (including ones that finish asynchronously) leave a
//! [`ResponseObject`] on the exchange instead of writing the body themselves;
//! the [`marshaling`] response filter serializes it once the request has been
//! routed. Problems are RFC 7807 bodies served as `application/problem+json`.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::context::Exchange;
use crate::error::BoxError;
use crate::http::StatusCode;

pub const JSON: &str = "application/json";
pub const PROBLEM_JSON: &str = "application/problem+json";

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("status {0} is not a supported response status")]
    UnknownStatus(u16),

    #[error("failed to serialize response object: {0}")]
    Json(#[from] serde_json::Error),
}

/// A value waiting to be written as the response body.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseObject {
    pub status: u16,
    pub value: Value,
    pub content_type: &'static str,
}

impl ResponseObject {
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Result<Self, MarshalError> {
        Ok(Self {
            status: status.as_u16(),
            value: serde_json::to_value(value)?,
            content_type: JSON,
        })
    }

    pub fn problem(problem: &Problem) -> Result<Self, MarshalError> {
        Ok(Self {
            status: problem.status,
            value: serde_json::to_value(problem)?,
            content_type: PROBLEM_JSON,
        })
    }
}

/// An RFC 7807 problem document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Problem {
    pub status: u16,
    pub title: String,
    pub detail: String,
}

impl Problem {
    /// A problem titled with the status's reason phrase.
    pub fn from_status(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            title: status.canonical_reason().to_owned(),
            detail: String::new(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn unauthorized() -> Self {
        Self::from_status(StatusCode::Unauthorized)
    }

    pub fn forbidden() -> Self {
        Self::from_status(StatusCode::Forbidden)
    }

    pub fn not_found() -> Self {
        Self::from_status(StatusCode::NotFound)
    }

    pub fn conflict() -> Self {
        Self::from_status(StatusCode::Conflict)
    }

    pub fn precondition_failed() -> Self {
        Self::from_status(StatusCode::PreconditionFailed)
    }

    pub fn internal_server_error() -> Self {
        Self::from_status(StatusCode::InternalServerError)
    }
}

/// Leaves `value` on the exchange for [`marshaling`] to write.
pub fn respond_with<T: Serialize + ?Sized>(
    exchange: &mut Exchange,
    status: StatusCode,
    value: &T,
) -> Result<(), MarshalError> {
    let object = ResponseObject::json(status, value)?;
    exchange.attachments_mut().insert(object);
    Ok(())
}

pub fn respond_with_problem(exchange: &mut Exchange, problem: &Problem) -> Result<(), MarshalError> {
    let object = ResponseObject::problem(problem)?;
    exchange.attachments_mut().insert(object);
    Ok(())
}

/// Response filter writing a pending [`ResponseObject`]: status,
/// `Content-Type`, and the serialized body. Does nothing when no object is
/// attached.
pub fn marshaling() -> impl Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static {
    |exchange: &mut Exchange| {
        let Some(object) = exchange.attachments().get::<ResponseObject>() else {
            return Ok(());
        };
        let status =
            StatusCode::from_u16(object.status).ok_or(MarshalError::UnknownStatus(object.status))?;
        let content_type = object.content_type;
        let body = serde_json::to_vec(&object.value).map_err(MarshalError::from)?;

        exchange.response_mut().set_header("Content-Type", content_type);
        exchange.send(status, body);
        Ok(())
    }
}
