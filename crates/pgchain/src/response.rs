//! The uniform result of every executed call.

use crate::error::{OrmError, OrmResult};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Outcome of one call: data or an error, plus an optional row count.
///
/// Execution never returns `Err` to the caller directly; failures land in
/// `error`. Use [`Response::into_result`] to get back to `?`.
#[derive(Debug, Clone, Serialize)]
#[must_use]
pub struct Response<T> {
    pub data: Option<T>,
    pub error: Option<OrmError>,
    pub count: Option<i64>,
}

impl<T> Response<T> {
    pub fn ok(data: Option<T>, count: Option<i64>) -> Self {
        Self {
            data,
            error: None,
            count,
        }
    }

    pub fn err(error: OrmError) -> Self {
        Self {
            data: None,
            error: Some(error),
            count: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// `Err` when the call failed; otherwise the (possibly absent) data.
    pub fn into_result(self) -> OrmResult<Option<T>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        Response {
            data: self.data.map(f),
            error: self.error,
            count: self.count,
        }
    }
}

impl Response<serde_json::Value> {
    /// Deserialize the data into `T`.
    ///
    /// A value that does not fit `T` turns the response into a DECODE error;
    /// the count is kept.
    pub fn decode<T: DeserializeOwned>(self) -> Response<T> {
        let Response { data, error, count } = self;
        if let Some(err) = error {
            return Response::err(err);
        }
        match data.map(serde_json::from_value::<T>).transpose() {
            Ok(data) => Response::ok(data, count),
            Err(e) => Response {
                data: None,
                error: Some(OrmError::decode("<row>", e.to_string())),
                count,
            },
        }
    }
}
