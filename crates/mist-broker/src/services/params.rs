//! Typed access to `service.request` params.
//!
//! Each helper fails with [`ServiceError::InvalidParams`] naming the
//! offending parameter, so handlers can use `?` and let the dispatcher turn
//! the failure into a `service.error` reply.

use serde_json::{Map, Value};

use crate::error::ServiceError;

pub type Params = Map<String, Value>;

/// Params as an object. `null` reads as empty; anything else is rejected.
pub fn as_object(params: Value) -> Result<Params, ServiceError> {
    match params {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(ServiceError::InvalidParams(
            "params must be an object".to_string(),
        )),
    }
}

fn present<'a>(params: &'a Params, name: &str) -> Option<&'a Value> {
    params.get(name).filter(|v| !v.is_null())
}

pub fn require_str<'a>(params: &'a Params, name: &str) -> Result<&'a str, ServiceError> {
    match present(params, name) {
        Some(v) => v.as_str().ok_or_else(|| ServiceError::invalid(name, "a string")),
        None => Err(ServiceError::missing(name)),
    }
}

pub fn optional_str<'a>(params: &'a Params, name: &str) -> Result<Option<&'a str>, ServiceError> {
    present(params, name)
        .map(|v| v.as_str().ok_or_else(|| ServiceError::invalid(name, "a string")))
        .transpose()
}

pub fn require_i64(params: &Params, name: &str) -> Result<i64, ServiceError> {
    match present(params, name) {
        Some(v) => v.as_i64().ok_or_else(|| ServiceError::invalid(name, "an integer")),
        None => Err(ServiceError::missing(name)),
    }
}

pub fn optional_u64(params: &Params, name: &str) -> Result<Option<u64>, ServiceError> {
    present(params, name)
        .map(|v| {
            v.as_u64()
                .ok_or_else(|| ServiceError::invalid(name, "a non-negative integer"))
        })
        .transpose()
}

/// Longest look-ahead an `upcoming` window may ask for, about a century.
pub const MAX_WINDOW_DAYS: u64 = 36_500;

/// Window length in days for `upcoming` actions, clamped to
/// [`MAX_WINDOW_DAYS`].
pub fn window_days(params: &Params, name: &str, default: u64) -> Result<i64, ServiceError> {
    let days = optional_u64(params, name)?
        .unwrap_or(default)
        .min(MAX_WINDOW_DAYS);
    Ok(days as i64)
}

pub fn optional_f64(params: &Params, name: &str) -> Result<Option<f64>, ServiceError> {
    present(params, name)
        .map(|v| v.as_f64().ok_or_else(|| ServiceError::invalid(name, "a number")))
        .transpose()
}

pub fn optional_bool(params: &Params, name: &str) -> Result<Option<bool>, ServiceError> {
    present(params, name)
        .map(|v| v.as_bool().ok_or_else(|| ServiceError::invalid(name, "a boolean")))
        .transpose()
}
