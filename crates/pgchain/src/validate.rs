//! Numeric range checks for ports, limits, and row ranges.

use crate::error::{OrmError, OrmResult};

/// A TCP port in `1..=65535`.
pub fn validate_port(port: i64) -> OrmResult<u16> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(OrmError::validation(format!(
            "Invalid port {port}: must be between 1 and 65535"
        ))),
    }
}

/// A non-negative row limit.
pub fn validate_limit(limit: i64) -> OrmResult<u64> {
    u64::try_from(limit)
        .map_err(|_| OrmError::validation(format!("Invalid limit {limit}: must be >= 0")))
}

/// An inclusive row range with `0 <= from <= to`.
pub fn validate_range(from: i64, to: i64) -> OrmResult<(u64, u64)> {
    if from < 0 || to < from {
        return Err(OrmError::validation(format!(
            "Invalid range {from}..={to}: requires 0 <= from <= to"
        )));
    }
    Ok((from as u64, to as u64))
}
