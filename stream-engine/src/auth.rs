//! The authorization gate in front of every dispatch.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. user type: the connection's principal kind is one the service accepts,
//! 2. when: the current UTC weekday and hour are permitted,
//! 3. which: the service and its CRUD kind are permitted,
//! 4. where: the connection's origin is permitted.
//!
//! The failing check is reported together with the policy's [`Denial`].

use std::fmt;
use std::time::SystemTime;

use thiserror::Error;
use time::OffsetDateTime;

use crate::connection::{Connection, DayHours, Denial, Weekdays};
use crate::service::ServiceDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    UserType,
    When,
    Which,
    Where,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UserType => "user-type",
            Self::When => "when",
            Self::Which => "which",
            Self::Where => "where",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{check} check failed: {denial}")]
pub struct AuthError {
    pub check: Check,
    pub denial: Denial,
}

impl AuthError {
    fn at(check: Check) -> impl FnOnce(Denial) -> Self {
        move |denial| Self { check, denial }
    }
}

/// Run every check for a call to `service` over `connection` at `now`.
pub fn authorize(
    connection: &dyn Connection,
    service: &ServiceDescriptor,
    now: SystemTime,
) -> Result<(), AuthError> {
    let actual = connection.user_type();
    if !service.user_types.intersects(actual) {
        return Err(AuthError {
            check: Check::UserType,
            denial: Denial::UserType {
                required: service.user_types,
                actual,
            },
        });
    }

    let access = connection.access_control();
    let (day, hour) = calendar(now);
    access
        .authorize_when(day, hour)
        .map_err(AuthError::at(Check::When))?;
    access
        .authorize_which(service.id, service.crud)
        .map_err(AuthError::at(Check::Which))?;
    access
        .authorize_where(connection.origin())
        .map_err(AuthError::at(Check::Where))?;
    Ok(())
}

/// UTC weekday and hour of `now` as single-bit sets.
pub fn calendar(now: SystemTime) -> (Weekdays, DayHours) {
    let utc = OffsetDateTime::from(now);
    (
        Weekdays::from_monday(utc.weekday().number_days_from_monday()),
        DayHours::hour(utc.hour()),
    )
}
