//! The connection a stream is multiplexed over.
//!
//! A [`Connection`] groups many streams that share one transport path and one
//! authorization context.  Streams hold it behind an `Arc` and only ever read
//! from it: the MTU for segment sizing, the local [`Side`] for stream-id
//! parity, and the [`AccessControl`] policy consulted before dispatch.
//!
//! [`PeerConnection`] is the plain implementation used by the UDP endpoint and
//! the tests; [`AccessPolicy`] is its set-based access-control policy.

use std::collections::{HashMap, HashSet};
use std::fmt;

use thiserror::Error;

use crate::service::ServiceId;

// ---------------------------------------------------------------------------
// Bit sets
// ---------------------------------------------------------------------------

macro_rules! bitset {
    ($(#[$meta:meta])* $name:ident($repr:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub $repr);

        impl $name {
            pub const NONE: Self = Self(0);
            pub const ALL: Self = Self(<$repr>::MAX);

            /// `true` when every bit of `other` is set in `self`.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitset! {
    /// Kinds of principal a connection can authenticate as.
    UserType(u8)
}

impl UserType {
    pub const GUEST: Self = Self(1 << 0);
    pub const PERSON: Self = Self(1 << 1);
    pub const ORG: Self = Self(1 << 2);
    pub const APP: Self = Self(1 << 3);
}

bitset! {
    /// Days of the week, Monday in bit 0.
    Weekdays(u8)
}

impl Weekdays {
    pub const MONDAY: Self = Self(1 << 0);
    pub const TUESDAY: Self = Self(1 << 1);
    pub const WEDNESDAY: Self = Self(1 << 2);
    pub const THURSDAY: Self = Self(1 << 3);
    pub const FRIDAY: Self = Self(1 << 4);
    pub const SATURDAY: Self = Self(1 << 5);
    pub const SUNDAY: Self = Self(1 << 6);
    pub const WORKDAYS: Self = Self(0b0001_1111);

    /// Single-day set for a day counted from Monday (`0..=6`).
    pub fn from_monday(days: u8) -> Self {
        Self(1 << (days % 7))
    }
}

bitset! {
    /// Hours of the day (UTC), hour 0 in bit 0.
    DayHours(u32)
}

impl DayHours {
    /// Single-hour set.
    pub fn hour(hour: u8) -> Self {
        Self(1 << (hour % 24))
    }

    /// Hours `start..end`.
    pub fn range(start: u8, end: u8) -> Self {
        (start.min(24)..end.min(24)).fold(Self::NONE, |set, h| set | Self::hour(h))
    }
}

bitset! {
    /// Create / read / update / delete.
    Crud(u8)
}

impl Crud {
    pub const CREATE: Self = Self(1 << 0);
    pub const READ: Self = Self(1 << 1);
    pub const UPDATE: Self = Self(1 << 2);
    pub const DELETE: Self = Self(1 << 3);
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Which end of a connection we are.
///
/// The side that started the connection ("peer") allocates even stream ids;
/// the side that accepted it ("server") allocates odd ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Peer,
    Server,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Peer => Self::Server,
            Self::Server => Self::Peer,
        }
    }
}

/// Topology identifiers of the party at the far end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Origin {
    pub society: u32,
    pub router: u32,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "society {} router {}", self.society, self.router)
    }
}

// ---------------------------------------------------------------------------
// Access control
// ---------------------------------------------------------------------------

/// Specific reason an access-control check refused a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    #[error("user type {actual:?} is not among {required:?}")]
    UserType { required: UserType, actual: UserType },
    #[error("access not permitted on {day:?} at {hour:?}")]
    When { day: Weekdays, hour: DayHours },
    #[error("service {service} not permitted for {crud:?}")]
    Which { service: ServiceId, crud: Crud },
    #[error("{origin} not permitted")]
    Where { origin: Origin },
}

/// Access-control policy evaluated for every stream before dispatch.
pub trait AccessControl {
    /// `day` and `hour` are single-bit sets describing the current time.
    fn authorize_when(&self, day: Weekdays, hour: DayHours) -> Result<(), Denial>;

    fn authorize_which(&self, service: ServiceId, crud: Crud) -> Result<(), Denial>;

    fn authorize_where(&self, origin: Origin) -> Result<(), Denial>;
}

/// Set-based [`AccessControl`].  `None` means "no restriction".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    pub days: Weekdays,
    pub hours: DayHours,
    pub services: Option<HashMap<ServiceId, Crud>>,
    pub societies: Option<HashSet<u32>>,
    pub routers: Option<HashSet<u32>>,
}

impl AccessPolicy {
    pub fn allow_all() -> Self {
        Self {
            days: Weekdays::ALL,
            hours: DayHours::ALL,
            services: None,
            societies: None,
            routers: None,
        }
    }

    /// Restrict to the listed services, adding `service` with `crud`.
    pub fn permit_service(mut self, service: ServiceId, crud: Crud) -> Self {
        let services = self.services.get_or_insert_with(HashMap::new);
        let entry = services.entry(service).or_insert(Crud::NONE);
        *entry = *entry | crud;
        self
    }

    /// Restrict to the listed societies, adding `society`.
    pub fn permit_society(mut self, society: u32) -> Self {
        self.societies.get_or_insert_with(HashSet::new).insert(society);
        self
    }

    /// Restrict to the listed routers, adding `router`.
    pub fn permit_router(mut self, router: u32) -> Self {
        self.routers.get_or_insert_with(HashSet::new).insert(router);
        self
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl AccessControl for AccessPolicy {
    fn authorize_when(&self, day: Weekdays, hour: DayHours) -> Result<(), Denial> {
        if self.days.intersects(day) && self.hours.intersects(hour) {
            Ok(())
        } else {
            Err(Denial::When { day, hour })
        }
    }

    fn authorize_which(&self, service: ServiceId, crud: Crud) -> Result<(), Denial> {
        let permitted = match &self.services {
            None => true,
            Some(services) => services
                .get(&service)
                .is_some_and(|allowed| allowed.contains(crud)),
        };
        if permitted {
            Ok(())
        } else {
            Err(Denial::Which { service, crud })
        }
    }

    fn authorize_where(&self, origin: Origin) -> Result<(), Denial> {
        let society = self
            .societies
            .as_ref()
            .map_or(true, |s| s.contains(&origin.society));
        let router = self
            .routers
            .as_ref()
            .map_or(true, |r| r.contains(&origin.router));
        if society && router {
            Ok(())
        } else {
            Err(Denial::Where { origin })
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Shared, read-only context of the streams multiplexed over one path.
pub trait Connection {
    fn id(&self) -> ConnectionId;

    /// Our end of the connection.
    fn side(&self) -> Side;

    fn mtu(&self) -> u16;

    fn user_type(&self) -> UserType;

    fn origin(&self) -> Origin;

    fn access_control(&self) -> &dyn AccessControl;
}

/// A [`Connection`] described by plain values.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    id: ConnectionId,
    side: Side,
    mtu: u16,
    user_type: UserType,
    origin: Origin,
    policy: AccessPolicy,
}

impl PeerConnection {
    /// A guest connection with an unrestricted policy and a 1500-byte MTU.
    pub fn new(id: ConnectionId, side: Side) -> Self {
        Self {
            id,
            side,
            mtu: 1500,
            user_type: UserType::GUEST,
            origin: Origin::default(),
            policy: AccessPolicy::allow_all(),
        }
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_user_type(mut self, user_type: UserType) -> Self {
        self.user_type = user_type;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Connection for PeerConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn side(&self) -> Side {
        self.side
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn user_type(&self) -> UserType {
        self.user_type
    }

    fn origin(&self) -> Origin {
        self.origin
    }

    fn access_control(&self) -> &dyn AccessControl {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_hours_range_is_half_open() {
        let office = DayHours::range(9, 17);
        assert!(office.contains(DayHours::hour(9)));
        assert!(office.contains(DayHours::hour(16)));
        assert!(!office.intersects(DayHours::hour(17)));
        assert!(!office.intersects(DayHours::hour(3)));
        assert_eq!(DayHours::range(0, 99).0, (1 << 24) - 1);
    }

    #[test]
    fn weekday_from_monday_wraps() {
        assert_eq!(Weekdays::from_monday(0), Weekdays::MONDAY);
        assert_eq!(Weekdays::from_monday(6), Weekdays::SUNDAY);
        assert!(Weekdays::WORKDAYS.contains(Weekdays::FRIDAY));
        assert!(!Weekdays::WORKDAYS.intersects(Weekdays::SATURDAY));
    }

    #[test]
    fn policy_restricts_services_by_crud() {
        let policy = AccessPolicy::allow_all().permit_service(ServiceId(7), Crud::READ);
        assert_eq!(policy.authorize_which(ServiceId(7), Crud::READ), Ok(()));
        assert_eq!(
            policy.authorize_which(ServiceId(7), Crud::DELETE),
            Err(Denial::Which {
                service: ServiceId(7),
                crud: Crud::DELETE
            })
        );
        assert!(policy.authorize_which(ServiceId(8), Crud::READ).is_err());
        assert!(AccessPolicy::allow_all()
            .authorize_which(ServiceId(8), Crud::ALL)
            .is_ok());
    }

    #[test]
    fn policy_restricts_origin() {
        let policy = AccessPolicy::allow_all().permit_society(1).permit_router(10);
        let home = Origin {
            society: 1,
            router: 10,
        };
        let away = Origin {
            society: 1,
            router: 11,
        };
        assert_eq!(policy.authorize_where(home), Ok(()));
        assert_eq!(
            policy.authorize_where(away),
            Err(Denial::Where { origin: away })
        );
    }

    #[test]
    fn policy_restricts_time() {
        let policy = AccessPolicy {
            days: Weekdays::WORKDAYS,
            hours: DayHours::range(9, 17),
            ..AccessPolicy::allow_all()
        };
        assert!(policy
            .authorize_when(Weekdays::TUESDAY, DayHours::hour(10))
            .is_ok());
        assert!(policy
            .authorize_when(Weekdays::SUNDAY, DayHours::hour(10))
            .is_err());
        assert!(policy
            .authorize_when(Weekdays::TUESDAY, DayHours::hour(20))
            .is_err());
    }
}
