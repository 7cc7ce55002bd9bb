//! The venue record: one reusable chat room from the fixed pool.

use std::str::FromStr;

use time::OffsetDateTime;
use uuid::Uuid;

use super::{UnknownCode, VenueId};

/// Pool state of a venue.
///
/// `Terminal` is a one-way door: a venue whose participants could not be
/// fully evicted is quarantined forever instead of being handed to the next
/// trade with a stranger still inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueStatus {
    Available,
    Assigned,
    Terminal,
}

impl VenueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueStatus::Available => "available",
            VenueStatus::Assigned => "assigned",
            VenueStatus::Terminal => "terminal",
        }
    }
}

impl FromStr for VenueStatus {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(VenueStatus::Available),
            "assigned" => Ok(VenueStatus::Assigned),
            "terminal" => Ok(VenueStatus::Terminal),
            other => Err(UnknownCode {
                kind: "venue status",
                value: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Venue {
    pub venue_id: VenueId,
    pub status: VenueStatus,
    pub assigned_trade: Option<Uuid>,
    /// Current join credential (invite link). Rotated on every assignment and
    /// on every reclaim so previously-approved users cannot silently rejoin.
    pub invite_credential: Option<String>,
    pub assigned_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
}

impl Venue {
    pub fn new(venue_id: VenueId) -> Self {
        Self {
            venue_id,
            status: VenueStatus::Available,
            assigned_trade: None,
            invite_credential: None,
            assigned_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            VenueStatus::Available,
            VenueStatus::Assigned,
            VenueStatus::Terminal,
        ] {
            assert_eq!(status.as_str().parse::<VenueStatus>(), Ok(status));
        }
        assert!("busy".parse::<VenueStatus>().is_err());
    }

    #[test]
    fn new_venue_starts_available() {
        let venue = Venue::new(VenueId(-100));
        assert_eq!(venue.status, VenueStatus::Available);
        assert!(venue.assigned_trade.is_none());
    }
}
