use std::fmt;

use serde::{Deserialize, Serialize};

/// Ticket identifier in the ticketing backend.
///
/// A negative value is the backend's sentinel for "a ticket for this
/// serial already existed"; the real identifier is the absolute value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketId(pub i64);

impl TicketId {
    pub fn is_preexisting(&self) -> bool {
        self.0 < 0
    }

    /// The identifier usable against the ticketing API regardless of the
    /// sentinel sign.
    pub fn canonical(&self) -> i64 {
        self.0.abs()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fields for opening a ticket from a triaged email.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTicket {
    pub sender: String,
    pub subject: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub urgent: bool,
}
