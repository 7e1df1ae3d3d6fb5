//! Domain records persisted in the `users` and `staff` collections.

mod staff;
mod user;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use staff::{NewStaff, Permission, Qualification, ShiftType, Staff, StaffPatch, StaffRole, WorkSchedule};
pub use user::{
    Address, Contact, FamilyMember, Gender, MedicalInfo, Medication, NewUser, User, UserPatch,
};

/// A record addressable by its document id.
pub trait Entity {
    fn id(&self) -> &str;
}

/// Collections that can be cached locally and replayed from the pending queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Users,
    Staff,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Staff => "staff",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Entity for serde_json::Value {
    fn id(&self) -> &str {
        self.get("id").and_then(serde_json::Value::as_str).unwrap_or_default()
    }
}
