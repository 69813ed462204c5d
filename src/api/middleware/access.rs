//! Caller identity and the per-operation role gate.
//!
//! The gateway in front of this service authenticates requests and forwards
//! the verified identity as `x-caller-id` / `x-caller-role` headers.
//! [`attach_caller`] parses those once per request into a [`Caller`]
//! extension; each operation then declares the [`RoleSet`] it admits as a
//! const and checks it at entry, instead of scattering ad-hoc role
//! comparisons through the handlers.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use http::StatusCode;
use thiserror::Error;

use crate::constants::{CALLER_ID_HEADER, CALLER_ROLE_HEADER};
use crate::db::models::wallet::PatientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Patient = 0,
    Clinician = 1,
    Admin = 2,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "patient" => Some(Self::Patient),
            "clinician" => Some(Self::Clinician),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    const fn mask(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of roles admitted by an operation, buildable in const context so each
/// handler can declare its requirement as a `const`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSet(u8);

impl RoleSet {
    pub const fn of(roles: &[Role]) -> Self {
        let mut bits = 0u8;
        let mut i = 0;
        while i < roles.len() {
            bits |= roles[i].mask();
            i += 1;
        }
        Self(bits)
    }

    pub const fn contains(&self, role: Role) -> bool {
        self.0 & role.mask() != 0
    }
}

/// Verified identity of the requester, attached by [`attach_caller`]
#[derive(Debug, Clone)]
pub struct Caller {
    pub patient_id: Option<PatientId>,
    pub role: Role,
}

impl Caller {
    pub fn require(&self, allowed: RoleSet) -> AccessResult<()> {
        if allowed.contains(self.role) {
            Ok(())
        } else {
            Err(AccessErr::Forbidden { role: self.role })
        }
    }

    /// Admits the patient themselves, or any of the `allowed` roles
    pub fn require_self_or(&self, patient_id: PatientId, allowed: RoleSet) -> AccessResult<()> {
        if self.patient_id == Some(patient_id) {
            return Ok(());
        }

        self.require(allowed)
    }

    /// The caller's own patient record; present only for patient-role callers
    pub fn own_patient_id(&self) -> AccessResult<PatientId> {
        self.patient_id.ok_or(AccessErr::NoPatientIdentity)
    }
}

pub async fn attach_caller(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let headers = req.headers();

    let role = headers
        .get(CALLER_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(Role::parse)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let patient_id = match headers.get(CALLER_ID_HEADER) {
        Some(v) => Some(PatientId(
            v.to_str()
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(StatusCode::UNAUTHORIZED)?,
        )),
        None => None,
    };

    // a patient-role caller with no patient record makes no sense; reject
    // rather than let the gate admit it to self-scoped operations
    if role == Role::Patient && patient_id.is_none() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    req.extensions_mut().insert(Caller { patient_id, role });
    Ok(next.run(req).await)
}

pub type AccessResult<T> = core::result::Result<T, AccessErr>;

#[derive(Debug, Error)]
pub enum AccessErr {
    #[error("caller role '{role:?}' is not permitted for this operation")]
    Forbidden { role: Role },

    #[error("caller is not associated with a patient record")]
    NoPatientIdentity,
}

#[cfg(test)]
mod test {
    use super::*;

    const STAFF: RoleSet = RoleSet::of(&[Role::Clinician, Role::Admin]);

    #[test]
    fn test_role_set_membership() {
        assert!(STAFF.contains(Role::Clinician));
        assert!(STAFF.contains(Role::Admin));
        assert!(!STAFF.contains(Role::Patient));
    }

    #[test]
    fn test_self_access_bypasses_role_check() {
        let caller = Caller {
            patient_id: Some(PatientId(7)),
            role: Role::Patient,
        };

        assert!(caller.require_self_or(PatientId(7), STAFF).is_ok());
        assert!(caller.require_self_or(PatientId(8), STAFF).is_err());
    }

    #[test]
    fn test_staff_access_other_patients() {
        let caller = Caller {
            patient_id: None,
            role: Role::Clinician,
        };

        assert!(caller.require_self_or(PatientId(7), STAFF).is_ok());
        assert!(caller.own_patient_id().is_err());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("Admin"), Some(Role::Admin));
        assert_eq!(Role::parse("PATIENT"), Some(Role::Patient));
        assert_eq!(Role::parse("receptionist"), None);
    }
}
