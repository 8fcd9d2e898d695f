//! Permission vocabulary: resource types, access levels, and permission sets.
//!
//! Resource types and access levels are closed enumerations. Free-form strings
//! coming from calling layers are parsed once with [`ResourceType::parse`] and
//! [`AccessLevel::parse`]; anything outside the vocabulary is a
//! [`ConsentError::Validation`].
//!
//! Access levels are **not** hierarchical. A `write` permission does not
//! confer `read`; each level must be granted explicitly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConsentError;

/// Maximum number of permissions a single consent token may carry.
///
/// The vocabulary has five resource types and two levels, so anything larger
/// than the full cross product is necessarily redundant.
pub const MAX_PERMISSIONS: usize = ResourceType::ALL.len() * AccessLevel::ALL.len();

/// Category of medical record a permission governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Diagnoses recorded by a provider.
    Diagnosis,
    /// Prescriptions.
    Prescription,
    /// Laboratory results.
    LabResult,
    /// Imaging studies.
    Imaging,
    /// Free-text consultation notes.
    ConsultationNote,
}

impl ResourceType {
    /// Every resource type, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Diagnosis,
        Self::Prescription,
        Self::LabResult,
        Self::Imaging,
        Self::ConsultationNote,
    ];

    /// Returns the wire name of this resource type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Diagnosis => "diagnosis",
            Self::Prescription => "prescription",
            Self::LabResult => "lab_result",
            Self::Imaging => "imaging",
            Self::ConsultationNote => "consultation_note",
        }
    }

    /// Parses a resource type from its wire name.
    ///
    /// Matching is case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] for names outside the vocabulary.
    pub fn parse(s: &str) -> Result<Self, ConsentError> {
        match s.to_ascii_lowercase().as_str() {
            "diagnosis" => Ok(Self::Diagnosis),
            "prescription" => Ok(Self::Prescription),
            "lab_result" => Ok(Self::LabResult),
            "imaging" => Ok(Self::Imaging),
            "consultation_note" => Ok(Self::ConsultationNote),
            _ => Err(ConsentError::validation(
                "resource_type",
                format!("unrecognized resource type: {s}"),
            )),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ConsentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Level of access a permission confers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Read existing records.
    Read,
    /// Create or amend records.
    Write,
}

impl AccessLevel {
    /// Every access level.
    pub const ALL: [Self; 2] = [Self::Read, Self::Write];

    /// Returns the wire name of this access level.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// Parses an access level from its wire name.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] for anything but `read`/`write`.
    pub fn parse(s: &str) -> Result<Self, ConsentError> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            _ => Err(ConsentError::validation(
                "access_level",
                format!("unrecognized access level: {s}"),
            )),
        }
    }

    /// Returns `true` if holding `self` satisfies a request for `requested`.
    ///
    /// Levels are independent, so this is plain equality.
    #[must_use]
    pub fn satisfies(self, requested: Self) -> bool {
        self == requested
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = ConsentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A single (resource type, access level) grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Permission {
    /// The record category.
    pub resource_type: ResourceType,
    /// The granted level.
    pub access_level: AccessLevel,
}

impl Permission {
    /// Creates a permission.
    #[must_use]
    pub const fn new(resource_type: ResourceType, access_level: AccessLevel) -> Self {
        Self {
            resource_type,
            access_level,
        }
    }

    /// Parses a permission from wire names.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] if either name is unknown.
    pub fn parse(resource_type: &str, access_level: &str) -> Result<Self, ConsentError> {
        Ok(Self::new(
            ResourceType::parse(resource_type)?,
            AccessLevel::parse(access_level)?,
        ))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.access_level)
    }
}

/// A non-empty, duplicate-free, insertion-ordered set of permissions.
///
/// Order carries no meaning for evaluation but is preserved for display and
/// audit payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Permission>", into = "Vec<Permission>")]
pub struct PermissionSet(Vec<Permission>);

impl PermissionSet {
    /// Builds a set, dropping repeated entries and keeping first occurrences.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] if `permissions` is empty.
    pub fn new(permissions: Vec<Permission>) -> Result<Self, ConsentError> {
        if permissions.is_empty() {
            return Err(ConsentError::validation(
                "permissions",
                "at least one permission is required",
            ));
        }
        let mut unique: Vec<Permission> =
            Vec::with_capacity(permissions.len().min(MAX_PERMISSIONS));
        for permission in permissions {
            if !unique.contains(&permission) {
                unique.push(permission);
            }
        }
        Ok(Self(unique))
    }

    /// Returns the permissions in insertion order.
    #[must_use]
    pub fn as_slice(&self) -> &[Permission] {
        &self.0
    }

    /// Returns the number of distinct permissions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; kept for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if any permission names `resource_type`, at any level.
    #[must_use]
    pub fn mentions(&self, resource_type: ResourceType) -> bool {
        self.0.iter().any(|p| p.resource_type == resource_type)
    }

    /// Returns the levels granted for `resource_type`, in insertion order.
    #[must_use]
    pub fn levels_for(&self, resource_type: ResourceType) -> Vec<AccessLevel> {
        self.0
            .iter()
            .filter(|p| p.resource_type == resource_type)
            .map(|p| p.access_level)
            .collect()
    }

    /// Iterates over the permissions in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Permission> {
        self.0.iter()
    }
}

impl TryFrom<Vec<Permission>> for PermissionSet {
    type Error = ConsentError;

    fn try_from(value: Vec<Permission>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PermissionSet> for Vec<Permission> {
    fn from(value: PermissionSet) -> Self {
        value.0
    }
}

impl<'a> IntoIterator for &'a PermissionSet {
    type Item = &'a Permission;
    type IntoIter = std::slice::Iter<'a, Permission>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
