//! Operator identity and permission checks
//!
//! Permissions are dotted strings such as `controllers.alpha`. A leading `-`
//! flips the meaning: granting `-controllers.alpha` records the permission as
//! revoked, and checking `-controllers.alpha` asks whether it was revoked.

use crate::config::OperatorConfig;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Decides what an operator may do
pub trait Authorizer: Send + Sync {
    fn has_permission(&self, permission: &str) -> bool;
}

/// Permission needed to see and drive the named controller
pub fn controller_permission(name: &str) -> String {
    format!("controllers.{}", name)
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("operator name must be 3-16 lowercase characters, got '{0}'")]
    InvalidName(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z]{3,16}$").expect("operator name pattern is valid"))
}

/// Whether `name` is an acceptable operator name
pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

/// Strip leading `-` signs, returning the bare permission and whether it is
/// meant as granted
fn parse(permission: &str) -> (&str, bool) {
    let mut granted = true;
    let mut rest = permission;
    while let Some(stripped) = rest.strip_prefix('-') {
        granted = !granted;
        rest = stripped;
    }
    (rest, granted)
}

/// An authenticated operator and their permission table
#[derive(Debug, Clone)]
pub struct Operator {
    name: String,
    perm: HashMap<String, bool>,
}

impl Operator {
    pub fn new(name: impl Into<String>) -> Result<Self, AuthError> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(AuthError::InvalidName(name));
        }
        Ok(Self {
            name,
            perm: HashMap::new(),
        })
    }

    pub fn from_config(name: &str, config: &OperatorConfig) -> Result<Self, AuthError> {
        let mut operator = Self::new(name)?;
        for permission in &config.permissions {
            operator.set_permission(permission);
        }
        Ok(operator)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a permission as granted, or as revoked with a `-` prefix.
    /// Returns the resulting state.
    pub fn set_permission(&mut self, permission: &str) -> bool {
        let (permission, granted) = parse(permission);
        self.perm.insert(permission.to_string(), granted);
        granted
    }

    /// Grant a permission; false if it was already held
    pub fn give_permission(&mut self, permission: &str) -> bool {
        !self.has_permission(permission) && self.set_permission(permission)
    }

    /// Revoke a permission; false if it was not held
    pub fn revoke_permission(&mut self, permission: &str) -> bool {
        if !self.has_permission(permission) {
            return false;
        }
        let (bare, granted) = parse(permission);
        self.perm.insert(bare.to_string(), !granted);
        true
    }
}

impl Authorizer for Operator {
    fn has_permission(&self, permission: &str) -> bool {
        let (permission, granted) = parse(permission);
        self.perm.get(permission) == Some(&granted)
    }
}
