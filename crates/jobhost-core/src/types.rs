use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Number of owner ids reserved for each principal group.
pub const OWNER_RANGE_PER_GROUP: u32 = 100_000;

/// Numeric principal that schedules jobs (one per installed app per group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub u32);

impl OwnerId {
    /// The principal group (device user) this owner belongs to.
    pub fn group(self) -> GroupId {
        GroupId(self.0 / OWNER_RANGE_PER_GROUP)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for OwnerId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// A group of principals, e.g. every owner belonging to one device user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl GroupId {
    /// Build the owner id for `app` inside this group.
    pub fn owner(self, app: u32) -> OwnerId {
        OwnerId(self.0 * OWNER_RANGE_PER_GROUP + app % OWNER_RANGE_PER_GROUP)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen job identifier, unique per owner only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for JobId {
    fn from(v: i32) -> Self {
        Self(v)
    }
}

/// Store-wide job identity: `(owner, job_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub owner: OwnerId,
    pub job_id: JobId,
}

impl JobKey {
    pub fn new(owner: impl Into<OwnerId>, job_id: impl Into<JobId>) -> Self {
        Self {
            owner: owner.into(),
            job_id: job_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#u{}/{}", self.owner, self.job_id)
    }
}

/// Executor component a job binds to: `package/class`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentName {
    pub package: String,
    pub class: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Short form used in logs and wake lock tags.
    pub fn flatten_short(&self) -> String {
        match self.class.strip_prefix(&self.package) {
            Some(rest) if rest.starts_with('.') => format!("{}/{}", self.package, rest),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

impl std::str::FromStr for ComponentName {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (package, class) = s
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidComponent(s.to_string()))?;
        if package.is_empty() || class.is_empty() {
            return Err(CoreError::InvalidComponent(s.to_string()));
        }
        // "pkg/.Svc" is shorthand for "pkg/pkg.Svc"
        let class = if class.starts_with('.') {
            format!("{package}{class}")
        } else {
            class.to_string()
        };
        Ok(Self::new(package, class))
    }
}
