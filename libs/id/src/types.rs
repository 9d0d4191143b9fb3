use crate::define_id;

define_id!(
    /// A served model. Stable across spec revisions.
    ModelId,
    "mdl"
);

define_id!(
    /// One replica of a model revision.
    InstanceId,
    "inst"
);

define_id!(
    /// A GPU node in the fleet.
    WorkerId,
    "wkr"
);

define_id!(
    /// Correlation id attached to API and proxy requests.
    RequestId,
    "req"
);

/// Position in the control plane's event log. Monotonic, not ULID-based.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct EventId(i64);

impl EventId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}
