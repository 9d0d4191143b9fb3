/// Order in which surplus instances are removed. Lower drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Failing health checks or on a lost worker.
    Unhealthy = 0,
    /// Not serving yet: pending, scheduled or starting.
    NotReady = 1,
    /// Serving. Among these the newest goes first so long-lived, warm
    /// replicas survive.
    Ready = 2,
}

/// Sorts `instances` into drain order: by priority, then newest first.
///
/// `created` must be monotonic in creation time; ULID ids qualify.
pub fn select_for_drain<T, K, P, C>(mut instances: Vec<T>, priority: P, created: C) -> Vec<T>
where
    K: Ord,
    P: Fn(&T) -> DrainPriority,
    C: Fn(&T) -> K,
{
    instances.sort_by(|a, b| {
        priority(a)
            .cmp(&priority(b))
            .then_with(|| created(b).cmp(&created(a)))
    });
    instances
}
