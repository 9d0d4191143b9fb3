/// Bounds on how far a rollout may stray from the desired replica count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingStrategy {
    /// Replicas allowed above the desired count.
    pub max_surge: u32,
    /// Replicas allowed below the desired count.
    pub max_unavailable: u32,
}

impl Default for RollingStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

/// Active instances of one model, split by whether they match the current
/// template and whether they are serving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloutCounts {
    pub desired: u32,
    pub current_ready: u32,
    pub current_not_ready: u32,
    pub old_ready: u32,
    pub old_not_ready: u32,
}

impl RolloutCounts {
    pub fn total(&self) -> u32 {
        self.current_ready + self.current_not_ready + self.old_ready + self.old_not_ready
    }

    pub fn current(&self) -> u32 {
        self.current_ready + self.current_not_ready
    }

    pub fn available(&self) -> u32 {
        self.current_ready + self.old_ready
    }
}

/// Actions for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloutPlan {
    /// New instances of the current template to create.
    pub start: u32,
    /// Old-template instances that are not serving; safe to remove.
    pub drain_old_not_ready: u32,
    /// Old-template serving instances to remove.
    pub drain_old_ready: u32,
    /// Current-template instances above the desired count.
    pub drain_current: u32,
}

impl RolloutPlan {
    pub fn is_noop(&self) -> bool {
        *self == RolloutPlan::default()
    }
}

impl RollingStrategy {
    /// Plans creates and removals so that the number of instances never
    /// exceeds `desired + max_surge` and the number of serving instances
    /// never drops below `desired - max_unavailable` because of a removal.
    ///
    /// Plain scale-up and scale-down fall out as special cases with no old
    /// instances.
    pub fn plan(&self, counts: RolloutCounts) -> RolloutPlan {
        let desired = counts.desired;
        let mut plan = RolloutPlan::default();

        // Surplus of the current template: remove the excess and every old
        // instance, the current ones already cover the desired count.
        if counts.current() >= desired {
            plan.drain_current = counts.current() - desired;
            plan.drain_old_not_ready = counts.old_not_ready;
            plan.drain_old_ready = counts.old_ready;
            return plan;
        }

        // Old instances that are not serving do not protect availability.
        plan.drain_old_not_ready = counts.old_not_ready;
        let total = counts.total() - plan.drain_old_not_ready;

        let max_total = desired.saturating_add(self.max_surge);
        let room = max_total.saturating_sub(total);
        let missing = desired - counts.current();
        plan.start = room.min(missing);

        let min_available = desired.saturating_sub(self.max_unavailable);
        let spare = counts.available().saturating_sub(min_available);
        plan.drain_old_ready = spare.min(counts.old_ready);

        // With no surge budget, draining makes the room for the next start.
        if plan.start == 0 && self.max_surge == 0 && plan.drain_old_ready > 0 {
            plan.start = plan.drain_old_ready.min(missing);
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn counts(desired: u32, cr: u32, cn: u32, or: u32, on: u32) -> RolloutCounts {
        RolloutCounts {
            desired,
            current_ready: cr,
            current_not_ready: cn,
            old_ready: or,
            old_not_ready: on,
        }
    }

    #[rstest]
    // fresh model: scale straight up
    #[case(counts(3, 0, 0, 0, 0), 3, 0, 0, 0)]
    // waiting for pending replicas
    #[case(counts(3, 2, 1, 0, 0), 0, 0, 0, 0)]
    // scale down by two
    #[case(counts(1, 3, 0, 0, 0), 0, 0, 0, 2)]
    // rollout start: one surge replica
    #[case(counts(3, 0, 0, 3, 0), 1, 0, 0, 0)]
    // surge replica ready: one old can go
    #[case(counts(3, 1, 0, 3, 0), 0, 0, 1, 0)]
    // surge replica still starting: hold
    #[case(counts(3, 0, 1, 3, 0), 0, 0, 0, 0)]
    // rollout complete
    #[case(counts(3, 3, 0, 1, 0), 0, 0, 1, 0)]
    // broken old replicas are removed immediately
    #[case(counts(3, 0, 0, 2, 1), 2, 1, 0, 0)]
    fn plans(
        #[case] c: RolloutCounts,
        #[case] start: u32,
        #[case] drain_old_not_ready: u32,
        #[case] drain_old_ready: u32,
        #[case] drain_current: u32,
    ) {
        let plan = RollingStrategy::default().plan(c);
        assert_eq!(
            plan,
            RolloutPlan {
                start,
                drain_old_not_ready,
                drain_old_ready,
                drain_current,
            }
        );
    }

    #[test]
    fn max_unavailable_allows_drain_without_surge() {
        let strategy = RollingStrategy {
            max_surge: 0,
            max_unavailable: 1,
        };
        let plan = strategy.plan(counts(3, 0, 0, 3, 0));
        assert_eq!(plan.drain_old_ready, 1);
        assert_eq!(plan.start, 1);
    }

    /// Drives a rollout to completion, letting every started instance become
    /// ready before the next pass.
    fn simulate(desired: u32, strategy: RollingStrategy) -> (u32, u32, usize) {
        let mut c = counts(desired, 0, 0, desired, 0);
        let mut peak = c.total();
        let mut floor = c.available();
        let mut passes = 0;
        loop {
            let plan = strategy.plan(c);
            if plan.is_noop() {
                break;
            }
            c.old_ready -= plan.drain_old_ready;
            c.old_not_ready -= plan.drain_old_not_ready;
            c.current_ready -= plan.drain_current;
            floor = floor.min(c.available());
            c.current_not_ready += plan.start;
            peak = peak.max(c.total());
            c.current_ready += c.current_not_ready;
            c.current_not_ready = 0;
            passes += 1;
            assert!(passes < 100, "rollout did not converge");
        }
        assert_eq!(c.current_ready, desired);
        assert_eq!(c.old_ready, 0);
        (peak, floor, passes)
    }

    #[test]
    fn surge_of_one_never_exceeds_desired_plus_one() {
        let (peak, floor, _) = simulate(3, RollingStrategy::default());
        assert_eq!(peak, 4);
        assert_eq!(floor, 3);
    }

    proptest! {
        #[test]
        fn rollouts_respect_bounds(desired in 1u32..8, surge in 0u32..3, unavailable in 0u32..3) {
            prop_assume!(surge + unavailable > 0);
            let strategy = RollingStrategy { max_surge: surge, max_unavailable: unavailable };
            let (peak, floor, _) = simulate(desired, strategy);
            prop_assert!(peak <= desired + surge);
            prop_assert!(floor >= desired.saturating_sub(unavailable));
        }
    }
}
