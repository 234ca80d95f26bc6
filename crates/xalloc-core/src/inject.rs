//! Deterministic failure injection and allocation overrides.

use xalloc_heap::Address;

/// "Fail the `after`-th eligible call, then every `repeat` calls after it."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePlan {
    /// 1-based index of the first failing call. `0` disables the plan.
    pub after: u64,
    /// Interval between later failures. `0` fails only once.
    pub repeat: u64,
    /// Count non-growing reallocations as eligible calls.
    pub include_shrink: bool,
}

impl FailurePlan {
    #[must_use]
    pub const fn once(after: u64) -> Self {
        Self {
            after,
            repeat: 0,
            include_shrink: false,
        }
    }

    #[must_use]
    pub const fn every(after: u64, repeat: u64) -> Self {
        Self {
            after,
            repeat,
            include_shrink: false,
        }
    }

    #[must_use]
    pub const fn with_shrink(mut self) -> Self {
        self.include_shrink = true;
        self
    }

    /// Whether eligible call number `call` (1-based) fails.
    #[must_use]
    pub const fn fails(&self, call: u64) -> bool {
        if self.after == 0 || call < self.after {
            return false;
        }
        let since = call - self.after;
        since == 0 || (self.repeat > 0 && since % self.repeat == 0)
    }
}

/// Test-control state kept beside the live list.
#[derive(Debug, Default)]
pub(crate) struct Injector {
    plan: Option<FailurePlan>,
    calls: u64,
    next_alloc: Option<Address>,
    sys_failure: bool,
    synthetic_avail: Option<usize>,
}

impl Injector {
    /// Installs `plan` and restarts the call count.
    pub(crate) fn set_plan(&mut self, plan: Option<FailurePlan>) {
        self.plan = plan.filter(|p| p.after > 0);
        self.calls = 0;
    }

    /// Counts one call. Returns the call number when it must fail.
    pub(crate) fn tick(&mut self, growing: bool) -> Option<u64> {
        let plan = self.plan?;
        if !growing && !plan.include_shrink {
            return None;
        }
        self.calls += 1;
        plan.fails(self.calls).then_some(self.calls)
    }

    /// Installs an override, returning the one it displaced.
    pub(crate) fn replace_next_alloc(&mut self, ptr: Option<Address>) -> Option<Address> {
        std::mem::replace(&mut self.next_alloc, ptr)
    }

    pub(crate) fn take_next_alloc(&mut self) -> Option<Address> {
        self.next_alloc.take()
    }

    pub(crate) fn sys_failure(&self) -> bool {
        self.sys_failure
    }

    pub(crate) fn set_sys_failure(&mut self, fail: bool) {
        self.sys_failure = fail;
    }

    pub(crate) fn synthetic_avail(&self) -> Option<usize> {
        self.synthetic_avail
    }

    pub(crate) fn set_synthetic_avail(&mut self, avail: Option<usize>) {
        self.synthetic_avail = avail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_calls(plan: FailurePlan, calls: u64) -> Vec<u64> {
        let mut injector = Injector::default();
        injector.set_plan(Some(plan));
        (0..calls).filter_map(|_| injector.tick(true)).collect()
    }

    #[test]
    fn single_failure() {
        assert_eq!(failing_calls(FailurePlan::once(3), 10), vec![3]);
    }

    #[test]
    fn repeating_failures() {
        assert_eq!(failing_calls(FailurePlan::every(2, 3), 12), vec![2, 5, 8, 11]);
        assert_eq!(failing_calls(FailurePlan::every(1, 1), 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn zero_after_disables() {
        assert!(failing_calls(FailurePlan::every(0, 1), 10).is_empty());
    }

    #[test]
    fn shrinks_are_ignored_unless_requested() {
        let mut injector = Injector::default();
        injector.set_plan(Some(FailurePlan::once(1)));
        assert_eq!(injector.tick(false), None);
        assert_eq!(injector.tick(true), Some(1));

        injector.set_plan(Some(FailurePlan::once(1).with_shrink()));
        assert_eq!(injector.tick(false), Some(1));
    }

    #[test]
    fn override_is_taken_once() {
        let mut injector = Injector::default();
        assert_eq!(injector.replace_next_alloc(Some(0x1000)), None);
        assert_eq!(injector.replace_next_alloc(Some(0x2000)), Some(0x1000));
        assert_eq!(injector.take_next_alloc(), Some(0x2000));
        assert_eq!(injector.take_next_alloc(), None);
    }
}
