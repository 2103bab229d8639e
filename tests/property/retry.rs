// tests/property/retry.rs

use std::time::Duration;

use proptest::prelude::*;
use taskexec::task::{RetryDecision, RetryPolicy};

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (0u32..10, 1u64..1_000, 0u32..100).prop_map(|(max_retries, unit_ms, cap)| RetryPolicy {
        max_retries,
        backoff_unit: Duration::from_millis(unit_ms),
        backoff_cap: cap,
    })
}

proptest! {
    #[test]
    fn backoff_grows_with_failures_and_is_capped(policy in policy_strategy(), failcount in 0u32..1_000) {
        let here = policy.backoff(failcount);
        prop_assert!(here <= policy.backoff(failcount + 1));
        prop_assert!(here <= policy.backoff_unit * policy.backoff_cap);
    }

    #[test]
    fn decision_follows_the_ceiling(
        policy in policy_strategy(),
        failcount in 0u32..20,
        task_ceiling in proptest::option::of(0u32..10),
    ) {
        let ceiling = task_ceiling.unwrap_or(policy.max_retries);
        match policy.decide(failcount, task_ceiling) {
            RetryDecision::GiveUp => prop_assert!(failcount >= ceiling),
            RetryDecision::Execute => prop_assert!(failcount == 0 && ceiling > 0),
            RetryDecision::Delay(d) => {
                prop_assert!(failcount > 0 && failcount < ceiling);
                prop_assert_eq!(d, policy.backoff(failcount));
            }
        }
    }
}
