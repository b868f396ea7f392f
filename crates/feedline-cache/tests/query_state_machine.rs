//! Stateful property testing for QueryCache writes, rollbacks and GC.
//!
//! Uses proptest-state-machine to check that the cache contents always match
//! a simple reference model, whatever order writes, failed mutations,
//! observers and garbage collection happen in.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

use feedline_cache::{
    CacheValue, ManualClock, Mutation, QueryCache, QueryError, QueryKey, QueryObserver,
    RetryPolicy, query_key,
};

/// Default gc_time of entries written through set_data, in minutes.
const GC_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
struct Count(u32);

impl CacheValue for Count {}

fn key(slot: u8) -> QueryKey {
    query_key!["posts", i64::from(slot)]
}

/// Operations that can be performed on the cache.
#[derive(Debug, Clone)]
pub enum CacheOperation {
    SetData { slot: u8, value: u32 },
    Update { slot: u8, delta: u32 },
    /// An optimistic mutation whose remote write is rejected.
    FailingMutation { slot: u8, delta: u32 },
    InvalidateAll,
    Observe { slot: u8 },
    Unobserve { slot: u8 },
    Advance { minutes: i64 },
    Gc,
}

#[derive(Debug, Clone)]
struct ModelEntry {
    value: Option<u32>,
    touched: i64,
}

/// Reference model for the cache contents.
#[derive(Clone, Debug, Default)]
pub struct CacheModel {
    entries: BTreeMap<u8, ModelEntry>,
    observers: BTreeMap<u8, usize>,
    now: i64,
}

impl CacheModel {
    fn observers(&self, slot: u8) -> usize {
        self.observers.get(&slot).copied().unwrap_or(0)
    }
}

impl ReferenceStateMachine for CacheModel {
    type State = Self;
    type Transition = CacheOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let slot = 0u8..4;
        prop_oneof![
            3 => (slot.clone(), 0u32..100).prop_map(|(slot, value)| CacheOperation::SetData { slot, value }),
            2 => (slot.clone(), 1u32..10).prop_map(|(slot, delta)| CacheOperation::Update { slot, delta }),
            2 => (slot.clone(), 1u32..10).prop_map(|(slot, delta)| CacheOperation::FailingMutation { slot, delta }),
            1 => Just(CacheOperation::InvalidateAll),
            1 => slot.clone().prop_map(|slot| CacheOperation::Observe { slot }),
            1 => slot.prop_map(|slot| CacheOperation::Unobserve { slot }),
            2 => (1i64..8).prop_map(|minutes| CacheOperation::Advance { minutes }),
            2 => Just(CacheOperation::Gc),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        let now = state.now;
        match transition {
            CacheOperation::SetData { slot, value } => {
                state.entries.insert(
                    *slot,
                    ModelEntry {
                        value: Some(*value),
                        touched: now,
                    },
                );
            }
            CacheOperation::Update { slot, delta } => {
                if let Some(entry) = state.entries.get_mut(slot) {
                    if let Some(value) = entry.value.as_mut() {
                        *value += delta;
                        entry.touched = now;
                    }
                }
            }
            CacheOperation::FailingMutation { .. } | CacheOperation::InvalidateAll => {}
            CacheOperation::Observe { slot } => {
                *state.observers.entry(*slot).or_default() += 1;
                state.entries.entry(*slot).or_insert(ModelEntry {
                    value: None,
                    touched: now,
                });
            }
            CacheOperation::Unobserve { slot } => {
                let count = state.observers.entry(*slot).or_default();
                *count -= 1;
                if *count == 0 {
                    if let Some(entry) = state.entries.get_mut(slot) {
                        entry.touched = now;
                    }
                }
            }
            CacheOperation::Advance { minutes } => state.now += minutes,
            CacheOperation::Gc => {
                let observers = state.observers.clone();
                state.entries.retain(|slot, entry| {
                    observers.get(slot).copied().unwrap_or(0) > 0 || now - entry.touched < GC_MINUTES
                });
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            CacheOperation::Unobserve { slot } => state.observers(*slot) > 0,
            _ => true,
        }
    }
}

struct Rejected {
    slot: u8,
    delta: u32,
}

#[async_trait]
impl Mutation<Count> for Rejected {
    type Output = ();

    fn keys(&self) -> Vec<QueryKey> {
        vec![key(self.slot)]
    }

    fn apply(&self, _key: &QueryKey, value: &mut Count) {
        value.0 += self.delta;
    }

    async fn execute(&self) -> Result<(), QueryError> {
        Err(QueryError::Validation("rejected".to_string()))
    }
}

/// Test harness wrapping a real cache on a manual clock.
pub struct CacheTestHarness {
    runtime: Runtime,
    cache: Arc<QueryCache<Count>>,
    clock: Arc<ManualClock>,
    observers: BTreeMap<u8, Vec<QueryObserver<Count>>>,
}

impl CacheTestHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let cache = QueryCache::with_clock(clock.clone());
        Self {
            runtime,
            cache,
            clock,
            observers: BTreeMap::new(),
        }
    }

    fn apply_operation(&mut self, op: &CacheOperation) {
        let cache = self.cache.clone();
        match op {
            CacheOperation::SetData { slot, value } => {
                self.runtime.block_on(cache.set_data(&key(*slot), Count(*value)));
            }
            CacheOperation::Update { slot, delta } => {
                self.runtime
                    .block_on(cache.update(&key(*slot), |c| c.0 += delta));
            }
            CacheOperation::FailingMutation { slot, delta } => {
                let mutation = Rejected {
                    slot: *slot,
                    delta: *delta,
                };
                let result = self
                    .runtime
                    .block_on(async { cache.mutate(&mutation, RetryPolicy::none()).await });
                assert!(result.is_err());
            }
            CacheOperation::InvalidateAll => {
                let _guard = self.runtime.enter();
                cache.invalidate(&query_key!["posts"]);
            }
            CacheOperation::Observe { slot } => {
                let observer = cache.observe(&key(*slot));
                self.observers.entry(*slot).or_default().push(observer);
            }
            CacheOperation::Unobserve { slot } => {
                if let Some(list) = self.observers.get_mut(slot) {
                    list.pop();
                }
            }
            CacheOperation::Advance { minutes } => {
                self.clock.advance(chrono::Duration::minutes(*minutes));
            }
            CacheOperation::Gc => {
                cache.gc();
            }
        }
    }
}

impl StateMachineTest for CacheTestHarness {
    type SystemUnderTest = Self;
    type Reference = CacheModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        // Invariant: the same set of entries exists
        assert_eq!(state.cache.len(), ref_state.entries.len());

        // Invariant: every entry holds exactly the modelled value, so failed
        // mutations never leak their speculative change
        for slot in 0u8..4 {
            let expected = ref_state.entries.get(&slot).and_then(|e| e.value).map(Count);
            assert_eq!(state.cache.get_data(&key(slot)), expected, "slot {slot}");
        }
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn query_cache_state_machine_test(sequential 1..40 => CacheTestHarness);
}
