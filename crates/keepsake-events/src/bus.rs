//! Copy-on-write subscription store and dispatcher.
//!
//! Subscriptions live in an immutable [`Snapshot`] published through an
//! [`ArcSwap`]. Writers (subscribe, unsubscribe) clone the current array,
//! modify the clone, and publish it with `rcu`. Readers take the current
//! snapshot and iterate it; dispatch never locks and never writes shared
//! state.
//!
//! Each snapshot memoizes a `(kind, phase)` index the first time it is
//! dispatched against. Publishing a new snapshot drops the old index with it.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use keepsake_types::validate_attribute_name;
use tracing::{error, warn};

use crate::error::{BusError, HookError};
use crate::hook::{EventContext, EventKind, HookPhase, HookSignal};

/// Subscriber callback.
type Callback = dyn Fn(&EventContext) -> Result<HookSignal, HookError> + Send + Sync;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    phase: HookPhase,
    priority: i32,
    owner: String,
    callback: Arc<Callback>,
}

type Index = HashMap<(EventKind, HookPhase), Vec<Arc<Subscription>>>;

/// Immutable published state. Subscriptions are kept sorted by
/// `(priority, id)`, which is the dispatch order.
struct Snapshot {
    subscriptions: Vec<Arc<Subscription>>,
    index: OnceLock<Index>,
}

impl Snapshot {
    const fn new(subscriptions: Vec<Arc<Subscription>>) -> Self {
        Self {
            subscriptions,
            index: OnceLock::new(),
        }
    }

    fn matching(&self, kind: &EventKind, phase: HookPhase) -> &[Arc<Subscription>] {
        let index = self.index.get_or_init(|| {
            let mut index = Index::new();
            for sub in &self.subscriptions {
                index
                    .entry((sub.kind.clone(), sub.phase))
                    .or_default()
                    .push(Arc::clone(sub));
            }
            index
        });
        index
            .get(&(kind.clone(), phase))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Result of one phase of dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Whether the guarded action may run. Always `true` for the post phase.
    pub proceed: bool,
    /// Some subscriber returned [`HookSignal::Changed`].
    pub changed: bool,
    /// Some subscriber returned [`HookSignal::Stop`].
    pub stopped: bool,
    /// A subscriber failed while fail-fast dispatch was enabled.
    pub failed: bool,
    /// Number of subscribers invoked.
    pub invoked: usize,
}

impl Default for DispatchOutcome {
    fn default() -> Self {
        Self {
            proceed: true,
            changed: false,
            stopped: false,
            failed: false,
            invoked: 0,
        }
    }
}

/// Lock-free publish/subscribe bus with pre and post hook phases.
pub struct EventBus {
    snapshot: ArcSwap<Snapshot>,
    /// Registered custom event names, mapped to their owner.
    events: ArcSwap<HashMap<String, String>>,
    next_id: AtomicU64,
    fail_fast: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.len())
            .field("events", &self.events.load().len())
            .field("fail_fast", &self.fail_fast.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus with fail-fast disabled.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new(Vec::new())),
            events: ArcSwap::from_pointee(HashMap::new()),
            next_id: AtomicU64::new(1),
            fail_fast: AtomicBool::new(false),
        }
    }

    /// Create a bus with the given fail-fast setting.
    pub fn with_fail_fast(fail_fast: bool) -> Self {
        let bus = Self::new();
        bus.set_fail_fast(fail_fast);
        bus
    }

    /// Toggle fail-fast dispatch. When enabled, a failing subscriber halts
    /// dispatch and suppresses the guarded action instead of being skipped.
    pub fn set_fail_fast(&self, fail_fast: bool) {
        self.fail_fast.store(fail_fast, Ordering::Relaxed);
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.snapshot.load().subscriptions.len()
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Named events
    // =========================================================================

    /// Register a custom event name for `owner`.
    ///
    /// Registering the same name again for the same owner is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidName`] if the name violates the naming
    /// grammar, or [`BusError::DuplicateEvent`] if another owner holds it.
    pub fn register_event(&self, name: &str, owner: &str) -> Result<(), BusError> {
        validate_attribute_name(name)?;
        let mut outcome = Ok(());
        self.events.rcu(|current| {
            outcome = Ok(());
            let mut next = HashMap::clone(current);
            match next.get(name) {
                Some(existing) if existing != owner => {
                    outcome = Err(BusError::DuplicateEvent {
                        name: name.to_owned(),
                        owner: existing.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    next.insert(name.to_owned(), owner.to_owned());
                }
            }
            next
        });
        outcome
    }

    /// Remove a custom event and every subscription to it.
    ///
    /// Returns `false` if the name was not registered.
    pub fn unregister_event(&self, name: &str) -> bool {
        let previous = self.events.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(name);
            next
        });
        if !previous.contains_key(name) {
            return false;
        }
        self.retain(|sub| !matches!(&sub.kind, EventKind::Custom(n) if &**n == name));
        true
    }

    /// Whether a custom event name is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.events.load().contains_key(name)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe with the default priority (0).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownEvent`] for an unregistered custom kind.
    pub fn subscribe<F>(
        &self,
        kind: EventKind,
        phase: HookPhase,
        owner: &str,
        callback: F,
    ) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&EventContext) -> Result<HookSignal, HookError> + Send + Sync + 'static,
    {
        self.subscribe_with_priority(kind, phase, 0, owner, callback)
    }

    /// Subscribe with an explicit priority. Lower priorities run first;
    /// equal priorities run in subscription order.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownEvent`] for an unregistered custom kind.
    pub fn subscribe_with_priority<F>(
        &self,
        kind: EventKind,
        phase: HookPhase,
        priority: i32,
        owner: &str,
        callback: F,
    ) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&EventContext) -> Result<HookSignal, HookError> + Send + Sync + 'static,
    {
        if let EventKind::Custom(name) = &kind {
            if !self.is_registered(name) {
                return Err(BusError::UnknownEvent(name.to_string()));
            }
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            kind,
            phase,
            priority,
            owner: owner.to_owned(),
            callback: Arc::new(callback),
        });

        self.snapshot.rcu(|current| {
            let mut next = current.subscriptions.clone();
            let at = next.partition_point(|s| (s.priority, s.id) <= (priority, id));
            next.insert(at, Arc::clone(&subscription));
            Snapshot::new(next)
        });
        Ok(id)
    }

    /// Remove one subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.retain(|sub| sub.id != id) > 0
    }

    /// Remove every subscription made by `owner`. Returns how many were removed.
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        self.retain(|sub| sub.owner != owner)
    }

    /// Keep only subscriptions matching `keep`; returns the number removed.
    fn retain(&self, keep: impl Fn(&Subscription) -> bool) -> usize {
        let previous = self.snapshot.rcu(|current| {
            Snapshot::new(
                current
                    .subscriptions
                    .iter()
                    .filter(|s| keep(s))
                    .cloned()
                    .collect(),
            )
        });
        let remaining = previous.subscriptions.iter().filter(|s| keep(s)).count();
        previous.subscriptions.len().saturating_sub(remaining)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run every subscriber for `(ctx.kind, phase)` in order.
    pub fn dispatch(&self, phase: HookPhase, ctx: &EventContext) -> DispatchOutcome {
        let snapshot = self.snapshot.load_full();
        let fail_fast = self.fail_fast.load(Ordering::Relaxed);
        let mut outcome = DispatchOutcome::default();

        for sub in snapshot.matching(&ctx.kind, phase) {
            outcome.invoked = outcome.invoked.saturating_add(1);
            let signal = match catch_unwind(AssertUnwindSafe(|| (sub.callback)(ctx))) {
                Ok(Ok(signal)) => signal,
                Ok(Err(err)) => {
                    warn!(
                        event = %ctx.kind,
                        ?phase,
                        owner = sub.owner.as_str(),
                        error = %err,
                        "Event subscriber failed"
                    );
                    if fail_fast {
                        outcome.failed = true;
                        HookSignal::Stop
                    } else {
                        HookSignal::Continue
                    }
                }
                Err(_) => {
                    error!(
                        event = %ctx.kind,
                        ?phase,
                        owner = sub.owner.as_str(),
                        "Event subscriber panicked"
                    );
                    if fail_fast {
                        outcome.failed = true;
                        HookSignal::Stop
                    } else {
                        HookSignal::Continue
                    }
                }
            };

            match signal {
                HookSignal::Continue => {}
                HookSignal::Changed => outcome.changed = true,
                HookSignal::Handled => {
                    if phase == HookPhase::Pre {
                        outcome.proceed = false;
                    }
                }
                HookSignal::Stop => {
                    outcome.stopped = true;
                    if phase == HookPhase::Pre {
                        outcome.proceed = false;
                    }
                    break;
                }
            }
        }

        outcome
    }

    /// Dispatch the pre phase.
    pub fn pre(&self, ctx: &EventContext) -> DispatchOutcome {
        self.dispatch(HookPhase::Pre, ctx)
    }

    /// Dispatch the post phase.
    pub fn post(&self, ctx: &EventContext) -> DispatchOutcome {
        self.dispatch(HookPhase::Post, ctx)
    }

    /// Run `action` guarded by the pre phase, then notify the post phase.
    ///
    /// Returns `None` when a pre subscriber suppressed the action; post
    /// subscribers do not run in that case.
    pub fn run_guarded<R>(&self, ctx: &EventContext, action: impl FnOnce() -> R) -> Option<R> {
        if !self.pre(ctx).proceed {
            return None;
        }
        let result = action();
        self.post(ctx);
        Some(result)
    }

    /// Trigger a registered custom event: pre phase, then post phase unless
    /// the pre phase suppressed it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownEvent`] if `ctx.kind` is not a registered
    /// custom event. Nothing is dispatched in that case.
    pub fn trigger(&self, ctx: &EventContext) -> Result<DispatchOutcome, BusError> {
        match &ctx.kind {
            EventKind::Custom(name) if self.is_registered(name) => {}
            other => return Err(BusError::UnknownEvent(other.name().to_owned())),
        }
        let pre = self.pre(ctx);
        if pre.proceed {
            let post = self.post(ctx);
            return Ok(DispatchOutcome {
                changed: pre.changed || post.changed,
                invoked: pre.invoked.saturating_add(post.invoked),
                ..pre
            });
        }
        Ok(pre)
    }
}
