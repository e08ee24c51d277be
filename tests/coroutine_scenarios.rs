//! End-to-end coroutine-scheduler scenarios from §8: coalesced awaits
//! (scenario 4) and quit-with-outstanding-coroutine (scenario 6).

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use ichor_kernel::coroutine::WaitOutcome;
use ichor_kernel::event::{Event, Priority};
use ichor_kernel::kernel::Kernel;
use ichor_kernel::lifecycle::DependencyCallbacks;
use ichor_kernel::service::PropertyMap;
use ichor_kernel::types::{Config, ServiceId, TypeTag};

struct ProbeEvent;
struct NeverFiresEvent;

/// Scenario 4: a service calls `push_prioritised_event_async(.., coalesce =
/// true)` twice before the first call's event completes. The second call
/// must not cause a second dispatch; both awaiters resolve off the one
/// dispatch that does happen.
#[tokio::test]
async fn coalesced_awaits_share_a_single_dispatch() {
    let kernel = Kernel::new();
    let w = kernel.create_advanced_service(0, PropertyMap::new(), vec![], vec![], DependencyCallbacks::default());
    kernel.start_service(w);
    kernel.run_until_idle().await;

    let dispatch_count = Rc::new(Cell::new(0u32));
    let dispatch_count_for_listener = dispatch_count.clone();
    let kernel_for_listener = kernel.clone();
    let _handle = kernel.register_event_handler(w, TypeTag::of::<ProbeEvent>(), move |event: Rc<Event>| {
        let dispatch_count = dispatch_count_for_listener.clone();
        let kernel = kernel_for_listener.clone();
        async move {
            dispatch_count.set(dispatch_count.get() + 1);
            kernel.resolve(event.id(), WaitOutcome::Completed);
        }
    });

    let first = kernel.push_prioritised_event_async(w, Priority::USER_DEFAULT, ProbeEvent, true);
    let second = kernel.push_prioritised_event_async(w, Priority::USER_DEFAULT, ProbeEvent, true);

    // Only one `ProbeEvent` should actually be queued: the second call
    // piggybacked on the first's in-flight event id instead of pushing.
    kernel.run_until_idle().await;
    assert_eq!(dispatch_count.get(), 1);

    let (outcome_first, outcome_second) = tokio::join!(first, second);
    assert!(matches!(outcome_first, WaitOutcome::Completed));
    assert!(matches!(outcome_second, WaitOutcome::Completed));
}

/// A non-coalesced pair of calls for the same origin/type, by contrast,
/// dispatches twice — coalescing is opt-in per call.
#[tokio::test]
async fn non_coalesced_awaits_each_get_their_own_dispatch() {
    let kernel = Kernel::new();
    let w = kernel.create_advanced_service(0, PropertyMap::new(), vec![], vec![], DependencyCallbacks::default());
    kernel.start_service(w);
    kernel.run_until_idle().await;

    let dispatch_count = Rc::new(Cell::new(0u32));
    let dispatch_count_for_listener = dispatch_count.clone();
    let kernel_for_listener = kernel.clone();
    let _handle = kernel.register_event_handler(w, TypeTag::of::<ProbeEvent>(), move |event: Rc<Event>| {
        let dispatch_count = dispatch_count_for_listener.clone();
        let kernel = kernel_for_listener.clone();
        async move {
            dispatch_count.set(dispatch_count.get() + 1);
            kernel.resolve(event.id(), WaitOutcome::Completed);
        }
    });

    let first = kernel.push_prioritised_event_async(w, Priority::USER_DEFAULT, ProbeEvent, false);
    let second = kernel.push_prioritised_event_async(w, Priority::USER_DEFAULT, ProbeEvent, false);
    kernel.run_until_idle().await;
    assert_eq!(dispatch_count.get(), 2);

    let (outcome_first, outcome_second) = tokio::join!(first, second);
    assert!(matches!(outcome_first, WaitOutcome::Completed));
    assert!(matches!(outcome_second, WaitOutcome::Completed));
}

/// Scenario 6: a coroutine awaiting an event that never fires is resumed
/// with `ServiceQuitting`'s `WaitOutcome::Quitting` once the kernel quits,
/// well within the configured `quit_timeout`, and `start()` returns.
#[tokio::test(flavor = "current_thread")]
async fn quit_resumes_outstanding_coroutine_with_quitting_outcome() {
    let mut config = Config::default();
    config.scheduler.quit_timeout = Duration::from_millis(50);
    let kernel = Kernel::with_config(config);

    // An ordinary active service, present so the quit path also exercises
    // `stop_all_remaining_services` alongside the outstanding coroutine.
    let service = kernel.create_advanced_service(0, PropertyMap::new(), vec![], vec![], DependencyCallbacks::default());
    kernel.start_service(service);
    kernel.run_until_idle().await;

    let outcome: Rc<RefCell<Option<WaitOutcome>>> = Rc::new(RefCell::new(None));
    let outcome_for_task = outcome.clone();
    let kernel_for_task = kernel.clone();
    // Scoped outside the registry so the service's own `StopServiceEvent`
    // during shutdown doesn't drop this frame before it can observe
    // `Quitting` — only a frame scoped to an uninstalling *service* is
    // dropped by `ContinuationTable::drop_scope` (§4.6).
    let scope = ServiceId::from_raw(999);
    kernel.spawn(scope, async move {
        let outcome = kernel_for_task
            .push_prioritised_event_async(scope, Priority::USER_DEFAULT, NeverFiresEvent, false)
            .await;
        *outcome_for_task.borrow_mut() = Some(outcome);
    });
    kernel.run_until_idle().await;
    assert!(outcome.borrow().is_none(), "coroutine should still be suspended, awaiting an event that never fires");

    kernel.quit();
    let began = Instant::now();
    kernel.clone().start(false).await;
    let elapsed = began.elapsed();

    assert!(elapsed < Duration::from_millis(500), "quit drain took {elapsed:?}, expected well under quit_timeout");
    assert!(matches!(*outcome.borrow(), Some(WaitOutcome::Quitting)));
}
