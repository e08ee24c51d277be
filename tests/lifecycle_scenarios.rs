//! End-to-end lifecycle scenarios from §8, driven through the public
//! kernel surface with `Kernel::run_until_idle` as the deterministic
//! single-step primitive (no backgrounded scheduler loop to race against).

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use ichor_kernel::kernel::Kernel;
use ichor_kernel::lifecycle::DependencyCallbacks;
use ichor_kernel::service::{DependencyDeclaration, PropertyMap, ServiceState};
use ichor_kernel::types::TypeTag;

struct Clock;
struct Logger;
struct Db;

/// Scenario 1: a solo service with no dependencies starts and, on quit,
/// is driven all the way back down to `Installed`.
#[tokio::test]
async fn solo_service_starts_and_stops_on_quit() {
    let kernel = Kernel::new();
    let service = kernel.create_advanced_service(
        0,
        PropertyMap::new(),
        vec![],
        vec![],
        DependencyCallbacks::default(),
    );

    kernel.start_service(service);
    kernel.run_until_idle().await;
    assert_eq!(kernel.service_state(service), Some(ServiceState::Active));

    kernel.quit();
    kernel.run_until_idle().await;
    assert_eq!(kernel.service_state(service), Some(ServiceState::Installed));

    kernel.remove_service(service);
    kernel.run_until_idle().await;
    assert_eq!(kernel.service_state(service), None);
}

/// Scenario 2: a linear dependency chain `A -> B -> C`. Starting all three
/// (in declaration order, before any of them can possibly be ready) must
/// still converge on every service `Active`, and stopping the root of the
/// chain must cascade the stop through both dependants.
#[tokio::test]
async fn linear_dependency_chain_starts_leaf_first_and_stops_cascade() {
    let kernel = Kernel::new();
    let logger_tag = TypeTag::of::<Logger>();
    let db_tag = TypeTag::of::<Db>();

    let c = kernel.create_advanced_service(
        0,
        PropertyMap::new(),
        vec![],
        vec![(db_tag, Rc::new(Db) as Rc<dyn Any>)],
        DependencyCallbacks::default(),
    );
    let b = kernel.create_advanced_service(
        0,
        PropertyMap::new(),
        vec![DependencyDeclaration::required(db_tag)],
        vec![(logger_tag, Rc::new(Logger) as Rc<dyn Any>)],
        DependencyCallbacks::default(),
    );
    let a = kernel.create_advanced_service(
        0,
        PropertyMap::new(),
        vec![DependencyDeclaration::required(logger_tag)],
        vec![],
        DependencyCallbacks::default(),
    );

    // Start in declaration order (A, B, C) — the kernel must still resolve
    // this regardless of the order the caller happens to start them in,
    // since a `Starting` service re-probes once any other service goes
    // `Active` (§4.4).
    kernel.start_service(a);
    kernel.start_service(b);
    kernel.start_service(c);
    kernel.run_until_idle().await;

    assert_eq!(kernel.service_state(c), Some(ServiceState::Active));
    assert_eq!(kernel.service_state(b), Some(ServiceState::Active));
    assert_eq!(kernel.service_state(a), Some(ServiceState::Active));

    kernel.stop_service(c, None);
    kernel.run_until_idle().await;

    assert_eq!(kernel.service_state(c), Some(ServiceState::Installed));
    assert_eq!(kernel.service_state(b), Some(ServiceState::Installed));
    assert_eq!(kernel.service_state(a), Some(ServiceState::Installed));
}

/// Scenario 3: an optional dependency that isn't available at start time
/// does not block the consumer from becoming `Active`; once a provider
/// appears later, `add_dependency` fires and wires it in without disturbing
/// the consumer's state.
#[tokio::test]
async fn optional_dependency_wires_in_after_consumer_is_already_active() {
    let kernel = Kernel::new();
    let clock_tag = TypeTag::of::<Clock>();

    let added: Rc<RefCell<Vec<TypeTag>>> = Rc::new(RefCell::new(Vec::new()));
    let added_for_cb = added.clone();
    let callbacks = DependencyCallbacks {
        on_add: Some(Box::new(move |tag, _value| {
            added_for_cb.borrow_mut().push(tag);
            Ok(())
        })),
        on_remove: None,
    };

    let consumer = kernel.create_advanced_service(
        0,
        PropertyMap::new(),
        vec![DependencyDeclaration::optional(clock_tag)],
        vec![],
        callbacks,
    );
    kernel.start_service(consumer);
    kernel.run_until_idle().await;
    assert_eq!(kernel.service_state(consumer), Some(ServiceState::Active));
    assert!(added.borrow().is_empty());

    let provider = kernel.create_advanced_service(
        0,
        PropertyMap::new(),
        vec![],
        vec![(clock_tag, Rc::new(Clock) as Rc<dyn Any>)],
        DependencyCallbacks::default(),
    );
    kernel.start_service(provider);
    kernel.run_until_idle().await;

    assert_eq!(kernel.service_state(provider), Some(ServiceState::Active));
    assert_eq!(kernel.service_state(consumer), Some(ServiceState::Active));
    assert_eq!(added.borrow().as_slice(), &[clock_tag]);
}
