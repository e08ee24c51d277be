//! Scenario 5 from §8 is stated in terms of an HTTP host's route handler:
//! it calls `push_prioritised_event_async(RunFunctionEventAsync)`, awaits,
//! and then replies, and two pipelined requests must not deadlock and must
//! reply in the right order. §1 puts an HTTP host out of scope for this
//! crate, so this file exercises the same reentrancy/ordering property with
//! two in-process services standing in for "route handler" and "backend":
//! a `RunFunctionEventAsync` plays the handler, reentrantly pushes a request
//! to the backend service, awaits the reply, and records it — all without
//! ever leaving the kernel's own thread.

use std::cell::RefCell;
use std::rc::Rc;

use ichor_kernel::coroutine::WaitOutcome;
use ichor_kernel::event::builtin::RunFunctionEventAsync;
use ichor_kernel::event::{Event, Priority};
use ichor_kernel::kernel::Kernel;
use ichor_kernel::lifecycle::DependencyCallbacks;
use ichor_kernel::service::PropertyMap;
use ichor_kernel::types::{ServiceId, TypeTag};

struct WorkRequest(u32);

/// Two pipelined "requests", each a `RunFunctionEventAsync` that reentrantly
/// awaits a reply from a backend service before recording its own
/// completion, must both complete — in submission order — without either
/// one blocking the other out of the event loop.
#[tokio::test]
async fn pipelined_handlers_reenter_the_kernel_without_deadlock() {
    let kernel = Kernel::new();
    let backend =
        kernel.create_advanced_service(0, PropertyMap::new(), vec![], vec![], DependencyCallbacks::default());
    kernel.start_service(backend);
    kernel.run_until_idle().await;

    // The backend "replies" by resolving the request's waiter — standing in
    // for a service that itself awaited some I/O before getting here.
    let kernel_for_backend = kernel.clone();
    let _handle =
        kernel.register_event_handler(backend, TypeTag::of::<WorkRequest>(), move |event: Rc<Event>| {
            let kernel = kernel_for_backend.clone();
            async move {
                kernel.resolve(event.id(), WaitOutcome::Completed);
            }
        });

    let replies: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let caller = ServiceId::from_raw(0);

    for request_id in [1u32, 2u32] {
        let replies = replies.clone();
        kernel.push_event(
            caller,
            RunFunctionEventAsync::new(move |kernel: &Kernel| {
                let kernel = kernel.clone();
                let replies = replies.clone();
                async move {
                    let outcome = kernel
                        .push_prioritised_event_async(backend, Priority::USER_DEFAULT, WorkRequest(request_id), false)
                        .await;
                    assert!(matches!(outcome, WaitOutcome::Completed));
                    replies.borrow_mut().push(request_id);
                }
            }),
        );
    }

    kernel.run_until_idle().await;

    assert_eq!(replies.borrow().as_slice(), &[1, 2], "replies must arrive in submission order");
}
