//! Event queue push/pop throughput benchmark.
//!
//! Measures `MultimapQueue::push` and the push-then-drain cycle under a
//! single priority band and under a spread of bands, since the binary heap's
//! comparator cost depends on how many distinct priorities are live at once.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ichor_kernel::event::{Event, Priority};
use ichor_kernel::queue::{EventQueue, MultimapQueue};
use ichor_kernel::types::{EventId, ServiceId};

const QUEUE_DEPTHS: &[usize] = &[16, 256, 4096];

fn bench_push_single_priority(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_single_priority");
    for &depth in QUEUE_DEPTHS {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let queue = MultimapQueue::new();
                for i in 0..depth {
                    queue.push(Event::new(
                        EventId::from_raw(0),
                        ServiceId::from_raw(1),
                        Priority::USER_DEFAULT,
                        black_box(i),
                    ));
                }
                black_box(&queue);
            });
        });
    }
    group.finish();
}

fn bench_push_mixed_priority(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_mixed_priority");
    for &depth in QUEUE_DEPTHS {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let queue = MultimapQueue::new();
                for i in 0..depth {
                    let priority = Priority::new((i % 16) as u64);
                    queue.push(Event::new(
                        EventId::from_raw(0),
                        ServiceId::from_raw(1),
                        priority,
                        black_box(i),
                    ));
                }
                black_box(&queue);
            });
        });
    }
    group.finish();
}

fn bench_push_then_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_then_drain");
    for &depth in QUEUE_DEPTHS {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let queue = MultimapQueue::new();
                for i in 0..depth {
                    let priority = Priority::new((i % 16) as u64);
                    queue.push(Event::new(EventId::from_raw(0), ServiceId::from_raw(1), priority, i));
                }
                while let Some(event) = queue.pop_highest_priority() {
                    black_box(event);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_push_single_priority, bench_push_mixed_priority, bench_push_then_drain);
criterion_main!(benches);
