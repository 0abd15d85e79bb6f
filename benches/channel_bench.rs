use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use flume::bounded as flume_bounded;
use std::sync::mpsc::sync_channel;
use turbo_monitor::{acquire_all, Backoff, BackoffLockCoordinator, BoundedChannel};

const MESSAGES: usize = 100_000;
const BUFFER_SIZE: usize = 1024;

fn bench_1p_1c(c: &mut Criterion) {
    let mut group = c.benchmark_group("1p_1c");
    group.throughput(Throughput::Elements(MESSAGES as u64));

    group.bench_function("turbo_monitor", |b| {
        b.iter(|| {
            let channel = Arc::new(BoundedChannel::with_capacity(BUFFER_SIZE));
            let tx = channel.clone();
            let rx = channel.clone();

            let producer = thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.put(black_box(i)).unwrap();
                }
            });

            let consumer = thread::spawn(move || {
                for _ in 0..MESSAGES {
                    rx.take().unwrap();
                }
            });

            producer.join().unwrap();
            consumer.join().unwrap();
        });
    });

    group.bench_function("crossbeam_channel", |b| {
        b.iter(|| {
            let (tx, rx) = bounded::<usize>(BUFFER_SIZE);

            let producer = thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.send(black_box(i)).unwrap();
                }
            });

            let consumer = thread::spawn(move || {
                for _ in 0..MESSAGES {
                    rx.recv().unwrap();
                }
            });

            producer.join().unwrap();
            consumer.join().unwrap();
        });
    });

    group.bench_function("flume", |b| {
        b.iter(|| {
            let (tx, rx) = flume_bounded::<usize>(BUFFER_SIZE);

            let producer = thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.send(black_box(i)).unwrap();
                }
            });

            let consumer = thread::spawn(move || {
                for _ in 0..MESSAGES {
                    rx.recv().unwrap();
                }
            });

            producer.join().unwrap();
            consumer.join().unwrap();
        });
    });

    group.bench_function("std_mpsc", |b| {
        b.iter(|| {
            let (tx, rx) = sync_channel::<usize>(BUFFER_SIZE);

            let producer = thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.send(black_box(i)).unwrap();
                }
            });

            let consumer = thread::spawn(move || {
                for _ in 0..MESSAGES {
                    rx.recv().unwrap();
                }
            });

            producer.join().unwrap();
            consumer.join().unwrap();
        });
    });

    group.finish();
}

fn bench_np_mc(c: &mut Criterion) {
    let mut group = c.benchmark_group("4p_4c");
    group.throughput(Throughput::Elements(MESSAGES as u64));
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const MSGS_PER_PRODUCER: usize = MESSAGES / PRODUCERS;
    const MSGS_PER_CONSUMER: usize = MESSAGES / CONSUMERS;

    // Small buffer so both condition variables see traffic.
    for capacity in [1usize, 16, BUFFER_SIZE] {
        group.bench_function(format!("turbo_monitor/cap_{capacity}"), |b| {
            b.iter(|| {
                let channel = Arc::new(BoundedChannel::with_capacity(capacity));
                let mut handles = vec![];

                for p in 0..PRODUCERS {
                    let tx = channel.clone();
                    handles.push(thread::spawn(move || {
                        for i in 0..MSGS_PER_PRODUCER {
                            tx.put(black_box(p * MSGS_PER_PRODUCER + i)).unwrap();
                        }
                    }));
                }

                for _ in 0..CONSUMERS {
                    let rx = channel.clone();
                    handles.push(thread::spawn(move || {
                        for _ in 0..MSGS_PER_CONSUMER {
                            rx.take().unwrap();
                        }
                    }));
                }

                for h in handles {
                    h.join().unwrap();
                }
            });
        });

        group.bench_function(format!("crossbeam_channel/cap_{capacity}"), |b| {
            b.iter(|| {
                let (tx, rx) = bounded::<usize>(capacity);
                let mut handles = vec![];

                for p in 0..PRODUCERS {
                    let tx = tx.clone();
                    handles.push(thread::spawn(move || {
                        for i in 0..MSGS_PER_PRODUCER {
                            tx.send(black_box(p * MSGS_PER_PRODUCER + i)).unwrap();
                        }
                    }));
                }
                drop(tx);

                for _ in 0..CONSUMERS {
                    let rx = rx.clone();
                    handles.push(thread::spawn(move || {
                        for _ in 0..MSGS_PER_CONSUMER {
                            rx.recv().unwrap();
                        }
                    }));
                }

                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_opposite_lock_orders(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_pair");
    const ROUNDS: usize = 10_000;
    group.throughput(Throughput::Elements(2 * ROUNDS as u64));

    let policies = [
        ("fixed", Backoff::Fixed(Duration::from_micros(10))),
        (
            "exponential",
            Backoff::Exponential {
                base: Duration::from_micros(1),
                max: Duration::from_micros(100),
            },
        ),
    ];

    for (name, backoff) in policies {
        group.bench_function(name, |b| {
            b.iter(|| {
                let a = Arc::new(parking_lot::Mutex::new(0u64));
                let z = Arc::new(parking_lot::Mutex::new(0u64));
                let coordinator = BackoffLockCoordinator::new(backoff);

                let forward = {
                    let (a, z) = (a.clone(), z.clone());
                    thread::spawn(move || {
                        for _ in 0..ROUNDS {
                            let mut held = coordinator.acquire(&[&*a, &*z]).unwrap();
                            *held[0] += 1;
                        }
                    })
                };

                let backward = {
                    let (a, z) = (a.clone(), z.clone());
                    thread::spawn(move || {
                        for _ in 0..ROUNDS {
                            let mut held = acquire_all(&[&*z, &*a], None, Duration::ZERO).unwrap();
                            *held[1] += 1;
                        }
                    })
                };

                forward.join().unwrap();
                backward.join().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_1p_1c, bench_np_mc, bench_opposite_lock_orders);
criterion_main!(benches);
