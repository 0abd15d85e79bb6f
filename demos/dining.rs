//! Dining philosophers: every philosopher reaches for the left fork first,
//! which deadlocks with blocking locks. Back-off acquisition always finishes.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use turbo_monitor::{Backoff, BackoffLockCoordinator};

const PHILOSOPHERS: usize = 5;
const MEALS: usize = 100;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Dining Philosophers Example\n");

    let forks: Arc<Vec<Mutex<usize>>> =
        Arc::new((0..PHILOSOPHERS).map(|_| Mutex::new(0)).collect());

    let diners: Vec<_> = (0..PHILOSOPHERS)
        .map(|seat| {
            let forks = forks.clone();
            thread::spawn(move || {
                let coordinator = BackoffLockCoordinator::new(Backoff::Exponential {
                    base: Duration::from_micros(20),
                    max: Duration::from_millis(2),
                });
                let left = &forks[seat];
                let right = &forks[(seat + 1) % PHILOSOPHERS];
                for _ in 0..MEALS {
                    let mut held = coordinator.acquire(&[left, right]).unwrap();
                    *held[0] += 1;
                    *held[1] += 1;
                    thread::sleep(Duration::from_micros(50));
                }
                println!("🍝 Philosopher {} ate {} meals", seat, MEALS);
            })
        })
        .collect();

    for diner in diners {
        diner.join().unwrap();
    }

    let uses: usize = forks.iter().map(|fork| *fork.lock()).sum();
    assert_eq!(uses, 2 * PHILOSOPHERS * MEALS);
    println!("\n🎉 Every fork was used {} times in total, no deadlock!", uses);
}
