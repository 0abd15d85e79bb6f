//! Worker pool fed by one bounded channel, shut down through cancellation.

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use turbo_monitor::{BoundedChannel, CancelToken};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Work Queue Example\n");

    const NUM_WORKERS: usize = 4;
    const NUM_JOBS: usize = 20;

    let jobs = Arc::new(BoundedChannel::<String>::with_capacity(4));
    let results = Arc::new(BoundedChannel::<String>::with_capacity(NUM_JOBS));

    let jobs_tx = jobs.clone();
    let producer = thread::spawn(move || {
        for i in 0..NUM_JOBS {
            let job = format!("Job-{:02}", i);
            jobs_tx.put(job.clone()).unwrap();
            println!("📝 Enqueued: {}", job);
        }
        println!("✅ All jobs enqueued!");
    });

    let (token_tx, token_rx) = mpsc::channel();
    let mut workers = vec![];
    for worker_id in 0..NUM_WORKERS {
        let jobs_rx = jobs.clone();
        let results_tx = results.clone();
        let token_tx = token_tx.clone();

        workers.push(thread::spawn(move || {
            token_tx.send(CancelToken::current()).unwrap();
            let mut processed = 0;
            // take() fails once the collector cancels this worker
            while let Ok(job) = jobs_rx.take() {
                println!("🔨 Worker {} processing: {}", worker_id, job);
                thread::sleep(Duration::from_millis(50));
                results_tx
                    .put(format!("{} -> completed by worker {}", job, worker_id))
                    .unwrap();
                processed += 1;
            }
            println!("Worker {} finished ({} jobs)", worker_id, processed);
        }));
    }
    let worker_tokens: Vec<CancelToken> = token_rx.iter().take(NUM_WORKERS).collect();

    for _ in 0..NUM_JOBS {
        println!("✨ Result: {}", results.take().unwrap());
    }
    println!("✅ All results collected!");

    for token in &worker_tokens {
        token.cancel();
    }

    producer.join().unwrap();
    for worker in workers {
        worker.join().unwrap();
    }

    println!("\n🎉 Work queue example completed!");
}
