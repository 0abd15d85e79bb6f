//! Simple usage example

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use turbo_monitor::BoundedChannel;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("turbo_monitor - Simple Example\n");

    // Two slots, so the producer regularly blocks on a full channel
    let channel = Arc::new(BoundedChannel::<String>::with_capacity(2));

    let producer_channel = channel.clone();
    let consumer_channel = channel.clone();

    let producer = thread::spawn(move || {
        for i in 0..10 {
            let message = format!("Message {}", i);
            println!("Sending: {}", message);
            producer_channel.put(message).unwrap();
        }
        println!("Producer finished!");
    });

    let consumer = thread::spawn(move || {
        for _ in 0..10 {
            let message = consumer_channel.take().unwrap();
            println!("Received: {}", message);
            // Slow consumer keeps the channel full
            thread::sleep(Duration::from_millis(100));
        }
        println!("Consumer finished!");
    });

    producer.join().unwrap();
    consumer.join().unwrap();

    println!("\nExample completed successfully!");
}
