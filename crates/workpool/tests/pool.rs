use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use workpool::{Unmarshal, UnmarshalPool};

#[derive(Debug)]
struct Never;

impl fmt::Display for Never {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("never")
    }
}

impl std::error::Error for Never {}

/// Records which item ran and how often.
struct Tracked {
    id: usize,
    seen: Arc<Mutex<Vec<usize>>>,
    delay: Duration,
}

impl Unmarshal for Tracked {
    type Error = Never;

    fn unmarshal(&mut self) -> Result<(), Never> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.seen.lock().unwrap().push(self.id);
        Ok(())
    }
}

struct Gate {
    release: mpsc::Receiver<()>,
    started: Arc<AtomicUsize>,
}

impl Unmarshal for Gate {
    type Error = Never;

    fn unmarshal(&mut self) -> Result<(), Never> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _ = self.release.recv();
        Ok(())
    }
}

#[test]
fn test_every_item_runs_exactly_once_before_stop_returns() {
    const ITEMS: usize = 500;
    const WORKERS: usize = 4;

    let mut pool = UnmarshalPool::start(WORKERS).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    // Handles are intentionally dropped: stop() alone must drain the queue.
    for id in 0..ITEMS {
        let _ = pool
            .schedule(Tracked {
                id,
                seen: Arc::clone(&seen),
                delay: Duration::ZERO,
            })
            .unwrap();
    }
    pool.stop();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), ITEMS);
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), ITEMS);
    assert_eq!(pool.metrics().completed(), ITEMS as u64);
}

#[test]
fn test_concurrent_producers_wait_on_their_own_items() {
    let pool = Arc::new(UnmarshalPool::start(3).unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..8)
        .map(|producer| {
            let pool = Arc::clone(&pool);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for seq in 0..50 {
                    let id = producer * 1_000 + seq;
                    let handle = pool
                        .schedule(Tracked {
                            id,
                            seen: Arc::clone(&seen),
                            delay: Duration::from_micros(50),
                        })
                        .unwrap();
                    handle.wait().unwrap();
                    // The item is complete as soon as wait() returns.
                    assert!(seen.lock().unwrap().contains(&id));
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(seen.lock().unwrap().len(), 400);
}

#[test]
fn test_schedule_blocks_when_workers_and_queue_are_full() {
    let pool = Arc::new(UnmarshalPool::start(1).unwrap());
    let started = Arc::new(AtomicUsize::new(0));
    let (release_running, rx_running) = mpsc::channel();
    let (release_queued, rx_queued) = mpsc::channel();

    let running = pool
        .schedule(Gate {
            release: rx_running,
            started: Arc::clone(&started),
        })
        .unwrap();
    while started.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    // Worker busy; this fills the only queue slot without blocking.
    let queued = pool
        .schedule(Gate {
            release: rx_queued,
            started: Arc::clone(&started),
        })
        .unwrap();

    let blocked_returned = Arc::new(AtomicBool::new(false));
    let producer = {
        let pool = Arc::clone(&pool);
        let started = Arc::clone(&started);
        let blocked_returned = Arc::clone(&blocked_returned);
        thread::spawn(move || {
            let (tx, rx) = mpsc::channel();
            drop(tx);
            let handle = pool.schedule(Gate { release: rx, started }).unwrap();
            blocked_returned.store(true, Ordering::SeqCst);
            handle.wait().unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(
        !blocked_returned.load(Ordering::SeqCst),
        "schedule returned while the queue was full"
    );

    release_running.send(()).unwrap();
    running.wait().unwrap();
    release_queued.send(()).unwrap();
    queued.wait().unwrap();
    producer.join().unwrap();
    assert!(blocked_returned.load(Ordering::SeqCst));
    assert_eq!(started.load(Ordering::SeqCst), 3);
}

#[test]
fn test_pools_are_isolated() {
    let mut first = UnmarshalPool::start(1).unwrap();
    let second = UnmarshalPool::start(2).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    first.stop();

    second
        .execute(Tracked {
            id: 7,
            seen: Arc::clone(&seen),
            delay: Duration::ZERO,
        })
        .unwrap();

    assert!(first.is_stopped());
    assert!(!second.is_stopped());
    assert_eq!(*seen.lock().unwrap(), vec![7]);
    assert_eq!(first.metrics().scheduled(), 0);
    assert_eq!(second.metrics().scheduled(), 1);
}
