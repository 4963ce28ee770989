use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tuplex_pool::{current_worker, Job, PoolError, ThreadPool, WorkerPool};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn runs_every_submitted_job() {
    init_logging();
    let pool = ThreadPool::new(4).unwrap();
    let (tx, rx) = mpsc::channel();
    for i in 0..1000usize {
        let tx = tx.clone();
        pool.run(Job::new(move || tx.send(i).unwrap()));
    }
    drop(tx);

    let mut seen: Vec<usize> = rx.iter().take(1000).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    pool.shutdown();
}

#[test]
fn jobs_can_submit_more_jobs() {
    init_logging();
    let pool = Arc::new(ThreadPool::new(2).unwrap());
    let count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    fn fan_out(pool: Arc<ThreadPool>, count: Arc<AtomicUsize>, depth: u32, tx: mpsc::Sender<()>) {
        count.fetch_add(1, Ordering::SeqCst);
        if depth == 0 {
            tx.send(()).unwrap();
            return;
        }
        for _ in 0..2 {
            let (p, c, t) = (pool.clone(), count.clone(), tx.clone());
            pool.run(Job::new(move || fan_out(p, c, depth - 1, t)));
        }
    }

    let (p, c) = (pool.clone(), count.clone());
    pool.run(Job::new(move || fan_out(p, c, 6, tx)));

    // 2^6 leaves
    for _ in 0..64 {
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }
    assert_eq!(count.load(Ordering::SeqCst), 127);
    pool.shutdown();
}

#[test]
fn affinity_pins_job_to_worker() {
    init_logging();
    let pool = ThreadPool::new(3).unwrap();
    let (tx, rx) = mpsc::channel();
    for _ in 0..20 {
        let tx = tx.clone();
        pool.run(Job::new(move || tx.send(current_worker()).unwrap()).with_affinity(Some(2)));
    }
    for _ in 0..20 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), Some(2));
    }
    pool.shutdown();
}

#[test]
fn zero_threads_is_rejected() {
    assert!(matches!(ThreadPool::new(0), Err(PoolError::NoWorkers)));
}

#[test]
fn submissions_after_shutdown_are_dropped() {
    init_logging();
    let pool = ThreadPool::new(1).unwrap();
    pool.shutdown();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    pool.run(Job::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
    }));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(current_worker(), None);
}
