//! Tokio runtime for connection I/O

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::{Builder, Runtime};

/// Multi-threaded runtime with `io_threads` workers (at least one)
pub fn build(io_threads: usize) -> io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(io_threads.max(1))
        .thread_name_fn(|| {
            static NEXT: AtomicUsize = AtomicUsize::new(0);
            format!("mqttgate-io-{}", NEXT.fetch_add(1, Ordering::Relaxed))
        })
        .enable_all()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_runs_tasks() {
        let rt = build(2).unwrap();
        let name = rt.block_on(async {
            tokio::spawn(async { std::thread::current().name().map(str::to_string) })
                .await
                .unwrap()
        });
        assert!(name.unwrap().starts_with("mqttgate-io-"));
    }

    #[test]
    fn test_zero_threads_is_one() {
        let rt = build(0).unwrap();
        assert_eq!(rt.block_on(async { 7 }), 7);
    }
}
