use crate::timeouts::TICKER_SHUTDOWN_GRACE;
use log::{debug, info};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Handle to a running ticker thread. Dropping it stops and joins the thread.
pub struct QuotaTickerHandle {
    shutdown: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    join: Option<thread::JoinHandle<()>>,
}

impl QuotaTickerHandle {
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }

    /// Completed ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for QuotaTickerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct QuotaTicker;

impl QuotaTicker {
    /// Runs `task` every `interval` on a dedicated thread until the handle is
    /// dropped or `task` returns `false`.
    pub fn spawn<F>(name: &str, interval: Duration, mut task: F) -> io::Result<QuotaTickerHandle>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        let shutdown_flag = shutdown.clone();
        let tick_count = ticks.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                info!("event=ticker_start name={} interval={:?}", thread_name, interval);
                loop {
                    let deadline = Instant::now() + interval;
                    while !shutdown_flag.load(Ordering::Relaxed) {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        thread::sleep((deadline - now).min(TICKER_SHUTDOWN_GRACE));
                    }
                    if shutdown_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    if !task() {
                        debug!("event=ticker_task_finished name={}", thread_name);
                        break;
                    }
                    tick_count.fetch_add(1, Ordering::SeqCst);
                }
                info!("event=ticker_stop name={}", thread_name);
            })?;
        Ok(QuotaTickerHandle {
            shutdown,
            ticks,
            join: Some(handle),
        })
    }
}
