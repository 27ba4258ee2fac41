use crate::util::retry::RetryPolicy;
use log::warn;
use std::fs::File;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

const BLOCK_IO_MAX_ATTEMPTS: usize = 4;
const BLOCK_IO_BACKOFF: Duration = Duration::from_millis(10);
const BLOCK_IO_MAX_BACKOFF: Duration = Duration::from_millis(80);
const BLOCK_IO_JITTER: f64 = 0.2;
const BLOCK_IO_RETRY_BUDGET: Duration = Duration::from_millis(500);

pub fn block_io_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential(BLOCK_IO_MAX_ATTEMPTS, BLOCK_IO_BACKOFF)
        .with_max_delay(BLOCK_IO_MAX_BACKOFF)
        .with_jitter(BLOCK_IO_JITTER)
        .with_time_budget(Some(BLOCK_IO_RETRY_BUDGET))
}

/// Runs `op`, retrying transient failures with jittered exponential backoff.
pub fn retry_io<T, F>(mut op: F, label: &str, path: &Path) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let policy = block_io_retry_policy();
    let mut retry = policy.handle();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if should_retry(&err) => match retry.next_delay() {
                Some(delay) => {
                    warn!(
                        "event=block_io_retry op={} path={} attempt={} error={}",
                        label,
                        path.display(),
                        retry.attempts(),
                        err
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

fn should_retry(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

pub fn write_all_at(file: &File, payload: &[u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        file.write_all_at(payload, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(payload)
    }
}

pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        file.read_exact_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}
