//! Paced key scans and the background scanner built on them.
//!
//! A scan is a lazy stream over the store directory. It yields to the
//! runtime after every key and sleeps between batches, so long scans
//! interleave with other I/O instead of monopolising a worker.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blockmesh_config::{log_store_debug, log_store_warn};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::field::display;

use crate::{parse_physical_key, KeyStream, Result, StoreError};

/// Minimum pause between two scanner passes, so an empty store does not spin.
const PASS_FLOOR: Duration = Duration::from_millis(1);

/// How a scan spaces out its work.
#[derive(Debug, Clone, Copy)]
pub struct ScanPacing {
    /// Pause after each batch
    pub interval: Duration,
    /// Keys per batch
    pub batch: usize,
}

struct ScanState {
    root: PathBuf,
    uid: Option<String>,
    pacing: ScanPacing,
    dir: Option<tokio::fs::ReadDir>,
    yielded: usize,
    done: bool,
}

pub(crate) fn scan_keys(root: PathBuf, uid: String, pacing: ScanPacing) -> KeyStream<'static> {
    scan_blocks(root, Some(uid), pacing)
        .map(|entry| entry.map(|(_, key)| key))
        .boxed()
}

/// Paced pass yielding `(uid, key)` for every block file, restricted to
/// one uid when `uid` is set.
pub(crate) fn scan_blocks(
    root: PathBuf,
    uid: Option<String>,
    pacing: ScanPacing,
) -> BoxStream<'static, Result<(String, String)>> {
    let state = ScanState {
        root,
        uid,
        pacing,
        dir: None,
        yielded: 0,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        if st.dir.is_none() {
            match tokio::fs::read_dir(&st.root).await {
                Ok(dir) => st.dir = Some(dir),
                Err(e) => {
                    st.done = true;
                    return Some((Err(StoreError::Io(e)), st));
                }
            }
        }

        loop {
            let dir = st.dir.as_mut()?;
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => return None,
                Err(e) => {
                    st.done = true;
                    return Some((Err(StoreError::Io(e)), st));
                }
            };

            let name = entry.file_name();
            let Some((uid, key)) = name.to_str().and_then(parse_physical_key) else {
                continue;
            };
            if st.uid.as_deref().is_some_and(|wanted| wanted != uid) {
                continue;
            }
            match entry.file_type().await {
                Ok(ft) if ft.is_file() => {}
                _ => continue,
            }
            let found = (uid.to_string(), key.to_string());

            st.yielded += 1;
            if st.yielded % st.pacing.batch == 0 && !st.pacing.interval.is_zero() {
                tokio::time::sleep(st.pacing.interval).await;
            } else {
                tokio::task::yield_now().await;
            }
            return Some((Ok(found), st));
        }
    })
    .boxed()
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation for scans. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Delivered to a background scanner's handler.
#[derive(Debug)]
pub enum ScanEvent {
    /// A key owned by the scanned uid
    Block { key: String },
    /// The pass failed; the scanner starts a new pass after the interval
    Error(StoreError),
    /// A pass finished after visiting `blocks` keys
    PassComplete { blocks: usize },
}

/// Owner of a running background scanner.
#[derive(Debug)]
pub struct ScannerHandle {
    stop: StopHandle,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    /// Ask the scanner to stop after the event it is handling.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the scanner task to exit.
    pub async fn join(self) -> Result<()> {
        self.task.await.map_err(std::io::Error::other)?;
        Ok(())
    }
}

/// Re-run `scan` pass after pass until stopped, feeding every event to
/// `handler`. The handler gets the stop handle so it can end the scan itself.
pub fn spawn_scanner<S, F>(scan: S, interval: Duration, mut handler: F) -> ScannerHandle
where
    S: Fn() -> KeyStream<'static> + Send + 'static,
    F: FnMut(ScanEvent, &StopHandle) + Send + 'static,
{
    let stop = StopHandle::new();
    let task_stop = stop.clone();
    let pause = interval.max(PASS_FLOOR);

    let task = tokio::spawn(async move {
        let stop = task_stop;
        let mut passes = 0u64;

        while !stop.is_stopped() {
            let mut keys = scan();
            let mut blocks = 0usize;

            loop {
                let next = tokio::select! {
                    _ = stop.stopped() => break,
                    item = keys.next() => item,
                };
                match next {
                    Some(Ok(key)) => {
                        blocks += 1;
                        handler(ScanEvent::Block { key }, &stop);
                    }
                    Some(Err(e)) => {
                        log_store_warn!("Scan pass failed", error = display(&e));
                        handler(ScanEvent::Error(e), &stop);
                        break;
                    }
                    None => {
                        passes += 1;
                        log_store_debug!("Scan pass complete", pass = passes, blocks = blocks);
                        handler(ScanEvent::PassComplete { blocks }, &stop);
                        break;
                    }
                }
                if stop.is_stopped() {
                    break;
                }
            }

            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    });

    ScannerHandle { stop, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn fast() -> ScanPacing {
        ScanPacing {
            interval: Duration::ZERO,
            batch: 2,
        }
    }

    #[tokio::test]
    async fn test_scan_yields_only_owned_keys() {
        let temp = TempDir::new().unwrap();
        for name in ["usera$01", "usera$02", "userb$03", ".id", "usera$zz", "usera"] {
            std::fs::write(temp.path().join(name), b"x").unwrap();
        }

        let mut keys: Vec<String> = scan_keys(temp.path().to_path_buf(), "usera".into(), fast())
            .map(|r| r.unwrap())
            .collect()
            .await;
        keys.sort();
        assert_eq!(keys, vec!["01", "02"]);
    }

    #[tokio::test]
    async fn test_unrestricted_scan_reports_owners() {
        let temp = TempDir::new().unwrap();
        for name in ["usera$01", "userb$02", "userb$03", ".id", "userc$zz", ".usera$04.1.0.tmp"] {
            std::fs::write(temp.path().join(name), b"x").unwrap();
        }

        let mut blocks: Vec<(String, String)> = scan_blocks(temp.path().to_path_buf(), None, fast())
            .map(|r| r.unwrap())
            .collect()
            .await;
        blocks.sort();
        assert_eq!(
            blocks,
            vec![
                ("usera".to_string(), "01".to_string()),
                ("userb".to_string(), "02".to_string()),
                ("userb".to_string(), "03".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_of_missing_directory_reports_error() {
        let temp = TempDir::new().unwrap();
        let results: Vec<_> = scan_keys(temp.path().join("gone"), "usera".into(), fast())
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_stop_handle_wakes_waiters() {
        let stop = StopHandle::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        tokio::task::yield_now().await;
        stop.stop();
        waiter.await.unwrap();
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn test_scanner_restarts_until_stopped() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("usera$0a"), b"x").unwrap();

        let root = temp.path().to_path_buf();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let handle = spawn_scanner(
            move || scan_keys(root.clone(), "usera".into(), fast()),
            Duration::ZERO,
            move |event, stop| {
                if let ScanEvent::PassComplete { blocks } = event {
                    let mut passes = sink.lock().unwrap();
                    passes.push(blocks);
                    if passes.len() == 3 {
                        stop.stop();
                    }
                }
            },
        );

        handle.join().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 1, 1]);
    }
}
