use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, warn};

/// Something that can be hot-reloaded from files in a directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;

    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Background tasks watching one directory. Dropping it, or calling
/// `shutdown`, stops both the poller and the dispatcher.
pub struct DirectoryWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Starts watching `dir`. With `initial_scan`, every relevant file already
    /// present is loaded first; with `enable_retry`, failed loads are retried a
    /// few times (files are often still being written when first seen).
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        initial_scan: bool,
        enable_retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.is_dir() {
            let msg = format!("Directory {} does not exist", dir.display());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watched.is_relevant(&path) {
                    try_reload(&watched, &path, enable_retry).await;
                }
            }
        }

        let (tx, rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        let mut poller = PollWatcher::new(
            move |res| {
                // nobody listening any more
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        poller.watch(&dir, RecursiveMode::NonRecursive)?;

        // the poller stops when dropped, so park it in a task we can abort
        let handle_watcher = tokio::spawn(async move {
            let _poller = poller;
            futures::future::pending::<()>().await;
        });
        let handle_dispatch = tokio::spawn(dispatch(rx, watched, enable_retry));

        Ok(DirectoryWatcher {
            handles: vec![handle_watcher, handle_dispatch],
        })
    }

    pub fn shutdown(mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn dispatch(
    mut rx: UnboundedReceiver<notify::Result<Event>>,
    watched: Arc<dyn WatchedType>,
    enable_retry: bool,
) {
    while let Some(res) = rx.recv().await {
        match res {
            Ok(Event {
                kind: EventKind::Create(_) | EventKind::Modify(_),
                paths,
                ..
            }) => {
                for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                    try_reload(&watched, &path, enable_retry).await;
                }
            }
            Ok(Event {
                kind: EventKind::Remove(_),
                paths,
                ..
            }) => {
                for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                    if let Err(e) = watched.on_remove(&path).await {
                        warn!(?path, ?e, "Failed to handle removal");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(?e, "Watcher error"),
        }
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
