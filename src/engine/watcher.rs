//! Debounced file watcher feeding the indexing pipeline.
//!
//! Bridges notify's sync callbacks into the async engine: events land on a
//! channel, accumulate in a pending-change queue keyed by path, and are
//! flushed as one batch once a path has been quiet for the debounce
//! window. The watcher never touches the index itself — it only emits
//! batches into an mpsc channel the engine drains, which keeps the
//! watcher/orchestrator relationship one-directional.
//!
//! # Coalescing
//!
//! Later events for a path supersede earlier ones, with two refinements:
//! an add followed by a delete cancels outright (the pipeline never hears
//! about the file), and an add followed by an update stays an add — the
//! pipeline reads the latest content either way.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  time::{Duration, Instant},
};

use ignore::gitignore::Gitignore;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::{ChangeKind, FileChange};

/// A change waiting out the debounce window.
#[derive(Debug)]
struct PendingChange {
  kind: ChangeKind,
  last_event: Instant,
}

/// Combine an existing pending kind with a newly observed one.
///
/// `None` means the entry cancels out entirely.
fn coalesce(old: ChangeKind, new: ChangeKind) -> Option<ChangeKind> {
  match (old, new) {
    // The pipeline reads latest content for adds, so add+update stays add.
    (ChangeKind::Added, ChangeKind::Updated) => Some(ChangeKind::Added),
    // Never existed as far as the index is concerned.
    (ChangeKind::Added, ChangeKind::Deleted) => None,
    // Deleted then recreated is a content change.
    (ChangeKind::Deleted, ChangeKind::Added) => Some(ChangeKind::Updated),
    // Otherwise the last event wins.
    (_, new) => Some(new),
  }
}

// ============================================================================
// WatcherTask
// ============================================================================

/// Long-running task that owns the notify watcher and the pending queue.
pub(crate) struct WatcherTask {
  root: PathBuf,
  debounce: Duration,
  matcher: Gitignore,
  batch_tx: mpsc::Sender<Vec<FileChange>>,
  cancel: CancellationToken,
  // Held to keep the notify watcher alive.
  _watcher: RecommendedWatcher,
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
}

impl WatcherTask {
  /// Start watching `root` and spawn the task.
  pub(crate) fn spawn(
    root: PathBuf,
    debounce: Duration,
    matcher: Gitignore,
    batch_tx: mpsc::Sender<Vec<FileChange>>,
    cancel: CancellationToken,
  ) -> Result<tokio::task::JoinHandle<()>, notify::Error> {
    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);

    let mut watcher = RecommendedWatcher::new(
      move |res| {
        // Runs on notify's thread; drop events if the engine is gone.
        let _ = event_tx.blocking_send(res);
      },
      NotifyConfig::default(),
    )?;
    watcher.watch(&root, RecursiveMode::Recursive)?;

    info!(root = %root.display(), debounce_ms = debounce.as_millis(), "File watcher started");

    let task = Self {
      root,
      debounce,
      matcher,
      batch_tx,
      cancel,
      _watcher: watcher,
      event_rx,
    };
    Ok(tokio::spawn(task.run()))
  }

  async fn run(mut self) {
    let mut pending: HashMap<String, PendingChange> = HashMap::new();
    // Tick faster than the debounce so flushes land close to the window edge.
    let tick = (self.debounce / 2).max(Duration::from_millis(50));
    let mut interval = tokio::time::interval(tick);

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!("File watcher shutting down (cancelled)");
          break;
        }

        event = self.event_rx.recv() => {
          match event {
            Some(Ok(event)) => self.process_event(&mut pending, event),
            Some(Err(e)) => warn!(error = %e, "Watcher error"),
            None => {
              info!("File watcher shutting down (channel closed)");
              break;
            }
          }
        }

        _ = interval.tick() => {
          self.flush_settled(&mut pending).await;
        }
      }
    }

    // Hand over whatever is still pending before stopping.
    if !pending.is_empty() {
      let batch = drain(&mut pending);
      let _ = self.batch_tx.send(batch).await;
    }
  }

  /// Fold one notify event into the pending queue.
  fn process_event(&self, pending: &mut HashMap<String, PendingChange>, event: Event) {
    let kinds: Vec<(usize, ChangeKind)> = match event.kind {
      EventKind::Create(_) => vec![(0, ChangeKind::Added)],
      EventKind::Remove(_) => vec![(0, ChangeKind::Deleted)],
      EventKind::Modify(notify::event::ModifyKind::Name(mode)) => {
        use notify::event::RenameMode;
        match mode {
          RenameMode::From => vec![(0, ChangeKind::Deleted)],
          RenameMode::To => vec![(0, ChangeKind::Added)],
          // Both: paths[0] is the old name, paths[1] the new one.
          RenameMode::Both if event.paths.len() >= 2 => {
            vec![(0, ChangeKind::Deleted), (1, ChangeKind::Added)]
          }
          _ => vec![(0, ChangeKind::Updated)],
        }
      }
      EventKind::Modify(_) => vec![(0, ChangeKind::Updated)],
      EventKind::Access(_) | EventKind::Any | EventKind::Other => return,
    };

    for (path_idx, kind) in kinds {
      let Some(path) = event.paths.get(path_idx) else {
        continue;
      };
      let Some(relative) = self.eligible_relative(path) else {
        continue;
      };
      trace!(path = %relative, kind = ?kind, "Watch event");

      match pending.remove(&relative) {
        Some(existing) => {
          if let Some(folded) = coalesce(existing.kind, kind) {
            pending.insert(
              relative,
              PendingChange {
                kind: folded,
                last_event: Instant::now(),
              },
            );
          }
          // Cancelled out: entry stays removed.
        }
        None => {
          pending.insert(
            relative,
            PendingChange {
              kind,
              last_event: Instant::now(),
            },
          );
        }
      }
    }
  }

  /// Map an absolute event path to an eligible relative path.
  fn eligible_relative(&self, path: &Path) -> Option<String> {
    // Directory events are never indexed; for deletes the path is gone, so
    // is_dir is false and they pass through.
    if path.is_dir() {
      return None;
    }
    if self.matcher.matched(path, false).is_ignore() {
      trace!(path = %path.display(), "Ignoring watched path");
      return None;
    }
    let relative = path.strip_prefix(&self.root).ok()?;
    let relative = relative.to_string_lossy().replace('\\', "/");
    // Events inside the index directory would re-trigger indexing forever.
    if relative.starts_with(".codebase-search") {
      return None;
    }
    Some(relative)
  }

  /// Flush entries whose debounce window has elapsed as one batch.
  async fn flush_settled(&self, pending: &mut HashMap<String, PendingChange>) {
    if pending.is_empty() {
      return;
    }
    let now = Instant::now();
    // A single still-hot path keeps the whole batch back so one burst of
    // events becomes one pipeline run.
    let all_settled = pending.values().all(|p| now.duration_since(p.last_event) >= self.debounce);
    if !all_settled {
      return;
    }

    let batch = drain(pending);
    debug!(changes = batch.len(), "Flushing debounced changes");
    if self.batch_tx.send(batch).await.is_err() {
      debug!("Engine dropped the batch channel");
    }
  }
}

fn drain(pending: &mut HashMap<String, PendingChange>) -> Vec<FileChange> {
  let mut batch: Vec<FileChange> = pending
    .drain()
    .map(|(path, change)| FileChange {
      kind: change.kind,
      path,
    })
    .collect();
  batch.sort_by(|a, b| a.path.cmp(&b.path));
  batch
}
