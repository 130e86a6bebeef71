//! Watch mode: regenerate when the source image changes.
//!
//! Split in three layers so the decision logic stays testable without a
//! real filesystem watcher:
//!
//! - [`WatchReconciler`]: the state machine. Pure, no I/O. Maps file events
//!   to [`WatchAction`]s and guarantees at most one regeneration in flight;
//!   events arriving mid-run are coalesced into a single pending action
//!   (latest wins).
//! - [`WatchBackend`]: where events come from. [`NotifyBackend`] wraps a
//!   `notify` watcher (native or polling); tests use a recording fake.
//! - [`WatchSession`]: the loop. Debounces bursts, executes actions against
//!   a [`WatchTarget`], and re-attaches the backend when an editor replaces
//!   the file instead of writing it in place.
//!
//! ```text
//!            start                 add / change
//!   Idle ────────────▶ Watching ───────────────▶ Regenerating
//!                        ▲  │ unlink: clean          │
//!                        │  └─────────┘              │
//!                        └───────── run finished ────┘
//! ```

use notify::event::{EventKind, ModifyKind};
use notify::{Config, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("cannot watch {0}: only local files can be watched")]
    NotAFile(String),
    #[error("a watch session is already running")]
    AlreadyWatching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Watching,
    Regenerating,
}

/// A change to the watched source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Add,
    Change,
    Unlink,
    /// The path was renamed onto or away from; the file may have been
    /// replaced by a new inode.
    Rename,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    /// Run the full generation pipeline.
    Regenerate,
    /// Clear the destination.
    Clean,
    /// Detach and re-attach the backend, then re-check the source.
    Reattach,
}

/// How a backend recovers from the watched file being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStrategy {
    /// Detach and re-attach on every rename event.
    ReattachOnRename,
    /// The backend keeps working across replacements (polling).
    Never,
}

/// The watch state machine.
#[derive(Debug)]
pub struct WatchReconciler {
    state: WatchState,
    pending: Option<WatchAction>,
    rename_recovery: bool,
    strategy: ReconnectStrategy,
}

impl WatchReconciler {
    pub fn new(strategy: ReconnectStrategy) -> Self {
        Self {
            state: WatchState::Idle,
            pending: None,
            rename_recovery: false,
            strategy,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn pending(&self) -> Option<WatchAction> {
        self.pending
    }

    /// Whether a re-attach is underway after a rename.
    pub fn is_recovering(&self) -> bool {
        self.rename_recovery
    }

    /// Idle → Watching.
    pub fn start(&mut self) -> Result<(), WatchError> {
        if self.state != WatchState::Idle {
            return Err(WatchError::AlreadyWatching);
        }
        self.state = WatchState::Watching;
        Ok(())
    }

    /// Back to Idle, dropping anything pending.
    pub fn stop(&mut self) {
        self.state = WatchState::Idle;
        self.pending = None;
        self.rename_recovery = false;
    }

    /// Decide what to do about `event`.
    ///
    /// Returns the action to execute now, if any. While regenerating, only
    /// re-attaches run immediately; everything else is deferred.
    pub fn on_event(&mut self, event: WatchEvent) -> Option<WatchAction> {
        let event = match (event, self.strategy) {
            (WatchEvent::Rename, ReconnectStrategy::Never) => WatchEvent::Change,
            (event, _) => event,
        };

        match (self.state, event) {
            (WatchState::Idle, _) => None,
            (_, WatchEvent::Rename) => {
                self.rename_recovery = true;
                Some(WatchAction::Reattach)
            }
            (WatchState::Watching, WatchEvent::Add | WatchEvent::Change) => {
                self.state = WatchState::Regenerating;
                Some(WatchAction::Regenerate)
            }
            (WatchState::Watching, WatchEvent::Unlink) => Some(WatchAction::Clean),
            (WatchState::Regenerating, WatchEvent::Add | WatchEvent::Change) => {
                self.pending = Some(WatchAction::Regenerate);
                None
            }
            (WatchState::Regenerating, WatchEvent::Unlink) => {
                self.pending = Some(WatchAction::Clean);
                None
            }
        }
    }

    /// The backend has been re-attached.
    pub fn reattached(&mut self) {
        self.rename_recovery = false;
    }

    /// A regeneration finished, successfully or not.
    ///
    /// Returns the coalesced follow-up action, if events arrived meanwhile.
    pub fn finish_run(&mut self) -> Option<WatchAction> {
        if self.state != WatchState::Regenerating {
            return None;
        }
        self.state = WatchState::Watching;
        match self.pending.take() {
            Some(WatchAction::Regenerate) => {
                self.state = WatchState::Regenerating;
                Some(WatchAction::Regenerate)
            }
            other => other,
        }
    }
}

// =============================================================================
// Backends
// =============================================================================

/// Source of file events for one path.
pub trait WatchBackend {
    fn attach(&mut self, path: &Path) -> Result<(), WatchError>;
    fn detach(&mut self, path: &Path) -> Result<(), WatchError>;
    fn reconnect_strategy(&self) -> ReconnectStrategy;
}

/// Messages consumed by a [`WatchSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMessage {
    Fs(WatchEvent),
    Stop,
}

pub fn channel() -> (Sender<SessionMessage>, Receiver<SessionMessage>) {
    mpsc::channel()
}

/// Translate a `notify` event on a watched directory into an event on
/// `target`, if it concerns `target`.
pub fn translate(event: &notify::Event, target: &Path) -> Option<WatchEvent> {
    let file_name = target.file_name()?;
    if !event.paths.iter().any(|p| p.file_name() == Some(file_name)) {
        return None;
    }
    match event.kind {
        EventKind::Create(_) => Some(WatchEvent::Add),
        EventKind::Modify(ModifyKind::Name(_)) => Some(WatchEvent::Rename),
        EventKind::Modify(_) => Some(WatchEvent::Change),
        EventKind::Remove(_) => Some(WatchEvent::Unlink),
        _ => None,
    }
}

/// `notify`-based backend.
///
/// Watches the file's parent directory (non-recursively) and filters by
/// file name, so a replaced file is still seen after re-attach.
pub struct NotifyBackend {
    watcher: Box<dyn Watcher + Send>,
    strategy: ReconnectStrategy,
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

impl NotifyBackend {
    /// Native notifications, or polling every `poll` when given.
    pub fn new(
        target: &Path,
        tx: Sender<SessionMessage>,
        poll: Option<Duration>,
    ) -> Result<Self, WatchError> {
        let target = target.to_path_buf();
        let handler = move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if let Some(event) = translate(&event, &target) {
                    let _ = tx.send(SessionMessage::Fs(event));
                }
            }
            Err(err) => tracing::warn!("watch error: {err}"),
        };

        let (watcher, strategy): (Box<dyn Watcher + Send>, _) = match poll {
            Some(interval) => (
                Box::new(PollWatcher::new(
                    handler,
                    Config::default().with_poll_interval(interval),
                )?),
                ReconnectStrategy::Never,
            ),
            None => (
                Box::new(RecommendedWatcher::new(handler, Config::default())?),
                ReconnectStrategy::ReattachOnRename,
            ),
        };
        Ok(Self { watcher, strategy })
    }
}

impl WatchBackend for NotifyBackend {
    fn attach(&mut self, path: &Path) -> Result<(), WatchError> {
        self.watcher
            .watch(&watch_dir(path), RecursiveMode::NonRecursive)?;
        Ok(())
    }

    fn detach(&mut self, path: &Path) -> Result<(), WatchError> {
        self.watcher.unwatch(&watch_dir(path))?;
        Ok(())
    }

    fn reconnect_strategy(&self) -> ReconnectStrategy {
        self.strategy
    }
}

// =============================================================================
// Session
// =============================================================================

/// What a session drives.
pub trait WatchTarget {
    type Error: std::fmt::Display;

    fn regenerate(&mut self) -> Result<(), Self::Error>;
    fn clean(&mut self) -> Result<(), Self::Error>;
}

/// Binds one source path to a backend and a state machine.
pub struct WatchSession<B: WatchBackend> {
    source: PathBuf,
    backend: B,
    reconciler: WatchReconciler,
    rx: Receiver<SessionMessage>,
    debounce: Duration,
    stopping: bool,
}

impl<B: WatchBackend> WatchSession<B> {
    pub fn new(
        source: impl Into<PathBuf>,
        backend: B,
        rx: Receiver<SessionMessage>,
        debounce: Duration,
    ) -> Self {
        let strategy = backend.reconnect_strategy();
        Self {
            source: source.into(),
            backend,
            reconciler: WatchReconciler::new(strategy),
            rx,
            debounce,
            stopping: false,
        }
    }

    pub fn state(&self) -> WatchState {
        self.reconciler.state()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Process events until a [`SessionMessage::Stop`] arrives or every
    /// sender is gone.
    pub fn run<T: WatchTarget>(&mut self, target: &mut T) -> Result<(), WatchError> {
        self.reconciler.start()?;
        self.backend.attach(&self.source)?;
        tracing::info!("watching {}", self.source.display());

        while let Some(event) = self.next_event() {
            let mut action = self.reconciler.on_event(event);
            while let Some(current) = action.take() {
                action = self.execute(current, target);
            }
            if self.stopping {
                break;
            }
        }

        self.reconciler.stop();
        if let Err(err) = self.backend.detach(&self.source) {
            tracing::debug!("detach failed: {err}");
        }
        tracing::info!("stopped watching {}", self.source.display());
        Ok(())
    }

    fn execute<T: WatchTarget>(
        &mut self,
        action: WatchAction,
        target: &mut T,
    ) -> Option<WatchAction> {
        match action {
            WatchAction::Regenerate => {
                tracing::info!("{} changed, regenerating", self.source.display());
                if let Err(err) = target.regenerate() {
                    tracing::error!("regeneration failed: {err}");
                }
                self.absorb_queued();
                self.reconciler.finish_run()
            }
            WatchAction::Clean => {
                tracing::info!("{} removed, cleaning destination", self.source.display());
                if let Err(err) = target.clean() {
                    tracing::error!("clean failed: {err}");
                }
                None
            }
            WatchAction::Reattach => self.reattach(),
        }
    }

    /// Detach, re-attach, and turn the source's current state into an event.
    fn reattach(&mut self) -> Option<WatchAction> {
        tracing::debug!("re-attaching watcher to {}", self.source.display());
        if let Err(err) = self.backend.detach(&self.source) {
            tracing::debug!("detach failed: {err}");
        }
        if let Err(err) = self.backend.attach(&self.source) {
            tracing::warn!("could not re-attach to {}: {err}", self.source.display());
        }
        self.reconciler.reattached();

        let follow_up = if self.source.exists() {
            WatchEvent::Change
        } else {
            WatchEvent::Unlink
        };
        self.reconciler.on_event(follow_up)
    }

    /// Feed events that queued up during a run into the state machine.
    fn absorb_queued(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            match message {
                SessionMessage::Stop => self.stopping = true,
                SessionMessage::Fs(event) => {
                    // Mid-run, the follow-up of a re-attach is deferred too.
                    if self.reconciler.on_event(event) == Some(WatchAction::Reattach) {
                        let _ = self.reattach();
                    }
                }
            }
        }
    }

    /// Wait for the next event, then let the burst settle. The latest event
    /// of a burst wins; a rename is returned at once.
    fn next_event(&mut self) -> Option<WatchEvent> {
        if self.stopping {
            return None;
        }
        let mut latest = match self.rx.recv() {
            Ok(SessionMessage::Fs(event)) => event,
            Ok(SessionMessage::Stop) | Err(_) => return None,
        };
        while latest != WatchEvent::Rename {
            match self.rx.recv_timeout(self.debounce) {
                Ok(SessionMessage::Fs(event)) => latest = event,
                Err(RecvTimeoutError::Timeout) => break,
                // The settled burst still runs before the session ends.
                Ok(SessionMessage::Stop) | Err(RecvTimeoutError::Disconnected) => {
                    self.stopping = true;
                    break;
                }
            }
        }
        Some(latest)
    }
}
