//! Single-flight notification dispatch.
//!
//! Frame threads arm events with [`Dispatcher::try_arm`], a non-blocking
//! compare-and-set from IDLE to PROCESSING. The winner drops its event into a
//! one-slot mailbox; a losing concurrent arm is dropped, never queued. One
//! worker thread drains the mailbox, calls the recorder and notifier, waits
//! for the recording to finish and returns the dispatcher to IDLE.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{engine_error, EngineError};
use crate::{CameraId, ClassKind};

/// The one event that may be in flight.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArmedEvent {
    pub class: ClassKind,
    pub camera: CameraId,
}

/// Result of one arm attempt.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArmOutcome {
    /// Accepted; the worker owns it now.
    Armed,
    /// Another event is in flight; this one was dropped.
    Busy,
    /// Not a notifiable class.
    Ignored,
    /// The dispatcher has shut down.
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Processing,
    Closed,
}

const IDLE: u8 = 0;
const PROCESSING: u8 = 1;
const CLOSED: u8 = 2;

impl DispatchState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            IDLE => DispatchState::Idle,
            PROCESSING => DispatchState::Processing,
            _ => DispatchState::Closed,
        }
    }
}

/// Where a recording lands.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaPath {
    pub file: PathBuf,
    /// Public URL of the same file, when the recorder serves it over HTTP.
    pub url: Option<String>,
}

impl MediaPath {
    /// URL when published, otherwise the local path.
    pub fn location(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => self.file.display().to_string(),
        }
    }
}

/// Handle to a recording started by a [`Recorder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recording {
    pub camera: CameraId,
    pub media: MediaPath,
}

/// External recording process.
pub trait Recorder: Send {
    /// Starts a clip for `camera`. Fails with [`EngineError::RecorderBusy`]
    /// when that camera is already recording.
    fn request_recording(&mut self, camera: CameraId) -> Result<Recording>;

    /// True while the clip is still being written.
    fn is_recording(&mut self, recording: &Recording) -> bool;

    /// Abandons a clip the dispatcher stopped waiting for.
    fn cancel(&mut self, _recording: &Recording) {}
}

/// External notification channel.
pub trait Notifier: Send {
    fn send_notification(
        &mut self,
        class: ClassKind,
        camera: CameraId,
        media: &MediaPath,
    ) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Pause after a successful recording request before polling it.
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    /// Bound on the recorder wait; the event is abandoned past it.
    pub max_wait: Duration,
    /// When false, armed events are consumed without recording or notifying.
    pub notify_enabled: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(120),
            notify_enabled: true,
        }
    }
}

/// Point-in-time dispatcher counters.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct DispatchStats {
    pub armed: u64,
    pub ignored: u64,
    pub dropped_busy: u64,
    pub recorder_busy: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    armed: AtomicU64,
    ignored: AtomicU64,
    dropped_busy: AtomicU64,
    recorder_busy: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            armed: self.armed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
            recorder_busy: self.recorder_busy.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

enum Mailbox {
    Empty,
    Event(ArmedEvent),
    Exit,
}

struct Shared {
    state: AtomicU8,
    notify_enabled: AtomicBool,
    mailbox: Mutex<Mailbox>,
    wake: Condvar,
    counters: Counters,
}

impl Shared {
    fn mailbox(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until an event or the exit sentinel arrives.
    fn next_event(&self) -> Option<ArmedEvent> {
        let mut mailbox = self.mailbox();
        loop {
            match std::mem::replace(&mut *mailbox, Mailbox::Empty) {
                Mailbox::Event(event) => return Some(event),
                Mailbox::Exit => {
                    *mailbox = Mailbox::Exit;
                    return None;
                }
                Mailbox::Empty => {
                    mailbox = self
                        .wake
                        .wait(mailbox)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Sleeps for `timeout` unless shutdown interrupts. Returns false on shutdown.
    fn pause(&self, timeout: Duration) -> bool {
        let mailbox = self.mailbox();
        let (mailbox, _) = self
            .wake
            .wait_timeout_while(mailbox, timeout, |m| !matches!(m, Mailbox::Exit))
            .unwrap_or_else(PoisonError::into_inner);
        !matches!(*mailbox, Mailbox::Exit)
    }
}

/// IDLE/PROCESSING admission control plus its worker thread.
pub struct Dispatcher {
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn spawn(
        config: DispatcherConfig,
        recorder: Box<dyn Recorder>,
        notifier: Box<dyn Notifier>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(IDLE),
            notify_enabled: AtomicBool::new(config.notify_enabled),
            mailbox: Mutex::new(Mailbox::Empty),
            wake: Condvar::new(),
            counters: Counters::default(),
        });
        let mut worker = Worker {
            shared: shared.clone(),
            config,
            recorder,
            notifier,
        };
        let join = std::thread::Builder::new()
            .name("barnwatch-dispatch".to_string())
            .spawn(move || worker.run())
            .context("spawn dispatch worker")?;

        Ok(Self {
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    /// Non-blocking hand-off. Exactly one concurrent caller can win.
    pub fn try_arm(&self, event: ArmedEvent) -> ArmOutcome {
        if !event.class.is_notifiable() {
            Counters::bump(&self.shared.counters.ignored);
            return ArmOutcome::Ignored;
        }

        match self
            .shared
            .state
            .compare_exchange(IDLE, PROCESSING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(CLOSED) => return ArmOutcome::Closed,
            Err(_) => {
                Counters::bump(&self.shared.counters.dropped_busy);
                log::debug!(
                    "dispatcher busy, dropped {} from {}",
                    event.class,
                    event.camera
                );
                return ArmOutcome::Busy;
            }
        }

        let mut mailbox = self.shared.mailbox();
        if matches!(*mailbox, Mailbox::Exit) {
            return ArmOutcome::Closed;
        }
        *mailbox = Mailbox::Event(event);
        self.shared.wake.notify_all();
        Counters::bump(&self.shared.counters.armed);
        log::info!("armed {} from camera {}", event.class, event.camera);
        ArmOutcome::Armed
    }

    pub fn state(&self) -> DispatchState {
        DispatchState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    /// Runtime switch for `enable_event_notify`.
    pub fn set_notify_enabled(&self, enabled: bool) {
        self.shared.notify_enabled.store(enabled, Ordering::Release);
    }

    pub fn notify_enabled(&self) -> bool {
        self.shared.notify_enabled.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.counters.snapshot()
    }

    /// Polls until the dispatcher is no longer processing, up to `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() != DispatchState::Processing {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Closes admission, interrupts any recorder wait and joins the worker.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.state.swap(CLOSED, Ordering::AcqRel);
        {
            let mut mailbox = self.shared.mailbox();
            *mailbox = Mailbox::Exit;
            self.shared.wake.notify_all();
        }
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            join.join()
                .map_err(|_| anyhow!("dispatch worker panicked"))?;
            log::info!("dispatch worker stopped");
        }
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("dispatcher shutdown: {}", err);
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    config: DispatcherConfig,
    recorder: Box<dyn Recorder>,
    notifier: Box<dyn Notifier>,
}

impl Worker {
    fn run(&mut self) {
        while let Some(event) = self.shared.next_event() {
            match self.process(event) {
                Ok(()) => {}
                Err(err) => match engine_error(&err) {
                    Some(EngineError::ShutDown) => {
                        log::debug!("event {} abandoned at shutdown", event.class)
                    }
                    Some(EngineError::RecorderTimeout { .. }) => {
                        Counters::bump(&self.shared.counters.timed_out);
                        log::warn!("{}", err);
                    }
                    _ => {
                        Counters::bump(&self.shared.counters.failed);
                        log::error!("event {} from {} failed: {:#}", event.class, event.camera, err);
                    }
                },
            }
            // a concurrent shutdown already moved the state to CLOSED
            let _ = self.shared.state.compare_exchange(
                PROCESSING,
                IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn process(&mut self, event: ArmedEvent) -> Result<()> {
        if !self.shared.notify_enabled.load(Ordering::Acquire) {
            log::info!("event notify disabled, {} from {} discarded", event.class, event.camera);
            return Ok(());
        }

        let recording = match self.recorder.request_recording(event.camera) {
            Ok(recording) => recording,
            Err(err) => {
                if let Some(EngineError::RecorderBusy(camera)) = engine_error(&err) {
                    Counters::bump(&self.shared.counters.recorder_busy);
                    log::warn!("recorder busy on {}, {} dropped", camera, event.class);
                    return Ok(());
                }
                return Err(err.context(format!("request recording on {}", event.camera)));
            }
        };
        log::info!(
            "recording {} event from {} to {}",
            event.class,
            event.camera,
            recording.media.location()
        );

        if let Err(err) = self
            .notifier
            .send_notification(event.class, event.camera, &recording.media)
        {
            log::warn!("notification for {} failed: {:#}", event.class, err);
        }

        if !self.shared.pause(self.config.settle_delay) {
            self.recorder.cancel(&recording);
            return Err(EngineError::ShutDown.into());
        }

        let started = Instant::now();
        while self.recorder.is_recording(&recording) {
            let waited = started.elapsed();
            if waited >= self.config.max_wait {
                self.recorder.cancel(&recording);
                return Err(EngineError::RecorderTimeout {
                    camera: event.camera,
                    waited,
                }
                .into());
            }
            if !self.shared.pause(self.config.poll_interval) {
                self.recorder.cancel(&recording);
                return Err(EngineError::ShutDown.into());
            }
        }

        Counters::bump(&self.shared.counters.completed);
        log::info!("{} event from {} finished", event.class, event.camera);
        Ok(())
    }
}
