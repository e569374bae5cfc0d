//! The playback engine.
//!
//! A [`Player`] owns the state machine, the metadata store and at most one session. A
//! session is two worker threads joined by a bounded queue:
//!
//! - reader: socket -> decode -> convert -> queue
//! - output: waits for the prebuffer, flips `Connecting -> Playing`, drains the queue
//!   into the [`OutputBackend`]
//!
//! Teardown is synchronous: cancel, close the queue, shut the socket down, join both
//! workers, then clear metadata. A session that is still connecting is registered too,
//! so `stop` can abort its handshake without waiting for `start` to return.

use std::io;
use std::mem;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::metadata::{MetadataStore, TrackMetadata};
use crate::output::{CpalOutput, OutputBackend, PlaybackControl};
use crate::queue::{SharedAudio, calc_max_buffered_samples};
use crate::reader::{self, DownloadedTrack, ReaderContext};
use crate::resample::OutputFormat;
use crate::settings::Settings;
use crate::state::{PlaybackState, SessionId, StateCell};

/// Counts live worker threads; decremented on drop so panics are counted too.
struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a worker needs to report its own failure.
#[derive(Clone)]
struct SessionShared {
    id: SessionId,
    state: Arc<StateCell>,
    last_error: Arc<Mutex<Option<EngineError>>>,
    cancel: Arc<AtomicBool>,
    queue: Arc<SharedAudio>,
}

impl SessionShared {
    /// Move the session to `Error` (if it is still current) and stop both workers.
    fn fail(&self, err: EngineError) {
        if self.state.fail(self.id) {
            tracing::error!(session = self.id, error = %err, "session failed");
            *self.last_error.lock().unwrap() = Some(err);
        } else {
            tracing::debug!(session = self.id, error = %err, "stale session error ignored");
        }
        self.cancel.store(true, Ordering::SeqCst);
        self.queue.close();
    }
}

struct Session {
    id: SessionId,
    cancel: Arc<AtomicBool>,
    queue: Arc<SharedAudio>,
    socket: TcpStream,
    workers: Vec<JoinHandle<()>>,
}

/// A session still connecting or negotiating. `stop` cancels it by shutting the socket down.
struct Pending {
    id: SessionId,
    cancel: Arc<AtomicBool>,
    socket: Option<TcpStream>,
}

enum Slot {
    Idle,
    Connecting(Pending),
    Active(Session),
}

/// Playback engine context.
pub struct Player {
    state: Arc<StateCell>,
    metadata: Arc<MetadataStore>,
    /// Serializes `start` calls. `stop` never takes it.
    starting: Mutex<()>,
    slot: Mutex<Slot>,
    backend: Arc<dyn OutputBackend>,
    config: EngineConfig,
    paused: Arc<AtomicBool>,
    volume: Arc<AtomicU8>,
    live_workers: Arc<AtomicUsize>,
    last_error: Arc<Mutex<Option<EngineError>>>,
}

impl Player {
    pub fn new(backend: Arc<dyn OutputBackend>, config: EngineConfig) -> Self {
        Self {
            state: Arc::new(StateCell::new()),
            metadata: Arc::new(MetadataStore::new()),
            starting: Mutex::new(()),
            slot: Mutex::new(Slot::Idle),
            backend,
            config,
            paused: Arc::new(AtomicBool::new(false)),
            volume: Arc::new(AtomicU8::new(u8::MAX)),
            live_workers: Arc::new(AtomicUsize::new(0)),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Player on the host's audio device, selected by `config`.
    pub fn with_cpal(config: EngineConfig) -> Self {
        let backend = CpalOutput::new(config.device.clone(), config.output_rate, config.refill_max_frames);
        Self::new(Arc::new(backend), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Begin a session, tearing down any previous one first.
    ///
    /// Blocks for connect and handshake. A concurrent [`Player::stop`] aborts the handshake
    /// and makes this return a `ConnectionFailure` with the state left at `Stopped`.
    ///
    /// A server refusing the request is `InvalidSettings` and leaves the state `Stopped`.
    /// Any other failure leaves it at `Error`; the error is also available from
    /// [`Player::last_error`].
    pub fn start(&self, server: &str, settings: Settings) -> EngineResult<()> {
        let _serial = self.starting.lock().unwrap();

        let previous = mem::replace(&mut *self.slot.lock().unwrap(), Slot::Idle);
        if let Slot::Active(old) = &previous {
            tracing::info!(session = old.id, "replacing active session");
        }
        self.release(previous);

        let cancel = Arc::new(AtomicBool::new(false));
        let id = {
            let mut slot = self.slot.lock().unwrap();
            let id = self.state.begin();
            *slot = Slot::Connecting(Pending {
                id,
                cancel: cancel.clone(),
                socket: None,
            });
            id
        };
        tracing::info!(session = id, server, "starting session");

        match self.open_session(id, server, &settings, &cancel) {
            Ok(session) => self.install(session),
            Err(e) => {
                self.abandon(id, &e);
                Err(e)
            }
        }
    }

    fn open_session(
        &self,
        id: SessionId,
        server: &str,
        settings: &Settings,
        cancel: &Arc<AtomicBool>,
    ) -> EngineResult<Session> {
        let format = self.backend.output_format()?;
        let mut stream = reader::connect(server, self.config.connect_timeout)?;
        self.attach_socket(id, &stream)?;
        reader::negotiate(&mut stream, settings, self.config.handshake_timeout).map_err(|e| {
            if cancel.load(Ordering::SeqCst) { cancelled() } else { e }
        })?;
        let socket = stream.try_clone()?;

        let capacity = calc_max_buffered_samples(format.sample_rate, format.channels, self.config.buffer_seconds);
        let queue = Arc::new(SharedAudio::new(format.channels, capacity));

        self.paused.store(false, Ordering::SeqCst);
        let control = PlaybackControl {
            cancel: cancel.clone(),
            paused: self.paused.clone(),
            ..PlaybackControl::new(self.volume.clone())
        };
        let shared = SessionShared {
            id,
            state: self.state.clone(),
            last_error: self.last_error.clone(),
            cancel: cancel.clone(),
            queue: queue.clone(),
        };

        let mut session = Session {
            id,
            cancel: cancel.clone(),
            queue: queue.clone(),
            socket,
            workers: Vec::with_capacity(2),
        };

        let ctx = ReaderContext {
            id,
            stream,
            cover: settings.cover,
            output: format,
            chunk_frames: self.config.chunk_frames,
            xor_key: self.config.xor_key.clone(),
            queue: queue.clone(),
            metadata: self.metadata.clone(),
            cancel: cancel.clone(),
        };
        let reader_shared = shared.clone();
        let guard = WorkerGuard::new(&self.live_workers);
        let spawned = spawn_worker(format!("monolib-reader-{id}"), move || {
            let _guard = guard;
            if let Err(e) = reader::run(ctx) {
                reader_shared.fail(e);
            }
            reader_shared.queue.close();
            tracing::debug!(session = reader_shared.id, "reader finished");
        });
        session.workers.push(spawned.map_err(|e| spawn_error("reader", e))?);

        let prebuffer_frames = (self.config.prebuffer_seconds.max(0.0) * format.sample_rate as f32).ceil() as usize;
        let backend = self.backend.clone();
        let guard = WorkerGuard::new(&self.live_workers);
        let spawned = spawn_worker(format!("monolib-output-{id}"), move || {
            let _guard = guard;
            output_worker(shared, backend, format, control, prebuffer_frames);
        });
        match spawned {
            Ok(handle) => session.workers.push(handle),
            Err(e) => {
                // The state still belongs to this session so `start` can move it to `Error`.
                self.shutdown_session(session);
                return Err(spawn_error("output", e));
            }
        }

        Ok(session)
    }

    /// Let `stop` reach the socket of the handshake in flight.
    fn attach_socket(&self, id: SessionId, stream: &TcpStream) -> EngineResult<()> {
        let mut slot = self.slot.lock().unwrap();
        match &mut *slot {
            Slot::Connecting(p) if p.id == id && !p.cancel.load(Ordering::SeqCst) => {
                p.socket = Some(stream.try_clone()?);
                Ok(())
            }
            _ => Err(cancelled()),
        }
    }

    fn install(&self, session: Session) -> EngineResult<()> {
        let mut slot = self.slot.lock().unwrap();
        if matches!(&*slot, Slot::Connecting(p) if p.id == session.id) {
            *slot = Slot::Active(session);
            return Ok(());
        }
        drop(slot);
        tracing::info!(session = session.id, "start cancelled after handshake");
        self.shutdown_session(session);
        Err(cancelled())
    }

    /// Settle the state after `start` failed for session `id`.
    fn abandon(&self, id: SessionId, err: &EngineError) {
        let mut slot = self.slot.lock().unwrap();
        if !matches!(&*slot, Slot::Connecting(p) if p.id == id) {
            tracing::info!(session = id, "start cancelled");
            return;
        }
        *slot = Slot::Idle;
        match err {
            EngineError::InvalidSettings(_) => self.state.stop(),
            _ => {
                self.state.fail(id);
            }
        }
        drop(slot);
        tracing::warn!(session = id, error = %err, "session failed to start");
        self.set_last_error(err.clone());
    }

    /// Stop everything. Idempotent; a no-op when idle.
    ///
    /// Never waits for a `start` in progress: a pending handshake is aborted instead.
    pub fn stop(&self) {
        let previous = mem::replace(&mut *self.slot.lock().unwrap(), Slot::Idle);
        self.release(previous);
    }

    /// Same as [`Player::stop`]; kept as the recovery entry point of older hosts.
    pub fn reset(&self) {
        self.stop();
    }

    fn release(&self, slot: Slot) {
        match slot {
            Slot::Idle => self.state.stop(),
            Slot::Connecting(pending) => {
                tracing::info!(session = pending.id, "aborting handshake");
                pending.cancel.store(true, Ordering::SeqCst);
                if let Some(socket) = &pending.socket {
                    let _ = socket.shutdown(Shutdown::Both);
                }
                self.state.stop();
            }
            Slot::Active(session) => self.teardown(session),
        }
    }

    fn teardown(&self, session: Session) {
        tracing::info!(session = session.id, "stopping session");
        self.state.stop();
        self.shutdown_session(session);
    }

    /// Cancel, close the queue, shut the socket down and join both workers.
    fn shutdown_session(&self, mut session: Session) {
        session.cancel.store(true, Ordering::SeqCst);
        session.queue.close();
        let _ = session.socket.shutdown(Shutdown::Both);
        for handle in session.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!(session = session.id, "worker panicked");
            }
        }
        self.metadata.clear();
    }

    /// `Playing <-> Paused`. Returns the resulting state.
    pub fn toggle(&self) -> PlaybackState {
        let paused = &self.paused;
        self.state.toggle(|s| match s {
            PlaybackState::Paused => paused.store(true, Ordering::SeqCst),
            PlaybackState::Playing => paused.store(false, Ordering::SeqCst),
            _ => {}
        })
    }

    pub fn state(&self) -> PlaybackState {
        self.state.get()
    }

    /// Block until `pred` holds or `timeout` passes; returns the last state seen.
    pub fn wait_for_state(&self, timeout: Duration, pred: impl Fn(PlaybackState) -> bool) -> PlaybackState {
        self.state.wait_for(timeout, pred)
    }

    pub fn metadata(&self) -> Option<Arc<TrackMetadata>> {
        self.metadata.current()
    }

    pub(crate) fn metadata_store(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume.store(volume, Ordering::Relaxed);
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<EngineError> {
        self.last_error.lock().unwrap().clone()
    }

    pub(crate) fn set_last_error(&self, err: EngineError) {
        *self.last_error.lock().unwrap() = Some(err);
    }

    /// Worker threads currently alive across all sessions.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Query the server's playlists; independent of any session.
    pub fn list_playlists(&self, server: &str) -> EngineResult<Vec<String>> {
        reader::list_playlists(server, &self.config)
    }

    /// Download one track without playing it; independent of any session.
    pub fn get_track(&self, server: &str, settings: &Settings) -> EngineResult<DownloadedTrack> {
        reader::get_track(server, settings, &self.config)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_error(worker: &str, e: io::Error) -> EngineError {
    EngineError::DeviceFailure(format!("spawn {worker} worker: {e}"))
}

fn cancelled() -> EngineError {
    EngineError::ConnectionFailure("start cancelled by stop".to_string())
}

fn spawn_worker<F>(name: String, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    #[cfg(test)]
    {
        if name.starts_with("monolib-output") && tests::REFUSE_OUTPUT_SPAWN.with(|r| r.get()) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "output spawn refused"));
        }
    }
    thread::Builder::new().name(name).spawn(f)
}

fn output_worker(
    shared: SessionShared,
    backend: Arc<dyn OutputBackend>,
    format: OutputFormat,
    control: PlaybackControl,
    prebuffer_frames: usize,
) {
    if !shared.queue.wait_for_frames(prebuffer_frames, &control.cancel) {
        return;
    }
    if control.is_cancelled() {
        return;
    }
    if shared.state.mark_playing(shared.id) {
        tracing::info!(session = shared.id, buffered_frames = shared.queue.len_frames(), "playback started");
    }

    if let Err(e) = backend.run(format, shared.queue.clone(), &control) {
        shared.fail(e);
    }
    tracing::debug!(
        session = shared.id,
        played_frames = control.played_frames.load(Ordering::Relaxed),
        "output finished"
    );
}
