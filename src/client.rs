//! Voice client: connection state machine and event loop.
//!
//! All session state lives inside one cooperative [`VoiceClient::run`]
//! loop; commands, session events, capture frames, playback notifications,
//! and the quiet deadline are multiplexed through a single `select!`, so
//! transitions never race. Handles talk to the loop over channels.

use crate::activity::SpeakingTracker;
use crate::audio::capture::{CaptureEngine, CpalMicrophone, MicStream, Microphone};
use crate::audio::output::{CpalOutputDevice, OutputDevice, UnitId};
use crate::audio::playback::PlaybackScheduler;
use crate::config::{AudioConfig, VoiceConfig};
use crate::error::{Result, VoiceError};
use crate::pcm::{self, EncodedBlob, SampleBuffer};
use crate::session::{Connector, GeminiConnector, LiveSession, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands queued from handles to the loop.
const COMMAND_CHANNEL_SIZE: usize = 16;
/// Encoded microphone frames buffered between capture and the loop.
const FRAME_CHANNEL_SIZE: usize = 32;
/// Broadcast backlog per event subscriber.
const CLIENT_EVENT_CAPACITY: usize = 64;
/// Websocket close code for a clean shutdown.
const NORMAL_CLOSURE: u16 = 1000;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events broadcast to handle subscribers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged { state: ConnectionState },
    /// The agent started or stopped audibly speaking.
    Speaking { active: bool },
    Error { message: String },
}

#[derive(Debug)]
enum Command {
    Connect,
    Close,
}

/// Cheap cloneable handle to a running [`VoiceClient`].
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
}

impl ClientHandle {
    /// Request a session. Ignored unless the client is disconnected or in
    /// the error state.
    ///
    /// # Errors
    ///
    /// Returns an error when the client loop has exited.
    pub async fn connect(&self) -> Result<()> {
        self.commands
            .send(Command::Connect)
            .await
            .map_err(|_| VoiceError::Channel("client loop has exited".into()))
    }

    /// Request session teardown. A no-op when already disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error when the client loop has exited.
    pub async fn close(&self) -> Result<()> {
        self.commands
            .send(Command::Close)
            .await
            .map_err(|_| VoiceError::Channel("client loop has exited".into()))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch receiver for connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Stop the client loop entirely.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Per-connection state owned by the client loop.
struct SessionRuntime {
    session: Option<LiveSession>,
    pending: Option<oneshot::Receiver<Result<LiveSession>>>,
    mic_stream: Option<MicStream>,
    capture: CaptureEngine,
    scheduler: Option<PlaybackScheduler>,
    tracker: SpeakingTracker,
    /// First unit id for the next scheduler. Unit ids stay monotonic across
    /// sessions so a late end notification from a torn-down output context
    /// can never alias a unit in the next session.
    next_unit_id: UnitId,
}

impl SessionRuntime {
    fn new(quiet_interval: Duration) -> Self {
        Self {
            session: None,
            pending: None,
            mic_stream: None,
            capture: CaptureEngine::new(),
            scheduler: None,
            tracker: SpeakingTracker::new(quiet_interval),
            next_unit_id: 0,
        }
    }

    fn is_live(&self) -> bool {
        self.session.is_some() || self.pending.is_some()
    }

    /// Stop capture, flush and release playback, close the session handle,
    /// and release the microphone. Safe to call in any state.
    async fn teardown(&mut self, events: &broadcast::Sender<ClientEvent>) {
        self.capture.stop().await;
        if let Some(mut scheduler) = self.scheduler.take() {
            self.next_unit_id = scheduler.next_unit_id();
            scheduler.teardown();
        }
        if let Some(live) = self.session.take() {
            live.close();
        }
        // Dropping the pending receiver makes the connect task close any
        // session it still produces.
        self.pending = None;
        self.mic_stream = None;
        if self.tracker.on_idle() {
            let _ = events.send(ClientEvent::Speaking { active: false });
        }
    }
}

/// Full-duplex voice client.
///
/// Construct, take a [`handle`], then drive [`run`] to completion on the
/// runtime.
///
/// [`handle`]: VoiceClient::handle
/// [`run`]: VoiceClient::run
pub struct VoiceClient {
    config: VoiceConfig,
    mic: Box<dyn Microphone>,
    output: Box<dyn OutputDevice>,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl VoiceClient {
    pub fn new(config: VoiceConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _events_rx) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        Self {
            config,
            mic: Box::new(CpalMicrophone),
            output: Box::new(CpalOutputDevice),
            connector: Arc::new(GeminiConnector::new()),
            cancel: CancellationToken::new(),
            cmd_tx,
            cmd_rx,
            state_tx,
            events_tx,
        }
    }

    #[must_use]
    pub fn with_microphone(mut self, mic: Box<dyn Microphone>) -> Self {
        self.mic = mic;
        self
    }

    #[must_use]
    pub fn with_output_device(mut self, output: Box<dyn OutputDevice>) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Handle for issuing commands and observing state.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            commands: self.cmd_tx.clone(),
            state: self.state_tx.subscribe(),
            events: self.events_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the client until shutdown.
    ///
    /// Exits when the cancel token fires or every handle has been dropped;
    /// either way the session is torn down first.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` reserves room for startup
    /// failures surfacing here.
    pub async fn run(self) -> Result<()> {
        let VoiceClient {
            config,
            mut mic,
            mut output,
            connector,
            cancel,
            cmd_tx,
            mut cmd_rx,
            state_tx,
            events_tx,
        } = self;
        // The loop must see `None` from the command channel once every
        // external handle is gone.
        drop(cmd_tx);

        let (frame_tx, mut frame_rx) = mpsc::channel::<EncodedBlob>(FRAME_CHANNEL_SIZE);
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<UnitId>();

        let mut rt = SessionRuntime::new(Duration::from_millis(
            config.activity.quiet_interval_ms,
        ));

        info!("voice client loop started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("shutdown requested");
                    rt.teardown(&events_tx).await;
                    set_state(&state_tx, &events_tx, ConnectionState::Disconnected);
                    break;
                }

                command = cmd_rx.recv() => match command {
                    Some(Command::Connect) => {
                        if rt.is_live() {
                            warn!("connect ignored: session already live or connecting");
                            continue;
                        }
                        set_state(&state_tx, &events_tx, ConnectionState::Connecting);

                        let stream = match mic.acquire(&config.audio).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                error!("microphone acquisition failed: {e}");
                                let _ = events_tx.send(ClientEvent::Error {
                                    message: e.to_string(),
                                });
                                set_state(&state_tx, &events_tx, ConnectionState::Error);
                                continue;
                            }
                        };
                        let ctx = match output.open(&config.audio, ended_tx.clone()) {
                            Ok(ctx) => ctx,
                            Err(e) => {
                                // Releases the microphone again.
                                drop(stream);
                                error!("output device open failed: {e}");
                                let _ = events_tx.send(ClientEvent::Error {
                                    message: e.to_string(),
                                });
                                set_state(&state_tx, &events_tx, ConnectionState::Error);
                                continue;
                            }
                        };

                        rt.mic_stream = Some(stream);
                        rt.scheduler =
                            Some(PlaybackScheduler::new(ctx).with_first_unit_id(rt.next_unit_id));

                        let (result_tx, result_rx) = oneshot::channel();
                        let connector = Arc::clone(&connector);
                        let agent_config = config.agent.clone();
                        tokio::spawn(async move {
                            let result = connector.connect(&agent_config).await;
                            if let Err(Ok(stale)) = result_tx.send(result) {
                                stale.close();
                            }
                        });
                        rt.pending = Some(result_rx);
                        info!("connecting to agent");
                    }
                    Some(Command::Close) => {
                        if !rt.is_live() && *state_tx.borrow() == ConnectionState::Disconnected {
                            debug!("close ignored: already disconnected");
                            continue;
                        }
                        rt.teardown(&events_tx).await;
                        set_state(&state_tx, &events_tx, ConnectionState::Disconnected);
                    }
                    None => {
                        debug!("all client handles dropped, shutting down");
                        rt.teardown(&events_tx).await;
                        set_state(&state_tx, &events_tx, ConnectionState::Disconnected);
                        break;
                    }
                },

                result = await_connect(rt.pending.as_mut()) => {
                    rt.pending = None;
                    match result {
                        Ok(live) => {
                            if *state_tx.borrow() == ConnectionState::Connecting {
                                info!("session {} established", live.session_id());
                                rt.session = Some(live);
                            } else {
                                debug!("discarding session established after close");
                                live.close();
                            }
                        }
                        Err(e) => {
                            error!("session connect failed: {e}");
                            let _ = events_tx.send(ClientEvent::Error {
                                message: e.to_string(),
                            });
                            rt.teardown(&events_tx).await;
                            set_state(&state_tx, &events_tx, ConnectionState::Error);
                        }
                    }
                }

                event = next_session_event(rt.session.as_mut()) => match event {
                    Some(SessionEvent::Opened) => {
                        if let Some(stream) = rt.mic_stream.take() {
                            rt.capture.start(stream, frame_tx.clone(), &config.audio);
                            set_state(&state_tx, &events_tx, ConnectionState::Connected);
                            info!("session open, capture running");
                        } else {
                            warn!("session opened without a microphone stream");
                            set_state(&state_tx, &events_tx, ConnectionState::Connected);
                        }
                    }
                    Some(SessionEvent::Chunk { payload }) => {
                        match decode_chunk(&payload, &config.audio) {
                            Ok(buffer) => {
                                let Some(scheduler) = rt.scheduler.as_mut() else {
                                    continue;
                                };
                                match scheduler.enqueue(buffer) {
                                    Ok(_) => {
                                        if rt.tracker.on_chunk(Instant::now()) {
                                            let _ = events_tx.send(ClientEvent::Speaking {
                                                active: true,
                                            });
                                        }
                                    }
                                    Err(e) => warn!("failed to schedule agent audio: {e}"),
                                }
                            }
                            // Bad chunks are dropped; the session stays up.
                            Err(e) => warn!("dropping malformed agent chunk: {e}"),
                        }
                    }
                    Some(SessionEvent::Interrupted) => {
                        info!("agent interrupted, flushing playback");
                        if let Some(scheduler) = rt.scheduler.as_mut() {
                            scheduler.flush();
                        }
                        if rt.tracker.on_idle() {
                            let _ = events_tx.send(ClientEvent::Speaking { active: false });
                        }
                    }
                    Some(SessionEvent::Error { message }) => {
                        error!("session error: {message}");
                        let _ = events_tx.send(ClientEvent::Error {
                            message,
                        });
                        rt.teardown(&events_tx).await;
                        set_state(&state_tx, &events_tx, ConnectionState::Error);
                    }
                    Some(SessionEvent::Closed { code, reason }) => {
                        if code == Some(NORMAL_CLOSURE) {
                            // The peer hung up cleanly; not an error.
                            info!("session closed by remote: '{reason}'");
                            rt.teardown(&events_tx).await;
                            set_state(&state_tx, &events_tx, ConnectionState::Disconnected);
                        } else {
                            warn!("session closed abnormally: code {code:?}, reason '{reason}'");
                            let message = if reason.is_empty() {
                                "session closed abnormally".to_owned()
                            } else {
                                format!("session closed abnormally: {reason}")
                            };
                            let _ = events_tx.send(ClientEvent::Error { message });
                            rt.teardown(&events_tx).await;
                            set_state(&state_tx, &events_tx, ConnectionState::Error);
                        }
                    }
                    None => {
                        rt.session = None;
                        error!("session transport ended unexpectedly");
                        let _ = events_tx.send(ClientEvent::Error {
                            message: "session transport ended unexpectedly".into(),
                        });
                        rt.teardown(&events_tx).await;
                        set_state(&state_tx, &events_tx, ConnectionState::Error);
                    }
                },

                ended = ended_rx.recv() => {
                    if let (Some(id), Some(scheduler)) = (ended, rt.scheduler.as_mut()) {
                        if scheduler.on_unit_ended(id) && rt.tracker.on_idle() {
                            let _ = events_tx.send(ClientEvent::Speaking { active: false });
                        }
                    }
                }

                frame = frame_rx.recv() => {
                    if let (Some(blob), Some(live)) = (frame, rt.session.as_ref()) {
                        if let Err(e) = live.send(blob) {
                            debug!("dropping microphone frame: {e}");
                        }
                    }
                }

                () = sleep_until_deadline(rt.tracker.deadline()) => {
                    if rt.tracker.on_deadline(Instant::now()) {
                        debug!("speaking state cleared by quiet deadline");
                        let _ = events_tx.send(ClientEvent::Speaking { active: false });
                    }
                }
            }
        }

        info!("voice client loop exited");
        Ok(())
    }
}

fn set_state(
    state_tx: &watch::Sender<ConnectionState>,
    events: &broadcast::Sender<ClientEvent>,
    state: ConnectionState,
) {
    let previous = state_tx.send_replace(state);
    if previous != state {
        debug!("connection state: {previous:?} -> {state:?}");
        let _ = events.send(ClientEvent::StateChanged { state });
    }
}

/// Decode one wire chunk into a playable buffer at the output rate.
fn decode_chunk(payload: &str, audio: &AudioConfig) -> Result<SampleBuffer> {
    let bytes = pcm::decode_payload(payload)?;
    pcm::to_sample_buffer(&bytes, audio.output_sample_rate, 1)
}

async fn await_connect(
    pending: Option<&mut oneshot::Receiver<Result<LiveSession>>>,
) -> Result<LiveSession> {
    match pending {
        Some(rx) => match rx.await {
            Ok(result) => result,
            Err(_) => Err(VoiceError::Session("connect task aborted".into())),
        },
        None => std::future::pending().await,
    }
}

async fn next_session_event(session: Option<&mut LiveSession>) -> Option<SessionEvent> {
    match session {
        Some(live) => live.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
