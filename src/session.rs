//! Voice session: connection lifecycle and public API
//!
//! Wires inbound transport events to the [`StreamRouter`] and the event bus,
//! and the capture pipeline to the transport.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::capture::{CapturePipeline, CpalMicrophone, FrameSink, MicSource};
use crate::audio::output::{CpalOutputFactory, OutputFactory};
use crate::config::{ClientConfig, ServerConfig};
use crate::error::{AudioError, NetworkError, Result};
use crate::events::{AppEvent, EventBus};
use crate::network::http::fetch_users;
use crate::network::transport::{Connector, TransportHandle};
use crate::network::websocket::WsConnector;
use crate::protocol::{InboundEvent, OutboundEvent, StickerPayload};
use crate::router::StreamRouter;

/// How long `disconnect` waits for the I/O tasks to finish
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pluggable platform pieces
pub struct SessionBackends {
    pub connector: Arc<dyn Connector>,
    pub microphone: Arc<dyn MicSource>,
    pub outputs: Arc<dyn OutputFactory>,
}

impl SessionBackends {
    /// WebSocket transport with cpal input and output
    pub fn native(config: &ClientConfig, client_id: Uuid) -> Result<Self> {
        let url = format!("{}?client={}", config.server.websocket_url()?, client_id);

        Ok(Self {
            connector: Arc::new(WsConnector::new(url)),
            microphone: Arc::new(CpalMicrophone::new(
                config.audio.input_device.clone(),
                config.audio.sample_rate,
            )),
            outputs: Arc::new(CpalOutputFactory::new(
                config.audio.output_device.clone(),
                config.audio.sample_rate,
            )),
        })
    }
}

/// Connection state
enum SessionState {
    Disconnected,
    Connected(ActiveConnection),
}

struct ActiveConnection {
    transport: TransportHandle,
    dispatcher: JoinHandle<()>,
    io_tasks: Vec<JoinHandle<()>>,
}

/// Applies inbound events; runs on the dispatcher task
struct Dispatcher {
    router: Arc<StreamRouter>,
    events: Arc<EventBus>,
    socket_id: Arc<RwLock<Option<String>>>,
    server: ServerConfig,
    teardown_on_leave: bool,
}

impl Dispatcher {
    async fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::Connected(peer) => {
                tracing::info!("Assigned socket id {}", peer.id);
                *self.socket_id.write() = Some(peer.id);
            }
            InboundEvent::Voice(voice) => {
                tracing::trace!(
                    "voice from {}: {} samples at {} Hz",
                    voice.id,
                    voice.blob.len(),
                    voice.sample_rate
                );
                if !voice.blob.is_empty() && !self.router.contains(&voice.id) {
                    if let Err(e) = self.open_peer(&voice.id).await {
                        tracing::warn!("Dropping chunk from {}: {}", voice.id, e);
                        return;
                    }
                }
                if let Err(e) = self.router.add_chunk(&voice.id, voice.blob, voice.sample_rate) {
                    tracing::warn!("Dropping chunk from {}: {}", voice.id, e);
                }
            }
            InboundEvent::UserJoin(peer) => {
                self.events.emit(&AppEvent::UserJoin { id: peer.id });
            }
            InboundEvent::UserLeave(peer) => {
                if self.teardown_on_leave {
                    let router = self.router.clone();
                    let id = peer.id.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || router.remove_peer(&id)).await {
                        tracing::warn!("Teardown of {} failed: {}", peer.id, e);
                    }
                }
                self.events.emit(&AppEvent::UserLeave { id: peer.id });
            }
            InboundEvent::UserSpeak(peer) => {
                self.events.emit(&AppEvent::UserSpeak { id: peer.id });
            }
            InboundEvent::AudioSticker(payload) => {
                let url = self.server.sticker_url(&payload.sticker);
                self.events.emit(&AppEvent::AudioSticker {
                    sticker: payload.sticker,
                    url,
                });
            }
        }
    }

    /// Open a new peer's output on the blocking pool; device start-up waits on the stream thread
    async fn open_peer(&self, peer: &str) -> std::result::Result<(), AudioError> {
        let router = self.router.clone();
        let peer = peer.to_string();

        tokio::task::spawn_blocking(move || router.ensure_peer(&peer))
            .await
            .map_err(|e| AudioError::StreamError(e.to_string()))?
    }

    async fn run(self, mut inbound: mpsc::UnboundedReceiver<InboundEvent>) {
        while let Some(event) = inbound.recv().await {
            self.handle(event).await;
        }
        tracing::info!("Inbound event stream ended");
    }
}

/// Voice chat session against one relay server
pub struct VoiceSession {
    config: ClientConfig,
    client_id: Uuid,
    connector: Arc<dyn Connector>,
    router: Arc<StreamRouter>,
    capture: Arc<Mutex<CapturePipeline>>,
    events: Arc<EventBus>,
    socket_id: Arc<RwLock<Option<String>>>,
    http: reqwest::Client,
    state: SessionState,
}

impl VoiceSession {
    /// Create a session on the native backends. Fails on invalid configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let client_id = Uuid::new_v4();
        let backends = SessionBackends::native(&config, client_id)?;
        Self::with_backends(config, client_id, backends)
    }

    /// Create a session on caller-provided backends
    pub fn with_backends(config: ClientConfig, client_id: Uuid, backends: SessionBackends) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(StreamRouter::new(config.playback, backends.outputs)?);
        let capture = CapturePipeline::new(
            backends.microphone,
            config.audio.sample_rate,
            config.audio.buffer_size,
        );

        Ok(Self {
            config,
            client_id,
            connector: backends.connector,
            router,
            capture: Arc::new(Mutex::new(capture)),
            events: Arc::new(EventBus::new()),
            socket_id: Arc::new(RwLock::new(None)),
            http: reqwest::Client::new(),
            state: SessionState::Disconnected,
        })
    }

    /// Open the transport and start dispatching inbound events.
    ///
    /// No-op while the connection is live. A connection the server already
    /// closed is torn down first and replaced.
    pub async fn connect(&mut self) -> Result<()> {
        let live = match &self.state {
            SessionState::Connected(active) => Some(active.transport.is_open()),
            SessionState::Disconnected => None,
        };

        match live {
            Some(true) => return Ok(()),
            Some(false) => {
                tracing::info!("Previous connection is closed, reconnecting");
                self.disconnect().await;
            }
            None => {}
        }

        let connection = self.connector.connect().await?;

        let dispatcher = Dispatcher {
            router: self.router.clone(),
            events: self.events.clone(),
            socket_id: self.socket_id.clone(),
            server: self.config.server.clone(),
            teardown_on_leave: self.config.playback.teardown_on_leave,
        };
        let dispatcher = tokio::spawn(dispatcher.run(connection.inbound));

        tracing::info!("Session {} connected", self.client_id);

        self.state = SessionState::Connected(ActiveConnection {
            transport: connection.transport,
            dispatcher,
            io_tasks: connection.tasks,
        });
        Ok(())
    }

    /// Stop speaking, close the transport and drop every peer buffer
    pub async fn disconnect(&mut self) {
        self.capture.lock().disable();

        if let SessionState::Connected(active) = std::mem::replace(&mut self.state, SessionState::Disconnected) {
            active.transport.close();
            active.dispatcher.abort();

            for mut task in active.io_tasks {
                if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                    tracing::warn!("Transport task did not finish in time, aborting");
                    task.abort();
                }
            }

            tracing::info!("Session {} disconnected", self.client_id);
        }

        // Closing device outputs joins their stream threads
        let router = self.router.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || router.clear()).await {
            tracing::warn!("Peer teardown failed: {}", e);
        }
        *self.socket_id.write() = None;
    }

    /// Connected and the transport is still open
    pub fn is_connected(&self) -> bool {
        match &self.state {
            SessionState::Connected(active) => active.transport.is_open(),
            SessionState::Disconnected => false,
        }
    }

    /// A capture stream exists
    pub fn is_speak_enabled(&self) -> bool {
        self.capture.lock().is_enabled()
    }

    /// Start sending microphone audio. No-op when already speaking.
    ///
    /// The microphone is opened on the blocking pool since device start-up
    /// waits on the capture thread.
    pub async fn speak_on(&mut self) -> Result<()> {
        if self.is_speak_enabled() {
            return Ok(());
        }

        let transport = match &self.state {
            SessionState::Connected(active) if active.transport.is_open() => active.transport.clone(),
            _ => return Err(NetworkError::TransportUnavailable.into()),
        };

        let sink: Arc<dyn FrameSink> = Arc::new(transport);
        let capture = self.capture.clone();

        tokio::task::spawn_blocking(move || capture.lock().enable(sink))
            .await
            .map_err(|e| AudioError::StreamError(e.to_string()))??;
        Ok(())
    }

    /// Stop sending microphone audio. No-op when not speaking.
    pub fn speak_off(&mut self) {
        self.capture.lock().disable();
    }

    /// Ask the server to play a sticker sound for everyone
    pub fn send_audio_sticker(&self, sticker: &str) -> Result<()> {
        match &self.state {
            SessionState::Connected(active) => {
                active.transport.send(OutboundEvent::AudioSticker(StickerPayload {
                    sticker: sticker.to_string(),
                }))?;
                Ok(())
            }
            SessionState::Disconnected => Err(NetworkError::TransportUnavailable.into()),
        }
    }

    /// Ids of users connected to the server
    pub async fn get_users(&self) -> Result<Vec<String>> {
        Ok(fetch_users(&self.http, &self.config.server.users_url()).await?)
    }

    /// Id the server assigned to this connection
    pub fn socket_id(&self) -> Option<String> {
        self.socket_id.read().clone()
    }

    /// Locally generated id sent with the connection request
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn router(&self) -> &Arc<StreamRouter> {
        &self.router
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.capture.lock().disable();

        if let SessionState::Connected(active) = &self.state {
            active.transport.close();
            active.dispatcher.abort();
        }
    }
}
