//! WebSocket front door.
//!
//! One task per connection: a reader that parses commands and hands them
//! to the [`Arbitrator`], and a writer that drains the connection's outbox.
//! Connections are identified by a random id and counted by remote address.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

use crate::protocol::ClientCommand;
use crate::session::hub::{outbox, OUTBOX_CAPACITY};
use crate::session::Arbitrator;

pub struct ShareServer {
    addr: String,
    arbitrator: Arc<Arbitrator>,
}

impl ShareServer {
    pub fn new(addr: String, arbitrator: Arc<Arbitrator>) -> Self {
        Self { addr, arbitrator }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        tracing::info!("listening on ws://{}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let arbitrator = Arc::clone(&self.arbitrator);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, arbitrator).await {
                    let err_str = e.to_string();
                    // Browsers probing the port and plain HTTP requests end up here.
                    if err_str.contains("Connection: upgrade") || err_str.contains("protocol error") {
                        tracing::debug!(%peer, "not a websocket client: {}", e);
                    } else {
                        tracing::warn!(%peer, "connection error: {}", e);
                    }
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    arbitrator: Arc<Arbitrator>,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = outbox(OUTBOX_CAPACITY);
    let client = arbitrator.connect(peer.ip(), tx).await;

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("could not encode {}: {}", event.name(), e);
                    continue;
                }
            };
            if ws_sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match ClientCommand::parse(&text) {
                Ok(command) => arbitrator.handle(&client, command).await,
                Err(e) => tracing::debug!(client = %client, "ignoring message: {}", e),
            },
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    arbitrator.disconnect(&client).await;
    send_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioPacket;
    use crate::encoder::stream::{FfmpegLauncher, HardwareSupport};
    use crate::error::{AudioError, CaptureError};
    use crate::screen::capture::{FrameSource, SourceFactory, SourceInfo};
    use crate::screen::{CaptureTarget, FrameBuffer};
    use crate::session::arbitrator::{AudioStream, Devices, EncoderSetup};
    use crate::session::{Hub, Settings};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Headless;

    struct NoScreen;

    impl FrameSource for NoScreen {
        fn capture(&mut self, _target: &CaptureTarget) -> Result<FrameBuffer, CaptureError> {
            Err(CaptureError::unavailable("headless"))
        }
    }

    impl Devices for Headless {
        fn frame_source(&self, _target: &CaptureTarget) -> Result<SourceFactory, CaptureError> {
            Ok(Box::new(|| Box::new(NoScreen) as Box<dyn FrameSource>))
        }

        fn list_sources(&self) -> Vec<SourceInfo> {
            Vec::new()
        }

        fn audio_available(&self) -> bool {
            false
        }

        fn start_audio(
            &self,
            _tx: mpsc::Sender<AudioPacket>,
        ) -> Result<Box<dyn AudioStream>, AudioError> {
            Err(AudioError::NoDevice)
        }
    }

    async fn spawn_server() -> SocketAddr {
        let encoder = EncoderSetup {
            launcher: Arc::new(FfmpegLauncher::new("ffmpeg")),
            hardware: HardwareSupport::default(),
            hw_available: false,
            adaptive_quality: true,
            stats_interval: Duration::from_secs(3),
        };
        let arbitrator = Arc::new(Arbitrator::new(
            Hub::new(),
            Arc::new(Headless),
            encoder,
            Settings::default(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = ShareServer::new(addr.to_string(), arbitrator);
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >;

    async fn dial(addr: SocketAddr) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        ws
    }

    /// Next event with this name, skipping everything else.
    async fn next_event(ws: &mut Client, name: &str) -> Value {
        timeout(Duration::from_secs(5), async {
            loop {
                let Some(Ok(WsMessage::Text(text))) = ws.next().await else {
                    panic!("connection ended waiting for {}", name);
                };
                let v: Value = serde_json::from_str(&text).unwrap();
                if v["event"] == name {
                    return v["data"].clone();
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} event", name))
    }

    async fn send(ws: &mut Client, text: &str) {
        ws.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn connect_browse_and_leave() {
        let addr = spawn_server().await;
        let mut first = dial(addr).await;
        let hello = next_event(&mut first, "connected").await;
        assert_eq!(hello["client_count"], 1);
        assert_eq!(hello["audio_available"], false);
        assert_eq!(hello["codec"], "h264");
        assert_eq!(hello["encoder"], "libx264");

        // Same machine: still one viewer.
        let mut second = dial(addr).await;
        let hello = next_event(&mut second, "connected").await;
        assert_eq!(hello["client_count"], 1);

        send(&mut first, "garbage").await;
        send(&mut first, r#"{"event":"get_sources"}"#).await;
        let list = next_event(&mut first, "sources_list").await;
        assert_eq!(list["sources"].as_array().map(Vec::len), Some(0));
        assert_eq!(list["current"]["type"], "monitor");
        assert_eq!(list["current"]["id"], 1);

        second.close(None).await.unwrap();
        let update = next_event(&mut first, "client_count_updated").await;
        assert_eq!(update["count"], 1);
    }

    #[tokio::test]
    async fn audio_error_reaches_the_caller() {
        let addr = spawn_server().await;
        let mut ws = dial(addr).await;
        next_event(&mut ws, "connected").await;
        send(&mut ws, r#"{"event":"start_audio","data":{}}"#).await;
        let err = next_event(&mut ws, "audio_error").await;
        assert!(err["message"].as_str().is_some());
    }

    #[tokio::test]
    async fn start_and_stop_round_trip() {
        let addr = spawn_server().await;
        let mut ws = dial(addr).await;
        let hello = next_event(&mut ws, "connected").await;
        let me = hello["client_id"].clone();

        send(
            &mut ws,
            r#"{"event":"start_sharing","data":{"preset":"hd60","source":{"type":"monitor","id":1}}}"#,
        )
        .await;
        let started = next_event(&mut ws, "sharing_started").await;
        assert_eq!(started["sharer_id"], me);
        assert_eq!(started["settings"]["fps"], 60);
        assert_eq!(started["settings"]["resolution_limit"], "fullhd");

        send(&mut ws, r#"{"event":"stop_sharing"}"#).await;
        next_event(&mut ws, "sharing_stopped").await;
    }
}
