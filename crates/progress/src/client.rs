//! Push-channel transport.
//!
//! [`ProgressConnector`] opens one push channel for one job and yields
//! its inbound frames as a [`FrameStream`]. [`WsConnector`] is the
//! WebSocket implementation used against the real backend; tests plug in
//! scripted connectors instead.

use async_trait::async_trait;
use callcoach_core::types::JobId;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use crate::config::MonitorConfig;

/// One inbound event on a push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text payload, expected to hold one JSON progress message.
    Text(String),
    /// The peer closed the channel. `clean` is true only for a normal
    /// closure handshake.
    Close { clean: bool },
}

/// Inbound frames of a live channel.
///
/// An `Err` item or the stream ending without a [`Frame::Close`] is a
/// non-clean disconnect.
pub type FrameStream = BoxStream<'static, Result<Frame, ProgressClientError>>;

/// Opens push channels addressed per job.
#[async_trait]
pub trait ProgressConnector: Send + Sync {
    /// Establish the push channel for `job_id`.
    async fn connect(&self, job_id: JobId) -> Result<FrameStream, ProgressClientError>;
}

/// WebSocket connector for the backend's `/ws/analyze/{job_id}` endpoint.
pub struct WsConnector {
    config: MonitorConfig,
}

impl WsConnector {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// WebSocket base address (e.g. `ws://host:8000`).
    pub fn ws_address(&self) -> String {
        self.config.ws_address()
    }
}

#[async_trait]
impl ProgressConnector for WsConnector {
    async fn connect(&self, job_id: JobId) -> Result<FrameStream, ProgressClientError> {
        let url = self.config.channel_url(job_id);
        // Correlates the log lines of one physical connection across reconnects.
        let connection_id = uuid::Uuid::new_v4();

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ProgressClientError::Connection(format!(
                "Failed to connect progress channel at {url}: {e}"
            ))
        })?;

        tracing::info!(
            job_id,
            connection_id = %connection_id,
            "Progress channel connected at {url}",
        );

        Ok(ws_stream
            .filter_map(|msg| futures::future::ready(translate(msg)))
            .boxed())
    }
}

/// Map a raw WebSocket message onto a [`Frame`].
///
/// Binary, ping and pong frames carry nothing for this protocol and are
/// skipped. Pongs are answered by tungstenite itself.
fn translate(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Frame, ProgressClientError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.to_string()))),
        Ok(Message::Close(frame)) => {
            let clean = frame
                .as_ref()
                .map(|f| f.code == CloseCode::Normal)
                .unwrap_or(false);
            Some(Ok(Frame::Close { clean }))
        }
        Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(ProgressClientError::Protocol(e.to_string()))),
    }
}

/// Errors that can occur on a push channel.
#[derive(Debug, thiserror::Error)]
pub enum ProgressClientError {
    /// Failed to establish the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    use super::*;

    #[test]
    fn text_frames_pass_through() {
        let frame = translate(Ok(Message::Text("{}".into())));
        assert!(matches!(frame, Some(Ok(Frame::Text(t))) if t == "{}"));
    }

    #[test]
    fn normal_close_is_clean() {
        let frame = translate(Ok(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }))));
        assert!(matches!(frame, Some(Ok(Frame::Close { clean: true }))));
    }

    #[test]
    fn going_away_close_is_not_clean() {
        let frame = translate(Ok(Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "server restart".into(),
        }))));
        assert!(matches!(frame, Some(Ok(Frame::Close { clean: false }))));
    }

    #[test]
    fn close_without_frame_is_not_clean() {
        let frame = translate(Ok(Message::Close(None)));
        assert!(matches!(frame, Some(Ok(Frame::Close { clean: false }))));
    }

    #[test]
    fn control_frames_are_skipped() {
        assert!(translate(Ok(Message::Ping(Vec::new().into()))).is_none());
        assert!(translate(Ok(Message::Binary(Vec::new().into()))).is_none());
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_connection_error() {
        let connector = WsConnector::new(&MonitorConfig::new("http://127.0.0.1:9"));
        let result = connector.connect(1).await;
        assert!(matches!(result, Err(ProgressClientError::Connection(_))));
    }
}
