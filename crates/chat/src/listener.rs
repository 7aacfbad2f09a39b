use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use shared::domain::ChannelRef;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A message someone typed in a channel the bot can see.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: ChannelRef,
    pub author: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct GatewayFrame {
    #[serde(default)]
    op: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    author_is_bot: bool,
    #[serde(default)]
    content: String,
}

/// Reads the chat server's event stream over a WebSocket and forwards
/// inbound messages to the command loop. Reconnects with a fixed delay
/// until the receiving side goes away.
pub struct ChatListener {
    ws_url: String,
    token: String,
}

impl ChatListener {
    pub fn new(ws_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            token: token.into(),
        }
    }

    pub async fn run(self, tx: mpsc::Sender<InboundMessage>) {
        loop {
            if tx.is_closed() {
                return;
            }
            match self.run_connection(&tx).await {
                Ok(()) => info!("chat gateway stream closed; reconnecting"),
                Err(err) => warn!("chat gateway stream failed: {err}; reconnecting"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn run_connection(
        &self,
        tx: &mpsc::Sender<InboundMessage>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let url = format!("{}?token={}", self.ws_url, self.token);
        let (ws_stream, _) = connect_async(&url).await?;
        info!("connected to chat gateway");
        let (_, mut reader) = ws_stream.split();

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(frame) if frame.op == "message" => {
                        // The bot's own confirmations come back through the
                        // stream too; do not feed them to the parser.
                        if frame.author_is_bot {
                            continue;
                        }
                        let inbound = InboundMessage {
                            channel: ChannelRef(frame.channel_id),
                            author: frame.author,
                            text: frame.content,
                        };
                        if tx.send(inbound).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!("unparseable gateway frame: {err}"),
                },
                Ok(Message::Close(_)) => return Ok(()),
                Ok(_) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
