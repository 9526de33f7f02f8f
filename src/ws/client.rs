//! Node side of the hub link: connect, ping, reconnect with backoff.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::connections::LinkState;
use crate::error::{Error, TransportError};
use crate::router::{Dispatch, NodeRouter, Outbound};
use crate::runtime::NodeRuntime;

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

enum SessionEnd {
    Closed,
    Reload,
}

/// Owns the node's outbound queue across reconnects.
pub struct NodeClient {
    router: Arc<NodeRouter>,
    rx: mpsc::UnboundedReceiver<String>,
    link: LinkState,
    url: String,
    ping_interval: Duration,
}

impl NodeClient {
    pub fn new(rt: Arc<NodeRuntime>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new(rt.node_id(), rt.config.role, tx, Arc::clone(&rt.store));
        let link = LinkState::new(rt.config.reconnect.clone());
        let url = rt.config.hub_ws_url.clone();
        let ping_interval = rt.config.ping_interval;
        Self {
            router: Arc::new(NodeRouter::new(rt, outbound)),
            rx,
            link,
            url,
            ping_interval,
        }
    }

    pub fn router(&self) -> &Arc<NodeRouter> {
        &self.router
    }

    /// Run until the hub asks for a reload. Once the reconnect budget is
    /// spent the node stays up, disconnected, and this never returns.
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            let after_error = match connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    self.link.on_connected();
                    info!(url = %self.url, "Connected to hub");
                    match self.session(socket).await {
                        Ok(SessionEnd::Reload) => return Ok(()),
                        Ok(SessionEnd::Closed) => {
                            info!("Hub closed the connection");
                            false
                        }
                        Err(e) => {
                            warn!(error = %e, "Hub connection failed");
                            true
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Could not reach hub");
                    true
                }
            };
            let delay = match self.link.on_disconnected(after_error) {
                Ok(delay) => delay,
                Err(e) => {
                    error!(url = %self.url, error = %e, "Giving up on hub, staying disconnected");
                    return std::future::pending().await;
                }
            };
            debug!(attempt = self.link.attempts(), delay = ?delay, "Reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    async fn session(&mut self, socket: Socket) -> Result<SessionEnd, Error> {
        let (mut sink, mut stream) = socket.split();
        let outbound = self.router.outbound().clone();
        // The first frame makes the hub ask us to register.
        outbound.ping()?;

        let mut ticker = tokio::time::interval(self.ping_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                Some(frame) = self.rx.recv() => {
                    sink.send(Message::Text(frame.into())).await.map_err(|e| {
                        TransportError::SendFailed {
                            node_id: outbound.node_id().to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                }

                _ = ticker.tick() => {
                    if let Some(since) = self.link.since_last_pong()
                        && since > self.ping_interval * 3
                    {
                        warn!(since = ?since, "No pong from hub");
                    }
                    outbound.ping()?;
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match self.router.handle(text.as_str()).await {
                                Ok(Dispatch::Handled) => {}
                                Ok(Dispatch::Pong) => self.link.record_pong(),
                                Ok(Dispatch::Reload) => return Ok(SessionEnd::Reload),
                                Err(e) => error!(error = %e, "Hub frame failed"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(TransportError::ConnectFailed {
                                url: self.url.clone(),
                                reason: e.to_string(),
                            }
                            .into());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, ReconnectPolicy};
    use crate::task::NodeRole;

    #[tokio::test]
    async fn exhausted_reconnects_keep_the_node_alive() {
        let mut config = NodeConfig::for_role(NodeRole::Processor);
        // Nothing listens on port 1.
        config.hub_ws_url = "ws://127.0.0.1:1/hub/ws".into();
        config.reconnect = ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            error_delay: Duration::from_millis(5),
        };
        let client = NodeClient::new(Arc::new(NodeRuntime::in_memory(config)));

        let outcome = tokio::time::timeout(Duration::from_millis(500), client.run()).await;
        assert!(outcome.is_err(), "run() returned instead of parking: {outcome:?}");
    }
}
