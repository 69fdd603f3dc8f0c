use std::{fmt::Display, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use futures::executor;
use futures_util::Future;
use log::{debug, error, info};
use serde::Deserialize;
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_tungstenite::WebSocketStream;

use crate::{
    discovery,
    messages::{
        AgentHelloAckMsgBodyV1, AgentHelloMsgBodyV1, ConnectionClientErrorMsgBodyV1,
        ConnectionClosedMsgBodyV1, ConnectionClosedReasonV1, Message, MessageBody, MessageChannel,
        ObserveSpecV1,
    },
    panel,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_on: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_on: "127.0.0.1:8070".to_string(),
        }
    }
}

pub struct ConnectionListener {
    config: ServerConfig,
    listener: TcpListener,
}

impl ConnectionListener {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.listen_on)
            .await
            .context("Failed to start TCP server")?;
        Ok(Self { listener, config })
    }

    pub async fn listen<F: Future<Output = anyhow::Result<()>> + Send>(
        &self,
        handler: impl Fn(Connection) -> F + Send + Sync + 'static,
    ) {
        info!("Server listening on {}...", self.config.listen_on);

        let handler = Arc::new(handler);

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(val) => val,
                Err(err) => {
                    error!("TCP connection failed: {err:?}");
                    continue;
                }
            };
            let handler_ref = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(err) =
                    Self::handle_connection(addr.to_string(), stream, handler_ref).await
                {
                    error!("Error during connection with {addr}: {err:?}");
                }
            });
        }
    }

    async fn handle_connection<F: Future<Output = anyhow::Result<()>>>(
        name: String,
        stream: TcpStream,
        handler: Arc<impl Fn(Connection) -> F>,
    ) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .context("Failed to accept websocket connection")?;

        handler(Connection::new(name, ws)).await?;

        Ok(())
    }
}

pub struct Connection {
    open: bool,
    name: String,
    hello: Option<AgentHelloMsgBodyV1>,
    channel: MessageChannel<WebSocketStream<TcpStream>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ServerError,
    FrameRejected,
    HandshakeTimeout,
}

impl Connection {
    const HELLO_TIMEOUT: Duration = Duration::from_secs(3);

    pub fn new(name: String, ws: WebSocketStream<TcpStream>) -> Self {
        debug!("Creating connection {name}");
        Self {
            open: true,
            name,
            hello: None,
            channel: MessageChannel::new(ws),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn page_href(&self) -> &str {
        self.hello
            .as_ref()
            .map(|hello| hello.page_href.as_str())
            .unwrap_or("<unknown page>")
    }

    /// Handshake: the agent introduces itself and its page, and the ack
    /// tells it what to observe and which hotkey to register. Agents running
    /// in subframes are turned away; only the top frame gets a panel, and
    /// its observer already covers every node the page will insert.
    pub async fn init(&mut self) -> anyhow::Result<()> {
        debug!("Waiting for hello message on connection {}...", self.name);
        'wait_for_hello: loop {
            match timeout(Self::HELLO_TIMEOUT, self.recv()).await {
                Ok(None) => return Err(anyhow!("Connection closed before the hello message")),
                Ok(Some(Message {
                    body: MessageBody::AgentHelloV1(body),
                    ..
                })) => {
                    if !body.top_frame {
                        self.close(CloseReason::FrameRejected, "Only the top frame is controlled")
                            .await
                            .context("Failed to close subframe connection")?;
                        return Err(anyhow!("Agent attached from a subframe"));
                    }
                    info!(
                        "Agent {} attached on {} ({})",
                        body.agent, self.name, body.page_href
                    );
                    self.hello = Some(body);
                    self.send(Message::new(MessageBody::AgentHelloAckV1(Self::hello_ack())))
                        .await
                        .context("Failed to send hello ack message")?;
                    break 'wait_for_hello;
                }
                Ok(Some(Message { .. })) => self.send_error("Expected hello message").await,
                Err(timeout_err) => {
                    let err = anyhow!(timeout_err).context("Hello message not received in time!");
                    self.close(CloseReason::HandshakeTimeout, &err)
                        .await
                        .context("Failed to close connection after missed handshake")?;
                    return Err(err);
                }
            }
        }
        debug!("Connection {} completed the handshake", self.name);
        Ok(())
    }

    fn hello_ack() -> AgentHelloAckMsgBodyV1 {
        AgentHelloAckMsgBodyV1 {
            observe: ObserveSpecV1 {
                subtree: discovery::OBSERVE_SUBTREE,
                child_list: discovery::OBSERVE_CHILD_LIST,
            },
            hotkey: panel::hotkey(),
        }
    }

    pub async fn send(&mut self, message: Message) -> anyhow::Result<()> {
        self.channel.send(message).await?;
        Ok(())
    }

    pub async fn send_error(&mut self, message: impl Display) {
        let _ = self
            .send(Message::new(MessageBody::ConnectionClientErrorV1(
                ConnectionClientErrorMsgBodyV1 {
                    message: message.to_string(),
                },
            )))
            .await;
    }

    pub async fn recv(&mut self) -> Option<Message> {
        if !self.open {
            return None;
        }
        loop {
            let Some(msg_res) = self.channel.recv().await else {
                self.close_silent().await;
                return None;
            };
            match msg_res {
                Ok(Message {
                    body: MessageBody::AgentKeepaliveV1,
                    ..
                }) => {
                    // do nothing
                }
                Ok(msg) => return Some(msg),
                Err(err) => {
                    debug!(
                        "Received malformed message from agent {}: {err:?}",
                        self.name
                    );
                    self.send_error(err.to_string()).await;
                }
            }
        }
    }

    pub async fn close(
        &mut self,
        reason: CloseReason,
        message: impl Display,
    ) -> anyhow::Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let result = self
            .send(Message::new(MessageBody::ConnectionClosedV1(
                ConnectionClosedMsgBodyV1 {
                    reason: match reason {
                        CloseReason::ServerError => ConnectionClosedReasonV1::ServerError,
                        CloseReason::FrameRejected => ConnectionClosedReasonV1::FrameRejected,
                        CloseReason::HandshakeTimeout => ConnectionClosedReasonV1::HandshakeTimeout,
                    },
                    message: message.to_string(),
                },
            )))
            .await;
        self.close_silent().await;
        result
    }

    async fn close_silent(&mut self) {
        self.open = false;
        if let Err(err) = self.channel.close().await {
            error!("Failed to close websocket {}: {err:?}", self.name);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_open() {
            return;
        }
        let close_future = self.close(CloseReason::ServerError, "Connection terminated");
        if let Err(err) = executor::block_on(close_future) {
            error!("Failed to close connection {} in drop: {err:?}", self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{tungstenite, MaybeTlsStream};

    use super::*;

    type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn accept_one(listener: TcpListener) -> anyhow::Result<String> {
        let (stream, addr) = listener.accept().await?;
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let mut connection = Connection::new(addr.to_string(), ws);
        connection.init().await?;
        let href = connection.page_href().to_string();
        connection
            .close(CloseReason::ServerError, "Connection terminated")
            .await?;
        Ok(href)
    }

    async fn connect_agent(addr: SocketAddr) -> AgentSocket {
        let (agent, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        agent
    }

    async fn send_hello(agent: &mut AgentSocket, top_frame: bool) {
        let hello = Message::new(MessageBody::AgentHelloV1(AgentHelloMsgBodyV1 {
            agent: "presto-agent 0.1.0".to_string(),
            page_href: "https://videos.example/watch?v=1".to_string(),
            top_frame,
        }));
        let encoded = rmp_serde::to_vec(&hello).unwrap();
        agent
            .send(tungstenite::Message::binary(encoded))
            .await
            .unwrap();
    }

    async fn recv_reply(agent: &mut AgentSocket) -> Message {
        loop {
            match agent.next().await.expect("socket closed early").unwrap() {
                tungstenite::Message::Binary(data) => {
                    return rmp_serde::from_slice(&data).unwrap();
                }
                tungstenite::Message::Close(frame) => {
                    panic!("connection closed before a reply: {frame:?}");
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn should_ack_a_top_frame_hello() {
        // given
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_one(listener));

        // when
        let mut agent = connect_agent(addr).await;
        send_hello(&mut agent, true).await;

        // then
        let reply = recv_reply(&mut agent).await;
        let MessageBody::AgentHelloAckV1(ack) = reply.body else {
            panic!("expected a hello ack, got {:?}", reply.body);
        };
        assert!(ack.observe.subtree);
        assert!(ack.observe.child_list);
        assert_eq!(ack.hotkey.code, "KeyS");
        let href = server.await.unwrap().unwrap();
        assert_eq!(href, "https://videos.example/watch?v=1");
    }

    #[tokio::test]
    async fn should_refuse_agents_in_subframes() {
        // given
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_one(listener));

        // when
        let mut agent = connect_agent(addr).await;
        send_hello(&mut agent, false).await;

        // then
        let reply = recv_reply(&mut agent).await;
        let MessageBody::ConnectionClosedV1(notice) = reply.body else {
            panic!("expected a close notice, got {:?}", reply.body);
        };
        assert_eq!(notice.reason, ConnectionClosedReasonV1::FrameRejected);
        assert!(server.await.unwrap().is_err());
    }
}
