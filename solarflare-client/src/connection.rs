//! WebSocket connection driver
//!
//! Owns the socket to the relay and keeps it alive: frames read from the
//! socket go to the shared [`SolarflareClient`], queued subscribes are
//! written out, and a dropped socket is reopened after a backoff delay.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use solarflare_common::protocol::ClientMessage;

use crate::client::{ChannelTransport, SolarflareClient};
use crate::error::{ClientError, Result};

/// Client shared between the driver task and the application.
///
/// The driver holds the lock while it applies a frame, and subscriber
/// callbacks run inside that section. A callback must not lock the client
/// again; it should only signal the application to read the table later.
pub type SharedClient = Arc<Mutex<SolarflareClient<ChannelTransport>>>;

/// Connection options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relay socket URL, e.g. `ws://localhost:54321`
    pub url: String,
    /// Token sent with every subscribe
    pub jwt: String,
    /// Delays between reconnect attempts; the last one repeats
    pub reconnect_intervals_ms: Vec<u64>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: "ws://localhost:54321".to_string(),
            jwt: String::new(),
            reconnect_intervals_ms: vec![1000, 2000, 4000, 5000],
        }
    }
}

/// Reconnect delay schedule
#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: usize,
    intervals: Vec<u64>,
}

impl Backoff {
    pub fn new(intervals: Vec<u64>) -> Self {
        Self {
            attempts: 0,
            intervals,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .intervals
            .get(self.attempts)
            .or_else(|| self.intervals.last())
            .copied()
            .unwrap_or(5000);
        self.attempts += 1;
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        debug!(?delay, attempt = self.attempts, "Waiting before reconnect");
        sleep(delay).await;
    }
}

/// A running connection to the relay
pub struct Connection {
    client: SharedClient,
    task: JoinHandle<()>,
}

impl Connection {
    /// Spawn the driver task; the socket is opened in the background
    pub fn spawn(options: ClientOptions) -> Self {
        let (transport, outbound) = ChannelTransport::unbounded();
        let client = Arc::new(Mutex::new(SolarflareClient::new(transport, options.jwt)));

        let task = tokio::spawn(drive(
            client.clone(),
            outbound,
            options.url,
            Backoff::new(options.reconnect_intervals_ms),
        ));

        Self { client, task }
    }

    /// Handle to the replica
    pub fn client(&self) -> SharedClient {
        self.client.clone()
    }

    /// Stop the driver and drop the socket
    pub fn close(self) {
        self.task.abort();
    }
}

enum Disconnect {
    /// Socket lost; reconnect
    Lost,
    /// Outbound queue closed; stop
    Shutdown,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open(url: &str) -> Result<Socket> {
    let (socket, _) = connect_async(url).await?;
    Ok(socket)
}

async fn drive(
    client: SharedClient,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    url: String,
    mut backoff: Backoff,
) {
    loop {
        match open(&url).await {
            Ok(socket) => {
                info!(url = %url, "Connected to relay");
                backoff.reset();

                let (mut write, mut read) = socket.split();

                // Re-subscribes every table; anything lost with the previous
                // socket is covered by these.
                let resubscribed = client.lock().on_connected();
                if let Err(e) = resubscribed {
                    error!("Re-subscribe failed: {}", e);
                }

                let reason = loop {
                    tokio::select! {
                        msg = outbound.recv() => {
                            let Some(msg) = msg else {
                                break Disconnect::Shutdown;
                            };
                            let ClientMessage::Subscribe(subscribe) = &msg;
                            let current = client.lock().is_current(subscribe);
                            if !current {
                                debug!(table = %subscribe.table, query_id = %subscribe.query_id, "Superseded subscribe skipped");
                                continue;
                            }
                            let text = match serde_json::to_string(&msg) {
                                Ok(text) => text,
                                Err(e) => {
                                    error!("Unencodable message dropped: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!("Send failed: {}", ClientError::from(e));
                                break Disconnect::Lost;
                            }
                        }
                        frame = read.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let handled = client.lock().handle_frame(&text);
                                    if let Err(e) = handled {
                                        error!("Unreadable frame dropped: {}", e);
                                    }
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    if write.send(Message::Pong(payload)).await.is_err() {
                                        break Disconnect::Lost;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break Disconnect::Lost,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("Socket error: {}", ClientError::from(e));
                                    break Disconnect::Lost;
                                }
                            }
                        }
                    }
                };

                if matches!(reason, Disconnect::Shutdown) {
                    let _ = write.close().await;
                    return;
                }
                warn!(url = %url, "Disconnected from relay");
            }
            Err(e) => {
                warn!(url = %url, "Connect failed: {}", e);
            }
        }

        backoff.wait().await;
    }
}
