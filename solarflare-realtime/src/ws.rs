//! Socket endpoint
//!
//! Upgrades `GET /` (and `/ws`) to a WebSocket and bridges it to the
//! [`RelayServer`]: inbound text frames are parsed as client messages,
//! outbound frames are drained from the connection's outbox. Each subscribe
//! runs in its own task so a slow bootstrap read never stalls the socket.

use std::sync::Arc;

use actix_web::{middleware, web, App, Error, HttpRequest, HttpResponse, HttpServer};
use actix_ws::{Message, MessageStream, Session};
use futures::StreamExt;
use tracing::{debug, error, info};

use solarflare_common::error::Result;

use crate::server::RelayServer;

/// HTTP server hosting the socket endpoint
pub struct SocketServer {
    server: Arc<RelayServer>,
    bind_address: String,
}

impl SocketServer {
    pub fn new(server: Arc<RelayServer>, bind_address: impl Into<String>) -> Self {
        Self {
            server,
            bind_address: bind_address.into(),
        }
    }

    /// Run the socket server until it stops
    pub async fn run(&self) -> Result<()> {
        let server = self.server.clone();
        info!("Starting socket server on {}", self.bind_address);

        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(server.clone()))
                .wrap(middleware::Logger::default())
                .route("/health", web::get().to(health_handler))
                .route("/", web::get().to(socket_handler))
                .route("/ws", web::get().to(socket_handler))
        })
        .bind(&self.bind_address)?
        .run()
        .await?;

        Ok(())
    }
}

/// Liveness probe
pub async fn health_handler(server: web::Data<Arc<RelayServer>>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "solarflared",
        "version": env!("CARGO_PKG_VERSION"),
        "tables": server.registry().len(),
        "connections": server.channels().connection_count(),
    }))
}

/// Upgrade to a WebSocket and hand the session to its own task
pub async fn socket_handler(
    req: HttpRequest,
    stream: web::Payload,
    server: web::Data<Arc<RelayServer>>,
) -> std::result::Result<HttpResponse, Error> {
    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;
    let server = server.get_ref().clone();

    actix_web::rt::spawn(handle_socket(server, session, msg_stream));

    Ok(response)
}

async fn handle_socket(server: Arc<RelayServer>, mut session: Session, mut msg_stream: MessageStream) {
    let (id, mut outbox) = server.connect();
    debug!(connection = %id, "Socket connected");

    loop {
        tokio::select! {
            msg = msg_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let server = server.clone();
                        let text = text.to_string();
                        actix_web::rt::spawn(async move {
                            server.handle_text(id, &text).await;
                        });
                    }
                    Some(Ok(Message::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(reason))) => {
                        debug!(connection = %id, ?reason, "Client closed socket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(connection = %id, "Socket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }

            frame = outbox.recv() => {
                match frame {
                    Some(frame) => {
                        if session.text(frame.to_string()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    server.disconnect(id);
    let _ = session.close(None).await;
    debug!(connection = %id, "Socket disconnected");
}
