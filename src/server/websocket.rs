use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };

use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls::ServerConfig;
use rustls_pemfile::{ certs, pkcs8_private_keys };

use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use lazy_static::lazy_static;
use url::form_urlencoded;

use futures::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };

use super::api::AppState;
use crate::auth::{ parse_bearer, AuthError, SessionContext };
use crate::cli::Args;
use crate::controller::{ ChatController, TurnOutcome, ViewEvent };
use crate::models::websocket::{ ClientMessage, ServerMessage };

const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

lazy_static! {
    // 10 new connections per second across all peers
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::MIN.saturating_add(9)));
}

impl From<ViewEvent> for ServerMessage {
    fn from(event: ViewEvent) -> Self {
        match event {
            ViewEvent::Reset => ServerMessage::SessionReset,
            ViewEvent::ChatLoaded { chat, messages } => ServerMessage::ChatLoaded { chat, messages },
            ViewEvent::Appended(message) => ServerMessage::Message { message },
            ViewEvent::Reconciled { temp_id, message } => ServerMessage::Reconciled { temp_id, message },
            ViewEvent::Generating(active) => ServerMessage::Generating { active },
            ViewEvent::ProfileSelected(profile) => ServerMessage::ProfileSelected { profile },
            ViewEvent::Error(message) => ServerMessage::Error { message },
        }
    }
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let key = match pkcs8_private_keys(&mut key_reader).next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

fn tls_acceptor(args: &Args) -> Result<Option<TlsAcceptor>, Box<dyn Error + Send + Sync>> {
    if !args.enable_tls {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        return Ok(None);
    }
    match (&args.tls_cert_path, &args.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!("TLS enabled. Loading certificate from '{}' and key from '{}'", cert_path, key_path);
            let config = load_tls_config(cert_path, key_path)?;
            Ok(Some(TlsAcceptor::from(config)))
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
            Err("Missing TLS certificate or key path".into())
        }
        (None, None) => {
            error!("--enable-tls was set but no certificate/key paths provided.");
            Err("TLS enabled without cert/key".into())
        }
    }
}

pub async fn start_ws_server(
    addr: &str,
    state: AppState,
    api_key: Option<String>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let acceptor = tls_acceptor(&args)?;
    let listener = TcpListener::bind(addr).await?;
    let protocol = if acceptor.is_some() { "WSS" } else { "WS" };
    info!("{} server listening on: {}", protocol, addr);
    serve(listener, state, api_key, acceptor).await
}

/// Accepts chat sessions on an already bound listener until it fails.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    api_key: Option<String>,
    acceptor: Option<TlsAcceptor>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let state = state.clone();
        let required_api_key = api_key.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = acceptor {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(peer, tls_stream, state, required_api_key).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, state, required_api_key).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn query_param(req: &Request, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}

/// Checks the server key and pulls the user's access token out of the
/// upgrade request.
fn authorize_handshake(
    req: &Request,
    required_api_key: Option<&str>
) -> Result<String, ErrorResponse> {
    if let Some(required) = required_api_key {
        let provided = header_value(req, "X-API-Key").or_else(|| query_param(req, "api_key"));
        if provided.as_deref() != Some(required) {
            return Err(unauthorized("Unauthorized"));
        }
    }

    query_param(req, "access_token")
        .filter(|t| !t.is_empty())
        .or_else(|| {
            header_value(req, "Authorization").and_then(|v| parse_bearer(&v).map(str::to_owned))
        })
        .ok_or_else(|| unauthorized("Missing access token"))
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    state: AppState,
    required_api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let mut access_token = None;
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        info!("Handshake from {}", peer);
        match authorize_handshake(req, required_api_key.as_deref()) {
            Ok(token) => {
                access_token = Some(token);
                Ok(response)
            }
            Err(resp) => {
                warn!("{}: rejected handshake ({:?})", peer, resp.body());
                Err(resp)
            }
        }
    };

    let mut ws = match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            return Err(Box::new(e));
        }
    };
    let Some(token) = access_token else {
        return Err("handshake accepted without an access token".into());
    };

    let session = match SessionContext::from_token(state.auth.clone(), state.store.clone(), &token).await {
        Ok(session) => session,
        Err(e) => {
            warn!("{}: could not restore session: {}", peer, e);
            let message = match e {
                AuthError::InvalidToken => AuthError::InvalidToken.to_string(),
                _ => "Could not start your session. Please try again.".to_string(),
            };
            let msg = ServerMessage::Error { message };
            ws.send(Message::Text(serde_json::to_string(&msg)?)).await?;
            ws.close(None).await?;
            return Ok(());
        }
    };
    let caller = session.caller().await.ok_or("session restored without a user")?;
    info!("{} authenticated as user {}", peer, caller.user_id);

    let controller = ChatController::new(
        caller,
        state.store.clone(),
        state.generator.clone(),
        &state.default_framework
    );
    handle_connection(peer, ws, controller).await;
    Ok(())
}

/// Runs one chat session: navigation is handled in order, turns run as tasks
/// so the client can switch chats while a reply is generating.
pub async fn handle_connection<S>(peer: SocketAddr, websocket: WebSocketStream<S>, controller: ChatController)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    info!("New WebSocket session: {}", peer);

    let (mut tx, mut rx) = websocket.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ViewEvent>();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let controller = Arc::new(controller.with_events(event_tx));
    if let Err(e) = controller.load_default_profile().await {
        warn!("{}: could not load default business profile: {}", peer, e);
    }

    let writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(event) = event_rx.recv() => ServerMessage::from(event),
                Some(msg) = reply_rx.recv() => msg,
                else => break,
            };
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize message for {}: {}", peer, e);
                    continue;
                }
            };
            if let Err(e) = tx.send(Message::Text(json)).await {
                error!("Error sending message to {}: {}", peer, e);
                break;
            }
        }
    });

    while let Some(msg) = rx.next().await {
        let message = match msg {
            Ok(message) => message,
            Err(e) => {
                error!("Error receiving message from {}: {}", peer, e);
                break;
            }
        };

        if message.len() > MAX_MESSAGE_SIZE {
            warn!("Message from {} exceeds size limit ({} > {})", peer, message.len(), MAX_MESSAGE_SIZE);
            let _ = reply_tx.send(ServerMessage::Error { message: "Message too large".to_string() });
            break;
        }

        match message {
            Message::Text(text) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => dispatch(peer, &controller, &reply_tx, client_msg).await,
                    Err(e) => {
                        error!("Failed to parse message from {}: {}", peer, e);
                        let _ = reply_tx.send(ServerMessage::Error {
                            message: format!("Failed to parse message: {}", e),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Received close frame from {}", peer);
                break;
            }
            Message::Binary(_) => {
                warn!("Ignoring binary frame from {}", peer);
            }
            _ => {}
        }
    }

    // the writer stops once in-flight turns drop their controller handles
    drop(reply_tx);
    drop(controller);
    if let Err(e) = writer.await {
        error!("Writer task for {} failed: {}", peer, e);
    }
    info!("WebSocket session closed: {}", peer);
}

async fn dispatch(
    peer: SocketAddr,
    controller: &Arc<ChatController>,
    replies: &mpsc::UnboundedSender<ServerMessage>,
    msg: ClientMessage
) {
    match msg {
        ClientMessage::OpenChat { chat_id } => {
            if let Err(e) = controller.open_chat(&chat_id).await {
                debug!("{}: open_chat {} failed: {}", peer, chat_id, e);
            }
        }
        ClientMessage::NewChat => controller.new_chat().await,
        ClientMessage::Send { content } => {
            // fix the target before later frames can navigate away
            let target = controller.begin_send().await;
            let controller = Arc::clone(controller);
            tokio::spawn(async move {
                match controller.send_to(target, &content).await {
                    Ok(TurnOutcome::Completed) => debug!("{}: turn completed", peer),
                    Ok(TurnOutcome::Abandoned) => info!("{}: turn abandoned after navigation", peer),
                    Ok(TurnOutcome::Ignored) => debug!("{}: message ignored while generating", peer),
                    Err(e) => warn!("{}: turn failed: {}", peer, e),
                }
            });
        }
        ClientMessage::SelectProfile { profile_id } => {
            if let Err(e) = controller.select_profile(profile_id.as_deref()).await {
                warn!("{}: could not select profile: {}", peer, e);
                let _ = replies.send(ServerMessage::Error { message: "Could not load business profile".to_string() });
            }
        }
        ClientMessage::SelectFramework { framework } => controller.select_framework(&framework).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::builder().uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn token_from_query_or_header() {
        let req = request("/?access_token=abc", &[]);
        assert_eq!(authorize_handshake(&req, None).unwrap(), "abc");

        let req = request("/", &[("Authorization", "Bearer xyz")]);
        assert_eq!(authorize_handshake(&req, None).unwrap(), "xyz");

        let req = request("/", &[]);
        assert_eq!(authorize_handshake(&req, None).unwrap_err().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn server_key_is_checked_first() {
        let req = request("/?access_token=abc", &[]);
        assert!(authorize_handshake(&req, Some("k1")).is_err());

        let req = request("/?access_token=abc&api_key=k1", &[]);
        assert_eq!(authorize_handshake(&req, Some("k1")).unwrap(), "abc");

        let req = request("/?access_token=abc", &[("X-API-Key", "k1")]);
        assert!(authorize_handshake(&req, Some("k1")).is_ok());
    }

    #[test]
    fn view_events_map_to_wire_messages() {
        assert_eq!(ServerMessage::from(ViewEvent::Reset), ServerMessage::SessionReset);
        assert_eq!(
            ServerMessage::from(ViewEvent::Generating(true)),
            ServerMessage::Generating { active: true }
        );
        let json = serde_json::to_value(ServerMessage::from(ViewEvent::Error("boom".into()))).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "error", "message": "boom" }));
        let json = serde_json::to_value(ServerMessage::from(ViewEvent::ProfileSelected(None))).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "profile_selected", "profile": null }));
    }
}
