//! Connection upgrade and stream pumping.
//!
//! The handler calls [`serve_upgrade`] with the validated request. It
//! negotiates a subprotocol, returns the `101 Switching Protocols` response
//! for axum to send, and spawns the pump that bridges the upgraded socket
//! with in-process duplex streams. All declared streams are backed by the
//! one connection, so "all streams open" reduces to the upgrade itself
//! completing within the creation timeout.

use crate::error::{Result, StreamError};
use crate::protocol::{decode_resize, encode_frame, Channel, FrameDecoder, TerminalSize};
use axum::body::Body;
use axum::http::{header, HeaderMap, Request, Response, StatusCode};
use bytes::Bytes;
use hyper_util::rt::TokioIo;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Protocol version understood by this agent.
pub const PROTOCOL_V1: &str = "channel.kctldbg.v1";

/// Protocols the agent will accept, in preference order.
const SUPPORTED_PROTOCOLS: &[&str] = &[PROTOCOL_V1];

/// Header carrying the client's offered protocols and the server's choice.
const PROTOCOL_HEADER: &str = "x-stream-protocol-version";

/// Buffer size for the in-process duplex streams.
const PIPE_CAPACITY: usize = 32 * 1024;

/// Which streams the session declares. PTY mode is not a wire concern:
/// the framing is identical either way, and stderr is simply not declared
/// when the session runs a PTY.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Operator input requested.
    pub stdin: bool,
    /// Container output requested.
    pub stdout: bool,
    /// Separate error output requested (off under a TTY).
    pub stderr: bool,
}

/// Timeouts applied to the upgraded stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamTimeouts {
    /// Bound between upgrade acceptance and the streams being usable.
    pub creation: Duration,
    /// Bound on the time with no byte flowing in either direction.
    pub idle: Duration,
}

/// The in-process ends of an upgraded debug stream.
///
/// Dropping the stdout/stderr halves ends the write pump, which closes the
/// client connection; cancellation of the session token does the same from
/// the pump side.
pub struct SessionStreams {
    /// Read half of operator input.
    pub stdin: Option<DuplexStream>,
    /// Write half of container output.
    pub stdout: Option<DuplexStream>,
    /// Write half of container error output.
    pub stderr: Option<DuplexStream>,
    /// Terminal resize events, delivered at least once each.
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
    cancel: CancellationToken,
}

impl SessionStreams {
    /// Token cancelled when the client disconnects, a timeout fires, or any
    /// stream pump fails.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Negotiates a subprotocol from the client's offered set.
///
/// # Errors
///
/// [`StreamError::NotAnUpgrade`] when the request does not ask for an
/// upgrade, [`StreamError::ProtocolNegotiation`] when no offered protocol is
/// supported.
pub fn negotiate(headers: &HeaderMap) -> Result<&'static str> {
    let wants_upgrade = headers.get(header::UPGRADE).is_some()
        || headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    if !wants_upgrade {
        return Err(StreamError::NotAnUpgrade);
    }

    let offered: Vec<String> = headers
        .get_all(PROTOCOL_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    SUPPORTED_PROTOCOLS
        .iter()
        .find(|p| offered.iter().any(|o| o == *p))
        .copied()
        .ok_or(StreamError::ProtocolNegotiation(offered))
}

/// Upgrades the request and returns the response to send plus the session's
/// stream ends.
///
/// The pump runs in the background for the lifetime of the connection. The
/// response must be returned to the client for the upgrade to complete.
///
/// # Errors
///
/// Returns an error if negotiation fails or the response cannot be built;
/// failures after the 101 surface through the cancellation token instead.
pub fn serve_upgrade(
    req: &mut Request<Body>,
    opts: StreamOptions,
    timeouts: StreamTimeouts,
) -> Result<(Response<Body>, SessionStreams)> {
    let protocol = negotiate(req.headers())?;

    let cancel = CancellationToken::new();
    let (stdin_session, stdin_pump) = duplex_pair(opts.stdin);
    let (stdout_session, stdout_pump) = duplex_pair(opts.stdout);
    let (stderr_session, stderr_pump) = duplex_pair(opts.stderr);
    let (resize_tx, resize_rx) = mpsc::channel(8);

    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(pump(
        on_upgrade,
        timeouts,
        cancel.clone(),
        stdin_pump,
        stdout_pump,
        stderr_pump,
        resize_tx,
    ));

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "kctldbg")
        .header(PROTOCOL_HEADER, protocol)
        .body(Body::empty())?;

    let streams = SessionStreams {
        stdin: stdin_session,
        stdout: stdout_session,
        stderr: stderr_session,
        resize: Some(resize_rx),
        cancel,
    };
    Ok((response, streams))
}

fn duplex_pair(enabled: bool) -> (Option<DuplexStream>, Option<DuplexStream>) {
    if enabled {
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        (Some(a), Some(b))
    } else {
        (None, None)
    }
}

fn touch(activity: &Arc<Mutex<Instant>>) {
    if let Ok(mut t) = activity.lock() {
        *t = Instant::now();
    }
}

/// Bridges the upgraded socket with the session's duplex ends.
async fn pump(
    on_upgrade: hyper::upgrade::OnUpgrade,
    timeouts: StreamTimeouts,
    cancel: CancellationToken,
    stdin_pump: Option<DuplexStream>,
    stdout_pump: Option<DuplexStream>,
    stderr_pump: Option<DuplexStream>,
    resize_tx: mpsc::Sender<TerminalSize>,
) {
    let upgraded = match tokio::time::timeout(timeouts.creation, on_upgrade).await {
        Ok(Ok(upgraded)) => upgraded,
        Ok(Err(e)) => {
            warn!("connection upgrade failed: {e}");
            cancel.cancel();
            return;
        }
        Err(_) => {
            warn!(
                timeout = ?timeouts.creation,
                "stream creation timed out waiting for the upgraded connection"
            );
            cancel.cancel();
            return;
        }
    };

    let (socket_rd, socket_wr) = tokio::io::split(TokioIo::new(upgraded));
    let activity = Arc::new(Mutex::new(Instant::now()));

    // Outbound frames funnel through one writer to keep byte order.
    let (out_tx, out_rx) = mpsc::channel::<(Channel, Bytes)>(32);
    if let Some(stdout) = stdout_pump {
        tokio::spawn(pump_output(
            stdout,
            Channel::Stdout,
            out_tx.clone(),
            cancel.clone(),
        ));
    }
    if let Some(stderr) = stderr_pump {
        tokio::spawn(pump_output(
            stderr,
            Channel::Stderr,
            out_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(out_tx);

    tokio::spawn(write_frames(
        socket_wr,
        out_rx,
        Arc::clone(&activity),
        cancel.clone(),
    ));
    tokio::spawn(idle_watchdog(
        timeouts.idle,
        Arc::clone(&activity),
        cancel.clone(),
    ));

    read_frames(socket_rd, stdin_pump, resize_tx, activity, cancel).await;
}

/// Reads one session output stream and forwards it as frames.
async fn pump_output(
    mut source: DuplexStream,
    channel: Channel,
    out_tx: mpsc::Sender<(Channel, Bytes)>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; PIPE_CAPACITY];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            read = source.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx
                        .send((channel, Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            },
        }
    }
}

/// Serializes outbound frames onto the socket.
async fn write_frames(
    mut socket_wr: WriteHalf<TokioIo<hyper::upgrade::Upgraded>>,
    mut out_rx: mpsc::Receiver<(Channel, Bytes)>,
    activity: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = out_rx.recv() => match frame {
                None => break,
                Some((channel, data)) => {
                    if socket_wr.write_all(&encode_frame(channel, &data)).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                    touch(&activity);
                }
            },
        }
    }
    let _ = socket_wr.shutdown().await;
}

/// Demultiplexes inbound frames into stdin bytes and resize events.
async fn read_frames(
    mut socket_rd: ReadHalf<TokioIo<hyper::upgrade::Upgraded>>,
    mut stdin_pump: Option<DuplexStream>,
    resize_tx: mpsc::Sender<TerminalSize>,
    activity: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; PIPE_CAPACITY];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            read = socket_rd.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("client closed the debug stream");
                        cancel.cancel();
                        break;
                    }
                    Ok(n) => {
                        touch(&activity);
                        decoder.extend(&buf[..n]);
                        while let Some((channel, payload)) = decoder.next_frame() {
                            dispatch_frame(channel, &payload, &mut stdin_pump, &resize_tx).await;
                        }
                    }
                    Err(e) => {
                        debug!("debug stream read failed: {e}");
                        cancel.cancel();
                        break;
                    }
                }
            },
        }
    }
}

async fn dispatch_frame(
    channel: Channel,
    payload: &Bytes,
    stdin_pump: &mut Option<DuplexStream>,
    resize_tx: &mpsc::Sender<TerminalSize>,
) {
    match channel {
        Channel::Stdin => {
            if payload.is_empty() {
                // Half-close: EOF the session's stdin, keep reading resizes.
                if let Some(mut w) = stdin_pump.take() {
                    let _ = w.shutdown().await;
                }
            } else if let Some(w) = stdin_pump.as_mut() {
                if w.write_all(payload).await.is_err() {
                    stdin_pump.take();
                }
            }
        }
        Channel::Resize => {
            if let Some(size) = decode_resize(payload) {
                let _ = resize_tx.send(size).await;
            }
        }
        // Server-to-client channels are ignored inbound.
        Channel::Stdout | Channel::Stderr => {}
    }
}

/// Closes the session once no byte has flowed for the idle timeout.
async fn idle_watchdog(
    idle: Duration,
    activity: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                let last = activity.lock().map(|t| *t).unwrap_or_else(|_| Instant::now());
                if last.elapsed() > idle {
                    info!(timeout = ?idle, "debug stream idle timeout, closing session");
                    cancel.cancel();
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn upgrade_headers(protocols: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("kctldbg"));
        for p in protocols {
            headers.append(PROTOCOL_HEADER, HeaderValue::from_str(p).unwrap());
        }
        headers
    }

    #[test]
    fn test_negotiate_picks_supported_protocol() {
        let headers = upgrade_headers(&["bogus.v2", PROTOCOL_V1]);
        assert_eq!(negotiate(&headers).unwrap(), PROTOCOL_V1);
    }

    #[test]
    fn test_negotiate_comma_separated_offer() {
        let headers = upgrade_headers(&["bogus.v2, channel.kctldbg.v1"]);
        assert_eq!(negotiate(&headers).unwrap(), PROTOCOL_V1);
    }

    #[test]
    fn test_negotiate_rejects_unknown_protocols() {
        let headers = upgrade_headers(&["bogus.v2"]);
        match negotiate(&headers) {
            Err(StreamError::ProtocolNegotiation(offered)) => {
                assert_eq!(offered, vec!["bogus.v2".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_negotiate_requires_upgrade_request() {
        let mut headers = HeaderMap::new();
        headers.insert(
            PROTOCOL_HEADER,
            HeaderValue::from_static(PROTOCOL_V1),
        );
        assert!(matches!(
            negotiate(&headers),
            Err(StreamError::NotAnUpgrade)
        ));
    }
}
