use crate::config::NetConfig;
use crate::frame::{Frame, MalformedFrame};
use crate::reduce;
use crate::replica::ReplicaHandle;
use crate::stream::{Sink, StreamItem};
use crate::uuid::Uuid;
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for one end of a channel.
pub fn next_stream_id() -> u64 {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Extract one blank-line-terminated bundle from the read buffer. Stray
/// leading newlines (keepalives) are skipped.
fn take_bundle(buf: &mut BytesMut) -> Result<Option<String>, MalformedFrame> {
    while buf.first() == Some(&b'\n') {
        buf.advance(1);
    }
    let Some(pos) = buf.windows(2).position(|w| w == b"\n\n") else {
        return Ok(None);
    };
    let chunk = buf.split_to(pos + 2);
    match std::str::from_utf8(&chunk) {
        Ok(text) => Ok(Some(text.to_string())),
        Err(_) => Err(MalformedFrame::Utf8),
    }
}

/// Serialize frames from a sink receiver onto the socket, coalescing under a
/// short debounce so bundle boundaries stay meaningful, and emitting a bare
/// newline as keepalive when idle.
async fn write_loop(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::Receiver<StreamItem>,
    debounce: Duration,
    keepalive: Duration,
) -> std::io::Result<()> {
    loop {
        let first = tokio::select! {
            item = rx.recv() => match item {
                Some(Some(frame)) => frame,
                Some(None) | None => break,
            },
            _ = tokio::time::sleep(keepalive) => {
                write.write_all(b"\n").await?;
                continue;
            }
        };
        let mut batch = first.to_text();
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(Some(frame))) => batch.push_str(&frame.to_text()),
                Ok(Some(None)) | Ok(None) => {
                    write.write_all(batch.as_bytes()).await?;
                    return Ok(());
                }
                Err(_) => break,
            }
        }
        write.write_all(batch.as_bytes()).await?;
        write.flush().await?;
    }
    Ok(())
}

/// Read loop shared by both adapter directions; calls `deliver` for every
/// complete frame. Returns when the peer closes, errors, or goes silent for
/// four keepalive intervals.
async fn read_loop<F, Fut>(
    mut read: OwnedReadHalf,
    sink: &Sink,
    keepalive: Duration,
    mut deliver: F,
) -> std::io::Result<()>
where
    F: FnMut(Frame) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut buf = BytesMut::with_capacity(4096);
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    let mut misses = 0u32;
    loop {
        tokio::select! {
            n = read.read_buf(&mut buf) => {
                if n? == 0 {
                    debug!("peer closed the connection");
                    return Ok(());
                }
                misses = 0;
                loop {
                    match take_bundle(&mut buf) {
                        Ok(Some(text)) => match Frame::parse_text(&text) {
                            Ok(frame) if frame.is_empty() => {}
                            Ok(frame) => deliver(frame).await,
                            Err(e) => {
                                // report back; a bad frame does not drop the link
                                warn!("malformed frame: {}", e);
                                sink.update(reduce::error_frame(
                                    Uuid::ZERO,
                                    Uuid::ZERO,
                                    &e.to_string(),
                                ))
                                .await;
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!("undecodable bundle: {}", e);
                            sink.update(reduce::error_frame(
                                Uuid::ZERO,
                                Uuid::ZERO,
                                &e.to_string(),
                            ))
                            .await;
                        }
                    }
                }
            }
            _ = interval.tick() => {
                misses += 1;
                if misses == 2 {
                    warn!("peer stalled, no traffic for {} intervals", misses);
                }
                if misses >= 4 {
                    error!("peer unresponsive, closing the connection");
                    return Ok(());
                }
            }
        }
    }
}

/// Accepts downstream replicas and bridges them onto the replica mailbox.
pub struct Listener {
    handle: ReplicaHandle,
    addr: String,
    config: NetConfig,
}

impl Listener {
    pub fn new(handle: ReplicaHandle, addr: String, config: NetConfig) -> Self {
        Self {
            handle,
            addr,
            config,
        }
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("listening for downstream replicas on {}", self.addr);

        loop {
            let (socket, peer) = listener.accept().await?;
            debug!("downstream connection from {}", peer);

            let handle = self.handle.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_downstream(socket, handle, config).await {
                    error!("downstream connection error from {}: {}", peer, e);
                }
            });
        }
    }
}

async fn serve_downstream(
    socket: TcpStream,
    handle: ReplicaHandle,
    config: NetConfig,
) -> std::io::Result<()> {
    let id = next_stream_id();
    let (sink, rx) = Sink::pair(id, 64);
    let (read, write) = socket.into_split();
    let writer = tokio::spawn(write_loop(
        write,
        rx,
        Duration::from_millis(config.debounce_ms),
        Duration::from_millis(config.keepalive_ms),
    ));

    let result = read_loop(
        read,
        &sink,
        Duration::from_millis(config.keepalive_ms),
        |frame| {
            let handle = handle.clone();
            let sink = sink.clone();
            async move {
                let handshake = frame.ops().iter().any(|op| op.is_on() || op.is_off());
                let sent = if handshake {
                    handle.on(frame, sink).await
                } else {
                    handle.push(frame, Some(sink)).await
                };
                if sent.is_err() {
                    warn!("replica mailbox closed");
                }
            }
        },
    )
    .await;

    // unsubscribe the departed stream everywhere it was registered
    let _ = handle.closed(id).await;
    sink.close().await;
    let _ = writer.await;
    result
}

/// Maintains the upstream link: connects, hands the replica a send path,
/// feeds incoming frames back, and reconnects with exponential backoff.
pub struct Connector {
    handle: ReplicaHandle,
    addr: String,
    config: NetConfig,
}

impl Connector {
    pub fn new(handle: ReplicaHandle, addr: String, config: NetConfig) -> Self {
        Self {
            handle,
            addr,
            config,
        }
    }

    pub async fn run(&self) {
        let min = Duration::from_millis(self.config.backoff_min_ms);
        let max = Duration::from_millis(self.config.backoff_max_ms);
        let mut backoff = min;
        loop {
            match TcpStream::connect(&self.addr).await {
                Ok(socket) => {
                    info!("connected upstream to {}", self.addr);
                    backoff = min;
                    if let Err(e) = self.serve_upstream(socket).await {
                        warn!("upstream connection error: {}", e);
                    }
                    if self.handle.upstream_closed().await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("upstream connect to {} failed: {}", self.addr, e);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max);
        }
    }

    async fn serve_upstream(&self, socket: TcpStream) -> std::io::Result<()> {
        let id = next_stream_id();
        let (sink, rx) = Sink::pair(id, 64);
        let (read, write) = socket.into_split();
        let writer = tokio::spawn(write_loop(
            write,
            rx,
            Duration::from_millis(self.config.debounce_ms),
            Duration::from_millis(self.config.keepalive_ms),
        ));

        // registering triggers the handshake and the re-issued subscriptions
        if self.handle.connect_upstream(sink.clone()).await.is_err() {
            sink.close().await;
            let _ = writer.await;
            return Ok(());
        }

        let handle = &self.handle;
        let result = read_loop(
            read,
            &sink,
            Duration::from_millis(self.config.keepalive_ms),
            |frame| async move {
                if handle.upstream_frame(frame).await.is_err() {
                    warn!("replica mailbox closed");
                }
            },
        )
        .await;

        sink.close().await;
        let _ = writer.await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_bundle_splits_on_blank_line() {
        let mut buf = BytesMut::from(&b"*lww#a@1-X:k\t=1;\n\n*lww#b"[..]);
        let bundle = take_bundle(&mut buf).unwrap().unwrap();
        assert_eq!(bundle, "*lww#a@1-X:k\t=1;\n\n");
        assert_eq!(&buf[..], b"*lww#b");
        assert!(take_bundle(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_take_bundle_skips_keepalive_newlines() {
        let mut buf = BytesMut::from(&b"\n\n\n*lww#a@1-X:k\t=1;\n\n"[..]);
        let bundle = take_bundle(&mut buf).unwrap().unwrap();
        assert!(bundle.starts_with("*lww"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_bundle_rejects_bad_utf8() {
        let mut buf = BytesMut::from(&b"*lww\xff\n\n"[..]);
        assert!(take_bundle(&mut buf).is_err());
    }
}
