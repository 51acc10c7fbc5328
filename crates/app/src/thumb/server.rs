//! Actix Web server streaming the annotated preview as multipart JPEG.
//!
//! The server runs on a dedicated thread with its own actix system so the
//! pipeline tick never touches the HTTP runtime. Each viewer connection owns a
//! cursor into the shared [`FrameCache`] and awaits new frames as a task on
//! its worker, so a parked or stalled viewer holds no thread and a dropped
//! connection cancels its wait.

use std::{sync::Arc, thread, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::thumb::{
    frame_cache::{FrameCache, FrameWait},
    telemetry,
};

/// How long one viewer wait parks before looping.
pub(crate) const VIEWER_WAIT_TIMEOUT: Duration = Duration::from_millis(1_500);
const BOUNDARY: &str = "frame";

/// Shared state backing HTTP handlers.
struct ServerState {
    cache: Arc<FrameCache>,
}

/// Handle for the stream server thread.
pub(crate) struct StreamServer {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamServer {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and block until the server thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Stream server thread panicked");
            }
        }
    }
}

/// Bind the stream server on `port` (0 picks a free port) and serve until stopped.
pub(crate) fn spawn_stream_server(cache: Arc<FrameCache>, port: u16) -> Result<StreamServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u16, String>>(1);
    let state = web::Data::new(ServerState { cache });

    let handle = telemetry::spawn_thread("thumb-stream-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(state.clone())
                    .route("/", web::get().to(stream_handler))
                    .route("/stream", web::get().to(stream_handler))
                    .route("/metrics", web::get().to(metrics_handler))
                    .default_service(web::to(not_found))
            })
            .shutdown_timeout(2)
            .bind(("0.0.0.0", port));

            let server = match server {
                Ok(server) => server,
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return Ok(());
                }
            };
            let bound = server
                .addrs()
                .first()
                .map(|addr| addr.port())
                .unwrap_or(port);
            let server = server.run();
            let _ = ready_tx.send(Ok(bound));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("Stream server error: {err}");
        }
    })
    .context("Failed to spawn stream server thread")?;

    match ready_rx.recv() {
        Ok(Ok(bound)) => {
            info!("MJPEG stream ready at http://0.0.0.0:{bound}/stream");
            Ok(StreamServer {
                port: bound,
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(reason)) => {
            let _ = handle.join();
            Err(anyhow!("Failed to bind stream server on port {port}: {reason}"))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("Stream server thread exited before binding"))
        }
    }
}

/// Frame one JPEG as a multipart chunk.
pub(crate) fn encode_chunk(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut payload = Vec::with_capacity(head.len() + jpeg.len() + 2);
    payload.extend_from_slice(head.as_bytes());
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

/// Last frame sequence delivered to one viewer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ViewerCursor {
    last_seen: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ViewerPoll {
    Chunk(Bytes),
    Idle,
    Closed,
}

impl ViewerCursor {
    pub(crate) async fn poll(&mut self, cache: &FrameCache, timeout: Duration) -> ViewerPoll {
        match cache.wait_for_frame(self.last_seen, timeout).await {
            FrameWait::Frame { bytes, sequence } => {
                self.last_seen = Some(sequence);
                ViewerPoll::Chunk(encode_chunk(&bytes))
            }
            FrameWait::Timeout => ViewerPoll::Idle,
            FrameWait::Closed => ViewerPoll::Closed,
        }
    }
}

/// Tracks the connected-viewer gauge for the lifetime of one stream.
struct ViewerGuard;

impl ViewerGuard {
    fn connect() -> Self {
        metrics::gauge!("thumb_stream_viewers").increment(1.0);
        metrics::counter!("thumb_stream_connections_total").increment(1);
        debug!("Stream viewer connected");
        Self
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        metrics::gauge!("thumb_stream_viewers").decrement(1.0);
        debug!("Stream client disconnected");
    }
}

/// Stream the latest frames to one viewer until it disconnects or the cache closes.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let cache = state.cache.clone();
    let stream = stream! {
        let _viewer = ViewerGuard::connect();
        let mut cursor = ViewerCursor::default();
        loop {
            match cursor.poll(&cache, VIEWER_WAIT_TIMEOUT).await {
                ViewerPoll::Chunk(chunk) => {
                    yield Ok::<Bytes, actix_web::Error>(chunk);
                }
                ViewerPoll::Idle => continue,
                ViewerPoll::Closed => break,
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::AGE, "0"))
        .insert_header((header::CACHE_CONTROL, "no-cache, private"))
        .insert_header((header::PRAGMA, "no-cache"))
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        ))
        .streaming(stream)
}

/// Render Prometheus metrics.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().finish()
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream,
        time::Instant,
    };

    use super::*;

    fn read_until(stream: &mut TcpStream, needle: &[u8], limit: Duration) -> Vec<u8> {
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let deadline = Instant::now() + limit;
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            if received.windows(needle.len()).any(|w| w == needle) {
                break;
            }
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(_) => continue,
            }
        }
        received
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn chunk_is_length_prefixed_and_delimited() {
        let chunk = encode_chunk(b"abc");
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\nabc\r\n"
        );
    }

    #[actix_web::test]
    async fn cursor_advances_and_idles() {
        let cache = FrameCache::new();
        let mut cursor = ViewerCursor::default();
        assert_eq!(cursor.poll(&cache, Duration::from_millis(10)).await, ViewerPoll::Idle);

        cache.update(b"one".to_vec());
        assert_eq!(
            cursor.poll(&cache, Duration::from_millis(10)).await,
            ViewerPoll::Chunk(encode_chunk(b"one"))
        );
        assert_eq!(cursor.poll(&cache, Duration::from_millis(10)).await, ViewerPoll::Idle);

        cache.update(b"two".to_vec());
        cache.update(b"three".to_vec());
        assert_eq!(
            cursor.poll(&cache, Duration::from_millis(10)).await,
            ViewerPoll::Chunk(encode_chunk(b"three"))
        );

        cache.close();
        assert_eq!(cursor.poll(&cache, Duration::from_millis(10)).await, ViewerPoll::Closed);
    }

    #[test]
    fn serves_multipart_stream_to_independent_viewers() {
        let cache = Arc::new(FrameCache::new());
        cache.update(b"JPEGDATA".to_vec());
        let server = spawn_stream_server(cache.clone(), 0).unwrap();

        let mut viewers: Vec<TcpStream> = ["/stream", "/"]
            .iter()
            .map(|path| {
                let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
                write!(stream, "GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
                stream
            })
            .collect();

        for viewer in &mut viewers {
            let received = read_until(viewer, b"JPEGDATA", Duration::from_secs(5));
            assert!(contains(&received, b"200 OK"));
            assert!(contains(&received, b"multipart/x-mixed-replace; boundary=frame"));
            assert!(contains(&received, b"Content-Length: 8\r\n\r\nJPEGDATA"));
        }

        cache.update(b"NEXTFRAME".to_vec());
        for viewer in &mut viewers {
            let received = read_until(viewer, b"NEXTFRAME", Duration::from_secs(5));
            assert!(contains(&received, b"NEXTFRAME"));
        }

        cache.close();
        server.stop();
    }

    #[test]
    fn parked_viewers_do_not_starve_new_connections() {
        let cache = Arc::new(FrameCache::new());
        let first = cache.update(b"FIRST".to_vec());
        let server = spawn_stream_server(cache.clone(), 0).unwrap();

        // Viewers that connect and never read stay parked on the cache.
        let parked: Vec<TcpStream> = (0..64)
            .map(|_| {
                let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
                write!(stream, "GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
                stream
            })
            .collect();
        std::thread::sleep(Duration::from_millis(100));
        drop(parked);

        let mut fresh = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        write!(fresh, "GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let received = read_until(&mut fresh, b"FIRST", Duration::from_secs(5));
        assert!(contains(&received, b"Content-Length: 5\r\n\r\nFIRST"));
        assert_eq!(cache.sequence(), first);

        cache.close();
        server.stop();
    }

    #[test]
    fn unknown_path_is_not_found() {
        let cache = Arc::new(FrameCache::new());
        let server = spawn_stream_server(cache.clone(), 0).unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        write!(
            stream,
            "GET /nope HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let received = read_until(&mut stream, b"404", Duration::from_secs(5));
        assert!(contains(&received, b"404"));
        cache.close();
        server.stop();
    }
}
