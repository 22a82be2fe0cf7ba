//! MJPEG viewer over plain HTTP.
//!
//! Every client gets its own task pulling the latest frame from the bus.

use crate::bus::{Frame, StateBus};
use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const JPEG_QUALITY: u8 = 85;
pub const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const ACCEPT_POLL: Duration = Duration::from_millis(100);
/// Time a client gets to send its request line and headers.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Face Tracker</title>
    <style>
        * { margin: 0; padding: 0; }
        body {
            background: #000;
            height: 100vh;
            display: flex;
            align-items: center;
            justify-content: center;
        }
        img {
            max-width: 100vw;
            max-height: 100vh;
            object-fit: contain;
        }
    </style>
</head>
<body>
    <img src="/stream" alt="Stream">
</body>
</html>"#;

pub struct StreamServer {
    listener: TcpListener,
    bus: Arc<StateBus>,
    request_timeout: Duration,
}

impl StreamServer {
    pub async fn bind(addr: &str, bus: Arc<StateBus>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            bus,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept viewers until the running flag clears.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "web server listening");
        }
        while self.bus.is_running() {
            let accepted = match tokio::time::timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
            match accepted {
                Ok((socket, addr)) => {
                    let bus = self.bus.clone();
                    let request_timeout = self.request_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, bus, request_timeout).await {
                            tracing::debug!(%addr, error = %e, "viewer disconnected");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept error"),
            }
        }
        tracing::info!("web server stopped");
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    bus: Arc<StateBus>,
    request_timeout: Duration,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.split();
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    let request = async {
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(false); // EOF
        }
        // Headers are not used, just consume them.
        let mut header = String::new();
        loop {
            header.clear();
            if reader.read_line(&mut header).await? == 0 || header.trim().is_empty() {
                return Ok(true);
            }
        }
    };
    match tokio::time::timeout(request_timeout, request).await {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no request received",
            ))
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default();

    match (method, path) {
        ("GET", "/") => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                INDEX_HTML.len()
            );
            writer.write_all(head.as_bytes()).await?;
            writer.write_all(INDEX_HTML.as_bytes()).await?;
            writer.flush().await
        }
        ("GET", "/stream") => stream_frames(&mut writer, bus).await,
        _ => {
            writer
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
            writer.flush().await
        }
    }
}

/// Write multipart JPEG parts until the bus stops or the client goes away.
async fn stream_frames<W>(writer: &mut W, bus: Arc<StateBus>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        )
        .await?;

    while bus.is_running() {
        // Copying and encoding a frame is CPU work, keep it off the executor.
        let frame_bus = bus.clone();
        let encoded = tokio::task::spawn_blocking(move || {
            frame_bus
                .frame()
                .map(|frame| encode_jpeg(&frame, JPEG_QUALITY))
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        if let Some(encoded) = encoded {
            match encoded {
                Ok(jpeg) => {
                    writer
                        .write_all(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n")
                        .await?;
                    writer.write_all(&jpeg).await?;
                    writer.write_all(b"\r\n").await?;
                    writer.flush().await?;
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode frame"),
            }
        }
        tokio::time::sleep(FRAME_INTERVAL).await;
    }
    Ok(())
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(frame)
        .map_err(|e| Error::Camera(format!("jpeg encode failed: {}", e)))?;
    Ok(buf)
}
