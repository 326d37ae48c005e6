//! Serial-port device link
//!
//! The device log arrives on a serial port. Flashing and credential
//! provisioning are delegated to external commands configured in
//! [`LinkSettings`].

use super::{
    Connection, Credentials, DeviceLink, DeviceLog, LinkError, LinkEvent, LinkSession,
    EVENT_CHANNEL_CAPACITY,
};
use crate::config::LinkSettings;
use crate::core::shell::{render, run_captured};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest accepted log line in bytes
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Newline-delimited device log codec.
///
/// A line longer than [`MAX_LINE_LENGTH`] is cut to that length and the rest
/// of it is skipped up to the next newline, so an overlong line never puts
/// the stream into an error state.
#[derive(Debug)]
pub struct DeviceLineCodec {
    inner: AnyDelimiterCodec,
    max_length: usize,
}

impl DeviceLineCodec {
    /// Codec accepting lines of up to `max_length` bytes
    pub fn new(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length),
            max_length,
        }
    }

    fn truncate(
        &self,
        buf: &BytesMut,
        decoded: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Bytes>, AnyDelimiterCodecError> {
        match decoded {
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                warn!(max_length = self.max_length, "device line too long, truncating");
                let keep = self.max_length.min(buf.len());
                Ok(Some(Bytes::copy_from_slice(&buf[..keep])))
            }
            other => other,
        }
    }
}

impl Default for DeviceLineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_LENGTH)
    }
}

impl Decoder for DeviceLineCodec {
    type Item = Bytes;
    type Error = AnyDelimiterCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        let decoded = self.inner.decode(buf);
        self.truncate(buf, decoded)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        let decoded = self.inner.decode_eof(buf);
        self.truncate(buf, decoded)
    }
}

/// Read lines from `reader` until it ends, goes quiet for `read_timeout`, or
/// `cancel` fires.
///
/// Every line is appended to `log` before being forwarded as
/// [`LinkEvent::Line`]; the task always finishes by sending one
/// [`LinkEvent::End`]. Forwarding stops silently once the receiver is gone,
/// logging does not.
pub fn spawn_line_reader<R>(
    reader: R,
    log: DeviceLog,
    tx: mpsc::Sender<LinkEvent>,
    read_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut frames = FramedRead::new(reader, DeviceLineCodec::default());

        let end = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    break LinkEvent::End { reason: "closed by host".to_string(), timeout: false };
                }
                next = tokio::time::timeout(read_timeout, frames.next()) => match next {
                    Err(_) => {
                        break LinkEvent::End {
                            reason: format!("no data for {} seconds", read_timeout.as_secs()),
                            timeout: true,
                        };
                    }
                    Ok(None) => {
                        break LinkEvent::End { reason: "stream closed".to_string(), timeout: false };
                    }
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "device stream read failed");
                        break LinkEvent::End { reason: e.to_string(), timeout: false };
                    }
                    Ok(Some(Ok(frame))) => {
                        let line = String::from_utf8_lossy(&frame).trim_end_matches('\r').to_string();
                        log.push(line.clone());
                        if !tx.is_closed() {
                            let _ = tx.send(LinkEvent::Line(line)).await;
                        }
                    }
                }
            }
        };

        debug!(?end, "device stream finished");
        let _ = tx.send(end).await;
    })
}

/// Connection over a serial port
pub struct SerialConnection {
    port: String,
    open: AtomicBool,
    cancel: CancellationToken,
}

impl SerialConnection {
    fn new(port: &str, cancel: CancellationToken) -> Self {
        Self {
            port: port.to_string(),
            open: AtomicBool::new(true),
            cancel,
        }
    }
}

#[async_trait]
impl Connection for SerialConnection {
    async fn end(&self) -> Result<(), LinkError> {
        if self.open.swap(false, Ordering::AcqRel) {
            info!(port = %self.port, "closing device connection");
            self.cancel.cancel();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn info(&self) -> String {
        self.port.clone()
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Device link backed by a serial port and external flashing tools
pub struct SerialLink {
    settings: LinkSettings,
    device_id: String,
}

impl SerialLink {
    /// Create a link for one device
    pub fn new(settings: LinkSettings, device_id: &str) -> Self {
        Self {
            settings,
            device_id: device_id.to_string(),
        }
    }

    async fn flash_image(&self, device_id: &str, hexfile: &Path) -> Result<Vec<String>, LinkError> {
        let image = hexfile.display().to_string();
        let cmd = render(
            &self.settings.flash_command,
            &[("hexfile", image.as_str()), ("device", device_id)],
        );
        debug!(device = %device_id, %cmd, "flashing");

        let output = run_captured(&cmd, None).await?;
        if output.success() {
            Ok(output.lines)
        } else {
            Err(LinkError::Flash {
                hexfile: hexfile.to_path_buf(),
                message: format!(
                    "exit code {:?}: {}",
                    output.code,
                    output.lines.last().map_or("", String::as_str)
                ),
            })
        }
    }

    fn open_port(&self) -> Result<tokio_serial::SerialStream, LinkError> {
        let port = &self.settings.port;
        tokio_serial::new(port, self.settings.baud_rate)
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => LinkError::PortNotFound(port.clone()),
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    LinkError::PermissionDenied(port.clone())
                }
                _ => LinkError::ConnectionFailed(e.to_string()),
            })
    }
}

#[async_trait]
impl DeviceLink for SerialLink {
    async fn connect(&self, device_id: &str, at_host: &Path) -> Result<LinkSession, LinkError> {
        info!(device = %device_id, image = %at_host.display(), "flashing AT host");
        self.flash_image(device_id, at_host).await?;

        let stream = self.open_port()?;
        info!(device = %device_id, port = %self.settings.port, baud = self.settings.baud_rate, "connected");

        let device_log = DeviceLog::new();
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        spawn_line_reader(
            stream,
            device_log.clone(),
            tx,
            Duration::from_secs(self.settings.read_timeout_seconds),
            cancel.clone(),
        );

        Ok(LinkSession {
            connection: Arc::new(SerialConnection::new(&self.settings.port, cancel)),
            device_log,
            events,
        })
    }

    async fn flash_credentials(
        &self,
        credentials: &Credentials,
        connection: &dyn Connection,
    ) -> Result<(), LinkError> {
        if !connection.is_open() {
            return Err(LinkError::NotConnected);
        }
        let template = self
            .settings
            .credentials_command
            .as_deref()
            .ok_or_else(|| LinkError::Credentials("no credentials command configured".to_string()))?;

        let port = connection.info();
        let cmd = render(
            template,
            &[("device", self.device_id.as_str()), ("port", port.as_str())],
        );
        let payload = serde_json::to_string(credentials)
            .map_err(|e| LinkError::Credentials(e.to_string()))?;

        let output = run_captured(&cmd, Some(&payload)).await?;
        for line in &output.lines {
            debug!(device = %self.device_id, "{}", line);
        }
        if output.success() {
            Ok(())
        } else {
            Err(LinkError::Credentials(format!(
                "provisioning command exited with {:?}",
                output.code
            )))
        }
    }

    async fn flash(&self, hexfile: &Path) -> Result<Vec<String>, LinkError> {
        self.flash_image(&self.device_id, hexfile).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    async fn drain(mut rx: mpsc::Receiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let end = matches!(event, LinkEvent::End { .. });
            events.push(event);
            if end {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_reader_splits_lines_and_logs() {
        let mock = Builder::new()
            .read(b"*** Booting ***\r\nmodem ")
            .read(b"ready\n")
            .build();
        let log = DeviceLog::new();
        let (tx, rx) = mpsc::channel(16);

        spawn_line_reader(mock, log.clone(), tx, Duration::from_secs(5), CancellationToken::new());
        let events = drain(rx).await;

        assert_eq!(
            events,
            vec![
                LinkEvent::Line("*** Booting ***".to_string()),
                LinkEvent::Line("modem ready".to_string()),
                LinkEvent::End { reason: "stream closed".to_string(), timeout: false },
            ]
        );
        assert_eq!(log.snapshot(), vec!["*** Booting ***", "modem ready"]);
    }

    #[test]
    fn test_codec_truncates_long_line() {
        let mut codec = DeviceLineCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789abcdef\nok\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"01234567")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"ok")));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_keeps_going_after_oversized_line() {
        let garbage = vec![b'x'; MAX_LINE_LENGTH + 3_616];
        let mock = Builder::new()
            .read(&garbage)
            .read(b"\r\ndone\r\n")
            .build();
        let log = DeviceLog::new();
        let (tx, rx) = mpsc::channel(16);

        spawn_line_reader(mock, log.clone(), tx, Duration::from_secs(5), CancellationToken::new());
        let events = drain(rx).await;

        let truncated = "x".repeat(MAX_LINE_LENGTH);
        assert_eq!(
            events,
            vec![
                LinkEvent::Line(truncated.clone()),
                LinkEvent::Line("done".to_string()),
                LinkEvent::End { reason: "stream closed".to_string(), timeout: false },
            ]
        );
        assert_eq!(log.snapshot(), vec![truncated, "done".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_reports_read_timeout() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(16);

        spawn_line_reader(reader, DeviceLog::new(), tx, Duration::from_secs(30), CancellationToken::new());
        let events = drain(rx).await;

        assert!(matches!(events.as_slice(), [LinkEvent::End { timeout: true, .. }]));
    }

    #[tokio::test]
    async fn test_connection_end_stops_reader() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let connection = SerialConnection::new("/dev/null", cancel.clone());

        let handle = spawn_line_reader(reader, DeviceLog::new(), tx, Duration::from_secs(60), cancel);
        connection.end().await.unwrap();
        connection.end().await.unwrap();
        assert!(!connection.is_open());

        let events = drain(rx).await;
        assert!(matches!(events.as_slice(), [LinkEvent::End { timeout: false, .. }]));
        handle.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_flash_command_failure() {
        let settings = LinkSettings {
            flash_command: "echo flashing {hexfile} on {device}; exit 2".to_string(),
            ..Default::default()
        };
        let link = SerialLink::new(settings, "960123");
        let err = link.flash(Path::new("app.hex")).await.unwrap_err();
        match err {
            LinkError::Flash { hexfile, message } => {
                assert_eq!(hexfile, Path::new("app.hex"));
                assert!(message.contains("flashing app.hex on 960123"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_flash_returns_log() {
        let settings = LinkSettings {
            flash_command: "echo Parsing image file.; echo Verified OK.".to_string(),
            ..Default::default()
        };
        let link = SerialLink::new(settings, "960123");
        let log = link.flash(Path::new("app.hex")).await.unwrap();
        assert_eq!(log, vec!["Parsing image file.", "Verified OK."]);
    }
}
