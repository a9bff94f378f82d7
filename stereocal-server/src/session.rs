//! Primary intake loop: accepts one capture client at a time and reads its
//! frames.
//!
//! Wire format per frame: a `Sending<SIDE>ImageData:<length>\n` header line
//! followed by exactly `<length>` raw bytes. Status messages back to the
//! client go through a small writer task fed by an mpsc channel, so the
//! completion listener never touches the socket itself.

use std::sync::Arc;

use eyre::{Result, WrapErr};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use stereocal_config_data::IntakeConfig;
use stereocal_types::{parse_frame_header, CALIBRATING_MSG};

use crate::launcher;
use crate::store::{RecordOutcome, Shared};

/// Serially accept and serve client connections, forever. Accept errors are
/// logged and the loop continues.
pub(crate) async fn run_intake_loop(
    listener: tokio::net::TcpListener,
    shared: Arc<Shared>,
    cfg: IntakeConfig,
) -> Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("error accepting connection: {e}");
                continue;
            }
        };
        info!("connected with {addr}");
        if let Err(e) = run_session(stream, &shared, &cfg).await {
            warn!("session error: {e:#}");
        }
        info!("connection closed, awaiting new connection");
    }
}

async fn run_session(stream: TcpStream, shared: &Arc<Shared>, cfg: &IntakeConfig) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::channel::<&'static str>(4);
    shared.attach_session(tx);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_half.write_all(msg.as_bytes()).await {
                warn!("failed sending {msg:?} to client: {e}");
                break;
            }
        }
    });

    let res = read_frames(BufReader::new(read_half), shared, cfg).await;

    // dropping the session sender ends the writer task
    shared.detach_session();
    let _ = writer.await;
    res
}

/// Read frames from the client until it disconnects or breaks protocol.
/// Returning `Ok` means the connection ended in an expected way; the caller
/// goes back to accepting.
async fn read_frames<R: AsyncBufRead + Unpin>(
    mut reader: R,
    shared: &Arc<Shared>,
    cfg: &IntakeConfig,
) -> Result<()> {
    loop {
        // Bounded wait for pending bytes: an idle client just loops here and
        // must not trip the (much shorter) read timeout below.
        let pending = match timeout(cfg.readiness_poll(), reader.fill_buf()).await {
            Err(_elapsed) => {
                trace!("no data received, checking again");
                continue;
            }
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => return Err(e).wrap_err("waiting for data from client"),
        };
        if pending.is_empty() {
            debug!("connection closed by client");
            return Ok(());
        }

        let line = match timeout(cfg.recv_timeout(), read_header_line(&mut reader)).await {
            Err(_elapsed) => {
                warn!("timeout while receiving the header, closing connection");
                return Ok(());
            }
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                debug!("connection closed by client");
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!("error receiving header ({e}), closing connection");
                return Ok(());
            }
        };

        let header = match parse_frame_header(&line) {
            Ok(header) => header,
            Err(e) => {
                warn!("malformed header {:?} ({e}), closing connection", line.trim_end());
                return Ok(());
            }
        };
        if header.payload_len > cfg.max_frame_bytes {
            warn!(
                "header declares {} payload bytes (limit {}), closing connection",
                header.payload_len, cfg.max_frame_bytes
            );
            return Ok(());
        }

        let mut payload = vec![0u8; header.payload_len];
        match timeout(cfg.recv_timeout(), reader.read_exact(&mut payload)).await {
            Err(_elapsed) => {
                warn!("timeout during {} image reception, frame dropped", header.side);
                continue;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!("received incomplete {} image data", header.side);
                return Ok(());
            }
            Ok(Err(e)) => return Err(e).wrap_err("reading frame payload"),
            Ok(Ok(_)) => {}
        }

        match shared.record_frame(header.side, &payload) {
            Ok(RecordOutcome::Stored {
                quota_reached: true,
                ..
            }) => {
                shared.notify_session(CALIBRATING_MSG);
                launcher::start_calibration(shared, cfg);
            }
            Ok(RecordOutcome::Stored { .. }) | Ok(RecordOutcome::Rejected) => {}
            Err(e) => {
                // the count was not incremented; keep serving the client
                warn!("failed persisting {} frame: {e}", header.side);
            }
        }
    }
}

/// Read one `\n`-terminated header line. `None` on a clean end of stream;
/// an unterminated or non-UTF-8 line is an error.
async fn read_header_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if !buf.ends_with(b"\n") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream ended before header delimiter",
        ));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
