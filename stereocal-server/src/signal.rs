//! Completion listener: a second, long-lived endpoint on which the external
//! calibration job announces that it finished.
//!
//! Any non-empty payload on an accepted connection counts as the completion
//! signal; its content is logged but not otherwise interpreted.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use stereocal_types::CALIBRATED_MSG;

use crate::store::Shared;

pub(crate) async fn run_signal_listener(listener: tokio::net::TcpListener, shared: Arc<Shared>) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("error accepting signal connection: {e}");
                continue;
            }
        };
        debug!("signal connection from {addr}");
        match read_signal(&mut stream).await {
            Ok(Some(payload)) => {
                info!(
                    "calibration completion signal: {:?}",
                    String::from_utf8_lossy(&payload)
                );
                if shared.complete_run() {
                    shared.notify_session(CALIBRATED_MSG);
                } else {
                    warn!("completion signal received while intake already open, ignored");
                }
            }
            Ok(None) => debug!("signal connection closed without payload"),
            Err(e) => warn!("error reading signal payload: {e}"),
        }
    }
}

/// First non-empty chunk from the peer, or `None` if it closed without
/// sending anything.
async fn read_signal(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(buf))
}
