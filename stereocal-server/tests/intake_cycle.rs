//! End-to-end tests of the intake/calibration cycle over real sockets.
//!
//! The external calibration job is replaced by `true`; the completion
//! signal is delivered by the test itself, as the real job would.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use stereocal_config_data::IntakeConfig;
use stereocal_server::IntakeServer;
use stereocal_types::{frame_header_line, CameraSide, CALIBRATED_MSG, CALIBRATING_MSG};

fn test_config(base_dir: &Path, target_frame_count: usize) -> IntakeConfig {
    let mut cfg = IntakeConfig::default();
    cfg.data_addr = "127.0.0.1:0".to_string();
    cfg.signal_addr = "127.0.0.1:0".to_string();
    cfg.target_frame_count = target_frame_count;
    cfg.output_base_dirname = base_dir.to_path_buf();
    cfg.recv_timeout_msec = 300;
    cfg.readiness_poll_msec = 100;
    cfg.calibration_command = vec!["true".to_string()];
    cfg.calibration_wait_timeout_secs = 0;
    cfg
}

async fn start_server(cfg: IntakeConfig) -> (SocketAddr, SocketAddr) {
    let server = IntakeServer::bind(cfg).await.unwrap();
    let addrs = (server.data_addr(), server.signal_addr());
    tokio::spawn(server.run());
    addrs
}

async fn send_frame(client: &mut TcpStream, side: CameraSide, payload: &[u8]) {
    let header = frame_header_line(side, payload.len());
    client.write_all(header.as_bytes()).await.unwrap();
    client.write_all(payload).await.unwrap();
}

async fn expect_msg(client: &mut TcpStream, msg: &str) {
    let mut buf = vec![0u8; msg.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {msg:?}"))
        .unwrap();
    assert_eq!(std::str::from_utf8(&buf).unwrap(), msg);
}

async fn wait_for_content(path: &Path, expected: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(contents) = std::fs::read(path) {
            if contents == expected {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {} to contain {expected:?}",
            path.display()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {}",
            path.display()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn full_cycle_repeats_after_completion_signal() {
    let scratch = tempfile::tempdir().unwrap();
    let (data_addr, signal_addr) = start_server(test_config(scratch.path(), 2)).await;

    let mut client = TcpStream::connect(data_addr).await.unwrap();
    send_frame(&mut client, CameraSide::Left, b"img1").await;
    send_frame(&mut client, CameraSide::Right, b"img2").await;
    send_frame(&mut client, CameraSide::Left, b"img3").await;
    send_frame(&mut client, CameraSide::Right, b"img4").await;
    expect_msg(&mut client, CALIBRATING_MSG).await;

    for name in ["LEFT/LEFT_1.png", "LEFT/LEFT_2.png", "RIGHT/RIGHT_1.png", "RIGHT/RIGHT_2.png"] {
        wait_for_path(&scratch.path().join(name)).await;
    }

    // the external job announces completion on the signal endpoint
    let mut sig = TcpStream::connect(signal_addr).await.unwrap();
    sig.write_all(b"Calibration Complete").await.unwrap();
    drop(sig);
    expect_msg(&mut client, CALIBRATED_MSG).await;

    // counts were reset: the identical sequence triggers a second run
    send_frame(&mut client, CameraSide::Left, b"img5").await;
    send_frame(&mut client, CameraSide::Right, b"img6").await;
    send_frame(&mut client, CameraSide::Left, b"img7").await;
    send_frame(&mut client, CameraSide::Right, b"img8").await;
    expect_msg(&mut client, CALIBRATING_MSG).await;

    // frames of the new cycle overwrote the first cycle's files
    let contents = std::fs::read(scratch.path().join("LEFT/LEFT_1.png")).unwrap();
    assert_eq!(contents, b"img5");
}

#[tokio::test]
async fn frames_while_calibrating_are_silently_rejected() {
    let scratch = tempfile::tempdir().unwrap();
    let (data_addr, signal_addr) = start_server(test_config(scratch.path(), 1)).await;

    let mut client = TcpStream::connect(data_addr).await.unwrap();
    send_frame(&mut client, CameraSide::Left, b"good").await;
    send_frame(&mut client, CameraSide::Right, b"good").await;
    expect_msg(&mut client, CALIBRATING_MSG).await;

    // well-formed frame while the gate is closed: consumed but not stored,
    // no acknowledgment
    send_frame(&mut client, CameraSide::Left, b"late").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let kept = std::fs::read(scratch.path().join("LEFT/LEFT_1.png")).unwrap();
    assert_eq!(kept, b"good");
    assert!(!scratch.path().join("LEFT/LEFT_2.png").exists());

    let mut sig = TcpStream::connect(signal_addr).await.unwrap();
    sig.write_all(b"done").await.unwrap();
    drop(sig);
    expect_msg(&mut client, CALIBRATED_MSG).await;

    // had the rejected frame been counted, this single pair could not be
    // the one completing the quota
    send_frame(&mut client, CameraSide::Left, b"next").await;
    send_frame(&mut client, CameraSide::Right, b"next").await;
    expect_msg(&mut client, CALIBRATING_MSG).await;
}

#[tokio::test]
async fn incomplete_payload_writes_no_file() {
    let scratch = tempfile::tempdir().unwrap();
    let (data_addr, _signal_addr) = start_server(test_config(scratch.path(), 2)).await;

    {
        let mut client = TcpStream::connect(data_addr).await.unwrap();
        let header = frame_header_line(CameraSide::Left, 10);
        client.write_all(header.as_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        // connection dropped with 7 declared bytes outstanding
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!scratch.path().join("LEFT/LEFT_1.png").exists());

    // the count is unchanged: a fresh full quota still triggers exactly at
    // the fourth frame
    let mut client = TcpStream::connect(data_addr).await.unwrap();
    send_frame(&mut client, CameraSide::Left, b"img1").await;
    send_frame(&mut client, CameraSide::Right, b"img2").await;
    send_frame(&mut client, CameraSide::Left, b"img3").await;
    send_frame(&mut client, CameraSide::Right, b"img4").await;
    expect_msg(&mut client, CALIBRATING_MSG).await;
}

#[tokio::test]
async fn failed_job_launch_reopens_intake() {
    let scratch = tempfile::tempdir().unwrap();
    let mut cfg = test_config(scratch.path(), 1);
    cfg.calibration_command = vec!["/nonexistent/stereocal-job".to_string()];
    let (data_addr, _signal_addr) = start_server(cfg).await;

    let mut client = TcpStream::connect(data_addr).await.unwrap();
    send_frame(&mut client, CameraSide::Left, b"good").await;
    send_frame(&mut client, CameraSide::Right, b"good").await;
    expect_msg(&mut client, CALIBRATING_MSG).await;

    // the job could not be spawned, so intake reopened and counts reset:
    // a fresh frame is accepted again as index 1
    send_frame(&mut client, CameraSide::Left, b"wake").await;
    wait_for_content(&scratch.path().join("LEFT/LEFT_1.png"), b"wake").await;
}

#[tokio::test]
async fn watchdog_reopens_intake_without_completion_signal() {
    let scratch = tempfile::tempdir().unwrap();
    let mut cfg = test_config(scratch.path(), 1);
    cfg.calibration_wait_timeout_secs = 1;
    let (data_addr, _signal_addr) = start_server(cfg).await;

    let mut client = TcpStream::connect(data_addr).await.unwrap();
    send_frame(&mut client, CameraSide::Left, b"good").await;
    send_frame(&mut client, CameraSide::Right, b"good").await;
    expect_msg(&mut client, CALIBRATING_MSG).await;

    // no completion signal ever arrives; after the bounded wait the run is
    // treated as failed and intake reopens
    tokio::time::sleep(Duration::from_secs(2)).await;
    send_frame(&mut client, CameraSide::Left, b"wake").await;
    wait_for_content(&scratch.path().join("LEFT/LEFT_1.png"), b"wake").await;
}

#[tokio::test]
async fn malformed_header_closes_connection_but_not_server() {
    let scratch = tempfile::tempdir().unwrap();
    let (data_addr, _signal_addr) = start_server(test_config(scratch.path(), 2)).await;

    let mut client = TcpStream::connect(data_addr).await.unwrap();
    client.write_all(b"GarbageNoDelimiter").await.unwrap();
    // server gives up on the unterminated header and closes
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("timed out waiting for server to close connection")
        .unwrap();
    assert_eq!(n, 0);

    // service still accepts and processes new connections
    let mut client = TcpStream::connect(data_addr).await.unwrap();
    send_frame(&mut client, CameraSide::Left, b"img1").await;
    wait_for_path(&scratch.path().join("LEFT/LEFT_1.png")).await;
}
