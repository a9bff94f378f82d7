//! Frame intake and calibration orchestration for a stereo camera rig.
//!
//! A capture client streams chessboard calibration frames for the LEFT and
//! RIGHT cameras over TCP. Frames are persisted per side; once both sides
//! reach the configured target count, intake closes, the external
//! calibration job is launched, and intake reopens when the job reports
//! completion on the signal endpoint.
//!
//! Two tasks run for the lifetime of the process: the serial accept/read
//! loop for capture clients ([session]) and the completion listener
//! ([signal]). They share one mutex-guarded state object ([store]).

mod launcher;
mod session;
mod signal;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::info;

use stereocal_config_data::IntakeConfig;
use stereocal_types::CameraSide;

use store::Shared;

pub struct IntakeServer {
    cfg: IntakeConfig,
    data_listener: tokio::net::TcpListener,
    signal_listener: tokio::net::TcpListener,
    shared: Arc<Shared>,
    data_addr: SocketAddr,
    signal_addr: SocketAddr,
}

impl IntakeServer {
    /// Bind both endpoints and create the per-side frame directories. A
    /// failure to bind is fatal for the service.
    pub async fn bind(cfg: IntakeConfig) -> Result<IntakeServer> {
        for side in CameraSide::both() {
            let dir = cfg.output_base_dirname.join(side.as_str());
            std::fs::create_dir_all(&dir)
                .wrap_err_with(|| format!("creating frame directory \"{}\"", dir.display()))?;
        }

        let data_listener = tokio::net::TcpListener::bind(&cfg.data_addr)
            .await
            .wrap_err_with(|| format!("binding intake endpoint {}", cfg.data_addr))?;
        let data_addr = data_listener.local_addr()?;
        info!("server listening on {data_addr}");

        let signal_listener = tokio::net::TcpListener::bind(&cfg.signal_addr)
            .await
            .wrap_err_with(|| format!("binding signal endpoint {}", cfg.signal_addr))?;
        let signal_addr = signal_listener.local_addr()?;
        info!("listening for completion signals on {signal_addr}");

        let shared = Shared::new(cfg.target_frame_count, cfg.output_base_dirname.clone());

        Ok(IntakeServer {
            cfg,
            data_listener,
            signal_listener,
            shared,
            data_addr,
            signal_addr,
        })
    }

    /// The actually bound intake address (relevant when port 0 was asked).
    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    /// The actually bound signal address.
    pub fn signal_addr(&self) -> SocketAddr {
        self.signal_addr
    }

    /// Run the service forever: the completion listener on its own task, the
    /// capture-client accept loop on this one.
    pub async fn run(self) -> Result<()> {
        let IntakeServer {
            cfg,
            data_listener,
            signal_listener,
            shared,
            ..
        } = self;
        tokio::spawn(signal::run_signal_listener(signal_listener, shared.clone()));
        session::run_intake_loop(data_listener, shared, cfg).await
    }
}
