//! Configuration for the stereocal intake service.
//!
//! Loaded from a TOML file; every field has a default, so an empty file (or
//! no file at all) yields a runnable configuration.

use serde::{Deserialize, Serialize};

/// The stereocal configuration error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn default_data_addr() -> String {
    stereocal_types::DEFAULT_DATA_ADDR.to_string()
}

fn default_signal_addr() -> String {
    stereocal_types::DEFAULT_SIGNAL_ADDR.to_string()
}

/// The default value for [IntakeConfig::target_frame_count].
pub const DEFAULT_TARGET_FRAME_COUNT: usize = 20;

fn default_target_frame_count() -> usize {
    DEFAULT_TARGET_FRAME_COUNT
}

/// The default value for [IntakeConfig::output_base_dirname].
pub const DEFAULT_OUTPUT_BASE_DIRNAME: &str = "~/STEREOCAL-DATA";

fn default_output_base_dirname() -> std::path::PathBuf {
    DEFAULT_OUTPUT_BASE_DIRNAME.into()
}

fn default_recv_timeout_msec() -> u64 {
    2000
}

fn default_readiness_poll_msec() -> u64 {
    5000
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_calibration_command() -> Vec<String> {
    vec!["python".to_string(), "StereoCalibration.py".to_string()]
}

fn default_calibration_wait_timeout_secs() -> u64 {
    600
}

/// Configuration of the intake service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntakeConfig {
    /// Address of the frame intake endpoint, in `IP:PORT` form. Port 0
    /// requests an ephemeral port.
    #[serde(default = "default_data_addr")]
    pub data_addr: String,
    /// Address of the calibration-completion signal endpoint.
    #[serde(default = "default_signal_addr")]
    pub signal_addr: String,
    /// Number of frames required per camera side before a calibration run
    /// is triggered.
    #[serde(default = "default_target_frame_count")]
    pub target_frame_count: usize,
    /// Directory under which the per-side frame directories are created.
    /// Can contain shell variables such as `~`, `$A`, or `${B}`.
    #[serde(default = "default_output_base_dirname")]
    pub output_base_dirname: std::path::PathBuf,
    /// Timeout for a single header or payload read on the data connection.
    #[serde(default = "default_recv_timeout_msec")]
    pub recv_timeout_msec: u64,
    /// How long to wait for pending bytes before re-checking an idle
    /// connection.
    #[serde(default = "default_readiness_poll_msec")]
    pub readiness_poll_msec: u64,
    /// Upper bound on a declared frame payload length. A header declaring
    /// more than this is treated as malformed.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Command (argv) launching the external calibration job. Runs with
    /// [Self::output_base_dirname] as its working directory.
    #[serde(default = "default_calibration_command")]
    pub calibration_command: Vec<String>,
    /// A calibration run with no completion notification after this many
    /// seconds is treated as failed and intake reopens. 0 waits forever.
    #[serde(default = "default_calibration_wait_timeout_secs")]
    pub calibration_wait_timeout_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        // unwrap OK: an empty TOML document exercises only the defaults
        toml::from_str("").unwrap()
    }
}

impl IntakeConfig {
    pub fn recv_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.recv_timeout_msec)
    }
    pub fn readiness_poll(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.readiness_poll_msec)
    }
}

/// Split `path` (which must be a file) into directory and filename component.
fn split_path<P: AsRef<std::path::Path>>(path: P) -> (std::path::PathBuf, std::path::PathBuf) {
    let path = path.as_ref();
    let mut components = path.components();
    let filename = components
        .next_back()
        .map(|c| c.as_os_str().into())
        .unwrap_or_default();
    let dirname = components.as_path().into();
    (dirname, filename)
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is expanded
/// to the home directory.
fn fixup_relative_path(path: &mut std::path::PathBuf, dirname: &std::path::Path) -> Result<()> {
    let pathstr = path.as_os_str().to_str().unwrap();
    let expanded = shellexpand::full(&pathstr)?;
    *path = std::path::PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

/// Load an [IntakeConfig] from the TOML file at `config_fname`.
///
/// The output directory is shell-expanded and, if relative, taken relative
/// to the directory containing the config file.
pub fn parse_config_file<P: AsRef<std::path::Path>>(config_fname: P) -> Result<IntakeConfig> {
    let contents = std::fs::read_to_string(&config_fname)?;
    let mut cfg: IntakeConfig = toml::from_str(&contents)?;
    let (dirname, _) = split_path(&config_fname);
    fixup_relative_path(&mut cfg.output_base_dirname, &dirname)?;
    Ok(cfg)
}
