/// Error types for every worker in the engine.
///
/// Each concern gets its own enum so outcomes stay precise at the seam
/// where the orchestrator decides what to do with them. Cancellation is a
/// dedicated variant everywhere it can occur and is never reported as a
/// plain failure.
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Firmware directory scanning errors.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scan cancelled")]
    Cancelled,

    #[error("invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("cannot read firmware directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Firmware build errors (native command or container toolchain).
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("build cancelled")]
    Cancelled,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The tool ran and failed. `diagnostic` holds the tail of its output.
    #[error("{program} exited with {status}{}", render_diagnostic(.diagnostic))]
    ExitStatus {
        program: String,
        status: ExitStatus,
        diagnostic: Vec<String>,
    },

    #[error("{0}")]
    RuntimeUnavailable(String),

    #[error("failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("built firmware not found at {path}: {source}")]
    MissingArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("build worker failed: {0}")]
    Worker(String),
}

fn render_diagnostic(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("\n{}", lines.join("\n"))
    }
}

/// Firmware copy errors.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("flash cancelled")]
    Cancelled,

    #[error("open source {path}: {source}")]
    OpenSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("stat source {path}: {source}")]
    StatSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("create destination {path}: {source}")]
    CreateDestination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("copy: {0}")]
    Copy(#[source] io::Error),

    #[error("short write: read {read} bytes, wrote {written}")]
    ShortWrite { read: usize, written: usize },

    #[error("size mismatch: wrote {written}, expected {expected}")]
    SizeMismatch { written: u64, expected: u64 },

    #[error("sync: {0}")]
    Sync(#[source] io::Error),

    #[error("flash worker failed: {0}")]
    Worker(String),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot determine home directory")]
    HomeDirUnavailable,

    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("config file already exists: {0} (delete it first to regenerate)")]
    AlreadyExists(PathBuf),

    #[error("cannot write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
