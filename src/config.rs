/// Kernel-level configuration.
use std::str::FromStr;
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;

use crate::transport::Transport;

/// Log verbosity of the kernel. `silent` disables output entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Silent,
    Error,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// The `tracing` filter this level corresponds to. The binary feeds
    /// this into its subscriber; the library itself never installs one.
    pub fn to_filter(self) -> LevelFilter {
        match self {
            Self::Silent => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "silent" => Ok(Self::Silent),
            "error" => Ok(Self::Error),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// Options for [`crate::Kernel::new`].
#[derive(Default)]
pub struct KernelOptions {
    /// Transports started with the kernel. More can be added later with
    /// `use_transport`.
    pub transports: Vec<Arc<dyn Transport>>,
    pub log_level: LogLevel,
}
