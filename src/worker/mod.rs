pub mod bundle;
pub mod discovery;
pub mod process;
pub mod transport;

use std::collections::HashMap;
use std::path::PathBuf;

use self::bundle::MountedBundle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Unstarted,
    Running,
    Closed,
}

impl TransportState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransportState::{Closed, Running, Unstarted};

        matches!(
            (self, next),
            (Unstarted, Running) | (Unstarted, Closed) | (Running, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Running => "running",
            Self::Closed => "closed",
        }
    }
}

/// Everything needed to spawn the catalog worker. When `env` is `Some`, the
/// child gets exactly that environment instead of inheriting ours. A mounted
/// bundle rides along so the transport can release it after the worker exits.
#[derive(Debug)]
pub struct WorkerLaunch {
    pub command: Vec<String>,
    pub env: Option<HashMap<String, String>>,
    pub cwd: Option<PathBuf>,
    pub bundle: Option<MountedBundle>,
}

impl WorkerLaunch {
    pub fn plain(command: Vec<String>) -> Self {
        Self {
            command,
            env: None,
            cwd: None,
            bundle: None,
        }
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }
}
