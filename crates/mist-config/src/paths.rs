use std::fs;
use std::path::{Path, PathBuf};

/// Filesystem locations derived from a single data root.
///
/// Layout:
/// ```text
/// <root>/broker/mist.sock   broker socket (unless overridden)
/// <root>/broker/mist.pid    broker pid file (unless overridden)
/// <root>/agents/<agent_id>  per-agent scratch space
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
    socket: Option<PathBuf>,
    pid_file: Option<PathBuf>,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            socket: None,
            pid_file: None,
        }
    }

    pub fn with_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    pub fn with_pid_file(mut self, pid_file: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(pid_file.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn broker_dir(&self) -> PathBuf {
        self.root.join("broker")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| self.broker_dir().join("mist.sock"))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| self.broker_dir().join("mist.pid"))
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id)
    }

    /// Create the broker directory (and the socket's parent, if overridden).
    pub fn ensure_broker_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.broker_dir())?;
        if let Some(parent) = self.socket_path().parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
