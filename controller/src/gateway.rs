//! Gateway lifecycle: launching worker transports from parsed specs and
//! replicating source material to the hosts that need it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future;
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::error::{ControllerError, Result};
use crate::reporter::Reporter;
use crate::rsync::{self, RsyncFilter};
use crate::spec::{LaunchKind, WorkerSpec};

/// Working directory applied to remote specs that do not name one, so
/// replicated workers do not collide on the remote filesystem.
pub const DEFAULT_CHDIR: &str = "workercache";

/// Worker executable spawned for subprocess and remote-shell gateways
/// when the spec carries no interpreter override.
pub const DEFAULT_WORKER_CMD: &str = "worker";

pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle for destroying a gateway's subprocess outright. Cloneable so
/// the node proxy can force-kill independently of the manager.
#[derive(Clone, Default)]
pub struct KillHandle(Arc<Mutex<Option<Child>>>);

impl KillHandle {
    fn new(child: Option<Child>) -> Self {
        Self(Arc::new(Mutex::new(child)))
    }

    /// Kills the underlying process, if any. Idempotent.
    pub fn kill(&self) {
        let child = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            tokio::spawn(async move {
                if let Err(e) = child.kill().await {
                    debug!("kill failed: {e}");
                }
            });
        }
    }
}

/// Basic identification of the platform a gateway runs on.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub executable: Option<PathBuf>,
}

impl PlatformInfo {
    fn local(executable: PathBuf) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            executable: Some(executable),
        }
    }

    fn remote(executable: Option<PathBuf>) -> Self {
        Self {
            os: "remote".to_string(),
            arch: "unknown".to_string(),
            executable,
        }
    }
}

/// A live connection to one spawned worker. Ids are assigned in
/// creation order: `gw0`, `gw1`, ...
pub struct Gateway {
    pub id: String,
    pub spec: WorkerSpec,
    pub platform: PlatformInfo,
    transport: Option<(BoxRead, BoxWrite)>,
    kill: KillHandle,
}

impl Gateway {
    async fn open(id: String, spec: WorkerSpec) -> Result<Gateway> {
        let launch_err = |source| ControllerError::Launch {
            spec: format!("{spec:?}"),
            source,
        };

        match spec.kind.clone() {
            LaunchKind::Popen => {
                let executable = spec
                    .python
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_CMD));
                let mut command = Command::new(&executable);
                if let Some(chdir) = &spec.chdir {
                    command.current_dir(chdir);
                }
                Self::spawn(id, spec, command, PlatformInfo::local(executable))
            }
            LaunchKind::Ssh { host } => {
                let executable = spec
                    .python
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_CMD));
                let mut remote_cmd = String::new();
                if let Some(chdir) = &spec.chdir {
                    remote_cmd.push_str(&format!(
                        "mkdir -p {} && cd {} && ",
                        chdir.display(),
                        chdir.display()
                    ));
                }
                remote_cmd.push_str(&executable.display().to_string());

                let mut command = Command::new("ssh");
                command.arg("-C").arg(&host).arg(remote_cmd);
                let platform = PlatformInfo::remote(Some(executable));
                Self::spawn(id, spec, command, platform)
            }
            LaunchKind::Socket { addr } => {
                let stream = TcpStream::connect(&addr).await.map_err(launch_err)?;
                let (rx, tx) = stream.into_split();
                Ok(Gateway {
                    id,
                    platform: PlatformInfo::remote(spec.python.clone()),
                    spec,
                    transport: Some((Box::new(rx), Box::new(tx))),
                    kill: KillHandle::default(),
                })
            }
        }
    }

    fn spawn(
        id: String,
        spec: WorkerSpec,
        mut command: Command,
        platform: PlatformInfo,
    ) -> Result<Gateway> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ControllerError::Launch {
            spec: format!("{spec:?}"),
            source,
        })?;

        let missing = || {
            ControllerError::Launch {
                spec: format!("{spec:?}"),
                source: std::io::Error::other("child spawned without piped stdio"),
            }
        };
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;

        Ok(Gateway {
            id,
            spec,
            platform,
            transport: Some((Box::new(stdout), Box::new(stdin))),
            kill: KillHandle::new(Some(child)),
        })
    }

    /// Builds a gateway over an existing transport. Used when the
    /// worker lives in-process (tests, embedding).
    pub fn from_transport<R, W>(id: String, spec: WorkerSpec, rx: R, tx: W) -> Gateway
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Gateway {
            id,
            platform: PlatformInfo::remote(None),
            spec,
            transport: Some((Box::new(rx), Box::new(tx))),
            kill: KillHandle::default(),
        }
    }

    pub(crate) fn take_transport(&mut self) -> Option<(BoxRead, BoxWrite)> {
        self.transport.take()
    }

    pub(crate) fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    /// Destroys the gateway: drops any unclaimed transport and kills
    /// the subprocess if one exists.
    pub fn exit(&mut self) {
        self.transport = None;
        self.kill.kill();
    }
}

/// Owns the set of live gateways for one run.
pub struct GatewayManager {
    specs: Vec<WorkerSpec>,
    group: Vec<Gateway>,
    reporter: Arc<dyn Reporter>,
}

impl GatewayManager {
    /// Parses every spec string, expanding replication and applying the
    /// default working-directory convention to remote specs.
    pub fn new(spec_strings: &[String], reporter: Arc<dyn Reporter>) -> Result<Self> {
        let mut specs = Vec::new();
        for raw in spec_strings {
            for mut spec in WorkerSpec::parse(raw)? {
                if !matches!(spec.kind, LaunchKind::Popen) && spec.chdir.is_none() {
                    spec.chdir = Some(PathBuf::from(DEFAULT_CHDIR));
                }
                specs.push(spec);
            }
        }
        Ok(Self {
            specs,
            group: Vec::new(),
            reporter,
        })
    }

    pub fn specs(&self) -> &[WorkerSpec] {
        &self.specs
    }

    pub fn group(&self) -> &[Gateway] {
        &self.group
    }

    pub(crate) fn group_mut(&mut self) -> &mut [Gateway] {
        &mut self.group
    }

    #[cfg(test)]
    pub(crate) fn insert_gateway(&mut self, gateway: Gateway) {
        self.group.push(gateway);
    }

    /// Launches one gateway per parsed spec, concurrently. Ids follow
    /// spec order regardless of completion order.
    pub async fn makegateways(&mut self) -> Result<()> {
        let launches = self
            .specs
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, spec)| Gateway::open(format!("gw{i}"), spec));
        self.group = future::try_join_all(launches).await?;

        for gateway in &self.group {
            info!("[{}] gateway created: {:?}", gateway.id, gateway.spec);
            self.reporter
                .new_gateway(&gateway.id, &gateway.spec, &gateway.platform);
        }
        Ok(())
    }

    /// Recursively copies `source` to every gateway that does not share
    /// the master's filesystem. Zero targets means no copy and no
    /// notification.
    pub async fn rsync(&mut self, source: &Path, ignores: &[PathBuf]) -> Result<()> {
        let targets: Vec<usize> = self
            .group
            .iter()
            .enumerate()
            .filter(|(_, gw)| !gw.spec.samefilesystem())
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = targets.iter().map(|&i| self.group[i].id.clone()).collect();
        self.reporter.rsync_start(source, &ids);

        let filter = RsyncFilter::new(ignores);
        for index in targets {
            let gateway = &self.group[index];
            let mut dest = gateway
                .spec
                .chdir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHDIR));
            if let Some(basename) = source.file_name() {
                dest = dest.join(basename);
            }
            rsync::copy_tree(source, &dest, &filter)
                .await
                .map_err(|source_err| ControllerError::Sync {
                    path: source.to_path_buf(),
                    source: source_err,
                })?;
            self.reporter.rsync_finish(source, &gateway.id);
        }
        Ok(())
    }

    /// Terminates every owned gateway and clears the set. Idempotent
    /// and callable after partial failure.
    pub fn exit(&mut self) {
        for gateway in &mut self.group {
            gateway.exit();
        }
        self.group.clear();
    }
}
