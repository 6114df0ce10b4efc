//! Process-backed worker units
//!
//! The child speaks newline-delimited JSON frames: [`PoolMessage`]s on its
//! stdin, [`WorkerMessage`]s on its stdout. Its stderr is inherited so child
//! logs end up next to the pool's.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use super::protocol::{decode_frame, encode_frame, PoolMessage, WorkerMessage, MAX_FRAME_BYTES};
use super::{
    EventSender, SpawnError, UnitEvent, UnitExit, UnitSender, WorkerFactory, WorkerId, WorkerKind,
    WorkerUnit,
};

/// Environment variable carrying the worker id into the child
pub const WORKER_ID_ENV: &str = "SWITCHYARD_WORKER_ID";

/// Environment variable carrying the worker kind into the child
pub const WORKER_KIND_ENV: &str = "SWITCHYARD_WORKER_KIND";

/// Launches worker executables
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessWorkerFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append a command-line argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for every child
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Process
    }

    fn spawn(&self, id: WorkerId, events: EventSender) -> Result<Box<dyn WorkerUnit>, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, id.to_string())
            .env(WORKER_KIND_ENV, WorkerKind::Process.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SpawnError::Process {
            program: self.program.display().to_string(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let pid = child.id();
        debug!(worker_id = id, pid = ?pid, program = %self.program.display(), "worker process started");

        let (tx, outbound) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_frames(id, stdin, outbound));
        tokio::spawn(supervise(id, child, stdout, events, kill_rx));

        Ok(Box::new(ProcessUnit {
            id,
            sender: UnitSender::new(id, tx),
            kill: Some(kill_tx),
        }))
    }
}

async fn write_frames<W>(id: WorkerId, stdin: W, mut outbound: mpsc::UnboundedReceiver<PoolMessage>)
where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(stdin, LinesCodec::new());
    while let Some(message) = outbound.recv().await {
        let line = match encode_frame(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(worker_id = id, error = %e, "dropping unencodable message");
                continue;
            }
        };
        if let Err(e) = frames.send(line).await {
            debug!(worker_id = id, error = %e, "worker stdin closed");
            break;
        }
    }
    // Dropping stdin tells the child the pool is gone.
}

/// Forward stdout frames, then report the exit once stdout is drained
async fn supervise<R>(
    id: WorkerId,
    mut child: Child,
    stdout: R,
    events: EventSender,
    mut kill: oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let mut stdout_open = true;

    let exit = loop {
        tokio::select! {
            // Fires on an explicit kill and when the unit is dropped.
            _ = &mut kill => {
                if let Err(e) = child.kill().await {
                    warn!(worker_id = id, error = %e, "failed to kill worker process");
                }
                break UnitExit::failed("killed");
            }

            line = frames.next(), if stdout_open => match line {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message = match decode_frame::<WorkerMessage>(&line) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(worker_id = id, error = %e, "undecodable frame, killing worker");
                            break kill_child(id, &mut child, format!("undecodable frame: {e}")).await;
                        }
                    };
                    if events.send((id, UnitEvent::Message(message))).is_err() {
                        // Pool is gone; nothing left to supervise for.
                        let _ = child.kill().await;
                        return;
                    }
                }
                // The channel cannot resync once framing is lost.
                Some(Err(e)) => {
                    warn!(worker_id = id, error = %e, "worker stdout failed, killing worker");
                    break kill_child(id, &mut child, format!("stdout transport failed: {e}")).await;
                }
                None => stdout_open = false,
            },

            status = child.wait(), if !stdout_open => {
                break match status {
                    Ok(status) if status.success() => UnitExit::clean(),
                    Ok(status) => UnitExit::failed(status.to_string()),
                    Err(e) => UnitExit::failed(format!("wait failed: {e}")),
                };
            }
        }
    };

    debug!(worker_id = id, clean = exit.clean, detail = %exit.detail, "worker process exited");
    let _ = events.send((id, UnitEvent::Exited(exit)));
}

async fn kill_child(id: WorkerId, child: &mut Child, detail: String) -> UnitExit {
    if let Err(e) = child.kill().await {
        warn!(worker_id = id, error = %e, "failed to kill worker process");
    }
    UnitExit::failed(detail)
}

struct ProcessUnit {
    id: WorkerId,
    sender: UnitSender,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerUnit for ProcessUnit {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Process
    }

    fn sender(&self) -> &UnitSender {
        &self.sender
    }

    fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}
