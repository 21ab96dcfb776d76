//! # Runtime Shell Module
//!
//! The asynchronous half of the daemon: everything that actually touches a
//! descriptor lives here, while every protocol decision lives in the
//! synchronous [`crate::proxy::Proxy`] engine. The shell performs the
//! engine's [`Action`]s and feeds back [`LoopEvent`]s:
//!
//! - **Links**: one connect task and one receive pump per peer. The pump
//!   reads whatever fragment the transport yields and hands it to the
//!   engine; short reads are the receiver state machine's problem, not
//!   ours.
//! - **Timers**: one sleeping task per armed [`TimerId`]; cancellation is
//!   task abortion, and a stale firing is harmless because the engine
//!   ignores unknown timer ids.
//! - **Streams**: one watcher task per file-stream descriptor, performing
//!   the non-blocking reads/writes the flow-control protocol asks for.
//!
//! The shell is built for a *current-thread* runtime inside a `LocalSet`:
//! all tasks are `spawn_local`, the engine is never shared, and no lock
//! exists. This is the cooperative single-threaded model the concurrency
//! design requires: the only suspension points are transport readiness,
//! fabric readiness, and timer expiry.

use crate::proxy::{Action, LoopEvent, Proxy, StreamDirection, StreamKey, TimerId};
use crate::transport::{
    LinkReceiver, LinkSender, Transport, TransportFactory, RECV_CHUNK_SIZE,
};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything the shell's tasks can report back to the main loop.
enum ShellEvent {
    Loop(LoopEvent),
    Connected {
        system: String,
        transport: Box<dyn Transport>,
        sender: Box<dyn LinkSender>,
        receiver: Box<dyn LinkReceiver>,
    },
    ConnectFailed {
        system: String,
        transport: Box<dyn Transport>,
    },
}

struct LinkIo {
    sender: Box<dyn LinkSender>,
    reader: JoinHandle<()>,
}

enum StreamCmd {
    Read { max: usize },
    Write { data: Vec<u8> },
}

struct StreamIo {
    cmd_tx: mpsc::UnboundedSender<StreamCmd>,
    task: JoinHandle<()>,
}

/// The daemon's event loop: owns the engine, the transports, and every
/// I/O task.
pub struct ProxyRuntime {
    engine: Proxy,
    shell_tx: mpsc::UnboundedSender<ShellEvent>,
    shell_rx: mpsc::UnboundedReceiver<ShellEvent>,
    fabric_kick_tx: mpsc::UnboundedSender<()>,
    fabric_kick_rx: mpsc::UnboundedReceiver<()>,
    transports: HashMap<String, Box<dyn Transport>>,
    links: HashMap<String, LinkIo>,
    timers: HashMap<TimerId, JoinHandle<()>>,
    streams: HashMap<StreamKey, StreamIo>,
}

impl ProxyRuntime {
    /// Build the shell around an engine, creating the configured
    /// transports through the factory.
    pub fn new(engine: Proxy) -> Self {
        let (shell_tx, shell_rx) = mpsc::unbounded_channel();
        let (fabric_kick_tx, fabric_kick_rx) = mpsc::unbounded_channel();
        let transports = engine
            .config()
            .links
            .iter()
            .map(|link| {
                (
                    link.system_name.clone(),
                    TransportFactory::create(&link.transport),
                )
            })
            .collect();
        Self {
            engine,
            shell_tx,
            shell_rx,
            fabric_kick_tx,
            fabric_kick_rx,
            transports,
            links: HashMap::new(),
            timers: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Replace the transport for one peer, e.g. with an in-memory pair.
    pub fn install_transport(&mut self, system: &str, transport: Box<dyn Transport>) {
        self.transports.insert(system.to_owned(), transport);
    }

    /// Channel the fabric kicks when it queues local activity; hand this
    /// to the fabric's notifier hook.
    pub fn fabric_kick_sender(&self) -> mpsc::UnboundedSender<()> {
        self.fabric_kick_tx.clone()
    }

    /// Run the proxy forever. Must execute inside a
    /// `tokio::task::LocalSet` on a current-thread runtime.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("proxy event loop starting");
        let actions = self.engine.start();
        self.apply_all(actions).await;

        loop {
            enum Sel {
                Shell(Option<ShellEvent>),
                Kick,
            }
            let sel = tokio::select! {
                ev = self.shell_rx.recv() => Sel::Shell(ev),
                _ = self.fabric_kick_rx.recv() => Sel::Kick,
            };
            match sel {
                Sel::Shell(Some(event)) => self.on_shell_event(event).await,
                Sel::Shell(None) => break,
                Sel::Kick => {
                    let actions = self.engine.poll_fabric();
                    self.apply_all(actions).await;
                }
            }
        }
        Ok(())
    }

    async fn on_shell_event(&mut self, event: ShellEvent) {
        match event {
            ShellEvent::Loop(loop_event) => {
                if let LoopEvent::TimerExpired(ref id) = loop_event {
                    self.timers.remove(id);
                }
                let actions = self.engine.handle(loop_event);
                self.apply_all(actions).await;
                // Engine calls may have queued fabric completions.
                let actions = self.engine.poll_fabric();
                self.apply_all(actions).await;
            }
            ShellEvent::Connected {
                system,
                transport,
                sender,
                receiver,
            } => {
                info!(system, link = transport.id(), "link connected");
                self.transports.insert(system.clone(), transport);
                let reader = self.spawn_reader(system.clone(), receiver);
                self.links.insert(system.clone(), LinkIo { sender, reader });
                let actions = self.engine.handle(LoopEvent::LinkUp { system });
                self.apply_all(actions).await;
            }
            ShellEvent::ConnectFailed { system, transport } => {
                warn!(system, link = transport.id(), "link connect failed");
                self.transports.insert(system.clone(), transport);
                let actions = self.engine.handle(LoopEvent::LinkDown { system });
                self.apply_all(actions).await;
            }
        }
    }

    fn spawn_reader(&self, system: String, mut receiver: Box<dyn LinkReceiver>) -> JoinHandle<()> {
        let tx = self.shell_tx.clone();
        tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; RECV_CHUNK_SIZE];
            loop {
                match receiver.receive(&mut buf).await {
                    Ok(n) => {
                        let event = LoopEvent::LinkBytes {
                            system: system.clone(),
                            bytes: buf[..n].to_vec(),
                        };
                        if tx.send(ShellEvent::Loop(event)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(system, "receive pump stopping: {e}");
                        let _ = tx.send(ShellEvent::Loop(LoopEvent::LinkDown { system }));
                        break;
                    }
                }
            }
        })
    }

    async fn apply_all(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.apply(action).await;
        }
    }

    async fn apply(&mut self, action: Action) {
        match action {
            Action::ConnectLink { system } => {
                let Some(mut transport) = self.transports.remove(&system) else {
                    error!(system, "no transport configured; link stays down");
                    return;
                };
                let tx = self.shell_tx.clone();
                tokio::task::spawn_local(async move {
                    match transport.connect().await {
                        Ok((sender, receiver)) => {
                            let _ = tx.send(ShellEvent::Connected {
                                system,
                                transport,
                                sender,
                                receiver,
                            });
                        }
                        Err(e) => {
                            debug!("connect failed: {e}");
                            let _ = tx.send(ShellEvent::ConnectFailed { system, transport });
                        }
                    }
                });
            }

            Action::SendFrame { system, frame } => {
                let Some(link) = self.links.get_mut(&system) else {
                    debug!(system, "frame for a link that is not up; dropped");
                    return;
                };
                if let Err(e) = link.sender.send(&frame).await {
                    warn!(system, "link send failed: {e}");
                    let _ = self
                        .shell_tx
                        .send(ShellEvent::Loop(LoopEvent::LinkDown { system }));
                }
            }

            Action::DropLink { system } => {
                if let Some(link) = self.links.remove(&system) {
                    link.reader.abort();
                }
            }

            Action::StartTimer { id, after } => {
                if let Some(old) = self.timers.remove(&id) {
                    old.abort();
                }
                let tx = self.shell_tx.clone();
                let timer_id = id.clone();
                let handle = tokio::task::spawn_local(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(ShellEvent::Loop(LoopEvent::TimerExpired(timer_id)));
                });
                self.timers.insert(id, handle);
            }

            Action::CancelTimer { id } => {
                if let Some(handle) = self.timers.remove(&id) {
                    handle.abort();
                }
            }

            Action::WatchStream { key, fd, direction } => {
                let afd = match AsyncFd::new(fd) {
                    Ok(afd) => afd,
                    Err(e) => {
                        error!("cannot watch stream descriptor: {e}");
                        let _ = self
                            .shell_tx
                            .send(ShellEvent::Loop(LoopEvent::StreamIoError { key }));
                        return;
                    }
                };
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                let tx = self.shell_tx.clone();
                let task_key = key.clone();
                let task = match direction {
                    StreamDirection::Outgoing => tokio::task::spawn_local(
                        outgoing_stream_task(task_key, afd, cmd_rx, tx),
                    ),
                    StreamDirection::Incoming => tokio::task::spawn_local(
                        incoming_stream_task(task_key, afd, cmd_rx, tx),
                    ),
                };
                self.streams.insert(key, StreamIo { cmd_tx, task });
            }

            Action::UnwatchStream { key } => {
                if let Some(io) = self.streams.remove(&key) {
                    io.task.abort();
                }
            }

            Action::ArmStreamRead { key, max } => {
                if let Some(io) = self.streams.get(&key) {
                    let _ = io.cmd_tx.send(StreamCmd::Read { max });
                }
            }

            Action::WriteStream { key, data } => {
                if let Some(io) = self.streams.get(&key) {
                    let _ = io.cmd_tx.send(StreamCmd::Write { data });
                }
            }
        }
    }
}

/// Read up to `max` bytes once the descriptor is readable. `Ok((_, true))`
/// is end-of-file.
async fn read_some(afd: &AsyncFd<OwnedFd>, max: usize) -> std::io::Result<(Vec<u8>, bool)> {
    loop {
        let mut guard = afd.readable().await?;
        let mut buf = vec![0u8; max.max(1)];
        match guard.try_io(|inner| {
            let n = unsafe {
                libc::read(
                    inner.get_ref().as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }) {
            Ok(Ok(n)) => {
                buf.truncate(n);
                return Ok((buf, n == 0));
            }
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
}

/// Write the whole buffer, waiting for writability as needed.
async fn write_all_fd(afd: &AsyncFd<OwnedFd>, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        let mut guard = afd.writable().await?;
        match guard.try_io(|inner| {
            let n = unsafe {
                libc::write(
                    inner.get_ref().as_raw_fd(),
                    data.as_ptr().cast(),
                    data.len(),
                )
            };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }) {
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

/// Pipe capacity for room accounting; falls back to a page-multiple
/// default when the descriptor is not a pipe.
fn pipe_capacity(afd: &AsyncFd<OwnedFd>) -> usize {
    let size = unsafe { libc::fcntl(afd.get_ref().as_raw_fd(), libc::F_GETPIPE_SZ) };
    if size > 0 {
        size as usize
    } else {
        64 * 1024
    }
}

/// Bytes currently queued in the pipe.
fn pipe_occupancy(afd: &AsyncFd<OwnedFd>) -> usize {
    let mut queued: libc::c_int = 0;
    let rc = unsafe {
        libc::ioctl(
            afd.get_ref().as_raw_fd(),
            libc::FIONREAD,
            &mut queued as *mut libc::c_int,
        )
    };
    if rc == 0 {
        queued.max(0) as usize
    } else {
        0
    }
}

/// Watcher for an outgoing stream: reads the local descriptor against
/// credit the engine grants.
async fn outgoing_stream_task(
    key: StreamKey,
    afd: AsyncFd<OwnedFd>,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCmd>,
    tx: mpsc::UnboundedSender<ShellEvent>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        let StreamCmd::Read { max } = cmd else {
            continue;
        };
        match read_some(&afd, max).await {
            Ok((data, eof)) => {
                let done = eof;
                let _ = tx.send(ShellEvent::Loop(LoopEvent::StreamChunk {
                    key: key.clone(),
                    data,
                    eof,
                }));
                if done {
                    break;
                }
            }
            Err(e) => {
                debug!(stream = key.stream_id, "stream read failed: {e}");
                let _ = tx.send(ShellEvent::Loop(LoopEvent::StreamIoError { key: key.clone() }));
                break;
            }
        }
    }
}

/// Watcher for an incoming stream: reports room, then writes the chunks
/// the engine forwards.
async fn incoming_stream_task(
    key: StreamKey,
    afd: AsyncFd<OwnedFd>,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCmd>,
    tx: mpsc::UnboundedSender<ShellEvent>,
) {
    let capacity = pipe_capacity(&afd);
    loop {
        // Wait until the local consumer has drained enough to accept more.
        match afd.writable().await {
            Ok(guard) => drop(guard),
            Err(e) => {
                debug!(stream = key.stream_id, "stream poll failed: {e}");
                let _ = tx.send(ShellEvent::Loop(LoopEvent::StreamHup { key: key.clone() }));
                return;
            }
        }
        let room = capacity.saturating_sub(pipe_occupancy(&afd));
        let _ = tx.send(ShellEvent::Loop(LoopEvent::StreamWritable {
            key: key.clone(),
            room,
        }));

        // Drain write commands until the engine's credit round ends.
        match cmd_rx.recv().await {
            Some(StreamCmd::Write { data }) => {
                if let Err(e) = write_all_fd(&afd, &data).await {
                    let event = if e.kind() == std::io::ErrorKind::BrokenPipe {
                        LoopEvent::StreamHup { key: key.clone() }
                    } else {
                        LoopEvent::StreamIoError { key: key.clone() }
                    };
                    let _ = tx.send(ShellEvent::Loop(event));
                    return;
                }
            }
            Some(StreamCmd::Read { .. }) => {}
            None => return,
        }
    }
}
