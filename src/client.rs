//! Async RPC client on top of tokio.
//!
//! [`RpcClient`] connects a socket, hands it and an [`RpcEngine`] to a task of
//! their own, and talks to that task through a command channel. The task
//! turns socket readiness into engine events:
//!
//! - readable: read what is there and `feed` it
//! - writable, while the engine has something queued: `on_writable`
//! - every poll interval: `tick`
//!
//! When the connection drops, the task follows the engine's reconnect policy,
//! pausing `reconnect_delay` between attempts. Once the policy gives up (or
//! the client is shut down) the task ends; calls still pending get
//! [`CallError::ConnectionLost`].

use std::fmt;
use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_attributes::instrument;

use crate::config::{ReconnectPolicy, RpcConfig};
use crate::protocol::rpc::{
    AuthUnix, CallError, CallHandle, CallResult, Completion, PendingReply, ReconnectStep,
    RpcEngine, RpcError, RpcStats, Transport,
};

/// Size of the buffer each read fills; also the largest UDP reply accepted.
const READ_BUFFER_SIZE: usize = 128_000;

/// "Submit an opaque call, get an opaque reply" for protocol layers built on
/// top of RPC.
#[async_trait]
pub trait RpcCaller: Send + Sync {
    /// Calls `proc` of `prog`/`vers` with XDR-encoded `args` and returns the
    /// XDR-encoded results.
    async fn call(&self, prog: u32, vers: u32, proc: u32, args: Vec<u8>) -> CallResult;
}

type EngineFn = Box<dyn FnOnce(&mut RpcEngine) + Send>;

enum Command {
    Submit {
        prog: u32,
        vers: u32,
        proc: u32,
        args: Vec<u8>,
        auth: Option<AuthUnix>,
        completion: Completion,
        handle: oneshot::Sender<CallHandle>,
    },
    Cancel(CallHandle, oneshot::Sender<bool>),
    Stats(oneshot::Sender<RpcStats>),
    Configure(EngineFn),
    Shutdown,
}

enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Socket {
    async fn open(peer: SocketAddr, transport: Transport) -> io::Result<Socket> {
        match transport {
            Transport::Tcp => {
                let stream = TcpStream::connect(peer).await?;
                let _ = stream.set_nodelay(true);
                Ok(Socket::Tcp(stream))
            }
            Transport::Udp => {
                let local: SocketAddr = if peer.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(peer).await?;
                Ok(Socket::Udp(socket))
            }
        }
    }

    async fn readable(&self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.readable().await,
            Socket::Udp(s) => s.readable().await,
        }
    }

    async fn writable(&self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.writable().await,
            Socket::Udp(s) => s.writable().await,
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_read(buf),
            Socket::Udp(s) => s.try_recv(buf),
        }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_write(buf),
            Socket::Udp(s) => s.try_send(buf),
        }
    }
}

/// Presents a non-blocking socket as `Write`; a full socket buffer shows up
/// as `WouldBlock`.
struct TryWriter<'a>(&'a Socket);

impl Write for TryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Handle to a connection served by a background task.
///
/// Dropping every handle shuts the task down.
pub struct RpcClient {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    peer: SocketAddr,
    transport: Transport,
}

impl RpcClient {
    /// Connects to `peer`, retrying per `config.auto_reconnect`, and starts
    /// the task serving the connection.
    #[instrument(skip(config))]
    pub async fn connect(
        peer: SocketAddr,
        transport: Transport,
        config: RpcConfig,
    ) -> Result<RpcClient, anyhow::Error> {
        let mut engine = RpcEngine::new(config);
        engine.connect(peer, transport)?;
        let socket = match Socket::open(peer, transport).await {
            Ok(socket) => {
                engine.on_connected(Instant::now())?;
                socket
            }
            Err(e) => {
                let step = engine.on_connect_failed(&e);
                reconnect(&mut engine, step)
                    .await
                    .ok_or_else(|| anyhow!("cannot connect to {}: {}", peer, e))?
            }
        };
        info!("RPC client connected to {} over {:?}", peer, transport);

        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(engine, socket, receiver));
        Ok(RpcClient { commands, task, peer, transport })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Queues a call and returns its handle along with the reply to await.
    pub async fn submit(
        &self,
        prog: u32,
        vers: u32,
        proc: u32,
        args: Vec<u8>,
        auth: Option<AuthUnix>,
    ) -> Result<(CallHandle, PendingReply), CallError> {
        let (completion, reply) = Completion::channel();
        let (handle_tx, handle_rx) = oneshot::channel();
        self.send(Command::Submit {
            prog,
            vers,
            proc,
            args,
            auth,
            completion,
            handle: handle_tx,
        })?;
        let handle = handle_rx.await.map_err(|_| CallError::ConnectionLost)?;
        Ok((handle, reply))
    }

    /// Calls with an explicit identity instead of the configured one.
    pub async fn call_with(
        &self,
        prog: u32,
        vers: u32,
        proc: u32,
        args: Vec<u8>,
        auth: Option<AuthUnix>,
    ) -> CallResult {
        let (_, reply) = self.submit(prog, vers, proc, args, auth).await?;
        reply.await
    }

    pub async fn call(&self, prog: u32, vers: u32, proc: u32, args: Vec<u8>) -> CallResult {
        self.call_with(prog, vers, proc, args, None).await
    }

    /// Calls procedure 0, which every RPC program answers with no results.
    pub async fn ping(&self, prog: u32, vers: u32) -> Result<(), CallError> {
        self.call(prog, vers, 0, Vec::new()).await.map(|_| ())
    }

    /// Cancels a call. Returns false if it already had its outcome.
    pub async fn cancel(&self, handle: CallHandle) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Cancel(handle, tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn stats(&self) -> Result<RpcStats, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx))?;
        rx.await.map_err(|_| CallError::ConnectionLost)
    }

    /// Runs `f` on the engine inside the connection task, e.g. to change the
    /// timeout or the identity of later calls.
    pub fn configure<F>(&self, f: F) -> Result<(), CallError>
    where
        F: FnOnce(&mut RpcEngine) + Send + 'static,
    {
        self.send(Command::Configure(Box::new(f)))
    }

    /// Stops the connection task and fails whatever is still pending.
    pub async fn shutdown(self) -> Result<(), anyhow::Error> {
        let _ = self.commands.send(Command::Shutdown);
        self.task.await?;
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands.send(command).map_err(|_| CallError::ConnectionLost)
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.peer)
            .field("transport", &self.transport)
            .finish()
    }
}

#[async_trait]
impl RpcCaller for RpcClient {
    async fn call(&self, prog: u32, vers: u32, proc: u32, args: Vec<u8>) -> CallResult {
        RpcClient::call_with(self, prog, vers, proc, args, None).await
    }
}

/// Dials again for as long as the engine's policy says so.
async fn reconnect(engine: &mut RpcEngine, mut step: ReconnectStep) -> Option<Socket> {
    let transport = engine.transport();
    loop {
        let ReconnectStep::Retry(peer) = step else {
            return None;
        };
        tokio::time::sleep(engine.config().reconnect_delay).await;
        if let Err(e) = engine.connect(peer, transport) {
            error!("cannot reconnect: {}", e);
            return None;
        }
        match Socket::open(peer, transport).await {
            Ok(socket) => {
                return match engine.on_connected(Instant::now()) {
                    Ok(()) => Some(socket),
                    Err(e) => {
                        error!("cannot reconnect: {}", e);
                        None
                    }
                }
            }
            Err(e) => step = engine.on_connect_failed(&e),
        }
    }
}

/// Writes whatever the engine has queued until the socket is full.
fn flush(engine: &mut RpcEngine, socket: &Socket) -> Result<(), RpcError> {
    if engine.wants_write() {
        engine.on_writable(&mut TryWriter(socket), Instant::now())?;
    }
    Ok(())
}

/// Reads until the socket has nothing more.
fn drain_socket(engine: &mut RpcEngine, socket: &Socket, buf: &mut [u8]) -> Result<(), RpcError> {
    loop {
        match socket.try_read(buf) {
            Ok(0) if matches!(socket, Socket::Tcp(_)) => {
                return Err(RpcError::Connection(io::ErrorKind::UnexpectedEof.into()));
            }
            Ok(n) => {
                engine.feed(&buf[..n], Instant::now())?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Handles a failed socket operation. Returns the socket to continue with,
/// or `None` when the connection is gone for good.
async fn recover(engine: &mut RpcEngine, err: RpcError) -> Option<Socket> {
    match err {
        RpcError::Framing(e) => {
            // the engine already failed everything and went Disconnected
            let peer = engine.peer()?;
            if engine.config().auto_reconnect == ReconnectPolicy::Never {
                warn!("stream to {} broken ({}), not reconnecting", peer, e);
                return None;
            }
            warn!("stream to {} broken ({}), reconnecting", peer, e);
            reconnect(engine, ReconnectStep::Retry(peer)).await
        }
        e => {
            debug!("connection error: {}", e);
            let step = engine.on_disconnected();
            reconnect(engine, step).await
        }
    }
}

async fn serve(
    mut engine: RpcEngine,
    mut socket: Socket,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut ticker = tokio::time::interval(engine.config().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'serve: loop {
        let wants_write = engine.wants_write();
        let mut outcome = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Submit { prog, vers, proc, args, auth, completion, handle }) => {
                    let call = engine.submit(
                        prog, vers, proc, &args, auth.as_ref(), completion, Instant::now(),
                    );
                    let _ = handle.send(call);
                    flush(&mut engine, &socket)
                }
                Some(Command::Cancel(handle, reply)) => {
                    let _ = reply.send(engine.cancel(handle));
                    Ok(())
                }
                Some(Command::Stats(reply)) => {
                    let _ = reply.send(engine.stats());
                    Ok(())
                }
                Some(Command::Configure(f)) => {
                    f(&mut engine);
                    Ok(())
                }
                Some(Command::Shutdown) | None => break 'serve,
            },
            ready = socket.readable() => match ready {
                Ok(()) => drain_socket(&mut engine, &socket, &mut buf),
                Err(e) => Err(e.into()),
            },
            ready = socket.writable(), if wants_write => match ready {
                Ok(()) => flush(&mut engine, &socket),
                Err(e) => Err(e.into()),
            },
            _ = ticker.tick() => {
                let report = engine.tick(Instant::now());
                match report.reconnect {
                    Some(step) => match reconnect(&mut engine, step).await {
                        Some(fresh) => {
                            socket = fresh;
                            flush(&mut engine, &socket)
                        }
                        None => break 'serve,
                    },
                    None => Ok(()),
                }
            }
        };

        while let Err(e) = outcome {
            match recover(&mut engine, e).await {
                Some(fresh) => {
                    socket = fresh;
                    outcome = flush(&mut engine, &socket);
                }
                None => break 'serve,
            }
        }
    }

    info!("RPC client task for {:?} finished", engine.peer());
    engine.close();
}
