use std::{
    io::{self, Read, Write},
    mem,
    net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    slice,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use super::{
    TCP, TransferTask, Transport, TransportContext, TransportError,
    tcp_protocol::{self, RequestHeader, WireError, WireStatus},
    worker_pool::{SliceError, SliceExecutor, WorkerPool},
};
use crate::{
    api::OpCode,
    memory::{MemoryRegion, MemoryRegistry},
    metadata::{RpcEndpoint, SegmentDesc},
};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const SERVER_IO_TIMEOUT: Duration = Duration::from_secs(30);
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);
/// Connections served at once; further peers are dropped until one ends.
const MAX_CONNECTIONS: usize = 256;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TcpParams {
    /// Listen port; defaults to the engine's RPC port, `0` picks one.
    port: Option<u16>,
    /// Listen address; defaults to all interfaces.
    bind: Option<String>,
}

/// A served peer. `stream` is a clone of the socket the thread reads from.
struct Connection {
    stream: TcpStream,
    handle: JoinHandle<()>,
}

type Connections = Arc<Mutex<Vec<Connection>>>;

/// Socket transport between engines that have no RDMA path.
pub(crate) struct TcpTransport {
    endpoint: RpcEndpoint,
    wake_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    connections: Connections,
    pool: WorkerPool,
}

impl TcpTransport {
    pub(crate) fn start(ctx: &TransportContext, params: &str) -> Result<Self, TransportError> {
        let params: TcpParams = super::parse_params(TCP, params)?;
        let port = params.port.unwrap_or(ctx.identity.rpc_port);
        let bind = params.bind.unwrap_or_else(|| {
            if ctx.identity.host.contains(':') {
                "::".to_string()
            } else {
                "0.0.0.0".to_string()
            }
        });
        let bind_addr = if bind.contains(':') {
            format!("[{bind}]:{port}")
        } else {
            format!("{bind}:{port}")
        };

        let setup_error = |reason: String| TransportError::Setup {
            transport: TCP,
            reason,
        };
        let listener = TcpListener::bind(&bind_addr)
            .map_err(|error| setup_error(format!("bind {bind_addr}: {error}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| setup_error(error.to_string()))?;

        let executor = Arc::new(TcpClient {
            registry: Arc::clone(&ctx.registry),
            connect_timeout: ctx.tuning.connect_timeout,
        });
        let pool = WorkerPool::start(
            TCP,
            ctx.tuning.workers_per_transport,
            ctx.tuning.slice_size,
            executor,
        )?;

        let stopping = Arc::new(AtomicBool::new(false));
        let connections: Connections = Arc::new(Mutex::new(Vec::new()));
        let acceptor = {
            let registry = Arc::clone(&ctx.registry);
            let stopping = Arc::clone(&stopping);
            let connections = Arc::clone(&connections);
            thread::Builder::new()
                .name("segflow-tcp-accept".to_string())
                .spawn(move || accept_loop(listener, registry, stopping, connections))
        };
        let acceptor = match acceptor {
            Ok(handle) => handle,
            Err(error) => {
                pool.shutdown();
                return Err(setup_error(format!("spawn acceptor: {error}")));
            }
        };

        info!("tcp transport listening on {local_addr}");
        Ok(Self {
            endpoint: RpcEndpoint {
                host: ctx.identity.host.clone(),
                port: local_addr.port(),
            },
            wake_addr: wake_address(local_addr),
            stopping,
            acceptor: Mutex::new(Some(acceptor)),
            connections,
            pool,
        })
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        TCP
    }

    fn priority(&self) -> u8 {
        2
    }

    fn describe(&self, desc: &mut SegmentDesc) {
        desc.tcp = Some(self.endpoint.clone());
    }

    fn register_memory(&self, _region: &MemoryRegion) -> Result<(), TransportError> {
        Ok(())
    }

    fn unregister_memory(&self, _region: &MemoryRegion) -> Result<(), TransportError> {
        Ok(())
    }

    fn can_route(&self, _source: &MemoryRegion, target: &SegmentDesc) -> bool {
        target.supports(TCP) && target.tcp.is_some()
    }

    fn submit(&self, tasks: Vec<TransferTask>) -> Result<(), TransportError> {
        self.pool.submit(tasks)
    }

    /// Returns once no served connection can touch registered memory.
    fn shutdown(&self) {
        self.pool.shutdown();
        self.stopping.store(true, Ordering::Release);
        if let Some(handle) = self.acceptor.lock().take() {
            // A throwaway connection unblocks the pending accept.
            match TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT) {
                Ok(_) => {
                    if handle.join().is_err() {
                        warn!("tcp acceptor thread panicked");
                    }
                }
                Err(error) => warn!("cannot wake tcp acceptor on {}: {error}", self.wake_addr),
            }
        }

        let connections = mem::take(&mut *self.connections.lock());
        for connection in connections {
            let _ = connection.stream.shutdown(Shutdown::Both);
            if connection.handle.join().is_err() {
                warn!("tcp connection thread panicked");
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Loopback address of the listener's family when it is bound to all
/// interfaces.
fn wake_address(local: SocketAddr) -> SocketAddr {
    let mut addr = local;
    if addr.ip().is_unspecified() {
        match addr {
            SocketAddr::V4(_) => addr.set_ip(Ipv4Addr::LOCALHOST.into()),
            SocketAddr::V6(_) => addr.set_ip(Ipv6Addr::LOCALHOST.into()),
        }
    }
    addr
}

fn accept_loop(
    listener: TcpListener,
    registry: Arc<MemoryRegistry>,
    stopping: Arc<AtomicBool>,
    connections: Connections,
) {
    loop {
        let accepted = listener.accept();
        if stopping.load(Ordering::Acquire) {
            break;
        }
        match accepted {
            Ok((stream, peer)) => admit(stream, peer, &registry, &stopping, &connections),
            Err(error) => {
                warn!("tcp accept failed: {error}");
                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }
    debug!("tcp acceptor stopped");
}

fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<MemoryRegistry>,
    stopping: &Arc<AtomicBool>,
    connections: &Connections,
) {
    let mut connections = connections.lock();
    // Checked under the lock so shutdown never misses a connection.
    if stopping.load(Ordering::Acquire) {
        return;
    }
    reap_finished(&mut connections);
    if connections.len() >= MAX_CONNECTIONS {
        warn!("dropping tcp connection from {peer}: {MAX_CONNECTIONS} already served");
        return;
    }
    let control = match stream.try_clone() {
        Ok(control) => control,
        Err(error) => {
            warn!("cannot serve tcp connection from {peer}: {error}");
            return;
        }
    };

    let registry = Arc::clone(registry);
    let stopping = Arc::clone(stopping);
    let spawned = thread::Builder::new()
        .name("segflow-tcp-conn".to_string())
        .spawn(move || {
            if let Err(error) = serve_connection(stream, &registry, &stopping) {
                debug!("tcp connection from {peer} ended: {error}");
            }
        });
    match spawned {
        Ok(handle) => connections.push(Connection {
            stream: control,
            handle,
        }),
        Err(error) => warn!("cannot serve tcp connection from {peer}: {error}"),
    }
}

fn reap_finished(connections: &mut Vec<Connection>) {
    let mut idx = 0;
    while idx < connections.len() {
        if connections[idx].handle.is_finished() {
            let connection = connections.swap_remove(idx);
            if connection.handle.join().is_err() {
                warn!("tcp connection thread panicked");
            }
        } else {
            idx += 1;
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    registry: &MemoryRegistry,
    stopping: &AtomicBool,
) -> Result<(), WireError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(SERVER_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(SERVER_IO_TIMEOUT))?;

    let Some(header) = tcp_protocol::read_request(&mut stream)? else {
        return Ok(());
    };
    if stopping.load(Ordering::Acquire) {
        return Ok(());
    }
    let Ok(len) = usize::try_from(header.len) else {
        return tcp_protocol::write_status(&mut stream, WireStatus::BadRequest);
    };
    let allowed = len > 0
        && registry
            .find_remote_accessible(header.addr, header.len)
            .is_some();

    match header.opcode {
        OpCode::Write => {
            if allowed {
                // SAFETY: the range lies inside a remote-accessible region
                // registered with this engine, and shutdown joins this thread
                // before the engine lets go of its registrations.
                let target = unsafe { slice::from_raw_parts_mut(header.addr as *mut u8, len) };
                stream.read_exact(target)?;
                tcp_protocol::write_status(&mut stream, WireStatus::Ok)
            } else {
                io::copy(&mut (&mut stream).take(header.len), &mut io::sink())?;
                tcp_protocol::write_status(&mut stream, WireStatus::AccessDenied)
            }
        }
        OpCode::Read => {
            if !allowed {
                return tcp_protocol::write_status(&mut stream, WireStatus::AccessDenied);
            }
            tcp_protocol::write_status(&mut stream, WireStatus::Ok)?;
            // SAFETY: as above.
            let source = unsafe { slice::from_raw_parts(header.addr as *const u8, len) };
            stream.write_all(source)?;
            Ok(())
        }
    }
}

struct TcpClient {
    registry: Arc<MemoryRegistry>,
    connect_timeout: Duration,
}

fn io_failure(context: &str, error: io::Error) -> SliceError {
    match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            SliceError::Timeout(format!("{context}: {error}"))
        }
        _ => SliceError::Failed(format!("{context}: {error}")),
    }
}

fn wire_failure(context: &str, error: WireError) -> SliceError {
    match error {
        WireError::Io(error) => io_failure(context, error),
        other => SliceError::Failed(format!("{context}: {other}")),
    }
}

impl TcpClient {
    fn connect(&self, endpoint: &RpcEndpoint, deadline: Instant) -> Result<TcpStream, SliceError> {
        let name = endpoint.socket_addr();
        let addrs: Vec<SocketAddr> = name
            .to_socket_addrs()
            .map_err(|error| SliceError::Failed(format!("resolve {name}: {error}")))?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            let timeout = self
                .connect_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            if timeout.is_zero() {
                return Err(SliceError::Timeout(format!("connect {name}: deadline passed")));
            }
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(error) => last_error = Some(error),
            }
        }
        Err(match last_error {
            Some(error) => io_failure(&format!("connect {name}"), error),
            None => SliceError::Failed(format!("resolve {name}: no addresses")),
        })
    }
}

impl SliceExecutor for TcpClient {
    fn execute(&self, task: &TransferTask, offset: u64, len: u64) -> Result<(), SliceError> {
        let Some(endpoint) = task.target.tcp.as_ref() else {
            return Err(SliceError::Failed(format!(
                "segment `{}` publishes no tcp endpoint",
                task.target.name
            )));
        };
        let source = task.source + offset;
        if self.registry.find(source, len).is_none() {
            return Err(SliceError::Failed(format!(
                "source {source:#x}+{len} is no longer registered"
            )));
        }

        let mut stream = self.connect(endpoint, task.deadline)?;
        let io_timeout = task
            .deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        stream
            .set_read_timeout(Some(io_timeout))
            .and_then(|()| stream.set_write_timeout(Some(io_timeout)))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|error| io_failure("configure socket", error))?;

        let header = RequestHeader {
            opcode: task.opcode,
            addr: task.target_addr + offset,
            len,
        };
        // SAFETY: `source` was checked against the registry above and the
        // caller keeps registered memory alive until it is unregistered.
        let local = unsafe { slice::from_raw_parts_mut(source as *mut u8, len as usize) };

        tcp_protocol::write_request(&mut stream, &header)
            .map_err(|error| wire_failure("send header", error))?;
        if task.opcode == OpCode::Write {
            stream
                .write_all(local)
                .map_err(|error| io_failure("send payload", error))?;
        }
        match tcp_protocol::read_status(&mut stream)
            .map_err(|error| wire_failure("read status", error))?
        {
            WireStatus::Ok => {}
            status => {
                return Err(SliceError::Failed(format!(
                    "peer `{}` rejected {:#x}+{len}: {status:?}",
                    task.target.name, header.addr
                )));
            }
        }
        if task.opcode == OpCode::Read {
            stream
                .read_exact(local)
                .map_err(|error| io_failure("read payload", error))?;
        }
        Ok(())
    }
}
