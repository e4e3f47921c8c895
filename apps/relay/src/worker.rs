//! Worker process: one single-threaded cooperative runtime serving dozens
//! of clients.
//!
//! Every worker binds its own `SO_REUSEPORT` listener so the kernel shards
//! accepted connections across workers with no coordination. Inside a
//! worker everything runs on a `LocalSet`: per-connection tasks, the
//! maintenance timer and the accept loop cooperate on one thread, which is
//! what lets pools and registries use plain `Rc` and `Cell`.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::RelayError;
use crate::http::{self, HttpRequest, Method, Status};
use crate::sendq::{ChunkData, ClientSink, SendCounters};
use crate::service::{Service, Upstream};
use crate::status::{ClientSnapshot, ClientState, StatusWriter, WorkerCounters};
use crate::stream::fcc::FccDriver;
use crate::stream::multicast::{MulticastDriver, MulticastRegistry};
use crate::stream::pipeline::RtpPipeline;
use crate::stream::{proxy, rtsp};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Cooperative shutdown signal. Single-threaded, so the check-then-wait
/// pattern has no race: nothing can trigger between the check and the
/// await of the same task.
#[derive(Default)]
pub struct Shutdown {
    active: Cell<bool>,
    notify: tokio::sync::Notify,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.active.set(true);
        self.notify.notify_waiters();
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub async fn wait(&self) {
        if self.active.get() {
            return;
        }
        self.notify.notified().await;
    }
}

pub struct WorkerCtx {
    pub config: Config,
    pub dispatcher: Dispatcher,
    /// Payload slots.
    pub pool: BufferPool,
    /// Small pool for protocol message buffers (request heads).
    pub control_pool: BufferPool,
    pub registry: MulticastRegistry,
    pub status: StatusWriter,
    pub shutdown: Rc<Shutdown>,
    counters: RefCell<WorkerCounters>,
    active: Cell<usize>,
    next_client: Cell<u64>,
}

impl WorkerCtx {
    fn client_id(&self) -> u64 {
        let id = self.next_client.get() + 1;
        self.next_client.set(id);
        id
    }

    fn publish_counters(&self) {
        let mut counters = self.counters.borrow_mut();
        counters.pool = self.pool.stats();
        counters.clients_active = self.active.get() as u64;
        self.status.set_counters(&counters);
    }

    fn absorb_send_counters(&self, send: SendCounters) {
        let mut counters = self.counters.borrow_mut();
        let total = &mut counters.send;
        total.sends += send.sends;
        total.batches += send.batches;
        total.bytes_sent += send.bytes_sent;
        total.completions += send.completions;
        total.copied += send.copied;
        total.eagain += send.eagain;
        total.enobufs += send.enobufs;
    }
}

/// Worker entry point: build the runtime and serve until told to stop.
pub fn run(config: Config, worker_id: usize) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(&config)?;
    let status = StatusWriter::create(&config.status.dir, worker_id, config.status.capacity)?;
    let pool = BufferPool::new(config.buffers.pool_size, config.buffers.pool_max);
    let control_pool = BufferPool::new(
        config.buffers.control_pool_size,
        config.buffers.control_pool_size,
    );

    let ctx = Rc::new(WorkerCtx {
        dispatcher,
        pool,
        control_pool,
        registry: MulticastRegistry::new(),
        status,
        shutdown: Rc::new(Shutdown::default()),
        counters: RefCell::new(WorkerCounters::default()),
        active: Cell::new(0),
        next_client: Cell::new(0),
        config,
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    runtime.block_on(
        local.run_until(serve(ctx).instrument(info_span!("worker", id = worker_id))),
    )?;
    Ok(())
}

async fn serve(ctx: Rc<WorkerCtx>) -> anyhow::Result<()> {
    let listener = bind_reuseport(ctx.config.server.listen)?;
    let listener = TcpListener::from_std(listener)?;
    info!(listen = %ctx.config.server.listen, "worker accepting");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    {
        let ctx = ctx.clone();
        tokio::task::spawn_local(async move { maintenance(ctx).await });
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => accept_client(&ctx, stream, peer),
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    info!("draining worker");
    ctx.shutdown.trigger();
    let deadline = Instant::now() + Duration::from_secs(ctx.config.server.drain_secs);
    while ctx.active.get() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(active = ctx.active.get(), "worker exiting");
    Ok(())
}

async fn maintenance(ctx: Rc<WorkerCtx>) {
    let rejoin_every = ctx.config.multicast.rejoin_interval_secs;
    let mut ticks: u64 = 0;
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        interval.tick().await;
        ticks += 1;
        let now = Instant::now();
        ctx.pool.maintain(now);
        ctx.control_pool.maintain(now);
        ctx.publish_counters();
        if rejoin_every > 0 && ticks % rejoin_every == 0 {
            ctx.registry.rejoin_all();
        }
    }
}

fn accept_client(ctx: &Rc<WorkerCtx>, stream: TcpStream, peer: SocketAddr) {
    if ctx.shutdown.is_active() {
        return;
    }
    if ctx.active.get() >= ctx.config.server.max_clients {
        debug!(%peer, "worker at capacity");
        tokio::task::spawn_local(async move {
            let _ = respond_error(stream, Status::ServiceUnavailable).await;
        });
        return;
    }

    let ctx = ctx.clone();
    tokio::task::spawn_local(async move {
        let client_id = ctx.client_id();
        ctx.active.set(ctx.active.get() + 1);
        {
            let mut counters = ctx.counters.borrow_mut();
            counters.clients_total += 1;
        }

        let mut report = Report {
            client_id,
            peer,
            service: String::new(),
            state: ClientState::Accepting,
            connected_at: Instant::now(),
        };
        let result = serve_client(&ctx, stream, &mut report).await;
        match &result {
            Ok(()) => debug!(%peer, "connection finished"),
            Err(err) if err.is_client_gone() => debug!(%peer, "client disconnected"),
            Err(err) => warn!(%peer, %err, "connection failed"),
        }

        report.state = ClientState::Closed;
        ctx.active.set(ctx.active.get() - 1);
    });
}

struct Report {
    client_id: u64,
    peer: SocketAddr,
    service: String,
    state: ClientState,
    connected_at: Instant,
}

impl Report {
    fn snapshot(&self, sink: Option<&ClientSink>) -> ClientSnapshot {
        let duration = self.connected_at.elapsed();
        let (bytes_sent, queue_bytes, highwater, dropped, slow) = match sink {
            Some(sink) => {
                let queue = sink.queue();
                (
                    sink.counters().bytes_sent,
                    queue.queued_bytes() as u64,
                    queue.highwater() as u64,
                    queue.dropped_bytes(),
                    queue.is_slow(),
                )
            }
            None => (0, 0, 0, 0, false),
        };
        let bandwidth_bps = if duration.as_secs() > 0 {
            bytes_sent * 8 / duration.as_secs()
        } else {
            0
        };
        ClientSnapshot {
            client_id: self.client_id,
            worker_pid: std::process::id(),
            remote_addr: self.peer.to_string(),
            service_url: self.service.clone(),
            state: self.state,
            bytes_sent,
            bandwidth_bps,
            queue_bytes,
            queue_highwater: highwater,
            dropped_bytes: dropped,
            slow,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

async fn serve_client(
    ctx: &Rc<WorkerCtx>,
    mut stream: TcpStream,
    report: &mut Report,
) -> Result<(), RelayError> {
    let _ = stream.set_nodelay(true);

    report.state = ClientState::ParsingRequest;
    let request = match read_request(ctx, &mut stream).await {
        Ok(request) => request,
        Err(err) => {
            let _ = respond_error(stream, Status::BadRequest).await;
            return Err(err);
        }
    };

    if let Method::Other(method) = &request.method {
        debug!(method, "unsupported method");
        return respond_error(stream, Status::NotImplemented).await;
    }

    report.state = ClientState::Dispatching;
    let service = match ctx.dispatcher.dispatch(&request) {
        Dispatch::Stream(service) => service,
        Dispatch::Snapshot(service) => {
            // Snapshot generation lives outside the streaming core; without
            // a generator wired in, the honest answer is 404.
            debug!(path = %service.path, "snapshot requested but no generator configured");
            return respond_error(stream, Status::NotFound).await;
        }
        Dispatch::NotFound => return respond_error(stream, Status::NotFound).await,
        Dispatch::Unauthorized => return respond_error(stream, Status::Unauthorized).await,
        Dispatch::BadHost => return respond_error(stream, Status::BadRequest).await,
    };
    report.service = service.path.clone();

    if request.method == Method::Head {
        let head = http::response_head(Status::Ok, Some(http::CONTENT_TYPE_MPEGTS));
        stream.write_all(&head).await?;
        return Ok(());
    }

    let mut sink = ClientSink::new(
        stream,
        ctx.config.queue,
        ctx.config.server.zerocopy,
    );
    let head = http::response_head(Status::Ok, Some(http::CONTENT_TYPE_MPEGTS));
    let head_len = head.len();
    sink.enqueue(ChunkData::Shared(head), 0, head_len, Instant::now());
    sink.try_flush()?;

    report.state = initial_state(&service);
    ctx.status.push(&report.snapshot(Some(&sink)));

    let result = run_service(ctx, &service, &request, &mut sink, report).await;

    // Drain whatever is still queued, bounded, then record the final word.
    if result.is_ok() && !ctx.shutdown.is_active() {
        let _ = sink
            .drain(Instant::now() + Duration::from_secs(1))
            .await;
    } else if ctx.shutdown.is_active() {
        report.state = ClientState::Draining;
        let deadline = Instant::now() + Duration::from_secs(ctx.config.server.drain_secs);
        let _ = sink.drain(deadline).await;
    }

    ctx.absorb_send_counters(sink.counters());
    report.state = ClientState::Closed;
    ctx.status.push(&report.snapshot(Some(&sink)));
    result
}

fn initial_state(service: &Service) -> ClientState {
    match (&service.upstream, service.fcc.is_some()) {
        (Upstream::MulticastRtp { .. }, true) => ClientState::FccBurst,
        (Upstream::MulticastRtp { .. }, false) | (Upstream::MulticastUdp { .. }, false) => {
            ClientState::LiveMulticast
        }
        (Upstream::Rtsp { .. }, _) => ClientState::Rtsp,
        (Upstream::HttpProxy { .. }, _) => ClientState::HttpProxy,
        _ => ClientState::LiveMulticast,
    }
}

async fn run_service(
    ctx: &Rc<WorkerCtx>,
    service: &Service,
    request: &HttpRequest,
    sink: &mut ClientSink,
    report: &mut Report,
) -> Result<(), RelayError> {
    let shutdown = ctx.shutdown.clone();
    match &service.upstream {
        Upstream::MulticastRtp {
            group,
            port,
            fec_port,
            source,
            payload_type,
        } => {
            if let Some(spec) = service.fcc {
                let mut driver = FccDriver::open(
                    &ctx.config,
                    &ctx.registry,
                    ctx.pool.clone(),
                    *group,
                    *port,
                    *fec_port,
                    *payload_type,
                    spec,
                )?;
                let result = run_with_shutdown(&shutdown, driver.run(sink)).await;
                driver.teardown();
                report.state = ClientState::LiveMulticast;
                result
            } else {
                let fec = fec_port.map(|_| ctx.config.fec);
                let pipeline =
                    RtpPipeline::new(&ctx.config.reorder, fec.as_ref(), *payload_type);
                let mut driver = MulticastDriver::open(
                    &ctx.config,
                    &ctx.registry,
                    ctx.pool.clone(),
                    *group,
                    *port,
                    *fec_port,
                    *source,
                    Some(pipeline),
                )?;
                run_with_shutdown(&shutdown, driver.run(sink)).await
            }
        }
        Upstream::MulticastUdp { group, port } => {
            let mut driver = MulticastDriver::open(
                &ctx.config,
                &ctx.registry,
                ctx.pool.clone(),
                *group,
                *port,
                None,
                None,
                None,
            )?;
            run_with_shutdown(&shutdown, driver.run(sink)).await
        }
        Upstream::Rtsp { url } => {
            // The RTSP driver watches the shutdown signal itself so its
            // TEARDOWN still goes out during a drain.
            rtsp::run(url, request, &ctx.config, ctx.pool.clone(), sink, &shutdown).await
        }
        Upstream::HttpProxy { url } => {
            run_with_shutdown(
                &shutdown,
                proxy::run(
                    url,
                    request,
                    ctx.config.server.upstream_interface.as_deref(),
                    sink,
                ),
            )
            .await
        }
    }
}

/// Run a driver until it finishes or the worker begins draining. The
/// driver future is dropped on shutdown; protocol-level goodbyes happen in
/// the per-driver teardown that follows.
async fn run_with_shutdown<F>(shutdown: &Shutdown, driver: F) -> Result<(), RelayError>
where
    F: std::future::Future<Output = Result<(), RelayError>>,
{
    tokio::select! {
        result = driver => result,
        _ = shutdown.wait() => Ok(()),
    }
}

/// Read and parse the request head, using a control-pool buffer as the
/// receive scratch.
async fn read_request(
    ctx: &Rc<WorkerCtx>,
    stream: &mut TcpStream,
) -> Result<HttpRequest, RelayError> {
    let deadline = Instant::now() + REQUEST_TIMEOUT;
    let mut scratch = ctx.control_pool.acquire();
    let mut fallback = [0u8; 512];
    let mut head: Vec<u8> = Vec::new();

    loop {
        let space: &mut [u8] = match scratch.as_mut() {
            Some(buffer) => buffer.space(),
            None => fallback.as_mut_slice(),
        };
        let read = tokio::time::timeout_at(deadline.into(), stream.read(space)).await;
        let n = match read {
            Ok(Ok(0)) => return Err(RelayError::ClientGone),
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(RelayError::UpstreamTimeout(REQUEST_TIMEOUT)),
        };
        head.extend_from_slice(&space[..n]);

        match HttpRequest::parse(&head) {
            Ok(Some((request, _consumed))) => return Ok(request),
            Ok(None) => continue,
            Err(err) => {
                debug!(%err, "unparsable request head");
                return Err(RelayError::UpstreamProtocol(err.to_string()));
            }
        }
    }
}

async fn respond_error(mut stream: TcpStream, status: Status) -> Result<(), RelayError> {
    let head = http::response_head(status, None);
    stream.write_all(&head).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

fn bind_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuseport_listeners_share_an_address() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = bind_reuseport(addr).unwrap();
        let bound = first.local_addr().unwrap();
        let _second = bind_reuseport(bound).expect("second worker binds the same port");
    }

    #[test]
    fn shutdown_wait_returns_immediately_once_triggered() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let shutdown = Shutdown::default();
            shutdown.trigger();
            // Must not hang.
            tokio::time::timeout(Duration::from_millis(10), shutdown.wait())
                .await
                .expect("wait resolves after trigger");
            assert!(shutdown.is_active());
        });
    }
}
