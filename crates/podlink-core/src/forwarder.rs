//! Redirects dials for a symbolic address to an on-demand local tunnel.
//!
//! A [`Forwarder`] is built once per target address. [`Forwarder::run`]
//! allocates a local port, starts a tunnel session and drives it until it
//! ends; any number of tasks may call [`Forwarder::dial`] meanwhile. Dials
//! block on the [`ReadinessGate`] until the tunnel is ready (or has failed),
//! then connect to `127.0.0.1:<local port>`.
//!
//! A forwarder is single-use: once its session ends every later dial fails
//! with [`ForwardError::SessionTerminated`]. Build a new one to reconnect.

use crate::address::{split_host_port, RemoteTarget};
use crate::dial::{Dialer, TcpDialer};
use crate::error::{ForwardError, ForwardResult};
use crate::gate::{deadline_elapsed, GateState, ReadinessGate};
use crate::port::{LoopbackPortFinder, PortFinder};
use crate::session::{PortMapping, ReadySignal, SessionRequest, TunnelSessionFactory};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Redirects connections for one symbolic address through a tunnel.
pub struct Forwarder<D = TcpDialer> {
    network: String,
    addr: String,
    target: RemoteTarget,
    /// Local endpoint of the tunnel, or why there will never be one.
    gate: ReadinessGate,
    /// Set once the tunnel session has ended.
    terminal: OnceLock<ForwardError>,
    started: AtomicBool,
    port_finder: Arc<dyn PortFinder>,
    factory: Arc<dyn TunnelSessionFactory>,
    dialer: D,
}

impl Forwarder<TcpDialer> {
    /// Create a forwarder for `addr`, failing fast if it is not a symbolic
    /// `{name}.{scope}...` address.
    ///
    /// Nothing is started until [`run`](Self::run) is called.
    ///
    /// # Arguments
    ///
    /// * `network` - Network used for redirected dials, usually `"tcp"`.
    /// * `addr` - Symbolic address, e.g. `web-0.default.pod.cluster.local:8080`.
    /// * `factory` - Builds the tunnel session once `run` starts.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::InvalidAddress`] if no name and scope can be
    /// parsed from `addr`.
    pub fn new(
        network: impl Into<String>,
        addr: impl Into<String>,
        factory: Arc<dyn TunnelSessionFactory>,
    ) -> ForwardResult<Self> {
        let addr = addr.into();
        let target = RemoteTarget::parse(&addr)?;

        Ok(Self {
            network: network.into(),
            addr,
            target,
            gate: ReadinessGate::new(),
            terminal: OnceLock::new(),
            started: AtomicBool::new(false),
            port_finder: Arc::new(LoopbackPortFinder),
            factory,
            dialer: TcpDialer,
        })
    }
}

impl<D: Dialer> Forwarder<D> {
    /// Replace the local port allocator.
    pub fn with_port_finder(mut self, finder: impl PortFinder + 'static) -> Self {
        self.port_finder = Arc::new(finder);
        self
    }

    /// Replace the dialer used to reach the local tunnel endpoint.
    pub fn with_dialer<D2: Dialer>(self, dialer: D2) -> Forwarder<D2> {
        Forwarder {
            network: self.network,
            addr: self.addr,
            target: self.target,
            gate: self.gate,
            terminal: self.terminal,
            started: self.started,
            port_finder: self.port_finder,
            factory: self.factory,
            dialer,
        }
    }

    /// The symbolic address this forwarder was built for, port included.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Network passed to the dialer (`tcp`, `tcp4` or `tcp6`).
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Name and scope parsed from [`addr`](Self::addr).
    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Current readiness of the tunnel endpoint.
    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    /// Run the forwarder on a background task.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<ForwardResult<()>>
    where
        D: 'static,
    {
        let forwarder = Arc::clone(self);
        tokio::spawn(async move { forwarder.run(&cancel).await })
    }

    /// Start the tunnel and block until it ends or `cancel` fires.
    ///
    /// When this returns the gate is resolved and no later dial can succeed.
    /// Only the first call does anything; later calls return
    /// [`ForwardError::AlreadyRunning`].
    ///
    /// # Errors
    ///
    /// Setup failures (bad port, port allocation, session creation) are
    /// returned and also handed to every dial. A session that ends with an
    /// error has that error returned here, while dials only ever see
    /// [`ForwardError::SessionTerminated`]. Cancelling `cancel` is not an
    /// error.
    pub async fn run(&self, cancel: &CancellationToken) -> ForwardResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ForwardError::AlreadyRunning);
        }

        info!(addr = %self.addr, target = %self.target, "running port-forwarder");

        // Child token so the session is torn down when we return, whichever
        // side finishes first.
        let run_token = cancel.child_token();
        let result = self.run_session(&run_token).await;
        run_token.cancel();

        if let Err(err) = &result {
            warn!(addr = %self.addr, error = %err, "port-forwarder failed");
            self.gate.resolve_failed(err.clone());
        }
        let _ = self.terminal.set(ForwardError::SessionTerminated);
        self.gate.resolve_failed(ForwardError::SessionTerminated);

        info!(addr = %self.addr, "no longer running port-forwarder");
        result
    }

    async fn run_session(&self, run_token: &CancellationToken) -> ForwardResult<()> {
        let (_, remote_port) = split_host_port(&self.addr)?;

        let local_port = self
            .port_finder
            .find_port()
            .map_err(|e| ForwardError::PortAllocation(e.to_string()))?;

        let (ready, mut ready_rx) = ReadySignal::new();
        let request = SessionRequest {
            scope: self.target.scope.clone(),
            name: self.target.name.clone(),
            ports: vec![PortMapping {
                local: local_port,
                remote: remote_port,
            }],
        };
        let session = self.factory.new_session(run_token.clone(), request, ready)?;

        let forward = session.forward();
        tokio::pin!(forward);

        let mut awaiting_ready = true;
        let mut watching_cancel = true;
        loop {
            tokio::select! {
                result = &mut forward => {
                    // Once the tunnel has ended every dial sees the fixed
                    // sentinel, whatever the session reported.
                    self.gate.resolve_failed(ForwardError::SessionTerminated);
                    return result;
                }
                ready = &mut ready_rx, if awaiting_ready => {
                    awaiting_ready = false;
                    match ready {
                        Ok(bound) => {
                            let via = SocketAddr::from((Ipv4Addr::LOCALHOST, bound.unwrap_or(local_port)));
                            if self.gate.resolve_ready(via) {
                                info!(addr = %self.addr, via = %via, "ready to redirect connections");
                            }
                        }
                        Err(_) => debug!(addr = %self.addr, "session dropped its readiness signal"),
                    }
                }
                _ = run_token.cancelled(), if watching_cancel => {
                    watching_cancel = false;
                    // Waiting dials must not outlive a cancelled run, even if
                    // the session is slow to shut down.
                    self.gate.resolve_failed(ForwardError::SessionTerminated);
                }
            }
        }
    }

    /// Dial the tunnel endpoint, waiting for it to become ready first.
    ///
    /// `cancel` only affects this call. If it has fired, its error is
    /// returned regardless of the forwarder's state. It also governs the
    /// connect itself once the tunnel is ready.
    ///
    /// # Errors
    ///
    /// * [`ForwardError::Cancelled`] when `cancel` fires first.
    /// * The setup error of a failed [`run`](Self::run).
    /// * [`ForwardError::SessionTerminated`] once the tunnel has ended.
    /// * [`ForwardError::Dial`] when connecting to the local endpoint fails.
    pub async fn dial(&self, cancel: &CancellationToken) -> ForwardResult<D::Conn> {
        self.dial_until(cancel, None).await
    }

    /// Like [`dial`](Self::dial) with an overall deadline covering both the
    /// wait for readiness and the connect itself.
    pub async fn dial_timeout(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> ForwardResult<D::Conn> {
        self.dial_until(cancel, Some(Instant::now() + timeout)).await
    }

    async fn dial_until(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> ForwardResult<D::Conn> {
        let via = self.gate.wait_until(cancel, deadline).await?;

        if let Some(err) = self.terminal.get() {
            return Err(err.clone());
        }

        debug!(addr = %self.addr, via = %via, "redirecting dial call");
        let via = via.to_string();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ForwardError::Cancelled),
            _ = deadline_elapsed(deadline) => Err(ForwardError::DeadlineExceeded),
            result = self.dialer.dial(&self.network, &via) => result.map_err(|e| ForwardError::Dial {
                addr: via.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TunnelSession;
    use futures_util::future::BoxFuture;
    use std::io;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    const POD_ADDR: &str = "podA.ns1.pod.cluster.local:8080";

    /// How the fake session behaves once started.
    #[derive(Clone, Copy)]
    enum Readiness {
        After(Duration),
        Bound(u16),
        Never,
    }

    struct FakeSession {
        cancel: CancellationToken,
        ready: ReadySignal,
        readiness: Readiness,
        end: Option<oneshot::Receiver<ForwardResult<()>>>,
    }

    impl TunnelSession for FakeSession {
        fn forward(self: Box<Self>) -> BoxFuture<'static, ForwardResult<()>> {
            Box::pin(async move {
                let FakeSession {
                    cancel,
                    ready,
                    readiness,
                    end,
                } = *self;

                let _held = match readiness {
                    Readiness::After(delay) => {
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            ready.notify();
                        });
                        None
                    }
                    Readiness::Bound(port) => {
                        ready.notify_bound(port);
                        None
                    }
                    Readiness::Never => Some(ready),
                };

                let ended = async {
                    match end {
                        Some(rx) => rx.await.unwrap_or(Ok(())),
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    result = ended => result,
                }
            })
        }
    }

    struct FakeFactory {
        readiness: Readiness,
        fail: Option<ForwardError>,
        end: Mutex<Option<oneshot::Receiver<ForwardResult<()>>>>,
        requests: Mutex<Vec<SessionRequest>>,
    }

    impl FakeFactory {
        fn new(readiness: Readiness) -> Self {
            Self {
                readiness,
                fail: None,
                end: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: ForwardError) -> Self {
            Self {
                fail: Some(err),
                ..Self::new(Readiness::Never)
            }
        }

        /// Returns a sender that ends the session with the given result.
        fn with_end(self) -> (Self, oneshot::Sender<ForwardResult<()>>) {
            let (tx, rx) = oneshot::channel();
            *self.end.lock().unwrap() = Some(rx);
            (self, tx)
        }
    }

    impl TunnelSessionFactory for FakeFactory {
        fn new_session(
            &self,
            cancel: CancellationToken,
            request: SessionRequest,
            ready: ReadySignal,
        ) -> ForwardResult<Box<dyn TunnelSession>> {
            self.requests.lock().unwrap().push(request);
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            Ok(Box::new(FakeSession {
                cancel,
                ready,
                readiness: self.readiness,
                end: self.end.lock().unwrap().take(),
            }))
        }
    }

    /// Records dialed addresses instead of connecting.
    #[derive(Clone, Default)]
    struct RecordingDialer {
        seen: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Dialer for RecordingDialer {
        type Conn = String;

        fn dial<'a>(&'a self, network: &'a str, addr: &'a str) -> BoxFuture<'a, io::Result<String>> {
            Box::pin(async move {
                self.seen
                    .lock()
                    .unwrap()
                    .push((network.to_string(), addr.to_string()));
                Ok(addr.to_string())
            })
        }
    }

    /// Accepts the dial and never completes it.
    #[derive(Clone, Default)]
    struct StalledDialer {
        started: Arc<Mutex<usize>>,
    }

    impl Dialer for StalledDialer {
        type Conn = String;

        fn dial<'a>(&'a self, _network: &'a str, _addr: &'a str) -> BoxFuture<'a, io::Result<String>> {
            Box::pin(async move {
                *self.started.lock().unwrap() += 1;
                std::future::pending().await
            })
        }
    }

    fn forwarder(
        factory: Arc<FakeFactory>,
        dialer: RecordingDialer,
    ) -> Arc<Forwarder<RecordingDialer>> {
        let fwd = Forwarder::new("tcp", POD_ADDR, factory)
            .unwrap()
            .with_port_finder(|| -> io::Result<u16> { Ok(9000) })
            .with_dialer(dialer);
        Arc::new(fwd)
    }

    async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), fut)
            .await
            .expect("operation should not hang")
    }

    #[test]
    fn construction_rejects_non_symbolic_address() {
        let factory = Arc::new(FakeFactory::new(Readiness::Never));
        let err = Forwarder::new("tcp", "localhost:8080", factory.clone())
            .err()
            .unwrap();
        assert!(matches!(err, ForwardError::InvalidAddress(_)));
        assert!(factory.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dial_waits_for_readiness_then_redirects() {
        let factory = Arc::new(FakeFactory::new(Readiness::After(Duration::from_millis(50))));
        let dialer = RecordingDialer::default();
        let fwd = forwarder(factory.clone(), dialer.clone());

        let pending_dial = {
            let fwd = fwd.clone();
            tokio::spawn(async move { fwd.dial(&CancellationToken::new()).await })
        };

        let cancel = CancellationToken::new();
        let run = fwd.spawn(cancel.clone());

        let conn = within(pending_dial).await.unwrap().unwrap();
        assert_eq!(conn, "127.0.0.1:9000");
        assert_eq!(
            dialer.seen.lock().unwrap().as_slice(),
            &[("tcp".to_string(), "127.0.0.1:9000".to_string())]
        );

        let requests = factory.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![SessionRequest {
                scope: "ns1".to_string(),
                name: "podA".to_string(),
                ports: vec![PortMapping {
                    local: 9000,
                    remote: 8080
                }],
            }]
        );

        cancel.cancel();
        assert_eq!(within(run).await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn each_dial_opens_a_new_connection() {
        let factory = Arc::new(FakeFactory::new(Readiness::After(Duration::ZERO)));
        let dialer = RecordingDialer::default();
        let fwd = forwarder(factory, dialer.clone());
        let cancel = CancellationToken::new();
        let _run = fwd.spawn(cancel.clone());

        for _ in 0..3 {
            within(fwd.dial(&CancellationToken::new())).await.unwrap();
        }
        assert_eq!(dialer.seen.lock().unwrap().len(), 3);
        cancel.cancel();
    }

    #[tokio::test]
    async fn session_creation_error_is_returned_and_sticky() {
        let err = ForwardError::SessionCreation("pods \"podA\" not found".to_string());
        let factory = Arc::new(FakeFactory::failing(err.clone()));
        let fwd = forwarder(factory, RecordingDialer::default());

        assert_eq!(within(fwd.run(&CancellationToken::new())).await, Err(err.clone()));
        assert_eq!(within(fwd.dial(&CancellationToken::new())).await, Err(err));
    }

    #[tokio::test]
    async fn cancel_before_ready_releases_all_dials() {
        let factory = Arc::new(FakeFactory::new(Readiness::Never));
        let dialer = RecordingDialer::default();
        let fwd = forwarder(factory, dialer.clone());
        let cancel = CancellationToken::new();
        let run = fwd.spawn(cancel.clone());

        let early = {
            let fwd = fwd.clone();
            tokio::spawn(async move { fwd.dial(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(within(run).await.unwrap(), Ok(()));
        assert_eq!(
            within(early).await.unwrap(),
            Err(ForwardError::SessionTerminated)
        );
        assert_eq!(
            within(fwd.dial(&CancellationToken::new())).await,
            Err(ForwardError::SessionTerminated)
        );
        assert!(dialer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminated_session_fails_later_dials() {
        let (factory, end) = FakeFactory::new(Readiness::After(Duration::ZERO)).with_end();
        let dialer = RecordingDialer::default();
        let fwd = forwarder(Arc::new(factory), dialer.clone());
        let run = fwd.spawn(CancellationToken::new());

        within(fwd.dial(&CancellationToken::new())).await.unwrap();

        let lost = ForwardError::Session("lost connection to pod".to_string());
        end.send(Err(lost.clone())).unwrap();
        assert_eq!(within(run).await.unwrap(), Err(lost));

        for _ in 0..3 {
            assert_eq!(
                within(fwd.dial(&CancellationToken::new())).await,
                Err(ForwardError::SessionTerminated)
            );
        }
        assert_eq!(dialer.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_ending_before_ready_fails_dials_with_sentinel() {
        let (factory, end) = FakeFactory::new(Readiness::Never).with_end();
        let dialer = RecordingDialer::default();
        let fwd = forwarder(Arc::new(factory), dialer.clone());
        let run = fwd.spawn(CancellationToken::new());

        let waiting = {
            let fwd = fwd.clone();
            tokio::spawn(async move { fwd.dial(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let lost = ForwardError::Session("lost".to_string());
        end.send(Err(lost.clone())).unwrap();
        assert_eq!(within(run).await.unwrap(), Err(lost));

        assert_eq!(
            within(waiting).await.unwrap(),
            Err(ForwardError::SessionTerminated)
        );
        assert_eq!(
            within(fwd.dial(&CancellationToken::new())).await,
            Err(ForwardError::SessionTerminated)
        );
        assert_eq!(fwd.state(), GateState::Failed(ForwardError::SessionTerminated));
        assert!(dialer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_remote_port_fails_run() {
        let factory = Arc::new(FakeFactory::new(Readiness::Never));
        let fwd = Forwarder::new("tcp", "podA.ns1.pod.cluster.local", factory.clone())
            .unwrap()
            .with_dialer(RecordingDialer::default());

        let err = fwd.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ForwardError::InvalidAddress(_)));
        assert_eq!(fwd.dial(&CancellationToken::new()).await, Err(err));
        assert!(factory.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn port_allocation_failure_resolves_gate() {
        let factory = Arc::new(FakeFactory::new(Readiness::Never));
        let fwd = Forwarder::new("tcp", POD_ADDR, factory)
            .unwrap()
            .with_port_finder(|| -> io::Result<u16> {
                Err(io::Error::new(io::ErrorKind::AddrInUse, "no ports left"))
            })
            .with_dialer(RecordingDialer::default());

        let err = fwd.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, ForwardError::PortAllocation("no ports left".to_string()));
        assert_eq!(fwd.state(), GateState::Failed(err));
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let factory = Arc::new(FakeFactory::new(Readiness::After(Duration::ZERO)));
        let fwd = forwarder(factory.clone(), RecordingDialer::default());
        let cancel = CancellationToken::new();
        let run = fwd.spawn(cancel.clone());
        within(fwd.dial(&CancellationToken::new())).await.unwrap();

        assert_eq!(fwd.run(&cancel).await, Err(ForwardError::AlreadyRunning));
        assert_eq!(factory.requests.lock().unwrap().len(), 1);

        cancel.cancel();
        within(run).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancelled_dial_context_takes_precedence() {
        let factory = Arc::new(FakeFactory::new(Readiness::After(Duration::ZERO)));
        let dialer = RecordingDialer::default();
        let fwd = forwarder(factory, dialer.clone());
        let cancel = CancellationToken::new();
        let _run = fwd.spawn(cancel.clone());
        within(fwd.dial(&CancellationToken::new())).await.unwrap();

        let dial_cancel = CancellationToken::new();
        dial_cancel.cancel();
        assert_eq!(fwd.dial(&dial_cancel).await, Err(ForwardError::Cancelled));
        assert_eq!(dialer.seen.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn dial_timeout_leaves_forwarder_running() {
        let factory = Arc::new(FakeFactory::new(Readiness::Never));
        let fwd = forwarder(factory, RecordingDialer::default());
        let cancel = CancellationToken::new();
        let run = fwd.spawn(cancel.clone());

        let result = fwd
            .dial_timeout(&CancellationToken::new(), Duration::from_millis(30))
            .await;
        assert_eq!(result, Err(ForwardError::DeadlineExceeded));
        assert_eq!(fwd.state(), GateState::Pending);
        assert!(!run.is_finished());

        cancel.cancel();
        within(run).await.unwrap().unwrap();
    }

    fn stalled_forwarder(dialer: StalledDialer) -> Arc<Forwarder<StalledDialer>> {
        let factory = Arc::new(FakeFactory::new(Readiness::After(Duration::ZERO)));
        let fwd = Forwarder::new("tcp", POD_ADDR, factory)
            .unwrap()
            .with_port_finder(|| -> io::Result<u16> { Ok(9000) })
            .with_dialer(dialer);
        Arc::new(fwd)
    }

    async fn wait_until_ready<D: Dialer>(fwd: &Forwarder<D>) {
        within(fwd.gate.wait(&CancellationToken::new())).await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_an_in_flight_dial_returns_cancelled() {
        let dialer = StalledDialer::default();
        let fwd = stalled_forwarder(dialer.clone());
        let cancel = CancellationToken::new();
        let run = fwd.spawn(cancel.clone());
        wait_until_ready(&fwd).await;

        let dial_cancel = CancellationToken::new();
        let dial = {
            let fwd = fwd.clone();
            let dial_cancel = dial_cancel.clone();
            tokio::spawn(async move { fwd.dial(&dial_cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*dialer.started.lock().unwrap(), 1);

        dial_cancel.cancel();
        assert_eq!(within(dial).await.unwrap(), Err(ForwardError::Cancelled));
        assert!(!run.is_finished());
        assert_eq!(fwd.state(), GateState::Ready("127.0.0.1:9000".parse().unwrap()));

        cancel.cancel();
        assert_eq!(within(run).await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn in_flight_dial_times_out() {
        let dialer = StalledDialer::default();
        let fwd = stalled_forwarder(dialer.clone());
        let cancel = CancellationToken::new();
        let run = fwd.spawn(cancel.clone());
        wait_until_ready(&fwd).await;

        let result = within(fwd.dial_timeout(&CancellationToken::new(), Duration::from_millis(30))).await;
        assert_eq!(result, Err(ForwardError::DeadlineExceeded));
        assert_eq!(*dialer.started.lock().unwrap(), 1);
        assert!(!run.is_finished());

        cancel.cancel();
        assert_eq!(within(run).await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn session_reported_port_wins() {
        let factory = Arc::new(FakeFactory::new(Readiness::Bound(41000)));
        let fwd = forwarder(factory, RecordingDialer::default());
        let cancel = CancellationToken::new();
        let _run = fwd.spawn(cancel.clone());

        let conn = within(fwd.dial(&CancellationToken::new())).await.unwrap();
        assert_eq!(conn, "127.0.0.1:41000");
        cancel.cancel();
    }

    #[tokio::test]
    async fn dial_error_is_wrapped() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = Arc::new(FakeFactory::new(Readiness::After(Duration::ZERO)));
        let fwd = Arc::new(
            Forwarder::new("tcp", POD_ADDR, factory)
                .unwrap()
                .with_port_finder(move || -> io::Result<u16> { Ok(port) }),
        );
        let cancel = CancellationToken::new();
        let _run = fwd.spawn(cancel.clone());

        let err = within(fwd.dial(&CancellationToken::new())).await.unwrap_err();
        assert!(matches!(err, ForwardError::Dial { ref addr, .. } if *addr == format!("127.0.0.1:{port}")));
        cancel.cancel();
    }
}
