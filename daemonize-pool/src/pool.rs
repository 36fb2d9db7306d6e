use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::error::PoolError;

const ANONYMOUS: &str = "<anonymous>";

type AsyncFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type BlockingFn = Arc<dyn Fn() + Send + Sync>;

/// A pool of background daemons. Each daemon function is invoked over and
/// over on its own tokio task until the pool stops it.
///
/// All methods take `&self`; share the pool between callers with an `Arc`.
///
/// `stop` and `stop_all` are not meant to race each other. A `stop` that has
/// already claimed its daemon finishes normally if `stop_all` fires, but a
/// `stop` that arrives after `stop_all` released the name fails with
/// [`PoolError::UnknownName`].
///
/// A daemon function must not call `stop_all` on its own pool, nor `stop`
/// with its own name: both wait for the calling daemon to exit.
pub struct DaemonPool {
    registry: Arc<Mutex<Registry>>,
    /// Serializes `stop_all` calls. Never taken by `start` or `stop`.
    stopping_all: Mutex<()>,
    /// Parent of every generation's stop-all token; cancelled on drop.
    closed: CancellationToken,
    /// Every live daemon loop, across generations.
    running: TaskTracker,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Number of daemon loops still alive, named and anonymous.
    pub running: usize,
    /// Registered names, sorted.
    pub named: Vec<String>,
}

struct Registry {
    named: HashMap<String, NamedDaemon>,
    generation: Generation,
    registrations: u64,
}

/// The daemons started between two `stop_all` calls share one stop-all
/// token and one tracker.
struct Generation {
    id: u64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Generation {
    fn new(id: u64, closed: &CancellationToken) -> Self {
        Self {
            id,
            shutdown: closed.child_token(),
            tracker: TaskTracker::new(),
        }
    }
}

struct NamedDaemon {
    registration: u64,
    generation: u64,
    /// `None` while a `stop` call is waiting for the daemon to exit.
    stop: Option<StopHandle>,
}

struct StopHandle {
    request: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

enum Work {
    Async(AsyncFn),
    Blocking(BlockingFn),
}

enum Outcome {
    Completed,
    /// The call panicked (or its blocking thread was lost); carries the reason.
    Failed(String),
}

impl Work {
    fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Work::Async(Box::new(move || f().boxed()))
    }

    fn from_blocking<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Work::Blocking(Arc::new(f))
    }

    async fn run_once(&self) -> Outcome {
        match self {
            Work::Async(f) => match AssertUnwindSafe(async { f().await }).catch_unwind().await {
                Ok(()) => Outcome::Completed,
                Err(payload) => Outcome::Failed(panic_message(payload)),
            },
            Work::Blocking(f) => {
                let f = Arc::clone(f);
                match tokio::task::spawn_blocking(move || f()).await {
                    Ok(()) => Outcome::Completed,
                    Err(err) if err.is_panic() => Outcome::Failed(panic_message(err.into_panic())),
                    // Only seen while the runtime shuts down, which also drops
                    // this loop; kept so the match stays total.
                    Err(err) => Outcome::Failed(err.to_string()),
                }
            }
        }
    }
}

impl Default for DaemonPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonPool {
    /// An empty pool. Daemons are spawned on the ambient tokio runtime, so
    /// the `start*` methods must be called from within one.
    pub fn new() -> Self {
        let closed = CancellationToken::new();
        Self {
            registry: Arc::new(Mutex::new(Registry {
                named: HashMap::new(),
                generation: Generation::new(0, &closed),
                registrations: 0,
            })),
            stopping_all: Mutex::new(()),
            closed,
            running: TaskTracker::new(),
        }
    }

    /// Daemonize `f` anonymously. Only [`DaemonPool::stop_all`] stops it.
    pub async fn start<F, Fut>(&self, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start_anonymous(Work::from_async(f)).await;
    }

    /// Daemonize `f` under `name` so it can later be stopped on its own.
    pub async fn start_name<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<(), PoolError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start_named(name.into(), Work::from_async(f)).await
    }

    /// Like [`DaemonPool::start`], for a synchronous function. Every call
    /// runs on tokio's blocking thread pool.
    pub async fn start_blocking<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.start_anonymous(Work::from_blocking(f)).await;
    }

    /// Like [`DaemonPool::start_name`], for a synchronous function.
    pub async fn start_blocking_name<F>(&self, name: impl Into<String>, f: F) -> Result<(), PoolError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.start_named(name.into(), Work::from_blocking(f)).await
    }

    /// Stop the named daemon, waiting for its current call to return and its
    /// loop to exit. The name is free for reuse once this resolves.
    ///
    /// If the returned future is dropped early the daemon still stops, and
    /// its name is released as soon as it has exited.
    pub async fn stop(&self, name: &str) -> Result<(), PoolError> {
        let (registration, StopHandle { request, handle }) = {
            let mut registry = self.registry.lock().await;
            let entry = registry
                .named
                .get_mut(name)
                .ok_or_else(|| PoolError::UnknownName(name.to_owned()))?;
            let stop = entry
                .stop
                .take()
                .ok_or_else(|| PoolError::UnknownName(name.to_owned()))?;
            (entry.registration, stop)
        };

        // Spawned so the name is released even if this future is dropped.
        let release = tokio::spawn(release_when_exited(
            Arc::clone(&self.registry),
            name.to_owned(),
            registration,
            handle,
        ));
        // A closed receiver means the loop is already gone (stop-all or panic).
        let _ = request.send(());
        if let Err(err) = release.await {
            warn!(daemon = %name, error = %err, "releasing named daemon failed");
        }
        debug!(daemon = %name, running = self.running.len(), "stopped named daemon");
        Ok(())
    }

    /// Stop every daemon started so far, named or not, and wait for all of
    /// them to exit. Their names are released afterwards.
    ///
    /// Daemons started while this call is waiting are not affected.
    /// Concurrent `stop_all` calls run one after another, so each returns
    /// only once everything started before it has exited.
    pub async fn stop_all(&self) {
        let _gate = self.stopping_all.lock().await;
        let retired = {
            let mut registry = self.registry.lock().await;
            let next = Generation::new(registry.generation.id + 1, &self.closed);
            std::mem::replace(&mut registry.generation, next)
        };

        info!(
            generation = retired.id,
            running = retired.tracker.len(),
            "stopping all daemons",
        );
        retired.shutdown.cancel();
        retired.tracker.close();
        retired.tracker.wait().await;

        let mut registry = self.registry.lock().await;
        registry
            .named
            .retain(|_, entry| entry.generation != retired.id);
        info!(generation = retired.id, running = self.running.len(), "all daemons stopped");
    }

    /// Number of daemon loops currently alive.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Whether `name` is registered (running or being stopped).
    pub async fn contains(&self, name: &str) -> bool {
        self.registry.lock().await.named.contains_key(name)
    }

    /// Running-count and registered names, taken under one lock.
    pub async fn status(&self) -> PoolStatus {
        let registry = self.registry.lock().await;
        let mut named: Vec<String> = registry.named.keys().cloned().collect();
        named.sort();
        PoolStatus {
            running: self.running.len(),
            named,
        }
    }

    async fn start_anonymous(&self, work: Work) {
        let registry = self.registry.lock().await;
        self.spawn_locked(&registry, ANONYMOUS.to_owned(), work, None);
        debug!(running = self.running.len(), "started anonymous daemon");
    }

    async fn start_named(&self, name: String, work: Work) -> Result<(), PoolError> {
        let mut registry = self.registry.lock().await;
        if registry.named.contains_key(&name) {
            return Err(PoolError::DuplicateName(name));
        }

        let (request, stop_rx) = oneshot::channel();
        let handle = self.spawn_locked(&registry, name.clone(), work, Some(stop_rx));
        registry.registrations += 1;
        let entry = NamedDaemon {
            registration: registry.registrations,
            generation: registry.generation.id,
            stop: Some(StopHandle { request, handle }),
        };
        registry.named.insert(name.clone(), entry);
        debug!(daemon = %name, running = self.running.len(), "started named daemon");
        Ok(())
    }

    /// Must be called with the registry lock held so that neither `stop` nor
    /// `stop_all` can observe the pool between spawn and registration.
    fn spawn_locked(
        &self,
        registry: &Registry,
        label: String,
        work: Work,
        stop_rx: Option<oneshot::Receiver<()>>,
    ) -> JoinHandle<()> {
        let generation = &registry.generation;
        let daemon = run_daemon(label, work, generation.shutdown.clone(), stop_rx);
        // The generation tracker wraps the pool-wide one, so `running` has
        // already dropped by the time a `stop_all` wait completes.
        generation.tracker.spawn(self.running.track_future(daemon))
    }
}

impl Drop for DaemonPool {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn release_when_exited(
    registry: Arc<Mutex<Registry>>,
    name: String,
    registration: u64,
    handle: JoinHandle<()>,
) {
    if let Err(err) = handle.await {
        warn!(daemon = %name, error = %err, "named daemon did not finish cleanly");
    }

    let mut registry = registry.lock().await;
    if registry
        .named
        .get(&name)
        .is_some_and(|entry| entry.registration == registration)
    {
        registry.named.remove(&name);
    }
}

async fn run_daemon(
    label: String,
    work: Work,
    shutdown: CancellationToken,
    mut stop_rx: Option<oneshot::Receiver<()>>,
) {
    loop {
        match work.run_once().await {
            Outcome::Completed => {}
            Outcome::Failed(message) => {
                error!(daemon = %label, error = %message, "daemon call failed, daemon terminated");
                return;
            }
        }

        if shutdown.is_cancelled() {
            trace!(daemon = %label, "daemon observed stop-all");
            return;
        }
        if let Some(rx) = stop_rx.as_mut() {
            match rx.try_recv() {
                Ok(()) => {
                    trace!(daemon = %label, "daemon observed stop request");
                    return;
                }
                Err(oneshot::error::TryRecvError::Closed) => return,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }

        tokio::task::yield_now().await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use rstest::rstest;
    use serde_json::json;
    use tokio::time::{sleep, timeout};

    const DEADLINE: Duration = Duration::from_secs(10);

    fn init_logs() {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl Fn() -> BoxFuture<'static, ()> + Send + Sync {
        let counter = counter.clone();
        move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(1)).await;
            }
            .boxed()
        }
    }

    async fn wait_until_idle(pool: &DaemonPool) {
        timeout(DEADLINE, async {
            while pool.running() != 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("daemons never exited");
    }

    #[tokio::test]
    async fn stop_all_on_empty_pool_returns_immediately() {
        let pool = DaemonPool::default();
        timeout(Duration::from_secs(1), pool.stop_all())
            .await
            .expect("stop_all on an empty pool must not block");
        assert_eq!(pool.status().await, PoolStatus { running: 0, named: vec![] });
    }

    #[rstest]
    #[case(1)]
    #[case(10)]
    #[case(100)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_all_waits_for_every_anonymous_daemon(#[case] count: usize) {
        init_logs();
        let pool = DaemonPool::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..count {
            pool.start(counting(&calls)).await;
        }
        assert_eq!(pool.running(), count);

        timeout(DEADLINE, pool.stop_all()).await.expect("stop_all deadlocked");

        assert_eq!(pool.running(), 0);
        assert!(pool.status().await.named.is_empty());
        assert!(calls.load(Ordering::SeqCst) >= count, "every daemon runs at least once");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn daemon_function_is_called_repeatedly() {
        let pool = DaemonPool::new();
        let calls = Arc::new(AtomicUsize::new(0));
        pool.start_name("ticker", counting(&calls)).await.expect("start");

        timeout(DEADLINE, async {
            while calls.load(Ordering::SeqCst) < 5 {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("daemon was not restarted after returning");

        pool.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_name_can_be_started_again() {
        let pool = DaemonPool::new();
        let calls = Arc::new(AtomicUsize::new(0));

        pool.start_name("x", counting(&calls)).await.expect("first start");
        assert!(pool.contains("x").await);
        pool.stop("x").await.expect("stop");
        assert!(!pool.contains("x").await);
        assert_eq!(pool.running(), 0);

        pool.start_name("x", counting(&calls)).await.expect("restart under the same name");
        assert!(pool.contains("x").await);
        pool.stop_all().await;
        assert!(!pool.contains("x").await);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let pool = DaemonPool::new();
        let calls = Arc::new(AtomicUsize::new(0));
        pool.start_name("dup", counting(&calls)).await.expect("first start");

        let err = pool.start_name("dup", counting(&calls)).await.unwrap_err();
        assert_eq!(err, PoolError::DuplicateName("dup".into()));
        assert!(err.to_string().contains("already exists"));
        assert_eq!(pool.running(), 1, "rejected start must not spawn");

        pool.stop_all().await;
    }

    #[tokio::test]
    async fn unknown_name_is_rejected() {
        let pool = DaemonPool::new();
        let err = pool.stop("ghost").await.unwrap_err();
        assert_eq!(err, PoolError::UnknownName("ghost".into()));

        let calls = Arc::new(AtomicUsize::new(0));
        pool.start_name("once", counting(&calls)).await.expect("start");
        pool.stop("once").await.expect("first stop");
        assert_eq!(
            pool.stop("once").await,
            Err(PoolError::UnknownName("once".into()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_leaves_other_daemons_running() {
        let pool = DaemonPool::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        pool.start_name("a", counting(&a)).await.expect("start a");
        pool.start_name("b", counting(&b)).await.expect("start b");

        pool.stop("a").await.expect("stop a");
        let a_after_stop = a.load(Ordering::SeqCst);
        let b_after_stop = b.load(Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;

        assert_eq!(a.load(Ordering::SeqCst), a_after_stop, "a kept running after stop");
        assert!(b.load(Ordering::SeqCst) > b_after_stop, "b stopped along with a");
        assert_eq!(pool.status().await.named, vec!["b".to_string()]);

        pool.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_all_lets_in_flight_calls_finish() {
        let pool = DaemonPool::new();
        let entered = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        for i in 0..8 {
            let entered = entered.clone();
            let finished = finished.clone();
            pool.start_name(format!("slow-{i}"), move || {
                let entered = entered.clone();
                let finished = finished.clone();
                async move {
                    entered.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .expect("start");
        }
        sleep(Duration::from_millis(5)).await;

        pool.stop_all().await;

        assert_eq!(entered.load(Ordering::SeqCst), finished.load(Ordering::SeqCst));
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn name_stays_reserved_until_its_daemon_exits() {
        let pool = Arc::new(DaemonPool::new());
        pool.start_name("slow", || sleep(Duration::from_millis(300)))
            .await
            .expect("start");
        sleep(Duration::from_millis(20)).await;

        let stopper = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.stop("slow").await })
        };
        sleep(Duration::from_millis(50)).await;

        assert_eq!(
            pool.start_name("slow", || sleep(Duration::from_millis(1))).await,
            Err(PoolError::DuplicateName("slow".into()))
        );
        assert_eq!(
            pool.stop("slow").await,
            Err(PoolError::UnknownName("slow".into())),
            "a second stop must not claim a daemon that is already stopping"
        );

        stopper.await.expect("join").expect("stop");
        pool.start_name("slow", || sleep(Duration::from_millis(1)))
            .await
            .expect("name released after stop");
        pool.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn abandoned_stop_still_releases_the_name() {
        let pool = DaemonPool::new();
        pool.start_name("slow", || sleep(Duration::from_millis(200)))
            .await
            .expect("start");
        sleep(Duration::from_millis(20)).await;

        assert!(
            timeout(Duration::from_millis(20), pool.stop("slow")).await.is_err(),
            "stop should still be waiting on the slow call"
        );

        timeout(DEADLINE, async {
            while pool.contains("slow").await {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("name never released after the stop future was dropped");
        assert_eq!(pool.running(), 0);

        pool.start_name("slow", || sleep(Duration::from_millis(1)))
            .await
            .expect("name reusable");
        pool.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_is_reusable_after_stop_all() {
        let pool = DaemonPool::new();
        let calls = Arc::new(AtomicUsize::new(0));
        pool.start(counting(&calls)).await;
        pool.start_name("named", counting(&calls)).await.expect("start");
        pool.stop_all().await;

        let later = Arc::new(AtomicUsize::new(0));
        pool.start_name("named", counting(&later)).await.expect("name freed by stop_all");
        timeout(DEADLINE, async {
            while later.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("daemon started after stop_all never ran");

        pool.stop("named").await.expect("stop");
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_daemon_terminates_and_releases_its_count() {
        init_logs();
        let pool = DaemonPool::new();
        let calls = Arc::new(AtomicUsize::new(0));
        pool.start_name("boom", || async { panic!("daemon blew up") })
            .await
            .expect("start");
        pool.start_name("steady", counting(&calls)).await.expect("start");

        timeout(DEADLINE, async {
            while pool.running() != 1 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("panicking daemon never terminated");

        assert!(pool.contains("boom").await, "name stays registered until stopped");
        pool.stop("boom").await.expect("stopping a dead daemon succeeds");
        assert!(!pool.contains("boom").await);

        pool.stop_all().await;
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_daemons_follow_the_same_lifecycle() {
        let pool = DaemonPool::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            pool.start_blocking_name("poller", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
            })
            .await
            .expect("start");
        }
        for _ in 0..4 {
            pool.start_blocking(|| std::thread::sleep(Duration::from_millis(2))).await;
        }
        assert_eq!(pool.running(), 5);

        sleep(Duration::from_millis(20)).await;
        pool.stop("poller").await.expect("stop");
        let after_stop = calls.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        assert_eq!(pool.running(), 4);

        timeout(DEADLINE, pool.stop_all()).await.expect("stop_all deadlocked");
        assert_eq!(pool.running(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_blocking_daemon_terminates() {
        init_logs();
        let pool = DaemonPool::new();
        pool.start_blocking(|| panic!("blocking daemon blew up")).await;
        wait_until_idle(&pool).await;
        timeout(DEADLINE, pool.stop_all()).await.expect("stop_all deadlocked");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_the_pool_stops_its_daemons() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = DaemonPool::new();
        pool.start(counting(&calls)).await;
        pool.start_name("named", counting(&calls)).await.expect("start");
        drop(pool);

        sleep(Duration::from_millis(50)).await;
        let settled = calls.load(Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn status_serializes_running_count_and_sorted_names() {
        let pool = DaemonPool::new();
        let calls = Arc::new(AtomicUsize::new(0));
        pool.start_name("zeta", counting(&calls)).await.expect("start");
        pool.start_name("alpha", counting(&calls)).await.expect("start");

        let status = pool.status().await;
        assert_eq!(
            serde_json::to_value(&status).expect("serialize"),
            json!({ "running": 2, "named": ["alpha", "zeta"] })
        );

        pool.stop_all().await;
    }
}
