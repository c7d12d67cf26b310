//! Service lifecycle: the owner of every piece of shared state.

use crate::client::Client;
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::handoff::{HandoffRegistry, Pid, Process};
use crate::memory::{RegionId, RegionStore};
use crate::observability;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// The shared-memory service.
///
/// Owns the region store, the handoff registry and the registry of
/// processes. State is created by [`Service::start`] and torn down by
/// [`Service::shutdown`]; there are no globals.
///
/// # Example
///
/// ```rust
/// use ashfile::{HandoffKey, Service, ServiceConfig};
///
/// let service = Service::start(ServiceConfig::testing());
/// let producer = service.connect().unwrap();
/// let consumer = service.connect().unwrap();
///
/// let fd = producer.create("shared", 4096).unwrap();
/// producer.write(fd, 0, b"xyz").unwrap();
/// producer.publish(fd, HandoffKey::DEFAULT).unwrap();
///
/// let theirs = consumer.claim(HandoffKey::DEFAULT).unwrap();
/// let mapping = consumer.map(theirs).unwrap();
/// assert_eq!(&mapping.as_slice()[..3], b"xyz");
///
/// service.shutdown();
/// ```
pub struct Service {
    config: ServiceConfig,
    store: RegionStore,
    registry: HandoffRegistry,
    processes: Mutex<HashMap<Pid, Weak<Process>>>,
    next_pid: AtomicU32,
    running: AtomicBool,
}

impl Service {
    /// Initialize the service.
    pub fn start(config: ServiceConfig) -> Arc<Self> {
        observability::init_metrics();
        tracing::info!(
            page_size = config.page_size.get(),
            open_limit = config.open_limit,
            memory_quota = config.memory_quota,
            "service started"
        );
        Arc::new(Self {
            store: RegionStore::new(&config),
            registry: HandoffRegistry::new(),
            processes: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1),
            running: AtomicBool::new(true),
            config,
        })
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<Pid, Weak<Process>>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The configuration the service was started with.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The region store.
    pub fn store(&self) -> &RegionStore {
        &self.store
    }

    /// The handoff registry.
    pub fn registry(&self) -> &HandoffRegistry {
        &self.registry
    }

    /// True until [`shutdown`](Self::shutdown) is called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::ServiceStopped)
        }
    }

    /// Register a new process with the configured table limits.
    pub fn spawn_process(&self) -> Result<Arc<Process>> {
        self.ensure_running()?;
        let pid = Pid::from_raw(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let process = Arc::new(Process::new(pid, &self.config));

        let mut processes = self.processes();
        // Shutdown drains this map after clearing `running`; re-check under
        // the lock so a registration cannot slip in behind the drain.
        self.ensure_running()?;
        processes.retain(|_, weak| weak.strong_count() > 0);
        processes.insert(pid, Arc::downgrade(&process));
        tracing::debug!(%pid, "process registered");
        Ok(process)
    }

    /// Bind a client facade to an existing process.
    pub fn client(self: &Arc<Self>, process: Arc<Process>) -> Client {
        Client::new(Arc::clone(self), process)
    }

    /// Register a new process and return its client facade.
    pub fn connect(self: &Arc<Self>) -> Result<Client> {
        let process = self.spawn_process()?;
        Ok(self.client(process))
    }

    /// Number of live registered processes.
    pub fn process_count(&self) -> usize {
        self.processes()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Purge every purge-eligible region. Returns the pages discarded.
    pub fn purge_all(&self) -> usize {
        let pages = self.store.purge_all();
        tracing::debug!(pages, "purged all caches");
        pages
    }

    /// Memory pressure: purge least recently unpinned regions until at
    /// least `target_pages` pages are discarded.
    pub fn reclaim(&self, target_pages: usize) -> usize {
        let _span = observability::span_reclaim(&self.config.tracing, target_pages).entered();
        self.store.reclaim(target_pages)
    }

    /// Discard a fully unpinned region's pages regardless of its place on
    /// the reclaim list. Returns the pages discarded (zero if pinned).
    pub fn force_purge(&self, id: RegionId) -> Result<usize> {
        self.store.lookup(id)?.purge(true)
    }

    /// Stop the service: drop every offer, close every process's handles
    /// and forget every region. Pages are returned once the last mapping
    /// of each region goes away.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.registry.clear();

        let processes: Vec<Arc<Process>> = self
            .processes()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        let mut closed = 0;
        for process in &processes {
            closed += process.detach();
        }

        let remaining = self.store.len();
        self.store.clear();
        tracing::info!(
            processes = processes.len(),
            closed,
            mapped_regions = remaining,
            "service stopped"
        );
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("running", &self.is_running())
            .field("store", &self.store)
            .field("processes", &self.process_count())
            .finish()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}
