//! Background service lifecycle
//!
//! Long-running maintenance tasks (currently purge) implement [`Service`] and
//! are driven by a [`ServiceManager`]. The manager spawns each service on the
//! tokio runtime and stops them all by flipping one [`ShutdownSignal`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A background task managed by [`ServiceManager`]
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until `shutdown` fires
    async fn start(&self, shutdown: ShutdownSignal) -> Result<(), ServiceError>;

    /// Unique name, used for lookups and in logs
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;
}

/// Lifecycle state of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Registered, not started yet
    Idle,
    /// Running
    Running,
    /// Stopped after a shutdown request
    Stopped,
    /// Ended with an error
    Failed(String),
}

impl ServiceStatus {
    /// Whether the service is running
    pub fn is_healthy(&self) -> bool {
        *self == ServiceStatus::Running
    }

    /// Whether the service has ended, cleanly or not
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

/// Errors of the service lifecycle
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The service failed while running
    #[error("service failed: {0}")]
    Failed(String),

    /// A service with the same name is already registered
    #[error("duplicate service name: {0}")]
    DuplicateName(&'static str),

    /// `start_all` called on a manager that is already running
    #[error("services already started")]
    AlreadyStarted,

    /// No service registered under this name
    #[error("unknown service: {0}")]
    NotFound(String),

    /// Services still running when the shutdown deadline passed
    #[error("services did not stop in time: {0:?}")]
    StopTimeout(Vec<&'static str>),
}

/// Shutdown notification handed to every service
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Signal paired with the sender that triggers it
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether shutdown was requested
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested, or the manager is gone
    pub async fn triggered(&mut self) {
        // An error means the sender was dropped, which also ends the service
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Service manager configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Time allowed for all services to stop
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

struct Registered {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
    started_at: Option<Instant>,
}

/// Starts registered services and stops them together
pub struct ServiceManager {
    config: ServiceConfig,
    services: Mutex<BTreeMap<&'static str, Registered>>,
    stop_tx: watch::Sender<bool>,
    signal: ShutdownSignal,
}

impl ServiceManager {
    /// Create a manager
    pub fn new(config: ServiceConfig) -> Self {
        let (stop_tx, signal) = ShutdownSignal::channel();
        Self {
            config,
            services: Mutex::new(BTreeMap::new()),
            stop_tx,
            signal,
        }
    }

    /// Manager with a 30 second shutdown deadline
    pub fn with_defaults() -> Self {
        Self::new(ServiceConfig::default())
    }

    /// Add a service; names must be unique
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.lock();
        if services.contains_key(name) {
            return Err(ServiceError::DuplicateName(name));
        }
        services.insert(
            name,
            Registered {
                service,
                task: None,
                started_at: None,
            },
        );
        debug!(service = name, "service registered");
        Ok(())
    }

    /// Spawn every registered service on the current runtime
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        let mut services = self.services.lock();
        if services.values().any(|r| r.task.is_some()) {
            return Err(ServiceError::AlreadyStarted);
        }
        self.stop_tx.send_replace(false);

        for (name, registered) in services.iter_mut() {
            let service = registered.service.clone();
            let signal = self.signal.clone();
            registered.task = Some(tokio::spawn(async move { service.start(signal).await }));
            registered.started_at = Some(Instant::now());
            debug!(service = *name, "service started");
        }
        info!(count = services.len(), "services started");
        Ok(())
    }

    /// Request shutdown and wait for every service to end
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("stopping services");
        self.stop_tx.send_replace(true);

        let tasks: Vec<_> = self
            .services
            .lock()
            .iter_mut()
            .filter_map(|(name, r)| {
                r.started_at = None;
                r.task.take().map(|task| (*name, task))
            })
            .collect();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut late = Vec::new();
        for (name, task) in tasks {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(Ok(()))) => debug!(service = name, "service stopped"),
                Ok(Ok(Err(e))) => error!(service = name, error = %e, "service ended with error"),
                Ok(Err(e)) => error!(service = name, error = %e, "service task panicked"),
                Err(_) => {
                    warn!(service = name, "service still running at shutdown deadline");
                    late.push(name);
                }
            }
        }

        if late.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::StopTimeout(late))
        }
    }

    /// Status of every registered service, by name
    pub fn status(&self) -> BTreeMap<&'static str, ServiceStatus> {
        self.services
            .lock()
            .iter()
            .map(|(name, r)| (*name, r.service.status()))
            .collect()
    }

    /// Status of one service
    pub fn service_status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        self.services
            .lock()
            .get(name)
            .map(|r| r.service.status())
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Time since a running service was started
    pub fn uptime(&self, name: &str) -> Option<Duration> {
        self.services
            .lock()
            .get(name)
            .and_then(|r| r.started_at)
            .map(|at| at.elapsed())
    }

    /// Whether services were started and not shut down since
    pub fn is_running(&self) -> bool {
        self.services.lock().values().any(|r| r.task.is_some())
    }
}
