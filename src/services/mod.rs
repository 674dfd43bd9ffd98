//! Background services
//!
//! - **ServiceManager**: starts registered services and stops them on shutdown
//! - **PurgeService**: runs [`PurgeManager`] on a schedule (daily by default)
//!
//! # Example
//!
//! ```rust
//! use kuba_pointvalues::services::{ServiceConfig, ServiceManager};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert_eq!(manager.status().len(), 0);
//! ```

pub mod framework;
pub mod purge;

pub use framework::{
    Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus, ShutdownSignal,
};
pub use purge::{
    PeriodUnit, PointCatalog, PurgeConfig, PurgeManager, PurgePeriod, PurgeReport, PurgeService,
    PurgeTarget, StaticCatalog,
};
