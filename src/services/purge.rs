//! Purge and retention of aged point values
//!
//! A purge run first expires aged values in one of two modes:
//!
//! - Per-point purge, for backends that opt in: every point the catalog lists
//!   is trimmed to its own period (or the default) with a
//!   delete-before-cutoff call.
//! - Native retention, for backends that opt out and implement a retention
//!   policy: the default period is handed over once, then the backend
//!   expires values as of the run time. Point overrides do not apply.
//!
//! Values of series that no longer belong to any point are deleted
//! afterwards, when the backend supports it.
//!
//! Runs are single-flight: a run requested while another is active returns
//! immediately. [`PurgeService`] schedules runs on an interval under the
//! [`ServiceManager`](super::ServiceManager).

use crate::engine::traits::{Capabilities, Capability, PointValueStore};
use crate::error::{Error, Result, StorageError};
use crate::types::{now_millis, PointRef, SeriesId};

use super::framework::{Service, ServiceError, ServiceStatus, ShutdownSignal};

use chrono::{DateTime, Months, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

// =============================================================================
// Purge period
// =============================================================================

/// Calendar unit of a purge period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    /// Calendar days
    Days,
    /// Weeks of seven days
    Weeks,
    /// Calendar months
    Months,
    /// Calendar years
    Years,
}

/// How long values are kept, e.g. "6 months"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PurgePeriod {
    /// Number of units
    pub count: u32,
    /// Unit of `count`
    pub unit: PeriodUnit,
}

impl PurgePeriod {
    /// Create a period
    pub const fn new(count: u32, unit: PeriodUnit) -> Self {
        Self { count, unit }
    }

    /// `count` days
    pub const fn days(count: u32) -> Self {
        Self::new(count, PeriodUnit::Days)
    }

    /// `count` weeks
    pub const fn weeks(count: u32) -> Self {
        Self::new(count, PeriodUnit::Weeks)
    }

    /// `count` months
    pub const fn months(count: u32) -> Self {
        Self::new(count, PeriodUnit::Months)
    }

    /// `count` years
    pub const fn years(count: u32) -> Self {
        Self::new(count, PeriodUnit::Years)
    }

    /// Oldest timestamp still retained at `now` (epoch ms)
    ///
    /// Months and years are subtracted on the calendar, so one month before
    /// March 31st is February 28th (or 29th). `None` if the result falls
    /// outside the representable range.
    pub fn cutoff(&self, now: i64) -> Option<i64> {
        let now: DateTime<Utc> = DateTime::from_timestamp_millis(now)?;
        let count = self.count as i64;
        let cutoff = match self.unit {
            PeriodUnit::Days => now.checked_sub_signed(chrono::Duration::try_days(count)?)?,
            PeriodUnit::Weeks => now.checked_sub_signed(chrono::Duration::try_weeks(count)?)?,
            PeriodUnit::Months => now.checked_sub_months(Months::new(self.count))?,
            PeriodUnit::Years => now.checked_sub_months(Months::new(self.count.checked_mul(12)?))?,
        };
        Some(cutoff.timestamp_millis())
    }
}

impl fmt::Display for PurgePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            PeriodUnit::Days => "days",
            PeriodUnit::Weeks => "weeks",
            PeriodUnit::Months => "months",
            PeriodUnit::Years => "years",
        };
        write!(f, "{} {}", self.count, unit)
    }
}

// =============================================================================
// Configuration
// =============================================================================

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    86_400
}

fn default_period() -> Option<PurgePeriod> {
    Some(PurgePeriod::years(1))
}

/// Purge scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Run purge on a schedule
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between runs
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Run once immediately when the service starts
    #[serde(default)]
    pub run_on_start: bool,
    /// Period for points without an override (`None` disables default purge)
    #[serde(default = "default_period")]
    pub default_period: Option<PurgePeriod>,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            run_on_start: false,
            default_period: default_period(),
        }
    }
}

impl PurgeConfig {
    /// Interval between scheduled runs
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

// =============================================================================
// Point catalog
// =============================================================================

/// A point subject to per-point purge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeTarget {
    /// The point
    pub point: PointRef,
    /// Point-specific period overriding the default
    pub period: Option<PurgePeriod>,
}

impl PurgeTarget {
    /// Target using the default period
    pub fn new(point: PointRef) -> Self {
        Self { point, period: None }
    }

    /// Target with its own period
    pub fn with_period(point: PointRef, period: PurgePeriod) -> Self {
        Self {
            point,
            period: Some(period),
        }
    }
}

/// Source of point configuration consulted by purge
pub trait PointCatalog: Send + Sync {
    /// Points to purge, with their overrides
    fn purge_targets(&self) -> Vec<PurgeTarget>;

    /// Series that still belong to a configured point
    fn live_series(&self) -> HashSet<SeriesId>;
}

/// Catalog backed by a fixed, replaceable list of targets
#[derive(Debug, Default)]
pub struct StaticCatalog {
    targets: RwLock<Vec<PurgeTarget>>,
}

impl StaticCatalog {
    /// Create a catalog of `targets`
    pub fn new(targets: Vec<PurgeTarget>) -> Self {
        Self {
            targets: RwLock::new(targets),
        }
    }

    /// Replace the target list
    pub fn set_targets(&self, targets: Vec<PurgeTarget>) {
        *self.targets.write() = targets;
    }
}

impl PointCatalog for StaticCatalog {
    fn purge_targets(&self) -> Vec<PurgeTarget> {
        self.targets.read().clone()
    }

    fn live_series(&self) -> HashSet<SeriesId> {
        self.targets.read().iter().map(|t| t.point.series_id).collect()
    }
}

// =============================================================================
// Purge manager
// =============================================================================

/// Outcome of one purge run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Native retention ran instead of per-point purge
    pub retention_policy_applied: bool,
    /// The backend opted out of per-point purge
    pub per_point_skipped: bool,
    /// Points that received a delete call
    pub points_purged: usize,
    /// Values expired by per-point purge or retention, as far as the backend
    /// reports counts
    pub values_deleted: u64,
    /// Orphan cleanup was skipped because the backend does not support it
    pub orphan_cleanup_skipped: bool,
    /// Orphaned values deleted, if reported
    pub orphans_deleted: Option<u64>,
}

/// Clears the single-flight flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs purge against a backend
pub struct PurgeManager {
    store: Arc<dyn PointValueStore>,
    capabilities: Capabilities,
    catalog: Arc<dyn PointCatalog>,
    default_period: RwLock<Option<PurgePeriod>>,
    applied_retention: Mutex<Option<PurgePeriod>>,
    running: AtomicBool,
    runs: AtomicU64,
}

impl PurgeManager {
    /// Create a manager; backend capabilities are read once here
    pub fn new(
        store: Arc<dyn PointValueStore>,
        catalog: Arc<dyn PointCatalog>,
        default_period: Option<PurgePeriod>,
    ) -> Self {
        Self {
            capabilities: store.capabilities(),
            store,
            catalog,
            default_period: RwLock::new(default_period),
            applied_retention: Mutex::new(None),
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        }
    }

    /// Change the default period used by later runs
    pub fn set_default_period(&self, period: Option<PurgePeriod>) {
        *self.default_period.write() = period;
    }

    /// Completed runs
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Whether a run is in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run purge now
    pub fn run_once(&self) -> Result<Option<PurgeReport>> {
        self.run_once_at(now_millis())
    }

    /// Run purge as if the current time were `now` (epoch ms)
    ///
    /// Returns `Ok(None)` without doing anything if another run is active.
    pub fn run_once_at(&self, now: i64) -> Result<Option<PurgeReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("purge already running, skipping");
            return Ok(None);
        }
        let _guard = RunGuard(&self.running);

        let default_period = *self.default_period.read();
        let mut report = PurgeReport::default();

        if self.store.per_point_purge_enabled() {
            self.purge_points(now, default_period, &mut report)?;
        } else {
            report.per_point_skipped = true;
            if let Some(period) = default_period {
                if self.capabilities.supports(Capability::RetentionPolicy) {
                    self.apply_retention(now, period, &mut report)?;
                }
            }
        }

        if self.capabilities.supports(Capability::DeleteOrphaned) {
            let live = self.catalog.live_series();
            report.orphans_deleted = self.store.delete_orphaned(&live)?;
        } else {
            report.orphan_cleanup_skipped = true;
            debug!("backend cannot delete orphaned values, skipping orphan cleanup");
        }

        self.runs.fetch_add(1, Ordering::Relaxed);
        info!(
            points_purged = report.points_purged,
            values_deleted = report.values_deleted,
            orphans_deleted = ?report.orphans_deleted,
            retention_policy = report.retention_policy_applied,
            "purge complete"
        );
        Ok(Some(report))
    }

    fn apply_retention(
        &self,
        now: i64,
        period: PurgePeriod,
        report: &mut PurgeReport,
    ) -> Result<()> {
        {
            let mut applied = self.applied_retention.lock();
            if *applied != Some(period) {
                self.store.set_retention_policy(period)?;
                *applied = Some(period);
                info!(%period, "retention policy set");
            }
        }

        let expired = self.store.enforce_retention(now)?;
        report.retention_policy_applied = true;
        report.values_deleted += expired.unwrap_or(0);
        debug!(%period, expired = ?expired, "retention enforced");
        Ok(())
    }

    fn purge_points(
        &self,
        now: i64,
        default_period: Option<PurgePeriod>,
        report: &mut PurgeReport,
    ) -> Result<()> {
        for target in self.catalog.purge_targets() {
            let Some(period) = target.period.or(default_period) else {
                continue;
            };
            let Some(cutoff) = period.cutoff(now) else {
                warn!(
                    point_id = target.point.point_id,
                    %period,
                    "purge cutoff out of range, skipping point"
                );
                continue;
            };

            self.capabilities
                .require(Capability::Delete)
                .map_err(Error::from)?;
            let deleted = self
                .store
                .delete_between(target.point.series_id, None, Some(cutoff))?;

            report.points_purged += 1;
            report.values_deleted += deleted.unwrap_or(0);
            debug!(
                point_id = target.point.point_id,
                series_id = target.point.series_id,
                cutoff,
                deleted = ?deleted,
                "purged point"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Purge service
// =============================================================================

/// Background service running purge on a fixed interval
pub struct PurgeService {
    manager: Arc<PurgeManager>,
    config: PurgeConfig,
    status: RwLock<ServiceStatus>,
    last_report: RwLock<Option<PurgeReport>>,
}

impl PurgeService {
    /// Create a purge service
    pub fn new(manager: Arc<PurgeManager>, config: PurgeConfig) -> Self {
        Self {
            manager,
            config,
            status: RwLock::new(ServiceStatus::Idle),
            last_report: RwLock::new(None),
        }
    }

    /// Report of the last successful scheduled run
    pub fn last_report(&self) -> Option<PurgeReport> {
        self.last_report.read().clone()
    }

    /// Run purge now on the blocking pool
    pub async fn run_now(&self) -> Result<Option<PurgeReport>> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.run_once())
            .await
            .map_err(|e| {
                Error::Storage(StorageError::Backend(format!("purge task failed: {}", e)))
            })?
    }

    async fn scheduled_run(&self) {
        match self.run_now().await {
            Ok(Some(report)) => *self.last_report.write() = Some(report),
            Ok(None) => debug!("previous purge still running"),
            Err(e) => error!(error = %e, "purge failed"),
        }
    }
}

#[async_trait::async_trait]
impl Service for PurgeService {
    async fn start(&self, mut shutdown: ShutdownSignal) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        if !self.config.enabled {
            debug!("purge disabled");
            shutdown.triggered().await;
            *self.status.write() = ServiceStatus::Stopped;
            return Ok(());
        }

        let period = self.config.interval();
        let first = if self.config.run_on_start {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut ticker = interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = period.as_secs(), "purge service started");

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => self.scheduled_run().await,
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        debug!("purge service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "purge"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn millis(y: i32, m: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn test_cutoff_days_and_weeks() {
        let now = millis(2024, 3, 15);
        assert_eq!(PurgePeriod::days(14).cutoff(now), Some(millis(2024, 3, 1)));
        assert_eq!(PurgePeriod::weeks(2).cutoff(now), Some(millis(2024, 3, 1)));
    }

    #[test]
    fn test_cutoff_months_are_calendar_aware() {
        assert_eq!(
            PurgePeriod::months(1).cutoff(millis(2024, 3, 31)),
            Some(millis(2024, 2, 29))
        );
        assert_eq!(
            PurgePeriod::years(1).cutoff(millis(2024, 2, 29)),
            Some(millis(2023, 2, 28))
        );
    }

    #[test]
    fn test_cutoff_out_of_range() {
        assert_eq!(PurgePeriod::years(u32::MAX).cutoff(0), None);
    }

    #[test]
    fn test_purge_config_defaults_from_toml() {
        let config: PurgeConfig = toml::from_str("interval_secs = 60").unwrap();
        assert!(config.enabled);
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.default_period, Some(PurgePeriod::years(1)));

        let config: PurgeConfig =
            toml::from_str("[default_period]\ncount = 6\nunit = \"months\"").unwrap();
        assert_eq!(config.default_period, Some(PurgePeriod::months(6)));
    }

    #[test]
    fn test_period_display() {
        assert_eq!(PurgePeriod::weeks(3).to_string(), "3 weeks");
    }
}
