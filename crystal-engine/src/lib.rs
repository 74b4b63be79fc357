//! Crystal policy engine: turns compiled rules into installed filters and
//! standing metric monitors, persists them and restores them at boot.

pub mod api;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod installer;
pub mod lifecycle;
pub mod listener;
pub mod monitor;
pub mod pg_store;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod store;

pub use api::{EngineApiBuilder, EngineServiceConfig};
pub use dispatcher::{ActionDispatcher, DispatchOutcome};
pub use error::EngineError;
pub use fanout::{MetricFanout, SampleObserver};
pub use installer::{DryRunInstaller, FilterInstaller, HttpFilterInstaller, InstallerError};
pub use lifecycle::{
    DynamicDeployment, MonitorManager, MonitorSettings, ReloadFailure, ReloadReport, TargetFailure,
};
pub use listener::MetricStreamListener;
pub use monitor::{FireVerdict, Monitor, MonitorHandle, MonitorKind, PolicyMonitor};
pub use pg_store::PgStore;
pub use registry::{DynamicScan, PolicyRegistry};
pub use resolver::{StaticTenantDirectory, StoreTenantDirectory, TargetResolver, TenantDirectory};
pub use service::{DeployReport, DynamicPolicyView, IngestReport, LineReport, PolicyService};
pub use store::{MemoryStore, PolicyStore, StoreError, StoreOp};
