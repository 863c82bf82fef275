use std::sync::Arc;

use roadwatch_common::config::Config;
use roadwatch_pipeline::detector::DetectorAdapter;
use roadwatch_pipeline::hub::MetricsHub;
use roadwatch_pipeline::position::PositionResolver;
use roadwatch_pipeline::snapshot::SnapshotPolicy;

use crate::db::ScanLog;
use crate::registry::StreamRegistry;

pub struct AppState {
    pub config: Config,
    pub detector: Arc<DetectorAdapter>,
    pub resolver: PositionResolver,
    pub hub: Arc<MetricsHub>,
    pub snapshots: SnapshotPolicy,
    pub scans: Arc<ScanLog>,
    pub registry: StreamRegistry,
}

impl AppState {
    /// Wire the shared collaborators together. The hub learns whether the
    /// detector is usable here.
    pub fn new(config: Config, detector: DetectorAdapter, scans: ScanLog) -> Self {
        let hub = Arc::new(MetricsHub::new());
        hub.set_model_loaded(detector.is_ready());
        Self {
            resolver: PositionResolver::new(&config.position),
            snapshots: SnapshotPolicy::new(config.snapshot.dir.clone()),
            detector: Arc::new(detector),
            hub,
            scans: Arc::new(scans),
            registry: StreamRegistry::new(),
            config,
        }
    }
}
