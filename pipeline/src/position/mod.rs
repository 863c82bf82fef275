//! Best-effort position resolution.
//!
//! Sources are tried in strict order: embedded geotag, caller hint, nothing.
//! Absence is explicit (`None`), never a zero coordinate.

pub mod drift;
pub mod geotag;

use roadwatch_common::config::PositionConfig;
use roadwatch_common::position::{Position, PositionFix, PositionSource};
use tracing::debug;

use crate::error::PipelineError;

pub use drift::SimulatedDrift;

#[derive(Debug, Clone)]
pub struct PositionResolver {
    simulate_drift: bool,
    start: Position,
    step: f64,
}

impl PositionResolver {
    pub fn new(config: &PositionConfig) -> Self {
        Self {
            simulate_drift: config.simulate_drift,
            start: Position::new(config.start_lat, config.start_lon),
            step: config.drift_step,
        }
    }

    /// Resolve the position of a still image from its geotag, falling back
    /// to the caller's hint.
    pub fn resolve_image(&self, image_bytes: &[u8], hint: Option<Position>) -> Option<PositionFix> {
        resolve_from(geotag::read_geotag(image_bytes), hint)
    }

    /// Drift model for a stream without live positioning, if enabled.
    pub fn stream_drift(&self) -> Option<SimulatedDrift> {
        self.simulate_drift
            .then(|| SimulatedDrift::new(self.start, self.step))
    }
}

/// Apply the priority chain to an already-attempted geotag read.
pub fn resolve_from(
    geotag: Result<Option<Position>, PipelineError>,
    hint: Option<Position>,
) -> Option<PositionFix> {
    match geotag {
        Ok(Some(position)) => return Some(PositionFix::new(position, PositionSource::Geotag)),
        Ok(None) => {}
        Err(e) => debug!(error = %e, "geotag unusable, falling back"),
    }

    match hint {
        Some(position) if is_valid(&position) => {
            Some(PositionFix::new(position, PositionSource::Hint))
        }
        Some(position) => {
            debug!(lat = position.lat, lon = position.lon, "ignoring out-of-range position hint");
            None
        }
        None => None,
    }
}

fn is_valid(position: &Position) -> bool {
    position.lat.is_finite()
        && position.lon.is_finite()
        && (-90.0..=90.0).contains(&position.lat)
        && (-180.0..=180.0).contains(&position.lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geotag_wins_over_hint() {
        let fix = resolve_from(
            Ok(Some(Position::new(10.0, 20.0))),
            Some(Position::new(1.0, 2.0)),
        )
        .unwrap();
        assert_eq!(fix.source, PositionSource::Geotag);
        assert_eq!(fix.position(), Position::new(10.0, 20.0));
    }

    #[test]
    fn hint_used_exactly_when_geotag_absent() {
        let hint = Position::new(51.507351, -0.127758);
        let fix = resolve_from(Ok(None), Some(hint)).unwrap();
        assert_eq!(fix.source, PositionSource::Hint);
        assert_eq!(fix.lat, hint.lat);
        assert_eq!(fix.lon, hint.lon);
    }

    #[test]
    fn unparseable_geotag_falls_through_to_hint() {
        let hint = Position::new(-33.8688, 151.2093);
        let fix = resolve_from(
            Err(PipelineError::GeotagUnparseable("partial GPS block".into())),
            Some(hint),
        )
        .unwrap();
        assert_eq!(fix.position(), hint);
    }

    #[test]
    fn nothing_available_is_none() {
        assert_eq!(resolve_from(Ok(None), None), None);
        assert_eq!(
            resolve_from(Err(PipelineError::GeotagUnparseable("x".into())), None),
            None
        );
    }

    #[test]
    fn resolve_image_on_undecodable_bytes_uses_hint() {
        let resolver = PositionResolver::new(&PositionConfig::default());
        let hint = Position::new(12.5, 7.25);
        let fix = resolver.resolve_image(b"not an image", Some(hint)).unwrap();
        assert_eq!(fix.position(), hint);
    }

    #[test]
    fn drift_disabled_yields_none() {
        let config = PositionConfig {
            simulate_drift: false,
            ..PositionConfig::default()
        };
        assert!(PositionResolver::new(&config).stream_drift().is_none());
        assert!(PositionResolver::new(&PositionConfig::default())
            .stream_drift()
            .is_some());
    }
}
