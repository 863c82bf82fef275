use serde::{Deserialize, Serialize};

/// Decimal-degree coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Where a resolved position came from.
///
/// `Simulated` marks the synthetic drift fallback so consumers can tell it
/// apart from a real fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    Geotag,
    Hint,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub lat: f64,
    pub lon: f64,
    pub source: PositionSource,
}

impl PositionFix {
    pub fn new(position: Position, source: PositionSource) -> Self {
        Self {
            lat: position.lat,
            lon: position.lon,
            source,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.lat, self.lon)
    }

    pub fn is_simulated(&self) -> bool {
        self.source == PositionSource::Simulated
    }
}
