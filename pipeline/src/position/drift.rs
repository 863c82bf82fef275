use roadwatch_common::position::{Position, PositionFix, PositionSource};

/// Deterministic stand-in for a moving receiver.
///
/// Used only when a stream has no real positioning source; every fix it
/// hands out is tagged `PositionSource::Simulated`.
#[derive(Debug, Clone)]
pub struct SimulatedDrift {
    current: Position,
    step: f64,
}

impl SimulatedDrift {
    pub fn new(start: Position, step: f64) -> Self {
        Self {
            current: start,
            step,
        }
    }

    pub fn current(&self) -> PositionFix {
        PositionFix::new(self.current, PositionSource::Simulated)
    }

    /// Move one step north-east and return the new fix.
    pub fn advance(&mut self) -> PositionFix {
        self.current.lat += self.step;
        self.current.lon += self.step;
        self.current()
    }
}
