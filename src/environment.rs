use serde::Deserialize;

use crate::action::{ActionSpace, EnvAction};
use crate::error::Result;

pub type VehicleId = u64;

/// Raw observation rows as handed out by a simulator: row 0 is the ego,
/// the rest are nearby vehicles `[presence, x, y, vx, vy]`.
pub type ObservationRows = Vec<Vec<f64>>;

/// Road segment `from -> to` plus the lane id on it, counted from the left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneIndex {
    pub from: u32,
    pub to: u32,
    pub lane: usize,
}

impl LaneIndex {
    pub fn new(from: u32, to: u32, lane: usize) -> Self {
        Self { from, to, lane }
    }

    pub fn same_segment(&self, other: &LaneIndex) -> bool {
        self.from == other.from && self.to == other.to
    }

    pub fn with_lane(&self, lane: usize) -> Self {
        Self { lane, ..*self }
    }
}

/// Background driver attitude, passed into environments per run.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct DriverProfile {
    pub time_headway: f64,
    pub politeness: f64,
}

/// Read-only snapshot of one simulated vehicle.
#[derive(Clone, Debug, PartialEq)]
pub struct VehicleState {
    pub id: VehicleId,
    pub position: [f64; 2],
    pub heading: f64,
    pub speed: f64,
    pub length: f64,
    pub crashed: bool,
    pub lane_index: Option<LaneIndex>,
    pub acceleration: Option<f64>,
    pub profile: Option<DriverProfile>,
}

impl VehicleState {
    pub fn velocity(&self) -> [f64; 2] {
        [
            self.speed * self.heading.cos(),
            self.speed * self.heading.sin(),
        ]
    }

    pub fn distance_to(&self, other: &VehicleState) -> f64 {
        let dx = other.position[0] - self.position[0];
        let dy = other.position[1] - self.position[1];
        dx.hypot(dy)
    }

    /// Desired time headway of the driver, when the simulator models one.
    pub fn time_headway(&self) -> Option<f64> {
        self.profile.map(|p| p.time_headway)
    }

    /// Courtesy factor of the driver, when the simulator models one.
    pub fn politeness(&self) -> Option<f64> {
        self.profile.map(|p| p.politeness)
    }
}

/// Lane geometry queries. Every query may fail for a lane the network
/// does not know, which callers treat as "skip this contribution".
pub trait RoadNetwork {
    fn lane_count(&self, lane: &LaneIndex) -> Option<usize>;

    fn lane_length(&self, lane: &LaneIndex) -> Option<f64>;

    /// Longitudinal and lateral offsets of `position` projected onto `lane`.
    fn local_coordinates(&self, lane: &LaneIndex, position: [f64; 2]) -> Option<(f64, f64)>;

    /// Indices of the front and rear neighbour of `vehicles[vehicle_i]` in
    /// `lane`. `None` means the network does not answer neighbour queries.
    fn neighbour_vehicles(
        &self,
        _vehicles: &[VehicleState],
        _vehicle_i: usize,
        _lane: &LaneIndex,
    ) -> Option<(Option<usize>, Option<usize>)> {
        None
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepInfo {
    pub speed: Option<f64>,
    pub crashed: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub observation: ObservationRows,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: StepInfo,
}

/// A physics simulator the decision layer can drive.
pub trait Environment {
    fn reset(&mut self, seed: Option<u64>) -> Result<(ObservationRows, StepInfo)>;

    fn step(&mut self, action: EnvAction) -> Result<StepOutcome>;

    fn action_space(&self) -> ActionSpace;

    fn vehicles(&self) -> &[VehicleState];

    /// The vehicle the policy drives, if the simulator tracks it.
    fn controlled_vehicle(&self) -> Option<VehicleId>;

    fn road(&self) -> &dyn RoadNetwork;

    /// Center of the scenario's conflict zone in world coordinates.
    fn reference_point(&self) -> [f64; 2] {
        [0.0, 0.0]
    }

    fn render(&mut self) {}

    fn close(&mut self) {}
}
