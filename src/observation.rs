use crate::arg_parameters::ObservationParameters;

/// Which neighbouring lane, in simulator lane order (left has smaller y).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaneSide {
    Left,
    Right,
}

impl LaneSide {
    pub fn sign(self) -> f64 {
        match self {
            LaneSide::Left => -1.0,
            LaneSide::Right => 1.0,
        }
    }
}

/// Row 0 of an observation: the ego's own kinematics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EgoState {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

impl EgoState {
    pub fn speed(&self) -> f64 {
        self.vx.hypot(self.vy)
    }

    pub fn distance_from_origin(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// A present neighbour row. Positions and velocities are relative to the ego.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObservedVehicle {
    /// Row index in the observation, stable within one step only.
    pub index: usize,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

impl ObservedVehicle {
    pub fn distance(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn abs_position(&self, ego: &EgoState) -> (f64, f64) {
        (ego.x + self.x, ego.y + self.y)
    }

    pub fn abs_velocity(&self, ego: &EgoState) -> (f64, f64) {
        (ego.vx + self.vx, ego.vy + self.vy)
    }

    pub fn speed(&self, ego: &EgoState) -> f64 {
        let (vx, vy) = self.abs_velocity(ego);
        vx.hypot(vy)
    }

    /// Rate at which the gap along x shrinks (positive means closing).
    pub fn closing_speed(&self) -> f64 {
        if self.x >= 0.0 {
            -self.vx
        } else {
            self.vx
        }
    }
}

/// A parsed observation. Malformed input yields an observation without
/// an ego, which every policy answers with IDLE.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    ego: Option<EgoState>,
    vehicles: Vec<ObservedVehicle>,
}

fn finite_at(row: &[f64], i: usize) -> Option<f64> {
    row.get(i).copied().filter(|v| v.is_finite())
}

impl Observation {
    pub fn new(ego: EgoState, vehicles: Vec<ObservedVehicle>) -> Self {
        Self {
            ego: Some(ego),
            vehicles,
        }
    }

    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Self {
        let mut obs = Observation::default();
        let ego_row = match rows.first() {
            Some(row) => row.as_ref(),
            None => return obs,
        };

        // the ego needs at least a position and a forward speed
        let ego = match (
            finite_at(ego_row, 1),
            finite_at(ego_row, 2),
            finite_at(ego_row, 3),
        ) {
            (Some(x), Some(y), Some(vx)) => EgoState {
                x,
                y,
                vx,
                vy: finite_at(ego_row, 4).unwrap_or(0.0),
            },
            _ => return obs,
        };
        obs.ego = Some(ego);

        for (index, row) in rows.iter().enumerate().skip(1) {
            let row = row.as_ref();
            if finite_at(row, 0).unwrap_or(0.0) < 0.5 {
                continue;
            }
            let (x, y) = match (finite_at(row, 1), finite_at(row, 2)) {
                (Some(x), Some(y)) => (x, y),
                _ => continue,
            };
            obs.vehicles.push(ObservedVehicle {
                index,
                x,
                y,
                vx: finite_at(row, 3).unwrap_or(0.0),
                vy: finite_at(row, 4).unwrap_or(0.0),
            });
        }

        obs
    }

    pub fn ego(&self) -> Option<&EgoState> {
        self.ego.as_ref()
    }

    pub fn vehicles(&self) -> &[ObservedVehicle] {
        &self.vehicles
    }

    pub fn is_empty(&self) -> bool {
        self.ego.is_none()
    }
}

/// Lane-semantic queries over an [`Observation`].
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationModel {
    pub same_lane_threshold: f64,
    pub lane_width: f64,
    pub lane_tolerance: f64,
}

impl ObservationModel {
    pub fn new(params: &ObservationParameters) -> Self {
        Self {
            same_lane_threshold: params.same_lane_threshold,
            lane_width: params.lane_width,
            lane_tolerance: params.lane_tolerance,
        }
    }

    pub fn in_own_lane(&self, v: &ObservedVehicle) -> bool {
        v.y.abs() < self.same_lane_threshold
    }

    pub fn front_vehicle<'a>(&self, obs: &'a Observation) -> Option<&'a ObservedVehicle> {
        obs.vehicles()
            .iter()
            .filter(|v| v.x > 0.0 && self.in_own_lane(v))
            .min_by(|a, b| a.x.total_cmp(&b.x))
    }

    pub fn rear_vehicle<'a>(&self, obs: &'a Observation) -> Option<&'a ObservedVehicle> {
        obs.vehicles()
            .iter()
            .filter(|v| v.x < 0.0 && self.in_own_lane(v))
            .max_by(|a, b| a.x.total_cmp(&b.x))
    }

    pub fn adjacent_lane_vehicles<'a>(
        &self,
        obs: &'a Observation,
        side: LaneSide,
    ) -> Vec<&'a ObservedVehicle> {
        let target_y = side.sign() * self.lane_width;
        obs.vehicles()
            .iter()
            .filter(|v| (v.y - target_y).abs() < self.lane_tolerance)
            .collect()
    }

    /// Vehicles per km in the ego's lane within `range` ahead and behind.
    pub fn local_density(&self, obs: &Observation, range: f64) -> f64 {
        if range <= 0.0 {
            return 0.0;
        }
        let count = obs
            .vehicles()
            .iter()
            .filter(|v| self.in_own_lane(v) && v.x.abs() < range)
            .count();
        count as f64 / (2.0 * range / 1000.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    pub fn model() -> ObservationModel {
        ObservationModel {
            same_lane_threshold: 2.0,
            lane_width: 4.0,
            lane_tolerance: 2.0,
        }
    }

    pub fn obs_with(ego_speed: f64, rows: &[[f64; 4]]) -> Observation {
        let mut all = vec![vec![1.0, 0.0, 0.0, ego_speed, 0.0]];
        for r in rows {
            all.push(vec![1.0, r[0], r[1], r[2], r[3]]);
        }
        Observation::from_rows(&all)
    }

    #[test]
    fn test_padding_and_malformed_rows_are_ignored() {
        let rows = vec![
            vec![1.0, 10.0, 0.0, 25.0, 0.0],
            vec![0.0, 5.0, 0.0, 0.0, 0.0],
            vec![1.0, f64::NAN, 0.0, 0.0, 0.0],
            vec![1.0, 30.0],
            vec![1.0, 12.0, 0.5, -2.0],
        ];
        let obs = Observation::from_rows(&rows);
        assert_eq!(obs.vehicles().len(), 1);
        assert_eq!(obs.vehicles()[0].index, 4);
        assert_abs_diff_eq!(obs.vehicles()[0].vy, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_or_short_ego_is_empty() {
        let none: Vec<Vec<f64>> = Vec::new();
        assert!(Observation::from_rows(&none).is_empty());
        assert!(Observation::from_rows(&[vec![1.0, 0.0]]).is_empty());
    }

    #[test]
    fn test_front_vehicle_picks_nearest_ahead_in_lane() {
        let obs = obs_with(
            25.0,
            &[
                [40.0, 0.5, 0.0, 0.0],
                [15.0, -0.3, 0.0, 0.0],
                [-5.0, 0.0, 0.0, 0.0],
                [8.0, 4.0, 0.0, 0.0],
            ],
        );
        let front = model().front_vehicle(&obs).unwrap();
        assert_abs_diff_eq!(front.x, 15.0, epsilon = 1e-12);
        let rear = model().rear_vehicle(&obs).unwrap();
        assert_abs_diff_eq!(rear.x, -5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_adjacent_lanes() {
        let obs = obs_with(
            25.0,
            &[[8.0, 4.0, 0.0, 0.0], [-3.0, -3.5, 0.0, 0.0], [2.0, 8.0, 0.0, 0.0]],
        );
        let m = model();
        assert_eq!(m.adjacent_lane_vehicles(&obs, LaneSide::Right).len(), 1);
        assert_eq!(m.adjacent_lane_vehicles(&obs, LaneSide::Left).len(), 1);
    }

    #[test]
    fn test_local_density_is_idempotent() {
        let obs = obs_with(
            25.0,
            &[[10.0, 0.0, 0.0, 0.0], [-50.0, 1.0, 0.0, 0.0], [150.0, 0.0, 0.0, 0.0]],
        );
        let m = model();
        let first = m.local_density(&obs, 100.0);
        let second = m.local_density(&obs, 100.0);
        // 2 vehicles over 0.2 km
        assert_abs_diff_eq!(first, 10.0, epsilon = 1e-9);
        assert_eq!(first, second);
    }
}
