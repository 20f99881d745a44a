use itertools::Itertools;
use parry2d_f64::query;
use rand::prelude::{Rng, StdRng};
use rand_distr::{Distribution, Normal};

use crate::{
    action::{Action, ActionSpace, EnvAction, DEFAULT_DISCRETE_ACTIONS},
    arg_parameters::{EnvironmentParameters, Parameters, TrafficProfiles},
    car::{Car, MAX_STEER},
    environment::{
        Environment, LaneIndex, ObservationRows, RoadNetwork, StepInfo, StepOutcome, VehicleId,
        VehicleState,
    },
    error::{Result, SimError},
    intelligent_driver::IntelligentDriver,
    policy::Composition,
    scenario::ScenarioKind,
    simulation::seeded_rng,
};

const SCENARIO_STREAM: u64 = 0;
const TRAFFIC_STREAM: u64 = 1;

/// Multi-lane straight road. Lane 0 is the leftmost, at y = 0, and lane
/// centres are `lane_width` apart. A merge road adds one more lane on the
/// right that ends at `merge_end`; past that point the road is its own
/// segment with one lane fewer. Longitudinal coordinates are global x.
#[derive(Clone, Debug, PartialEq)]
pub struct StraightRoad {
    pub lanes: usize,
    pub lane_width: f64,
    pub length: f64,
    pub merge_end: Option<f64>,
}

impl StraightRoad {
    pub fn new(lanes: usize, lane_width: f64, length: f64, merge_end: Option<f64>) -> Self {
        Self {
            lanes: lanes.max(1),
            lane_width,
            length,
            merge_end,
        }
    }

    fn segment_lanes(&self, from: u32, to: u32) -> Option<usize> {
        match (from, to, self.merge_end) {
            (0, 1, Some(_)) => Some(self.lanes + 1),
            (0, 1, None) => Some(self.lanes),
            (1, 2, Some(_)) => Some(self.lanes),
            _ => None,
        }
    }

    pub fn merge_lane(&self) -> Option<usize> {
        self.merge_end.map(|_| self.lanes)
    }

    pub fn lane_y(&self, lane: usize) -> f64 {
        lane as f64 * self.lane_width
    }

    /// Whether a vehicle at `x` may drive in `lane`.
    pub fn lane_open(&self, lane: usize, x: f64) -> bool {
        lane < self.lanes
            || (self.merge_lane() == Some(lane) && self.merge_end.map_or(false, |end| x < end))
    }

    pub fn lane_index(&self, x: f64, y: f64) -> LaneIndex {
        let (from, to) = match self.merge_end {
            Some(end) if x >= end => (1, 2),
            _ => (0, 1),
        };
        let n = self.segment_lanes(from, to).unwrap_or(self.lanes);
        let lane = ((y / self.lane_width).round().max(0.0) as usize).min(n - 1);
        LaneIndex::new(from, to, lane)
    }

    pub fn lane_at(&self, x: f64, y: f64) -> usize {
        self.lane_index(x, y).lane
    }

    /// Stop line ahead of vehicles in `lane`, if the lane ends.
    pub fn lane_end(&self, lane: usize) -> Option<f64> {
        if self.merge_lane() == Some(lane) {
            self.merge_end
        } else {
            None
        }
    }
}

impl RoadNetwork for StraightRoad {
    fn lane_count(&self, lane: &LaneIndex) -> Option<usize> {
        self.segment_lanes(lane.from, lane.to)
            .filter(|&n| lane.lane < n)
    }

    fn lane_length(&self, lane: &LaneIndex) -> Option<f64> {
        self.lane_count(lane)?;
        Some(self.lane_end(lane.lane).unwrap_or(self.length))
    }

    fn local_coordinates(&self, lane: &LaneIndex, position: [f64; 2]) -> Option<(f64, f64)> {
        self.lane_count(lane)?;
        Some((position[0], position[1] - self.lane_y(lane.lane)))
    }

    fn neighbour_vehicles(
        &self,
        vehicles: &[VehicleState],
        vehicle_i: usize,
        lane: &LaneIndex,
    ) -> Option<(Option<usize>, Option<usize>)> {
        self.lane_count(lane)?;
        let s = vehicles.get(vehicle_i)?.position[0];

        let mut front: Option<(usize, f64)> = None;
        let mut rear: Option<(usize, f64)> = None;
        for (j, v) in vehicles.iter().enumerate() {
            if j == vehicle_i || self.lane_at(v.position[0], v.position[1]) != lane.lane {
                continue;
            }
            let ds = v.position[0] - s;
            if ds > 0.0 && front.map_or(true, |(_, d)| ds < d) {
                front = Some((j, ds));
            } else if ds <= 0.0 && rear.map_or(true, |(_, d)| ds > d) {
                rear = Some((j, ds));
            }
        }
        Some((front.map(|f| f.0), rear.map(|r| r.0)))
    }
}

/// Road shape and traffic for one scenario kind.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioLayout {
    pub lanes: usize,
    pub length: f64,
    pub vehicles: usize,
    pub merge_end: Option<f64>,
    pub merge_vehicles: usize,
    /// Vehicles leaving the end reappear at the start, as on a closed track.
    pub wraps: bool,
    /// Longitudinal position of the conflict zone centre.
    pub zone_x: Option<f64>,
    pub target_speeds: Vec<f64>,
    pub speed_mean: f64,
    pub speed_std: f64,
    pub speed_min: f64,
    pub speed_max: f64,
}

impl ScenarioLayout {
    pub fn new(scenario: ScenarioKind, env: &EnvironmentParameters) -> Self {
        let mut layout = Self {
            lanes: env.lanes_count,
            length: env.road_length,
            vehicles: env.vehicles_count,
            merge_end: None,
            merge_vehicles: 0,
            wraps: false,
            zone_x: None,
            target_speeds: env.target_speeds.clone(),
            speed_mean: env.speed_mean,
            speed_std: env.speed_std,
            speed_min: env.speed_min,
            speed_max: env.speed_max,
        };
        match scenario {
            ScenarioKind::Highway => {}
            ScenarioKind::Merge => {
                layout.merge_end = Some(env.merge_end);
                layout.merge_vehicles = env.merge_vehicles_count;
            }
            ScenarioKind::Intersection | ScenarioKind::Roundabout => {
                layout.zone_x = Some(env.zone_x);
            }
            ScenarioKind::Racetrack => {
                layout.length = env.racetrack_length;
                layout.wraps = true;
            }
            ScenarioKind::ParkingLot => {
                layout.lanes = env.parking_lanes_count;
                layout.vehicles = env.parking_vehicles_count;
                layout.target_speeds = env.parking_target_speeds.clone();
                layout.speed_mean = env.parking_speed_mean;
                layout.speed_std = env.parking_speed_std;
                layout.speed_min = env.parking_speed_min;
                layout.speed_max = env.parking_speed_max;
            }
        }
        layout
    }
}

/// Deterministic kinematic traffic on a straight road. Vehicle 0 is the
/// ego and follows meta actions; the rest drive with IDM and change lanes
/// when it pays off for them after weighing the effect on the car behind.
#[derive(Clone, Debug)]
pub struct KinematicRoad {
    params: EnvironmentParameters,
    profiles: TrafficProfiles,
    default_time_headway: f64,
    composition: Composition,
    scenario: ScenarioKind,
    layout: ScenarioLayout,
    road: StraightRoad,
    driver: IntelligentDriver,
    cars: Vec<Car>,
    states: Vec<VehicleState>,
    ego_speed_i: usize,
    ego_command: Option<(f64, f64)>,
    pub timesteps: u64,
    rng_seed: u64,
    scenario_rng: StdRng,
    traffic_rng: StdRng,
}

impl KinematicRoad {
    pub fn new(params: &Parameters, scenario: ScenarioKind, composition: Composition) -> Self {
        let env = &params.environment;
        let layout = ScenarioLayout::new(scenario, env);
        let road = StraightRoad::new(layout.lanes, env.lane_width, layout.length, layout.merge_end);
        Self {
            params: env.clone(),
            profiles: params.traffic_profiles.clone(),
            default_time_headway: params.car_following.time_headway,
            composition,
            scenario,
            layout,
            road,
            driver: IntelligentDriver::new(&params.car_following),
            cars: Vec::new(),
            states: Vec::new(),
            ego_speed_i: 0,
            ego_command: None,
            timesteps: 0,
            rng_seed: params.rng_seed,
            scenario_rng: seeded_rng(params.rng_seed, SCENARIO_STREAM),
            traffic_rng: seeded_rng(params.rng_seed, TRAFFIC_STREAM),
        }
    }

    pub fn scenario(&self) -> ScenarioKind {
        self.scenario
    }

    pub fn straight_road(&self) -> &StraightRoad {
        &self.road
    }

    pub fn cars(&self) -> &[Car] {
        &self.cars
    }

    fn validate(&self) -> Result<()> {
        let invalid = |name: &str, value: String| SimError::InvalidParameter {
            name: name.to_owned(),
            value,
        };
        if self.params.policy_frequency <= 0.0 {
            return Err(invalid("environment.policy_frequency", self.params.policy_frequency.to_string()));
        }
        if self.params.simulation_frequency <= 0.0 {
            return Err(invalid(
                "environment.simulation_frequency",
                self.params.simulation_frequency.to_string(),
            ));
        }
        if self.layout.lanes == 0 {
            return Err(invalid("environment.lanes_count", "0".to_owned()));
        }
        if self.layout.target_speeds.is_empty() {
            return Err(invalid("environment.target_speeds", "[]".to_owned()));
        }
        if self.params.place_behind_beyond >= self.params.remove_behind_beyond {
            return Err(invalid(
                "environment.place_behind_beyond",
                self.params.place_behind_beyond.to_string(),
            ));
        }
        if self.params.place_ahead_beyond >= self.params.place_ahead_within {
            return Err(invalid(
                "environment.place_ahead_beyond",
                self.params.place_ahead_beyond.to_string(),
            ));
        }
        Ok(())
    }

    fn spawn(&mut self) -> Result<()> {
        self.cars.clear();
        let env = &self.params;

        let lane = env.ego_lane.min(self.layout.lanes - 1);
        self.ego_speed_i = env.ego_speed_index.min(self.layout.target_speeds.len() - 1);
        let speed = self.layout.target_speeds[self.ego_speed_i];
        let mut ego = Car::new(
            0,
            env.ego_x,
            self.road.lane_y(lane),
            speed,
            env.vehicle_width,
            env.vehicle_length,
        );
        ego.target_lane = lane;
        self.cars.push(ego);

        for _ in 0..self.layout.vehicles {
            self.add_random_car(None)?;
        }
        if let Some(merge_lane) = self.road.merge_lane() {
            for _ in 0..self.layout.merge_vehicles {
                self.add_random_car(Some(merge_lane))?;
            }
        }
        Ok(())
    }

    fn add_random_car(&mut self, lane: Option<usize>) -> Result<()> {
        let speed_dist = Normal::new(self.layout.speed_mean, self.layout.speed_std).map_err(|_| {
            SimError::InvalidParameter {
                name: "environment.speed_std".to_owned(),
                value: self.layout.speed_std.to_string(),
            }
        })?;
        let profile = self.composition.sample_profile(&mut self.traffic_rng, &self.profiles);
        let max_x = match (lane, self.road.merge_end) {
            (Some(_), Some(end)) => end * 0.6,
            _ => self.params.spawn_length,
        };
        let id = self.cars.len() as VehicleId;

        for _ in 0..100 {
            let lane_i = match lane {
                Some(lane_i) => lane_i,
                None => self.scenario_rng.gen_range(0..self.layout.lanes),
            };
            let x = self.scenario_rng.gen_range(0.0..max_x.max(1.0));
            let preferred_vel = speed_dist
                .sample(&mut self.scenario_rng)
                .clamp(self.layout.speed_min, self.layout.speed_max);

            let mut car = Car::new(
                id,
                x,
                self.road.lane_y(lane_i),
                preferred_vel,
                self.params.vehicle_width,
                self.params.vehicle_length,
            );
            car.target_lane = lane_i;
            car.profile = Some(profile);
            if self.collides_any_car(&car, self.params.spawn_clearance) {
                continue;
            }
            self.cars.push(car);
            return Ok(());
        }
        Err(SimError::Simulator(
            "Could not place a car without it colliding... too many cars for the road?".to_owned(),
        ))
    }

    pub fn collides_between(&self, car_i1: usize, car_i2: usize) -> bool {
        let car_a = &self.cars[car_i1];
        let car_b = &self.cars[car_i2];

        if (car_a.center()[0] - car_b.center()[0]).abs() > (car_a.length + car_b.length) / 2.0 {
            return false;
        }

        query::intersection_test(&car_a.pose(), &car_a.shape(), &car_b.pose(), &car_b.shape())
            .unwrap_or(false)
    }

    pub fn collides_any_car(&self, car: &Car, clearance: f64) -> bool {
        let pose = car.pose();
        let shape = car.padded_shape(clearance);
        self.cars.iter().any(|c| {
            query::intersection_test(&pose, &shape, &c.pose(), &c.padded_shape(clearance))
                .unwrap_or(true)
        })
    }

    /// Signed distance from `from_x` forward to `to_x`, taking the short
    /// way around on a closed track.
    fn longitudinal_offset(&self, from_x: f64, to_x: f64) -> f64 {
        let mut d = to_x - from_x;
        if self.layout.wraps {
            let half = self.layout.length / 2.0;
            if d > half {
                d -= self.layout.length;
            } else if d < -half {
                d += self.layout.length;
            }
        }
        d
    }

    fn occupies(&self, car: &Car, lane: usize) -> bool {
        car.target_lane == lane || self.road.lane_at(car.x(), car.y()) == lane
    }

    /// Bumper gap and speed of whatever is ahead of `car_i` in `lane`,
    /// including the end of a merge lane.
    fn leader(&self, car_i: usize, lane: usize) -> Option<(f64, f64)> {
        let car = &self.cars[car_i];
        let mut lead: Option<(f64, f64)> = None;
        for (j, other) in self.cars.iter().enumerate() {
            if j == car_i || !self.occupies(other, lane) {
                continue;
            }
            let d = self.longitudinal_offset(car.x(), other.x());
            if d <= 0.0 {
                continue;
            }
            let gap = d - other.length;
            if lead.map_or(true, |(g, _)| gap < g) {
                lead = Some((gap, other.vel));
            }
        }
        if let Some(end) = self.road.lane_end(lane) {
            let gap = end - car.x();
            if gap > 0.0 && lead.map_or(true, |(g, _)| gap < g) {
                lead = Some((gap, 0.0));
            }
        }
        lead
    }

    /// Nearest car behind `car_i` in `lane` and its bumper gap.
    fn follower(&self, car_i: usize, lane: usize) -> Option<(usize, f64)> {
        let car = &self.cars[car_i];
        let mut rear: Option<(usize, f64)> = None;
        for (j, other) in self.cars.iter().enumerate() {
            if j == car_i || !self.occupies(other, lane) {
                continue;
            }
            let d = self.longitudinal_offset(car.x(), other.x());
            if d > 0.0 {
                continue;
            }
            let gap = -d - car.length;
            if rear.map_or(true, |(_, g)| gap < g) {
                rear = Some((j, gap));
            }
        }
        rear
    }

    fn desired_vel(car: &Car) -> f64 {
        if car.profile.is_some() {
            car.preferred_vel
        } else {
            car.target_vel
        }
    }

    fn time_headway_of(&self, car: &Car) -> f64 {
        car.profile
            .map_or(self.default_time_headway, |p| p.time_headway)
    }

    fn idm_accel(&self, car_i: usize, lead: Option<(f64, f64)>) -> f64 {
        let car = &self.cars[car_i];
        self.driver
            .accel(car.vel, Self::desired_vel(car), self.time_headway_of(car), lead)
    }

    fn lane_accel(&self, car_i: usize, lane: usize) -> f64 {
        self.idm_accel(car_i, self.leader(car_i, lane))
    }

    /// Lane a background driver wants next: the adjacent lane with the best
    /// own gain minus `politeness` times the loss imposed on the new
    /// follower, if that beats the switching threshold and the new follower
    /// is not forced to brake hard.
    fn choose_lane(&self, car_i: usize) -> usize {
        let car = &self.cars[car_i];
        let lane = self.road.lane_at(car.x(), car.y());
        if car.crashed
            || car.target_lane != lane
            || (car.y() - self.road.lane_y(lane)).abs() > 0.5
        {
            return car.target_lane;
        }

        let politeness = car.profile.map_or(0.0, |p| p.politeness);
        let forced = self.road.lane_end(lane).map_or(false, |end| {
            end - car.x() < self.params.merge_force_distance
        });
        let threshold = if forced {
            f64::NEG_INFINITY
        } else {
            self.params.mobil_threshold
        };
        let current = self.lane_accel(car_i, lane);

        let mut best = (lane, threshold);
        let candidates = [lane.checked_sub(1), Some(lane + 1)];
        for candidate in candidates.into_iter().flatten() {
            if !self.road.lane_open(candidate, car.x()) || self.road.merge_lane() == Some(candidate) {
                continue;
            }
            let lead = self.leader(car_i, candidate);
            if lead.map_or(false, |(gap, _)| gap < self.driver.min_spacing) {
                continue;
            }

            let (rear_before, rear_after) = match self.follower(car_i, candidate) {
                Some((_, gap)) if gap < self.driver.min_spacing => continue,
                Some((j, gap)) => (
                    self.lane_accel(j, candidate),
                    self.idm_accel(j, Some((gap, car.vel))),
                ),
                None => (0.0, 0.0),
            };
            if rear_after < -self.params.mobil_safe_decel {
                continue;
            }

            let gain = self.idm_accel(car_i, lead) - current - politeness * (rear_before - rear_after);
            if gain > best.1 {
                best = (candidate, gain);
            }
        }
        best.0
    }

    fn apply_meta_action(&mut self, action: Action) {
        let last_speed_i = self.layout.target_speeds.len() - 1;
        let ego = &mut self.cars[0];
        match action {
            Action::Faster => {
                self.ego_speed_i = (self.ego_speed_i + 1).min(last_speed_i);
                ego.target_vel = self.layout.target_speeds[self.ego_speed_i];
            }
            Action::Slower => {
                self.ego_speed_i = self.ego_speed_i.saturating_sub(1);
                ego.target_vel = self.layout.target_speeds[self.ego_speed_i];
            }
            Action::LaneLeft => {
                if ego.target_lane > 0 && self.road.lane_open(ego.target_lane - 1, ego.x()) {
                    ego.target_lane -= 1;
                }
            }
            Action::LaneRight => {
                if self.road.lane_open(ego.target_lane + 1, ego.x()) {
                    ego.target_lane += 1;
                }
            }
            Action::Idle => {}
        }
    }

    fn update_inner(&mut self, dt: f64) {
        let max_accel = self.params.max_accel;
        let max_braking = self.params.max_braking;

        let mut controls = Vec::with_capacity(self.cars.len());
        for (car_i, car) in self.cars.iter().enumerate() {
            if car.crashed {
                controls.push(None);
                continue;
            }
            let (steer, accel) = match (car_i, self.ego_command) {
                (0, Some(command)) => command,
                (0, None) => (
                    car.steer_toward(self.road.lane_y(car.target_lane)),
                    car.speed_control(max_accel, max_braking),
                ),
                _ => {
                    let lane = self.road.lane_at(car.x(), car.y());
                    let mut accel = self.lane_accel(car_i, lane);
                    if car.target_lane != lane {
                        accel = accel.min(self.lane_accel(car_i, car.target_lane));
                    }
                    (car.steer_toward(self.road.lane_y(car.target_lane)), accel)
                }
            };
            controls.push(Some((steer, accel.clamp(-max_braking, max_accel))));
        }

        for (car, control) in self.cars.iter_mut().zip(controls) {
            if let Some((steer, accel)) = control {
                car.steer = steer;
                car.accel = Some(accel);
                car.vel = (car.vel + accel * dt).max(0.0);
                car.update(dt);
            }
        }

        self.wrap_and_respawn();

        for (i1, i2) in (0..self.cars.len()).tuple_combinations() {
            if self.cars[i1].crashed && self.cars[i2].crashed {
                continue;
            }
            if self.collides_between(i1, i2) {
                self.cars[i1].crashed = true;
                self.cars[i2].crashed = true;
            }
        }
    }

    fn wrap_and_respawn(&mut self) {
        if self.layout.wraps {
            let length = self.layout.length;
            for car in self.cars.iter_mut() {
                if car.x() >= length {
                    car.set_x(car.x() - length);
                }
            }
            return;
        }

        let ego_x = self.cars[0].x();
        for car_i in 1..self.cars.len() {
            let car = &self.cars[car_i];
            if car.crashed {
                continue;
            }
            if car.x() >= self.road.length {
                let behind = self.scenario_rng.gen_range(self.params.place_behind_beyond..self.params.remove_behind_beyond);
                self.respawn_car(car_i, (ego_x - behind).max(0.0));
            } else if car.x() < ego_x - self.params.remove_behind_beyond {
                let ahead = self.scenario_rng.gen_range(self.params.place_ahead_beyond..self.params.place_ahead_within);
                if ego_x + ahead < self.road.length {
                    self.respawn_car(car_i, ego_x + ahead);
                }
            }
        }
    }

    /// Move a background car to `x` in a random open lane. Leaves it where
    /// it is when the spot is taken.
    fn respawn_car(&mut self, car_i: usize, x: f64) {
        let open_lanes = (0..self.road.lanes + 1)
            .filter(|&lane| self.road.lane_open(lane, x))
            .collect_vec();
        let lane = open_lanes[self.scenario_rng.gen_range(0..open_lanes.len())];

        let mut car = self.cars[car_i].clone();
        car.set_theta(0.0);
        car.set_y(self.road.lane_y(lane));
        car.set_x(x);
        car.steer = 0.0;
        car.vel = car.preferred_vel;
        car.target_lane = lane;

        let others_clear = self
            .cars
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != car_i)
            .all(|(_, c)| {
                !query::intersection_test(
                    &car.pose(),
                    &car.padded_shape(self.params.spawn_clearance),
                    &c.pose(),
                    &c.padded_shape(self.params.spawn_clearance),
                )
                .unwrap_or(true)
            });
        if others_clear {
            self.cars[car_i] = car;
        }
    }

    fn refresh_states(&mut self) {
        let road = &self.road;
        self.states = self
            .cars
            .iter()
            .map(|c| c.state(Some(road.lane_index(c.x(), c.y()))))
            .collect();
    }

    /// Ego row relative to the reference point, then the nearest vehicles
    /// relative to the ego, zero-padded to a fixed row count.
    fn observe(&self) -> ObservationRows {
        let n_rows = self.params.observation_vehicles.max(1);
        let ego = &self.cars[0];
        let [ex, ey] = ego.center();
        let [evx, evy] = ego.velocity();
        let [rx, ry] = self.reference_point();

        let mut rows = vec![vec![1.0, ex - rx, ey - ry, evx, evy]];
        let others = self
            .cars
            .iter()
            .skip(1)
            .map(|c| {
                let [cx, cy] = c.center();
                let [vx, vy] = c.velocity();
                vec![1.0, self.longitudinal_offset(ex, cx), cy - ey, vx - evx, vy - evy]
            })
            .sorted_by(|a, b| a[1].hypot(a[2]).total_cmp(&b[1].hypot(b[2])))
            .take(n_rows - 1);
        rows.extend(others);
        rows.resize(n_rows, vec![0.0; 5]);
        rows
    }

    fn reward(&self) -> f64 {
        let ego = &self.cars[0];
        if ego.crashed {
            return -1.0;
        }
        let speeds = &self.layout.target_speeds;
        match (speeds.first(), speeds.last()) {
            (Some(&low), Some(&high)) if high > low => ((ego.vel - low) / (high - low)).clamp(0.0, 1.0),
            _ => 1.0,
        }
    }

    fn info(&self) -> StepInfo {
        let ego = &self.cars[0];
        StepInfo {
            speed: Some(ego.vel),
            crashed: Some(ego.crashed),
        }
    }

    /// Replace the traffic with hand-placed cars, ego first.
    #[cfg(test)]
    pub fn with_cars(params: &Parameters, scenario: ScenarioKind, cars: Vec<Car>) -> Self {
        let mut road = Self::new(params, scenario, Composition::new(1.0, 0.0, 0.0));
        road.cars = cars;
        road.refresh_states();
        road
    }
}

impl Environment for KinematicRoad {
    fn reset(&mut self, seed: Option<u64>) -> Result<(ObservationRows, StepInfo)> {
        self.validate()?;
        let seed = seed.unwrap_or(self.rng_seed);
        self.scenario_rng = seeded_rng(seed, SCENARIO_STREAM);
        self.traffic_rng = seeded_rng(seed, TRAFFIC_STREAM);
        self.timesteps = 0;
        self.ego_command = None;

        self.spawn()?;
        self.refresh_states();
        Ok((self.observe(), self.info()))
    }

    fn step(&mut self, action: EnvAction) -> Result<StepOutcome> {
        self.validate()?;
        if self.cars.is_empty() {
            return Err(SimError::Simulator("step called before reset".to_owned()));
        }

        match action {
            EnvAction::Discrete(i) => {
                let action = DEFAULT_DISCRETE_ACTIONS
                    .get(i)
                    .and_then(|name| name.parse::<Action>().ok())
                    .ok_or_else(|| SimError::Simulator(format_f!("Invalid discrete action index {i}")))?;
                self.ego_command = None;
                self.apply_meta_action(action);
            }
            EnvAction::Continuous { steer, accel } => {
                self.ego_command = Some((
                    steer.clamp(-MAX_STEER, MAX_STEER),
                    accel.clamp(-self.params.max_braking, self.params.max_accel),
                ));
            }
        }

        for car_i in 1..self.cars.len() {
            let lane = self.choose_lane(car_i);
            self.cars[car_i].target_lane = lane;
        }

        let dt = 1.0 / self.params.policy_frequency;
        let substeps = (self.params.simulation_frequency / self.params.policy_frequency)
            .round()
            .max(1.0) as usize;
        for _ in 0..substeps {
            self.update_inner(dt / substeps as f64);
        }
        self.timesteps += 1;
        self.refresh_states();

        let ego = &self.cars[0];
        Ok(StepOutcome {
            observation: self.observe(),
            reward: self.reward(),
            terminated: ego.crashed,
            truncated: !self.layout.wraps && ego.x() >= self.road.length,
            info: self.info(),
        })
    }

    fn action_space(&self) -> ActionSpace {
        if self.params.continuous_actions {
            ActionSpace::Continuous {
                low: vec![-MAX_STEER, -self.params.max_braking],
                high: vec![MAX_STEER, self.params.max_accel],
            }
        } else {
            ActionSpace::Discrete {
                n: DEFAULT_DISCRETE_ACTIONS.len(),
                actions: Some(DEFAULT_DISCRETE_ACTIONS.iter().map(|s| s.to_string()).collect()),
            }
        }
    }

    fn vehicles(&self) -> &[VehicleState] {
        &self.states
    }

    fn controlled_vehicle(&self) -> Option<VehicleId> {
        self.cars.first().map(|c| c.id)
    }

    fn road(&self) -> &dyn RoadNetwork {
        &self.road
    }

    fn reference_point(&self) -> [f64; 2] {
        match self.layout.zone_x {
            Some(zone_x) => [zone_x, self.road.lane_y(self.road.lanes - 1) / 2.0],
            None => [0.0, 0.0],
        }
    }
}
