use std::collections::{HashMap, HashSet};

use crate::{
    arg_parameters::MetricsParameters,
    environment::{VehicleId, VehicleState},
    metrics::RunSummary,
    scenario::ScenarioKind,
};

/// One step of traffic seen from the scenario's conflict zone centre.
pub struct ZoneFrame<'a> {
    pub vehicles: &'a [VehicleState],
    pub centre: [f64; 2],
}

impl<'a> ZoneFrame<'a> {
    fn from_centre(&self, v: &VehicleState) -> f64 {
        (v.position[0] - self.centre[0]).hypot(v.position[1] - self.centre[1])
    }

    /// Rate of change of the distance to the centre; negative when closing in.
    fn radial_speed(&self, v: &VehicleState) -> f64 {
        let dx = v.position[0] - self.centre[0];
        let dy = v.position[1] - self.centre[1];
        let d = dx.hypot(dy);
        if d < 1e-9 {
            return 0.0;
        }
        let [vx, vy] = v.velocity();
        (dx * vx + dy * vy) / d
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    num as f64 / den.max(1) as f64
}

#[enum_dispatch]
#[derive(Clone, Debug)]
pub enum ScenarioMetrics {
    NoScenarioMetrics,
    IntersectionMetrics,
    RoundaboutMetrics,
    RacetrackMetrics,
}

#[enum_dispatch(ScenarioMetrics)]
pub trait ScenarioMetricsTrait {
    fn collect(&mut self, frame: &ZoneFrame);
    fn finalize(&self, steps: u64, dt: f64, summary: &mut RunSummary);
}

impl ScenarioMetrics {
    pub fn for_scenario(scenario: ScenarioKind, params: &MetricsParameters) -> Self {
        match scenario {
            ScenarioKind::Intersection => IntersectionMetrics::new(params).into(),
            ScenarioKind::Roundabout => RoundaboutMetrics::new(params).into(),
            ScenarioKind::Racetrack => RacetrackMetrics::new(params).into(),
            _ => NoScenarioMetrics.into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct NoScenarioMetrics;

impl ScenarioMetricsTrait for NoScenarioMetrics {
    fn collect(&mut self, _frame: &ZoneFrame) {}

    fn finalize(&self, _steps: u64, _dt: f64, _summary: &mut RunSummary) {}
}

#[derive(Clone, Debug)]
pub struct IntersectionMetrics {
    zone_radius: f64,
    waiting_radius: f64,
    turning_lateral_speed: f64,
    waiting_speed: f64,

    in_zone: HashSet<VehicleId>,
    turning: HashSet<VehicleId>,
    waiting: HashSet<VehicleId>,
    entries: u64,
    turn_attempts: u64,
    successful_turns: u64,
    waiting_steps: u64,
    waiting_episodes: u64,
    occupancy_sum: u64,
}

impl IntersectionMetrics {
    pub fn new(params: &MetricsParameters) -> Self {
        Self {
            zone_radius: params.intersection_radius,
            waiting_radius: params.intersection_radius * params.waiting_radius_factor,
            turning_lateral_speed: params.turning_lateral_speed,
            waiting_speed: params.waiting_speed,
            in_zone: HashSet::new(),
            turning: HashSet::new(),
            waiting: HashSet::new(),
            entries: 0,
            turn_attempts: 0,
            successful_turns: 0,
            waiting_steps: 0,
            waiting_episodes: 0,
            occupancy_sum: 0,
        }
    }
}

impl ScenarioMetricsTrait for IntersectionMetrics {
    fn collect(&mut self, frame: &ZoneFrame) {
        for v in frame.vehicles {
            let d = frame.from_centre(v);

            if d < self.zone_radius {
                self.occupancy_sum += 1;
                if self.in_zone.insert(v.id) {
                    self.entries += 1;
                }
            } else {
                self.in_zone.remove(&v.id);
            }

            let lateral_speed = v.velocity()[1].abs();
            if v.crashed {
                self.turning.remove(&v.id);
            } else if lateral_speed > self.turning_lateral_speed {
                if self.turning.insert(v.id) {
                    self.turn_attempts += 1;
                }
            } else if self.turning.remove(&v.id) {
                self.successful_turns += 1;
            }

            if !v.crashed && d < self.waiting_radius && v.speed < self.waiting_speed {
                self.waiting_steps += 1;
                if self.waiting.insert(v.id) {
                    self.waiting_episodes += 1;
                }
            } else {
                self.waiting.remove(&v.id);
            }
        }
    }

    fn finalize(&self, steps: u64, dt: f64, summary: &mut RunSummary) {
        let minutes = steps as f64 * dt / 60.0;
        summary.insert("turn_attempts".into(), self.turn_attempts as f64);
        summary.insert(
            "turn_success_rate".into(),
            ratio(self.successful_turns, self.turn_attempts),
        );
        summary.insert(
            "avg_waiting_steps".into(),
            ratio(self.waiting_steps, self.waiting_episodes),
        );
        summary.insert(
            "intersection_throughput".into(),
            if minutes > 0.0 {
                self.entries as f64 / minutes
            } else {
                0.0
            },
        );
        summary.insert(
            "conflict_zone_occupancy".into(),
            ratio(self.occupancy_sum, steps),
        );
    }
}

#[derive(Clone, Debug)]
pub struct RoundaboutMetrics {
    ring_radius: f64,
    entry_radius: f64,
    entry_speed: f64,

    approaching: HashSet<VehicleId>,
    waiting: HashSet<VehicleId>,
    entry_attempts: u64,
    successful_entries: u64,
    entry_waiting_steps: u64,
    entry_waiting_episodes: u64,
    yield_events: u64,
    proper_yields: u64,
    inner_lane_steps: u64,
    outer_lane_steps: u64,
}

impl RoundaboutMetrics {
    pub fn new(params: &MetricsParameters) -> Self {
        Self {
            ring_radius: params.ring_radius,
            entry_radius: params.entry_zone_radius,
            entry_speed: params.entry_speed,
            approaching: HashSet::new(),
            waiting: HashSet::new(),
            entry_attempts: 0,
            successful_entries: 0,
            entry_waiting_steps: 0,
            entry_waiting_episodes: 0,
            yield_events: 0,
            proper_yields: 0,
            inner_lane_steps: 0,
            outer_lane_steps: 0,
        }
    }
}

impl ScenarioMetricsTrait for RoundaboutMetrics {
    fn collect(&mut self, frame: &ZoneFrame) {
        let circulating = frame
            .vehicles
            .iter()
            .filter(|v| !v.crashed && frame.from_centre(v) < self.ring_radius)
            .count();

        for v in frame.vehicles {
            let d = frame.from_centre(v);
            let in_entry_zone = d > self.ring_radius && d < self.entry_radius;

            if d < self.ring_radius {
                if self.approaching.remove(&v.id) && !v.crashed {
                    self.successful_entries += 1;
                }
                match v.lane_index {
                    Some(lane) if lane.lane == 0 => self.inner_lane_steps += 1,
                    Some(_) => self.outer_lane_steps += 1,
                    None => {}
                }
            } else if in_entry_zone && frame.radial_speed(v) < 0.0 {
                if v.speed > self.entry_speed && self.approaching.insert(v.id) {
                    self.entry_attempts += 1;
                }
            } else if !in_entry_zone {
                self.approaching.remove(&v.id);
            }
            if v.crashed {
                self.approaching.remove(&v.id);
            }

            let stopped_at_entry = in_entry_zone && v.speed < self.entry_speed;
            if stopped_at_entry {
                self.entry_waiting_steps += 1;
                if self.waiting.insert(v.id) {
                    self.entry_waiting_episodes += 1;
                }
                if circulating > 0 {
                    self.yield_events += 1;
                    if !v.crashed {
                        self.proper_yields += 1;
                    }
                }
            } else {
                self.waiting.remove(&v.id);
            }
        }
    }

    fn finalize(&self, _steps: u64, _dt: f64, summary: &mut RunSummary) {
        summary.insert("entry_attempts".into(), self.entry_attempts as f64);
        summary.insert(
            "entry_success_rate".into(),
            ratio(self.successful_entries, self.entry_attempts),
        );
        summary.insert(
            "avg_entry_waiting_steps".into(),
            ratio(self.entry_waiting_steps, self.entry_waiting_episodes),
        );
        summary.insert(
            "yield_compliance_rate".into(),
            ratio(self.proper_yields, self.yield_events),
        );
        let lane_steps = self.inner_lane_steps + self.outer_lane_steps;
        summary.insert(
            "lane_balance_ratio".into(),
            if lane_steps > 0 {
                ratio(self.inner_lane_steps, lane_steps)
            } else {
                0.5
            },
        );
    }
}

#[derive(Clone, Debug)]
pub struct RacetrackMetrics {
    overtake_proximity: f64,
    overtake_speed_diff: f64,
    slipstream_min: f64,
    slipstream_max: f64,
    slipstream_speed_diff: f64,
    same_lane_offset: f64,
    high_speed: f64,

    max_speed: f64,
    /// (overtaker, overtaken) pairs in progress
    overtaking: HashSet<(VehicleId, VehicleId)>,
    overtaking_attempts: u64,
    successful_overtakes: u64,
    slipstream_steps: u64,
    crashed: HashSet<VehicleId>,
    high_speed_incidents: u64,
    last_speed: HashMap<VehicleId, f64>,
}

impl RacetrackMetrics {
    pub fn new(params: &MetricsParameters) -> Self {
        Self {
            overtake_proximity: params.overtake_proximity,
            overtake_speed_diff: params.overtake_speed_diff,
            slipstream_min: params.slipstream_min_gap,
            slipstream_max: params.slipstream_max_gap,
            slipstream_speed_diff: params.slipstream_speed_diff,
            same_lane_offset: params.same_lane_offset,
            high_speed: params.high_speed,
            max_speed: 0.0,
            overtaking: HashSet::new(),
            overtaking_attempts: 0,
            successful_overtakes: 0,
            slipstream_steps: 0,
            crashed: HashSet::new(),
            high_speed_incidents: 0,
            last_speed: HashMap::new(),
        }
    }
}

impl ScenarioMetricsTrait for RacetrackMetrics {
    fn collect(&mut self, frame: &ZoneFrame) {
        for v in frame.vehicles {
            if v.crashed {
                if self.crashed.insert(v.id) {
                    let speed = self.last_speed.get(&v.id).copied().unwrap_or(v.speed);
                    if speed > self.high_speed {
                        self.high_speed_incidents += 1;
                    }
                }
                continue;
            }
            self.crashed.remove(&v.id);
            self.last_speed.insert(v.id, v.speed);
            self.max_speed = self.max_speed.max(v.speed);
        }

        let mut drafting = HashSet::new();
        for a in frame.vehicles.iter().filter(|v| !v.crashed) {
            for b in frame.vehicles.iter().filter(|v| !v.crashed && v.id != a.id) {
                let ahead = b.position[0] - a.position[0];
                let lateral = (b.position[1] - a.position[1]).abs();
                let speed_diff = a.speed - b.speed;
                let key = (a.id, b.id);

                if self.overtaking.contains(&key) {
                    if ahead < 0.0 {
                        self.successful_overtakes += 1;
                        self.overtaking.remove(&key);
                    } else if ahead > 2.0 * self.overtake_proximity {
                        self.overtaking.remove(&key);
                    }
                } else if ahead > 0.0
                    && ahead < self.overtake_proximity
                    && speed_diff > self.overtake_speed_diff
                {
                    self.overtaking.insert(key);
                    self.overtaking_attempts += 1;
                }

                let gap = ahead - b.length;
                if lateral < self.same_lane_offset
                    && gap > self.slipstream_min
                    && gap < self.slipstream_max
                    && speed_diff.abs() < self.slipstream_speed_diff
                {
                    drafting.insert(a.id);
                }
            }
        }
        self.slipstream_steps += drafting.len() as u64;

        let crashed = &self.crashed;
        self.overtaking
            .retain(|(a, b)| !crashed.contains(a) && !crashed.contains(b));
    }

    fn finalize(&self, _steps: u64, _dt: f64, summary: &mut RunSummary) {
        summary.insert("max_speed_achieved".into(), self.max_speed);
        summary.insert("overtaking_attempts".into(), self.overtaking_attempts as f64);
        summary.insert(
            "overtaking_success_rate".into(),
            ratio(self.successful_overtakes, self.overtaking_attempts),
        );
        summary.insert("slipstream_steps".into(), self.slipstream_steps as f64);
        summary.insert("high_speed_incidents".into(), self.high_speed_incidents as f64);
    }
}
