use std::collections::{BTreeMap, HashMap, HashSet};

use ordered_float::OrderedFloat;
use traffic_stats::SampleSet;

use crate::{
    arg_parameters::{MetricsParameters, Parameters},
    environment::{LaneIndex, RoadNetwork, StepInfo, VehicleId, VehicleState},
    scenario::ScenarioKind,
    scenario_metrics::{ScenarioMetrics, ScenarioMetricsTrait, ZoneFrame},
};

/// Flat metric name -> value record of one run.
pub type RunSummary = BTreeMap<String, f64>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepTrace {
    pub step: u64,
    pub vehicle_count: usize,
    pub ego_speed: Option<f64>,
    pub collisions_this_step: u64,
    pub ego_crashed: bool,
}

#[derive(Clone, Copy, Debug)]
struct VehicleTrack {
    speed: f64,
    accel: Option<f64>,
    s: Option<f64>,
    lane: Option<LaneIndex>,
    completed: bool,
}

/// Lane-local neighbour of a vehicle: index and bumper-to-bumper gap.
#[derive(Clone, Copy, Debug)]
struct Neighbour {
    i: usize,
    gap: f64,
}

/// Accumulates safety, efficiency and comfort indicators over one run.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    params: MetricsParameters,
    scenario: ScenarioKind,
    dt: f64,
    debug: bool,

    steps: u64,
    ego_speeds: SampleSet,
    network_speeds: SampleSet,
    tracks: HashMap<VehicleId, VehicleTrack>,
    accels: SampleSet,
    jerks: SampleSet,

    crashed: HashSet<VehicleId>,
    severity_pairs: HashSet<(VehicleId, VehicleId)>,
    total_collisions: u64,
    ego_collisions: u64,
    ego_crashed: bool,
    severities: SampleSet,

    ttcs: SampleSet,
    ttc_events: u64,
    ttc_under_1s_steps: u64,
    ttc_under_2s_steps: u64,
    headways: SampleSet,
    dracs: SampleSet,

    lane_change_attempts: u64,
    unsafe_lane_changes: u64,
    right_lane_eligible: u64,
    right_lane_in: u64,
    throughput: u64,
    merge_attempts: u64,
    successful_merges: u64,
    vehicle_steps: u64,

    reference_point: [f64; 2],
    scenario_metrics: ScenarioMetrics,
}

fn ratio(num: u64, den: u64) -> f64 {
    num as f64 / den.max(1) as f64
}

fn lane_s(road: &dyn RoadNetwork, v: &VehicleState) -> Option<(LaneIndex, f64)> {
    let lane = v.lane_index?;
    let (s, _) = road.local_coordinates(&lane, v.position)?;
    s.is_finite().then(|| (lane, s))
}

impl MetricsCollector {
    pub fn new(params: &Parameters, scenario: ScenarioKind, reference_point: [f64; 2]) -> Self {
        let freq = params.metrics.decision_frequency;
        let dt = if freq.is_finite() && freq > 0.0 {
            1.0 / freq
        } else {
            1.0
        };
        Self {
            params: params.metrics.clone(),
            scenario,
            dt,
            debug: params.debug.metrics_debug,
            steps: 0,
            ego_speeds: SampleSet::new(),
            network_speeds: SampleSet::new(),
            tracks: HashMap::new(),
            accels: SampleSet::new(),
            jerks: SampleSet::new(),
            crashed: HashSet::new(),
            severity_pairs: HashSet::new(),
            total_collisions: 0,
            ego_collisions: 0,
            ego_crashed: false,
            severities: SampleSet::new(),
            ttcs: SampleSet::new(),
            ttc_events: 0,
            ttc_under_1s_steps: 0,
            ttc_under_2s_steps: 0,
            headways: SampleSet::new(),
            dracs: SampleSet::new(),
            lane_change_attempts: 0,
            unsafe_lane_changes: 0,
            right_lane_eligible: 0,
            right_lane_in: 0,
            throughput: 0,
            merge_attempts: 0,
            successful_merges: 0,
            vehicle_steps: 0,
            reference_point,
            scenario_metrics: ScenarioMetrics::for_scenario(scenario, &params.metrics),
        }
    }

    /// Clears every accumulator, keeping the configuration.
    pub fn reset(&mut self, reference_point: [f64; 2]) {
        self.steps = 0;
        self.ego_speeds = SampleSet::new();
        self.network_speeds = SampleSet::new();
        self.tracks.clear();
        self.accels = SampleSet::new();
        self.jerks = SampleSet::new();
        self.crashed.clear();
        self.severity_pairs.clear();
        self.total_collisions = 0;
        self.ego_collisions = 0;
        self.ego_crashed = false;
        self.severities = SampleSet::new();
        self.ttcs = SampleSet::new();
        self.ttc_events = 0;
        self.ttc_under_1s_steps = 0;
        self.ttc_under_2s_steps = 0;
        self.headways = SampleSet::new();
        self.dracs = SampleSet::new();
        self.lane_change_attempts = 0;
        self.unsafe_lane_changes = 0;
        self.right_lane_eligible = 0;
        self.right_lane_in = 0;
        self.throughput = 0;
        self.merge_attempts = 0;
        self.successful_merges = 0;
        self.vehicle_steps = 0;
        self.reference_point = reference_point;
        self.scenario_metrics = ScenarioMetrics::for_scenario(self.scenario, &self.params);
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn avg_speed_so_far(&self) -> f64 {
        self.ego_speeds.mean().unwrap_or(0.0)
    }

    pub fn total_collisions(&self) -> u64 {
        self.total_collisions
    }

    fn ego_index(vehicles: &[VehicleState], controlled: Option<VehicleId>) -> Option<usize> {
        match controlled {
            Some(id) => vehicles.iter().position(|v| v.id == id),
            None if !vehicles.is_empty() => Some(0),
            None => None,
        }
    }

    /// Nearest vehicle ahead and behind in `lane`, measured from `s`.
    fn neighbours(
        road: &dyn RoadNetwork,
        vehicles: &[VehicleState],
        vehicle_i: usize,
        lane: &LaneIndex,
        s: f64,
    ) -> (Option<Neighbour>, Option<Neighbour>) {
        let me = &vehicles[vehicle_i];
        let gap_to = |j: usize| -> Option<f64> {
            let other = &vehicles[j];
            let other_lane = other.lane_index.unwrap_or(*lane);
            let (other_s, _) = road.local_coordinates(&other_lane, other.position)?;
            let ds = other_s - s;
            Some(ds.abs() - (me.length + other.length) / 2.0)
        };

        if let Some((front, rear)) = road.neighbour_vehicles(vehicles, vehicle_i, lane) {
            let front = front.and_then(|j| gap_to(j).map(|gap| Neighbour { i: j, gap }));
            let rear = rear.and_then(|j| gap_to(j).map(|gap| Neighbour { i: j, gap }));
            return (front, rear);
        }

        let same_lane = vehicles
            .iter()
            .enumerate()
            .filter(|&(j, v)| j != vehicle_i && v.lane_index.map_or(false, |l| l.lane == lane.lane))
            .filter_map(|(j, v)| {
                let (other_s, _) = road.local_coordinates(lane, v.position)?;
                Some((j, other_s - s, v.length))
            });
        let (ahead, behind): (Vec<_>, Vec<_>) = same_lane.partition(|&(_, ds, _)| ds > 0.0);
        let nearest = |candidates: Vec<(usize, f64, f64)>| {
            candidates
                .into_iter()
                .min_by_key(|&(_, ds, _)| OrderedFloat(ds.abs()))
                .map(|(j, ds, length)| Neighbour {
                    i: j,
                    gap: ds.abs() - (me.length + length) / 2.0,
                })
        };
        (nearest(ahead), nearest(behind))
    }

    /// Free space ahead of `s` in `lane`, bounded by the lane's end.
    fn front_space(
        road: &dyn RoadNetwork,
        vehicles: &[VehicleState],
        lane: &LaneIndex,
        s: f64,
        length: f64,
    ) -> Option<f64> {
        let lane_end = road.lane_length(lane)? - s;
        let nearest = vehicles
            .iter()
            .filter(|v| v.lane_index.map_or(false, |l| l.lane == lane.lane))
            .filter_map(|v| road.local_coordinates(lane, v.position).map(|(vs, _)| (vs, v.length)))
            .filter(|&(vs, _)| vs > s)
            .map(|(vs, vl)| vs - s - (length + vl) / 2.0)
            .min_by_key(|&gap| OrderedFloat(gap));
        Some(nearest.map_or(lane_end, |gap| gap.min(lane_end)))
    }

    pub fn collect_step(
        &mut self,
        vehicles: &[VehicleState],
        road: &dyn RoadNetwork,
        controlled: Option<VehicleId>,
        info: &StepInfo,
    ) -> StepTrace {
        self.steps += 1;
        self.vehicle_steps += vehicles.len() as u64;
        let p = &self.params;
        let dt = self.dt;

        // ego and speeds
        let ego_i = Self::ego_index(vehicles, controlled);
        let ego = ego_i.map(|i| &vehicles[i]);
        let ego_speed = match ego {
            Some(ego) => (!ego.crashed).then(|| ego.speed),
            None => info.speed.filter(|_| info.crashed != Some(true)),
        };
        if let Some(speed) = ego_speed {
            self.ego_speeds.push(speed);
        }
        let mut moving = SampleSet::new();
        moving.extend(vehicles.iter().filter(|v| !v.crashed).map(|v| v.speed));
        if let Some(mean) = moving.mean() {
            self.network_speeds.push(mean);
        }

        // collisions
        let mut collisions_this_step = 0;
        for (i, v) in vehicles.iter().enumerate() {
            if !v.crashed {
                self.crashed.remove(&v.id);
                continue;
            }
            if !self.crashed.insert(v.id) {
                continue;
            }
            collisions_this_step += 1;
            self.total_collisions += 1;
            if Some(i) == ego_i {
                self.ego_collisions += 1;
            }

            let other = vehicles
                .iter()
                .filter(|o| o.id != v.id)
                .map(|o| (o, v.distance_to(o)))
                .filter(|&(_, d)| d <= p.collision_radius)
                .min_by_key(|&(_, d)| OrderedFloat(d));
            if let Some((o, _)) = other {
                let pair = (v.id.min(o.id), v.id.max(o.id));
                if self.severity_pairs.insert(pair) {
                    let [vx, vy] = v.velocity();
                    let [ox, oy] = o.velocity();
                    self.severities.push((vx - ox).powi(2) + (vy - oy).powi(2));
                }
            }
            if self.debug {
                let step = self.steps;
                let id = v.id;
                eprintln_f!("step {step}: collision of vehicle {id} at {:.1?}", v.position);
            }
        }
        // a pair scores again once both sides have recovered
        let crashed = &self.crashed;
        self.severity_pairs
            .retain(|(a, b)| crashed.contains(a) || crashed.contains(b));
        let ego_crashed_now = ego.map_or(info.crashed == Some(true), |e| e.crashed);
        self.ego_crashed |= ego_crashed_now;

        // per-vehicle kinematics and lane-local interactions
        let mut step_min_ttc: Option<f64> = None;
        let mut new_tracks = HashMap::with_capacity(vehicles.len());
        for (i, v) in vehicles.iter().enumerate() {
            let prev = self.tracks.get(&v.id).copied();

            let mut accel = None;
            if let Some(prev) = prev {
                let a = (v.speed - prev.speed) / dt;
                if a.is_finite() && a.abs() <= p.accel_outlier {
                    self.accels.push(a);
                    accel = Some(a);
                    if let Some(prev_a) = prev.accel {
                        let jerk = (a - prev_a) / dt;
                        if jerk.is_finite() && jerk.abs() <= p.jerk_outlier {
                            self.jerks.push(jerk.abs());
                        }
                    }
                }
            }

            let located = lane_s(road, v);
            let mut track = VehicleTrack {
                speed: v.speed,
                accel,
                s: located.map(|(_, s)| s),
                lane: v.lane_index,
                completed: prev.map_or(false, |t| t.completed),
            };
            let Some((lane, s)) = located else {
                new_tracks.insert(v.id, track);
                continue;
            };

            let respawned = prev
                .and_then(|t| t.s)
                .map_or(false, |prev_s| prev_s - s > p.respawn_jump);
            if respawned {
                track.completed = false;
            }

            let (front, rear) = Self::neighbours(road, vehicles, i, &lane, s);

            if !v.crashed {
                if let Some(front) = front {
                    let gap = front.gap;
                    if v.speed > p.min_speed_thw && gap > 0.0 {
                        self.headways.push(gap / v.speed);
                    }
                    let closing = v.speed - vehicles[front.i].speed;
                    if closing > 0.0 && gap > 0.0 {
                        let ttc = gap / closing;
                        self.ttcs.push(ttc);
                        self.dracs.push(closing * closing / (2.0 * gap));
                        step_min_ttc = Some(step_min_ttc.map_or(ttc, |m| m.min(ttc)));
                        if ttc < p.ttc_threshold {
                            self.ttc_events += 1;
                            if self.debug {
                                let step = self.steps;
                                let id = v.id;
                                eprintln_f!("step {step}: near miss, vehicle {id} ttc {ttc:.2}s");
                            }
                        }
                    }
                }
            }

            // lane changes and merges
            if let Some(prev_lane) = prev.and_then(|t| t.lane) {
                if prev_lane.lane != lane.lane && !respawned {
                    self.lane_change_attempts += 1;
                    let is_unsafe = rear.map_or(false, |rear| {
                        let rear_v = &vehicles[rear.i];
                        let safe_gap = p.lc_min_gap.max(rear_v.speed * p.lc_safe_time_gap);
                        rear.gap < safe_gap || (v.speed - rear_v.speed).abs() > p.lc_max_speed_diff
                    });
                    if is_unsafe {
                        self.unsafe_lane_changes += 1;
                    }

                    if self.scenario.is_merge() {
                        let rightmost = road.lane_count(&prev_lane).map(|n| n.saturating_sub(1));
                        if rightmost == Some(prev_lane.lane) && lane.lane < prev_lane.lane {
                            self.merge_attempts += 1;
                            if !v.crashed {
                                self.successful_merges += 1;
                            }
                        }
                    }
                }
            }

            // right-lane compliance
            if Some(i) == ego_i && !v.crashed {
                if let Some(n) = road.lane_count(&lane) {
                    let right = lane.with_lane(n.saturating_sub(1));
                    if lane.lane == right.lane {
                        self.right_lane_eligible += 1;
                        self.right_lane_in += 1;
                    } else if Self::front_space(road, vehicles, &right, s, v.length)
                        .map_or(false, |space| space >= p.right_lane_gap)
                    {
                        self.right_lane_eligible += 1;
                    }
                }
            }

            // throughput
            if let (Some(length), Some(prev_s)) = (road.lane_length(&lane), prev.and_then(|t| t.s)) {
                let finish = length - p.end_margin;
                if !track.completed && !respawned && prev_s < finish && s >= finish {
                    track.completed = true;
                    self.throughput += 1;
                }
            }

            new_tracks.insert(v.id, track);
        }
        self.tracks = new_tracks;

        if let Some(min_ttc) = step_min_ttc {
            if min_ttc < 1.0 {
                self.ttc_under_1s_steps += 1;
            }
            if min_ttc < 2.0 {
                self.ttc_under_2s_steps += 1;
            }
        }

        self.scenario_metrics.collect(&ZoneFrame {
            vehicles,
            centre: self.reference_point,
        });

        StepTrace {
            step: self.steps,
            vehicle_count: vehicles.len(),
            ego_speed: ego.map(|e| e.speed).or(info.speed),
            collisions_this_step,
            ego_crashed: ego_crashed_now,
        }
    }

    pub fn finalize(&self) -> RunSummary {
        let p = &self.params;
        let mut summary = RunSummary::new();
        let mut put = |key: &str, value: f64| {
            summary.insert(key.to_owned(), value);
        };

        let elapsed_min = self.steps as f64 * self.dt / 60.0;

        put("steps", self.steps as f64);
        put("avg_speed", self.ego_speeds.mean().unwrap_or(0.0));
        put("speed_std", self.ego_speeds.population_std_dev());
        put("network_avg_speed", self.network_speeds.mean().unwrap_or(0.0));

        put("throughput", self.throughput as f64);
        put(
            "throughput_per_min",
            if elapsed_min > 0.0 {
                self.throughput as f64 / elapsed_min
            } else {
                0.0
            },
        );

        put("total_collisions", self.total_collisions as f64);
        put("ego_collisions", self.ego_collisions as f64);
        put("ego_crashed", if self.ego_crashed { 1.0 } else { 0.0 });

        if let Some(mean) = self.ttcs.mean() {
            put("avg_ttc", mean);
        }
        if let Some(min) = self.ttcs.min() {
            put("min_ttc", min);
        }
        put("ttc_events_count", self.ttc_events as f64);
        put("ttc_under_1s_fraction", ratio(self.ttc_under_1s_steps, self.steps));
        put("ttc_under_2s_fraction", ratio(self.ttc_under_2s_steps, self.steps));

        if let Some(median) = self.headways.median() {
            put("headway_median", median);
        }
        if let Some(p5) = self.headways.percentile(0.05) {
            put("headway_p5", p5);
        }
        put(
            "headway_violation_rate",
            self.headways.fraction_where(|h| h < p.thw_violation),
        );

        put("drac_mean", self.dracs.mean().unwrap_or(0.0));
        put("drac_p95", self.dracs.percentile(0.95).unwrap_or(0.0));
        put("collision_severity_mean", self.severities.mean().unwrap_or(0.0));
        put("collision_severity_p95", self.severities.percentile(0.95).unwrap_or(0.0));

        put("acceleration_mean", self.accels.mean().unwrap_or(0.0));
        put("acceleration_std", self.accels.population_std_dev());
        put("jerk_mean", self.jerks.mean().unwrap_or(0.0));
        put("jerk_p95", self.jerks.percentile(0.95).unwrap_or(0.0));
        put("jerk_max", self.jerks.max().unwrap_or(0.0));
        put(
            "harsh_jerk_fraction",
            self.jerks.fraction_where(|j| j > p.harsh_jerk),
        );

        put("lane_change_attempts", self.lane_change_attempts as f64);
        put("unsafe_lane_changes", self.unsafe_lane_changes as f64);
        put(
            "unsafe_lane_change_rate",
            ratio(self.unsafe_lane_changes, self.lane_change_attempts),
        );
        put(
            "right_lane_compliance",
            ratio(self.right_lane_in, self.right_lane_eligible),
        );
        put("merge_attempts", self.merge_attempts as f64);
        put("successful_merges", self.successful_merges as f64);
        put(
            "merge_success_rate",
            ratio(self.successful_merges, self.merge_attempts),
        );

        put("vehicle_steps", self.vehicle_steps as f64);
        put(
            "crash_rate_per_1000_vehicle_steps",
            ratio(self.total_collisions, self.vehicle_steps) * 1000.0,
        );

        self.scenario_metrics
            .finalize(self.steps, self.dt, &mut summary);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::road::StraightRoad;
    use approx::assert_abs_diff_eq;

    fn params() -> Parameters {
        Parameters::new().unwrap()
    }

    fn road() -> StraightRoad {
        StraightRoad::new(3, 4.0, 1000.0, None)
    }

    fn vehicle(id: VehicleId, x: f64, lane: usize, speed: f64) -> VehicleState {
        VehicleState {
            id,
            position: [x, lane as f64 * 4.0],
            heading: 0.0,
            speed,
            length: 5.0,
            crashed: false,
            lane_index: Some(LaneIndex::new(0, 1, lane)),
            acceleration: None,
            profile: None,
        }
    }

    fn collector() -> MetricsCollector {
        MetricsCollector::new(&params(), ScenarioKind::Highway, [0.0, 0.0])
    }

    #[test]
    fn test_sustained_crash_counts_once() {
        let mut m = collector();
        let road = road();
        let info = StepInfo::default();
        let mut a = vehicle(0, 100.0, 1, 10.0);
        let mut b = vehicle(1, 104.0, 1, 4.0);
        m.collect_step(&[a.clone(), b.clone()], &road, Some(0), &info);
        a.crashed = true;
        b.crashed = true;
        for _ in 0..3 {
            m.collect_step(&[a.clone(), b.clone()], &road, Some(0), &info);
        }
        let s = m.finalize();
        assert_eq!(s["total_collisions"], 2.0);
        assert_eq!(s["ego_collisions"], 1.0);
        assert_eq!(s["ego_crashed"], 1.0);
        // one severity sample for the pair, (10 - 4)^2
        assert_abs_diff_eq!(s["collision_severity_mean"], 36.0, epsilon = 1e-9);
        // the ego speed is skipped while crashed
        assert_abs_diff_eq!(s["avg_speed"], 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_recovered_pair_scores_new_collision() {
        let mut m = collector();
        let road = road();
        let info = StepInfo::default();
        let mut a = vehicle(0, 100.0, 1, 10.0);
        let mut b = vehicle(1, 104.0, 1, 4.0);
        m.collect_step(&[a.clone(), b.clone()], &road, Some(0), &info);
        a.crashed = true;
        b.crashed = true;
        m.collect_step(&[a.clone(), b.clone()], &road, Some(0), &info);
        a.crashed = false;
        b.crashed = false;
        m.collect_step(&[a.clone(), b.clone()], &road, Some(0), &info);
        a.speed = 6.0;
        a.crashed = true;
        b.crashed = true;
        m.collect_step(&[a.clone(), b.clone()], &road, Some(0), &info);
        let s = m.finalize();
        assert_eq!(s["total_collisions"], 4.0);
        // samples (10 - 4)^2 and (6 - 4)^2
        assert_abs_diff_eq!(s["collision_severity_mean"], 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_unlocated_vehicle_is_skipped() {
        let mut m = collector();
        let road = road();
        let mut lost = vehicle(2, 500.0, 0, 12.0);
        lost.lane_index = None;
        let vehicles = [vehicle(0, 100.0, 1, 15.0), vehicle(1, 130.0, 1, 10.0), lost];
        m.collect_step(&vehicles, &road, Some(0), &StepInfo::default());
        m.collect_step(&vehicles, &road, Some(0), &StepInfo::default());
        let s = m.finalize();
        assert_abs_diff_eq!(s["avg_ttc"], 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s["min_ttc"], 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s["drac_mean"], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(s["headway_median"], 25.0 / 15.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s["avg_speed"], 15.0, epsilon = 1e-9);
        // still part of the network speed
        assert_abs_diff_eq!(s["network_avg_speed"], 37.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ttc_headway_and_drac() {
        let mut m = collector();
        let road = road();
        // 25 m bumper gap, closing at 5 m/s
        let vehicles = [vehicle(0, 100.0, 1, 15.0), vehicle(1, 130.0, 1, 10.0)];
        m.collect_step(&vehicles, &road, Some(0), &StepInfo::default());
        let s = m.finalize();
        assert_abs_diff_eq!(s["avg_ttc"], 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s["min_ttc"], 5.0, epsilon = 1e-9);
        assert_eq!(s["ttc_events_count"], 0.0);
        assert_abs_diff_eq!(s["drac_mean"], 0.5, epsilon = 1e-9);
        // headways 25/15 for the ego only; the leader has nobody ahead
        assert_abs_diff_eq!(s["headway_median"], 25.0 / 15.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s["headway_violation_rate"], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_no_ttc_without_closing() {
        let mut m = collector();
        let road = road();
        let vehicles = [vehicle(0, 100.0, 1, 10.0), vehicle(1, 108.0, 1, 10.0)];
        m.collect_step(&vehicles, &road, Some(0), &StepInfo::default());
        let s = m.finalize();
        assert!(!s.contains_key("avg_ttc"));
        assert!(!s.contains_key("min_ttc"));
        assert_eq!(s["ttc_under_2s_fraction"], 0.0);
        // 3 m gap at 10 m/s violates the 1 s headway
        assert_abs_diff_eq!(s["headway_violation_rate"], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_near_miss_step_fractions() {
        let mut m = collector();
        let road = road();
        // gap 5 m, closing 10 m/s: ttc 0.5 s
        let close = [vehicle(0, 100.0, 1, 20.0), vehicle(1, 110.0, 1, 10.0)];
        let far = [vehicle(0, 100.0, 1, 20.0), vehicle(1, 300.0, 1, 20.0)];
        m.collect_step(&close, &road, Some(0), &StepInfo::default());
        m.collect_step(&far, &road, Some(0), &StepInfo::default());
        let s = m.finalize();
        assert_eq!(s["ttc_events_count"], 1.0);
        assert_abs_diff_eq!(s["ttc_under_1s_fraction"], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(s["ttc_under_2s_fraction"], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_acceleration_and_jerk() {
        let mut m = collector();
        let road = road();
        for speed in [10.0, 12.0, 15.0, 15.0] {
            m.collect_step(&[vehicle(0, 100.0, 1, speed)], &road, Some(0), &StepInfo::default());
        }
        let s = m.finalize();
        // accelerations 2, 3, 0 and jerks 1, 3
        assert_abs_diff_eq!(s["acceleration_mean"], 5.0 / 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s["jerk_mean"], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s["jerk_max"], 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s["harsh_jerk_fraction"], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_outlier_acceleration_dropped() {
        let mut m = collector();
        let road = road();
        for speed in [10.0, 80.0] {
            m.collect_step(&[vehicle(0, 100.0, 1, speed)], &road, Some(0), &StepInfo::default());
        }
        let s = m.finalize();
        assert_eq!(s["acceleration_mean"], 0.0);
    }

    #[test]
    fn test_lane_change_classification() {
        let mut m = collector();
        let road = road();
        let info = StepInfo::default();
        // ego moves into lane 2 right in front of a fast follower
        m.collect_step(
            &[vehicle(0, 100.0, 1, 20.0), vehicle(1, 94.0, 2, 28.0)],
            &road,
            Some(0),
            &info,
        );
        m.collect_step(
            &[vehicle(0, 120.0, 2, 20.0), vehicle(1, 122.0 - 10.0, 2, 28.0)],
            &road,
            Some(0),
            &info,
        );
        // the follower drops back and the ego returns with nobody behind
        m.collect_step(
            &[vehicle(0, 140.0, 2, 20.0), vehicle(1, 400.0, 2, 28.0)],
            &road,
            Some(0),
            &info,
        );
        m.collect_step(
            &[vehicle(0, 160.0, 1, 20.0), vehicle(1, 428.0, 2, 28.0)],
            &road,
            Some(0),
            &info,
        );
        let s = m.finalize();
        assert_eq!(s["lane_change_attempts"], 2.0);
        assert_eq!(s["unsafe_lane_changes"], 1.0);
        assert_abs_diff_eq!(s["unsafe_lane_change_rate"], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_throughput_respawn_guard() {
        let mut params = params();
        params.metrics.decision_frequency = 1.0;
        let mut m = MetricsCollector::new(&params, ScenarioKind::Highway, [0.0, 0.0]);
        let road = StraightRoad::new(1, 4.0, 100.0, None);
        let info = StepInfo::default();
        // crosses the finish, lingers, jumps back to the start and crosses again
        for x in [80.0, 97.0, 99.0, 10.0, 90.0, 96.0] {
            m.collect_step(&[vehicle(7, x, 0, 20.0)], &road, Some(7), &info);
        }
        let s = m.finalize();
        assert_eq!(s["throughput"], 2.0);
        assert_abs_diff_eq!(s["throughput_per_min"], 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_right_lane_compliance() {
        let mut m = collector();
        let road = road();
        let info = StepInfo::default();
        // right lane free: eligible but not in it
        m.collect_step(&[vehicle(0, 100.0, 1, 20.0)], &road, Some(0), &info);
        // right lane blocked just ahead: not eligible
        m.collect_step(
            &[vehicle(0, 100.0, 1, 20.0), vehicle(1, 110.0, 2, 20.0)],
            &road,
            Some(0),
            &info,
        );
        // in the right lane
        m.collect_step(&[vehicle(0, 100.0, 2, 20.0)], &road, Some(0), &info);
        let s = m.finalize();
        assert_abs_diff_eq!(s["right_lane_compliance"], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_merge_events_only_in_merge_scenarios() {
        let road = StraightRoad::new(2, 4.0, 1000.0, Some(250.0));
        let info = StepInfo::default();
        let steps = [vehicle(3, 100.0, 2, 20.0), vehicle(3, 120.0, 1, 20.0)];

        let mut merge = MetricsCollector::new(&params(), ScenarioKind::Merge, [0.0, 0.0]);
        let mut highway = collector();
        for v in &steps {
            merge.collect_step(std::slice::from_ref(v), &road, Some(3), &info);
            highway.collect_step(std::slice::from_ref(v), &road, Some(3), &info);
        }
        let merge = merge.finalize();
        assert_eq!(merge["merge_attempts"], 1.0);
        assert_eq!(merge["successful_merges"], 1.0);
        assert_abs_diff_eq!(merge["merge_success_rate"], 1.0, epsilon = 1e-9);
        assert_eq!(highway.finalize()["merge_attempts"], 0.0);
    }

    #[test]
    fn test_empty_run_is_all_zero() {
        let s = collector().finalize();
        assert_eq!(s["steps"], 0.0);
        assert_eq!(s["avg_speed"], 0.0);
        assert_eq!(s["crash_rate_per_1000_vehicle_steps"], 0.0);
        assert_eq!(s["right_lane_compliance"], 0.0);
        assert!(!s.contains_key("headway_median"));
    }

    #[test]
    fn test_falls_back_to_step_info_without_vehicles() {
        let mut m = collector();
        let info = StepInfo {
            speed: Some(12.0),
            crashed: Some(false),
        };
        let trace = m.collect_step(&[], &road(), None, &info);
        assert_eq!(trace.ego_speed, Some(12.0));
        assert_abs_diff_eq!(m.avg_speed_so_far(), 12.0, epsilon = 1e-9);
    }
}
