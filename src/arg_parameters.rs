use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{self, AtomicUsize},
        Mutex, PoisonError,
    },
    time::Instant,
};

use atomic::Ordering;
use itertools::Itertools;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::Deserialize;

use crate::{
    aggregate::MetricsAggregator,
    environment::DriverProfile,
    error::{Result, SimError},
    metrics::RunSummary,
    policy::{Composition, PolicyKind},
    run_with_parameters,
    scenario::ScenarioKind,
    simulation::{write_traces, RunControl, RunOutcome},
};

const DEFAULT_PARAMETERS: &str = include_str!("../parameters.yaml");

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DebugParameters {
    pub policy_debug: bool,
    pub metrics_debug: bool,
    pub log_actions: bool,
    pub log_actions_steps: u32,
    /// 0 disables.
    pub log_ego_every: u32,
    pub progress_every: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ObservationParameters {
    pub same_lane_threshold: f64,
    pub lane_width: f64,
    pub lane_tolerance: f64,
    pub density_range: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CarFollowingParameters {
    pub min_spacing: f64,
    pub time_headway: f64,
    pub desired_velocity: f64,
    pub min_distance: f64,
    pub underspeed_factor: f64,
    pub max_accel: f64,
    pub comfortable_decel: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LaneChangeParameters {
    pub threshold: f64,
    pub politeness: f64,
    pub follower_courtesy: bool,
    pub utility_gap_scale: f64,
    pub utility_speed_scale: f64,
    pub empty_lane_utility: f64,
    pub clear_ahead_utility: f64,
    pub no_leader_utility: f64,
    pub selfish_min_gap: f64,
    pub cooperative_min_gap: f64,
    pub cooperative_min_ttc: f64,
    pub cooperative_min_closing: f64,
    pub aggressive: bool,
    pub aggressive_min_gap: f64,
    pub aggressive_pass_multiple: f64,
    pub selfish_cooldown_steps: u32,
    pub cooperative_cooldown_steps: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CooperativeParameters {
    pub merge_detection_distance: f64,
    pub merge_lateral_window: f64,
    pub merge_time: f64,
    pub yield_speed_ratio: f64,
    pub yield_window: f64,
    pub yield_lateral_min: f64,
    pub yield_lateral_max: f64,
    pub yield_time: f64,
    pub step_duration: f64,
    /// Vehicles per km.
    pub jam_density_threshold: f64,
    pub density_range: f64,
    pub jam_time_headway: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DefensiveParameters {
    pub time_headway: f64,
    pub speed_factor: f64,
    pub spacing_factor: f64,
    pub caution_distance: f64,
    pub front_lateral_window: f64,
    pub lateral_window_x: f64,
    pub lateral_window_y: f64,
    pub lateral_threat_speed: f64,
    pub approach_distance: f64,
    pub threat_ttc: f64,
    pub complex_distance: f64,
    pub cruise_factor: f64,
    pub lane_change_after_steps: u32,
    pub clear_distance: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IntersectionParameters {
    pub approach_distance: f64,
    pub turning_lateral_speed: f64,
    pub waiting_speed: f64,
    pub waiting_distance: f64,
    pub gap_detection_range: f64,
    pub gap_ahead_window: f64,
    pub gap_slow_speed: f64,
    pub max_consecutive_through: u32,
    pub turn_taking_distance: f64,
    pub courtesy_speed: f64,
    pub conflict_radius: f64,
    pub eta_margin: f64,
    pub tie_priority_index: usize,
    pub speed_floor: f64,
    pub rear_check_range: f64,
    pub min_rear_headway: f64,
    pub assertive_band: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RoundaboutParameters {
    pub radius: f64,
    pub influence_factor: f64,
    pub entry_factor: f64,
    pub entry_lateral: f64,
    pub circulating_factor: f64,
    pub entry_detection: f64,
    pub entry_cooldown_steps: u32,
    pub flow_consistency_threshold: f64,
    pub target_spacing: f64,
    pub close_spacing_factor: f64,
    pub open_spacing_factor: f64,
    pub exit_detection: f64,
    pub follow_close: f64,
    pub follow_open: f64,
    pub cruise_speed: f64,
    pub assertive_radius: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RacetrackParameters {
    pub corner_offset: f64,
    pub overtake_distance: f64,
    pub min_speed_differential: f64,
    pub overtake_cooldown_steps: u32,
    pub same_lane_offset: f64,
    pub faster_differential: f64,
    pub defensive_gap: f64,
    pub slipstream_min_kmh: f64,
    pub slipstream_max_kmh: f64,
    pub slipstream_min_distance: f64,
    pub slipstream_max_distance: f64,
    pub slipstream_distance: f64,
    pub target_speed: f64,
    pub follow_close: f64,
    pub follow_open: f64,
    pub corner_speed: f64,
    pub aggressive_target_speed: f64,
    pub aggressive_pass_margin: f64,
    pub aggressive_min_gap: f64,
    pub aggressive_follow_open: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ParkingParameters {
    pub speed_limit: f64,
    pub assistance_range: f64,
    pub manoeuvre_lateral_speed: f64,
    pub parked_speed: f64,
    pub creep_speed: f64,
    pub space_slack_factor: f64,
    pub courtesy_range: f64,
    pub courtesy_wait: f64,
    pub claim_distance: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsParameters {
    pub ttc_threshold: f64,
    pub thw_violation: f64,
    pub decision_frequency: f64,
    pub min_speed_thw: f64,
    pub collision_radius: f64,
    pub accel_outlier: f64,
    pub jerk_outlier: f64,
    pub harsh_jerk: f64,
    pub lc_safe_time_gap: f64,
    pub lc_min_gap: f64,
    pub lc_max_speed_diff: f64,
    pub right_lane_gap: f64,
    pub end_margin: f64,
    pub respawn_jump: f64,

    pub intersection_radius: f64,
    pub waiting_radius_factor: f64,
    pub turning_lateral_speed: f64,
    pub waiting_speed: f64,
    pub ring_radius: f64,
    pub entry_zone_radius: f64,
    pub entry_speed: f64,
    pub overtake_proximity: f64,
    pub overtake_speed_diff: f64,
    pub slipstream_min_gap: f64,
    pub slipstream_max_gap: f64,
    pub slipstream_speed_diff: f64,
    pub same_lane_offset: f64,
    pub high_speed: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct EnvironmentParameters {
    pub lanes_count: usize,
    pub lane_width: f64,
    pub vehicles_count: usize,
    pub road_length: f64,
    pub spawn_length: f64,
    pub spawn_clearance: f64,
    pub vehicle_length: f64,
    pub vehicle_width: f64,
    pub speed_mean: f64,
    pub speed_std: f64,
    pub speed_min: f64,
    pub speed_max: f64,
    pub ego_x: f64,
    pub ego_lane: usize,
    pub target_speeds: Vec<f64>,
    pub ego_speed_index: usize,
    pub policy_frequency: f64,
    pub simulation_frequency: f64,
    pub observation_vehicles: usize,
    pub max_accel: f64,
    pub max_braking: f64,
    pub mobil_threshold: f64,
    pub mobil_safe_decel: f64,
    pub merge_force_distance: f64,
    pub remove_behind_beyond: f64,
    pub place_behind_beyond: f64,
    pub place_ahead_beyond: f64,
    pub place_ahead_within: f64,
    pub merge_end: f64,
    pub merge_vehicles_count: usize,
    pub zone_x: f64,
    pub racetrack_length: f64,
    pub parking_lanes_count: usize,
    pub parking_vehicles_count: usize,
    pub parking_target_speeds: Vec<f64>,
    pub parking_speed_mean: f64,
    pub parking_speed_std: f64,
    pub parking_speed_min: f64,
    pub parking_speed_max: f64,
    pub continuous_actions: bool,
}

/// Background driver attitudes, one per policy kind.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TrafficProfiles {
    pub selfish: DriverProfile,
    pub cooperative: DriverProfile,
    pub defensive: DriverProfile,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Parameters {
    pub max_steps: u32,
    pub runs_per_config: u32,
    pub rng_seed: u64,
    pub thread_limit: usize,
    pub run_fast: bool,
    pub render_fps: f64,
    pub output_dir: Option<String>,
    pub write_traces: bool,
    pub is_single_run: bool,
    /// Swept parameter values that distinguish this parameter set.
    pub scenario_name: Option<String>,

    /// Ego policy override, otherwise drawn from the composition.
    pub policy: Option<String>,
    pub scenario_filter: Option<String>,
    pub composition_filter: Option<String>,

    pub scenarios: Vec<ScenarioKind>,
    pub compositions: Vec<Composition>,

    pub debug: DebugParameters,
    pub observation: ObservationParameters,
    pub car_following: CarFollowingParameters,
    pub lane_change: LaneChangeParameters,
    pub cooperative: CooperativeParameters,
    pub defensive: DefensiveParameters,
    pub intersection: IntersectionParameters,
    pub roundabout: RoundaboutParameters,
    pub racetrack: RacetrackParameters,
    pub parking: ParkingParameters,
    pub metrics: MetricsParameters,
    pub environment: EnvironmentParameters,
    pub traffic_profiles: TrafficProfiles,
}

impl Parameters {
    /// Built-in defaults, overlaid by `parameters.{yaml,toml,json}` in the
    /// working directory when one exists.
    pub fn new() -> std::result::Result<Self, config::ConfigError> {
        let mut s = config::Config::new();
        s.merge(config::File::from_str(
            DEFAULT_PARAMETERS,
            config::FileFormat::Yaml,
        ))?;
        s.merge(config::File::with_name("parameters").required(false))?;
        s.try_into()
    }
}

/// Parameters that can be swept from the command line.
const SWEEP_PARAMETERS: &[&str] = &[
    "max_steps",
    "runs_per_config",
    "rng_seed",
    "thread_limit",
    "run_fast",
    "render_fps",
    "output_dir",
    "write_traces",
    "policy",
    "scenario",
    "composition",
    "scenarios",
    "cooperative_percent",
    "vehicles_count",
    "lanes_count",
    "policy_frequency",
    "politeness",
    "follower_courtesy",
    "lane_change_threshold",
    "time_headway",
    "desired_velocity",
    "jam_density_threshold",
    "defensive.time_headway",
    "ttc_threshold",
    "decision_frequency",
    "policy_debug",
    "metrics_debug",
    "log_actions",
    "progress_every",
];

/// These don't change what a run measures, so they stay out of its label.
const UNLABELLED: &[&str] = &[
    "rng_seed",
    "thread_limit",
    "run_fast",
    "render_fps",
    "output_dir",
    "write_traces",
    "scenario",
    "composition",
    "policy_debug",
    "metrics_debug",
    "log_actions",
    "progress_every",
];

fn parse<T: std::str::FromStr>(name: &str, val: &str) -> Result<T> {
    val.parse().map_err(|_| SimError::InvalidParameter {
        name: name.to_owned(),
        value: val.to_owned(),
    })
}

fn set_parameter(params: &mut Parameters, name: &str, val: &str) -> Result<()> {
    match name {
        "max_steps" => params.max_steps = parse(name, val)?,
        "runs_per_config" => params.runs_per_config = parse(name, val)?,
        "rng_seed" => params.rng_seed = parse(name, val)?,
        "thread_limit" => params.thread_limit = parse(name, val)?,
        "run_fast" => params.run_fast = parse(name, val)?,
        "render_fps" => params.render_fps = parse(name, val)?,
        "output_dir" => params.output_dir = Some(val.to_owned()),
        "write_traces" => params.write_traces = parse(name, val)?,
        "policy" => {
            val.parse::<PolicyKind>()
                .map_err(|_| SimError::UnknownPolicy(val.to_owned()))?;
            params.policy = Some(val.to_owned());
        }
        "scenario" => params.scenario_filter = Some(val.to_owned()),
        "composition" => params.composition_filter = Some(val.to_owned()),
        "scenarios" => {
            params.scenarios = val
                .split(',')
                .map(|s| {
                    s.parse::<ScenarioKind>()
                        .map_err(|_| SimError::UnknownScenario(s.to_owned()))
                })
                .collect::<Result<Vec<_>>>()?
        }
        "cooperative_percent" => {
            let percent: usize = parse(name, val)?;
            if percent > 100 {
                return Err(SimError::InvalidParameter {
                    name: name.to_owned(),
                    value: val.to_owned(),
                });
            }
            let ratio = percent as f64 / 100.0;
            params.compositions = vec![Composition::new(1.0 - ratio, ratio, 0.0)];
        }
        "vehicles_count" => params.environment.vehicles_count = parse(name, val)?,
        "lanes_count" => params.environment.lanes_count = parse(name, val)?,
        "policy_frequency" => params.environment.policy_frequency = parse(name, val)?,
        "politeness" => params.lane_change.politeness = parse(name, val)?,
        "follower_courtesy" => params.lane_change.follower_courtesy = parse(name, val)?,
        "lane_change_threshold" => params.lane_change.threshold = parse(name, val)?,
        "time_headway" => params.car_following.time_headway = parse(name, val)?,
        "desired_velocity" => params.car_following.desired_velocity = parse(name, val)?,
        "jam_density_threshold" => params.cooperative.jam_density_threshold = parse(name, val)?,
        "defensive.time_headway" => params.defensive.time_headway = parse(name, val)?,
        "ttc_threshold" => params.metrics.ttc_threshold = parse(name, val)?,
        "decision_frequency" => params.metrics.decision_frequency = parse(name, val)?,
        "policy_debug" => params.debug.policy_debug = parse(name, val)?,
        "metrics_debug" => params.debug.metrics_debug = parse(name, val)?,
        "log_actions" => params.debug.log_actions = parse(name, val)?,
        "progress_every" => params.debug.progress_every = parse(name, val)?,
        _ => return Err(SimError::UnknownParameter(name.to_owned())),
    }
    Ok(())
}

/// `a-b` and `a:step:b` expand to every integer in the range.
fn expand_value(value: &str) -> Vec<String> {
    let range_parts = value.split('-').collect_vec();
    if range_parts.len() == 2 {
        let low: Option<usize> = range_parts[0].parse().ok();
        let high: Option<usize> = range_parts[1].parse().ok();
        if let (Some(low), Some(high)) = (low, high) {
            if low < high {
                return (low..=high).map(|v| v.to_string()).collect();
            }
        }
    }

    let step_range_parts = value.split(':').collect_vec();
    if step_range_parts.len() == 3 {
        let low: Option<usize> = step_range_parts[0].parse().ok();
        let step: Option<usize> = step_range_parts[1].parse().ok();
        let high: Option<usize> = step_range_parts[2].parse().ok();
        if let (Some(low), Some(step), Some(high)) = (low, step, high) {
            if low < high && step > 0 {
                return (low..=high).step_by(step).map(|v| v.to_string()).collect();
            }
        }
    }

    vec![value.to_owned()]
}

/// Cartesian product of every swept value, in command-line order.
fn create_scenarios(
    base_params: &Parameters,
    name_value_pairs: &[(String, Vec<String>)],
) -> Result<Vec<Parameters>> {
    if name_value_pairs.is_empty() {
        return Ok(vec![base_params.clone()]);
    }

    let mut scenarios = Vec::new();
    let (name, values) = &name_value_pairs[0];

    for val in values.iter().flat_map(|v| expand_value(v)) {
        let mut params = base_params.clone();
        set_parameter(&mut params, name, &val)?;

        if !UNLABELLED.contains(&name.as_str()) {
            let label = params.scenario_name.take().unwrap_or_default();
            params.scenario_name = Some(if label.is_empty() {
                format_f!("{name}={val}")
            } else {
                format_f!("{label} {name}={val}")
            });
        }

        if name_value_pairs.len() > 1 {
            scenarios.append(&mut create_scenarios(&params, &name_value_pairs[1..])?);
        } else {
            scenarios.push(params);
        }
    }

    // when there are multiple scenarios, always run them fast!
    if scenarios.len() > 1 {
        for scenario in scenarios.iter_mut() {
            scenario.run_fast = true;
        }
    }

    Ok(scenarios)
}

/// Splits `(<name> [value]* ::)*` into named value lists.
fn parse_sweep_args(args: impl Iterator<Item = String>) -> Result<Vec<(String, Vec<String>)>> {
    let mut name_value_pairs = Vec::<(String, Vec<String>)>::new();
    let mut current: Option<(String, Vec<String>)> = None;

    for arg in args.chain(std::iter::once("::".to_owned())) {
        match current.take() {
            Some((name, vals)) if arg == "::" => {
                if name_value_pairs.iter().any(|pair| pair.0 == name) {
                    return Err(SimError::InvalidParameter {
                        name,
                        value: vals.join(" "),
                    });
                }
                name_value_pairs.push((name, vals));
            }
            Some((name, mut vals)) => {
                vals.push(arg);
                current = Some((name, vals));
            }
            None if arg != "::" => current = Some((arg, Vec::new())),
            None => {}
        }
    }

    Ok(name_value_pairs)
}

fn matches_filter(name: &str, filter: &Option<String>) -> bool {
    match filter {
        Some(filter) => name
            .to_ascii_lowercase()
            .contains(&filter.to_ascii_lowercase()),
        None => true,
    }
}

/// One simulation to execute: a parameter set, scenario, composition and seed.
#[derive(Clone, Debug)]
pub struct RunSpec {
    pub index: usize,
    pub params: Parameters,
    pub scenario: ScenarioKind,
    pub composition: Composition,
}

impl RunSpec {
    /// Aggregation key for the scenario, qualified by any swept values.
    pub fn scenario_label(&self) -> String {
        match self.params.scenario_name.as_deref() {
            Some(label) if !label.is_empty() => format!("{} {}", self.scenario, label),
            _ => self.scenario.to_string(),
        }
    }
}

/// Every parameter set, times the filtered scenarios and compositions,
/// times `runs_per_config` consecutive seeds.
fn build_runs(param_sets: &[Parameters]) -> Vec<RunSpec> {
    let mut runs = Vec::new();
    for params in param_sets.iter() {
        for &scenario in params.scenarios.iter() {
            if !matches_filter(&scenario.to_string(), &params.scenario_filter) {
                continue;
            }
            for composition in params.compositions.iter() {
                if !matches_filter(&composition.name(), &params.composition_filter) {
                    continue;
                }
                for i in 0..params.runs_per_config {
                    let mut run_params = params.clone();
                    run_params.rng_seed = params.rng_seed + i as u64;
                    runs.push(RunSpec {
                        index: runs.len(),
                        params: run_params,
                        scenario,
                        composition: composition.clone(),
                    });
                }
            }
        }
    }
    runs
}

fn print_help(parameters_default: &Parameters) {
    eprintln!("Usage: (<param name> [param value]* ::)*");
    eprintln!("For example: scenario merge :: cooperative_percent 0:25:100 :: runs_per_config 5");
    eprintln!("Sweepable parameters: {}", SWEEP_PARAMETERS.join(", "));
    eprintln!("All parameters and their default values:");
    eprintln!("{:#?}", parameters_default);
}

/// Runs one simulation and writes its trace when asked to.
fn execute_run(
    spec: &RunSpec,
    control: &RunControl,
    output_dir: Option<&Path>,
) -> Result<(PolicyKind, RunOutcome)> {
    let (kind, outcome) = run_with_parameters(spec, control)?;
    if let Some(e) = outcome.error.as_ref() {
        eprintln_f!("run {spec.index} ({spec.scenario}, seed {spec.params.rng_seed}) aborted: {e}");
    }
    if spec.params.write_traces {
        if let Some(dir) = output_dir {
            let path = dir.join(format_f!(
                "trace_{spec.index}_{spec.scenario}_{spec.params.rng_seed}.csv"
            ));
            write_traces(&path, &outcome.traces)?;
        }
    }
    Ok((kind, outcome))
}

fn summary_value(summary: &RunSummary, key: &str) -> f64 {
    summary.get(key).copied().unwrap_or(f64::NAN)
}

fn print_aggregate(aggregator: &MetricsAggregator) {
    let column = |columns: &std::collections::BTreeMap<String, f64>, key: &str| {
        columns
            .get(key)
            .map_or("-".to_owned(), |v| format_f!("{v:.3}"))
    };
    for row in aggregator.aggregate() {
        let avg_speed = column(&row.columns, "avg_speed_mean");
        let avg_speed_std = column(&row.columns, "avg_speed_std");
        let collisions = column(&row.columns, "total_collisions_mean");
        let min_ttc = column(&row.columns, "min_ttc_mean");
        let throughput = column(&row.columns, "throughput_per_min_mean");
        println_f!(
            "{row.scenario} | {row.composition} | n={row.sample_size}: \
             avg_speed {avg_speed} (std {avg_speed_std}), collisions {collisions}, \
             min_ttc {min_ttc}, throughput/min {throughput}"
        );
    }
}

pub fn run_parallel_scenarios() -> Result<()> {
    let parameters_default = Parameters::new()?;

    let args = std::env::args().skip(1).collect_vec();
    if args.iter().any(|arg| arg == "--help" || arg == "help") {
        print_help(&parameters_default);
        return Ok(());
    }
    let name_value_pairs = parse_sweep_args(args.into_iter())?;

    let mut base_scenario = parameters_default;
    base_scenario.scenario_name = Some("".to_owned());

    let param_sets = create_scenarios(&base_scenario, &name_value_pairs)?;
    let mut runs = build_runs(&param_sets);

    let n_runs = runs.len();
    eprintln!("Starting to run {} simulations", n_runs);
    if n_runs == 0 {
        return Ok(());
    }

    let thread_limit = runs[0].params.thread_limit;
    if thread_limit > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(thread_limit)
            .build_global()
        {
            eprintln_f!("could not limit the thread pool to {thread_limit}: {e}");
        }
    }

    let output_dir = runs[0].params.output_dir.as_ref().map(PathBuf::from);
    if let Some(dir) = output_dir.as_ref() {
        std::fs::create_dir_all(dir)?;
    }

    let control = RunControl::new();
    let aggregator = Mutex::new(MetricsAggregator::new());

    if n_runs == 1 {
        let spec = &mut runs[0];
        spec.params.is_single_run = true;

        let (kind, outcome) = execute_run(spec, &control, output_dir.as_deref())?;
        let composition = spec.composition.name();
        println_f!("{spec.scenario} | {composition} | {kind} | seed {spec.params.rng_seed}");
        for (key, value) in outcome.summary.iter() {
            println_f!("{key}: {value:.3}");
        }
        aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_run(&spec.scenario_label(), &spec.composition.name(), outcome.summary);
    } else {
        let n_runs_completed = AtomicUsize::new(0);

        runs.par_iter().for_each(|spec| {
            let result = std::panic::catch_unwind(|| {
                let start_time = Instant::now();
                let (kind, outcome) = match execute_run(spec, &control, output_dir.as_deref()) {
                    Ok(result) => result,
                    Err(e) => {
                        eprintln_f!("run {spec.index} ({spec.scenario}) failed: {e}");
                        return;
                    }
                };
                let seconds = start_time.elapsed().as_secs_f64();

                n_runs_completed.fetch_add(1, Ordering::Relaxed);
                let avg_speed = summary_value(&outcome.summary, "avg_speed");
                let collisions = summary_value(&outcome.summary, "total_collisions");
                print!(
                    "{}/{} ({}): ",
                    n_runs_completed.load(Ordering::Relaxed),
                    n_runs,
                    spec.params.rng_seed,
                );
                let label = spec.scenario_label();
                let composition = spec.composition.name();
                println_f!(
                    "{label} | {composition} | {kind} avg_speed {avg_speed:.2} collisions {collisions} {seconds:6.2}"
                );

                aggregator
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .add_run(&spec.scenario_label(), &spec.composition.name(), outcome.summary);
            });
            if result.is_err() {
                eprintln!(
                    "PANIC for run {}: {} | {} seed {}",
                    spec.index,
                    spec.scenario_label(),
                    spec.composition.name(),
                    spec.params.rng_seed
                );
            }
        });
    }

    let aggregator = aggregator.into_inner().unwrap_or_else(PoisonError::into_inner);
    print_aggregate(&aggregator);

    if let Some(dir) = output_dir.as_ref() {
        aggregator.write_results_csv(&dir.join("results.csv"))?;
        aggregator.write_runs_csv(&dir.join("runs.csv"))?;
        let n_recorded = aggregator.len();
        let dir = dir.display();
        eprintln_f!("wrote {n_recorded} runs to {dir}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(args: &[&str]) -> Vec<(String, Vec<String>)> {
        parse_sweep_args(args.iter().map(|s| s.to_string())).unwrap()
    }

    #[test]
    fn test_defaults_load() {
        let p = Parameters::new().unwrap();
        assert_eq!(p.scenarios.len(), 6);
        assert_eq!(p.compositions[0], Composition::new(1.0, 0.0, 0.0));
        assert_eq!(p.metrics.ttc_threshold, 2.0);
        assert_eq!(p.lane_change.cooperative_cooldown_steps, 3);
        assert_eq!(p.traffic_profiles.defensive.time_headway, 2.5);
        assert!(p.policy.is_none());
        assert!(p.output_dir.is_none());
    }

    #[test]
    fn test_parse_sweep_args() {
        let parsed = pairs(&["vehicles_count", "10", "20", "::", "politeness", "0.5"]);
        assert_eq!(
            parsed,
            vec![
                ("vehicles_count".to_owned(), vec!["10".to_owned(), "20".to_owned()]),
                ("politeness".to_owned(), vec!["0.5".to_owned()]),
            ]
        );

        let repeated = parse_sweep_args(
            ["max_steps", "1", "::", "max_steps", "2"]
                .iter()
                .map(|s| s.to_string()),
        );
        assert!(matches!(repeated, Err(SimError::InvalidParameter { .. })));
    }

    #[test]
    fn test_expand_value() {
        assert_eq!(expand_value("3-5"), vec!["3", "4", "5"]);
        assert_eq!(expand_value("0:25:100"), vec!["0", "25", "50", "75", "100"]);
        assert_eq!(expand_value("0.5"), vec!["0.5"]);
        assert_eq!(expand_value("5-3"), vec!["5-3"]);
    }

    #[test]
    fn test_create_scenarios_product() {
        let mut base = Parameters::new().unwrap();
        base.scenario_name = Some("".to_owned());
        let sets = create_scenarios(
            &base,
            &pairs(&["vehicles_count", "10-12", "::", "politeness", "0.1", "0.5", "::", "rng_seed", "7"]),
        )
        .unwrap();
        assert_eq!(sets.len(), 6);
        assert!(sets.iter().all(|s| s.run_fast && s.rng_seed == 7));
        assert_eq!(sets[0].environment.vehicles_count, 10);
        assert_eq!(sets[1].lane_change.politeness, 0.5);
        assert_eq!(
            sets[5].scenario_name.as_deref(),
            Some("vehicles_count=12 politeness=0.5")
        );
    }

    #[test]
    fn test_invalid_sweeps() {
        let base = Parameters::new().unwrap();
        assert!(matches!(
            create_scenarios(&base, &pairs(&["warp_speed", "9"])),
            Err(SimError::UnknownParameter(_))
        ));
        assert!(matches!(
            create_scenarios(&base, &pairs(&["max_steps", "ten"])),
            Err(SimError::InvalidParameter { .. })
        ));
        assert!(matches!(
            create_scenarios(&base, &pairs(&["policy", "reckless"])),
            Err(SimError::UnknownPolicy(_))
        ));
        assert!(matches!(
            create_scenarios(&base, &pairs(&["scenarios", "highway,moon"])),
            Err(SimError::UnknownScenario(_))
        ));
        assert!(create_scenarios(&base, &pairs(&["cooperative_percent", "150"])).is_err());
    }

    #[test]
    fn test_build_runs_with_filters() {
        let mut base = Parameters::new().unwrap();
        base.runs_per_config = 2;
        base.rng_seed = 10;
        let all = build_runs(&[base.clone()]);
        assert_eq!(all.len(), 6 * 5 * 2);

        let sets = create_scenarios(
            &base,
            &pairs(&["scenario", "merge", "::", "composition", "50% selfish"]),
        )
        .unwrap();
        let runs = build_runs(&sets);
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.scenario == ScenarioKind::Merge));
        assert_eq!(runs[0].composition, Composition::new(0.5, 0.5, 0.0));
        assert_eq!(runs[0].params.rng_seed, 10);
        assert_eq!(runs[1].params.rng_seed, 11);
        assert_eq!(runs[1].index, 1);
        assert_eq!(runs[1].scenario_label(), "merge");
    }

    #[test]
    fn test_cooperative_percent_sweep() {
        let base = Parameters::new().unwrap();
        let sets = create_scenarios(&base, &pairs(&["cooperative_percent", "0:50:100"])).unwrap();
        let names = sets
            .iter()
            .map(|s| s.compositions[0].name())
            .collect_vec();
        assert_eq!(
            names,
            vec![
                "100% Selfish, 0% Cooperative",
                "50% Selfish, 50% Cooperative",
                "0% Selfish, 100% Cooperative"
            ]
        );
    }
}
