use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use rand::{prelude::StdRng, SeedableRng};

use crate::{
    action::{ActionAdapter, ActionAdapterTrait},
    arg_parameters::Parameters,
    environment::Environment,
    error::{Result, SimError},
    metrics::{MetricsCollector, RunSummary, StepTrace},
    policy::DrivingPolicy,
    rate_timer::RateTimer,
};

pub const POLICY_STREAM: u64 = 2;

const PAUSE_POLL: Duration = Duration::from_millis(50);

/// Independent random stream `stream` of the run seeded with `seed`.
pub fn seeded_rng(seed: u64, stream: u64) -> StdRng {
    let mut full_seed = [0; 32];
    full_seed[0..8].copy_from_slice(&seed.to_le_bytes());
    full_seed[8..16].copy_from_slice(&stream.to_le_bytes());
    StdRng::from_seed(full_seed)
}

/// External stop/pause switches, polled once per step.
#[derive(Debug, Default)]
pub struct RunControl {
    pub stop: AtomicBool,
    pub pause: AtomicBool,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause.store(paused, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Blocks while paused. Returns false if a stop arrived meanwhile.
    fn wait_while_paused(&self) -> bool {
        while self.pause.load(Ordering::Relaxed) {
            if self.stop_requested() {
                return false;
            }
            std::thread::sleep(PAUSE_POLL);
        }
        !self.stop_requested()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub step: u64,
    pub max_steps: u32,
    pub avg_speed_so_far: f64,
    pub total_collisions_so_far: u64,
}

/// Result of one run. A failed run still carries whatever it measured.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub traces: Vec<StepTrace>,
    pub error: Option<SimError>,
}

/// Drive `env` with `policy` for up to `max_steps` decisions, measuring
/// every step. Stops early on termination, truncation or a stop request.
pub fn run_single_simulation(
    env: &mut dyn Environment,
    policy: &mut DrivingPolicy,
    metrics: &mut MetricsCollector,
    params: &Parameters,
    control: &RunControl,
    mut progress: impl FnMut(&Progress),
) -> RunOutcome {
    let mut traces = Vec::new();
    let debug = &params.debug;

    let mut obs = match env.reset(Some(params.rng_seed)) {
        Ok((obs, _info)) => obs,
        Err(e) => {
            return RunOutcome {
                summary: metrics.finalize(),
                traces,
                error: Some(e),
            }
        }
    };
    metrics.reset(env.reference_point());

    let adapter = ActionAdapter::for_space(&env.action_space());
    let mut rate = if params.run_fast {
        None
    } else {
        Some(RateTimer::from_hz(params.render_fps))
    };

    let mut error = None;
    for step in 0..params.max_steps {
        if !control.wait_while_paused() {
            break;
        }

        let action = policy.act(Some(obs.as_slice()));
        let outcome = match env.step(adapter.translate(Some(action))) {
            Ok(outcome) => outcome,
            Err(e) => {
                eprintln_f!("step {step}: simulator failed: {e}");
                error = Some(e);
                break;
            }
        };

        let controlled = env.controlled_vehicle();
        let trace = metrics.collect_step(env.vehicles(), env.road(), controlled, &outcome.info);

        if debug.log_actions && step < debug.log_actions_steps {
            let speed = trace.ego_speed.unwrap_or(0.0);
            eprintln_f!("step {step}: {action}, ego speed {speed:.2}");
        }
        if debug.log_ego_every > 0 && step % debug.log_ego_every == 0 {
            let ego = env
                .vehicles()
                .iter()
                .find(|v| Some(v.id) == controlled);
            if let Some(ego) = ego {
                let lane = ego.lane_index.map(|l| l.lane);
                eprintln_f!(
                    "step {step}: ego lane {lane:?} speed {ego.speed:.2} crashed {ego.crashed}"
                );
            }
        }
        traces.push(trace);

        if debug.progress_every > 0 && (step + 1) % debug.progress_every == 0 {
            progress(&Progress {
                step: metrics.steps(),
                max_steps: params.max_steps,
                avg_speed_so_far: metrics.avg_speed_so_far(),
                total_collisions_so_far: metrics.total_collisions(),
            });
        }

        if let Some(rate) = rate.as_mut() {
            env.render();
            rate.wait_until_ready();
        }

        if outcome.terminated || outcome.truncated {
            break;
        }
        obs = outcome.observation;
    }
    env.close();

    RunOutcome {
        summary: metrics.finalize(),
        traces,
        error,
    }
}

pub fn write_traces(path: &Path, traces: &[StepTrace]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(file, "step,vehicle_count,ego_speed,collisions_this_step,ego_crashed")?;
    for t in traces {
        let ego_speed = t.ego_speed.map_or(String::new(), |s| format!("{:.3}", s));
        let crashed = t.ego_crashed as u8;
        writeln_f!(
            file,
            "{t.step},{t.vehicle_count},{ego_speed},{t.collisions_this_step},{crashed}"
        )?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionSpace, EnvAction};
    use crate::car::Car;
    use crate::environment::{
        LaneIndex, ObservationRows, RoadNetwork, StepInfo, StepOutcome, VehicleId, VehicleState,
    };
    use crate::policy::{Composition, PolicyKind};
    use crate::road::{KinematicRoad, StraightRoad};
    use crate::scenario::ScenarioKind;
    use approx::assert_abs_diff_eq;
    use rand::Rng;

    fn params() -> Parameters {
        let mut p = Parameters::new().unwrap();
        p.run_fast = true;
        p
    }

    fn selfish_run(p: &Parameters, control: &RunControl) -> RunOutcome {
        let mut env = KinematicRoad::new(p, ScenarioKind::Highway, Composition::new(1.0, 0.0, 0.0));
        let mut policy = DrivingPolicy::new(&PolicyKind::Selfish, ScenarioKind::Highway, p);
        let mut metrics = MetricsCollector::new(p, ScenarioKind::Highway, [0.0, 0.0]);
        run_single_simulation(&mut env, &mut policy, &mut metrics, p, control, |_| {})
    }

    #[test]
    fn test_streams_are_independent() {
        let a = seeded_rng(3, 0).gen::<u64>();
        let b = seeded_rng(3, 1).gen::<u64>();
        let a2 = seeded_rng(3, 0).gen::<u64>();
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }

    #[test]
    fn test_selfish_on_empty_road() {
        let mut p = params();
        p.environment.vehicles_count = 0;
        p.max_steps = 50;
        let outcome = selfish_run(&p, &RunControl::new());
        assert!(outcome.error.is_none());
        assert_eq!(outcome.traces.len(), 50);

        let speeds = outcome
            .traces
            .iter()
            .map(|t| t.ego_speed.unwrap())
            .collect::<Vec<_>>();
        for w in speeds.windows(2) {
            assert!(w[1] >= w[0] - 1e-9, "{:?}", w);
        }
        assert_abs_diff_eq!(speeds[speeds.len() - 1], 30.0, epsilon = 0.5);
        assert_eq!(outcome.summary["total_collisions"], 0.0);
        assert_eq!(outcome.summary["steps"], 50.0);
    }

    #[test]
    fn test_stop_request_returns_partial_summary() {
        let p = params();
        let control = RunControl::new();
        control.request_stop();
        let outcome = selfish_run(&p, &control);
        assert!(outcome.error.is_none());
        assert!(outcome.traces.is_empty());
        assert_eq!(outcome.summary["steps"], 0.0);
    }

    #[test]
    fn test_progress_callback() {
        let mut p = params();
        p.environment.vehicles_count = 0;
        p.max_steps = 10;
        p.debug.progress_every = 4;
        let mut env = KinematicRoad::new(&p, ScenarioKind::Highway, Composition::new(1.0, 0.0, 0.0));
        let mut policy = DrivingPolicy::new(&PolicyKind::Selfish, ScenarioKind::Highway, &p);
        let mut metrics = MetricsCollector::new(&p, ScenarioKind::Highway, [0.0, 0.0]);
        let mut seen = Vec::new();
        run_single_simulation(&mut env, &mut policy, &mut metrics, &p, &RunControl::new(), |pr| {
            seen.push(pr.step)
        });
        assert_eq!(seen, vec![4, 8]);
    }

    #[test]
    fn test_ttc_against_slow_leader() {
        let mut p = params();
        p.environment.lanes_count = 1;
        p.environment.policy_frequency = 10.0;
        p.environment.target_speeds = vec![15.0];
        p.metrics.decision_frequency = 10.0;

        // 10 m bumper gap, closing at 5 m/s
        let mut ego = Car::new(0, 100.0, 0.0, 15.0, 2.0, 5.0);
        ego.target_vel = 15.0;
        let mut leader = Car::new(1, 115.0, 0.0, 10.0, 2.0, 5.0);
        leader.preferred_vel = 10.0;
        leader.target_vel = 10.0;
        leader.profile = Some(p.traffic_profiles.selfish);
        let mut env = KinematicRoad::with_cars(&p, ScenarioKind::Highway, vec![ego, leader]);

        let mut metrics = MetricsCollector::new(&p, ScenarioKind::Highway, [0.0, 0.0]);
        let outcome = env.step(EnvAction::Discrete(0)).unwrap();
        metrics.collect_step(env.vehicles(), env.road(), env.controlled_vehicle(), &outcome.info);
        let summary = metrics.finalize();
        assert_abs_diff_eq!(summary["min_ttc"], 2.0, epsilon = 0.25);
        assert_eq!(summary["ttc_events_count"], 1.0);
    }

    /// Straight single-lane world whose step fails after a few calls.
    struct FailingEnv {
        road: StraightRoad,
        vehicles: Vec<VehicleState>,
        steps_left: u32,
    }

    impl FailingEnv {
        fn new(steps_left: u32) -> Self {
            Self {
                road: StraightRoad::new(1, 4.0, 1000.0, None),
                vehicles: vec![VehicleState {
                    id: 9,
                    position: [0.0, 0.0],
                    heading: 0.0,
                    speed: 20.0,
                    length: 5.0,
                    crashed: false,
                    lane_index: Some(LaneIndex::new(0, 1, 0)),
                    acceleration: None,
                    profile: None,
                }],
                steps_left,
            }
        }

        fn rows(&self) -> ObservationRows {
            let v = &self.vehicles[0];
            vec![vec![1.0, v.position[0], v.position[1], v.speed, 0.0]]
        }
    }

    impl Environment for FailingEnv {
        fn reset(&mut self, _seed: Option<u64>) -> crate::error::Result<(ObservationRows, StepInfo)> {
            Ok((self.rows(), StepInfo::default()))
        }

        fn step(&mut self, _action: EnvAction) -> crate::error::Result<StepOutcome> {
            if self.steps_left == 0 {
                return Err(SimError::Simulator("lost connection".to_owned()));
            }
            self.steps_left -= 1;
            self.vehicles[0].position[0] += 20.0;
            Ok(StepOutcome {
                observation: self.rows(),
                reward: 0.0,
                terminated: false,
                truncated: false,
                info: StepInfo {
                    speed: Some(20.0),
                    crashed: Some(false),
                },
            })
        }

        fn action_space(&self) -> ActionSpace {
            ActionSpace::Discrete { n: 3, actions: None }
        }

        fn vehicles(&self) -> &[VehicleState] {
            &self.vehicles
        }

        fn controlled_vehicle(&self) -> Option<VehicleId> {
            Some(9)
        }

        fn road(&self) -> &dyn RoadNetwork {
            &self.road
        }
    }

    #[test]
    fn test_simulator_failure_keeps_partial_metrics() {
        let p = params();
        let mut env = FailingEnv::new(3);
        let mut policy = DrivingPolicy::new(&PolicyKind::Cooperative, ScenarioKind::Highway, &p);
        let mut metrics = MetricsCollector::new(&p, ScenarioKind::Highway, [0.0, 0.0]);
        let outcome =
            run_single_simulation(&mut env, &mut policy, &mut metrics, &p, &RunControl::new(), |_| {});
        assert!(matches!(outcome.error, Some(SimError::Simulator(_))));
        assert_eq!(outcome.summary["steps"], 3.0);
        assert_abs_diff_eq!(outcome.summary["avg_speed"], 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_write_traces() {
        let dir = std::env::temp_dir().join(format!("social_laws_traces_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trace.csv");
        let traces = vec![
            StepTrace {
                step: 1,
                vehicle_count: 4,
                ego_speed: Some(21.5),
                collisions_this_step: 0,
                ego_crashed: false,
            },
            StepTrace {
                step: 2,
                vehicle_count: 4,
                ego_speed: None,
                collisions_this_step: 2,
                ego_crashed: true,
            },
        ];
        write_traces(&path, &traces).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "step,vehicle_count,ego_speed,collisions_this_step,ego_crashed\n1,4,21.500,0,0\n2,4,,2,1\n"
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
