use arg_parameters::RunSpec;
use environment::Environment;
use error::{Result, SimError};
use metrics::MetricsCollector;
use policy::{DrivingPolicy, PolicyKind};
use road::KinematicRoad;
use simulation::{run_single_simulation, seeded_rng, RunControl, RunOutcome, POLICY_STREAM};

#[macro_use]
extern crate fstrings;

mod action;
mod aggregate;
mod arg_parameters;
mod car;
mod defensive;
mod environment;
mod error;
mod intelligent_driver;
mod intersection;
mod lane_change_policy;
mod metrics;
mod observation;
mod parking_lot;
mod policy;
mod policy_state;
mod racetrack;
mod rate_timer;
mod road;
mod roundabout;
mod scenario;
mod scenario_metrics;
mod simulation;
mod social_laws;

#[macro_use]
extern crate enum_dispatch;

/// The ego policy kind for this run: the configured override, or a draw
/// from the composition on the run's policy stream.
fn resolve_policy_kind(spec: &RunSpec) -> Result<PolicyKind> {
    match spec.params.policy.as_ref() {
        Some(name) => name
            .parse()
            .map_err(|_| SimError::UnknownPolicy(name.clone())),
        None => {
            let mut policy_rng = seeded_rng(spec.params.rng_seed, POLICY_STREAM);
            Ok(spec.composition.sample_kind(&mut policy_rng))
        }
    }
}

fn run_with_parameters(spec: &RunSpec, control: &RunControl) -> Result<(PolicyKind, RunOutcome)> {
    let params = &spec.params;
    let kind = resolve_policy_kind(spec)?;

    let mut env = KinematicRoad::new(params, spec.scenario, spec.composition.clone());
    let mut policy = DrivingPolicy::new(&kind, spec.scenario, params);
    let mut metrics = MetricsCollector::new(params, spec.scenario, env.reference_point());

    if params.is_single_run {
        let laws = policy.law_names().join(", ");
        eprintln_f!("{spec.scenario} with {kind} ego, overlays [{laws}]");
    }

    let outcome = run_single_simulation(
        &mut env,
        &mut policy,
        &mut metrics,
        params,
        control,
        |progress| {
            eprintln_f!(
                "step {progress.step}/{progress.max_steps}: avg speed {progress.avg_speed_so_far:.2}, collisions {progress.total_collisions_so_far}"
            );
        },
    );
    Ok((kind, outcome))
}

fn main() {
    if let Err(e) = arg_parameters::run_parallel_scenarios() {
        eprintln_f!("error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arg_parameters::Parameters;
    use crate::policy::Composition;
    use crate::scenario::ScenarioKind;

    fn spec(scenario: ScenarioKind, policy: Option<&str>) -> RunSpec {
        let mut params = Parameters::new().unwrap();
        params.run_fast = true;
        params.max_steps = 5;
        params.environment.vehicles_count = 4;
        params.policy = policy.map(|p| p.to_owned());
        RunSpec {
            index: 0,
            params,
            scenario,
            composition: Composition::new(0.5, 0.5, 0.0),
        }
    }

    #[test]
    fn test_policy_override() {
        let (kind, outcome) =
            run_with_parameters(&spec(ScenarioKind::Merge, Some("cooperative")), &RunControl::new())
                .unwrap();
        assert_eq!(kind, PolicyKind::Cooperative);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.summary["steps"], 5.0);
    }

    #[test]
    fn test_unknown_policy_override() {
        let result = run_with_parameters(&spec(ScenarioKind::Highway, Some("reckless")), &RunControl::new());
        assert!(matches!(result, Err(SimError::UnknownPolicy(_))));
    }

    #[test]
    fn test_composition_draw_is_seeded() {
        let a = resolve_policy_kind(&spec(ScenarioKind::Highway, None)).unwrap();
        let b = resolve_policy_kind(&spec(ScenarioKind::Highway, None)).unwrap();
        assert_eq!(a, b);
        assert!(matches!(a, PolicyKind::Selfish | PolicyKind::Cooperative));
    }

    #[test]
    fn test_every_scenario_runs() {
        for scenario in [
            ScenarioKind::Highway,
            ScenarioKind::Intersection,
            ScenarioKind::Roundabout,
            ScenarioKind::Racetrack,
            ScenarioKind::ParkingLot,
        ] {
            let (_, outcome) =
                run_with_parameters(&spec(scenario, Some("defensive")), &RunControl::new()).unwrap();
            assert!(outcome.error.is_none(), "{}", scenario);
            assert!(outcome.summary.contains_key("avg_speed"), "{}", scenario);
        }
    }
}
