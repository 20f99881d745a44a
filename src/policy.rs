use rand::{prelude::StdRng, Rng};
use serde::Deserialize;

use crate::{
    action::Action,
    arg_parameters::{Parameters, TrafficProfiles},
    defensive::{ConservativeCruise, DefensiveCaution},
    environment::DriverProfile,
    intelligent_driver::CarFollowingRule,
    intersection::{AdaptiveCourtesy, CooperativeTurnTaking, PoliteGapProvision, RightOfWayNegotiation},
    lane_change_policy::LaneChangeRule,
    observation::{EgoState, Observation, ObservationModel},
    parking_lot::{ManoeuvringCourtesy, ParkingAssistance, ParkingSpeedLimit, SpaceClaiming, SpaceOptimization},
    policy_state::PolicyState,
    racetrack::{AggressiveRacing, DefensivePositioning, RacetrackNavigation, SafeOvertaking, SlipstreamCooperation},
    roundabout::{EntryFacilitation, ExitCourtesy, FlowMaintenance, RoundaboutNavigation},
    scenario::ScenarioKind,
    social_laws::{DecisionContext, SocialLaw, SocialLawTrait, SINGLE_LAW_NAMES},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    Selfish,
    Cooperative,
    Defensive,
    /// Selfish base with exactly one named cooperative law on top.
    SingleLaw(String),
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Selfish => write!(f, "selfish"),
            Self::Cooperative => write!(f, "cooperative"),
            Self::Defensive => write!(f, "defensive"),
            Self::SingleLaw(law) => write!(f, "{}", law),
        }
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "selfish" => Ok(Self::Selfish),
            "cooperative" => Ok(Self::Cooperative),
            "defensive" => Ok(Self::Defensive),
            law if SINGLE_LAW_NAMES.contains(&law) => Ok(Self::SingleLaw(law.to_owned())),
            _ => Err(format!("Invalid PolicyKind '{}'", s)),
        }
    }
}

/// Region in which a selfish driver refuses to brake.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConflictZone {
    /// Within this longitudinal distance of the intersection centre.
    Band(f64),
    /// Within this radius of the roundabout centre.
    Disk(f64),
}

impl ConflictZone {
    pub fn contains(&self, ego: &EgoState) -> bool {
        match *self {
            ConflictZone::Band(half_width) => ego.x.abs() < half_width,
            ConflictZone::Disk(radius) => ego.distance_from_origin() < radius,
        }
    }
}

/// Base speed decision plus an optional lane change, used when no overlay
/// has an opinion.
pub fn base_decision(ctx: &DecisionContext, state: &PolicyState) -> Action {
    let ego_speed = ctx.ego_speed();
    let front = ctx.front_vehicle();
    let speed_action = ctx
        .car_following
        .choose(ego_speed, front, state.time_headway);
    let safe_distance = ctx.car_following.safe_distance(ego_speed, state.time_headway);

    if speed_action == Action::Idle || ctx.lane_change.wants_pass(front, safe_distance) {
        if let Some(change) = ctx
            .lane_change
            .choose(ctx.model, ctx.obs, state.lane_change_cooldown)
            .action()
        {
            return change;
        }
    }
    speed_action
}

/// One ego driver: fixed rules, an ordered overlay list and its own state.
#[derive(Debug, Clone)]
pub struct DrivingPolicy {
    kind: PolicyKind,
    scenario: ScenarioKind,
    model: ObservationModel,
    car_following: CarFollowingRule,
    lane_change: LaneChangeRule,
    laws: Vec<SocialLaw>,
    assertive_zone: Option<ConflictZone>,
    step_duration: f64,
    pub state: PolicyState,
    policy_debug: bool,
}

impl DrivingPolicy {
    pub fn new(kind: &PolicyKind, scenario: ScenarioKind, params: &Parameters) -> Self {
        let car_following = match kind {
            PolicyKind::Defensive => CarFollowingRule::defensive(&params.car_following, &params.defensive),
            _ => CarFollowingRule::new(&params.car_following),
        };
        let lane_change = match kind {
            PolicyKind::Cooperative => LaneChangeRule::cooperative(&params.lane_change),
            _ => LaneChangeRule::selfish(&params.lane_change),
        };

        let laws = Self::overlays(kind, scenario, params);
        let assertive_zone = match (kind, scenario) {
            (PolicyKind::Selfish, ScenarioKind::Intersection) => {
                Some(ConflictZone::Band(params.intersection.assertive_band))
            }
            (PolicyKind::Selfish, ScenarioKind::Roundabout) => {
                Some(ConflictZone::Disk(params.roundabout.assertive_radius))
            }
            _ => None,
        };

        Self {
            kind: kind.clone(),
            scenario,
            model: ObservationModel::new(&params.observation),
            state: PolicyState::new(car_following.time_headway),
            car_following,
            lane_change,
            laws,
            assertive_zone,
            step_duration: params.cooperative.step_duration,
            policy_debug: params.debug.policy_debug,
        }
    }

    /// Overlay list for a policy kind in a scenario, highest priority first.
    pub fn overlays(kind: &PolicyKind, scenario: ScenarioKind, params: &Parameters) -> Vec<SocialLaw> {
        let highway = || SocialLaw::cooperative_highway(params);
        match kind {
            PolicyKind::Selfish => match scenario {
                ScenarioKind::Racetrack => vec![AggressiveRacing::new(&params.racetrack).into()],
                ScenarioKind::ParkingLot => vec![SpaceClaiming::new(&params.parking).into()],
                _ => Vec::new(),
            },
            PolicyKind::Cooperative => {
                let mut laws: Vec<SocialLaw> = match scenario {
                    ScenarioKind::Highway | ScenarioKind::Merge => Vec::new(),
                    ScenarioKind::Intersection => vec![
                        PoliteGapProvision::new(&params.intersection).into(),
                        CooperativeTurnTaking::new(&params.intersection).into(),
                        RightOfWayNegotiation::new(&params.intersection).into(),
                        AdaptiveCourtesy::new(&params.intersection).into(),
                    ],
                    ScenarioKind::Roundabout => vec![
                        EntryFacilitation::new(&params.roundabout).into(),
                        FlowMaintenance::new(&params.roundabout).into(),
                        ExitCourtesy::new(&params.roundabout).into(),
                        RoundaboutNavigation::new(&params.roundabout).into(),
                    ],
                    ScenarioKind::Racetrack => vec![
                        SafeOvertaking::new(&params.racetrack).into(),
                        DefensivePositioning::new(&params.racetrack).into(),
                        SlipstreamCooperation::new(&params.racetrack).into(),
                        RacetrackNavigation::new(&params.racetrack).into(),
                    ],
                    ScenarioKind::ParkingLot => vec![
                        ParkingSpeedLimit::new(&params.parking).into(),
                        ParkingAssistance::new(&params.parking).into(),
                        SpaceOptimization::new(&params.parking).into(),
                        ManoeuvringCourtesy::new(&params.parking).into(),
                    ],
                };
                // racetrack navigation always decides
                if scenario != ScenarioKind::Racetrack {
                    laws.extend(highway());
                }
                laws
            }
            PolicyKind::Defensive => vec![
                DefensiveCaution::new(&params.defensive).into(),
                ConservativeCruise::new(&params.defensive).into(),
            ],
            PolicyKind::SingleLaw(name) => SocialLaw::from_name(name, params).into_iter().collect(),
        }
    }

    pub fn kind(&self) -> &PolicyKind {
        &self.kind
    }

    pub fn scenario(&self) -> ScenarioKind {
        self.scenario
    }

    pub fn law_names(&self) -> Vec<&'static str> {
        self.laws.iter().map(|law| law.name()).collect()
    }

    /// One decision step. A missing or malformed observation gives IDLE.
    pub fn act(&mut self, rows: Option<&[Vec<f64>]>) -> Action {
        let obs = match rows {
            Some(rows) => Observation::from_rows(rows),
            None => Observation::default(),
        };
        self.decide(&obs)
    }

    pub fn decide(&mut self, obs: &Observation) -> Action {
        self.state.tick(self.step_duration);

        let ego = match obs.ego() {
            Some(ego) => *ego,
            None => {
                self.state.record(Action::Idle, 0);
                return Action::Idle;
            }
        };

        let ctx = DecisionContext {
            obs,
            ego: &ego,
            model: &self.model,
            car_following: &self.car_following,
            lane_change: &self.lane_change,
        };

        let mut action = None;
        for law in self.laws.iter_mut() {
            if let Some(law_action) = law.check(&ctx, &mut self.state) {
                self.state.last_law = Some(law.name());
                action = Some(law_action);
                break;
            }
        }
        let mut action = match action {
            Some(action) => action,
            None => base_decision(&ctx, &self.state),
        };

        if action == Action::Slower {
            if let Some(zone) = self.assertive_zone {
                if zone.contains(&ego) {
                    action = Action::Idle;
                }
            }
        }

        if self.policy_debug {
            let step = self.state.step;
            let law = self.state.last_law.unwrap_or("base");
            let speed = ego.speed();
            let kind = &self.kind;
            eprintln_f!("policy {kind} step {step}: {action} from {law} at {speed:.2} m/s");
        }

        self.state.record(action, self.lane_change.cooldown_steps);
        action
    }
}

/// Mixture of ego policy kinds. Ratios need not sum to one.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Composition {
    pub selfish: f64,
    pub cooperative: f64,
    #[serde(default)]
    pub defensive: f64,
}

impl Composition {
    pub fn new(selfish: f64, cooperative: f64, defensive: f64) -> Self {
        Self {
            selfish,
            cooperative,
            defensive,
        }
    }

    pub fn name(&self) -> String {
        let pct = |ratio: f64| (ratio * 100.0).round() as i64;
        let mut name = format!(
            "{}% Selfish, {}% Cooperative",
            pct(self.selfish),
            pct(self.cooperative)
        );
        if self.defensive > 0.0 {
            name.push_str(&format!(", {}% Defensive", pct(self.defensive)));
        }
        name
    }

    fn total(&self) -> f64 {
        self.selfish.max(0.0) + self.cooperative.max(0.0) + self.defensive.max(0.0)
    }

    pub fn sample_kind(&self, rng: &mut StdRng) -> PolicyKind {
        let total = self.total();
        if total <= 0.0 {
            return PolicyKind::Selfish;
        }
        let r = rng.gen::<f64>() * total;
        if r < self.selfish.max(0.0) {
            PolicyKind::Selfish
        } else if r < self.selfish.max(0.0) + self.cooperative.max(0.0) {
            PolicyKind::Cooperative
        } else {
            PolicyKind::Defensive
        }
    }

    /// Background driver attitude drawn with the same ratios as the ego.
    pub fn sample_profile(&self, rng: &mut StdRng, profiles: &TrafficProfiles) -> DriverProfile {
        match self.sample_kind(rng) {
            PolicyKind::Cooperative => profiles.cooperative,
            PolicyKind::Defensive => profiles.defensive,
            _ => profiles.selfish,
        }
    }
}
