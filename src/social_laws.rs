use crate::{
    action::Action,
    arg_parameters::{CooperativeParameters, Parameters},
    defensive::{ConservativeCruise, DefensiveCaution},
    intelligent_driver::CarFollowingRule,
    intersection::{AdaptiveCourtesy, CooperativeTurnTaking, PoliteGapProvision, RightOfWayNegotiation},
    lane_change_policy::LaneChangeRule,
    observation::{EgoState, LaneSide, Observation, ObservationModel, ObservedVehicle},
    parking_lot::{ManoeuvringCourtesy, ParkingAssistance, ParkingSpeedLimit, SpaceClaiming, SpaceOptimization},
    policy_state::PolicyState,
    racetrack::{AggressiveRacing, DefensivePositioning, RacetrackNavigation, SafeOvertaking, SlipstreamCooperation},
    roundabout::{EntryFacilitation, ExitCourtesy, FlowMaintenance, RoundaboutNavigation},
};

/// Everything an overlay may look at for one decision.
pub struct DecisionContext<'a> {
    pub obs: &'a Observation,
    pub ego: &'a EgoState,
    pub model: &'a ObservationModel,
    pub car_following: &'a CarFollowingRule,
    pub lane_change: &'a LaneChangeRule,
}

impl<'a> DecisionContext<'a> {
    pub fn ego_speed(&self) -> f64 {
        self.ego.speed()
    }

    pub fn vehicles(&self) -> &'a [ObservedVehicle] {
        self.obs.vehicles()
    }

    pub fn front_vehicle(&self) -> Option<&'a ObservedVehicle> {
        self.model.front_vehicle(self.obs)
    }
}

/// A behaviour override. `check` returning `None` means "no opinion" and the
/// next overlay, or finally the base rule, decides.
#[enum_dispatch]
#[derive(Debug, Clone)]
pub enum SocialLaw {
    CooperativeMerging,
    PoliteYielding,
    PhantomJamMitigation,
    DefensiveCaution,
    ConservativeCruise,
    PoliteGapProvision,
    CooperativeTurnTaking,
    RightOfWayNegotiation,
    AdaptiveCourtesy,
    EntryFacilitation,
    FlowMaintenance,
    ExitCourtesy,
    RoundaboutNavigation,
    SafeOvertaking,
    DefensivePositioning,
    SlipstreamCooperation,
    RacetrackNavigation,
    AggressiveRacing,
    ParkingSpeedLimit,
    ParkingAssistance,
    SpaceOptimization,
    ManoeuvringCourtesy,
    SpaceClaiming,
}

#[enum_dispatch(SocialLaw)]
pub trait SocialLawTrait {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action>;

    fn name(&self) -> &'static str;
}

/// Names accepted for single-law ablation runs.
pub const SINGLE_LAW_NAMES: [&str; 12] = [
    "cooperative_merging",
    "polite_yielding",
    "phantom_jam_mitigation",
    "polite_gap_provision",
    "cooperative_turn_taking",
    "adaptive_right_of_way",
    "entry_facilitation",
    "smooth_flow_maintenance",
    "exit_courtesy",
    "safe_overtaking_protocol",
    "defensive_positioning",
    "slipstream_cooperation",
];

impl SocialLaw {
    pub fn from_name(name: &str, params: &Parameters) -> Option<Self> {
        let law: SocialLaw = match name {
            "cooperative_merging" => CooperativeMerging::new(&params.cooperative).into(),
            "polite_yielding" => PoliteYielding::new(&params.cooperative).into(),
            "phantom_jam_mitigation" => {
                PhantomJamMitigation::new(&params.cooperative, params.car_following.time_headway).into()
            }
            "polite_gap_provision" => PoliteGapProvision::new(&params.intersection).into(),
            "cooperative_turn_taking" => CooperativeTurnTaking::new(&params.intersection).into(),
            "adaptive_right_of_way" => RightOfWayNegotiation::new(&params.intersection).into(),
            "entry_facilitation" => EntryFacilitation::new(&params.roundabout).into(),
            "smooth_flow_maintenance" => FlowMaintenance::new(&params.roundabout).into(),
            "exit_courtesy" => ExitCourtesy::new(&params.roundabout).into(),
            "safe_overtaking_protocol" => SafeOvertaking::new(&params.racetrack).into(),
            "defensive_positioning" => DefensivePositioning::new(&params.racetrack).into(),
            "slipstream_cooperation" => SlipstreamCooperation::new(&params.racetrack).into(),
            _ => return None,
        };
        Some(law)
    }

    /// The three highway laws, in priority order.
    pub fn cooperative_highway(params: &Parameters) -> Vec<Self> {
        vec![
            CooperativeMerging::new(&params.cooperative).into(),
            PoliteYielding::new(&params.cooperative).into(),
            PhantomJamMitigation::new(&params.cooperative, params.car_following.time_headway).into(),
        ]
    }
}

/// Slow down when a vehicle ahead in the right lane is trying to merge into
/// a gap that is too short for it.
#[derive(Debug, Clone)]
pub struct CooperativeMerging {
    detection_distance: f64,
    lateral_window: f64,
    merge_time: f64,
}

impl CooperativeMerging {
    pub fn new(params: &CooperativeParameters) -> Self {
        Self {
            detection_distance: params.merge_detection_distance,
            lateral_window: params.merge_lateral_window,
            merge_time: params.merge_time,
        }
    }

    pub fn merge_space_insufficient(
        &self,
        ctx: &DecisionContext,
        merging: &ObservedVehicle,
        time_headway: f64,
    ) -> bool {
        let front = match ctx.front_vehicle() {
            Some(front) => front,
            None => return false,
        };
        let available_space = front.x.abs();
        let merge_speed = merging.speed(ctx.ego);
        let ego_speed = ctx.ego_speed();

        let required = 2.0 * ctx.car_following.min_spacing
            + merge_speed * self.merge_time
            + (merge_speed - ego_speed).abs() * time_headway;
        available_space < required
    }
}

impl SocialLawTrait for CooperativeMerging {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        let merging = ctx
            .model
            .adjacent_lane_vehicles(ctx.obs, LaneSide::Right)
            .into_iter()
            .filter(|v| v.x > 0.0 && v.x < self.detection_distance && v.y.abs() <= self.lateral_window)
            .collect::<Vec<_>>();

        if merging
            .iter()
            .any(|v| self.merge_space_insufficient(ctx, v, state.time_headway))
        {
            return Some(Action::Slower);
        }
        None
    }

    fn name(&self) -> &'static str {
        "cooperative_merging"
    }
}

/// Open a gap for a slower neighbour that is alongside and presumably wants
/// into our lane, and keep it open for a while.
#[derive(Debug, Clone)]
pub struct PoliteYielding {
    speed_ratio: f64,
    window: f64,
    lateral_min: f64,
    lateral_max: f64,
    yield_time: f64,
}

impl PoliteYielding {
    pub fn new(params: &CooperativeParameters) -> Self {
        Self {
            speed_ratio: params.yield_speed_ratio,
            window: params.yield_window,
            lateral_min: params.yield_lateral_min,
            lateral_max: params.yield_lateral_max,
            yield_time: params.yield_time,
        }
    }

    fn wants_in(&self, ctx: &DecisionContext, v: &ObservedVehicle) -> bool {
        let lateral = v.y.abs();
        v.x.abs() < self.window
            && lateral >= self.lateral_min
            && lateral <= self.lateral_max
            && ctx.ego_speed() > v.speed(ctx.ego) * self.speed_ratio
    }
}

impl SocialLawTrait for PoliteYielding {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        for side in [LaneSide::Left, LaneSide::Right] {
            let neighbours = ctx.model.adjacent_lane_vehicles(ctx.obs, side);
            if neighbours.iter().any(|v| self.wants_in(ctx, v)) {
                state.yield_timer = self.yield_time;
                return Some(Action::Slower);
            }
        }
        if state.yielding() {
            return Some(Action::Slower);
        }
        None
    }

    fn name(&self) -> &'static str {
        "polite_yielding"
    }
}

/// Raises the following headway in dense traffic. Never emits an action.
#[derive(Debug, Clone)]
pub struct PhantomJamMitigation {
    density_threshold: f64,
    density_range: f64,
    increased_time_headway: f64,
    default_time_headway: f64,
}

impl PhantomJamMitigation {
    pub fn new(params: &CooperativeParameters, default_time_headway: f64) -> Self {
        Self {
            density_threshold: params.jam_density_threshold,
            density_range: params.density_range,
            increased_time_headway: params.jam_time_headway,
            default_time_headway,
        }
    }
}

impl SocialLawTrait for PhantomJamMitigation {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        let density = ctx.model.local_density(ctx.obs, self.density_range);
        state.time_headway = if density > self.density_threshold {
            self.increased_time_headway
        } else {
            self.default_time_headway
        };
        None
    }

    fn name(&self) -> &'static str {
        "phantom_jam_mitigation"
    }
}
