use crate::{
    action::Action,
    arg_parameters::ParkingParameters,
    observation::{LaneSide, ObservedVehicle},
    policy_state::PolicyState,
    social_laws::{DecisionContext, SocialLawTrait},
};

/// Someone backing out, turning into a bay or creeping along.
fn is_manoeuvring(ctx: &DecisionContext, v: &ObservedVehicle, p: &ParkingParameters) -> bool {
    let (_, vy) = v.abs_velocity(ctx.ego);
    let speed = v.speed(ctx.ego);
    vy.abs() > p.manoeuvre_lateral_speed || (speed > p.parked_speed && speed < p.creep_speed)
}

#[derive(Debug, Clone)]
pub struct ParkingSpeedLimit {
    speed_limit: f64,
}

impl ParkingSpeedLimit {
    pub fn new(params: &ParkingParameters) -> Self {
        Self {
            speed_limit: params.speed_limit,
        }
    }
}

impl SocialLawTrait for ParkingSpeedLimit {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        if ctx.ego_speed() > self.speed_limit {
            Some(Action::Slower)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "parking_speed_limit"
    }
}

/// Hold back for a nearby vehicle that is manoeuvring.
#[derive(Debug, Clone)]
pub struct ParkingAssistance {
    params: ParkingParameters,
}

impl ParkingAssistance {
    pub fn new(params: &ParkingParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for ParkingAssistance {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        let needs_room = ctx
            .vehicles()
            .iter()
            .any(|v| v.distance() < p.assistance_range && is_manoeuvring(ctx, v, p));
        if needs_room {
            Some(Action::Slower)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "parking_assistance"
    }
}

/// Already sitting at a tight but safe gap: stay put instead of creeping up.
#[derive(Debug, Clone)]
pub struct SpaceOptimization {
    slack_factor: f64,
}

impl SpaceOptimization {
    pub fn new(params: &ParkingParameters) -> Self {
        Self {
            slack_factor: params.space_slack_factor,
        }
    }
}

impl SocialLawTrait for SpaceOptimization {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        let front = ctx.front_vehicle()?;
        let safe = ctx
            .car_following
            .safe_distance(ctx.ego_speed(), state.time_headway);
        let gap = front.x.abs();
        if gap >= safe && gap <= safe * self.slack_factor {
            Some(Action::Idle)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "space_optimization"
    }
}

/// Yield for a while to a neighbour ahead drifting into our lane.
#[derive(Debug, Clone)]
pub struct ManoeuvringCourtesy {
    params: ParkingParameters,
}

impl ManoeuvringCourtesy {
    pub fn new(params: &ParkingParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for ManoeuvringCourtesy {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        for side in [LaneSide::Left, LaneSide::Right] {
            let cutting_in = ctx
                .model
                .adjacent_lane_vehicles(ctx.obs, side)
                .into_iter()
                .any(|v| {
                    v.x > 0.0 && v.x < p.courtesy_range && -side.sign() * v.vy > p.manoeuvre_lateral_speed
                });
            if cutting_in {
                state.yield_timer = p.courtesy_wait;
                return Some(Action::Slower);
            }
        }
        None
    }

    fn name(&self) -> &'static str {
        "courteous_manoeuvring"
    }
}

/// Selfish lot driving: jump the queue for a space and race for contested ones.
#[derive(Debug, Clone)]
pub struct SpaceClaiming {
    claim_distance: f64,
}

impl SpaceClaiming {
    pub fn new(params: &ParkingParameters) -> Self {
        Self {
            claim_distance: params.claim_distance,
        }
    }
}

impl SocialLawTrait for SpaceClaiming {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let blocked = ctx
            .front_vehicle()
            .map_or(false, |front| front.x < self.claim_distance);
        if blocked {
            let left_clear = ctx
                .model
                .adjacent_lane_vehicles(ctx.obs, LaneSide::Left)
                .iter()
                .all(|v| v.x.abs() >= self.claim_distance);
            if left_clear {
                return Some(Action::LaneLeft);
            }
        }

        let contested = [LaneSide::Left, LaneSide::Right].iter().any(|&side| {
            ctx.model
                .adjacent_lane_vehicles(ctx.obs, side)
                .iter()
                .any(|v| v.x.abs() < self.claim_distance)
        });
        if contested {
            Some(Action::Faster)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "space_claiming"
    }
}
