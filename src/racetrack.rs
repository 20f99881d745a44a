use crate::{
    action::Action,
    arg_parameters::RacetrackParameters,
    observation::ObservedVehicle,
    policy_state::{OvertakeState, PolicyState},
    social_laws::{DecisionContext, SocialLawTrait},
};

const KMH_TO_MS: f64 = 1.0 / 3.6;

/// Nearest vehicle ahead along the track, in any lane.
fn front_on_track<'a>(ctx: &DecisionContext<'a>) -> Option<&'a ObservedVehicle> {
    ctx.vehicles()
        .iter()
        .filter(|v| v.x > 0.0)
        .min_by(|a, b| a.x.total_cmp(&b.x))
}

/// Lane change that clears a vehicle at lateral offset `y`.
fn side_step(y: f64) -> Action {
    if y > 0.0 {
        Action::LaneRight
    } else {
        Action::LaneLeft
    }
}

fn in_corner(ctx: &DecisionContext, p: &RacetrackParameters) -> bool {
    ctx.ego.y.abs() > p.corner_offset
}

fn speed_differential(ctx: &DecisionContext, v: &ObservedVehicle) -> f64 {
    v.speed(ctx.ego) - ctx.ego_speed()
}

/// Staged pass of a clearly slower vehicle ahead: move out, accelerate,
/// settle once it is behind, then wait before trying again.
#[derive(Debug, Clone)]
pub struct SafeOvertaking {
    params: RacetrackParameters,
}

impl SafeOvertaking {
    pub fn new(params: &RacetrackParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }

    pub fn opportunity<'a>(&self, ctx: &DecisionContext<'a>) -> Option<&'a ObservedVehicle> {
        let p = &self.params;
        ctx.vehicles().iter().find(|v| {
            v.x > 0.0
                && v.x.abs() < p.overtake_distance
                && speed_differential(ctx, v) < -p.min_speed_differential
        })
    }
}

impl SocialLawTrait for SafeOvertaking {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        let target = self.opportunity(ctx);

        match state.overtake {
            OvertakeState::None => {
                if state.overtake_cooldown > 0 || in_corner(ctx, p) {
                    return None;
                }
                let target = target?;
                state.overtake = OvertakeState::Preparing;
                if target.y.abs() < p.same_lane_offset {
                    Some(side_step(target.y))
                } else {
                    Some(Action::Idle)
                }
            }
            OvertakeState::Preparing => {
                if target.is_none() {
                    state.overtake = OvertakeState::None;
                    return None;
                }
                state.overtake = OvertakeState::Executing;
                Some(Action::Faster)
            }
            OvertakeState::Executing => {
                if target.is_some() {
                    Some(Action::Faster)
                } else {
                    // nothing slower left ahead
                    state.overtake = OvertakeState::Completing;
                    Some(Action::Idle)
                }
            }
            OvertakeState::Completing => {
                state.overtake = OvertakeState::None;
                state.overtake_cooldown = p.overtake_cooldown_steps;
                Some(Action::Idle)
            }
        }
    }

    fn name(&self) -> &'static str {
        "safe_overtaking_protocol"
    }
}

/// Let a much faster car from behind through.
#[derive(Debug, Clone)]
pub struct DefensivePositioning {
    params: RacetrackParameters,
}

impl DefensivePositioning {
    pub fn new(params: &RacetrackParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for DefensivePositioning {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        let faster = ctx
            .vehicles()
            .iter()
            .find(|v| v.x < 0.0 && speed_differential(ctx, v) > p.faster_differential)?;

        if faster.y.abs() < p.same_lane_offset {
            Some(side_step(faster.y))
        } else if faster.x.abs() < p.defensive_gap {
            Some(Action::Slower)
        } else {
            Some(Action::Idle)
        }
    }

    fn name(&self) -> &'static str {
        "defensive_positioning"
    }
}

/// Pair up with a similar-speed car, either tucking in behind it or
/// holding a steady lead speed for it.
#[derive(Debug, Clone)]
pub struct SlipstreamCooperation {
    params: RacetrackParameters,
}

impl SlipstreamCooperation {
    pub fn new(params: &RacetrackParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }

    fn speed_band(&self) -> (f64, f64) {
        (
            self.params.slipstream_min_kmh * KMH_TO_MS,
            self.params.slipstream_max_kmh * KMH_TO_MS,
        )
    }

    pub fn partner<'a>(&self, ctx: &DecisionContext<'a>) -> Option<&'a ObservedVehicle> {
        let p = &self.params;
        let (lo, hi) = self.speed_band();
        let in_band = |speed: f64| speed >= lo && speed <= hi;
        if !in_band(ctx.ego_speed()) {
            return None;
        }
        ctx.vehicles().iter().find(|v| {
            let distance = v.x.abs();
            in_band(v.speed(ctx.ego))
                && distance > p.slipstream_min_distance
                && distance < p.slipstream_max_distance
        })
    }
}

impl SocialLawTrait for SlipstreamCooperation {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        let partner = self.partner(ctx)?;

        let action = if partner.x > 0.0 {
            let distance = partner.x.abs();
            if distance > p.slipstream_distance * 1.2 {
                Action::Faster
            } else if distance < p.slipstream_distance * 0.8 {
                Action::Slower
            } else {
                Action::Idle
            }
        } else {
            let (lo, hi) = self.speed_band();
            let lead_speed = (lo + hi) / 2.0;
            let ego_speed = ctx.ego_speed();
            if ego_speed < lead_speed * 0.9 {
                Action::Faster
            } else if ego_speed > lead_speed * 1.1 {
                Action::Slower
            } else {
                Action::Idle
            }
        };
        Some(action)
    }

    fn name(&self) -> &'static str {
        "slipstream_cooperation"
    }
}

/// High-speed lapping with a corner speed limit.
#[derive(Debug, Clone)]
pub struct RacetrackNavigation {
    params: RacetrackParameters,
}

impl RacetrackNavigation {
    pub fn new(params: &RacetrackParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for RacetrackNavigation {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        let ego_speed = ctx.ego_speed();
        let under_target = ego_speed < p.target_speed;

        match front_on_track(ctx) {
            Some(front) if front.x < p.follow_close => return Some(Action::Slower),
            Some(front) if front.x > p.follow_open && under_target => return Some(Action::Faster),
            None if under_target => return Some(Action::Faster),
            _ => {}
        }

        if in_corner(ctx, p) && ego_speed > p.corner_speed {
            return Some(Action::Slower);
        }
        Some(Action::Idle)
    }

    fn name(&self) -> &'static str {
        "racetrack_navigation"
    }
}

/// Selfish racing: higher target speed, shorter gaps, pass whenever faster.
#[derive(Debug, Clone)]
pub struct AggressiveRacing {
    params: RacetrackParameters,
}

impl AggressiveRacing {
    pub fn new(params: &RacetrackParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for AggressiveRacing {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        let ego_speed = ctx.ego_speed();
        let under_target = ego_speed < p.aggressive_target_speed;

        let front = match front_on_track(ctx) {
            Some(front) => front,
            None if under_target => return Some(Action::Faster),
            None => return Some(Action::Idle),
        };

        let gap = front.x;
        if ego_speed > front.speed(ctx.ego) + p.aggressive_pass_margin && gap > p.aggressive_min_gap {
            return Some(side_step(front.y));
        }
        if gap < p.aggressive_min_gap {
            Some(Action::Slower)
        } else if gap > p.aggressive_follow_open && under_target {
            Some(Action::Faster)
        } else {
            Some(Action::Idle)
        }
    }

    fn name(&self) -> &'static str {
        "aggressive_racing"
    }
}
