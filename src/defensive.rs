use crate::{
    action::Action,
    arg_parameters::DefensiveParameters,
    observation::LaneSide,
    policy_state::PolicyState,
    social_laws::{DecisionContext, SocialLawTrait},
};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Threats {
    pub front_close: bool,
    pub lateral_close: bool,
    pub cutting_in: bool,
    pub approaching_fast: bool,
    pub crowded: bool,
}

/// Respond to anything that could become a conflict, well before it does.
#[derive(Debug, Clone)]
pub struct DefensiveCaution {
    params: DefensiveParameters,
}

impl DefensiveCaution {
    pub fn new(params: &DefensiveParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }

    pub fn threats(&self, ctx: &DecisionContext) -> Threats {
        let p = &self.params;
        let mut threats = Threats::default();

        for v in ctx.vehicles() {
            let distance = v.distance();

            if v.x > 0.0 && v.y.abs() < p.front_lateral_window && distance < p.caution_distance {
                threats.front_close = true;
            }

            if v.x.abs() < p.lateral_window_x && v.y.abs() < p.lateral_window_y {
                threats.lateral_close = true;
                // drifting toward our lane
                if v.y != 0.0 && -v.y.signum() * v.vy > p.lateral_threat_speed {
                    threats.cutting_in = true;
                }
            }

            let closing = v.closing_speed();
            if distance < p.approach_distance && closing > 0.0 && distance / closing < p.threat_ttc {
                threats.approaching_fast = true;
            }

            if distance < p.complex_distance {
                threats.crowded = true;
            }
        }

        threats
    }
}

impl SocialLawTrait for DefensiveCaution {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        let threats = self.threats(ctx);

        let action = if threats.front_close || threats.cutting_in {
            Action::Slower
        } else if threats.lateral_close {
            Action::Idle
        } else if threats.approaching_fast {
            Action::Slower
        } else if threats.crowded {
            Action::Idle
        } else {
            return None;
        };

        state.cautious_steps += 1;
        Some(action)
    }

    fn name(&self) -> &'static str {
        "defensive_caution"
    }
}

/// Default behaviour when nothing threatens: stay well under the speed cap
/// and only change lanes after a long quiet stretch into an empty lane.
#[derive(Debug, Clone)]
pub struct ConservativeCruise {
    params: DefensiveParameters,
}

impl ConservativeCruise {
    pub fn new(params: &DefensiveParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }

    fn lane_clear(&self, ctx: &DecisionContext, side: LaneSide) -> bool {
        ctx.model
            .adjacent_lane_vehicles(ctx.obs, side)
            .iter()
            .all(|v| v.distance() >= self.params.clear_distance)
    }
}

impl SocialLawTrait for ConservativeCruise {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        let ego_speed = ctx.ego_speed();
        let speed_cap = self.params.cruise_factor * ctx.car_following.desired_velocity;

        if ego_speed > speed_cap {
            return Some(Action::Slower);
        }

        if state.cautious_steps > self.params.lane_change_after_steps {
            let change = if self.lane_clear(ctx, LaneSide::Left) {
                Some(Action::LaneLeft)
            } else if self.lane_clear(ctx, LaneSide::Right) {
                Some(Action::LaneRight)
            } else {
                None
            };
            if change.is_some() {
                state.cautious_steps = 0;
                return change;
            }
        }

        let action = match ctx
            .car_following
            .choose(ego_speed, ctx.front_vehicle(), state.time_headway)
        {
            Action::Faster if ego_speed >= speed_cap => Action::Idle,
            action => action,
        };
        Some(action)
    }

    fn name(&self) -> &'static str {
        "conservative_cruise"
    }
}
