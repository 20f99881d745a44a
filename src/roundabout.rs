use crate::{
    action::Action,
    arg_parameters::RoundaboutParameters,
    observation::ObservedVehicle,
    policy_state::PolicyState,
    social_laws::{DecisionContext, SocialLawTrait},
};

/// Traffic around the ring, with positions measured from its centre.
pub struct RingView<'a> {
    pub inside: bool,
    pub entering: Vec<&'a ObservedVehicle>,
    pub circulating: Vec<&'a ObservedVehicle>,
    pub exiting: Vec<&'a ObservedVehicle>,
    /// 1 for uniform speeds, falling toward 0 as they spread.
    pub flow_consistency: f64,
}

impl<'a> RingView<'a> {
    pub fn new(ctx: &DecisionContext<'a>, p: &RoundaboutParameters) -> Self {
        let mut view = Self {
            inside: ctx.ego.distance_from_origin() < p.radius * p.influence_factor,
            entering: Vec::new(),
            circulating: Vec::new(),
            exiting: Vec::new(),
            flow_consistency: 1.0,
        };

        let mut speeds = Vec::new();
        for v in ctx.vehicles() {
            let (cx, cy) = v.abs_position(ctx.ego);
            let (vx, vy) = v.abs_velocity(ctx.ego);
            let from_centre = cx.hypot(cy);
            speeds.push(vx.hypot(vy));

            if from_centre > p.radius * p.entry_factor {
                if v.x.abs() > p.entry_lateral {
                    view.entering.push(v);
                }
            } else if from_centre < p.radius * p.circulating_factor {
                view.circulating.push(v);
                if cx * vx + cy * vy > 0.0 {
                    view.exiting.push(v);
                }
            }
        }

        if !speeds.is_empty() {
            let n = speeds.len() as f64;
            let mean = speeds.iter().sum::<f64>() / n;
            let variance = speeds.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
            view.flow_consistency = (1.0 - variance / (mean + 1e-6)).max(0.0);
        }

        view
    }

    /// Nearest vehicle ahead of us, in any lane.
    pub fn front(ctx: &DecisionContext<'a>) -> Option<&'a ObservedVehicle> {
        ctx.vehicles()
            .iter()
            .filter(|v| v.x > 0.0)
            .min_by(|a, b| a.distance().total_cmp(&b.distance()))
    }
}

/// Open a gap for a vehicle waiting to enter behind us.
#[derive(Debug, Clone)]
pub struct EntryFacilitation {
    params: RoundaboutParameters,
}

impl EntryFacilitation {
    pub fn new(params: &RoundaboutParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for EntryFacilitation {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        if state.entry_cooldown > 0 {
            return None;
        }
        let view = RingView::new(ctx, p);
        if !view.inside {
            return None;
        }
        let waiting_behind = view
            .entering
            .iter()
            .any(|v| v.distance() < p.entry_detection && v.x < 0.0);
        if waiting_behind {
            state.entry_cooldown = p.entry_cooldown_steps;
            Some(Action::Slower)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "entry_facilitation"
    }
}

/// When ring speeds are uneven, hold a steady spacing to the vehicle ahead.
#[derive(Debug, Clone)]
pub struct FlowMaintenance {
    params: RoundaboutParameters,
}

impl FlowMaintenance {
    pub fn new(params: &RoundaboutParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for FlowMaintenance {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        let view = RingView::new(ctx, p);
        if !view.inside || view.flow_consistency >= p.flow_consistency_threshold {
            return None;
        }

        let gap = match RingView::front(ctx) {
            Some(front) => front.x.abs(),
            None => return Some(Action::Idle),
        };
        if gap < p.target_spacing * p.close_spacing_factor {
            Some(Action::Slower)
        } else if gap > p.target_spacing * p.open_spacing_factor {
            Some(Action::Faster)
        } else {
            Some(Action::Idle)
        }
    }

    fn name(&self) -> &'static str {
        "smooth_flow_maintenance"
    }
}

#[derive(Debug, Clone)]
pub struct ExitCourtesy {
    params: RoundaboutParameters,
}

impl ExitCourtesy {
    pub fn new(params: &RoundaboutParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for ExitCourtesy {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let view = RingView::new(ctx, &self.params);
        if view
            .exiting
            .iter()
            .any(|v| v.distance() < self.params.exit_detection)
        {
            Some(Action::Slower)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "exit_courtesy"
    }
}

/// Plain ring driving once the courtesy overlays have had their say.
#[derive(Debug, Clone)]
pub struct RoundaboutNavigation {
    params: RoundaboutParameters,
}

impl RoundaboutNavigation {
    pub fn new(params: &RoundaboutParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for RoundaboutNavigation {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        if ctx.ego.distance_from_origin() >= p.radius * p.influence_factor {
            return None;
        }

        let action = match RingView::front(ctx) {
            Some(front) if front.distance() < p.follow_close => Action::Slower,
            Some(front) if front.distance() > p.follow_open => Action::Faster,
            Some(_) => Action::Idle,
            None if ctx.ego_speed() < p.cruise_speed => Action::Faster,
            None => Action::Idle,
        };
        Some(action)
    }

    fn name(&self) -> &'static str {
        "roundabout_navigation"
    }
}
