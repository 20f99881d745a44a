use crate::{
    action::Action,
    arg_parameters::IntersectionParameters,
    observation::ObservedVehicle,
    policy_state::PolicyState,
    social_laws::{DecisionContext, SocialLawTrait},
};

/// Neighbours classified around the intersection centre. Positions and
/// velocities are absolute here, recovered from the ego row.
pub struct IntersectionView<'a> {
    pub approaching: bool,
    pub turning: Vec<&'a ObservedVehicle>,
    pub waiting: Vec<&'a ObservedVehicle>,
}

impl<'a> IntersectionView<'a> {
    pub fn new(ctx: &DecisionContext<'a>, p: &IntersectionParameters) -> Self {
        let mut view = Self {
            approaching: ctx.ego.x.abs() < p.approach_distance,
            turning: Vec::new(),
            waiting: Vec::new(),
        };

        for v in ctx.vehicles() {
            let (cx, _) = v.abs_position(ctx.ego);
            let (vx, vy) = v.abs_velocity(ctx.ego);
            if vy.abs() > p.turning_lateral_speed {
                view.turning.push(v);
            }
            if vx.abs() < p.waiting_speed && cx.abs() < p.waiting_distance {
                view.waiting.push(v);
            }
        }

        view
    }
}

/// Ease off to let a turning vehicle just behind us cut across.
#[derive(Debug, Clone)]
pub struct PoliteGapProvision {
    params: IntersectionParameters,
}

impl PoliteGapProvision {
    pub fn new(params: &IntersectionParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for PoliteGapProvision {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        let view = IntersectionView::new(ctx, p);
        if !view.approaching {
            return None;
        }

        let turner_just_behind = view
            .turning
            .iter()
            .any(|t| t.x.abs() < p.gap_detection_range && t.x < 0.0 && -t.x < p.gap_ahead_window);
        if !turner_just_behind {
            return None;
        }

        if ctx.ego_speed() > p.gap_slow_speed {
            Some(Action::Slower)
        } else {
            Some(Action::Idle)
        }
    }

    fn name(&self) -> &'static str {
        "polite_gap_provision"
    }
}

/// After several through movements in a row, let a waiting vehicle go.
#[derive(Debug, Clone)]
pub struct CooperativeTurnTaking {
    params: IntersectionParameters,
}

impl CooperativeTurnTaking {
    pub fn new(params: &IntersectionParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for CooperativeTurnTaking {
    fn check(&mut self, ctx: &DecisionContext, state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        if state.consecutive_through < p.max_consecutive_through {
            return None;
        }
        let view = IntersectionView::new(ctx, p);
        let waiter_close = view.waiting.iter().any(|w| {
            let (cx, _) = w.abs_position(ctx.ego);
            cx.abs() < p.turn_taking_distance
        });
        if waiter_close {
            state.consecutive_through = 0;
            Some(Action::Slower)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "cooperative_turn_taking"
    }
}

/// Extend courtesy to anyone stopped at the intersection.
#[derive(Debug, Clone)]
pub struct AdaptiveCourtesy {
    params: IntersectionParameters,
}

impl AdaptiveCourtesy {
    pub fn new(params: &IntersectionParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }
}

impl SocialLawTrait for AdaptiveCourtesy {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        let p = &self.params;
        let view = IntersectionView::new(ctx, p);
        let stopped = view.waiting.iter().any(|w| {
            let (vx, _) = w.abs_velocity(ctx.ego);
            vx.abs() < p.courtesy_speed
        });
        if stopped {
            Some(Action::Slower)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "adaptive_courtesy"
    }
}

/// Who reaches the centre first goes first.
#[derive(Debug, Clone)]
pub struct RightOfWayNegotiation {
    params: IntersectionParameters,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RightOfWay {
    Proceed,
    Yield,
}

impl RightOfWayNegotiation {
    pub fn new(params: &IntersectionParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }

    pub fn eta(&self, distance: f64, speed: f64) -> f64 {
        distance / speed.max(self.params.speed_floor)
    }

    /// Compares our arrival time with every conflicting vehicle. Arrival
    /// times within the margin of each other count as a tie, which goes to
    /// the vehicle only when its observation row is at or before
    /// `tie_priority_index`.
    pub fn negotiate(&self, ctx: &DecisionContext) -> Option<RightOfWay> {
        let p = &self.params;
        let ego_distance = ctx.ego.distance_from_origin();
        // leaving or far from the zone
        if ego_distance > p.approach_distance || ctx.ego.x * ctx.ego.vx > 0.0 {
            return None;
        }
        let ego_eta = self.eta(ego_distance, ctx.ego_speed());

        let conflicts = ctx
            .vehicles()
            .iter()
            .filter(|v| !ctx.model.in_own_lane(v))
            .filter_map(|v| {
                let (cx, cy) = v.abs_position(ctx.ego);
                let (vx, vy) = v.abs_velocity(ctx.ego);
                let distance = cx.hypot(cy);
                let heading_in = cx * vx + cy * vy < 0.0;
                if distance < p.conflict_radius && heading_in {
                    Some((v.index, self.eta(distance, vx.hypot(vy))))
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();

        if conflicts.is_empty() {
            return None;
        }

        if conflicts.iter().any(|&(_, eta)| ego_eta > eta + p.eta_margin) {
            return Some(RightOfWay::Yield);
        }

        // rows are ordered nearest first
        let loses_tie = conflicts
            .iter()
            .any(|&(index, eta)| ego_eta >= eta - p.eta_margin && index <= p.tie_priority_index);
        if loses_tie {
            Some(RightOfWay::Yield)
        } else {
            Some(RightOfWay::Proceed)
        }
    }

    /// Braking is only safe when whoever follows us has room to react.
    pub fn safe_to_yield(&self, ctx: &DecisionContext) -> bool {
        let p = &self.params;
        let rear = match ctx.model.rear_vehicle(ctx.obs) {
            Some(rear) if rear.x.abs() < p.rear_check_range => rear,
            _ => return true,
        };
        let rear_speed = rear.speed(ctx.ego);
        if rear.closing_speed() <= 0.0 || rear_speed <= 0.1 {
            return true;
        }
        rear.x.abs() / rear_speed >= p.min_rear_headway
    }
}

impl SocialLawTrait for RightOfWayNegotiation {
    fn check(&mut self, ctx: &DecisionContext, _state: &mut PolicyState) -> Option<Action> {
        match self.negotiate(ctx)? {
            RightOfWay::Proceed => Some(Action::Faster),
            RightOfWay::Yield => {
                if self.safe_to_yield(ctx) {
                    Some(Action::Slower)
                } else {
                    // clear the zone rather than risk a rear-end
                    Some(Action::Faster)
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "adaptive_right_of_way"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intelligent_driver::CarFollowingRule;
    use crate::lane_change_policy::LaneChangeRule;
    use crate::observation::tests::model;
    use crate::observation::Observation;
    use crate::social_laws::tests::params;

    /// Ego at `ego` = [x, y, vx, vy] relative to the centre, others as
    /// relative rows.
    fn obs(ego: [f64; 4], rows: &[[f64; 4]]) -> Observation {
        let mut all = vec![vec![1.0, ego[0], ego[1], ego[2], ego[3]]];
        for r in rows {
            all.push(vec![1.0, r[0], r[1], r[2], r[3]]);
        }
        Observation::from_rows(&all)
    }

    fn run(law: &mut dyn SocialLawTrait, obs: &Observation, state: &mut PolicyState) -> Option<Action> {
        let p = params();
        let m = model();
        let cf = CarFollowingRule::new(&p.car_following);
        let lc = LaneChangeRule::cooperative(&p.lane_change);
        let ego = *obs.ego().unwrap();
        let ctx = DecisionContext {
            obs,
            ego: &ego,
            model: &m,
            car_following: &cf,
            lane_change: &lc,
        };
        law.check(&ctx, state)
    }

    #[test]
    fn test_right_of_way_proceeds_when_clearly_first() {
        let mut law = RightOfWayNegotiation::new(&params().intersection);
        let mut state = PolicyState::new(1.5);
        // ego 10 m out at 10 m/s (1 s), other 25 m out at 5 m/s (5 s)
        let o = obs([-10.0, 0.0, 10.0, 0.0], &[[-15.0, 4.0, -5.0, 0.0]]);
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Faster));
    }

    #[test]
    fn test_right_of_way_yields_when_later() {
        let mut law = RightOfWayNegotiation::new(&params().intersection);
        let mut state = PolicyState::new(1.5);
        // ego 30 m out at 5 m/s (6 s), other 5 m out at 10 m/s (0.5 s)
        let o = obs([-30.0, 0.0, 5.0, 0.0], &[[25.0, 4.0, 5.0, 0.0]]);
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Slower));

        // tailgater 8 m behind at 12 m/s makes braking unsafe
        let o = obs(
            [-30.0, 0.0, 5.0, 0.0],
            &[[25.0, 4.0, 5.0, 0.0], [-8.0, 0.0, 7.0, 0.0]],
        );
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Faster));
    }

    #[test]
    fn test_right_of_way_tie_breaks_by_index() {
        let mut law = RightOfWayNegotiation::new(&params().intersection);
        let mut state = PolicyState::new(1.5);
        // both 2 s out, the other vehicle in row 1
        let o = obs([-20.0, 0.0, 10.0, 0.0], &[[0.0, 4.0, 0.0, 0.0]]);
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Slower));

        // same tie with the other vehicle pushed to row 3 behind two
        // same-lane rows that never conflict
        let o = obs(
            [-20.0, 0.0, 10.0, 0.0],
            &[[100.0, 0.0, 0.0, 0.0], [120.0, 0.0, 0.0, 0.0], [0.0, 4.0, 0.0, 0.0]],
        );
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Faster));

        // a later row still loses a clear race
        let o = obs(
            [-30.0, 0.0, 5.0, 0.0],
            &[[100.0, 0.0, 0.0, 0.0], [120.0, 0.0, 0.0, 0.0], [25.0, 4.0, 5.0, 0.0]],
        );
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Slower));
    }

    #[test]
    fn test_right_of_way_no_opinion_without_conflicts() {
        let mut law = RightOfWayNegotiation::new(&params().intersection);
        let mut state = PolicyState::new(1.5);
        let o = obs([-20.0, 0.0, 10.0, 0.0], &[]);
        assert_eq!(run(&mut law, &o, &mut state), None);
        // already past the centre
        let o = obs([10.0, 0.0, 10.0, 0.0], &[[-15.0, 4.0, -5.0, 0.0]]);
        assert_eq!(run(&mut law, &o, &mut state), None);
    }

    #[test]
    fn test_turn_taking_resets_count() {
        let mut law = CooperativeTurnTaking::new(&params().intersection);
        let mut state = PolicyState::new(1.5);
        // stopped vehicle 15 m past the ego, 5 m from the centre
        let o = obs([-20.0, 0.0, 10.0, 0.0], &[[15.0, 4.0, -10.0, 0.0]]);
        state.consecutive_through = 2;
        assert_eq!(run(&mut law, &o, &mut state), None);
        state.consecutive_through = 3;
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Slower));
        assert_eq!(state.consecutive_through, 0);
    }

    #[test]
    fn test_gap_for_turner_behind() {
        let mut law = PoliteGapProvision::new(&params().intersection);
        let mut state = PolicyState::new(1.5);
        let o = obs([-20.0, 0.0, 12.0, 0.0], &[[-10.0, 4.0, 0.0, -3.0]]);
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Slower));
        let o = obs([-20.0, 0.0, 8.0, 0.0], &[[-10.0, 4.0, 0.0, -3.0]]);
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Idle));
        // turner ahead of us does not need a gap
        let o = obs([-20.0, 0.0, 12.0, 0.0], &[[10.0, 4.0, 0.0, -3.0]]);
        assert_eq!(run(&mut law, &o, &mut state), None);
    }

    #[test]
    fn test_courtesy_for_stopped_vehicle() {
        let mut law = AdaptiveCourtesy::new(&params().intersection);
        let mut state = PolicyState::new(1.5);
        let o = obs([-20.0, 0.0, 10.0, 0.0], &[[10.0, 4.0, -9.0, 0.0]]);
        assert_eq!(run(&mut law, &o, &mut state), Some(Action::Slower));
        let o = obs([-20.0, 0.0, 10.0, 0.0], &[[10.0, 4.0, 0.0, 0.0]]);
        assert_eq!(run(&mut law, &o, &mut state), None);
    }
}
