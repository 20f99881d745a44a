use crate::{
    action::Action,
    arg_parameters::LaneChangeParameters,
    observation::{LaneSide, Observation, ObservationModel, ObservedVehicle},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaneChange {
    Stay,
    Left,
    Right,
}

impl LaneChange {
    pub fn action(self) -> Option<Action> {
        match self {
            LaneChange::Stay => None,
            LaneChange::Left => Some(Action::LaneLeft),
            LaneChange::Right => Some(Action::LaneRight),
        }
    }
}

/// Predicate deciding whether the target lane's occupants leave room to move in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SafetyCheck {
    /// Nobody closer than `min_gap` along the road.
    Distance { min_gap: f64 },
    /// As `Distance`, and nobody reaching us within `min_ttc` seconds once
    /// the speed difference exceeds `min_closing`.
    TimeToCollision {
        min_gap: f64,
        min_ttc: f64,
        min_closing: f64,
    },
}

impl SafetyCheck {
    pub fn min_gap(&self) -> f64 {
        match *self {
            SafetyCheck::Distance { min_gap } => min_gap,
            SafetyCheck::TimeToCollision { min_gap, .. } => min_gap,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AggressivePass {
    /// Re-evaluate lanes while the leader is closer than this many safe distances.
    pub pass_multiple: f64,
}

/// MOBIL-style lane selection on local observations.
#[derive(Clone, Debug, PartialEq)]
pub struct LaneChangeRule {
    pub threshold: f64,
    pub politeness: f64,
    /// Charge `politeness` for cutting in front of a faster follower.
    pub follower_courtesy: bool,
    pub gap_scale: f64,
    pub speed_scale: f64,
    pub empty_lane_utility: f64,
    pub clear_ahead_utility: f64,
    pub no_leader_utility: f64,
    pub safety: SafetyCheck,
    pub aggressive: Option<AggressivePass>,
    pub cooldown_steps: u32,
}

impl LaneChangeRule {
    fn base(params: &LaneChangeParameters, safety: SafetyCheck, cooldown_steps: u32) -> Self {
        Self {
            threshold: params.threshold,
            politeness: params.politeness,
            follower_courtesy: params.follower_courtesy,
            gap_scale: params.utility_gap_scale,
            speed_scale: params.utility_speed_scale,
            empty_lane_utility: params.empty_lane_utility,
            clear_ahead_utility: params.clear_ahead_utility,
            no_leader_utility: params.no_leader_utility,
            safety,
            aggressive: None,
            cooldown_steps,
        }
    }

    pub fn selfish(params: &LaneChangeParameters) -> Self {
        if params.aggressive {
            let mut rule = Self::base(
                params,
                SafetyCheck::Distance {
                    min_gap: params.aggressive_min_gap,
                },
                params.selfish_cooldown_steps,
            );
            rule.aggressive = Some(AggressivePass {
                pass_multiple: params.aggressive_pass_multiple,
            });
            rule
        } else {
            Self::base(
                params,
                SafetyCheck::Distance {
                    min_gap: params.selfish_min_gap,
                },
                params.selfish_cooldown_steps,
            )
        }
    }

    pub fn cooperative(params: &LaneChangeParameters) -> Self {
        Self::base(
            params,
            SafetyCheck::TimeToCollision {
                min_gap: params.cooperative_min_gap,
                min_ttc: params.cooperative_min_ttc,
                min_closing: params.cooperative_min_closing,
            },
            params.cooperative_cooldown_steps,
        )
    }

    /// Utility of following `front`, in [0, 1]. Row velocities are relative,
    /// so `vx` is already the speed difference to the ego.
    pub fn lane_utility(&self, front: Option<&ObservedVehicle>) -> f64 {
        match front {
            None => self.no_leader_utility,
            Some(front) => {
                let utility = front.x.abs() / self.gap_scale + front.vx / self.speed_scale;
                if utility.is_finite() {
                    utility.clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
        }
    }

    pub fn adjacent_lane_utility(&self, vehicles: &[&ObservedVehicle]) -> f64 {
        if vehicles.is_empty() {
            return self.empty_lane_utility;
        }
        let front = vehicles
            .iter()
            .filter(|v| v.x > 0.0)
            .min_by(|a, b| a.x.total_cmp(&b.x));
        match front {
            None => self.clear_ahead_utility,
            Some(front) => self.lane_utility(Some(front)),
        }
    }

    /// Courtesy cost of cutting in front of the target lane's follower.
    /// Zero unless `follower_courtesy` is on.
    fn follower_penalty(&self, vehicles: &[&ObservedVehicle]) -> f64 {
        if !self.follower_courtesy {
            return 0.0;
        }
        let follower = vehicles
            .iter()
            .filter(|v| v.x <= 0.0)
            .max_by(|a, b| a.x.total_cmp(&b.x));
        match follower {
            Some(f) => self.politeness * (f.closing_speed() / self.speed_scale).clamp(0.0, 1.0),
            None => 0.0,
        }
    }

    pub fn is_lane_change_safe(&self, vehicles: &[&ObservedVehicle]) -> bool {
        vehicles.iter().all(|v| {
            let dist = v.x.abs();
            match self.safety {
                SafetyCheck::Distance { min_gap } => dist >= min_gap,
                SafetyCheck::TimeToCollision {
                    min_gap,
                    min_ttc,
                    min_closing,
                } => {
                    if dist < min_gap {
                        return false;
                    }
                    let relative_speed = v.vx.abs();
                    relative_speed <= min_closing || dist / relative_speed >= min_ttc
                }
            }
        })
    }

    /// Whether an aggressive driver should look for a pass even though the
    /// speed rule did not settle on IDLE.
    pub fn wants_pass(&self, front: Option<&ObservedVehicle>, safe_distance: f64) -> bool {
        match (self.aggressive, front) {
            (Some(aggressive), Some(front)) => front.x.abs() < aggressive.pass_multiple * safe_distance,
            _ => false,
        }
    }

    pub fn choose(&self, model: &ObservationModel, obs: &Observation, cooldown_remaining: u32) -> LaneChange {
        if cooldown_remaining > 0 || obs.is_empty() {
            return LaneChange::Stay;
        }

        let current_utility = self.lane_utility(model.front_vehicle(obs));

        let benefit = |side: LaneSide| {
            let vehicles = model.adjacent_lane_vehicles(obs, side);
            let benefit = self.adjacent_lane_utility(&vehicles) - current_utility - self.follower_penalty(&vehicles);
            let ok = benefit > self.threshold && self.is_lane_change_safe(&vehicles);
            (ok, benefit)
        };

        match (benefit(LaneSide::Left), benefit(LaneSide::Right)) {
            ((true, left), (true, right)) => {
                if left > right {
                    LaneChange::Left
                } else if right > left {
                    LaneChange::Right
                } else {
                    LaneChange::Stay
                }
            }
            ((true, _), _) => LaneChange::Left,
            (_, (true, _)) => LaneChange::Right,
            _ => LaneChange::Stay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arg_parameters::Parameters;
    use crate::observation::tests::{model, obs_with};
    use approx::assert_abs_diff_eq;

    fn selfish() -> LaneChangeRule {
        LaneChangeRule::selfish(&Parameters::new().unwrap().lane_change)
    }

    fn cooperative() -> LaneChangeRule {
        LaneChangeRule::cooperative(&Parameters::new().unwrap().lane_change)
    }

    #[test]
    fn test_lane_utility() {
        let r = selfish();
        assert_abs_diff_eq!(r.lane_utility(None), 0.8, epsilon = 1e-12);
        let obs = obs_with(25.0, &[[20.0, 0.0, -2.0, 0.0]]);
        // 20/100 - 2/20
        assert_abs_diff_eq!(r.lane_utility(obs.vehicles().first()), 0.1, epsilon = 1e-12);
        let obs = obs_with(25.0, &[[150.0, 0.0, 10.0, 0.0]]);
        assert_abs_diff_eq!(r.lane_utility(obs.vehicles().first()), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_adjacent_lane_utility() {
        let r = selfish();
        assert_abs_diff_eq!(r.adjacent_lane_utility(&[]), 1.0, epsilon = 1e-12);
        let obs = obs_with(25.0, &[[-30.0, 4.0, 0.0, 0.0]]);
        let behind = obs.vehicles().iter().collect::<Vec<_>>();
        assert_abs_diff_eq!(r.adjacent_lane_utility(&behind), 0.6, epsilon = 1e-12);
    }

    #[test]
    fn test_unsafe_when_anyone_is_inside_min_gap() {
        for rule in [selfish(), cooperative()] {
            let min_gap = rule.safety.min_gap();
            for d in [0.0, 0.5, min_gap * 0.5, min_gap - 1e-6] {
                for sign in [-1.0, 1.0] {
                    let obs = obs_with(
                        25.0,
                        &[[sign * d, 4.0, 0.0, 0.0], [80.0, 4.0, 0.0, 0.0]],
                    );
                    let vehicles = obs.vehicles().iter().collect::<Vec<_>>();
                    assert!(!rule.is_lane_change_safe(&vehicles), "d = {}", d);
                }
            }
        }
    }

    #[test]
    fn test_cooperative_time_to_collision() {
        let r = cooperative();
        // 20 m behind closing at 10 m/s is 2 s away
        let obs = obs_with(25.0, &[[-20.0, 4.0, 10.0, 0.0]]);
        let vehicles = obs.vehicles().iter().collect::<Vec<_>>();
        assert!(!r.is_lane_change_safe(&vehicles));
        assert!(selfish().is_lane_change_safe(&vehicles));
        // tiny speed differences never count
        let obs = obs_with(25.0, &[[-12.0, 4.0, 0.5, 0.0]]);
        let vehicles = obs.vehicles().iter().collect::<Vec<_>>();
        assert!(r.is_lane_change_safe(&vehicles));
    }

    #[test]
    fn test_choose_prefers_empty_lane() {
        let m = model();
        let r = selfish();
        // slow leader close ahead, left lane empty, right lane blocked
        let obs = obs_with(
            25.0,
            &[[20.0, 0.0, -5.0, 0.0], [5.0, 4.0, 0.0, 0.0]],
        );
        assert_eq!(r.choose(&m, &obs, 0), LaneChange::Left);
        assert_eq!(r.choose(&m, &obs, 2), LaneChange::Stay);
    }

    #[test]
    fn test_equal_benefits_stay() {
        let m = model();
        let r = selfish();
        let obs = obs_with(25.0, &[[20.0, 0.0, -5.0, 0.0]]);
        assert_eq!(r.choose(&m, &obs, 0), LaneChange::Stay);
    }

    #[test]
    fn test_outputs_are_lane_changes_only() {
        let m = model();
        let r = cooperative();
        for x in [-40.0, -5.0, 5.0, 20.0, 60.0] {
            for y in [-4.0, 0.0, 4.0] {
                let obs = obs_with(25.0, &[[x, y, -3.0, 0.0], [30.0, 0.0, -8.0, 0.0]]);
                let c = r.choose(&m, &obs, 0);
                assert!(matches!(c.action(), None | Some(Action::LaneLeft) | Some(Action::LaneRight)));
            }
        }
    }

    #[test]
    fn test_benefit_is_plain_utility_difference() {
        let m = model();
        // leader utility 0.1, left lane has only a fast follower (0.6),
        // right lane blocked: benefit 0.5 clears the 0.4 threshold even with
        // a fast follower behind
        let obs = obs_with(
            25.0,
            &[[20.0, 0.0, -2.0, 0.0], [-30.0, -4.0, 20.0, 0.0], [5.0, 4.0, 0.0, 0.0]],
        );
        assert_eq!(selfish().choose(&m, &obs, 0), LaneChange::Left);

        let mut params = Parameters::new().unwrap().lane_change;
        params.follower_courtesy = true;
        params.politeness = 0.3;
        let courteous = LaneChangeRule::selfish(&params);
        assert_eq!(courteous.choose(&m, &obs, 0), LaneChange::Stay);
    }

    #[test]
    fn test_aggressive_pass() {
        let mut params = Parameters::new().unwrap().lane_change;
        params.aggressive = true;
        let r = LaneChangeRule::selfish(&params);
        assert_abs_diff_eq!(r.safety.min_gap(), 8.0, epsilon = 1e-12);
        let obs = obs_with(25.0, &[[30.0, 0.0, 0.0, 0.0]]);
        assert!(r.wants_pass(obs.vehicles().first(), 25.0));
        assert!(!r.wants_pass(obs.vehicles().first(), 15.0));
        assert!(!selfish().wants_pass(obs.vehicles().first(), 25.0));
    }
}
