use crate::{
    action::Action,
    arg_parameters::{CarFollowingParameters, DefensiveParameters},
    observation::ObservedVehicle,
};

/// Decision-level stand-in for the Intelligent Driver Model. It only picks
/// a discrete speed action; continuous acceleration is left to whatever
/// simulator applies the action.
#[derive(Clone, Debug, PartialEq)]
pub struct CarFollowingRule {
    pub min_spacing: f64,
    pub time_headway: f64,
    pub desired_velocity: f64,
    pub min_distance: f64,
    pub underspeed_factor: f64,
}

impl CarFollowingRule {
    pub fn new(params: &CarFollowingParameters) -> Self {
        Self {
            min_spacing: params.min_spacing,
            time_headway: params.time_headway,
            desired_velocity: params.desired_velocity,
            min_distance: params.min_distance,
            underspeed_factor: params.underspeed_factor,
        }
    }

    /// Larger headway, lower desired speed and wider spacing.
    pub fn defensive(params: &CarFollowingParameters, defensive: &DefensiveParameters) -> Self {
        Self {
            min_spacing: params.min_spacing * defensive.spacing_factor,
            time_headway: defensive.time_headway,
            desired_velocity: params.desired_velocity * defensive.speed_factor,
            ..Self::new(params)
        }
    }

    pub fn safe_distance(&self, ego_speed: f64, time_headway: f64) -> f64 {
        self.min_spacing + time_headway * ego_speed
    }

    pub fn is_under_speed(&self, ego_speed: f64) -> bool {
        ego_speed < self.underspeed_factor * self.desired_velocity
    }

    /// FASTER, SLOWER or IDLE for the current gap to `front`.
    pub fn choose(
        &self,
        ego_speed: f64,
        front: Option<&ObservedVehicle>,
        time_headway: f64,
    ) -> Action {
        let front = match front {
            Some(front) => front,
            None => {
                return if self.is_under_speed(ego_speed) {
                    Action::Faster
                } else {
                    Action::Idle
                };
            }
        };

        let dist = front.x.abs().max(self.min_distance);
        let safe_distance = self.safe_distance(ego_speed, time_headway);

        if dist < safe_distance {
            Action::Slower
        } else if dist > 2.0 * safe_distance && self.is_under_speed(ego_speed) {
            Action::Faster
        } else {
            Action::Idle
        }
    }
}

/// Continuous IDM used by the reference road to move background traffic.
// https://en.wikipedia.org/wiki/Intelligent_driver_model
#[derive(Clone, Debug, PartialEq)]
pub struct IntelligentDriver {
    pub preferred_accel: f64,
    pub braking_accel: f64,
    pub min_spacing: f64,
}

impl IntelligentDriver {
    pub fn new(params: &CarFollowingParameters) -> Self {
        Self {
            preferred_accel: params.max_accel,
            braking_accel: params.comfortable_decel,
            min_spacing: params.min_spacing,
        }
    }

    /// `lead` is the bumper gap and the leader's speed.
    pub fn accel(&self, vel: f64, target_vel: f64, time_headway: f64, lead: Option<(f64, f64)>) -> f64 {
        let accel_free_road = if target_vel <= 0.0 {
            if vel > 0.0 {
                -self.braking_accel
            } else {
                0.0
            }
        } else {
            self.preferred_accel * (1.0 - (vel / target_vel).powi(4))
        };

        let (gap, lead_vel) = match lead {
            Some(lead) => lead,
            None => return accel_free_road,
        };

        let approaching_rate = vel - lead_vel;
        let follow_dist = self.min_spacing + time_headway * vel;
        let spacing_term = (follow_dist
            + vel * approaching_rate / (2.0 * (self.preferred_accel * self.braking_accel).sqrt()))
        .max(0.0);
        let accel_interaction = -self.preferred_accel * (spacing_term / gap.max(0.1)).powi(2);

        let accel = accel_free_road + accel_interaction;
        if accel.is_finite() {
            accel
        } else {
            -self.braking_accel
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::tests::obs_with;
    use approx::assert_abs_diff_eq;

    fn rule() -> CarFollowingRule {
        CarFollowingRule {
            min_spacing: 2.0,
            time_headway: 1.5,
            desired_velocity: 30.0,
            min_distance: 2.0,
            underspeed_factor: 0.9,
        }
    }

    fn front_at(x: f64) -> ObservedVehicle {
        ObservedVehicle {
            index: 1,
            x,
            y: 0.0,
            vx: 0.0,
            vy: 0.0,
        }
    }

    #[test]
    fn test_free_road() {
        let r = rule();
        assert_eq!(r.choose(20.0, None, 1.5), Action::Faster);
        assert_eq!(r.choose(27.0, None, 1.5), Action::Idle);
    }

    #[test]
    fn test_following_bands() {
        let r = rule();
        // safe distance at 20 m/s is 32 m
        assert_eq!(r.choose(20.0, Some(&front_at(20.0)), 1.5), Action::Slower);
        assert_eq!(r.choose(20.0, Some(&front_at(50.0)), 1.5), Action::Idle);
        assert_eq!(r.choose(20.0, Some(&front_at(70.0)), 1.5), Action::Faster);
        // too fast to accelerate even with a big gap
        assert_eq!(r.choose(28.0, Some(&front_at(200.0)), 1.5), Action::Idle);
        // raising the headway turns a comfortable gap into a close one
        assert_eq!(r.choose(20.0, Some(&front_at(35.0)), 1.5), Action::Idle);
        assert_eq!(r.choose(20.0, Some(&front_at(35.0)), 2.0), Action::Slower);
    }

    #[test]
    fn test_only_speed_actions() {
        let r = rule();
        for speed in [0.0, 5.0, 15.0, 26.9, 27.0, 40.0] {
            for x in [0.1, 1.0, 10.0, 40.0, 100.0, 500.0] {
                let obs = obs_with(speed, &[[x, 0.0, 0.0, 0.0]]);
                let front = obs.vehicles().first();
                let a = r.choose(speed, front, 1.5);
                assert!(matches!(a, Action::Faster | Action::Slower | Action::Idle));
            }
        }
    }

    #[test]
    fn test_defensive_rule() {
        let params = crate::arg_parameters::Parameters::new().unwrap();
        let r = CarFollowingRule::defensive(&params.car_following, &params.defensive);
        assert_abs_diff_eq!(r.time_headway, 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r.desired_velocity, 18.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r.min_spacing, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_idm_accel() {
        let idm = IntelligentDriver {
            preferred_accel: 3.0,
            braking_accel: 3.0,
            min_spacing: 2.0,
        };
        assert_abs_diff_eq!(idm.accel(0.0, 30.0, 1.5, None), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(idm.accel(30.0, 30.0, 1.5, None), 0.0, epsilon = 1e-12);
        assert!(idm.accel(20.0, 30.0, 1.5, Some((10.0, 10.0))) < -3.0);
        assert!(idm.accel(20.0, 30.0, 1.5, Some((500.0, 20.0))) > 0.0);
    }
}
