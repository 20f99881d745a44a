use std::f64::consts::FRAC_PI_4;

use parry2d_f64::{
    na::{self, Isometry2},
    shape::Cuboid,
};

use crate::environment::{DriverProfile, LaneIndex, VehicleId, VehicleState};

pub const MAX_STEER: f64 = 0.6;
/// Proportional gains of the meta-action controller.
pub const KP_SPEED: f64 = 1.0 / 0.6;
pub const KP_LATERAL: f64 = 1.0 / 0.6;
pub const KP_HEADING: f64 = 1.0 / 0.2;

#[derive(Clone, Debug)]
pub struct Car {
    pub id: VehicleId,
    pub crashed: bool,

    // front-referenced kinematic bicycle model
    x: f64,
    y: f64,
    theta: f64,
    pub vel: f64,
    pub steer: f64,

    pub width: f64,
    pub length: f64,

    // "attitude" of background drivers; none for the ego
    pub profile: Option<DriverProfile>,
    pub preferred_vel: f64,

    // current goals
    pub target_vel: f64,
    pub target_lane: usize,

    /// Acceleration applied during the last physics substep.
    pub accel: Option<f64>,

    // cached
    shape: Cuboid,
    pose: Isometry2<f64>,
}

impl Car {
    pub fn new(id: VehicleId, x: f64, y: f64, vel: f64, width: f64, length: f64) -> Self {
        let mut car = Self {
            id,
            crashed: false,

            x,
            y,
            theta: 0.0,
            vel,
            steer: 0.0,

            width,
            length,

            profile: None,
            preferred_vel: vel,

            target_vel: vel,
            target_lane: 0,

            accel: None,

            shape: Cuboid::new(na::Vector2::new(length / 2.0, width / 2.0)),
            pose: Isometry2::identity(),
        };

        car.update_geometry_cache();
        car
    }

    fn update_geometry_cache(&mut self) {
        let [center_x, center_y] = self.center();
        self.pose = Isometry2::new(na::Vector2::new(center_x, center_y), self.theta);
    }

    pub fn update(&mut self, dt: f64) {
        if !self.crashed {
            let theta = self.theta + self.steer;
            self.x += theta.cos() * self.vel * dt;
            self.y += theta.sin() * self.vel * dt;
            self.theta += self.vel * self.steer.sin() / self.length * dt;

            self.update_geometry_cache();
        }
    }

    /// Speed controller toward `target_vel`, clamped to the given bounds.
    pub fn speed_control(&self, max_accel: f64, max_braking: f64) -> f64 {
        (KP_SPEED * (self.target_vel - self.vel)).clamp(-max_braking, max_accel)
    }

    /// Steering that tracks the centre line at `lane_y`.
    pub fn steer_toward(&self, lane_y: f64) -> f64 {
        let speed = self.vel.max(1.0);
        let lateral_speed = KP_LATERAL * (lane_y - self.y);
        let heading_ref = (lateral_speed / speed).clamp(-1.0, 1.0).asin().clamp(-FRAC_PI_4, FRAC_PI_4);
        let heading_rate = KP_HEADING * (heading_ref - self.theta);
        let steer = (heading_rate * self.length / speed).clamp(-1.0, 1.0).asin();
        steer.clamp(-MAX_STEER, MAX_STEER)
    }

    pub fn velocity(&self) -> [f64; 2] {
        [self.vel * self.theta.cos(), self.vel * self.theta.sin()]
    }

    pub fn center(&self) -> [f64; 2] {
        [
            self.x - self.length / 2.0 * self.theta.cos(),
            self.y - self.length / 2.0 * self.theta.sin(),
        ]
    }

    pub fn state(&self, lane_index: Option<LaneIndex>) -> VehicleState {
        VehicleState {
            id: self.id,
            position: self.center(),
            heading: self.theta,
            speed: self.vel,
            length: self.length,
            crashed: self.crashed,
            lane_index,
            acceleration: self.accel,
            profile: self.profile,
        }
    }

    pub fn shape(&self) -> Cuboid {
        self.shape
    }

    /// Box grown by `clearance` front and back, for spawn placement.
    pub fn padded_shape(&self, clearance: f64) -> Cuboid {
        Cuboid::new(na::Vector2::new(
            self.length / 2.0 + clearance / 2.0,
            self.width / 2.0,
        ))
    }

    pub fn pose(&self) -> Isometry2<f64> {
        self.pose
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn set_x(&mut self, x: f64) {
        self.x = x;
        self.update_geometry_cache();
    }

    pub fn set_y(&mut self, y: f64) {
        self.y = y;
        self.update_geometry_cache();
    }

    #[allow(unused)]
    pub fn set_theta(&mut self, theta: f64) {
        self.theta = theta;
        self.update_geometry_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_straight_motion_and_center() {
        let mut car = Car::new(1, 10.0, 4.0, 20.0, 2.0, 5.0);
        assert_abs_diff_eq!(car.center()[0], 7.5, epsilon = 1e-12);
        car.update(0.5);
        assert_abs_diff_eq!(car.x(), 20.0, epsilon = 1e-12);
        assert_abs_diff_eq!(car.y(), 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(car.pose().translation.vector.x, 17.5, epsilon = 1e-12);
    }

    #[test]
    fn test_crashed_car_stays_put() {
        let mut car = Car::new(1, 10.0, 0.0, 20.0, 2.0, 5.0);
        car.crashed = true;
        car.update(1.0);
        assert_abs_diff_eq!(car.x(), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_speed_control_saturates() {
        let mut car = Car::new(0, 0.0, 0.0, 20.0, 2.0, 5.0);
        car.target_vel = 30.0;
        assert_abs_diff_eq!(car.speed_control(5.0, 8.0), 5.0, epsilon = 1e-12);
        car.target_vel = 19.0;
        assert_abs_diff_eq!(car.speed_control(5.0, 8.0), -1.0 / 0.6, epsilon = 1e-12);
    }

    #[test]
    fn test_lane_tracking_converges() {
        let mut car = Car::new(0, 0.0, 0.0, 20.0, 2.0, 5.0);
        for _ in 0..150 {
            car.steer = car.steer_toward(4.0);
            car.update(1.0 / 15.0);
        }
        assert_abs_diff_eq!(car.y(), 4.0, epsilon = 0.2);
        assert_abs_diff_eq!(car.theta(), 0.0, epsilon = 0.05);
    }
}
