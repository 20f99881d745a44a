use crate::action::Action;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OvertakeState {
    #[default]
    None,
    Preparing,
    Executing,
    Completing,
}

/// Mutable per-run decision state, kept apart from the rules that read it.
/// Created once per ego vehicle at run start.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyState {
    pub step: u64,
    /// Headway the car-following rule uses this step.
    pub time_headway: f64,
    /// Seconds of yielding left.
    pub yield_timer: f64,
    pub lane_change_cooldown: u32,
    pub consecutive_through: u32,
    pub entry_cooldown: u32,
    pub overtake: OvertakeState,
    pub overtake_cooldown: u32,
    pub cautious_steps: u32,
    pub last_action: Option<Action>,
    /// Name of the overlay that decided the last step, if any.
    pub last_law: Option<&'static str>,
}

impl PolicyState {
    pub fn new(time_headway: f64) -> Self {
        Self {
            step: 0,
            time_headway,
            yield_timer: 0.0,
            lane_change_cooldown: 0,
            consecutive_through: 0,
            entry_cooldown: 0,
            overtake: OvertakeState::None,
            overtake_cooldown: 0,
            cautious_steps: 0,
            last_action: None,
            last_law: None,
        }
    }

    /// Advance all timers by one decision step.
    pub fn tick(&mut self, step_duration: f64) {
        self.step += 1;
        if self.yield_timer > 0.0 {
            self.yield_timer = (self.yield_timer - step_duration).max(0.0);
        }
        self.lane_change_cooldown = self.lane_change_cooldown.saturating_sub(1);
        self.entry_cooldown = self.entry_cooldown.saturating_sub(1);
        self.overtake_cooldown = self.overtake_cooldown.saturating_sub(1);
        self.last_law = None;
    }

    pub fn yielding(&self) -> bool {
        self.yield_timer > 0.0
    }

    /// Book-keeping once the step's action is final.
    pub fn record(&mut self, action: Action, lane_change_cooldown: u32) {
        match action {
            Action::Idle | Action::Faster => self.consecutive_through += 1,
            Action::Slower => self.consecutive_through = self.consecutive_through.saturating_sub(1),
            Action::LaneLeft | Action::LaneRight => {
                self.lane_change_cooldown = lane_change_cooldown;
            }
        }
        self.last_action = Some(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_timers_run_out() {
        let mut s = PolicyState::new(1.5);
        s.yield_timer = 0.05;
        s.entry_cooldown = 2;
        s.tick(1.0 / 30.0);
        assert!(s.yielding());
        assert_eq!(s.entry_cooldown, 1);
        s.tick(1.0 / 30.0);
        assert!(!s.yielding());
        assert_abs_diff_eq!(s.yield_timer, 0.0, epsilon = 1e-12);
        s.tick(1.0 / 30.0);
        assert_eq!(s.entry_cooldown, 0);
        assert_eq!(s.step, 3);
    }

    #[test]
    fn test_record_through_count() {
        let mut s = PolicyState::new(1.5);
        s.record(Action::Faster, 3);
        s.record(Action::Idle, 3);
        assert_eq!(s.consecutive_through, 2);
        s.record(Action::Slower, 3);
        s.record(Action::Slower, 3);
        s.record(Action::Slower, 3);
        assert_eq!(s.consecutive_through, 0);
        s.record(Action::LaneLeft, 3);
        assert_eq!(s.lane_change_cooldown, 3);
        assert_eq!(s.last_action, Some(Action::LaneLeft));
    }
}
