/// The decision vocabulary, in canonical index order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    LaneLeft,
    Idle,
    LaneRight,
    Faster,
    Slower,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::LaneLeft,
        Action::Idle,
        Action::LaneRight,
        Action::Faster,
        Action::Slower,
    ];

    pub fn index(self) -> usize {
        match self {
            Action::LaneLeft => 0,
            Action::Idle => 1,
            Action::LaneRight => 2,
            Action::Faster => 3,
            Action::Slower => 4,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Action::LaneLeft => "LANE_LEFT",
            Action::Idle => "IDLE",
            Action::LaneRight => "LANE_RIGHT",
            Action::Faster => "FASTER",
            Action::Slower => "SLOWER",
        }
    }

    pub fn is_lane_change(self) -> bool {
        matches!(self, Action::LaneLeft | Action::LaneRight)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LANE_LEFT" => Ok(Self::LaneLeft),
            "IDLE" => Ok(Self::Idle),
            "LANE_RIGHT" => Ok(Self::LaneRight),
            "FASTER" => Ok(Self::Faster),
            "SLOWER" => Ok(Self::Slower),
            _ => Err(format!("Invalid Action '{}'", s)),
        }
    }
}

pub const DEFAULT_DISCRETE_ACTIONS: [&str; 5] = ["IDLE", "LANE_LEFT", "LANE_RIGHT", "FASTER", "SLOWER"];
pub const LATERAL_DISCRETE_ACTIONS: [&str; 3] = ["IDLE", "LANE_LEFT", "LANE_RIGHT"];

/// What a simulator accepts as an action.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionSpace {
    /// `n` indexed actions, optionally with their semantic names.
    Discrete {
        n: usize,
        actions: Option<Vec<String>>,
    },
    /// Box bounds ordered `[steer, accel]`.
    Continuous { low: Vec<f64>, high: Vec<f64> },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EnvAction {
    Discrete(usize),
    Continuous { steer: f64, accel: f64 },
}

#[enum_dispatch]
#[derive(Clone, Debug, PartialEq)]
pub enum ActionAdapter {
    DiscreteActionAdapter,
    ContinuousActionAdapter,
}

/// Maps decisions onto a simulator's action space. `None` means the
/// policy produced nothing usable and the safe fallback is sent.
#[enum_dispatch(ActionAdapter)]
pub trait ActionAdapterTrait {
    fn translate(&self, action: Option<Action>) -> EnvAction;
}

impl ActionAdapter {
    pub fn for_space(space: &ActionSpace) -> Self {
        match space {
            ActionSpace::Discrete { n, actions } => {
                ActionAdapter::DiscreteActionAdapter(DiscreteActionAdapter::new(*n, actions.as_deref()))
            }
            ActionSpace::Continuous { low, high } => {
                ActionAdapter::ContinuousActionAdapter(ContinuousActionAdapter::new(low, high))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiscreteActionAdapter {
    /// simulator index for each canonical action, if the simulator has it
    mapping: [Option<usize>; 5],
    fallback: usize,
}

impl DiscreteActionAdapter {
    pub fn new(n: usize, actions: Option<&[String]>) -> Self {
        let names: Vec<String> = match actions {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ if n == 3 => LATERAL_DISCRETE_ACTIONS.iter().map(|s| s.to_string()).collect(),
            _ if n >= 5 => DEFAULT_DISCRETE_ACTIONS.iter().map(|s| s.to_string()).collect(),
            _ => DEFAULT_DISCRETE_ACTIONS.iter().map(|s| s.to_string()).collect(),
        };

        let find = |action: Action| {
            names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(action.name()))
                .filter(|i| n == 0 || *i < n)
        };

        let mut mapping = [None; 5];
        for action in Action::ALL {
            mapping[action.index()] = find(action);
        }
        let fallback = mapping[Action::Idle.index()].unwrap_or(0);

        Self { mapping, fallback }
    }

    pub fn supports(&self, action: Action) -> bool {
        self.mapping[action.index()].is_some()
    }
}

impl ActionAdapterTrait for DiscreteActionAdapter {
    fn translate(&self, action: Option<Action>) -> EnvAction {
        let i = action
            .and_then(|a| self.mapping[a.index()])
            .unwrap_or(self.fallback);
        EnvAction::Discrete(i)
    }
}

const CONTINUOUS_ACTION_SCALE: f64 = 0.7;

#[derive(Clone, Debug, PartialEq)]
pub struct ContinuousActionAdapter {
    steer_min: f64,
    steer_max: f64,
    accel_min: f64,
    accel_max: f64,
}

impl ContinuousActionAdapter {
    pub fn new(low: &[f64], high: &[f64]) -> Self {
        let valid = low.len() >= 2
            && high.len() >= 2
            && low.iter().chain(high.iter()).all(|v| v.is_finite())
            && low[0] < high[0]
            && low[1] < high[1];
        if valid {
            Self {
                steer_min: low[0],
                steer_max: high[0],
                accel_min: low[1],
                accel_max: high[1],
            }
        } else {
            Self {
                steer_min: -1.0,
                steer_max: 1.0,
                accel_min: -1.0,
                accel_max: 1.0,
            }
        }
    }
}

impl ActionAdapterTrait for ContinuousActionAdapter {
    fn translate(&self, action: Option<Action>) -> EnvAction {
        let (steer, accel) = match action {
            Some(Action::LaneLeft) => (self.steer_min * CONTINUOUS_ACTION_SCALE, 0.0),
            Some(Action::LaneRight) => (self.steer_max * CONTINUOUS_ACTION_SCALE, 0.0),
            Some(Action::Faster) => (0.0, self.accel_max * CONTINUOUS_ACTION_SCALE),
            Some(Action::Slower) => (0.0, self.accel_min * CONTINUOUS_ACTION_SCALE),
            Some(Action::Idle) | None => (0.0, 0.0),
        };
        EnvAction::Continuous { steer, accel }
    }
}
