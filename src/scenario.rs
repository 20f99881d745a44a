use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    Highway,
    Merge,
    Intersection,
    Roundabout,
    Racetrack,
    ParkingLot,
}

impl ScenarioKind {
    /// Classify a free-form scenario name such as "dense_merge" or
    /// "Roundabout-4way". Unrecognised names are treated as highway.
    pub fn detect(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("merge") {
            Self::Merge
        } else if name.contains("intersection") {
            Self::Intersection
        } else if name.contains("roundabout") {
            Self::Roundabout
        } else if name.contains("racetrack") {
            Self::Racetrack
        } else if name.contains("parking") {
            Self::ParkingLot
        } else {
            Self::Highway
        }
    }

    pub fn is_merge(self) -> bool {
        self == Self::Merge
    }

    /// Scenarios whose observations are centred on a conflict zone.
    pub fn has_conflict_zone(self) -> bool {
        matches!(self, Self::Intersection | Self::Roundabout)
    }
}

impl std::fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Highway => write!(f, "highway"),
            Self::Merge => write!(f, "merge"),
            Self::Intersection => write!(f, "intersection"),
            Self::Roundabout => write!(f, "roundabout"),
            Self::Racetrack => write!(f, "racetrack"),
            Self::ParkingLot => write!(f, "parking_lot"),
        }
    }
}

impl std::str::FromStr for ScenarioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "highway" => Ok(Self::Highway),
            "merge" => Ok(Self::Merge),
            "intersection" => Ok(Self::Intersection),
            "roundabout" => Ok(Self::Roundabout),
            "racetrack" => Ok(Self::Racetrack),
            "parking_lot" | "parking" => Ok(Self::ParkingLot),
            _ => Err(format!("Invalid ScenarioKind '{}'", s)),
        }
    }
}
