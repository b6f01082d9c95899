//! Known real-world widths for the object classes the detector reports.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Can,
    Paper,
    Unknown(i64),
}

impl ObjectClass {
    pub fn from_id(class_id: i64) -> Self {
        match class_id {
            0 => Self::Can,
            1 => Self::Paper,
            other => Self::Unknown(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Can => "can",
            Self::Paper => "paper",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Physical width in meters of each known class, with a fallback for anything else.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectSizes {
    pub can: f64,
    pub paper: f64,
    pub fallback: f64,
}

impl Default for ObjectSizes {
    fn default() -> Self {
        Self {
            can: 0.17,
            paper: 0.10,
            fallback: 0.10,
        }
    }
}

impl ObjectSizes {
    pub fn width_for(&self, class: ObjectClass) -> f64 {
        match class {
            ObjectClass::Can => self.can,
            ObjectClass::Paper => self.paper,
            ObjectClass::Unknown(_) => self.fallback,
        }
    }

    pub fn width_for_id(&self, class_id: i64) -> f64 {
        self.width_for(ObjectClass::from_id(class_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ids_use_fallback() {
        let sizes = ObjectSizes {
            fallback: 0.25,
            ..ObjectSizes::default()
        };
        assert_eq!(sizes.width_for_id(0), 0.17);
        assert_eq!(sizes.width_for_id(1), 0.10);
        assert_eq!(sizes.width_for_id(9), 0.25);
        assert_eq!(ObjectClass::from_id(-3), ObjectClass::Unknown(-3));
    }
}
