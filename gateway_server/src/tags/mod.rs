pub mod value;

use serde::{Deserialize, Serialize};
use std::fmt;

/// PLC protocol family. Determines which driver adapter serves a PLC and
/// how tag names are normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Logix,
    Micro800,
    S7,
    Beckhoff,
    Omron,
    Sim,
}

impl Family {
    /// S7 and Omron addresses are case-insensitive on the device; lookups and
    /// display addresses are normalized to upper case for them. Logix and ADS
    /// names stay case-sensitive.
    pub fn case_insensitive(self) -> bool {
        matches!(self, Family::S7 | Family::Omron)
    }

    /// Canonical lookup key for a tag name under this family.
    pub fn normalize(self, name: &str) -> String {
        if self.case_insensitive() {
            name.to_uppercase()
        } else {
            name.to_string()
        }
    }

    /// Address as shown to consumers (REST, payloads).
    pub fn display_address(self, name: &str) -> String {
        self.normalize(name)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::Logix => "logix",
            Family::Micro800 => "micro800",
            Family::S7 => "s7",
            Family::Beckhoff => "beckhoff",
            Family::Omron => "omron",
            Family::Sim => "sim",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s7_and_omron_normalize_upper() {
        assert_eq!(Family::S7.normalize("db1.0"), "DB1.0");
        assert_eq!(Family::Omron.display_address("d100.5"), "D100.5");
        assert_eq!(Family::Logix.normalize("Program:Main.counter"), "Program:Main.counter");
        assert_eq!(Family::Beckhoff.normalize("MAIN.fValue"), "MAIN.fValue");
    }
}
