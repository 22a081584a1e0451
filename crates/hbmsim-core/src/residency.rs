use std::fmt;

use serde::{Deserialize, Serialize};

/// Memory tier a matrix currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Residency {
    /// High-bandwidth global memory. Large, slow, and where new matrices start.
    #[default]
    Hbm,
    /// On-chip shared memory. Every compute primitive runs here.
    Sram,
}

impl Residency {
    /// Whether this is the HBM tier.
    pub fn is_hbm(&self) -> bool {
        matches!(self, Residency::Hbm)
    }

    /// Whether this is the SRAM tier.
    pub fn is_sram(&self) -> bool {
        matches!(self, Residency::Sram)
    }
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::Hbm => write!(f, "hbm"),
            Residency::Sram => write!(f, "sram"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residency_properties() {
        assert!(Residency::Hbm.is_hbm());
        assert!(!Residency::Hbm.is_sram());
        assert!(Residency::Sram.is_sram());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Residency::Hbm), "hbm");
        assert_eq!(format!("{}", Residency::Sram), "sram");
    }

    #[test]
    fn test_default() {
        assert_eq!(Residency::default(), Residency::Hbm);
    }
}
