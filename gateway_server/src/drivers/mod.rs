pub mod sim;
pub mod traits;

#[cfg(feature = "cip")]
pub mod cip;
#[cfg(feature = "s7")]
pub mod s7;
#[cfg(feature = "beckhoff")]
pub mod beckhoff;

use crate::config::settings::PlcConfig;
use crate::tags::Family;
use std::sync::Arc;
use traits::{Driver, DriverError, DriverResult};

/// Builds the driver for one PLC. Injected into the manager so tests and the
/// stress binary can substitute scripted drivers.
pub type DriverFactory = Arc<dyn Fn(&PlcConfig) -> DriverResult<Arc<dyn Driver>> + Send + Sync>;

/// The production factory: one adapter per family, each behind its feature
/// gate; the sim family is always available.
pub fn create_driver(cfg: &PlcConfig) -> DriverResult<Arc<dyn Driver>> {
    match cfg.family {
        Family::Sim => Ok(Arc::new(sim::SimDriver::from_config(cfg))),
        Family::Logix | Family::Micro800 | Family::Omron => {
            #[cfg(feature = "cip")]
            {
                Ok(Arc::new(cip::CipDriver::new(cfg)?))
            }
            #[cfg(not(feature = "cip"))]
            {
                Err(DriverError::UnsupportedFamily(cfg.family.to_string()))
            }
        }
        Family::S7 => {
            #[cfg(feature = "s7")]
            {
                Ok(Arc::new(s7::S7Driver::new(cfg)?))
            }
            #[cfg(not(feature = "s7"))]
            {
                Err(DriverError::UnsupportedFamily(cfg.family.to_string()))
            }
        }
        Family::Beckhoff => {
            #[cfg(feature = "beckhoff")]
            {
                Ok(Arc::new(beckhoff::AdsDriver::new(cfg)?))
            }
            #[cfg(not(feature = "beckhoff"))]
            {
                Err(DriverError::UnsupportedFamily(cfg.family.to_string()))
            }
        }
    }
}

pub fn default_factory() -> DriverFactory {
    Arc::new(create_driver)
}

/// Families whose drivers can enumerate programs and tags. Others get a
/// synthesized inventory from configuration.
pub fn family_supports_discovery(family: Family) -> bool {
    matches!(family, Family::Logix | Family::Sim)
}
