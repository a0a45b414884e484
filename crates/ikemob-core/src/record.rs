//! Security-association records routed through the controller.

use crate::error::MigrationError;
use std::net::IpAddr;
use std::sync::Arc;

/// An established IKE SA, as seen by the connection layer
pub trait SaRecord: Send + Sync {
    /// SPI assigned by this end
    fn local_spi(&self) -> u64;

    /// Rebind the SA to a new address pair after a mobility event
    ///
    /// # Errors
    /// Returns `MigrationError` if the SA cannot move to the new pair
    fn migrate(&self, local: IpAddr, remote: IpAddr) -> Result<(), MigrationError>;
}

/// Entry of the registered SPI set
#[derive(Clone)]
pub enum Registration {
    /// SPI awaiting the IKE INIT response; no SA exists yet
    Pending,
    /// Established SA
    Established(Arc<dyn SaRecord>),
}

impl Registration {
    /// The SA, if established
    #[must_use]
    pub fn record(&self) -> Option<&Arc<dyn SaRecord>> {
        match self {
            Registration::Pending => None,
            Registration::Established(record) => Some(record),
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Registration::Pending => write!(f, "Pending"),
            Registration::Established(record) => {
                write!(f, "Established({:#018x})", record.local_spi())
            }
        }
    }
}
