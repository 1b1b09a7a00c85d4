// winnat - Windows NAT port mappings through netsh and the NetNat cmdlets

pub mod command;
pub mod config;
pub mod drivers;
pub mod error;
pub mod mapping;
pub mod powershell;

pub use drivers::{
    DriverConfig, NatDriver, create_driver, create_driver_with_runner, detect_drivers,
};
pub use error::{NatError, Result};
pub use mapping::PortMapping;
