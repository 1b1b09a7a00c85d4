// NAT driver trait, configuration helpers and factory

use crate::command::{CommandRunner, SystemCommandRunner};
use crate::error::{NatError, Result};
use crate::mapping::PortMapping;
use serde_json::Value;

#[cfg(feature = "driver-netsh")]
pub mod netsh;

#[cfg(feature = "driver-winnat")]
pub mod winnat;

#[cfg(feature = "driver-netsh")]
pub use netsh::{BatchMode, NETSH_DRIVER_NAME, NetshDriver};

#[cfg(feature = "driver-winnat")]
pub use winnat::{WINNAT_DRIVER_NAME, WinNatDriver, WinNatPortMapping};

/// Driver configuration: string keys to loosely typed values
pub type DriverConfig = serde_json::Map<String, Value>;

/// Required key naming the NAT-capable adapter(s)
pub const NAT_ADAPTER_KEY: &str = "NatAdapter";

/// Port mapping driver
///
/// Callers depend only on this trait. Every method blocks until the
/// underlying OS tool exits.
pub trait NatDriver: Send {
    /// Driver name as registered with the factory (e.g. "Netsh")
    fn name(&self) -> &'static str;

    /// Read configuration and probe that NAT is usable
    fn init(&mut self, config: &DriverConfig) -> Result<()>;

    /// Create a single mapping
    fn create_port_mapping(&self, mapping: PortMapping) -> Result<PortMapping> {
        self.create_port_mappings(std::slice::from_ref(&mapping))?;
        Ok(mapping)
    }

    /// Create every mapping; an empty slice is a no-op
    fn create_port_mappings(&self, mappings: &[PortMapping]) -> Result<()>;

    /// List the mappings currently configured
    fn list_port_mapping(&self) -> Result<Vec<PortMapping>>;

    /// Delete the mapping matching protocol + external IP/port
    fn delete_port_mapping(&self, mapping: &PortMapping) -> Result<()> {
        self.delete_port_mappings(std::slice::from_ref(mapping))
    }

    /// Delete every mapping; an empty slice is a no-op
    fn delete_port_mappings(&self, mappings: &[PortMapping]) -> Result<()>;

    /// Delete every configured mapping, returning how many there were
    fn clear_port_mappings(&self) -> Result<usize> {
        let existing = self.list_port_mapping()?;
        self.delete_port_mappings(&existing)?;
        Ok(existing.len())
    }

    /// Release driver-held resources
    fn destroy(&mut self) -> Result<()>;
}

/// Driver metadata for listing
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub available: bool,
}

/// Resolve the `NatAdapter` value into adapter names
///
/// Accepts a comma-separated string or a pre-resolved adapter handle
/// (an object carrying a `name` string).
pub fn adapter_names(config: &DriverConfig) -> Result<Vec<String>> {
    let value = config
        .get(NAT_ADAPTER_KEY)
        .ok_or(NatError::MissingConfig(NAT_ADAPTER_KEY))?;

    let names: Vec<String> = match value {
        Value::String(list) => list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect(),
        Value::Object(handle) => match handle.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => {
                vec![name.trim().to_string()]
            }
            _ => {
                return Err(NatError::InvalidConfig {
                    key: NAT_ADAPTER_KEY,
                    reason: "adapter handle has no name".to_string(),
                });
            }
        },
        other => {
            return Err(NatError::InvalidConfig {
                key: NAT_ADAPTER_KEY,
                reason: format!("unsupported value type {}", value_kind(other)),
            });
        }
    };

    if names.is_empty() {
        return Err(NatError::InvalidConfig {
            key: NAT_ADAPTER_KEY,
            reason: "no adapter name given".to_string(),
        });
    }

    // cmd.exe has no way to quote `"` or `%`
    if let Some(name) = names
        .iter()
        .find(|name| name.contains(['"', '%']) || name.contains(char::is_control))
    {
        return Err(NatError::InvalidConfig {
            key: NAT_ADAPTER_KEY,
            reason: format!("adapter name {:?} contains a reserved character", name),
        });
    }

    Ok(names)
}

/// Read an optional string key
pub fn optional_string<'a>(config: &'a DriverConfig, key: &'static str) -> Result<Option<&'a str>> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(NatError::InvalidConfig {
            key,
            reason: format!("expected a string, got {}", value_kind(other)),
        }),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Every driver compiled into this build
pub fn detect_drivers() -> Vec<DriverInfo> {
    let mut drivers = Vec::new();

    #[cfg(feature = "driver-netsh")]
    {
        drivers.push(DriverInfo {
            name: NETSH_DRIVER_NAME,
            description: "netsh routing ip nat (Routing and Remote Access)",
            available: NetshDriver::is_available(),
        });
    }

    #[cfg(feature = "driver-winnat")]
    {
        drivers.push(DriverInfo {
            name: WINNAT_DRIVER_NAME,
            description: "NetNat static mappings via PowerShell",
            available: WinNatDriver::is_available(),
        });
    }

    drivers
}

/// Create and initialize a driver by name
pub fn create_driver(name: &str, config: &DriverConfig) -> Result<Box<dyn NatDriver>> {
    create_driver_with_runner(name, config, Box::new(SystemCommandRunner))
}

/// Create and initialize a driver by name, spawning processes through `runner`
pub fn create_driver_with_runner(
    name: &str,
    config: &DriverConfig,
    runner: Box<dyn CommandRunner>,
) -> Result<Box<dyn NatDriver>> {
    log::debug!("Creating NAT driver {name}");

    let mut driver: Box<dyn NatDriver> = match name {
        #[cfg(feature = "driver-netsh")]
        n if n.eq_ignore_ascii_case(NETSH_DRIVER_NAME) => {
            Box::new(NetshDriver::with_runner(runner))
        }

        #[cfg(feature = "driver-winnat")]
        n if n.eq_ignore_ascii_case(WINNAT_DRIVER_NAME) => {
            Box::new(WinNatDriver::with_runner(runner))
        }

        _ => {
            drop(runner);
            return Err(NatError::UnsupportedDriver(name.to_string()));
        }
    };

    driver.init(config)?;
    log::info!("Initialized NAT driver {}", driver.name());
    Ok(driver)
}
