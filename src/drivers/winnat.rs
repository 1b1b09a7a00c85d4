// WinNAT driver (NetNat static mappings through PowerShell)
//
// Uses:
// - Get-NetNatStaticMapping to list rules of one NetNat instance
// - New-NetNatStaticMapping / Remove-NetNatStaticMapping to change them
//
// Rules are identified by StaticMappingID, which becomes PortMapping::external_id.
// Batches attempt every rule and report the last error.

use super::{DriverConfig, NatDriver, optional_string};
use crate::command::CommandRunner;
use crate::error::{NatError, Result};
use crate::mapping::PortMapping;
use crate::powershell::record::{
    decode_bool, decode_cidr, decode_ip, decode_uint, encode_bool, encode_str,
};
use crate::powershell::{
    Access, FieldSpec, LocalPowershell, PowershellBatch, PowershellRecord, PowershellShell,
    parse_row, parse_rows, to_powershell_string,
};
use ipnet::IpNet;
use std::net::IpAddr;

pub const WINNAT_DRIVER_NAME: &str = "WinNAT";

/// Optional key naming the NetNat instance
pub const NAT_NAME_KEY: &str = "NatName";

/// Optional key for the remote prefix given to new mappings
pub const REMOTE_PREFIX_KEY: &str = "RemoteExternalIPAddressPrefix";

pub const DEFAULT_NAT_NAME: &str = "rancher";
const DEFAULT_REMOTE_PREFIX: &str = "0.0.0.0/0";

/// A NetNat static mapping as printed by `format-list -Property *`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WinNatPortMapping {
    pub protocol: String,
    pub active: Option<bool>,
    pub caption: String,
    pub description: String,
    pub element_name: String,
    pub instance_id: String,
    pub external_ip_address: Option<IpAddr>,
    pub external_port: u32,
    pub internal_ip_address: Option<IpAddr>,
    pub internal_port: u32,
    pub internal_routing_domain_id: String,
    pub nat_name: String,
    pub remote_external_ip_address_prefix: Option<IpNet>,
    pub static_mapping_id: u64,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| encode_str(value))
}

impl PowershellRecord for WinNatPortMapping {
    const FIELDS: &'static [FieldSpec<Self>] = &[
        FieldSpec {
            name: "Protocol",
            wire_key: "Protocol",
            access: Access::GetSet,
            encode: |r| non_empty(&r.protocol),
            decode: |r, v| {
                r.protocol = v.to_string();
                Ok(())
            },
        },
        FieldSpec {
            name: "Active",
            wire_key: "Active",
            access: Access::GetSet,
            encode: |r| r.active.map(encode_bool),
            decode: |r, v| {
                r.active = Some(decode_bool("Active", v)?);
                Ok(())
            },
        },
        FieldSpec {
            name: "Caption",
            wire_key: "Caption",
            access: Access::Get,
            encode: |r| non_empty(&r.caption),
            decode: |r, v| {
                r.caption = v.to_string();
                Ok(())
            },
        },
        FieldSpec {
            name: "Description",
            wire_key: "Description",
            access: Access::Get,
            encode: |r| non_empty(&r.description),
            decode: |r, v| {
                r.description = v.to_string();
                Ok(())
            },
        },
        FieldSpec {
            name: "ElementName",
            wire_key: "ElementName",
            access: Access::Get,
            encode: |r| non_empty(&r.element_name),
            decode: |r, v| {
                r.element_name = v.to_string();
                Ok(())
            },
        },
        FieldSpec {
            name: "InstanceID",
            wire_key: "InstanceID",
            access: Access::Get,
            encode: |r| non_empty(&r.instance_id),
            decode: |r, v| {
                r.instance_id = v.to_string();
                Ok(())
            },
        },
        FieldSpec {
            name: "ExternalIPAddress",
            wire_key: "ExternalIPAddress",
            access: Access::GetSet,
            encode: |r| r.external_ip_address.map(|ip| ip.to_string()),
            decode: |r, v| {
                r.external_ip_address = Some(decode_ip("ExternalIPAddress", v)?);
                Ok(())
            },
        },
        FieldSpec {
            name: "ExternalPort",
            wire_key: "ExternalPort",
            access: Access::GetSet,
            encode: |r| Some(r.external_port.to_string()),
            decode: |r, v| {
                r.external_port = decode_uint("ExternalPort", v)?;
                Ok(())
            },
        },
        FieldSpec {
            name: "InternalIPAddress",
            wire_key: "InternalIPAddress",
            access: Access::GetSet,
            encode: |r| r.internal_ip_address.map(|ip| ip.to_string()),
            decode: |r, v| {
                r.internal_ip_address = Some(decode_ip("InternalIPAddress", v)?);
                Ok(())
            },
        },
        FieldSpec {
            name: "InternalPort",
            wire_key: "InternalPort",
            access: Access::GetSet,
            encode: |r| Some(r.internal_port.to_string()),
            decode: |r, v| {
                r.internal_port = decode_uint("InternalPort", v)?;
                Ok(())
            },
        },
        FieldSpec {
            name: "InternalRoutingDomainId",
            wire_key: "InternalRoutingDomainId",
            access: Access::GetSet,
            encode: |r| non_empty(&r.internal_routing_domain_id),
            decode: |r, v| {
                r.internal_routing_domain_id = v.to_string();
                Ok(())
            },
        },
        FieldSpec {
            name: "NatName",
            wire_key: "NatName",
            access: Access::Get,
            encode: |r| non_empty(&r.nat_name),
            decode: |r, v| {
                r.nat_name = v.to_string();
                Ok(())
            },
        },
        FieldSpec {
            name: "RemoteExternalIPAddressPrefix",
            wire_key: "RemoteExternalIPAddressPrefix",
            access: Access::GetSet,
            encode: |r| r.remote_external_ip_address_prefix.map(|p| p.to_string()),
            decode: |r, v| {
                r.remote_external_ip_address_prefix =
                    Some(decode_cidr("RemoteExternalIPAddressPrefix", v)?);
                Ok(())
            },
        },
        FieldSpec {
            name: "StaticMappingID",
            wire_key: "StaticMappingID",
            access: Access::Get,
            encode: |r| Some(r.static_mapping_id.to_string()),
            decode: |r, v| {
                r.static_mapping_id = decode_uint("StaticMappingID", v)?;
                Ok(())
            },
        },
    ];
}

fn valid_port(port: u32) -> bool {
    (1..=u16::MAX as u32).contains(&port)
}

impl WinNatPortMapping {
    /// Build a creation request for `mapping` on the NetNat instance `nat_name`
    pub fn from_port_mapping(
        mapping: &PortMapping,
        nat_name: &str,
        remote_prefix: Option<IpNet>,
    ) -> Self {
        Self {
            protocol: mapping.protocol.to_uppercase(),
            external_ip_address: Some(mapping.external_ip),
            external_port: mapping.external_port.into(),
            internal_ip_address: Some(mapping.internal_ip),
            internal_port: mapping.internal_port.into(),
            nat_name: nat_name.to_string(),
            remote_external_ip_address_prefix: remote_prefix,
            ..Default::default()
        }
    }

    /// Convert back to the driver-neutral record; StaticMappingID becomes external_id
    pub fn to_port_mapping(&self) -> Result<PortMapping> {
        let port = |field: &'static str, value: u32| {
            u16::try_from(value)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    NatError::invalid_field(field, format!("{} is not a valid port", value))
                })
        };
        let ip = |field: &'static str, value: Option<IpAddr>| {
            value.ok_or_else(|| NatError::invalid_field(field, "address missing"))
        };

        Ok(PortMapping {
            external_id: self.static_mapping_id.to_string(),
            external_ip: ip("ExternalIPAddress", self.external_ip_address)?,
            external_port: port("ExternalPort", self.external_port)?,
            internal_ip: ip("InternalIPAddress", self.internal_ip_address)?,
            internal_port: port("InternalPort", self.internal_port)?,
            protocol: self.protocol.clone(),
        })
    }

    /// Check the fields New-NetNatStaticMapping needs
    pub fn validate_new(&self) -> Result<()> {
        if self.nat_name.is_empty() {
            return Err(NatError::invalid_field(
                "NatName",
                "NatName is required for adding rule",
            ));
        }
        if self.remote_external_ip_address_prefix.is_none() {
            return Err(NatError::invalid_field(
                "RemoteExternalIPAddressPrefix",
                "RemoteExternalIPAddressPrefix is required for adding rule",
            ));
        }
        if !valid_port(self.internal_port) {
            return Err(NatError::invalid_field("InternalPort", "InternalPort is not valid"));
        }
        if !valid_port(self.external_port) {
            return Err(NatError::invalid_field("ExternalPort", "ExternalPort is not valid"));
        }
        match self.internal_ip_address {
            Some(ip) if !ip.is_unspecified() => Ok(()),
            _ => Err(NatError::invalid_field(
                "InternalIPAddress",
                "InternalIPAddress is required for adding rule",
            )),
        }
    }

    /// `New-NetNatStaticMapping` command for this rule
    pub fn add_command(&self) -> Result<String> {
        self.validate_new()?;
        Ok(format!(
            "New-NetNatStaticMapping -NatName {}{} | format-list -Property *",
            encode_str(&self.nat_name),
            to_powershell_string(self)
        ))
    }

    /// Command removing this rule by StaticMappingID
    pub fn delete_command(&self) -> Result<String> {
        if self.static_mapping_id == 0 {
            return Err(NatError::invalid_field(
                "StaticMappingID",
                "StaticMappingID is not valid",
            ));
        }
        Ok(format!(
            "Get-NetNatStaticMapping -StaticMappingID {} | Remove-NetNatStaticMapping -Confirm:$false",
            self.static_mapping_id
        ))
    }

    /// Create this rule and return the object PowerShell reports back
    pub fn add(&self, shell: &dyn PowershellShell) -> Result<WinNatPortMapping> {
        let command = self.add_command()?;
        let (output, _) = shell.execute(&command)?;
        parse_row(&output)
    }

    pub fn delete(&self, shell: &dyn PowershellShell) -> Result<()> {
        let command = self.delete_command()?;
        shell.execute(&command)?;
        Ok(())
    }

    /// Same forwarding rule: protocol plus both endpoints
    pub fn same_rule(&self, other: &WinNatPortMapping) -> bool {
        self.protocol.eq_ignore_ascii_case(&other.protocol)
            && self.external_ip_address == other.external_ip_address
            && self.external_port == other.external_port
            && self.internal_ip_address == other.internal_ip_address
            && self.internal_port == other.internal_port
    }
}

fn list_command(nat_name: &str) -> String {
    format!(
        "Get-NetNatStaticMapping -NatName {} -ErrorAction SilentlyContinue | Sort-Object -Property StaticMappingID | format-list -Property *",
        encode_str(nat_name)
    )
}

/// All static mappings of the NetNat instance `nat_name`, ordered by id
pub fn list_local_port_mappings(
    shell: &dyn PowershellShell,
    nat_name: &str,
) -> Result<Vec<WinNatPortMapping>> {
    let (output, _) = shell.execute(&list_command(nat_name))?;
    parse_rows(&output)
}

/// Remove every static mapping of the NetNat instance `nat_name`
pub fn remove_local_port_mappings(shell: &dyn PowershellShell, nat_name: &str) -> Result<()> {
    shell.execute(&format!(
        "Get-NetNatStaticMapping -NatName {} -ErrorAction SilentlyContinue | Remove-NetNatStaticMapping -Confirm:$false",
        encode_str(nat_name)
    ))?;
    Ok(())
}

/// NetNat-backed NAT driver
pub struct WinNatDriver {
    shell: Box<dyn PowershellShell>,
    nat_name: String,
    // set by init
    remote_prefix: Option<IpNet>,
}

impl WinNatDriver {
    pub fn new() -> Self {
        Self::with_shell(Box::new(LocalPowershell::new()))
    }

    pub fn with_runner(runner: Box<dyn CommandRunner>) -> Self {
        Self::with_shell(Box::new(LocalPowershell::with_runner(runner)))
    }

    pub fn with_shell(shell: Box<dyn PowershellShell>) -> Self {
        Self {
            shell,
            nat_name: DEFAULT_NAT_NAME.to_string(),
            remote_prefix: None,
        }
    }

    pub fn is_available() -> bool {
        LocalPowershell::is_available()
    }

    pub fn nat_name(&self) -> &str {
        &self.nat_name
    }

    fn request(&self, mapping: &PortMapping) -> Result<WinNatPortMapping> {
        mapping.validate()?;
        Ok(WinNatPortMapping::from_port_mapping(
            mapping,
            &self.nat_name,
            self.remote_prefix,
        ))
    }

    fn list_rules(&self) -> Result<Vec<WinNatPortMapping>> {
        list_local_port_mappings(self.shell.as_ref(), &self.nat_name)
    }
}

impl Default for WinNatDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NatDriver for WinNatDriver {
    fn name(&self) -> &'static str {
        WINNAT_DRIVER_NAME
    }

    fn init(&mut self, config: &DriverConfig) -> Result<()> {
        if let Some(name) = optional_string(config, NAT_NAME_KEY)? {
            if name.trim().is_empty() {
                return Err(NatError::InvalidConfig {
                    key: NAT_NAME_KEY,
                    reason: "empty NAT name".to_string(),
                });
            }
            self.nat_name = name.trim().to_string();
        }

        let prefix = optional_string(config, REMOTE_PREFIX_KEY)?.unwrap_or(DEFAULT_REMOTE_PREFIX);
        let remote_prefix = decode_cidr(REMOTE_PREFIX_KEY, prefix).map_err(|e| {
            NatError::InvalidConfig {
                key: REMOTE_PREFIX_KEY,
                reason: e.to_string(),
            }
        })?;
        self.remote_prefix = Some(remote_prefix);

        log::info!(
            "WinNAT driver using NetNat {:?}, remote prefix {}",
            self.nat_name,
            remote_prefix
        );

        let probe = format!("Get-NetNat -Name {} | Out-Null", encode_str(&self.nat_name));
        self.shell
            .execute(&probe)
            .and_then(|_| self.list_rules())
            .map_err(|e| NatError::NotConfigured(Box::new(e)))?;
        Ok(())
    }

    fn create_port_mapping(&self, mapping: PortMapping) -> Result<PortMapping> {
        let created = self.request(&mapping)?.add(self.shell.as_ref())?;
        log::info!("Created NetNat mapping {} ({})", created.static_mapping_id, mapping);
        Ok(PortMapping {
            external_id: created.static_mapping_id.to_string(),
            ..mapping
        })
    }

    fn create_port_mappings(&self, mappings: &[PortMapping]) -> Result<()> {
        if mappings.is_empty() {
            return Ok(());
        }

        let commands = mappings
            .iter()
            .map(|m| self.request(m)?.add_command())
            .collect::<Result<Vec<_>>>()?;

        let mut batch = PowershellBatch::new(self.shell.as_ref());
        for command in commands {
            batch.append(command);
        }
        let count = batch.execute_each()?;
        log::info!("Created {} NetNat mapping(s) on {}", count, self.nat_name);
        Ok(())
    }

    fn list_port_mapping(&self) -> Result<Vec<PortMapping>> {
        self.list_rules()?
            .iter()
            .map(WinNatPortMapping::to_port_mapping)
            .collect()
    }

    fn delete_port_mappings(&self, mappings: &[PortMapping]) -> Result<()> {
        if mappings.is_empty() {
            return Ok(());
        }

        let existing = self.list_rules()?;
        let mut removed = 0;
        let mut last_error = None;

        for mapping in mappings {
            let rule = existing.iter().find(|rule| {
                rule.to_port_mapping()
                    .map(|m| m.same_external(mapping))
                    .unwrap_or(false)
            });

            let result = match rule {
                Some(rule) => rule.delete(self.shell.as_ref()),
                None => Err(NatError::MappingNotFound(mapping.to_string())),
            };

            match result {
                Ok(()) => removed += 1,
                Err(e) => {
                    log::warn!("Removing {} from {}: {}", mapping, self.nat_name, e);
                    last_error = Some(e);
                }
            }
        }

        log::info!("Removed {} NetNat mapping(s) from {}", removed, self.nat_name);
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn clear_port_mappings(&self) -> Result<usize> {
        let count = self.list_rules()?.len();
        remove_local_port_mappings(self.shell.as_ref(), &self.nat_name)?;
        Ok(count)
    }

    fn destroy(&mut self) -> Result<()> {
        log::debug!("WinNAT driver for {} released", self.nat_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::command::testing::RecordingRunner;
    use serde_json::json;

    const LISTING: &str = "\r
Protocol                      : TCP\r
Active                        : True\r
Caption                       : \r
Description                   : \r
ElementName                   : \r
InstanceID                    : {A1B2}\r
ExternalIPAddress             : 0.0.0.0\r
ExternalPort                  : 80\r
InternalIPAddress             : 172.20.0.2\r
InternalPort                  : 8080\r
InternalRoutingDomainId       : {00000000-0000-0000-0000-000000000000}\r
NatName                       : rancher\r
RemoteExternalIPAddressPrefix : 0.0.0.0/0\r
StaticMappingID               : 3\r
PSComputerName                : \r
\r
Protocol                      : UDP\r
Active                        : True\r
ExternalIPAddress             : 0.0.0.0\r
ExternalPort                  : 53\r
InternalIPAddress             : 172.20.0.3\r
InternalPort                  : 53\r
NatName                       : rancher\r
RemoteExternalIPAddressPrefix : 0.0.0.0/0\r
StaticMappingID               : 4\r
\r
\r
";

    fn script(call: &[String]) -> &str {
        call.last().map(String::as_str).unwrap_or_default()
    }

    fn request() -> WinNatPortMapping {
        WinNatPortMapping {
            protocol: "TCP".to_string(),
            external_ip_address: Some("0.0.0.0".parse().unwrap()),
            external_port: 80,
            internal_ip_address: Some("172.20.0.2".parse().unwrap()),
            internal_port: 8080,
            nat_name: "rancher".to_string(),
            remote_external_ip_address_prefix: Some("0.0.0.0/0".parse().unwrap()),
            ..Default::default()
        }
    }

    fn mapping(proto: &str, ext_port: u16, int: &str, int_port: u16) -> PortMapping {
        PortMapping::new(
            proto,
            "0.0.0.0".parse().unwrap(),
            ext_port,
            int.parse().unwrap(),
            int_port,
        )
    }

    /// Answers the listing query with LISTING and everything else with `other`
    fn winnat_runner(other: &'static str) -> RecordingRunner {
        RecordingRunner::new(move |_, args| {
            let script = args.last().map(String::as_str).unwrap_or_default();
            if script.contains("Sort-Object") {
                Ok(CommandOutput::ok(LISTING))
            } else {
                Ok(CommandOutput::ok(other))
            }
        })
    }

    fn driver(runner: &RecordingRunner) -> WinNatDriver {
        let mut driver = WinNatDriver::with_runner(Box::new(runner.clone()));
        let mut config = DriverConfig::new();
        config.insert(NAT_NAME_KEY.to_string(), json!("rancher"));
        driver.init(&config).unwrap();
        runner.clear();
        driver
    }

    #[test]
    fn test_add_command() {
        let command = request().add_command().unwrap();
        assert_eq!(
            command,
            "New-NetNatStaticMapping -NatName rancher -Protocol TCP -ExternalIPAddress 0.0.0.0 \
             -ExternalPort 80 -InternalIPAddress 172.20.0.2 -InternalPort 8080 \
             -RemoteExternalIPAddressPrefix 0.0.0.0/0 | format-list -Property *"
        );
    }

    #[test]
    fn test_add_command_validation() {
        let cases: [(&str, fn(&mut WinNatPortMapping)); 7] = [
            ("NatName", |r| r.nat_name.clear()),
            ("RemoteExternalIPAddressPrefix", |r| r.remote_external_ip_address_prefix = None),
            ("InternalPort", |r| r.internal_port = 0),
            ("InternalPort", |r| r.internal_port = 65536),
            ("ExternalPort", |r| r.external_port = 0),
            ("InternalIPAddress", |r| r.internal_ip_address = Some("::".parse().unwrap())),
            ("InternalIPAddress", |r| r.internal_ip_address = None),
        ];
        for (expected, mutate) in cases {
            let mut rule = request();
            mutate(&mut rule);
            match rule.add_command() {
                Err(NatError::InvalidField { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected {expected} error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_delete_command_requires_id() {
        let mut rule = request();
        assert!(rule.delete_command().is_err());
        rule.static_mapping_id = 7;
        assert_eq!(
            rule.delete_command().unwrap(),
            "Get-NetNatStaticMapping -StaticMappingID 7 | Remove-NetNatStaticMapping -Confirm:$false"
        );
    }

    #[test]
    fn test_encode_then_decode_same_values() {
        let mut original = request();
        original.active = Some(true);
        original.internal_routing_domain_id = "{00000000-0000-0000-0000-000000000000}".to_string();

        // Synthesize format-list output from the encoded parameters
        let encoded = to_powershell_string(&original);
        let mut response = String::new();
        for pair in encoded.split(" -").filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once(' ').unwrap();
            let value = match value {
                "$true" => "True",
                v => v.trim_matches('\''),
            };
            response.push_str(&format!("{:<30}: {}\r\n", name, value));
        }
        response.push_str("NatName                       : rancher\r\n");
        response.push_str("StaticMappingID               : 11\r\n");

        let mut decoded: WinNatPortMapping = parse_row(&response).unwrap();
        assert_eq!(decoded.static_mapping_id, 11);
        decoded.static_mapping_id = 0;
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_parse_listing() {
        let rows: Vec<WinNatPortMapping> = parse_rows(LISTING).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].static_mapping_id, 3);
        assert_eq!(rows[0].instance_id, "{A1B2}");
        assert_eq!(rows[0].active, Some(true));
        assert_eq!(rows[1].protocol, "UDP");
        assert_eq!(
            rows[1].remote_external_ip_address_prefix,
            Some("0.0.0.0/0".parse().unwrap())
        );
    }

    #[test]
    fn test_same_rule_compares_internal_endpoint() {
        let a = request();
        let mut b = request();
        b.protocol = "tcp".to_string();
        b.static_mapping_id = 9;
        assert!(a.same_rule(&b));
        b.internal_ip_address = Some("172.20.0.9".parse().unwrap());
        assert!(!a.same_rule(&b));
    }

    #[test]
    fn test_init_probes_nat_and_listing() {
        let runner = winnat_runner("");
        let mut driver = WinNatDriver::with_runner(Box::new(runner.clone()));
        driver.init(&DriverConfig::new()).unwrap();
        assert_eq!(driver.nat_name(), DEFAULT_NAT_NAME);

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(script(&calls[0]).contains("Get-NetNat -Name rancher"));
        assert!(script(&calls[1]).contains("Get-NetNatStaticMapping -NatName rancher"));
    }

    #[test]
    fn test_init_missing_nat_is_not_configured() {
        let runner = RecordingRunner::new(|_, _| {
            Ok(CommandOutput::failed(1, "", "No MSFT_NetNat objects found"))
        });
        let mut driver = WinNatDriver::with_runner(Box::new(runner));
        assert!(matches!(
            driver.init(&DriverConfig::new()),
            Err(NatError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_init_rejects_bad_prefix() {
        let runner = winnat_runner("");
        let mut driver = WinNatDriver::with_runner(Box::new(runner.clone()));
        let mut config = DriverConfig::new();
        config.insert(REMOTE_PREFIX_KEY.to_string(), json!("not-a-prefix"));
        assert!(matches!(
            driver.init(&config),
            Err(NatError::InvalidConfig { key: REMOTE_PREFIX_KEY, .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_list_converts_rows() {
        let runner = winnat_runner("");
        let driver = driver(&runner);
        let mappings = driver.list_port_mapping().unwrap();
        assert_eq!(
            mappings,
            vec![mapping("TCP", 80, "172.20.0.2", 8080), mapping("UDP", 53, "172.20.0.3", 53)]
        );
        assert_eq!(mappings[1].external_id, "4");
    }

    #[test]
    fn test_create_single_returns_id() {
        let created = "\r\nProtocol : TCP\r\nExternalIPAddress : 0.0.0.0\r\nExternalPort : 8000\r\nInternalIPAddress : 172.20.0.5\r\nInternalPort : 80\r\nStaticMappingID : 12\r\n";
        let runner = winnat_runner(created);
        let driver = driver(&runner);
        let result = driver
            .create_port_mapping(mapping("tcp", 8000, "172.20.0.5", 80))
            .unwrap();
        assert_eq!(result.external_id, "12");
        assert!(
            script(&runner.calls()[0])
                .contains("New-NetNatStaticMapping -NatName rancher -Protocol TCP")
        );
    }

    #[test]
    fn test_create_rejects_before_any_command() {
        let runner = winnat_runner("");
        let driver = driver(&runner);
        let rules = [
            mapping("TCP", 8000, "172.20.0.5", 80),
            mapping("TCP", 8001, "0.0.0.0", 80),
        ];
        let err = driver.create_port_mappings(&rules).unwrap_err();
        assert!(matches!(err, NatError::InvalidField { field: "InternalIPAddress", .. }));
        assert!(runner.calls().is_empty());

        driver.create_port_mappings(&[]).unwrap();
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_create_batch_runs_each_command() {
        let runner = winnat_runner("");
        let driver = driver(&runner);
        let rules = [
            mapping("TCP", 8000, "172.20.0.5", 80),
            mapping("UDP", 5353, "172.20.0.6", 53),
        ];
        driver.create_port_mappings(&rules).unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(script(&calls[1]).contains("-Protocol UDP"));
    }

    #[test]
    fn test_delete_matches_external_endpoint() {
        let runner = winnat_runner("");
        let driver = driver(&runner);
        // internal side differs from the listed rule; only protocol + external endpoint matter
        driver
            .delete_port_mapping(&mapping("udp", 53, "10.9.9.9", 1))
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(script(&calls[1]).contains("-StaticMappingID 4 | Remove-NetNatStaticMapping"));
    }

    #[test]
    fn test_delete_unknown_still_removes_the_rest() {
        let runner = winnat_runner("");
        let driver = driver(&runner);
        let err = driver
            .delete_port_mappings(&[
                mapping("TCP", 9999, "172.20.0.2", 8080),
                mapping("TCP", 80, "172.20.0.2", 8080),
            ])
            .unwrap_err();
        assert!(matches!(err, NatError::MappingNotFound(_)));

        // listing, then the one removal that matched
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(script(&calls[1]).contains("-StaticMappingID 3 | Remove-NetNatStaticMapping"));
    }

    #[test]
    fn test_delete_returns_last_error() {
        let runner = RecordingRunner::new(|_, args| {
            let script = args.last().map(String::as_str).unwrap_or_default();
            if script.contains("Sort-Object") {
                Ok(CommandOutput::ok(LISTING))
            } else if script.contains("-StaticMappingID 4 ") {
                Ok(CommandOutput::failed(1, "", "Access is denied."))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });
        let driver = driver(&runner);
        let err = driver
            .delete_port_mappings(&[
                mapping("TCP", 9999, "172.20.0.2", 8080),
                mapping("UDP", 53, "172.20.0.3", 53),
                mapping("TCP", 80, "172.20.0.2", 8080),
            ])
            .unwrap_err();
        assert!(
            matches!(err, NatError::CommandFailed { ref stderr, .. } if stderr.contains("denied"))
        );
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn test_create_continues_past_failure() {
        let runner = RecordingRunner::new(|_, args| {
            let script = args.last().map(String::as_str).unwrap_or_default();
            if script.contains("Sort-Object") {
                Ok(CommandOutput::ok(LISTING))
            } else if script.contains("-ExternalPort 8000 ") {
                Ok(CommandOutput::failed(1, "", "The parameter is incorrect."))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });
        let driver = driver(&runner);
        let rules = [
            mapping("TCP", 8000, "172.20.0.5", 80),
            mapping("TCP", 8001, "172.20.0.5", 81),
            mapping("TCP", 8002, "172.20.0.5", 82),
        ];
        let err = driver.create_port_mappings(&rules).unwrap_err();
        assert!(matches!(
            err,
            NatError::CommandFailed { ref stderr, .. } if stderr.contains("incorrect")
        ));

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(script(&calls[2]).contains("-ExternalPort 8002 "));
    }

    /// Shell that answers every script with fixed stdout and records scripts
    struct ScriptedShell {
        stdout: &'static str,
        scripts: std::sync::Mutex<Vec<String>>,
    }

    impl PowershellShell for ScriptedShell {
        fn execute(&self, script: &str) -> Result<(String, String)> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok((self.stdout.to_string(), String::new()))
        }
    }

    #[test]
    fn test_helpers_against_scripted_shell() {
        let shell = ScriptedShell {
            stdout: LISTING,
            scripts: Default::default(),
        };
        let rules = list_local_port_mappings(&shell, "my nat").unwrap();
        assert_eq!(rules.len(), 2);

        rules[1].delete(&shell).unwrap();
        remove_local_port_mappings(&shell, "my nat").unwrap();

        let scripts = shell.scripts.lock().unwrap();
        assert!(scripts[0].starts_with("Get-NetNatStaticMapping -NatName 'my nat' "));
        assert!(scripts[1].contains("-StaticMappingID 4 "));
        assert!(scripts[2].ends_with("Remove-NetNatStaticMapping -Confirm:$false"));
    }

    #[test]
    fn test_clear_removes_all_of_nat() {
        let runner = winnat_runner("");
        let driver = driver(&runner);
        assert_eq!(driver.clear_port_mappings().unwrap(), 2);
        let calls = runner.calls();
        assert!(script(&calls[1]).contains(
            "Get-NetNatStaticMapping -NatName rancher -ErrorAction SilentlyContinue | Remove-NetNatStaticMapping"
        ));
    }
}
