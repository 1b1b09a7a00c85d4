// netsh routing ip nat driver
//
// Drives the RRAS NAT configuration through `netsh routing ip nat`:
//   add portmapping <adapter> <proto> <ext-ip> <ext-port> <int-ip> <int-port>
//   delete portmapping <adapter> <proto> <ext-ip> <ext-port>
//   show interface <adapter>
//
// Limitations:
// - Listing only looks at the first configured adapter
// - Batches report only the last error

use super::{DriverConfig, NAT_ADAPTER_KEY, NatDriver, adapter_names, optional_string};
use crate::command::{
    CommandRunner, SystemCommandRunner, program_available, render_command_line,
};
use crate::error::{NatError, Result};
use crate::mapping::{PortMapping, validate_protocol};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub const NETSH_DRIVER_NAME: &str = "Netsh";

/// Optional key selecting how batches are issued
pub const BATCH_MODE_KEY: &str = "BatchMode";

const NETSH: &str = "netsh";
const CHAIN_SEPARATOR: &str = " && ";
const NAT_CONTEXT: [&str; 3] = ["routing", "ip", "nat"];

/// How multi-rule / multi-adapter batches reach netsh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchMode {
    /// One netsh process per (adapter, rule); every pair is attempted
    #[default]
    PerPair,
    /// One `cmd /C` line joined with `&&`; the first failure aborts the rest
    Chained,
}

impl FromStr for BatchMode {
    type Err = NatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-pair" | "per_pair" | "perpair" => Ok(BatchMode::PerPair),
            "chained" | "chain" => Ok(BatchMode::Chained),
            other => Err(NatError::InvalidConfig {
                key: BATCH_MODE_KEY,
                reason: format!("unknown batch mode {:?}", other),
            }),
        }
    }
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchMode::PerPair => write!(f, "per-pair"),
            BatchMode::Chained => write!(f, "chained"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Add,
    Delete,
}

/// netsh-backed NAT driver
pub struct NetshDriver {
    adapters: Vec<String>,
    batch_mode: BatchMode,
    runner: Box<dyn CommandRunner>,
}

impl NetshDriver {
    pub fn new() -> Self {
        Self::with_runner(Box::new(SystemCommandRunner))
    }

    pub fn with_runner(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            adapters: Vec::new(),
            batch_mode: BatchMode::default(),
            runner,
        }
    }

    /// Check if netsh exists on this host
    pub fn is_available() -> bool {
        program_available(NETSH)
    }

    pub fn adapters(&self) -> &[String] {
        &self.adapters
    }

    pub fn batch_mode(&self) -> BatchMode {
        self.batch_mode
    }

    fn primary_adapter(&self) -> Result<&str> {
        self.adapters
            .first()
            .map(String::as_str)
            .ok_or(NatError::MissingConfig(NAT_ADAPTER_KEY))
    }

    fn build_args(verb: Verb, adapter: &str, mapping: &PortMapping) -> Vec<String> {
        match verb {
            Verb::Add => add_args(adapter, mapping),
            Verb::Delete => delete_args(adapter, mapping),
        }
    }

    /// Issue `verb` for every (adapter, mapping) pair
    fn apply(&self, verb: Verb, mappings: &[PortMapping]) -> Result<()> {
        if mappings.is_empty() {
            return Ok(());
        }

        for mapping in mappings {
            match verb {
                Verb::Add => mapping.validate()?,
                Verb::Delete => validate_delete(mapping)?,
            }
        }

        let adapter = self.primary_adapter()?;
        log::debug!(
            "netsh {:?} of {} mapping(s) on {} adapter(s) starting at {} ({})",
            verb,
            mappings.len(),
            self.adapters.len(),
            adapter,
            self.batch_mode
        );

        match self.batch_mode {
            BatchMode::PerPair => self.apply_per_pair(verb, mappings),
            BatchMode::Chained => self.apply_chained(verb, mappings),
        }
    }

    fn apply_per_pair(&self, verb: Verb, mappings: &[PortMapping]) -> Result<()> {
        let mut last_error = None;

        for adapter in &self.adapters {
            for mapping in mappings {
                let args = Self::build_args(verb, adapter, mapping);
                let line = render_command_line(NETSH, &args);

                let result = self
                    .runner
                    .run(NETSH, &args)
                    .and_then(|output| expect_quiet(&line, output));

                if let Err(e) = result {
                    log::warn!("{} on {}: {}", mapping, adapter, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn apply_chained(&self, verb: Verb, mappings: &[PortMapping]) -> Result<()> {
        let line = self
            .adapters
            .iter()
            .flat_map(|adapter| {
                mappings.iter().map(move |mapping| {
                    render_command_line(NETSH, &Self::build_args(verb, adapter, mapping))
                })
            })
            .collect::<Vec<_>>()
            .join(CHAIN_SEPARATOR);

        let output = self.runner.run_shell(&line)?;
        expect_quiet(&line, output)
    }
}

impl Default for NetshDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NatDriver for NetshDriver {
    fn name(&self) -> &'static str {
        NETSH_DRIVER_NAME
    }

    fn init(&mut self, config: &DriverConfig) -> Result<()> {
        self.adapters = adapter_names(config)?;
        if let Some(mode) = optional_string(config, BATCH_MODE_KEY)? {
            self.batch_mode = mode.parse()?;
        }

        log::info!(
            "netsh driver using adapter(s) {:?}, batch mode {}",
            self.adapters,
            self.batch_mode
        );

        self.list_port_mapping()
            .map_err(|e| NatError::NotConfigured(Box::new(e)))?;
        Ok(())
    }

    fn create_port_mappings(&self, mappings: &[PortMapping]) -> Result<()> {
        self.apply(Verb::Add, mappings)
    }

    fn list_port_mapping(&self) -> Result<Vec<PortMapping>> {
        let adapter = self.primary_adapter()?;
        let args = show_interface_args(adapter);
        let line = render_command_line(NETSH, &args);

        let output = self.runner.run(NETSH, &args)?.check(&line)?;
        let result = parse_show_interface(adapter, &output.stdout);

        if let Err(NatError::UnexpectedOutput { .. }) = &result {
            log::debug!("{}", output.stdout);
        }
        result
    }

    fn delete_port_mappings(&self, mappings: &[PortMapping]) -> Result<()> {
        self.apply(Verb::Delete, mappings)
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

fn validate_delete(mapping: &PortMapping) -> Result<()> {
    validate_protocol(&mapping.protocol)?;
    if mapping.external_port == 0 {
        return Err(NatError::invalid_field("ExternalPort", "port must be 1-65535"));
    }
    Ok(())
}

/// netsh prints nothing (or a bare "Ok.") when a portmapping command succeeds
fn expect_quiet(line: &str, output: crate::command::CommandOutput) -> Result<()> {
    let output = output.check(line)?;
    let stdout = output.stdout.trim();

    if stdout.is_empty() || stdout.eq_ignore_ascii_case("ok.") {
        return Ok(());
    }

    log::error!("{} printed: {}", line, stdout);
    Err(NatError::UnexpectedCommandOutput {
        command: line.to_string(),
        output: stdout.to_string(),
    })
}

fn nat_args(verb: &str, object: &str, adapter: &str) -> Vec<String> {
    let mut args: Vec<String> = NAT_CONTEXT.iter().map(|s| s.to_string()).collect();
    args.extend([verb, object, adapter].map(String::from));
    args
}

/// Arguments for `netsh routing ip nat add portmapping ...`
pub fn add_args(adapter: &str, mapping: &PortMapping) -> Vec<String> {
    let mut args = nat_args("add", "portmapping", adapter);
    args.extend([
        mapping.protocol.clone(),
        mapping.external_ip.to_string(),
        mapping.external_port.to_string(),
        mapping.internal_ip.to_string(),
        mapping.internal_port.to_string(),
    ]);
    args
}

/// Arguments for `netsh routing ip nat delete portmapping ...`
pub fn delete_args(adapter: &str, mapping: &PortMapping) -> Vec<String> {
    let mut args = nat_args("delete", "portmapping", adapter);
    args.extend([
        mapping.protocol.clone(),
        mapping.external_ip.to_string(),
        mapping.external_port.to_string(),
    ]);
    args
}

/// Arguments for `netsh routing ip nat show interface <adapter>`
pub fn show_interface_args(adapter: &str) -> Vec<String> {
    nat_args("show", "interface", adapter)
}

/// Parse `netsh routing ip nat show interface` output
///
/// The output is split on dash separator lines:
/// - one block: the adapter is not a NAT interface
/// - two blocks: NAT interface with no port mappings
/// - three blocks: the third holds the port mappings
pub fn parse_show_interface(adapter: &str, output: &str) -> Result<Vec<PortMapping>> {
    let output = output.replace('\r', "");
    let blocks = split_blocks(&output);

    match blocks.len() {
        1 => Err(NatError::NotNatInterface(adapter.to_string())),
        2 => Ok(Vec::new()),
        3 => parse_port_mapping_block(&blocks[2]),
        _ => Err(NatError::UnexpectedOutput {
            driver: NETSH_DRIVER_NAME,
            operation: "ListPortMapping",
        }),
    }
}

fn is_separator(line: &str) -> bool {
    let line = line.trim();
    line.len() >= 3 && line.chars().all(|c| c == '-')
}

fn split_blocks(output: &str) -> Vec<Vec<&str>> {
    let mut blocks = vec![Vec::new()];
    for line in output.lines() {
        if is_separator(line) {
            blocks.push(Vec::new());
        } else if let Some(current) = blocks.last_mut() {
            current.push(line);
        }
    }
    blocks
}

/// Parse blank-line separated five-line port mapping records
///
/// One record looks like:
///   Protocol     : TCP
///   Public IP    : 0.0.0.0
///   Public port  : 80
///   Private IP   : 192.168.1.100
///   Private port : 80
pub fn parse_port_mapping_block(lines: &[&str]) -> Result<Vec<PortMapping>> {
    let mut mappings = Vec::new();
    let mut record = Vec::new();

    for line in lines {
        if line.trim().is_empty() {
            if !record.is_empty() {
                mappings.push(parse_record(&record)?);
                record.clear();
            }
        } else {
            record.push(*line);
        }
    }
    if !record.is_empty() {
        mappings.push(parse_record(&record)?);
    }

    Ok(mappings)
}

const PROTOCOL: usize = 0;
const EXTERNAL_IP: usize = 1;
const EXTERNAL_PORT: usize = 2;
const INTERNAL_IP: usize = 3;
const INTERNAL_PORT: usize = 4;
const RECORD_LINES: usize = 5;

/// Slot for a known label; unknown (e.g. localized) labels return None
fn slot_for_label(label: &str) -> Option<usize> {
    let key: String = label
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    match key.as_str() {
        "protocol" => Some(PROTOCOL),
        "publicip" | "publicaddress" | "externalip" | "externaladdress" => Some(EXTERNAL_IP),
        "publicport" | "externalport" => Some(EXTERNAL_PORT),
        "privateip" | "privateaddress" | "internalip" | "internaladdress" => Some(INTERNAL_IP),
        "privateport" | "internalport" => Some(INTERNAL_PORT),
        _ => None,
    }
}

/// Split "Label : value"; bare values (including IPv6 literals) have no label
fn split_label(line: &str) -> (Option<&str>, &str) {
    let line = line.trim();
    if line.parse::<IpAddr>().is_ok() {
        return (None, line);
    }
    match line.split_once(':') {
        Some((label, value)) => (Some(label.trim()), value.trim()),
        None => (None, line),
    }
}

// Recognized labels pick their field. Anything else falls back to the line's
// offset within the record, which silently misassigns fields if netsh ever
// changes the record shape, so the shape and every value are checked here.
fn parse_record(lines: &[&str]) -> Result<PortMapping> {
    let record = lines.join("\n");
    if lines.len() != RECORD_LINES {
        return Err(NatError::parse(
            "netsh port mapping",
            format!("expected {} lines, got {}: {:?}", RECORD_LINES, lines.len(), record),
        ));
    }

    let mut slots: [Option<&str>; RECORD_LINES] = [None; RECORD_LINES];
    for (offset, line) in lines.iter().enumerate() {
        let (label, value) = split_label(line);
        let slot = label.and_then(slot_for_label).unwrap_or(offset);
        if slots[slot].replace(value).is_some() {
            return Err(NatError::parse(
                "netsh port mapping",
                format!("field on line {:?} assigned twice in {:?}", line, record),
            ));
        }
    }

    let field = |slot: usize| slots[slot].unwrap_or_default();

    let protocol = field(PROTOCOL);
    if protocol.is_empty() {
        return Err(NatError::parse(
            "netsh port mapping",
            format!("empty protocol in {:?}", record),
        ));
    }

    let external_ip = parse_ip(field(EXTERNAL_IP))?;
    let external_port = parse_port(field(EXTERNAL_PORT))?;

    Ok(PortMapping {
        external_id: format!(
            "{}/{}/{}",
            protocol.to_ascii_lowercase(),
            external_ip,
            external_port
        ),
        external_ip,
        external_port,
        internal_ip: parse_ip(field(INTERNAL_IP))?,
        internal_port: parse_port(field(INTERNAL_PORT))?,
        protocol: protocol.to_string(),
    })
}

fn parse_ip(value: &str) -> Result<IpAddr> {
    value
        .parse()
        .map_err(|_| {
            NatError::parse("netsh port mapping", format!("invalid IP address {:?}", value))
        })
}

fn parse_port(value: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(NatError::parse("netsh port mapping", format!("invalid port {:?}", value))),
    }
}
