// "Property : Value" records (format-list output) <-> typed structs
//
// Each record type lists its fields in a FieldSpec table. The table drives
// both directions: decoding format-list output into the struct, and encoding
// the struct into `-Name value` cmdlet parameters.

use crate::error::{NatError, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

/// Whether a field can be passed to a cmdlet or is only read back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Populated by the OS only
    Get,
    /// Read back and emitted as a `-Name value` parameter
    GetSet,
}

/// Descriptor for one field of a record type
pub struct FieldSpec<T> {
    /// Parameter name used when encoding (`-Name`)
    pub name: &'static str,
    /// Property name in format-list output
    pub wire_key: &'static str,
    pub access: Access,
    /// Render the field; None means "absent, skip"
    pub encode: fn(&T) -> Option<String>,
    /// Store a non-empty raw value into the field
    pub decode: fn(&mut T, &str) -> Result<()>,
}

/// A struct that maps onto a PowerShell object through a field table
pub trait PowershellRecord: Default + Sized + 'static {
    const FIELDS: &'static [FieldSpec<Self>];
}

/// Render every settable field as ` -Name value`
///
/// Empty strings and absent values are skipped.
pub fn to_powershell_string<T: PowershellRecord>(record: &T) -> String {
    let mut out = String::new();
    for field in T::FIELDS.iter().filter(|f| f.access == Access::GetSet) {
        match (field.encode)(record) {
            Some(value) if !value.is_empty() => {
                out.push_str(" -");
                out.push_str(field.name);
                out.push(' ');
                out.push_str(&value);
            }
            _ => {}
        }
    }
    out
}

/// Parse blank-line separated records
pub fn parse_rows<T: PowershellRecord>(input: &str) -> Result<Vec<T>> {
    let input = input.replace('\r', "");
    let mut rows = Vec::new();
    let mut current = String::new();

    for line in input.split('\n') {
        if line.trim().is_empty() {
            if !current.is_empty() {
                rows.push(parse_row(&current)?);
                current.clear();
            }
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.is_empty() {
        rows.push(parse_row(&current)?);
    }

    Ok(rows)
}

/// Parse a single record of `Key : Value` lines
///
/// A line without a colon, or indented up to the value column, continues
/// the previous key's value.
pub fn parse_row<T: PowershellRecord>(input: &str) -> Result<T> {
    let input = input.replace('\r', "");
    let lines: Vec<&str> = input.lines().filter(|l| !l.trim().is_empty()).collect();

    // format-list aligns every value one space past the colon
    let value_column = lines.first().and_then(|l| l.find(':')).map(|i| i + 2);

    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut last: Option<usize> = None;

    for line in lines {
        let indented = value_column
            .and_then(|col| line.get(..col))
            .is_some_and(|prefix| prefix.trim().is_empty());

        match line.split_once(':') {
            Some((key, value)) if !indented => {
                let key = key.trim();
                let value = value.trim().to_string();
                match pairs.iter().position(|(k, _)| k == key) {
                    Some(i) => {
                        pairs[i].1 = value;
                        last = Some(i);
                    }
                    None => {
                        pairs.push((key.to_string(), value));
                        last = Some(pairs.len() - 1);
                    }
                }
            }
            _ => {
                let Some(i) = last else {
                    return Err(NatError::parse(
                        "powershell record",
                        format!("{} is not a valid output", line),
                    ));
                };
                let continuation = value_column
                    .and_then(|col| line.get(col..))
                    .map(str::trim_end)
                    .unwrap_or_else(|| line.trim());
                pairs[i].1.push_str(continuation);
            }
        }
    }

    let mut record = T::default();
    for (key, value) in &pairs {
        if value.is_empty() {
            continue;
        }
        if let Some(field) = T::FIELDS
            .iter()
            .find(|f| f.wire_key.eq_ignore_ascii_case(key))
        {
            (field.decode)(&mut record, value)?;
        }
    }
    Ok(record)
}

/// Base-10 unsigned integer
pub fn decode_uint<N: FromStr>(field: &'static str, value: &str) -> Result<N> {
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NatError::invalid_field(
            field,
            format!("{} is not an unsigned integer", value),
        ));
    }
    value
        .parse()
        .map_err(|_| NatError::invalid_field(field, format!("{} is out of range", value)))
}

/// IP address that must round-trip to the exact same text
pub fn decode_ip(field: &'static str, value: &str) -> Result<IpAddr> {
    let ip: IpAddr = value
        .parse()
        .map_err(|_| NatError::invalid_field(field, format!("ip address {} is not valid", value)))?;
    if ip.to_string() != value {
        return Err(NatError::invalid_field(
            field,
            format!("ip address {} is not valid", value),
        ));
    }
    Ok(ip)
}

/// Network prefix in CIDR notation, host bits cleared
pub fn decode_cidr(field: &'static str, value: &str) -> Result<IpNet> {
    value
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| {
            NatError::invalid_field(field, format!("{} is not a valid CIDR prefix", value))
        })
}

/// Boolean as printed by PowerShell (`True` / `False`)
pub fn decode_bool(field: &'static str, value: &str) -> Result<bool> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(NatError::invalid_field(field, format!("{} is not a boolean", value)))
    }
}

/// Boolean as a PowerShell literal
pub fn encode_bool(value: bool) -> String {
    if value { "$true" } else { "$false" }.to_string()
}

/// Quote a string argument unless it is a plain token
pub fn encode_str(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':' | '/'));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}
