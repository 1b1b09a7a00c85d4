use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use winnat::config::Config;
use winnat::drivers::{NAT_ADAPTER_KEY, NatDriver, create_driver, detect_drivers};
use winnat::mapping::PortMapping;

/// winnat - manage Windows NAT port mappings
#[derive(Parser, Debug)]
#[command(name = "winnat")]
#[command(version)]
#[command(about = "Manage NAT port mappings via netsh or NetNat", long_about = None)]
struct Args {
    /// Config file (default: <config dir>/winnat/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// NAT driver to use (Netsh or WinNAT)
    #[arg(long, value_name = "DRIVER")]
    driver: Option<String>,

    /// NAT adapter name(s), comma separated
    #[arg(long, value_name = "ADAPTER")]
    adapter: Option<String>,

    /// Netsh batch mode: per-pair or chained
    #[arg(long, value_name = "MODE")]
    batch_mode: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the configured port mappings
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a port mapping
    Add {
        protocol: String,
        external_ip: IpAddr,
        external_port: u16,
        internal_ip: IpAddr,
        internal_port: u16,
        /// Also record the mapping in the config file for `apply`
        #[arg(long)]
        save: bool,
    },
    /// Delete the port mapping matching protocol and external endpoint
    Delete {
        protocol: String,
        external_ip: IpAddr,
        external_port: u16,
        /// Also remove the mapping from the config file
        #[arg(long)]
        save: bool,
    },
    /// Create every mapping listed in the config file
    Apply,
    /// Delete every listed port mapping
    Clear,
    /// List compiled-in drivers and exit
    Drivers,
}

fn print_available_drivers() {
    println!("winnat {} - Available Drivers\n", env!("CARGO_PKG_VERSION"));

    let drivers = detect_drivers();
    if drivers.is_empty() {
        println!("  (none compiled in)");
        return;
    }

    for driver in drivers {
        let status = if driver.available {
            "available"
        } else {
            "unavailable"
        };
        println!("  {:10} {:12} {}", driver.name, status, driver.description);
    }
}

fn load_config(args: &Args, path: &Path) -> Result<Config> {
    let mut config = Config::load_from(path)?;

    if let Some(driver) = &args.driver {
        config.driver = driver.clone();
    }
    if let Some(adapter) = &args.adapter {
        config.set_option(NAT_ADAPTER_KEY, adapter.as_str());
    }
    if let Some(mode) = &args.batch_mode {
        #[cfg(feature = "driver-netsh")]
        config.set_option(winnat::drivers::netsh::BATCH_MODE_KEY, mode.as_str());
        #[cfg(not(feature = "driver-netsh"))]
        log::warn!("Ignoring --batch-mode {}: netsh driver not compiled in", mode);
    }

    Ok(config)
}

fn print_mappings(mappings: &[PortMapping], json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(mappings).context("Failed to serialize mappings")?;
        println!("{}", out);
        return Ok(());
    }

    if mappings.is_empty() {
        println!("No port mappings configured");
        return Ok(());
    }

    for mapping in mappings {
        println!("  {:24} {}", mapping.external_id, mapping);
    }
    Ok(())
}

fn run(
    driver: &dyn NatDriver,
    command: Command,
    config: &mut Config,
    config_path: &Path,
) -> Result<()> {
    match command {
        Command::List { json } => {
            let mappings = driver.list_port_mapping()?;
            print_mappings(&mappings, json)?;
        }
        Command::Add {
            protocol,
            external_ip,
            external_port,
            internal_ip,
            internal_port,
            save,
        } => {
            let mapping =
                PortMapping::new(protocol, external_ip, external_port, internal_ip, internal_port);
            let created = driver.create_port_mapping(mapping)?;
            println!("Added {}", created);

            if save {
                config.remember(created);
                config.save_to(config_path)?;
            }
        }
        Command::Delete {
            protocol,
            external_ip,
            external_port,
            save,
        } => {
            let mapping = PortMapping {
                protocol,
                external_ip,
                external_port,
                ..Default::default()
            };
            driver.delete_port_mapping(&mapping)?;
            println!(
                "Deleted {} {}:{}",
                mapping.protocol.to_uppercase(),
                external_ip,
                external_port
            );

            if save && config.forget(&mapping) {
                config.save_to(config_path)?;
            }
        }
        Command::Apply => {
            if config.mappings.is_empty() {
                bail!("No mappings in the config file to apply");
            }
            driver.create_port_mappings(&config.mappings)?;
            println!("Applied {} port mapping(s)", config.mappings.len());
        }
        Command::Clear => {
            let count = driver.clear_port_mappings()?;
            println!("Removed {} port mapping(s)", count);
        }
        Command::Drivers => print_available_drivers(),
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    // Handle `drivers` without touching config or the OS
    if matches!(args.command, Command::Drivers) {
        print_available_drivers();
        return Ok(());
    }

    let config_path = Config::resolve_path(args.config.as_deref())?;
    let mut config = load_config(&args, &config_path)?;
    log::debug!("Using driver {} with options {:?}", config.driver, config.options);

    let mut driver = create_driver(&config.driver, &config.options)
        .context(format!("Failed to initialize {} driver", config.driver))?;

    let result = run(driver.as_ref(), args.command, &mut config, &config_path);

    if let Err(e) = driver.destroy() {
        log::warn!("Failed to release {} driver: {}", driver.name(), e);
    }

    result
}
