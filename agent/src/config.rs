//! Process configuration: CLI flags layered over an optional TOML overlay
//! file and built-in defaults.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use serde::Deserialize;
use uuid::Uuid;

const DEFAULT_WRITE_UUID: &str = "98bd0002-0b0e-421a-84e5-ddbf75dc6de4";
const DEFAULT_READ_UUID: &str = "98bd0003-0b0e-421a-84e5-ddbf75dc6de4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Public,
    Random,
}

/// Command-line surface for the gateway agent.
#[derive(Debug, Parser)]
#[command(name = "hqv-agent", about = "HQV BLE <-> UDP/LwM2M gateway bridge")]
pub struct Cli {
    /// Target BLE device MAC address, e.g. AA:BB:CC:DD:EE:FF
    #[arg(long)]
    pub device: Option<String>,

    #[arg(long, value_enum, default_value = "public")]
    pub addr_type: AddressKind,

    #[arg(long)]
    pub adapter: Option<String>,

    #[arg(long, default_value_t = 23)]
    pub mtu: u16,

    #[arg(long, default_value = DEFAULT_WRITE_UUID)]
    pub write_uuid: String,

    #[arg(long, default_value = DEFAULT_READ_UUID)]
    pub read_uuid: String,

    /// UDP destination port (the remote LwM2M server).
    #[arg(long, default_value_t = 5684)]
    pub port: u16,

    /// UDP destination IP address.
    #[arg(long, default_value = "127.0.0.1")]
    pub address: String,

    #[arg(long, default_value_t = 4000)]
    pub control_port: u16,

    #[arg(long, default_value_t = 4001)]
    pub ws_port: u16,

    #[arg(long, default_value = "hqv-agent")]
    pub custom_name: String,

    #[arg(long, default_value_t = false)]
    pub gui_access: bool,

    #[arg(long, default_value_t = false)]
    pub auto_reconnect: bool,

    #[arg(long, default_value_t = false)]
    pub regular_status_request: bool,

    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub leshan_url: String,

    #[arg(long, default_value = "aliases.json")]
    pub alias_store: PathBuf,

    #[arg(long, default_value = "psks.json")]
    pub psk_store: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Optional TOML file overlaying these defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// A config-file overlay; every field is optional so the file can be partial.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub device: Option<String>,
    pub addr_type: Option<AddressKind>,
    pub adapter: Option<String>,
    pub mtu: Option<u16>,
    pub write_uuid: Option<String>,
    pub read_uuid: Option<String>,
    pub port: Option<u16>,
    pub address: Option<String>,
    pub control_port: Option<u16>,
    pub ws_port: Option<u16>,
    pub custom_name: Option<String>,
    pub gui_access: Option<bool>,
    pub auto_reconnect: Option<bool>,
    pub regular_status_request: Option<bool>,
    pub leshan_url: Option<String>,
    pub alias_store: Option<PathBuf>,
    pub psk_store: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub device: Option<[u8; 6]>,
    pub addr_type: AddressKind,
    pub adapter: Option<String>,
    pub mtu: u16,
    pub write_uuid: Uuid,
    pub read_uuid: Uuid,
    pub udp_dest: SocketAddr,
    pub control_port: u16,
    pub ws_port: u16,
    pub custom_name: String,
    pub gui_access: bool,
    pub auto_reconnect: bool,
    pub regular_status_request: bool,
    pub leshan_base_url: String,
    pub alias_store_path: PathBuf,
    pub psk_store_path: PathBuf,
    pub log_level: LevelFilter,
}

impl Config {
    /// Parses CLI flags, overlays an optional TOML config file (CLI flags
    /// win over file values when both are the non-default `clap` value),
    /// and resolves to a fully-typed `Config`.
    pub fn load() -> anyhow::Result<Config> {
        let cli = Cli::parse();
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str::<ConfigFile>(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => ConfigFile::default(),
        };

        let device_str = cli.device.clone().or(file.device);
        let device = device_str
            .map(|s| parse_mac(&s))
            .transpose()
            .context("parsing --device MAC address")?;

        let port = file.port.unwrap_or(cli.port);
        let address = file.address.clone().unwrap_or(cli.address.clone());
        let udp_dest: SocketAddr = format!("{address}:{port}")
            .parse()
            .context("parsing UDP destination address")?;

        let write_uuid = Uuid::parse_str(file.write_uuid.as_deref().unwrap_or(&cli.write_uuid))
            .context("parsing --write-uuid")?;
        let read_uuid = Uuid::parse_str(file.read_uuid.as_deref().unwrap_or(&cli.read_uuid))
            .context("parsing --read-uuid")?;

        let log_level = file
            .log_level
            .as_deref()
            .unwrap_or(&cli.log_level)
            .parse()
            .unwrap_or(LevelFilter::Info);

        Ok(Config {
            device,
            addr_type: file.addr_type.unwrap_or(cli.addr_type),
            adapter: file.adapter.or(cli.adapter),
            mtu: file.mtu.unwrap_or(cli.mtu),
            write_uuid,
            read_uuid,
            udp_dest,
            control_port: file.control_port.unwrap_or(cli.control_port),
            ws_port: file.ws_port.unwrap_or(cli.ws_port),
            custom_name: file.custom_name.unwrap_or(cli.custom_name),
            gui_access: file.gui_access.unwrap_or(cli.gui_access),
            auto_reconnect: file.auto_reconnect.unwrap_or(cli.auto_reconnect),
            regular_status_request: file
                .regular_status_request
                .unwrap_or(cli.regular_status_request),
            leshan_base_url: file.leshan_url.unwrap_or(cli.leshan_url),
            alias_store_path: file.alias_store.unwrap_or(cli.alias_store),
            psk_store_path: file.psk_store.unwrap_or(cli.psk_store),
            log_level,
        })
    }
}

fn parse_mac(s: &str) -> anyhow::Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    anyhow::ensure!(parts.len() == 6, "MAC address must have 6 octets: {s}");
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16)
            .with_context(|| format!("invalid MAC octet {part:?}"))?;
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mac_accepts_colon_separated_hex() {
        assert_eq!(
            parse_mac("AA:BB:CC:DD:EE:FF").unwrap(),
            [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
        );
    }

    #[test]
    fn parse_mac_rejects_wrong_length() {
        assert!(parse_mac("AA:BB:CC").is_err());
    }
}
