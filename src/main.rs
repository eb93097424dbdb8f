use anyhow::Result;
use clap::{Arg, Command};
use log::info;
use std::path::Path;

use inverter_bridge::cli;
use inverter_bridge::config::Config;
use inverter_bridge::services::BridgeService;
use inverter_bridge::VERSION;

fn build_cli() -> Command {
    Command::new("inverter_bridge")
        .version(VERSION)
        .about("Solar inverter Modbus to MQTT bridge")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("inverter_bridge.toml")
                .help("Path to the TOML configuration file"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Override the first unit's inverter host"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("SECONDS")
                .help("Override the base polling interval"),
        )
        .arg(
            Arg::new("broker")
                .long("broker")
                .value_name("HOST")
                .help("Override the MQTT broker host"),
        )
        .subcommand(Command::new("getdata").about("Read all devices once and print the snapshots"))
        .subcommand(Command::new("powerflow").about("Compute one powerflow decomposition and print it"))
        .subcommand(Command::new("probe").about("Report which meter/battery slots each unit advertises"))
        .subcommand(Command::new("registers").about("Dump the decoded inverter window per unit"))
        .subcommand(
            Command::new("initconfig")
                .about("Write a default configuration file")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .default_value("inverter_bridge.toml"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = build_cli().get_matches();

    if let Some(matches) = matches.subcommand_matches("initconfig") {
        let output = matches.get_one::<String>("output").unwrap();
        Config::default().save_to_file(output)?;
        println!("✅ Wrote default configuration to {}", output);
        return Ok(());
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let mut config = if Path::new(config_path).exists() {
        info!("⚙️  Loading configuration from {}", config_path);
        Config::from_file(config_path)?
    } else {
        info!("⚙️  No config file at {}, using defaults", config_path);
        Config::default()
    };
    config.apply_matches(&matches)?;

    let mut service = BridgeService::new(config).await?;

    if cli::handle_subcommands(&matches, &service).await? {
        return Ok(());
    }

    service.start().await?;

    tokio::signal::ctrl_c().await?;
    println!();
    info!("🛑 Ctrl-C received, shutting down");
    service.shutdown().await;

    Ok(())
}
