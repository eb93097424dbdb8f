use clap::ArgMatches;
use log::info;
use std::collections::BTreeMap;

use crate::services::BridgeService;
use crate::utils::error::BridgeError;

/// Handle one-shot subcommands. Returns true when a subcommand ran and the
/// process should exit instead of entering the poll loops.
pub async fn handle_subcommands(
    matches: &ArgMatches,
    service: &BridgeService,
) -> Result<bool, BridgeError> {
    if matches.subcommand_matches("getdata").is_some() {
        info!("🔍 Reading all devices once...");

        for snapshots in service.read_once().await? {
            println!("═══ Unit '{}' ({}) ═══", snapshots.unit.key, snapshots.unit.role);
            println!("{}", serde_json::to_string_pretty(&snapshots.inverter)?);
            for (slot, meter) in &snapshots.meters {
                println!("--- meter {} ---", slot);
                println!("{}", serde_json::to_string_pretty(meter)?);
            }
            for (slot, battery) in &snapshots.batteries {
                println!("--- battery {} ---", slot);
                println!("{}", serde_json::to_string_pretty(battery)?);
            }
        }

        return Ok(true);
    }

    if matches.subcommand_matches("powerflow").is_some() {
        info!("⚡ Computing one powerflow decomposition...");

        let flow = service.powerflow_once().await?;
        println!("{}", serde_json::to_string_pretty(&flow)?);

        return Ok(true);
    }

    if matches.subcommand_matches("probe").is_some() {
        info!("🔍 Probing units for meters and batteries...");

        for (unit, plan) in service.probe_report().await? {
            println!("Unit '{}':", unit);
            for (slot, present) in plan.meters.iter().enumerate() {
                println!("  meter {}:   {}", slot, if *present { "✅ present" } else { "-" });
            }
            for (slot, present) in plan.batteries.iter().enumerate() {
                println!("  battery {}: {}", slot, if *present { "✅ present" } else { "-" });
            }
        }

        return Ok(true);
    }

    if matches.subcommand_matches("registers").is_some() {
        info!("🔍 Dumping decoded inverter registers...");

        for (unit, block) in service.registers_dump().await? {
            println!("═══ Unit '{}' ═══", unit);
            let sorted: BTreeMap<_, _> = block.into_iter().collect();
            for (id, value) in sorted {
                println!("{:<28} {}", id, value);
            }
        }

        return Ok(true);
    }

    Ok(false)
}
