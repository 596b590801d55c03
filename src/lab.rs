//! Assemble a board group from configuration.

use crate::config::{GhzConfig, TransportMode};
use anyhow::{anyhow, Context, Result};
use ghz_driver_fpga::emulator::{AdcEmulator, DacEmulator};
use ghz_driver_fpga::{BoardGroup, DirectEthernet, EmulatedEthernet, RelayEthernet};
use std::sync::Arc;

/// Open the configured direct-ethernet adapter.
///
/// In emulated mode the boards listed in the `emulator` section are attached
/// to an in-process adapter.
pub async fn open_ethernet(config: &GhzConfig) -> Result<Arc<dyn DirectEthernet>> {
    let host_mac = config.transport.host_mac().map_err(|e| anyhow!(e))?;
    match config.transport.mode {
        TransportMode::Emulated => {
            let ethernet = EmulatedEthernet::with_host_mac(config.transport.port, host_mac);
            for board in &config.emulator.dacs {
                ethernet.attach(DacEmulator::new(board.number, board.build));
            }
            for board in &config.emulator.adcs {
                ethernet.attach(AdcEmulator::new(board.number, board.build));
            }
            tracing::info!(
                dacs = config.emulator.dacs.len(),
                adcs = config.emulator.adcs.len(),
                "using emulated boards"
            );
            Ok(Arc::new(ethernet))
        }
        TransportMode::Relay => {
            let relay = RelayEthernet::connect(&config.transport.relay_address, host_mac)
                .await
                .with_context(|| {
                    format!("Failed to reach frame relay at {}", config.transport.relay_address)
                })?;
            Ok(Arc::new(relay))
        }
    }
}

/// Open the adapter, detect boards and connect them.
pub async fn open_group(config: &GhzConfig) -> Result<BoardGroup> {
    let ethernet = open_ethernet(config).await?;
    let group = BoardGroup::new(ethernet, config.group_settings());
    let report = group
        .refresh()
        .await
        .with_context(|| format!("Board detection failed for group {}", config.group.name))?;
    tracing::info!(
        group = %config.group.name,
        boards = report.added.len(),
        "boards connected"
    );
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatedBoard;

    #[tokio::test(start_paused = true)]
    async fn test_emulated_group_from_config() {
        let mut config = GhzConfig::default();
        config.emulator.dacs.push(EmulatedBoard { number: 4, build: 8 });
        let group = open_group(&config).await.unwrap();
        assert_eq!(group.registry().list_dacs().len(), 2);
        assert_eq!(group.registry().list_adcs().len(), 1);
        assert!(group.registry().find("Lab DAC 4").is_some());
        group.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_relay_has_context() {
        let mut config = GhzConfig::default();
        config.transport.mode = TransportMode::Relay;
        config.transport.relay_address = "127.0.0.1:1".to_string();
        let err = open_ethernet(&config).await.err().unwrap();
        assert!(err.to_string().contains("frame relay"));
    }
}
