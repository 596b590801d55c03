//! Configuration through detection and bring-up on emulated boards.

use ghz_bringup::Bringup;
use ghz_fpga::config::{EmulatedBoard, GhzConfig};
use ghz_fpga::lab;

#[tokio::test(start_paused = true)]
async fn test_configured_lab_comes_up() {
    let mut config = GhzConfig::default();
    config.bringup.seed = Some(1);
    config.emulator.dacs.push(EmulatedBoard { number: 2, build: 8 });

    let group = lab::open_group(&config).await.unwrap();
    let report = Bringup::new(config.bringup.clone()).bringup_group(&group).await;
    assert_eq!(report.boards.len(), 3);
    assert!(report.all_passed(), "{report}");
    group.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_emulated_build_is_skipped() {
    let mut config = GhzConfig::default();
    config.emulator.dacs.push(EmulatedBoard { number: 9, build: 15 });

    let group = lab::open_group(&config).await.unwrap();
    assert!(group.registry().find("Lab DAC 9").is_none());
    assert_eq!(group.registry().len(), 2);
}
