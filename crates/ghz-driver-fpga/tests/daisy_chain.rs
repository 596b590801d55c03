//! Integration tests for board detection and synchronized daisy-chain runs
//! against emulated boards.

use ghz_core::codec::{DacChannel, DemodConfig, FilterFunction};
use ghz_core::{BoardAddress, BoardTimeout, FpgaError};
use ghz_driver_fpga::emulator::{AdcEmulator, DacEmulator};
use ghz_driver_fpga::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const DAC1: BoardAddress = BoardAddress::dac(1);
const DAC2: BoardAddress = BoardAddress::dac(2);
const ADC3: BoardAddress = BoardAddress::adc(3);

/// Two DACs and one ADC, all detected and connected.
async fn lab() -> (Arc<EmulatedEthernet>, BoardGroup) {
    let ethernet = Arc::new(EmulatedEthernet::new(1));
    ethernet.attach(DacEmulator::new(1, 11));
    ethernet.attach(DacEmulator::new(2, 11));
    ethernet.attach(AdcEmulator::new(3, 6));
    let group = BoardGroup::new(ethernet.clone(), GroupSettings::new("Test", 1));
    let report = assert_ok!(group.refresh().await);
    assert_eq!(report.added.len(), 3);
    (ethernet, group)
}

fn chain() -> DaisyChain {
    DaisyChain::new(DAC1, vec![DAC2, ADC3], vec![5, 10])
}

fn adc_sequence(mode: AcquisitionMode) -> Sequence {
    Sequence::Adc(AdcSequence {
        mode,
        filter: FilterFunction::new(vec![255; 64]),
        demods: DemodConfig::new(),
        start_delay: 2,
    })
}

fn dac_sequence() -> Sequence {
    Sequence::Dac(DacSequence::new(vec![0x1234; 300], Duration::from_micros(10)))
}

/// Register frames only: 56 bytes for DACs, 59 for ADCs.
fn register_frames(ethernet: &EmulatedEthernet) -> Vec<ghz_core::MacAddress> {
    ethernet
        .transcript()
        .into_iter()
        .filter(|f| matches!(f.payload.len(), 56 | 59))
        .map(|f| f.destination)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_detection_skips_unsupported_builds() {
    let ethernet = Arc::new(EmulatedEthernet::new(1));
    ethernet.attach(DacEmulator::new(1, 11));
    ethernet.attach(DacEmulator::new(7, 15));
    ethernet.attach(AdcEmulator::new(3, 6));
    ethernet.attach(AdcEmulator::new(4, 7));
    let group = BoardGroup::new(ethernet.clone(), GroupSettings::new("Test", 1));

    let found = group.detect().await.unwrap();
    assert_eq!(
        found,
        vec![
            DetectedBoard {
                name: "Test DAC 1".into(),
                address: DAC1,
                build: 11
            },
            DetectedBoard {
                name: "Test ADC 3".into(),
                address: ADC3,
                build: 6
            },
        ]
    );
    assert_eq!(ethernet.open_contexts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_drops_vanished_boards() {
    let (ethernet, group) = lab().await;
    assert_eq!(group.registry().list_dacs().len(), 2);
    assert_eq!(group.registry().list_adcs().len(), 1);

    let again = assert_ok!(group.refresh().await);
    assert_eq!(again, RefreshReport::default());

    ethernet.detach(DAC2.mac());
    let report = group.refresh().await.unwrap();
    assert_eq!(report.removed, vec!["Test DAC 2".to_string()]);
    assert!(group.registry().find("Test DAC 2").is_none());
    assert!(group.registry().find("Test DAC 1").is_some());

    assert_ok!(group.shutdown().await);
    assert!(group.registry().is_empty());
    assert_eq!(ethernet.open_contexts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_synchronized_run_collects_every_board() {
    let (_ethernet, group) = lab().await;
    let mut sequences = BTreeMap::new();
    sequences.insert(DAC1, dac_sequence());
    sequences.insert(ADC3, adc_sequence(AcquisitionMode::Average));

    let data = group
        .run_synchronized(&chain(), &sequences, 60, true)
        .await
        .unwrap();
    assert_eq!(data.len(), 2);

    let (address, RunData::Timing(timing)) = &data[0] else {
        panic!("expected timing data first, got {:?}", data[0]);
    };
    assert_eq!(*address, DAC1);
    assert_eq!(timing.len(), 60);
    assert_eq!(timing[0], 1000);
    assert_eq!(timing[59], 1059);

    let (address, RunData::Average(block)) = &data[1] else {
        panic!("expected average data second, got {:?}", data[1]);
    };
    assert_eq!(*address, ADC3);
    assert_eq!(block.len(), 8192);
    assert_eq!(block.i[300], 300);
    assert_eq!(block.q[300], -300);
}

#[tokio::test(start_paused = true)]
async fn test_slaves_are_armed_before_the_master() {
    let (ethernet, group) = lab().await;
    let mut sequences = BTreeMap::new();
    sequences.insert(DAC1, dac_sequence());
    sequences.insert(ADC3, adc_sequence(AcquisitionMode::Demodulate));
    ethernet.clear_transcript();

    let data = group
        .run_synchronized(&chain(), &sequences, 3, true)
        .await
        .unwrap();

    assert_eq!(
        register_frames(&ethernet),
        vec![ADC3.mac(), DAC2.mac(), DAC1.mac()]
    );

    let (_, RunData::Demod(block)) = &data[1] else {
        panic!("expected demodulated data, got {:?}", data[1]);
    };
    assert_eq!(block.channels[4].i, vec![4, 15, 26]);
}

#[tokio::test(start_paused = true)]
async fn test_discarded_run_returns_no_data() {
    let (_ethernet, group) = lab().await;
    let mut sequences = BTreeMap::new();
    sequences.insert(DAC1, dac_sequence());
    sequences.insert(DAC2, dac_sequence());

    let data = group
        .run_synchronized(&chain(), &sequences, 30, false)
        .await
        .unwrap();
    assert_eq!(data, vec![(DAC1, RunData::Discarded), (DAC2, RunData::Discarded)]);
}

#[tokio::test(start_paused = true)]
async fn test_chain_errors_before_any_traffic() {
    let (ethernet, group) = lab().await;
    let mut sequences = BTreeMap::new();
    sequences.insert(DAC1, dac_sequence());
    ethernet.clear_transcript();

    let mismatched = DaisyChain::new(DAC1, vec![DAC2, ADC3], vec![5]);
    let err = group
        .run_synchronized(&mismatched, &sequences, 30, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FpgaError::ChainMismatch { slaves: 2, delays: 1 }));

    let adc_master = DaisyChain::new(ADC3, vec![DAC1], vec![0]);
    let mut adc_first = BTreeMap::new();
    adc_first.insert(ADC3, adc_sequence(AcquisitionMode::Average));
    adc_first.insert(DAC1, dac_sequence());
    let err = group
        .run_synchronized(&adc_master, &adc_first, 30, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FpgaError::InvalidMaster(a) if a == ADC3));

    let mut stray = sequences.clone();
    stray.insert(BoardAddress::dac(9), dac_sequence());
    let err = group
        .run_synchronized(&chain(), &stray, 30, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FpgaError::Protocol(_)));

    let mut wrong_class = BTreeMap::new();
    wrong_class.insert(DAC1, adc_sequence(AcquisitionMode::Average));
    let err = group
        .run_synchronized(&chain(), &wrong_class, 30, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FpgaError::Protocol(_)));

    let missing = DaisyChain::new(DAC1, vec![BoardAddress::dac(5)], vec![0]);
    let err = group
        .run_synchronized(&missing, &sequences, 30, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FpgaError::NotConnected(_)));

    assert!(ethernet.transcript().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_late_board_reports_executions() {
    let (_ethernet, group) = lab().await;
    let mut sequence = DacSequence::new(vec![0x1234; 300], Duration::from_micros(10));
    // The emulated board reports one timer per rep, so half the packets
    // never arrive.
    sequence.timers_per_rep = 2;
    let mut sequences = BTreeMap::new();
    sequences.insert(DAC1, Sequence::Dac(sequence));

    let err = assert_err!(group.run_synchronized(&chain(), &sequences, 60, true).await);
    let FpgaError::BoardsTimedOut(boards) = err else {
        panic!("expected a timeout, got {err:?}");
    };
    assert_eq!(
        boards,
        vec![BoardTimeout {
            board: DAC1,
            expected: 60,
            executed: Some(60)
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_board_times_out() {
    let (ethernet, group) = lab().await;
    let mut sequences = BTreeMap::new();
    sequences.insert(DAC1, dac_sequence());
    sequences.insert(DAC2, dac_sequence());
    ethernet.set_muted(DAC2.mac(), true);

    let err = group
        .run_synchronized(&chain(), &sequences, 30, true)
        .await
        .unwrap_err();
    let FpgaError::BoardsTimedOut(boards) = err else {
        panic!("expected a timeout, got {err:?}");
    };
    assert_eq!(boards.len(), 1);
    assert_eq!(boards[0].board, DAC2);
    assert_eq!(boards[0].executed, None);
}

#[tokio::test(start_paused = true)]
async fn test_run_waits_for_test_mode_to_finish() {
    let (ethernet, group) = lab().await;
    let mut sequences = BTreeMap::new();
    sequences.insert(DAC1, dac_sequence());
    ethernet.clear_transcript();
    let entered = tokio::sync::Notify::new();
    let (signal, transport) = (&entered, &*ethernet);

    let hold = group.test_mode(|| async move {
        signal.notify_one();
        tokio::time::sleep(Duration::from_secs(5)).await;
        register_frames(transport)
    });
    let run = async {
        entered.notified().await;
        group.run_synchronized(&chain(), &sequences, 3, true).await
    };
    let (seen_during_test_mode, data) = tokio::join!(hold, run);

    assert!(seen_during_test_mode.is_empty());
    assert_eq!(assert_ok!(data).len(), 1);
    assert_eq!(register_frames(&ethernet), vec![DAC2.mac(), DAC1.mac()]);
}

#[tokio::test(start_paused = true)]
async fn test_operations_on_one_board_do_not_interleave() {
    let (ethernet, group) = lab().await;
    let board = group.registry().get(DAC2).unwrap();
    let dac = board.as_dac().unwrap().clone();
    // The first operation's readback never arrives, so it holds the board
    // until its timeout.
    ethernet.set_muted(DAC2.mac(), true);
    ethernet.clear_transcript();

    let first = dac.set_cross_delay(DacChannel::A, 5);
    let second = async {
        tokio::task::yield_now().await;
        dac.set_cross_delay(DacChannel::B, -3).await
    };
    let observer = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let in_flight = ethernet.transcript().len();
        ethernet.set_muted(DAC2.mac(), false);
        in_flight
    };
    let (first, second, in_flight) = tokio::join!(first, second, observer);

    assert_eq!(in_flight, 1);
    assert!(matches!(assert_err!(first), FpgaError::Timeout { .. }));
    assert_ok!(second);
    assert_eq!(ethernet.transcript().len(), 3);
}
