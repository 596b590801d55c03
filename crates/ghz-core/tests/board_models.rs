//! Codec selection across every supported firmware build.

use ghz_core::codec::{board_model, detection_ping, readback_build, readback_len, BoardModel};
use ghz_core::{BoardClass, FpgaError};

const SUPPORTED: [(BoardClass, &[u8]); 2] = [
    (BoardClass::Dac, &[7, 8, 11, 12]),
    (BoardClass::Adc, &[1, 2, 3, 6]),
];

#[test]
fn test_every_supported_build_has_a_codec() {
    for (class, builds) in SUPPORTED {
        for &build in builds {
            let model = board_model(class, build).unwrap();
            assert_eq!(model.class(), class);
            let codec = model.codec();
            assert_eq!(codec.build(), build);
            assert_eq!(codec.readback_len(), readback_len(class));
            assert_eq!(codec.encode_ping().len(), codec.register_len());
            assert_eq!(detection_ping(class).len(), codec.register_len());
        }
    }
}

#[test]
fn test_unsupported_builds_are_rejected() {
    for (class, build) in [(BoardClass::Dac, 15), (BoardClass::Dac, 1), (BoardClass::Adc, 7)] {
        let err = board_model(class, build).unwrap_err();
        assert!(
            matches!(err, FpgaError::UnsupportedBuild { class: c, build: b } if c == class && b == build),
            "{err}"
        );
    }
}

#[test]
fn test_detection_reads_build_from_readback() {
    for (class, builds) in SUPPORTED {
        for &build in builds {
            let model = board_model(class, build).unwrap();
            let codec = model.codec();
            // Place the build byte where a real board would report it.
            let mut readback = vec![0u8; codec.readback_len()];
            let offset = match model {
                BoardModel::Dac(_) => 51,
                BoardModel::Adc(_) => 0,
            };
            readback[offset] = build;
            assert_eq!(readback_build(class, &readback), Some(build));
            assert_eq!(codec.decode_readback(&readback).build, build);
        }
    }
}

#[test]
fn test_sram_pages_reject_out_of_range_index() {
    for (class, builds) in SUPPORTED {
        for &build in builds {
            let model = board_model(class, build).unwrap();
            let codec = model.codec();
            let last = codec.sram_pages() - 1;
            assert!(codec.encode_sram_page(last, &[1, 2, 3, 4]).is_ok());
            assert!(matches!(
                codec.encode_sram_page(codec.sram_pages(), &[1, 2, 3, 4]),
                Err(FpgaError::PageOutOfRange { .. })
            ));
        }
    }
}
