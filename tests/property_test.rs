//! Property-based tests for invariants

use pagestride::stride::{read_length_header, run_pages};
use pagestride::{Algorithm, CompressorBuilder, Padding, LENGTH_HEADER_LEN, PAGE_SIZE};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_roundtrip_any_bytes(data in proptest::collection::vec(any::<u8>(), 1..=16 * PAGE_SIZE)) {
        let compressor = CompressorBuilder::new().build();
        let run = compressor.compress_bytes(&data).unwrap();
        prop_assert_eq!(compressor.decode_run(&run.pages, data.len()).unwrap(), data);
    }

    #[test]
    fn prop_padding_is_zero(data in proptest::collection::vec(0u8..4, 1..=4 * PAGE_SIZE)) {
        let compressor = CompressorBuilder::new().build();
        let run = compressor.compress_bytes(&data).unwrap();
        let header = read_length_header(run.pages[0].as_slice()).unwrap();
        prop_assert_eq!(run.pages.len(), run_pages(header));
        let framed: Vec<u8> = run.pages.iter().flat_map(|p| p.as_slice().iter().copied()).collect();
        prop_assert!(framed[LENGTH_HEADER_LEN + header..].iter().all(|&b| b == 0));
        prop_assert_eq!(run.padding == Padding::WorstCase, header > data.len());
    }

    #[test]
    fn prop_store_codec_frames_verbatim(data in proptest::collection::vec(any::<u8>(), 1..=2 * PAGE_SIZE)) {
        let compressor = CompressorBuilder::new().algorithm(Algorithm::None).build();
        let run = compressor.compress_bytes(&data).unwrap();
        prop_assert_eq!(run.compressed_len, data.len());
        let framed: Vec<u8> = run.pages.iter().flat_map(|p| p.as_slice().iter().copied()).collect();
        prop_assert_eq!(&framed[LENGTH_HEADER_LEN..LENGTH_HEADER_LEN + data.len()], &data[..]);
    }
}
