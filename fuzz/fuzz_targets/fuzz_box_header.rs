#![no_main]

use isobmff_muxer::{BoxHeader, Decode, Encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok((header, header_size)) = BoxHeader::decode(data) else {
        return;
    };
    assert_eq!(header.external_size(), header_size);

    let encoded = header.encode_to_vec().expect("encode");
    assert_eq!(encoded.len(), header_size);

    if let Ok((header2, payload)) = BoxHeader::decode_header_and_payload(data) {
        assert_eq!(header, header2);
        assert!(payload.len() + header_size <= data.len());
    }
});
