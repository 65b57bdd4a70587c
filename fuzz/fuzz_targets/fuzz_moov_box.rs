#![no_main]

use isobmff_muxer::{Decode, Encode, boxes::MoovBox};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((moov_box, _)) = MoovBox::decode(data) {
        let _ = moov_box.encode_to_vec();
    }
});
