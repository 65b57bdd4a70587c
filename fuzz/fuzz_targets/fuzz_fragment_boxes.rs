#![no_main]

use isobmff_muxer::{
    Decode, Encode,
    boxes::{MfraBox, MoofBox},
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((moof_box, _)) = MoofBox::decode(data) {
        let _ = moof_box.encode_to_vec();
    }
    if let Ok((mfra_box, _)) = MfraBox::decode(data) {
        let _ = mfra_box.encode_to_vec();
    }
});
