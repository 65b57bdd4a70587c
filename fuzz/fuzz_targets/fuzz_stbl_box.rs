#![no_main]

use isobmff_muxer::{Decode, Encode, aux::SampleTableAccessor, boxes::StblBox};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok((stbl_box, _)) = StblBox::decode(data) else {
        return;
    };

    // 不整合なテーブルでもパニックせずに走査できる
    let accessor = SampleTableAccessor::new(&stbl_box);
    for sample in accessor.samples().take(10_000) {
        let _ = sample.cts();
    }

    let _ = stbl_box.encode_to_vec();
});
