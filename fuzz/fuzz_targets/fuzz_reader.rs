#![no_main]

use std::io::Cursor;

use isobmff_muxer::demux::Mp4FileReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(mut reader) = Mp4FileReader::read(Cursor::new(data)) else {
        return;
    };
    let track_ids: Vec<u32> = reader.tracks().iter().map(|t| t.track_id).collect();
    for track_id in track_ids {
        let Ok(samples) = reader.samples(track_id) else {
            continue;
        };
        let samples = samples.iter().take(1000).copied().collect::<Vec<_>>();
        for sample in samples {
            let _ = reader.read_sample_data(&sample);
        }
    }
});
