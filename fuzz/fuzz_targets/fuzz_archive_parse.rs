#![no_main]

use layerfs_rs::stream::ReadOnly;
use layerfs_rs::{ArchiveContainer, LockedStream};
use libfuzzer_sys::fuzz_target;
use std::io::{Cursor, Read};

fuzz_target!(|data: &[u8]| {
    // Either format is detected from the bytes themselves
    let stream = LockedStream::owned(ReadOnly(Cursor::new(data.to_vec())));
    let archive = match ArchiveContainer::open_read_stream(stream) {
        Ok(archive) => archive,
        Err(_) => return, // Expected for invalid data
    };

    // Reading every subfile must fail cleanly, never panic
    for index in 0..archive.num_subfiles() {
        let _ = archive.subfile_name(index);
        let _ = archive.read_subfile(index);
        if let Ok(mut reader) = archive.open_read_subfile(index) {
            let mut sink = Vec::new();
            let _ = reader.by_ref().take(1 << 20).read_to_end(&mut sink);
        }
    }

    let _ = archive.verify();
    let _ = archive.verify_signatures();
    let _ = archive.scan_directory("");
    let _ = archive.find_subfile("../../../etc/passwd");
});
