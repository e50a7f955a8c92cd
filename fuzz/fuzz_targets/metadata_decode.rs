#![no_main]

use libfuzzer_sys::fuzz_target;

use fetchcache::cache::Metadata;

fuzz_target!(|data: &[u8]| {
    if let Ok(metadata) = Metadata::decode(data) {
        // Anything that decodes must encode back to the same bytes.
        let encoded = metadata.encode().expect("decoded metadata encodes");
        assert_eq!(encoded.as_ref(), data);
    }
});
