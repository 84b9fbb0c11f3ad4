#![no_main]

use libfuzzer_sys::fuzz_target;
use perfalert::pushlog::parse_pushes;

fuzz_target!(|data: &[u8]| {
    // Arbitrary server responses must parse or fail, never panic
    if let Ok(pushes) = parse_pushes(data) {
        for pair in pushes.windows(2) {
            assert!(pair[0].date <= pair[1].date);
        }
    }
});
