#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    // Any accepted timestamp must survive truncation and window maths
    if let Ok(t) = gridstat::units::parse_reading_timestamp(s) {
        let hour = gridstat::units::floor_to_hour(t);
        assert!(hour <= t);
        let _ = gridstat::units::cutoff(t);
    }
    let _ = gridstat::units::parse_reading_date(s);
});
