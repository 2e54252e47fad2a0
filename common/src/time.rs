use std::time::{SystemTime, UNIX_EPOCH};

pub type TimestampMillis = u64;
pub type TimestampSeconds = u64;

// Get the current time in milliseconds since UNIX epoch
pub fn get_current_time_in_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMillis)
        .unwrap_or(0)
}

// Get the current time in seconds since UNIX epoch
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_and_seconds_agree() {
        let millis = get_current_time_in_millis();
        let seconds = get_current_time_in_seconds();
        // allow one second of slack between the two reads
        assert!(millis / 1000 >= seconds - 1);
        assert!(millis / 1000 <= seconds + 1);
    }
}
