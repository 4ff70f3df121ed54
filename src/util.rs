use chrono::Utc;
use mac_address::get_mac_address;

pub fn get_device_mac() -> String {
    get_mac_address()
        .ok()
        .flatten()
        .map(|addr| {
            addr.to_string()
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_uppercase()
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}
