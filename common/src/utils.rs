pub fn format_duration(duration: std::time::Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{}ms", millis);
    }
    let secs = duration.as_secs();
    if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

const SOURCE_SCHEMES: [&str; 5] = ["rtsp://", "rtsps://", "http://", "https://", "sim://"];

pub fn validate_source_uri(uri: &str) -> Result<(), String> {
    match SOURCE_SCHEMES.iter().find(|scheme| uri.starts_with(*scheme)) {
        Some(scheme) if uri.len() > scheme.len() => Ok(()),
        Some(_) => Err(format!("source URI '{}' has no host", uri)),
        None => Err(format!(
            "source URI must start with one of {}",
            SOURCE_SCHEMES.join(", ")
        )),
    }
}

pub fn generate_unique_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn validates_source_uris() {
        assert!(validate_source_uri("rtsp://10.0.0.5:554/stream1").is_ok());
        assert!(validate_source_uri("sim://lobby").is_ok());
        assert!(validate_source_uri("rtsp://").is_err());
        assert!(validate_source_uri("ftp://camera").is_err());
    }
}
