use chrono::Duration;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Sliding window over which a volume baseline is computed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Display,
    Deserialize,
    Serialize,
)]
pub enum RollingWindow {
    #[serde(rename = "1m")]
    #[display("1m")]
    OneMinute,
    #[serde(rename = "5m")]
    #[display("5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    #[display("15m")]
    FifteenMinutes,
    #[default]
    #[serde(rename = "1h")]
    #[display("1h")]
    OneHour,
    #[serde(rename = "4h")]
    #[display("4h")]
    FourHours,
    #[serde(rename = "1d")]
    #[display("1d")]
    OneDay,
}

impl RollingWindow {
    pub const ALL: [RollingWindow; 6] = [
        RollingWindow::OneMinute,
        RollingWindow::FiveMinutes,
        RollingWindow::FifteenMinutes,
        RollingWindow::OneHour,
        RollingWindow::FourHours,
        RollingWindow::OneDay,
    ];

    /// Parse from the short label used in configuration (eg/ "5m", "1h").
    pub fn parse(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|window| window.to_string().eq_ignore_ascii_case(label.trim()))
    }

    pub fn secs(&self) -> i64 {
        match self {
            RollingWindow::OneMinute => 60,
            RollingWindow::FiveMinutes => 5 * 60,
            RollingWindow::FifteenMinutes => 15 * 60,
            RollingWindow::OneHour => 60 * 60,
            RollingWindow::FourHours => 4 * 60 * 60,
            RollingWindow::OneDay => 24 * 60 * 60,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches_display() {
        for window in RollingWindow::ALL {
            assert_eq!(RollingWindow::parse(&window.to_string()), Some(window));
        }
        assert_eq!(RollingWindow::parse(" 4H "), Some(RollingWindow::FourHours));
        assert_eq!(RollingWindow::parse("2h"), None);
    }

    #[test]
    fn test_windows_ascend() {
        let secs: Vec<i64> = RollingWindow::ALL.iter().map(RollingWindow::secs).collect();
        assert!(secs.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_display_matches_serde_label() {
        for window in RollingWindow::ALL {
            let json = serde_json::to_string(&window).unwrap();
            assert_eq!(json, format!("\"{window}\""));
        }
    }

    #[test]
    fn test_serde_uses_short_label() {
        let json = serde_json::to_string(&RollingWindow::FifteenMinutes).unwrap();
        assert_eq!(json, "\"15m\"");
        let window: RollingWindow = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(window, RollingWindow::OneDay);
    }
}
