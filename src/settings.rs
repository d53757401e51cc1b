use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use thiserror::Error;

/// Settings recognized in the `ExtruderSettings` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    SpeedPercentage,
    InfillLayerHeight,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown setting '{0}' (expected one of: SpeedPercentage, InfillLayerHeight)")]
pub struct UnknownSetting(pub String);

impl SettingKey {
    pub const ALL: [SettingKey; 2] = [SettingKey::SpeedPercentage, SettingKey::InfillLayerHeight];

    /// Key as written to the configuration file.
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::SpeedPercentage => "SpeedPercentage",
            SettingKey::InfillLayerHeight => "InfillLayerHeight",
        }
    }

    /// Range exposed by the operator control for this setting.
    ///
    /// The store never enforces it; callers check before `set`.
    pub fn range(self) -> RangeInclusive<i64> {
        match self {
            SettingKey::SpeedPercentage => 0..=100,
            SettingKey::InfillLayerHeight => 0..=100,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SettingKey::SpeedPercentage => "%",
            SettingKey::InfillLayerHeight => "",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SettingKey::SpeedPercentage => "Speed Percentage",
            SettingKey::InfillLayerHeight => "Infill Layer Height",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for SettingKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for SettingKey {
    type Err = UnknownSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSetting(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("speedpercentage".parse(), Ok(SettingKey::SpeedPercentage));
        assert_eq!("InfillLayerHeight".parse(), Ok(SettingKey::InfillLayerHeight));
        assert_eq!(" INFILLLAYERHEIGHT ".parse(), Ok(SettingKey::InfillLayerHeight));
    }

    #[test]
    fn test_parse_unknown() {
        let err = "Temperature".parse::<SettingKey>().unwrap_err();
        assert_eq!(err, UnknownSetting("Temperature".to_string()));
        assert!(err.to_string().contains("SpeedPercentage"));
    }

    #[test]
    fn test_ranges_match_controls() {
        assert!(SettingKey::SpeedPercentage.range().contains(&100));
        assert!(!SettingKey::SpeedPercentage.range().contains(&101));
        assert!(!SettingKey::InfillLayerHeight.range().contains(&-1));
    }
}
