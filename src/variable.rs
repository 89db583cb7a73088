use std::fmt::Display;

use serde::Serialize;

use crate::error::LoadError;

/// Characters accepted between a variable name and its pressure level, e.g. `hus_850` or `ua-850`.
pub const DEFAULT_LEVEL_DELIMITERS: &str = "_-";

/// A variable as named in the run configuration: a base variable plus an optional pressure level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableId {
    /// The name exactly as it was given (`"ua_850"`)
    #[serde(skip)]
    pub long_name: String,
    #[serde(rename = "id")]
    pub var: String,
    /// Level in Pa
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
}

impl VariableId {
    pub fn parse(long_name: &str) -> Result<Self, LoadError> {
        Self::parse_with_delimiters(long_name, DEFAULT_LEVEL_DELIMITERS)
    }

    /// Split `long_name` on any of `delimiters`. If there is more than one token, the last
    /// must be a level in hPa and the first is the variable name.
    pub fn parse_with_delimiters(long_name: &str, delimiters: &str) -> Result<Self, LoadError> {
        let tokens: Vec<&str> = long_name.split(|c| delimiters.contains(c)).collect();
        let (var, level) = match tokens.as_slice() {
            [var] => (var.to_string(), None),
            [var, .., last] => {
                let hpa: f64 = last.parse()
                    .map_err(|_| LoadError::ConfigInvalid(format!(
                        "could not parse a pressure level from the last part of variable '{long_name}'"
                    )))?;
                (var.to_string(), Some(hpa * 100.0))
            },
            [] => (long_name.to_owned(), None),
        };

        if var.is_empty() {
            return Err(LoadError::ConfigInvalid(format!("variable '{long_name}' has an empty name")));
        }

        Ok(Self { long_name: long_name.to_owned(), var, level })
    }

    /// Level in hPa, for file names and messages.
    pub fn level_hpa(&self) -> Option<f64> {
        self.level.map(|l| l / 100.0)
    }

    /// The `-850` style suffix used in output file names, empty with no level.
    pub fn level_suffix(&self) -> String {
        match self.level_hpa() {
            Some(l) => format!("-{}", l.round() as i64),
            None => String::new(),
        }
    }
}

impl Display for VariableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.long_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(VariableId::parse("hus_850").unwrap().level, Some(85000.0));
        assert_eq!(VariableId::parse("hus").unwrap().level, None);
        assert_eq!(VariableId::parse("ua-850").unwrap().level, Some(85000.0));
        assert_eq!(VariableId::parse("ua-850").unwrap().var, "ua");
    }

    #[test]
    fn test_custom_delimiter() {
        // with only '-' as a delimiter, an underscore is part of the name
        let v = VariableId::parse_with_delimiters("rlut_cs", "-").unwrap();
        assert_eq!(v.var, "rlut_cs");
        assert_eq!(v.level, None);
    }

    #[test]
    fn test_non_numeric_level_is_config_error() {
        let err = VariableId::parse("rlut_cs").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_level_suffix() {
        assert_eq!(VariableId::parse("ta_200").unwrap().level_suffix(), "-200");
        assert_eq!(VariableId::parse("pr").unwrap().level_suffix(), "");
    }
}
