//! Who ran what, where and with which tools. Collected once per run and attached to every
//! JSON result file.

use std::collections::BTreeMap;
use std::process::Command;

use itertools::Itertools;
use serde::Serialize;

/// External tools asked for their version. A tool that is missing or fails is left out.
const VERSION_COMMANDS: [(&str, &str, &[&str]); 3] = [
    ("netcdf", "nc-config", &["--version"]),
    ("rustc", "rustc", &["--version"]),
    ("git", "git", &["--version"]),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Platform {
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub platform: Platform,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "commandLine")]
    pub command_line: String,
    pub date: String,
    pub packages: BTreeMap<String, String>,
}

impl Provenance {
    /// Gather provenance for the current process. Never fails: anything that cannot be
    /// determined is reported as "unknown" or omitted.
    pub fn collect() -> Self {
        let platform = Platform {
            os: std::env::consts::OS.to_owned(),
            version: command_output("uname", &["-r"]).unwrap_or_else(|| "unknown".to_owned()),
            name: command_output("hostname", &[]).unwrap_or_else(|| "unknown".to_owned()),
        };

        let user_id = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_owned());

        let mut packages = BTreeMap::new();
        packages.insert(env!("CARGO_PKG_NAME").to_owned(), env!("CARGO_PKG_VERSION").to_owned());
        for (name, cmd, args) in VERSION_COMMANDS {
            match command_output(cmd, args) {
                Some(v) => { packages.insert(name.to_owned(), v); },
                None => log::debug!("Could not determine the version of {name}"),
            }
        }

        Self {
            platform,
            user_id,
            command_line: std::env::args().join(" "),
            date: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            packages,
        }
    }
}

/// First line of a command's standard output, if it ran successfully.
fn command_output(cmd: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(cmd).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().next()?.trim();
    if line.is_empty() { None } else { Some(line.to_owned()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_command_is_none() {
        assert_eq!(command_output("this-command-does-not-exist-pmp", &[]), None);
    }

    #[test]
    fn test_collect_never_fails() {
        let prov = Provenance::collect();
        assert!(prov.packages.contains_key(env!("CARGO_PKG_NAME")));
        assert!(!prov.date.is_empty());
        let v = serde_json::to_value(&prov).unwrap();
        assert!(v["platform"]["OS"].is_string());
        assert!(v["userId"].is_string());
    }
}
