//! `%(key)` style file-name templates.
//!
//! A template such as `%(variable)_%(model_version)_%(table)_%(period).nc` is rendered from an
//! attribute map into a concrete path, and a concrete file name can be parsed back into the
//! attribute values that produced it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::TemplateError;

/// Attribute values substituted into templates, keyed by placeholder name.
pub type Attributes = BTreeMap<String, String>;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Key(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileTemplate {
    template: String,
    tokens: Vec<Token>,
}

impl FileTemplate {
    pub fn new(template: &str) -> Self {
        let mut tokens = Vec::new();
        let mut rest = template;
        let mut literal = String::new();

        while let Some(start) = rest.find("%(") {
            let after = &rest[start + 2..];
            match after.find(')') {
                Some(end) => {
                    literal.push_str(&rest[..start]);
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Key(after[..end].to_owned()));
                    rest = &after[end + 1..];
                },
                None => break,
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Self { template: template.to_owned(), tokens }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// The extension written literally at the end of the template, as in `%(variable)_metrics.json`.
    /// None when the file name ends in a placeholder or its last dot is not followed by a plain
    /// alphanumeric suffix.
    pub fn literal_extension(&self) -> Option<&str> {
        match self.tokens.last()? {
            Token::Literal(l) => {
                let name = l.rsplit('/').next().unwrap_or(l);
                let (_, ext) = name.rsplit_once('.')?;
                if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) { Some(ext) } else { None }
            },
            Token::Key(_) => None,
        }
    }

    /// Substitute every placeholder. A placeholder with no attribute is an error.
    pub fn render(&self, attrs: &Attributes) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.template.len());
        for t in &self.tokens {
            match t {
                Token::Literal(l) => out.push_str(l),
                Token::Key(k) => {
                    let v = attrs.get(k)
                        .ok_or_else(|| TemplateError::MissingKey { key: k.clone(), template: self.template.clone() })?;
                    out.push_str(v);
                }
            }
        }
        Ok(out)
    }

    /// Like `render`, but placeholders with no attribute become `*` so the result can be used
    /// as a file-matching pattern.
    pub fn render_glob(&self, attrs: &Attributes) -> String {
        self.tokens.iter()
            .map(|t| match t {
                Token::Literal(l) => l.as_str(),
                Token::Key(k) => attrs.get(k).map(|s| s.as_str()).unwrap_or(WILDCARD),
            })
            .collect()
    }

    /// Recover the attribute values from a name that was rendered from this template.
    ///
    /// Each placeholder's value extends up to the first occurrence of the literal text that
    /// follows it. A placeholder repeated later in the template must repeat the same value.
    pub fn parse(&self, name: &str) -> Result<Attributes, TemplateError> {
        let no_match = || TemplateError::NoMatch { name: name.to_owned(), template: self.template.clone() };
        let mut out = Attributes::new();
        let mut pos = 0;

        for (i, t) in self.tokens.iter().enumerate() {
            let rest = &name[pos..];
            match t {
                Token::Literal(l) => {
                    if !rest.starts_with(l.as_str()) {
                        return Err(no_match());
                    }
                    pos += l.len();
                },
                Token::Key(k) => {
                    if let Some(v) = out.get(k) {
                        if !rest.starts_with(v.as_str()) {
                            return Err(no_match());
                        }
                        pos += v.len();
                        continue;
                    }

                    let value_len = match self.tokens.get(i + 1) {
                        None => rest.len(),
                        Some(Token::Literal(next)) => rest.find(next.as_str()).ok_or_else(no_match)?,
                        Some(Token::Key(next)) => {
                            // Two adjacent placeholders can only be split if the second is already known
                            let known = out.get(next).ok_or_else(no_match)?;
                            rest.find(known.as_str()).ok_or_else(no_match)?
                        }
                    };
                    out.insert(k.clone(), rest[..value_len].to_owned());
                    pos += value_len;
                }
            }
        }

        if pos != name.len() || self.render(&out)? != name {
            return Err(no_match());
        }
        Ok(out)
    }

    /// Parse `name` and check it agrees with every attribute in `fixed` that the template uses.
    pub fn matches(&self, name: &str, fixed: &Attributes) -> Option<Attributes> {
        let parsed = self.parse(name).ok()?;
        let consistent = parsed.iter()
            .all(|(k, v)| fixed.get(k).map(|f| f == v).unwrap_or(true));
        if consistent { Some(parsed) } else { None }
    }
}

/// Render `template` under `root`, making the result absolute and appending `.ext` unless the
/// rendered name already ends with it.
pub fn resolve_path(root: &Path, template: &FileTemplate, attrs: &Attributes, ext: Option<&str>) -> Result<PathBuf, TemplateError> {
    let rendered = template.render(attrs)?;
    let mut path = root.to_path_buf();
    // empty components come from blank attributes (e.g. an empty realm) and are dropped
    for component in rendered.split('/').filter(|c| !c.is_empty()) {
        path.push(component);
    }

    if let Some(ext) = ext {
        let suffix = format!(".{ext}");
        let has_ext = path.file_name()
            .map(|f| f.to_string_lossy().ends_with(&suffix))
            .unwrap_or(false);
        if !has_ext {
            let mut name = path.file_name().map(|f| f.to_os_string()).unwrap_or_default();
            name.push(&suffix);
            path.set_file_name(name);
        }
    }

    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir().map(|d| d.join(&path)).unwrap_or(path))
    }
}

/// List the files in the directory a template resolves to whose names match the template,
/// returning each path with its parsed attributes, sorted by path.
///
/// Placeholders missing from `fixed` act as wildcards. Only the last path component may
/// contain wildcards.
pub fn find_matching_files(root: &Path, template: &FileTemplate, fixed: &Attributes) -> std::io::Result<Vec<(PathBuf, Attributes)>> {
    let pattern = template.render_glob(fixed);
    let (dir_part, file_part) = match pattern.rfind('/') {
        Some(i) => (&pattern[..i], &pattern[i + 1..]),
        None => ("", pattern.as_str()),
    };
    if dir_part.contains(WILDCARD) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("wildcards are only supported in the file name of '{pattern}'")
        ));
    }

    let dir = if dir_part.is_empty() { root.to_path_buf() } else { root.join(dir_part) };
    if !dir.exists() {
        return Ok(Vec::new());
    }

    // Re-parse the full relative path so placeholders in the directory part are checked too
    let prefix_len = pattern.len() - file_part.len();
    let mut found = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let p = entry?.path();
        let fname = match p.file_name() {
            Some(f) => f.to_string_lossy().into_owned(),
            None => continue,
        };
        let candidate = format!("{}{}", &pattern[..prefix_len], fname);
        if let Some(attrs) = template.matches(&candidate, fixed) {
            found.push((p, attrs));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_literal_extension() {
        assert_eq!(FileTemplate::new("%(variable)_%(model_version).nc").literal_extension(), Some("nc"));
        assert_eq!(FileTemplate::new("out.d/%(variable)_metrics.xlsx").literal_extension(), Some("xlsx"));
        assert_eq!(FileTemplate::new("out.d/%(variable)_metrics").literal_extension(), None);
        assert_eq!(FileTemplate::new("%(variable)_2.5x2.5_metrics").literal_extension(), None);
        assert_eq!(FileTemplate::new("%(variable).%(ext)").literal_extension(), None);
    }

    #[test]
    fn test_render_and_parse_round_trip() {
        let t = FileTemplate::new("cmip5.%(model_version).historical.%(realization).mon.%(variable).%(period).AC.nc");
        let a = attrs(&[("model_version", "ACCESS1-0"), ("realization", "r1i1p1"), ("variable", "tas"), ("period", "198101-200512")]);
        let name = t.render(&a).unwrap();
        assert_eq!(name, "cmip5.ACCESS1-0.historical.r1i1p1.mon.tas.198101-200512.AC.nc");
        assert_eq!(t.parse(&name).unwrap(), a);
    }

    #[test]
    fn test_parse_with_repeated_and_trailing_key() {
        let t = FileTemplate::new("%(variable)/%(model)_%(variable)");
        let a = attrs(&[("variable", "pr"), ("model", "CESM2")]);
        let name = t.render(&a).unwrap();
        assert_eq!(t.parse(&name).unwrap(), a);
        assert!(t.parse("pr/CESM2_tas").is_err());
    }

    #[test]
    fn test_missing_placeholder_is_an_error() {
        let t = FileTemplate::new("%(variable)_%(model_version).nc");
        let err = t.render(&attrs(&[("variable", "tas")])).unwrap_err();
        assert!(matches!(err, TemplateError::MissingKey { ref key, .. } if key == "model_version"));
    }

    #[test]
    fn test_render_glob() {
        let t = FileTemplate::new("%(variable)_%(model_version).nc");
        assert_eq!(t.render_glob(&attrs(&[("variable", "tas")])), "tas_*.nc");
    }

    #[test]
    fn test_matches_rejects_inconsistent_attributes() {
        let t = FileTemplate::new("%(variable)_%(model_version).nc");
        let fixed = attrs(&[("variable", "tas")]);
        assert!(t.matches("tas_GFDL-CM4.nc", &fixed).is_some());
        assert!(t.matches("pr_GFDL-CM4.nc", &fixed).is_none());
        assert!(t.matches("tas_GFDL-CM4.json", &fixed).is_none());
    }

    #[test]
    fn test_resolve_path_appends_extension_once() {
        let t = FileTemplate::new("%(realm)/%(variable)_metrics");
        let a = attrs(&[("realm", ""), ("variable", "tas")]);
        let p = resolve_path(Path::new("/out"), &t, &a, Some("json")).unwrap();
        assert_eq!(p, PathBuf::from("/out/tas_metrics.json"));

        let t = FileTemplate::new("%(variable).json");
        let p = resolve_path(Path::new("/out"), &t, &a, Some("json")).unwrap();
        assert_eq!(p, PathBuf::from("/out/tas.json"));
    }

    #[test]
    fn test_find_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["tas_ModelB.nc", "tas_ModelA.nc", "pr_ModelA.nc", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let t = FileTemplate::new("%(variable)_%(model_version).nc");
        let found = find_matching_files(dir.path(), &t, &attrs(&[("variable", "tas")])).unwrap();
        let models: Vec<_> = found.iter().map(|(_, a)| a["model_version"].clone()).collect();
        assert_eq!(models, vec!["ModelA", "ModelB"]);
    }
}
