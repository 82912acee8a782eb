//! Parser for `/etc/os-release`.

use std::collections::BTreeMap;

/// Fields of interest from `/etc/os-release`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OsRelease {
    /// `ID`, lower case.
    pub id: String,
    /// `ID_LIKE`, split on whitespace.
    pub id_like: Vec<String>,
    /// `NAME`.
    pub name: String,
    /// `VERSION_ID`.
    pub version_id: String,
    /// `PRETTY_NAME`.
    pub pretty_name: String,
    /// Every other key.
    pub extras: BTreeMap<String, String>,
}

impl OsRelease {
    /// Parses the `KEY=value` lines of an os-release file.
    ///
    /// Comments and blank lines are skipped, values may be single or double
    /// quoted, and lines without `=` are ignored.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut release = Self::default();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, raw)) = line.split_once('=') else {
                continue;
            };
            let value = unquote(raw.trim());
            match key.trim() {
                "ID" => release.id = value.to_lowercase(),
                "ID_LIKE" => {
                    release.id_like = value.split_whitespace().map(str::to_lowercase).collect();
                }
                "NAME" => release.name = value,
                "VERSION_ID" => release.version_id = value,
                "PRETTY_NAME" => release.pretty_name = value,
                other => {
                    release.extras.insert(other.to_owned(), value);
                }
            }
        }
        release
    }

    /// Returns the leading numeric components of `VERSION_ID`, so `"16.04"`
    /// yields `[16, 4]`.
    #[must_use]
    pub fn version_numbers(&self) -> Vec<u32> {
        self.version_id
            .split('.')
            .map_while(|part| part.parse().ok())
            .collect()
    }

    /// Returns a readable label for log lines.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.pretty_name.is_empty() {
            &self.id
        } else {
            &self.pretty_name
        }
    }
}

fn unquote(raw: &str) -> String {
    let inner = ['"', '\'']
        .iter()
        .find_map(|quote| {
            raw.strip_prefix(*quote)
                .and_then(|rest| rest.strip_suffix(*quote))
        })
        .unwrap_or(raw);
    inner.replace("\\\"", "\"").replace("\\\\", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const UBUNTU: &str = r#"NAME="Ubuntu"
VERSION="16.04.7 LTS (Xenial Xerus)"
ID=ubuntu
ID_LIKE=debian
PRETTY_NAME="Ubuntu 16.04.7 LTS"
VERSION_ID="16.04"
"#;

    #[test]
    fn parses_quoted_and_bare_values() {
        let release = OsRelease::parse(UBUNTU);
        assert_eq!(release.id, "ubuntu");
        assert_eq!(release.id_like, vec!["debian"]);
        assert_eq!(release.name, "Ubuntu");
        assert_eq!(release.version_id, "16.04");
        assert_eq!(release.version_numbers(), vec![16, 4]);
        assert_eq!(
            release.extras.get("VERSION").map(String::as_str),
            Some("16.04.7 LTS (Xenial Xerus)")
        );
        assert_eq!(release.label(), "Ubuntu 16.04.7 LTS");
    }

    #[test]
    fn skips_comments_blank_and_malformed_lines() {
        let release = OsRelease::parse("# vendor file\n\nnot a pair\nID='fedora'\n");
        assert_eq!(release.id, "fedora");
        assert!(release.extras.is_empty());
        assert_eq!(release.label(), "fedora");
    }

    #[rstest]
    #[case("\"7\"", vec![7])]
    #[case("2023.02.9", vec![2023, 2, 9])]
    #[case("", vec![])]
    fn version_numbers_stop_at_the_first_non_number(
        #[case] version: &str,
        #[case] expected: Vec<u32>,
    ) {
        let release = OsRelease::parse(&format!("VERSION_ID={version}"));
        assert_eq!(release.version_numbers(), expected);
    }
}
