//! Local environment variables forwarded to remote commands.

use std::collections::BTreeMap;

use regex::Regex;
use shell_escape::unix::escape;
use tracing::{debug, info, warn};

/// Name fragments that suggest a variable carries a credential.
const SENSITIVE_MARKERS: [&str; 4] = ["SECRET", "PASSWORD", "TOKEN", "KEY"];

/// Selects local variables whose names match the configured `env_filter`.
#[derive(Clone, Debug, Default)]
pub struct EnvForwarder {
    patterns: Vec<Regex>,
}

impl EnvForwarder {
    /// Compiles `patterns`; each one must match from the start of a name.
    ///
    /// # Errors
    ///
    /// Returns the error of the first pattern that does not compile.
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let compiled = patterns
            .iter()
            .map(|pattern| Regex::new(&format!("^(?:{pattern})")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns: compiled })
    }

    /// Keeps the variables of `vars` matched by any pattern, sorted by name.
    ///
    /// Names that are not valid shell identifiers are dropped.
    pub fn select<I>(&self, vars: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if self.patterns.is_empty() {
            return BTreeMap::new();
        }
        let selected: BTreeMap<String, String> = vars
            .into_iter()
            .filter(|(name, _)| self.patterns.iter().any(|pattern| pattern.is_match(name)))
            .filter(|(name, _)| {
                let exportable = is_shell_identifier(name);
                if !exportable {
                    debug!(name = %name, "skipping variable that cannot be exported");
                }
                exportable
            })
            .collect();
        if selected.is_empty() {
            return selected;
        }
        let names: Vec<&str> = selected.keys().map(String::as_str).collect();
        info!(count = names.len(), names = %names.join(", "), "forwarding environment variables");
        for name in names.iter().filter(|name| looks_sensitive(name)) {
            warn!(name, "forwarding a variable that may hold a secret");
        }
        selected
    }
}

/// Prefixes `command` with an `export` for each variable in `env`.
#[must_use]
pub fn with_exports(command: &str, env: &BTreeMap<String, String>) -> String {
    if env.is_empty() {
        return command.to_owned();
    }
    let mut parts: Vec<String> = env
        .iter()
        .map(|(name, value)| format!("export {name}={}", escape(value.as_str().into())))
        .collect();
    parts.push(command.to_owned());
    parts.join(" && ")
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
        && chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

fn looks_sensitive(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_MARKERS.iter().any(|marker| upper.contains(marker))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn forwarder(patterns: &[&str]) -> EnvForwarder {
        let owned: Vec<String> = patterns.iter().map(|pattern| (*pattern).to_owned()).collect();
        EnvForwarder::new(&owned).unwrap_or_else(|err| panic!("patterns: {err}"))
    }

    #[test]
    fn patterns_match_from_the_start_of_the_name() {
        let selected = forwarder(&["AWS_.*"]).select(vars(&[
            ("AWS_REGION", "eu-west-1"),
            ("MY_AWS_REGION", "ignored"),
            ("HOME", "/home/dev"),
        ]));

        assert_eq!(selected.keys().collect::<Vec<_>>(), vec!["AWS_REGION"]);
    }

    #[test]
    fn no_patterns_forward_nothing() {
        let selected = EnvForwarder::default().select(vars(&[("PATH", "/usr/bin")]));

        assert!(selected.is_empty());
    }

    #[test]
    fn invalid_shell_names_are_dropped() {
        let selected = forwarder(&[".*"]).select(vars(&[("OK_NAME", "1"), ("bad-name", "2")]));

        assert_eq!(selected.keys().collect::<Vec<_>>(), vec!["OK_NAME"]);
    }

    #[test]
    fn unclosed_group_is_rejected() {
        assert!(EnvForwarder::new(&[String::from("(AWS")]).is_err());
    }

    #[test]
    fn exports_are_sorted_and_quoted() {
        let env: BTreeMap<String, String> = vars(&[("B", "two words"), ("A", "1")])
            .into_iter()
            .collect();

        assert_eq!(
            with_exports("make test", &env),
            "export A=1 && export B='two words' && make test"
        );
    }

    #[test]
    fn empty_environment_leaves_command_untouched() {
        assert_eq!(with_exports("make", &BTreeMap::new()), "make");
    }

    #[rstest]
    #[case::token("HF_TOKEN", true)]
    #[case::lowercase("db_password", true)]
    #[case::plain("AWS_REGION", false)]
    fn sensitive_names_are_recognised(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(looks_sensitive(name), expected);
    }
}
