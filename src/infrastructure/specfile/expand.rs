//! Environment variable expansion for spec strings.
//!
//! `$NAME` and `${NAME}` references are resolved against the effective
//! environment at job-launch time, not at parse time, so per-expansion
//! variables like the array index resolve correctly. Unknown variables
//! expand to the empty string.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("variable pattern is valid")
    })
}

pub fn expand_vars(input: &str, env: &BTreeMap<String, String>) -> String {
    var_pattern()
        .replace_all(input, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            env.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bare_and_braced_forms() {
        let env = env(&[("NAME", "world")]);
        assert_eq!(expand_vars("hello $NAME", &env), "hello world");
        assert_eq!(expand_vars("hello ${NAME}!", &env), "hello world!");
    }

    #[test]
    fn test_unknown_variable_expands_empty() {
        let env = env(&[]);
        assert_eq!(expand_vars("x=$MISSING.", &env), "x=.");
    }

    #[test]
    fn test_adjacent_text_requires_braces() {
        let env = env(&[("A", "1")]);
        assert_eq!(expand_vars("${A}b", &env), "1b");
        // $Ab names a different variable.
        assert_eq!(expand_vars("$Ab", &env), "");
    }

    #[test]
    fn test_array_index_resolves_per_expansion() {
        let env = env(&[("GATOR_ARRAY_INDEX", "2")]);
        assert_eq!(expand_vars("$GATOR_ARRAY_INDEX", &env), "2");
    }
}
