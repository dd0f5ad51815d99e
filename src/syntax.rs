//! Minimal shell-syntax analyzer.
//!
//! Extracts two facts about a command string: the set of shell features it
//! uses, and — when it uses none — its literal argv. Wrappers use the literal
//! argv to exec a program without re-entering a shell; the validator compares
//! the feature set against a per-route allow-list.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Closed vocabulary of shell features recognized by the analyzer.
///
/// The enumeration is shared between command builders and the validator so
/// both sides agree on what a policy name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShellFeature {
    /// `a | b`
    Pipe,
    /// `>`, `>>`, `<`, `2>`
    Redirect,
    /// `$(...)` or backticks
    CommandSubstitution,
    /// `$VAR` or `${VAR}`
    VariableExpansion,
    /// `&&`, `||`, `;` or newline between commands
    Chain,
    /// trailing or separating `&`
    Background,
    /// unquoted `*`, `?` or `[...]`
    Glob,
    /// `( ... )`
    Subshell,
}

impl ShellFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::Redirect => "redirect",
            Self::CommandSubstitution => "command-substitution",
            Self::VariableExpansion => "variable-expansion",
            Self::Chain => "chain",
            Self::Background => "background",
            Self::Glob => "glob",
            Self::Subshell => "subshell",
        }
    }
}

/// Result of analyzing one command string.
#[derive(Debug, Clone)]
pub struct SyntaxInfo {
    /// The argv the command reduces to, when it uses no shell features and
    /// lexes cleanly. `None` means the command needs a shell to run.
    pub literal_argv: Option<Vec<String>>,
    /// Every shell feature the command uses.
    pub features: BTreeSet<ShellFeature>,
}

impl SyntaxInfo {
    pub fn is_literal(&self) -> bool {
        self.literal_argv.is_some()
    }
}

/// Analyze a command string.
///
/// The scan is a single pass that tracks quoting state. Single quotes hide
/// everything; double quotes still expose `$` expansion and backticks, which
/// matches how a POSIX shell would treat the string.
pub fn parse(command: &str) -> SyntaxInfo {
    let mut features = BTreeSet::new();
    let bytes = command.as_bytes();
    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if in_single {
            if c == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }

        if c == '\\' && !in_single {
            // Escaped character never introduces a feature
            i += 2;
            continue;
        }

        match c {
            '\'' if !in_double => in_single = true,
            '"' => in_double = !in_double,
            '`' => {
                features.insert(ShellFeature::CommandSubstitution);
            }
            '$' => {
                if bytes.get(i + 1) == Some(&b'(') {
                    features.insert(ShellFeature::CommandSubstitution);
                } else if matches!(bytes.get(i + 1), Some(b) if b.is_ascii_alphanumeric() || *b == b'{' || *b == b'_')
                {
                    features.insert(ShellFeature::VariableExpansion);
                }
            }
            _ if in_double => {}
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    features.insert(ShellFeature::Chain);
                    i += 1;
                } else {
                    features.insert(ShellFeature::Pipe);
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    features.insert(ShellFeature::Chain);
                    i += 1;
                } else if bytes.get(i + 1) == Some(&b'>') {
                    features.insert(ShellFeature::Redirect);
                    i += 1;
                } else {
                    features.insert(ShellFeature::Background);
                }
            }
            ';' | '\n' => {
                features.insert(ShellFeature::Chain);
            }
            '>' | '<' => {
                features.insert(ShellFeature::Redirect);
            }
            '*' | '?' => {
                features.insert(ShellFeature::Glob);
            }
            '[' => {
                features.insert(ShellFeature::Glob);
            }
            '(' => {
                features.insert(ShellFeature::Subshell);
            }
            _ => {}
        }

        i += 1;
    }

    let literal_argv = if features.is_empty() {
        shell_words::split(command).ok().filter(|argv| !argv.is_empty())
    } else {
        None
    };

    SyntaxInfo {
        literal_argv,
        features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_command_has_argv() {
        let info = parse("convert 'in file.png' out.jpg");
        assert!(info.features.is_empty());
        assert_eq!(
            info.literal_argv,
            Some(vec![
                "convert".to_string(),
                "in file.png".to_string(),
                "out.jpg".to_string()
            ])
        );
    }

    #[test]
    fn pipe_is_detected() {
        let info = parse("cat in.txt | wc -l");
        assert!(info.features.contains(&ShellFeature::Pipe));
        assert!(info.literal_argv.is_none());
    }

    #[test]
    fn double_pipe_is_chain_not_pipe() {
        let info = parse("true || false");
        assert!(info.features.contains(&ShellFeature::Chain));
        assert!(!info.features.contains(&ShellFeature::Pipe));
    }

    #[test]
    fn substitution_inside_double_quotes_counts() {
        let info = parse(r#"echo "$(id -u)""#);
        assert!(info.features.contains(&ShellFeature::CommandSubstitution));
    }

    #[test]
    fn single_quotes_hide_everything() {
        let info = parse("printf '%s' 'a | b && $(c)'");
        assert!(info.features.is_empty());
        assert!(info.literal_argv.is_some());
    }

    #[test]
    fn redirect_and_background() {
        assert!(parse("echo hi > out.txt")
            .features
            .contains(&ShellFeature::Redirect));
        assert!(parse("sleep 10 &")
            .features
            .contains(&ShellFeature::Background));
    }

    #[test]
    fn variable_expansion() {
        let info = parse("echo $HOME");
        assert!(info.features.contains(&ShellFeature::VariableExpansion));
    }

    #[test]
    fn unbalanced_quote_is_not_literal() {
        let info = parse("echo 'oops");
        assert!(info.literal_argv.is_none());
    }
}
