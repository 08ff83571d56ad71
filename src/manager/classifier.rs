//! Static check for commands that are likely to sit waiting on stdin.
//!
//! The result is advisory: flagged commands still run, the caller just gets
//! a warning next to the result.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Clear,
    Flagged(String),
}

impl Classification {
    pub fn warning(&self, command: &str) -> Option<String> {
        match self {
            Classification::Clear => None,
            Classification::Flagged(reason) => Some(format!(
                "WARNING: '{command}' may require user input and could hang ({reason}). \
                 Consider a non-interactive alternative."
            )),
        }
    }
}

struct Rule {
    pattern: Regex,
    reason: &'static str,
    /// A match is cleared when one of these also appears.
    unless: Option<Regex>,
}

fn rule(pattern: &str, reason: &'static str, unless: Option<&str>) -> Rule {
    Rule {
        pattern: Regex::new(pattern).expect("static classifier pattern"),
        reason,
        unless: unless.map(|p| Regex::new(p).expect("static classifier pattern")),
    }
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"(?i)(?:^|[;&|(`])\s*(sudo|su|doas|pkexec)(\s|$)", "privilege escalation prompts for a password", Some(r"\bsudo\s+(-n|--non-interactive)\b")),
        rule(r"(?i)\b(ssh|telnet|rlogin|mosh|sftp|ftp)\b", "remote login may prompt for credentials or host confirmation", Some(r"BatchMode=yes")),
        rule(r"(?i)\bgit\s+(push|pull|clone|fetch)\b", "version control may prompt for credentials", None),
        rule(r"(?i)\bsvn\s+(checkout|co|commit|ci|update|up)\b", "version control may prompt for credentials", Some(r"--non-interactive")),
        rule(r"(?i)\b(apt|apt-get|yum|dnf|zypper)\s+(install|remove|upgrade|update)\b", "package manager may ask for confirmation", Some(r"(\s-y\b|--yes\b|--assume-yes\b|-q\b)")),
        rule(r"(?i)\b(pip3?|npm|yarn|pnpm)\s+(install|uninstall|init)\b", "package manager may ask for confirmation", Some(r"(\s-y\b|--yes\b)")),
        rule(r"(?i)(?:^|[;&|(`])\s*(less|more|vi|vim|nvim|nano|emacs|top|htop|man)(\s|$)", "pager or full-screen program waits for keyboard input", None),
        rule(r"(?i)^\s*(bash|sh|zsh|fish|python3?|node|irb|psql|mysql)\s*$", "interactive shell waits for input", None),
        rule(r"(?i)(^|[;&|]\s*)(read|select)\s", "shell builtin reads from stdin", None),
        rule(r"(?i)--interactive\b", "explicit interactive flag", None),
    ]
});

/// Classify `command` against the fixed pattern set.
pub fn classify(command: &str) -> Classification {
    for rule in RULES.iter() {
        if !rule.pattern.is_match(command) {
            continue;
        }
        if rule.unless.as_ref().is_some_and(|unless| unless.is_match(command)) {
            continue;
        }
        return Classification::Flagged(rule.reason.to_string());
    }
    Classification::Clear
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flagged(command: &str) -> bool {
        matches!(classify(command), Classification::Flagged(_))
    }

    #[test]
    fn flags_each_category() {
        assert!(flagged("sudo apt-get update"));
        assert!(flagged("cd /tmp && su root"));
        assert!(flagged("ssh user@host uptime"));
        assert!(flagged("git push origin main"));
        assert!(flagged("apt install curl"));
        assert!(flagged("npm install"));
        assert!(flagged("git log | less"));
        assert!(flagged("python3"));
        assert!(flagged("read name; echo $name"));
        assert!(flagged("rm --interactive foo"));
    }

    #[test]
    fn leaves_ordinary_commands_clear() {
        assert_eq!(classify("ls -la"), Classification::Clear);
        assert_eq!(classify("cargo build --release"), Classification::Clear);
        assert_eq!(classify("python3 script.py"), Classification::Clear);
        assert_eq!(classify("git status"), Classification::Clear);
        assert_eq!(classify("echo sugar"), Classification::Clear);
    }

    #[test]
    fn pagers_and_sudo_count_only_in_command_position() {
        assert_eq!(classify("echo learn more"), Classification::Clear);
        assert_eq!(classify("ps -o top"), Classification::Clear);
        assert_eq!(classify("echo sudo"), Classification::Clear);
        assert_eq!(classify("grep -r man docs/"), Classification::Clear);
        assert!(flagged("true && man ls"));
        assert!(flagged("  top"));
        assert!(flagged("(vim notes.txt)"));
    }

    #[test]
    fn non_interactive_flags_clear_the_match() {
        assert_eq!(classify("apt-get install -y curl"), Classification::Clear);
        assert_eq!(classify("sudo -n true"), Classification::Clear);
        assert_eq!(classify("ssh -o BatchMode=yes host true"), Classification::Clear);
    }

    #[test]
    fn warning_quotes_the_command() {
        let warning = classify("sudo ls").warning("sudo ls").unwrap();
        assert!(warning.contains("'sudo ls'"));
        assert!(Classification::Clear.warning("ls").is_none());
    }
}
