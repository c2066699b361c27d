//! Dangerous-pattern scan over generated file content

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

static DANGEROUS_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"eval\s*\([^)]*\)", "eval() call"),
        (r"exec\s*\([^)]*\)", "exec() call"),
        (r"os\.system\s*\([^)]*\)", "os.system() call"),
        (r"subprocess\.(call|run|Popen)\s*\([^)]*shell\s*=\s*True", "shell=True subprocess"),
        (r"__import__\s*\([^)]*\)", "__import__() call"),
        (r"curl[^|]*\|\s*(ba)?sh", "curl pipe to shell"),
        (r"wget[^|]*\|\s*(ba)?sh", "wget pipe to shell"),
        (r"rm\s+-rf\s+[/~]", "dangerous rm -rf"),
    ]
    .into_iter()
    .map(|(pattern, description)| {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
            .expect("valid regex");
        (regex, description)
    })
    .collect()
});

/// One warning per pattern found in `content`
pub fn scan(content: &str) -> Vec<String> {
    DANGEROUS_PATTERNS
        .iter()
        .filter(|(regex, _)| regex.is_match(content))
        .map(|(_, description)| format!("Suspicious pattern detected: {}", description))
        .collect()
}
