//! Keyword-based domain inference

/// Ordered keyword table; the first domain with any hit wins
const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    ("pdf", &["pdf", "document", "acrobat"]),
    ("git", &["git", "commit", "branch", "merge", "push", "pull"]),
    ("testing", &["test", "spec", "jest", "pytest", "mocha", "unittest"]),
    ("api", &["api", "endpoint", "request", "response", "http", "rest"]),
    ("database", &["sql", "database", "query", "migration", "postgres", "mysql", "sqlite"]),
    ("frontend", &["react", "component", "css", "html", "vue", "angular"]),
    ("docker", &["docker", "container", "kubernetes", "k8s"]),
    ("ci_cd", &["ci", "cd", "pipeline", "github actions", "jenkins"]),
    ("security", &["auth", "security", "permission", "token", "jwt", "oauth"]),
    ("file", &["file", "read", "write", "directory", "path"]),
];

/// Infer a domain from the concatenated text of matched observations.
/// Matching is plain substring search, so short keywords hit inside longer words.
pub fn infer_domain<I, S>(texts: I) -> Option<&'static str>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let all_text = texts
        .into_iter()
        .map(|t| t.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    DOMAIN_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| all_text.contains(kw)))
        .map(|(domain, _)| *domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_domain_wins() {
        // "pdf" precedes "git" in table order
        assert_eq!(infer_domain(["git commit failed on report.PDF"]), Some("pdf"));
        assert_eq!(infer_domain(["pytest collection error"]), Some("testing"));
    }

    #[test]
    fn test_no_domain() {
        assert_eq!(infer_domain(["zzz", "qqq"]), None);
        assert_eq!(infer_domain(Vec::<String>::new()), None);
    }
}
