use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding first-party Rust sources.
const SOURCE_ROOTS: [&str; 4] = ["rvfl", "cli", "tests", "benches"];

// Directories that are never scanned, even if nested under a source root.
const SKIPPED_DIRS: [&str; 2] = ["target", "examples"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

// One source rule enforced on every build.
#[derive(Clone, Copy)]
enum Policy {
    UnderscoreBinding,
    ForbiddenWord,
    DoubleStar,
    ShoutingComment,
    AllowDeadCode,
}

impl Policy {
    const ALL: [Policy; 5] = [
        Policy::UnderscoreBinding,
        Policy::ForbiddenWord,
        Policy::DoubleStar,
        Policy::ShoutingComment,
        Policy::AllowDeadCode,
    ];

    // Coarse line filter handed to the searcher. `is_violation` makes the final call.
    fn pattern(self) -> String {
        match self {
            Policy::UnderscoreBinding => r"\b_[A-Za-z0-9_]+\b".to_string(),
            Policy::ForbiddenWord => format!("(?:{})", FORBIDDEN_WORDS.join("|")),
            Policy::DoubleStar => r"\*\*".to_string(),
            Policy::ShoutingComment => r"//|/\*".to_string(),
            Policy::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn is_violation(self, line: &str) -> bool {
        let (code, comment) = split_line(line);
        match self {
            Policy::UnderscoreBinding => has_underscore_identifier(&code),
            Policy::ForbiddenWord => comment
                .is_some_and(|text| FORBIDDEN_WORDS.iter().any(|word| text.contains(word))),
            Policy::DoubleStar => !is_doc_comment(line) && comment.is_some_and(|text| text.contains("**")),
            Policy::ShoutingComment => comment.is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
            Policy::AllowDeadCode => code.contains("allow") && code.contains("dead_code"),
        }
    }

    fn title(self) -> &'static str {
        match self {
            Policy::UnderscoreBinding => "underscore-prefixed identifiers",
            Policy::ForbiddenWord => "comments with forbidden markers",
            Policy::DoubleStar => "'**' inside regular comments",
            Policy::ShoutingComment => "comments written entirely in uppercase",
            Policy::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> String {
        match self {
            Policy::UnderscoreBinding => {
                "Either use the binding (removing the underscore) or remove it completely.".to_string()
            }
            Policy::ForbiddenWord => format!(
                "Comments may not contain any of: {}. Remove them rather than rewording.",
                FORBIDDEN_WORDS.join(", ")
            ),
            Policy::DoubleStar => "Use '**' only inside doc comments.".to_string(),
            Policy::ShoutingComment => "Rewrite the comment in sentence case or delete it.".to_string(),
            Policy::AllowDeadCode => {
                "Either use the code (removing the attribute) or remove it completely.".to_string()
            }
        }
    }
}

// Collects every offending line of a single file for a single policy.
struct PolicyCollector {
    policy: Policy,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl PolicyCollector {
    fn new(policy: Policy, file_path: &Path) -> Self {
        Self {
            policy,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.policy.title(),
            self.file_path.display()
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!(
            "\n⚠️ {} are not allowed in this project.\n   {}\n",
            self.policy.title(),
            self.policy.advice()
        ));
        Some(message)
    }
}

impl Sink for PolicyCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.policy.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// Splits a line into its code (string literal contents blanked) and the text
// of its comment, if any.
fn split_line(line: &str) -> (String, Option<&str>) {
    let mut code = String::with_capacity(line.len());
    let mut in_string = false;
    let mut escaped = false;
    let bytes = line.as_bytes();

    for (i, c) in line.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                code.push(c);
            }
            continue;
        }
        if c == '"' {
            in_string = true;
            code.push(c);
            continue;
        }
        if c == '/' && i + 1 < bytes.len() {
            if bytes[i + 1] == b'/' {
                let text = line[i..].trim_start_matches(['/', '!']).trim();
                return (code, Some(text));
            }
            if bytes[i + 1] == b'*' {
                let rest = &line[i + 2..];
                let text = rest.split("*/").next().unwrap_or(rest).trim();
                return (code, Some(text));
            }
        }
        code.push(c);
    }
    (code, None)
}

// True when `code` holds an identifier that starts with `_` followed by at
// least one identifier character.
fn has_underscore_identifier(code: &str) -> bool {
    let chars: Vec<char> = code.chars().collect();
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    chars.iter().enumerate().any(|(i, &c)| {
        c == '_'
            && (i == 0 || !is_ident(chars[i - 1]))
            && chars.get(i + 1).is_some_and(|&next| is_ident(next))
    })
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| {
            WalkDir::new(root)
                .into_iter()
                .filter_entry(|e| {
                    e.file_name()
                        .to_str()
                        .is_none_or(|name| !SKIPPED_DIRS.contains(&name))
                })
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path())
        })
        .collect()
}

fn scan_sources(sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for policy in Policy::ALL {
        let matcher = RegexMatcher::new_line_matcher(&policy.pattern())?;
        for path in sources {
            let mut collector = PolicyCollector::new(policy, path);
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(message) = collector.error_message() {
                return Err(message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let sources = rust_sources();
    if let Err(e) = scan_sources(&sources) {
        // Printed to stderr so cargo shows it with the failed build.
        eprintln!("{e}");
        std::process::exit(1);
    }
}
