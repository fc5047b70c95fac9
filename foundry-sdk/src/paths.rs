//! Repository path conventions shared by coordinator and workers.

use std::path::Path;

/// Extensions that get a tester subtask. Anything else is pre-seeded `skipped`.
pub const TESTABLE_EXTENSIONS: &[&str] = &["py", "js", "ts", "java", "cpp", "go", "rs", "php"];

/// Whether a file gets unit tests generated for it.
pub fn is_testable(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| TESTABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Where generated tests for `file` are written: `tests/<dir>/<stem>_test<.ext>`.
pub fn test_path_for(file: &str) -> String {
    let rel = file.strip_prefix("tests/").unwrap_or(file);
    let path = Path::new(rel);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(rel);
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}_test.{ext}"),
        None => format!("{stem}_test"),
    };
    match path.parent().and_then(|p| p.to_str()).filter(|p| !p.is_empty()) {
        Some(dir) => format!("tests/{dir}/{name}"),
        None => format!("tests/{name}"),
    }
}

/// Where generated documentation for `file` is written.
pub fn doc_path_for(file: &str) -> String {
    format!("docs/{file}.md")
}
