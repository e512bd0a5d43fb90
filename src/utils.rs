use std::fs;
use std::path::Path;

/// OSC8 file:// hyperlink to a written output, labelled with the path as given
pub fn file_link(path: &Path) -> String {
    let text = path.display().to_string();
    let abs_path = fs::canonicalize(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| text.clone());
    format!("\x1b]8;;file://{}\x1b\\{}\x1b]8;;\x1b\\", abs_path, text)
}
