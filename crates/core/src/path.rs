//! Directory path and entry name rules.
//!
//! Files are addressed by a normalized parent directory plus an entry name.
//! A normalized directory always starts with `/`, uses `/` separators, has no
//! empty, `.` or `..` segments and no trailing slash (except the root itself).

/// The root directory.
pub const ROOT: &str = "/";

/// Normalize a directory path.
///
/// Backslashes become slashes, `.` segments are dropped and `..` pops the
/// previous segment (never above the root). Empty input is the root.
pub fn normalize_dir(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    format!("/{}", stack.join("/"))
}

/// Validate and trim an entry name.
pub fn validate_name(name: &str) -> crate::Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(crate::Error::InvalidName("name cannot be empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(crate::Error::InvalidName(format!(
            "name contains path characters: {name}"
        )));
    }
    if name == "." || name == ".." {
        return Err(crate::Error::InvalidName(format!("reserved name: {name}")));
    }
    Ok(name.to_string())
}

/// Full path of an entry named `name` inside directory `dir`.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}
