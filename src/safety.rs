//! Safety checks that run before anything under the output root is replaced.
//!
//! Every write fully overwrites its table directories, so an output root that
//! overlaps the input root could destroy the raw data the run reads from.

use std::path::{Component, Path, PathBuf};

use crate::error::{EtlError, Result};

/// Validates that the output root can be written without touching input.
///
/// Fails when the two roots are the same directory, or when either one is
/// nested inside the other.
pub fn validate_output_root(input_root: &Path, output_root: &Path) -> Result<()> {
    let input = resolve(input_root);
    let output = resolve(output_root);

    if input == output {
        return Err(EtlError::UnsafeOutput(format!(
            "output root '{}' is the same as input root '{}'",
            output_root.display(),
            input_root.display()
        )));
    }
    if output.starts_with(&input) {
        return Err(EtlError::UnsafeOutput(format!(
            "output root '{}' is inside input root '{}'",
            output_root.display(),
            input_root.display()
        )));
    }
    if input.starts_with(&output) {
        return Err(EtlError::UnsafeOutput(format!(
            "output root '{}' contains input root '{}'",
            output_root.display(),
            input_root.display()
        )));
    }
    Ok(())
}

/// Canonical form when the path exists, otherwise a lexically cleaned
/// absolute path (the output root usually does not exist yet).
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    // Canonicalize the longest existing ancestor so symlinked parents agree
    // with the canonical input root.
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    let mut existing = cleaned.clone();
    let mut rest = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => rest.push(name.to_os_string()),
            None => return cleaned,
        }
        if !existing.pop() {
            return cleaned;
        }
    }
    let mut out = existing.canonicalize().unwrap_or(existing);
    for name in rest.into_iter().rev() {
        out.push(name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_separate_roots_are_valid() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        fs::create_dir(&input).unwrap();
        assert!(validate_output_root(&input, &dir.path().join("lake")).is_ok());
        assert!(validate_output_root(&input, &dir.path().join("input-lake")).is_ok());
    }

    #[test]
    fn test_output_equals_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_output_root(dir.path(), dir.path()).unwrap_err();
        assert!(err.to_string().contains("is the same as input root"));

        let dotted = dir.path().join("sub").join("..");
        assert!(validate_output_root(dir.path(), &dotted).is_err());
    }

    #[test]
    fn test_output_inside_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_output_root(dir.path(), &dir.path().join("lake")).unwrap_err();
        assert!(err.to_string().contains("is inside input root"));
    }

    #[test]
    fn test_output_containing_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data").join("input");
        fs::create_dir_all(&input).unwrap();
        let err = validate_output_root(&input, dir.path()).unwrap_err();
        assert!(err.to_string().contains("contains input root"));
    }
}
