use docorch_types::DependencyKind;

/// Starting priority for any freshly enqueued file, before boosts/penalties.
pub const BASE_PRIORITY: i64 = 100;
const ENTRY_POINT_BOOST: i64 = 50;
const CONFIG_FILE_BOOST: i64 = 30;
const TEST_FILE_PENALTY: i64 = 40;

const ENTRY_POINT_STEMS: &[&str] = &["main", "index", "mod", "lib", "app", "server", "cli"];
const CONFIG_FILENAMES: &[&str] = &[
    "cargo.toml",
    "package.json",
    "pyproject.toml",
    "tsconfig.json",
    "dockerfile",
    "docker-compose.yml",
    "docker-compose.yaml",
    ".env",
    "config.toml",
    "config.yaml",
    "config.yml",
    "config.json",
];
const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "ini", "env"];

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().unwrap_or(name)
}

fn file_name_lower(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase()
}

fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.').map(|(_, ext)| ext)
}

/// Heuristic match for files acting as a program's entry point.
pub fn looks_like_entry_point(path: &str) -> bool {
    ENTRY_POINT_STEMS.contains(&file_stem(path).to_ascii_lowercase().as_str())
}

/// Heuristic match for configuration files, by well-known filename or extension.
pub fn looks_like_config_file(path: &str) -> bool {
    let name = file_name_lower(path);
    if CONFIG_FILENAMES.contains(&name.as_str()) {
        return true;
    }
    matches!(extension(path), Some(ext) if CONFIG_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Heuristic match for test files: a `tests/`/`test/` directory segment, or a
/// `test_`/`_test`/`.test.`/`.spec.` naming convention.
pub fn looks_like_test_file(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    if lower.split('/').any(|segment| segment == "tests" || segment == "test" || segment == "__tests__") {
        return true;
    }
    let name = file_name_lower(path);
    let stem = file_stem(&name).to_string();
    stem.starts_with("test_")
        || stem.ends_with("_test")
        || stem.ends_with("_spec")
        || name.contains(".test.")
        || name.contains(".spec.")
}

/// Stable integer priority for a freshly enqueued file. Positional and
/// creation-time tiebreaks are applied by the scheduler at pop time, not
/// folded into this value.
pub fn compute_priority(path: &str, dependency_kind: Option<DependencyKind>) -> i64 {
    let mut priority = BASE_PRIORITY;
    if looks_like_entry_point(path) {
        priority += ENTRY_POINT_BOOST;
    }
    if looks_like_config_file(path) {
        priority += CONFIG_FILE_BOOST;
    }
    if looks_like_test_file(path) {
        priority -= TEST_FILE_PENALTY;
    }
    if let Some(kind) = dependency_kind {
        priority += kind.priority_boost();
    }
    priority
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_file_outranks_a_plain_file() {
        assert!(compute_priority("src/main.rs", None) > compute_priority("src/helpers.rs", None));
    }

    #[test]
    fn config_file_outranks_a_plain_file() {
        assert!(compute_priority("Cargo.toml", None) > compute_priority("src/helpers.rs", None));
    }

    #[test]
    fn test_file_is_penalized() {
        assert!(compute_priority("tests/helpers_test.rs", None) < compute_priority("src/helpers.rs", None));
    }

    #[test]
    fn dependency_kind_ordering_matches_config_gt_import_gt_injection_gt_reference() {
        let base = "src/util.rs";
        let config = compute_priority(base, Some(DependencyKind::Config));
        let import = compute_priority(base, Some(DependencyKind::Import));
        let injection = compute_priority(base, Some(DependencyKind::Injection));
        let reference = compute_priority(base, Some(DependencyKind::Reference));
        assert!(config > import);
        assert!(import > injection);
        assert!(injection > reference);
    }
}
