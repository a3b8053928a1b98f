use crate::state::FolderPolicy;

/// Resolves the destinations a source file must reach.
///
/// The file's `/`-separated path is walked from its immediate parent upward;
/// the first enabled policy whose folder path matches wins (longest-ancestor
/// match, no merging). A `recursive = false` policy only applies to direct
/// children of its folder. No match means the file is untracked.
pub fn route_destinations<'a>(
    policies: &'a [FolderPolicy],
    file_path: &str,
) -> Option<&'a FolderPolicy> {
    let parent = parent_path(file_path)?;
    let mut ancestor = Some(parent.clone());
    while let Some(current) = ancestor {
        let direct = current == parent;
        if let Some(policy) = policies.iter().find(|policy| {
            policy.enabled && normalize(&policy.folder_path) == current && (policy.recursive || direct)
        }) {
            return Some(policy);
        }
        ancestor = parent_path(&current);
    }
    None
}

/// Normalized parent of a slash-separated path ("/A/B/c.txt" -> "/A/B");
/// the parent of a top-level entry is "/", the root has none.
fn parent_path(path: &str) -> Option<String> {
    let normalized = normalize(path);
    if normalized == "/" {
        return None;
    }
    match normalized.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(normalized[..idx].to_string()),
        None => None,
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(id: &str, path: &str, recursive: bool, enabled: bool) -> FolderPolicy {
        FolderPolicy {
            folder_id: id.to_string(),
            folder_path: path.to_string(),
            destinations: vec![format!("{id}-dest")],
            recursive,
            enabled,
        }
    }

    #[test]
    fn deepest_matching_ancestor_wins() {
        let policies = vec![
            policy("root", "/", true, true),
            policy("archive", "/Archive", true, true),
            policy("year", "/Archive/2024", true, true),
        ];

        let matched = route_destinations(&policies, "/Archive/2024/Q1/scan.pdf").unwrap();
        assert_eq!(matched.folder_id, "year");

        let matched = route_destinations(&policies, "/Archive/other.txt").unwrap();
        assert_eq!(matched.folder_id, "archive");

        let matched = route_destinations(&policies, "/Music/song.mp3").unwrap();
        assert_eq!(matched.folder_id, "root");
    }

    #[test]
    fn non_recursive_policy_covers_direct_children_only() {
        let policies = vec![policy("photos", "/Photos", false, true)];

        assert!(route_destinations(&policies, "/Photos/cat.jpg").is_some());
        assert!(route_destinations(&policies, "/Photos/2024/cat.jpg").is_none());
    }

    #[test]
    fn disabled_policies_are_skipped() {
        let policies = vec![
            policy("off", "/Archive/2024", true, false),
            policy("on", "/Archive", true, true),
        ];

        let matched = route_destinations(&policies, "/Archive/2024/scan.pdf").unwrap();
        assert_eq!(matched.folder_id, "on");
    }

    #[test]
    fn unmatched_file_is_untracked() {
        let policies = vec![policy("archive", "/Archive", true, true)];
        assert!(route_destinations(&policies, "/Elsewhere/file.txt").is_none());
        assert!(route_destinations(&policies, "/top-level.txt").is_none());
    }

    #[test]
    fn trailing_slash_and_missing_leading_slash_are_tolerated() {
        let policies = vec![policy("archive", "Archive/", true, true)];
        assert!(route_destinations(&policies, "/Archive/deep/file.txt").is_some());
    }

    #[test]
    fn root_path_has_no_destination() {
        let policies = vec![policy("root", "/", true, true)];
        assert!(route_destinations(&policies, "/").is_none());
    }
}
