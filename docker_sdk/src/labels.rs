//! Provenance labels attached to every resource this crate creates

use std::collections::HashMap;

pub const LABEL_BASE: &str = "com.docker.sdk";
pub const LABEL_LANG: &str = "com.docker.sdk.lang";
pub const LABEL_VERSION: &str = "com.docker.sdk.version";
pub const LABEL_NETWORK: &str = "com.docker.sdk.network";
pub const LABEL_VOLUME: &str = "com.docker.sdk.volume";

pub const SDK_LANG: &str = "rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The labels every created resource carries
pub fn sdk_labels() -> HashMap<String, String> {
    HashMap::from([
        (LABEL_BASE.to_owned(), "true".to_owned()),
        (LABEL_LANG.to_owned(), SDK_LANG.to_owned()),
        (LABEL_VERSION.to_owned(), SDK_VERSION.to_owned()),
    ])
}

/// Merges `user` labels with [sdk_labels] plus the component label
/// `component_label=component_version`. The reserved labels overwrite user
/// labels with the same key.
pub fn merge_labels(
    user: &HashMap<String, String>,
    component_label: &str,
    component_version: &str,
) -> HashMap<String, String> {
    let mut labels = user.clone();
    labels.extend(sdk_labels());
    labels.insert(component_label.to_owned(), component_version.to_owned());
    labels
}

/// Returns if `labels` has the marker that this crate created the resource
pub fn is_sdk_created(labels: &HashMap<String, String>) -> bool {
    labels.get(LABEL_BASE).is_some_and(|v| v == "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_labels_win() {
        let user = HashMap::from([
            ("team".to_owned(), "infra".to_owned()),
            (LABEL_LANG.to_owned(), "cobol".to_owned()),
        ]);
        let labels = merge_labels(&user, LABEL_NETWORK, SDK_VERSION);
        assert_eq!(labels["team"], "infra");
        assert_eq!(labels[LABEL_LANG], SDK_LANG);
        assert_eq!(labels[LABEL_BASE], "true");
        assert_eq!(labels[LABEL_VERSION], SDK_VERSION);
        assert_eq!(labels[LABEL_NETWORK], SDK_VERSION);
        assert!(is_sdk_created(&labels));
        assert!(!is_sdk_created(&user));
    }
}
