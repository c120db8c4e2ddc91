//! Image catalogue for `berth images`

use serde::Serialize;

use crate::error::Result;
use crate::runtime::{ContainerRuntime, ImageInfo};
use crate::session::LifecycleSettings;

/// One of the images berth launches by default.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedImage {
    pub alias: String,
    pub description: String,
    pub present: bool,
    /// How to provide the image when it is missing.
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageReport {
    pub managed: Vec<ManagedImage>,
    /// Every local image, only with `--all`.
    pub local: Option<Vec<ImageInfo>>,
}

fn catalogue(settings: &LifecycleSettings) -> [(&str, &'static str); 2] {
    [
        (settings.image.as_str(), "Standard sandbox image"),
        (
            settings.privileged_image.as_str(),
            "Privileged image (used with --privileged)",
        ),
    ]
}

/// Check which of the configured images exist locally.
pub fn report(
    runtime: &dyn ContainerRuntime,
    settings: &LifecycleSettings,
    all: bool,
) -> Result<ImageReport> {
    let local = runtime.list_images()?;

    let managed = catalogue(settings)
        .into_iter()
        .map(|(alias, description)| {
            let present = local.iter().any(|i| i.aliases.iter().any(|a| a == alias));
            ManagedImage {
                alias: alias.to_string(),
                description: description.to_string(),
                present,
                hint: (!present).then(|| {
                    format!(
                        "publish a prepared container with: incus publish <container> --alias {}",
                        alias
                    )
                }),
            }
        })
        .collect();

    Ok(ImageReport {
        managed,
        local: all.then_some(local),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MemoryRuntime;

    #[test]
    fn test_marks_missing_images_with_hint() {
        let runtime = MemoryRuntime::new();
        runtime.add_image("berth-sandbox");
        runtime.add_image("ubuntu-base");

        let report = report(&runtime, &LifecycleSettings::default(), false).unwrap();
        assert_eq!(report.managed.len(), 2);
        assert_eq!(report.managed[0].alias, "berth-sandbox");
        assert!(report.managed[0].present);
        assert!(report.managed[0].hint.is_none());
        assert_eq!(report.managed[1].alias, "berth-privileged");
        assert!(!report.managed[1].present);
        assert!(report.managed[1]
            .hint
            .as_deref()
            .is_some_and(|h| h.contains("--alias berth-privileged")));
        assert!(report.local.is_none());
    }

    #[test]
    fn test_all_lists_every_local_image() {
        let runtime = MemoryRuntime::new();
        runtime.add_image("berth-sandbox");
        runtime.add_image("ubuntu-base");

        let report = report(&runtime, &LifecycleSettings::default(), true).unwrap();
        let aliases: Vec<String> = report
            .local
            .unwrap()
            .into_iter()
            .flat_map(|i| i.aliases)
            .collect();
        assert_eq!(aliases, vec!["berth-sandbox", "ubuntu-base"]);
    }

    #[test]
    fn test_configured_aliases_are_used() {
        let runtime = MemoryRuntime::new();
        runtime.add_image("custom");
        let settings = LifecycleSettings {
            image: "custom".to_string(),
            ..LifecycleSettings::default()
        };
        let report = report(&runtime, &settings, false).unwrap();
        assert_eq!(report.managed[0].alias, "custom");
        assert!(report.managed[0].present);
    }

    #[test]
    fn test_listing_failure_propagates() {
        let runtime = MemoryRuntime::new();
        runtime.set_unavailable(true);
        assert!(report(&runtime, &LifecycleSettings::default(), false).is_err());
    }
}
