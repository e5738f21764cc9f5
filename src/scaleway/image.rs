//! Boot image resolution by label and architecture.

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use tracing::debug;

use crate::backend::{BackendError, BackendErrorKind, LaunchSpec};

use super::ScalewayBackend;
use super::error::sdk_error;

impl ScalewayBackend {
    /// Resolves the newest available image matching the label and
    /// architecture, preferring project images over public ones.
    pub(super) async fn resolve_image_id(&self, spec: &LaunchSpec) -> Result<String, BackendError> {
        let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &self.config.default_zone)
            .public(true)
            .project(&self.config.default_project_id)
            .name(&spec.image_label)
            .arch(&spec.architecture);
        if let Some(org) = &self.config.default_organization_id {
            scoped = scoped.organization(org);
        }
        let project_images = scoped
            .run_async()
            .await
            .map_err(|err| sdk_error("list images", err))?;

        let images = if project_images.is_empty() {
            ScalewayListInstanceImagesBuilder::new(self.api.clone(), &self.config.default_zone)
                .public(true)
                .name(&spec.image_label)
                .arch(&spec.architecture)
                .run_async()
                .await
                .map_err(|err| sdk_error("list images", err))?
        } else {
            project_images
        };

        let id = select_image_id(images, spec).ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Rejected,
                format!(
                    "image '{}' (arch {}) not found in zone {}",
                    spec.image_label, spec.architecture, self.config.default_zone
                ),
            )
        })?;
        debug!(image = %spec.image_label, id = %id, "image resolved");
        Ok(id)
    }
}

/// Picks the newest available candidate for the requested architecture.
pub(super) fn select_image_id(images: Vec<ScalewayImage>, spec: &LaunchSpec) -> Option<String> {
    images
        .into_iter()
        .filter(|image| image.arch == spec.architecture && image.state == "available")
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
        ScalewayImage {
            id: id.to_owned(),
            name: String::new(),
            arch: arch.to_owned(),
            creation_date: creation_date.to_owned(),
            modification_date: String::new(),
            from_server: None,
            organization: String::new(),
            public: true,
            state: state.to_owned(),
            project: String::new(),
            tags: vec![],
            zone: String::new(),
            root_volume: scaleway_rs::ScalewayImageRootVolume {
                id: String::new(),
                name: String::new(),
                size: 0,
                volume_type: String::new(),
            },
            default_bootscript: None,
            extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
                volumes: HashMap::new(),
            },
        }
    }

    fn spec() -> LaunchSpec {
        LaunchSpec::builder()
            .name("bivouac-app-main")
            .instance_type("DEV1-S")
            .image_label("Ubuntu 24.04 Noble Numbat")
            .architecture("x86_64")
            .security_group_id("sg")
            .build()
            .unwrap_or_else(|err| panic!("spec: {err}"))
    }

    #[test]
    fn newest_available_image_wins() {
        let images = vec![
            image("old", "x86_64", "available", "2024-01-01T00:00:00Z"),
            image("new", "x86_64", "available", "2024-06-01T00:00:00Z"),
            image("newest-arm", "arm64", "available", "2024-09-01T00:00:00Z"),
            image("newest-broken", "x86_64", "error", "2024-10-01T00:00:00Z"),
        ];

        assert_eq!(select_image_id(images, &spec()), Some(String::from("new")));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::wrong_arch(vec![image("arm", "arm64", "available", "2024-01-01T00:00:00Z")])]
    fn no_candidate_yields_none(#[case] images: Vec<ScalewayImage>) {
        assert_eq!(select_image_id(images, &spec()), None);
    }
}
