//! Image resolution helpers for the Scaleway driver.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use super::super::{ScalewayDriver, ScalewayDriverError};

impl ScalewayDriver {
    #[expect(
        clippy::excessive_nesting,
        reason = "organisation scoping requires nested builder updates before execution"
    )]
    pub(in crate::scaleway) async fn resolve_image_id(&self) -> Result<String, ScalewayDriverError> {
        self.resolve_image_id_with(
            || async move {
                if self.project_id.is_empty() {
                    Ok(Vec::new())
                } else {
                    let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api(), &self.zone)
                        .public(true)
                        .project(&self.project_id)
                        .name(&self.image)
                        .arch(&self.architecture);
                    if let Some(org) = &self.organization_id {
                        scoped = scoped.organization(org);
                    }
                    scoped.run_async().await.map_err(ScalewayDriverError::from)
                }
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api(), &self.zone)
                    .public(true)
                    .name(&self.image)
                    .arch(&self.architecture)
                    .run_async()
                    .await
                    .map_err(ScalewayDriverError::from)
            },
        )
        .await
    }

    pub(in crate::scaleway) async fn resolve_image_id_with<FutA, FutB, FetchA, FetchB>(
        &self,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<String, ScalewayDriverError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, ScalewayDriverError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, ScalewayDriverError>>,
    {
        let project_images = project_fetch().await?;

        let primary = if project_images.is_empty() {
            public_fetch().await?
        } else {
            project_images
        };

        self.select_image_id(self.filter_images(primary))
    }

    pub(in crate::scaleway) fn select_image_id(
        &self,
        mut candidates: Vec<ScalewayImage>,
    ) -> Result<String, ScalewayDriverError> {
        candidates.sort_by(|lhs, rhs| rhs.creation_date.cmp(&lhs.creation_date));
        candidates
            .into_iter()
            .next()
            .map(|image| image.id)
            .ok_or_else(|| ScalewayDriverError::ImageNotFound {
                label: self.image.clone(),
                arch: self.architecture.clone(),
                zone: self.zone.clone(),
            })
    }

    pub(in crate::scaleway) fn filter_images(&self, images: Vec<ScalewayImage>) -> Vec<ScalewayImage> {
        images
            .into_iter()
            .filter(|image| image.arch == self.architecture)
            .filter(|image| image.state == "available")
            .collect()
    }
}
