//! The analysis run: images, reference selection and per-image results.

use crate::config::AnalysisConfig;
use crate::ingest::{IngestBatch, RejectedUpload};
use crate::types::{AttributeResult, ComparisonResult, ImageId, Outcome, UploadedImage};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("image {0} is not part of this run")]
    UnknownImage(ImageId),
}

/// One analysis over a batch of at most ten images.
///
/// Result maps are keyed by [`ImageId`], so iteration follows upload order.
#[derive(Debug, Clone)]
pub struct AnalysisRun {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub config: AnalysisConfig,
    images: Vec<Arc<UploadedImage>>,
    rejected: Vec<RejectedUpload>,
    reference: Option<ImageId>,
    attributes: BTreeMap<ImageId, Outcome<AttributeResult>>,
    comparisons: BTreeMap<ImageId, Outcome<ComparisonResult>>,
}

impl AnalysisRun {
    pub fn new(batch: IngestBatch, config: AnalysisConfig) -> Self {
        let run = Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            config,
            images: batch.images.into_iter().map(Arc::new).collect(),
            rejected: batch.rejected,
            reference: None,
            attributes: BTreeMap::new(),
            comparisons: BTreeMap::new(),
        };
        tracing::info!(
            run = %run.id,
            images = run.images.len(),
            rejected = run.rejected.len(),
            "analysis run created"
        );
        run
    }

    /// Valid images in upload order.
    pub fn images(&self) -> &[Arc<UploadedImage>] {
        &self.images
    }

    pub fn image(&self, id: ImageId) -> Option<&Arc<UploadedImage>> {
        self.images.iter().find(|img| img.id == id)
    }

    /// Uploads rejected at ingest, in upload order.
    pub fn rejected(&self) -> &[RejectedUpload] {
        &self.rejected
    }

    pub fn reference(&self) -> Option<ImageId> {
        self.reference
    }

    /// Designate the comparison anchor.
    ///
    /// Choosing a different reference discards every comparison result; they
    /// are recomputed by the next aggregation. Re-selecting the current
    /// reference is a no-op.
    pub fn select_reference(&mut self, id: ImageId) -> Result<(), RunError> {
        if self.image(id).is_none() {
            return Err(RunError::UnknownImage(id));
        }
        if self.reference == Some(id) {
            return Ok(());
        }
        if !self.comparisons.is_empty() {
            tracing::info!(
                run = %self.id,
                previous = ?self.reference.map(|r| r.to_string()),
                reference = %id,
                discarded = self.comparisons.len(),
                "reference changed; comparison results invalidated"
            );
        }
        self.reference = Some(id);
        self.comparisons.clear();
        Ok(())
    }

    pub fn attributes(&self) -> &BTreeMap<ImageId, Outcome<AttributeResult>> {
        &self.attributes
    }

    pub fn comparisons(&self) -> &BTreeMap<ImageId, Outcome<ComparisonResult>> {
        &self.comparisons
    }

    /// Replace all results at once. Aggregation is the only writer.
    pub(crate) fn commit(
        &mut self,
        attributes: BTreeMap<ImageId, Outcome<AttributeResult>>,
        comparisons: BTreeMap<ImageId, Outcome<ComparisonResult>>,
    ) {
        debug_assert!(self
            .reference
            .is_some_and(|r| !comparisons.contains_key(&r)));
        self.attributes = attributes;
        self.comparisons = comparisons;
    }

    /// True once every image has an attribute outcome and every non-reference
    /// image has a comparison outcome.
    pub fn is_finalized(&self) -> bool {
        let Some(reference) = self.reference else {
            return false;
        };
        self.images.iter().all(|img| {
            self.attributes.contains_key(&img.id)
                && (img.id == reference || self.comparisons.contains_key(&img.id))
        })
    }
}
