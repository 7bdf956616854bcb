use crate::store::Store;
use crate::types::{Draft, DraftStatus, RejectionReason, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Result of a review action. Duplicate actions against an already
/// reviewed draft are explicit no-ops, not errors, so double-taps in a
/// review UI stay harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Applied,
    AlreadyReviewed(DraftStatus),
}

/// Review operations over pending drafts.
pub struct ModerationQueue {
    store: Arc<dyn Store>,
}

impl ModerationQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn list_pending(&self, limit: i64) -> Result<Vec<Draft>> {
        self.store
            .drafts_with_status(DraftStatus::PendingReview, limit)
            .await
    }

    pub async fn approve(&self, draft_id: Uuid, reviewer: i64) -> Result<ReviewOutcome> {
        let mut draft = self.store.draft(draft_id).await?;
        if draft.status.is_terminal() {
            return Ok(ReviewOutcome::AlreadyReviewed(draft.status));
        }
        draft.status = DraftStatus::Approved;
        draft.reviewed_by = Some(reviewer);
        draft.reviewed_at = Some(Utc::now());
        if !self.store.update_draft_review(&draft).await? {
            return self.lost_race(draft_id).await;
        }
        info!("Draft '{}' approved by {}", draft.title, reviewer);
        Ok(ReviewOutcome::Applied)
    }

    pub async fn reject(
        &self,
        draft_id: Uuid,
        reason: RejectionReason,
        reviewer: i64,
    ) -> Result<ReviewOutcome> {
        let mut draft = self.store.draft(draft_id).await?;
        if draft.status.is_terminal() {
            return Ok(ReviewOutcome::AlreadyReviewed(draft.status));
        }
        draft.status = DraftStatus::Rejected;
        draft.rejection_reason = Some(reason);
        draft.reviewed_by = Some(reviewer);
        draft.reviewed_at = Some(Utc::now());
        if !self.store.update_draft_review(&draft).await? {
            return self.lost_race(draft_id).await;
        }
        info!(
            "Draft '{}' rejected by {} ({})",
            draft.title,
            reviewer,
            reason.as_str()
        );
        Ok(ReviewOutcome::Applied)
    }

    /// Replace the draft text. The draft passes through `edited` and
    /// re-enters the pending queue for a fresh review.
    pub async fn edit(
        &self,
        draft_id: Uuid,
        new_title: &str,
        new_body: &str,
        reviewer: i64,
    ) -> Result<ReviewOutcome> {
        let mut draft = self.store.draft(draft_id).await?;
        if draft.status.is_terminal() {
            return Ok(ReviewOutcome::AlreadyReviewed(draft.status));
        }
        draft.title = new_title.to_string();
        draft.body = new_body.to_string();
        draft.edit_count += 1;
        draft.reviewed_by = Some(reviewer);
        draft.reviewed_at = Some(Utc::now());
        draft.status = DraftStatus::PendingReview;
        if !self.store.update_draft_review(&draft).await? {
            return self.lost_race(draft_id).await;
        }
        info!(
            "Draft '{}' edited by {} (edit #{})",
            draft.title, reviewer, draft.edit_count
        );
        Ok(ReviewOutcome::Applied)
    }

    /// Another reviewer finished first between our read and write;
    /// report what the review settled on.
    async fn lost_race(&self, draft_id: Uuid) -> Result<ReviewOutcome> {
        let current = self.store.draft(draft_id).await?;
        info!(
            "Draft '{}' was reviewed concurrently, keeping {}",
            current.title, current.status
        );
        Ok(ReviewOutcome::AlreadyReviewed(current.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn pending_draft() -> Draft {
        Draft {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            title: "Court rules on AI evidence".to_string(),
            body: "The ruling sets conditions for admissibility.".to_string(),
            summary: None,
            image_ref: None,
            confidence: 0.8,
            status: DraftStatus::PendingReview,
            reviewed_by: None,
            reviewed_at: None,
            rejection_reason: None,
            edit_count: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn approve_then_approve_again_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let draft = pending_draft();
        store.insert_draft(&draft).await.unwrap();
        let queue = ModerationQueue::new(store.clone());

        assert_eq!(
            queue.approve(draft.id, 42).await.unwrap(),
            ReviewOutcome::Applied
        );
        assert_eq!(
            queue.approve(draft.id, 42).await.unwrap(),
            ReviewOutcome::AlreadyReviewed(DraftStatus::Approved)
        );
        // A reject after approval is also refused.
        assert_eq!(
            queue
                .reject(draft.id, RejectionReason::NotRelevant, 42)
                .await
                .unwrap(),
            ReviewOutcome::AlreadyReviewed(DraftStatus::Approved)
        );
    }

    #[tokio::test]
    async fn stale_write_cannot_overwrite_a_terminal_review() {
        let store = Arc::new(MemoryStore::new());
        let draft = pending_draft();
        store.insert_draft(&draft).await.unwrap();
        let queue = ModerationQueue::new(store.clone());
        queue.approve(draft.id, 1).await.unwrap();

        // A second reviewer who read the draft before the approval
        // writes its stale reject straight through the store.
        let mut stale = draft.clone();
        stale.status = DraftStatus::Rejected;
        stale.rejection_reason = Some(RejectionReason::NotRelevant);
        stale.reviewed_by = Some(2);
        stale.reviewed_at = Some(Utc::now());

        let applied = store.update_draft_review(&stale).await.unwrap();
        assert!(!applied);
        let stored = store.draft(draft.id).await.unwrap();
        assert_eq!(stored.status, DraftStatus::Approved);
        assert_eq!(stored.rejection_reason, None);
        assert_eq!(stored.reviewed_by, Some(1));
    }

    #[tokio::test]
    async fn reject_records_the_reason() {
        let store = Arc::new(MemoryStore::new());
        let draft = pending_draft();
        store.insert_draft(&draft).await.unwrap();
        let queue = ModerationQueue::new(store.clone());

        queue
            .reject(draft.id, RejectionReason::LowQuality, 7)
            .await
            .unwrap();
        let stored = store.draft(draft.id).await.unwrap();
        assert_eq!(stored.status, DraftStatus::Rejected);
        assert_eq!(stored.rejection_reason, Some(RejectionReason::LowQuality));
        assert_eq!(stored.reviewed_by, Some(7));
    }

    #[tokio::test]
    async fn edit_reenters_the_pending_queue() {
        let store = Arc::new(MemoryStore::new());
        let draft = pending_draft();
        store.insert_draft(&draft).await.unwrap();
        let queue = ModerationQueue::new(store.clone());

        queue
            .edit(draft.id, "Better headline", "Tighter body.", 7)
            .await
            .unwrap();
        let stored = store.draft(draft.id).await.unwrap();
        assert_eq!(stored.status, DraftStatus::PendingReview);
        assert_eq!(stored.title, "Better headline");
        assert_eq!(stored.edit_count, 1);

        let pending = queue.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }
}
