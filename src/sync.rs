//! CRDT Sync Engine (§4.E): the only contract this relay requires from
//! the CRDT library it embeds.
//!
//! The `LoroDoc` here is not wrapped in a lock: every mutation already
//! happens inside the owning Room's single executor task (§5, option b),
//! so no additional synchronization is needed.

use loro::{ExportMode, LoroDoc};

use crate::error::RoomError;

/// The canonical CRDT document for one room.
pub struct CrdtDocument {
    doc: LoroDoc,
}

impl CrdtDocument {
    /// Creates an empty document. The server never originates operations
    /// of its own — it only stores and merges what clients send.
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// Applies an inbound document update.
    ///
    /// Returns `Ok(true)` if the update was applied, `Ok(false)` if it was
    /// a duplicate/no-op (already-seen update), and `Err` if the update is
    /// invalid or would push the document over its configured byte budget.
    pub fn ingest(&self, update: &[u8], max_doc_size: usize) -> Result<bool, RoomError> {
        let current_size = self
            .doc
            .export(ExportMode::Snapshot)
            .map(|s| s.len())
            .unwrap_or(0);
        if current_size + update.len() > max_doc_size {
            return Err(RoomError::DocumentBudgetExceeded {
                current: current_size,
                incoming: update.len(),
                limit: max_doc_size,
            });
        }

        match self.doc.import(update) {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                if message.contains("already") || message.contains("outdated") {
                    Ok(false)
                } else {
                    Err(RoomError::InvalidUpdate(message))
                }
            }
        }
    }

    /// Exports a compacted snapshot suitable for a late joiner's initial
    /// sync frame.
    pub fn export_snapshot(&self) -> Vec<u8> {
        self.doc.export(ExportMode::Snapshot).unwrap_or_default()
    }
}

impl Default for CrdtDocument {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update(text: &str) -> Vec<u8> {
        let doc = LoroDoc::new();
        doc.get_text("content").insert(0, text).unwrap();
        doc.export(ExportMode::all_updates()).unwrap()
    }

    #[test]
    fn applies_and_exports_snapshot() {
        let document = CrdtDocument::new();
        let update = sample_update("hi");

        assert!(document.ingest(&update, 10 * 1024 * 1024).unwrap());

        let snapshot = document.export_snapshot();
        let verify = LoroDoc::new();
        verify.import(&snapshot).unwrap();
        assert_eq!(verify.get_text("content").to_string(), "hi");
    }

    #[test]
    fn merges_concurrent_updates() {
        let document = CrdtDocument::new();
        document.ingest(&sample_update("Hello"), 10 * 1024 * 1024).unwrap();
        document.ingest(&sample_update("World"), 10 * 1024 * 1024).unwrap();

        let snapshot = document.export_snapshot();
        let verify = LoroDoc::new();
        verify.import(&snapshot).unwrap();
        let content = verify.get_text("content").to_string();
        assert!(content.contains("Hello") || content.contains("World"));
    }

    #[test]
    fn rejects_update_over_budget() {
        let document = CrdtDocument::new();
        let update = sample_update(&"x".repeat(1000));

        let result = document.ingest(&update, 100);
        assert!(matches!(result, Err(RoomError::DocumentBudgetExceeded { .. })));
    }

    #[test]
    fn empty_document_snapshot_is_small() {
        let document = CrdtDocument::new();
        assert!(document.export_snapshot().len() < 100);
    }
}
