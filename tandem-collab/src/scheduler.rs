//! Deferred work between shared-tree observers and the host view.
//!
//! Observers of the shared tree run while a transaction commits and must not
//! touch the view or open another transaction. They only record a
//! [`ChangeNotice`]; the binding drains the queue on its next
//! `run_pending` call, once the writing transaction is gone.
//!
//! ```text
//! observe_deep ──push──► ┌───────────┐ ──drain──► run_pending ──► view
//! set_meta ────────────► │ Scheduler │ ──take_metas──┘
//!                        └───────────┘
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use crate::position::SelectionSnapshot;
use crate::shared::NodeKey;

/// One committed remote change.
#[derive(Debug, Clone, Default)]
pub struct ChangeNotice {
    /// Containers whose children or attributes changed, ancestors included.
    pub touched: Vec<NodeKey>,
    /// The transaction came from an undo or redo.
    pub is_undo_redo: bool,
    /// Local selection captured before the transaction started.
    pub before_tx: Option<SelectionSnapshot>,
}

/// Queue of notices waiting for the next tick, plus view metadata that is
/// flushed with the next dispatch.
#[derive(Debug, Default)]
pub struct Scheduler {
    notices: Mutex<VecDeque<ChangeNotice>>,
    metas: Mutex<BTreeMap<String, Value>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notice: ChangeNotice) {
        let mut notices = self.notices.lock().unwrap_or_else(PoisonError::into_inner);
        notices.push_back(notice);
        log::trace!("queued change notice ({} pending)", notices.len());
    }

    /// Take every queued notice, oldest first.
    pub fn drain(&self) -> Vec<ChangeNotice> {
        let mut notices = self.notices.lock().unwrap_or_else(PoisonError::into_inner);
        notices.drain(..).collect()
    }

    /// Record a metadata entry for the next view update. Later values for
    /// the same key replace earlier ones.
    pub fn set_meta(&self, key: impl Into<String>, value: Value) {
        let mut metas = self.metas.lock().unwrap_or_else(PoisonError::into_inner);
        metas.insert(key.into(), value);
    }

    pub fn take_metas(&self) -> BTreeMap<String, Value> {
        let mut metas = self.metas.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *metas)
    }

    pub fn len(&self) -> usize {
        self.notices.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_metas(&self) -> bool {
        !self.metas.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    pub fn clear(&self) {
        self.notices.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.metas.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_drain_keeps_order() {
        let scheduler = Scheduler::new();
        scheduler.push(ChangeNotice {
            touched: vec![NodeKey::Root(Arc::from("a"))],
            ..Default::default()
        });
        scheduler.push(ChangeNotice {
            touched: vec![NodeKey::Root(Arc::from("b"))],
            is_undo_redo: true,
            before_tx: None,
        });
        assert_eq!(scheduler.len(), 2);

        let drained = scheduler.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].touched, vec![NodeKey::Root(Arc::from("a"))]);
        assert!(drained[1].is_undo_redo);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_metas_replace_and_flush() {
        let scheduler = Scheduler::new();
        scheduler.set_meta("cursor", json!(1));
        scheduler.set_meta("cursor", json!(2));
        scheduler.set_meta("focus", json!(true));
        assert!(scheduler.has_metas());

        let metas = scheduler.take_metas();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas["cursor"], json!(2));
        assert!(!scheduler.has_metas());
    }

    #[test]
    fn test_clear() {
        let scheduler = Scheduler::new();
        scheduler.push(ChangeNotice::default());
        scheduler.set_meta("x", Value::Null);
        scheduler.clear();
        assert!(scheduler.is_empty());
        assert!(scheduler.take_metas().is_empty());
    }
}
