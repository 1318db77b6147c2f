//! Store Handle
//!
//! Bridges the synchronous `ConversationStore` into the async world.
//! Every method is infallible: a store failure is logged and the
//! operation becomes a no-op, so a bad row can never take the loop down.

use std::sync::{Arc, Mutex};

use tracing::error;

use crate::state::{ConversationStore, StateFilter};
use crate::types::{
    ApprovalRecord, ApprovalStatus, BudgetStatus, ConversationRecord, ConversationSummary,
    PendingMessage, StoreStats,
};

/// Cloneable, narrow view over the single-writer store. This is the only
/// artefact shared between ingress and the cognitive loop.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<Mutex<ConversationStore>>,
}

impl StoreHandle {
    pub fn new(store: ConversationStore) -> Self {
        Self { store: Arc::new(Mutex::new(store)) }
    }

    pub fn upsert_request(&self, request_id: &str, user_text: &str, budget: Option<f64>) {
        if let Err(e) = self.store.lock().unwrap().upsert_request(request_id, user_text, budget) {
            error!("store: upsert_request failed: {e:#}");
        }
    }

    pub fn append_response(
        &self,
        request_id: &str,
        user_text: Option<&str>,
        content: &str,
        energy_at_write: f64,
        model_tier: &str,
    ) {
        if let Err(e) = self.store.lock().unwrap().append_response(
            request_id,
            user_text,
            content,
            energy_at_write,
            model_tier,
        ) {
            error!("store: append_response failed: {e:#}");
        }
    }

    pub fn append_approval(
        &self,
        request_id: &str,
        content: &str,
        energy_at_write: f64,
        model_tier: &str,
        budget: Option<f64>,
    ) {
        if let Err(e) = self.store.lock().unwrap().append_approval(
            request_id,
            content,
            energy_at_write,
            model_tier,
            budget,
        ) {
            error!("store: append_approval failed: {e:#}");
        }
    }

    pub fn set_approval_status(
        &self,
        request_id: &str,
        approval_id: Option<i64>,
        status: ApprovalStatus,
        feedback: Option<&str>,
    ) -> bool {
        match self.store.lock().unwrap().set_approval_status(
            request_id,
            approval_id,
            status,
            feedback,
        ) {
            Ok(moved) => moved,
            Err(e) => {
                error!("store: set_approval_status failed: {e:#}");
                false
            }
        }
    }

    pub fn approvals(&self, request_id: &str) -> Vec<ApprovalRecord> {
        self.store.lock().unwrap().approvals(request_id).unwrap_or_else(|e| {
            error!("store: approvals failed: {e:#}");
            Vec::new()
        })
    }

    pub fn set_budget(&self, request_id: &str, value: f64) {
        if let Err(e) = self.store.lock().unwrap().set_budget(request_id, value) {
            error!("store: set_budget failed: {e:#}");
        }
    }

    pub fn adjust_budget(&self, request_id: &str, delta: f64) {
        if let Err(e) = self.store.lock().unwrap().adjust_budget(request_id, delta) {
            error!("store: adjust_budget failed: {e:#}");
        }
    }

    pub fn add_consumption(&self, request_id: &str, amount: f64) {
        if let Err(e) = self.store.lock().unwrap().add_consumption(request_id, amount) {
            error!("store: add_consumption failed: {e:#}");
        }
    }

    pub fn end(&self, request_id: &str, reason: Option<&str>) {
        if let Err(e) = self.store.lock().unwrap().end(request_id, reason) {
            error!("store: end failed: {e:#}");
        }
    }

    pub fn snooze(&self, request_id: &str, minutes: f64) {
        if let Err(e) = self.store.lock().unwrap().snooze(request_id, minutes) {
            error!("store: snooze failed: {e:#}");
        }
    }

    pub fn get(&self, request_id: &str) -> Option<ConversationRecord> {
        self.store.lock().unwrap().get(request_id).unwrap_or_else(|e| {
            error!("store: get failed: {e:#}");
            None
        })
    }

    pub fn pending(&self) -> Vec<PendingMessage> {
        self.store.lock().unwrap().pending().unwrap_or_else(|e| {
            error!("store: pending failed: {e:#}");
            Vec::new()
        })
    }

    pub fn recent_open(&self, limit: i64) -> Vec<ConversationSummary> {
        self.store.lock().unwrap().recent_open(limit).unwrap_or_else(|e| {
            error!("store: recent_open failed: {e:#}");
            Vec::new()
        })
    }

    pub fn recent_completed(&self, limit: i64) -> Vec<ConversationSummary> {
        self.store.lock().unwrap().recent_completed(limit).unwrap_or_else(|e| {
            error!("store: recent_completed failed: {e:#}");
            Vec::new()
        })
    }

    pub fn list(
        &self,
        state: Option<StateFilter>,
        budget: Option<BudgetStatus>,
        limit: i64,
    ) -> Vec<ConversationSummary> {
        self.store.lock().unwrap().list(state, budget, limit).unwrap_or_else(|e| {
            error!("store: list failed: {e:#}");
            Vec::new()
        })
    }

    pub fn stats(&self) -> StoreStats {
        self.store.lock().unwrap().stats().unwrap_or_else(|e| {
            error!("store: stats failed: {e:#}");
            StoreStats::default()
        })
    }
}
