use crate::models::{IndexState, ResourceIndexRecord};
use crate::service::memory::seed_record;

/// Record with the given text state and a pending multimodal state.
pub fn record(id: &str, resource_type: &str, text: IndexState) -> ResourceIndexRecord {
    seed_record(id, resource_type, id, text, IndexState::Pending)
}
