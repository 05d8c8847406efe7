//! `courier-core`: shared building blocks for the dispatch engine.
//!
//! Pure primitives only: identifiers, the domain error, entity identity and a
//! clock seam. No infrastructure concerns live here.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{
    CampaignId, CompanyId, ConnectionId, ContactId, ConversationId, ScheduleId, ShippingId, TagId,
    UserId,
};
