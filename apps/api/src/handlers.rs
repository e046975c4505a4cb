pub mod health;
pub mod identities;
pub mod partner_events;
pub mod threats;
