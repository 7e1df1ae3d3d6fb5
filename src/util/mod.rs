pub mod ids;
pub mod subscribe;

pub use ids::{auto_id, is_temp_id, random_id, temp_id};
pub use subscribe::{noop_unsubscribe, Unsubscribe};
