//! Sea-ORM entities for the canvas store

pub mod bans;
pub mod placements;
pub mod presence;
pub mod section_queue;
pub mod settings;
pub mod users;

// Re-export entities for convenience
pub use bans::Entity as Bans;
pub use placements::Entity as Placements;
pub use presence::Entity as Presence;
pub use section_queue::Entity as SectionQueue;
pub use settings::Entity as Settings;
pub use users::Entity as Users;
