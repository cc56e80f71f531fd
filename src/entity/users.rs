//! users entity
//! Per-user economy row: banked pixel stack, refill anchor, undo window, ban

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: String,
    /// Banked pixels; never negative
    pub pixel_stack: i32,
    /// Shared refill anchor; all banked pixels accrue from this one timestamp
    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub stack_anchor_time: DateTimeUtc,
    #[sea_orm(column_type = "TimestampWithTimeZone", nullable)]
    pub undo_expires_at: Option<DateTimeUtc>,
    #[sea_orm(column_type = "TimestampWithTimeZone", nullable)]
    pub ban_until: Option<DateTimeUtc>,
    /// Optimistic-concurrency counter; every economy write bumps it
    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
