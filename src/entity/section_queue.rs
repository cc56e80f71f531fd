//! section_queue entity
//! Durable FIFO of pending section-cache patches. Rows are marked done
//! after the owning worker applies them; undone rows are re-enqueued on
//! startup so a worker crash never loses an accepted update.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "section_queue")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub x: i32,
    pub y: i32,
    pub color_id: i32,
    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub enqueued_at: DateTimeUtc,
    pub done: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
