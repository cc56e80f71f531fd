//! placements entity
//! Append-only log of accepted pixel placements; the single source of truth

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "placements")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: String,
    pub x: i32,
    pub y: i32,
    /// Palette color id; -1 means "empty" (written by undo tombstones)
    pub color_id: i32,
    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub placed_at: DateTimeUtc,
    /// Set on undo tombstones: the id of the placement this row reverts.
    /// The tombstone's color_id carries the color beneath the reverted
    /// placement, so current-color reads stay a last-write-wins fold.
    pub undo_of: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::UserId"
    )]
    User,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
