//! Database connection and Placement Store operations
//!
//! The durable store is the single source of truth: the append-only
//! placement log, per-user economy rows, bans, settings, the per-shard
//! presence registry and the durable section-patch queue all live here.
//! Snapshot and section caches are derived and disposable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Index, OnConflict};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, Database as SeaOrmDatabase,
    DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    Schema, TransactionTrait,
};
use tracing::{error, info, warn};

use crate::config::EMPTY_COLOR;
use crate::entity::{bans, placements, presence, section_queue, settings, users};
use crate::error::Result;

const SETTING_CANVAS_WIDTH: &str = "canvas.width";
const SETTING_CANVAS_HEIGHT: &str = "canvas.height";
const SETTING_CANVAS_FROZEN: &str = "canvas.frozen";

/// Canvas store connection wrapper
pub struct Database {
    connection: DatabaseConnection,
}

impl Database {
    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Create a new database connection with bounded retry
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Connecting to canvas store...");

        let mut attempts = 0;
        const MAX_ATTEMPTS: u32 = 3;
        const RETRY_DELAY: Duration = Duration::from_secs(2);

        loop {
            attempts += 1;

            let mut opt = sea_orm::ConnectOptions::new(database_url.to_string());
            opt.max_connections(50)
                .min_connections(2)
                .connect_timeout(Duration::from_secs(10))
                .acquire_timeout(Duration::from_secs(30))
                .idle_timeout(Duration::from_secs(300))
                .sqlx_logging(false);

            match SeaOrmDatabase::connect(opt).await {
                Ok(connection) => {
                    info!("Connected to canvas store");
                    return Ok(Self { connection });
                }
                Err(e) if attempts < MAX_ATTEMPTS => {
                    warn!(
                        "Failed to connect to canvas store (attempt {}/{}): {}",
                        attempts, MAX_ATTEMPTS, e
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(
                        "Failed to connect to canvas store after {} attempts",
                        MAX_ATTEMPTS
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// Idempotent schema creation from the entity definitions, used at boot
    /// and by the sqlite-backed tests.
    pub async fn ensure_schema(&self) -> Result<()> {
        let backend = self.connection.get_database_backend();
        let schema = Schema::new(backend);

        let mut users_table = schema.create_table_from_entity(users::Entity);
        users_table.if_not_exists();
        self.connection.execute(backend.build(&users_table)).await?;

        let mut placements_table = schema.create_table_from_entity(placements::Entity);
        placements_table.if_not_exists();
        self.connection
            .execute(backend.build(&placements_table))
            .await?;

        let mut bans_table = schema.create_table_from_entity(bans::Entity);
        bans_table.if_not_exists();
        self.connection.execute(backend.build(&bans_table)).await?;

        let mut settings_table = schema.create_table_from_entity(settings::Entity);
        settings_table.if_not_exists();
        self.connection
            .execute(backend.build(&settings_table))
            .await?;

        let mut presence_table = schema.create_table_from_entity(presence::Entity);
        presence_table.if_not_exists();
        self.connection
            .execute(backend.build(&presence_table))
            .await?;

        let mut queue_table = schema.create_table_from_entity(section_queue::Entity);
        queue_table.if_not_exists();
        self.connection.execute(backend.build(&queue_table)).await?;

        let coord_index = Index::create()
            .name("idx_placements_coord")
            .table(placements::Entity)
            .col(placements::Column::X)
            .col(placements::Column::Y)
            .if_not_exists()
            .to_owned();
        self.connection.execute(backend.build(&coord_index)).await?;

        let user_index = Index::create()
            .name("idx_placements_user")
            .table(placements::Entity)
            .col(placements::Column::UserId)
            .if_not_exists()
            .to_owned();
        self.connection.execute(backend.build(&user_index)).await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Settings

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(settings::Entity::find_by_id(key.to_string())
            .one(&self.connection)
            .await?
            .map(|row| row.value))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let row = settings::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
            updated_at: Set(Utc::now()),
        };
        settings::Entity::insert(row)
            .on_conflict(
                OnConflict::column(settings::Column::Key)
                    .update_columns([settings::Column::Value, settings::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.connection)
            .await?;
        Ok(())
    }

    /// Current canvas dimensions, falling back to the configured defaults.
    pub async fn canvas_size(&self, default_width: u32, default_height: u32) -> Result<(u32, u32)> {
        let width = match self.get_setting(SETTING_CANVAS_WIDTH).await? {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Invalid {} setting: {:?}", SETTING_CANVAS_WIDTH, raw);
                default_width
            }),
            None => default_width,
        };
        let height = match self.get_setting(SETTING_CANVAS_HEIGHT).await? {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Invalid {} setting: {:?}", SETTING_CANVAS_HEIGHT, raw);
                default_height
            }),
            None => default_height,
        };
        Ok((width, height))
    }

    pub async fn set_canvas_size(&self, width: u32, height: u32) -> Result<()> {
        self.set_setting(SETTING_CANVAS_WIDTH, &width.to_string())
            .await?;
        self.set_setting(SETTING_CANVAS_HEIGHT, &height.to_string())
            .await
    }

    pub async fn canvas_frozen(&self) -> Result<bool> {
        Ok(self
            .get_setting(SETTING_CANVAS_FROZEN)
            .await?
            .map(|raw| raw == "true" || raw == "1")
            .unwrap_or(false))
    }

    pub async fn set_canvas_frozen(&self, frozen: bool) -> Result<()> {
        self.set_setting(SETTING_CANVAS_FROZEN, if frozen { "true" } else { "false" })
            .await
    }

    // ------------------------------------------------------------------
    // User economy rows

    /// Load the economy row, creating it on first authentication.
    pub async fn ensure_user(
        &self,
        user_id: &str,
        initial_stack: u32,
        now: DateTime<Utc>,
    ) -> Result<users::Model> {
        if let Some(row) = users::Entity::find_by_id(user_id.to_string())
            .one(&self.connection)
            .await?
        {
            return Ok(row);
        }

        let fresh = users::ActiveModel {
            user_id: Set(user_id.to_string()),
            pixel_stack: Set(initial_stack as i32),
            stack_anchor_time: Set(now),
            undo_expires_at: Set(None),
            ban_until: Set(None),
            version: Set(0),
        };
        match users::Entity::insert(fresh)
            .on_conflict(
                OnConflict::column(users::Column::UserId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(&self.connection)
            .await
        {
            Ok(_) | Err(DbErr::RecordNotInserted) => {}
            Err(e) => return Err(e.into()),
        }

        users::Entity::find_by_id(user_id.to_string())
            .one(&self.connection)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("user {user_id}")).into())
    }

    pub async fn load_user(&self, user_id: &str) -> Result<Option<users::Model>> {
        Ok(users::Entity::find_by_id(user_id.to_string())
            .one(&self.connection)
            .await?)
    }

    /// Compare-and-swap write of the economy fields, racing other shards.
    /// Returns false when the expected version lost.
    pub async fn update_user_economy_cas(
        &self,
        user_id: &str,
        pixel_stack: i32,
        stack_anchor_time: DateTime<Utc>,
        undo_expires_at: Option<DateTime<Utc>>,
        expected_version: i64,
    ) -> Result<bool> {
        let result = users::Entity::update_many()
            .col_expr(users::Column::PixelStack, Expr::value(pixel_stack))
            .col_expr(
                users::Column::StackAnchorTime,
                Expr::value(stack_anchor_time),
            )
            .col_expr(users::Column::UndoExpiresAt, Expr::value(undo_expires_at))
            .col_expr(users::Column::Version, Expr::value(expected_version + 1))
            .filter(users::Column::UserId.eq(user_id))
            .filter(users::Column::Version.eq(expected_version))
            .exec(&self.connection)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Economy CAS write plus placement append in one transaction, so a
    /// failed append rolls the spend back and a lost swap leaves no row.
    /// Returns the placement, or None when the expected version lost.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_with_economy_cas(
        &self,
        user_id: &str,
        pixel_stack: i32,
        stack_anchor_time: DateTime<Utc>,
        undo_expires_at: Option<DateTime<Utc>>,
        expected_version: i64,
        x: i32,
        y: i32,
        color_id: i32,
        placed_at: DateTime<Utc>,
        undo_of: Option<i64>,
    ) -> Result<Option<placements::Model>> {
        let txn = self.connection.begin().await?;
        let swap = users::Entity::update_many()
            .col_expr(users::Column::PixelStack, Expr::value(pixel_stack))
            .col_expr(
                users::Column::StackAnchorTime,
                Expr::value(stack_anchor_time),
            )
            .col_expr(users::Column::UndoExpiresAt, Expr::value(undo_expires_at))
            .col_expr(users::Column::Version, Expr::value(expected_version + 1))
            .filter(users::Column::UserId.eq(user_id))
            .filter(users::Column::Version.eq(expected_version))
            .exec(&txn)
            .await?;
        if swap.rows_affected != 1 {
            txn.rollback().await?;
            return Ok(None);
        }

        let row = placements::ActiveModel {
            user_id: Set(user_id.to_string()),
            x: Set(x),
            y: Set(y),
            color_id: Set(color_id),
            placed_at: Set(placed_at),
            undo_of: Set(undo_of),
            ..Default::default()
        };
        let placement = row.insert(&txn).await?;
        txn.commit().await?;
        Ok(Some(placement))
    }

    pub async fn set_user_ban(
        &self,
        user_id: &str,
        ban_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        users::Entity::update_many()
            .col_expr(users::Column::BanUntil, Expr::value(ban_until))
            .filter(users::Column::UserId.eq(user_id))
            .exec(&self.connection)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bans

    /// Record an explicit ban (banned = true) or unban override
    /// (banned = false) for a user or domain subject.
    pub async fn upsert_ban(
        &self,
        subject: &str,
        banned: bool,
        expires_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<()> {
        let row = bans::ActiveModel {
            subject: Set(subject.to_string()),
            banned: Set(banned),
            expires_at: Set(expires_at),
            reason: Set(reason),
            created_at: Set(Utc::now()),
        };
        bans::Entity::insert(row)
            .on_conflict(
                OnConflict::column(bans::Column::Subject)
                    .update_columns([
                        bans::Column::Banned,
                        bans::Column::ExpiresAt,
                        bans::Column::Reason,
                        bans::Column::CreatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.connection)
            .await?;
        Ok(())
    }

    pub async fn user_ban(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<bans::Model>> {
        let subject = format!("user:{user_id}");
        match bans::Entity::find_by_id(subject).one(&self.connection).await? {
            Some(row) if row.banned && row.expires_at.map_or(true, |t| t > now) => Ok(Some(row)),
            _ => Ok(None),
        }
    }

    /// Effective domain ban with sub-domain inheritance: walk suffixes from
    /// most specific to least; the first explicit entry wins, so an unban
    /// row on "chat.example.com" overrides a ban on "example.com".
    pub async fn effective_domain_ban(
        &self,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<bans::Model>> {
        let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if normalized.is_empty() {
            return Ok(None);
        }

        let mut labels: Vec<&str> = normalized.split('.').collect();
        while !labels.is_empty() {
            let subject = format!("domain:{}", labels.join("."));
            if let Some(row) = bans::Entity::find_by_id(subject).one(&self.connection).await? {
                if !row.banned {
                    return Ok(None);
                }
                if row.expires_at.map_or(true, |t| t > now) {
                    return Ok(Some(row));
                }
                // Expired ban rows are treated as absent.
            }
            labels.remove(0);
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Placement log

    pub async fn insert_placement(
        &self,
        user_id: &str,
        x: i32,
        y: i32,
        color_id: i32,
        placed_at: DateTime<Utc>,
        undo_of: Option<i64>,
    ) -> Result<placements::Model> {
        let row = placements::ActiveModel {
            user_id: Set(user_id.to_string()),
            x: Set(x),
            y: Set(y),
            color_id: Set(color_id),
            placed_at: Set(placed_at),
            undo_of: Set(undo_of),
            ..Default::default()
        };
        Ok(row.insert(&self.connection).await?)
    }

    /// Latest-placement-per-coordinate fold over the whole log, row-major.
    /// Ties inside the same millisecond order by row id, so concurrent
    /// placements resolve deterministically to a single color.
    pub async fn latest_colors(&self, width: u32, height: u32) -> Result<Vec<i32>> {
        let rows = placements::Entity::find()
            .order_by_asc(placements::Column::PlacedAt)
            .order_by_asc(placements::Column::Id)
            .all(&self.connection)
            .await?;

        let mut cells = vec![EMPTY_COLOR; width as usize * height as usize];
        for row in rows {
            if row.x >= 0 && row.y >= 0 && (row.x as u32) < width && (row.y as u32) < height {
                cells[row.y as usize * width as usize + row.x as usize] = row.color_id;
            }
        }
        Ok(cells)
    }

    /// Same fold restricted to one section rectangle, local row-major.
    pub async fn section_colors(
        &self,
        x0: i32,
        y0: i32,
        width: u32,
        height: u32,
    ) -> Result<Vec<i32>> {
        let rows = placements::Entity::find()
            .filter(placements::Column::X.gte(x0))
            .filter(placements::Column::X.lt(x0 + width as i32))
            .filter(placements::Column::Y.gte(y0))
            .filter(placements::Column::Y.lt(y0 + height as i32))
            .order_by_asc(placements::Column::PlacedAt)
            .order_by_asc(placements::Column::Id)
            .all(&self.connection)
            .await?;

        let mut cells = vec![EMPTY_COLOR; width as usize * height as usize];
        for row in rows {
            let lx = (row.x - x0) as usize;
            let ly = (row.y - y0) as usize;
            cells[ly * width as usize + lx] = row.color_id;
        }
        Ok(cells)
    }

    /// Single-cell history, newest first, plus the total placement count
    /// at that cell.
    pub async fn cell_history(
        &self,
        x: i32,
        y: i32,
        limit: u64,
    ) -> Result<(Vec<placements::Model>, u64)> {
        let filtered = placements::Entity::find()
            .filter(placements::Column::X.eq(x))
            .filter(placements::Column::Y.eq(y));
        let total = filtered.clone().count(&self.connection).await?;
        let rows = filtered
            .order_by_desc(placements::Column::PlacedAt)
            .order_by_desc(placements::Column::Id)
            .limit(limit)
            .all(&self.connection)
            .await?;
        Ok((rows, total))
    }

    /// When the user last placed a pixel (tombstones excluded).
    pub async fn last_placed_at(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(placements::Entity::find()
            .filter(placements::Column::UserId.eq(user_id))
            .filter(placements::Column::UndoOf.is_null())
            .order_by_desc(placements::Column::Id)
            .one(&self.connection)
            .await?
            .map(|row| row.placed_at))
    }

    /// The user's most recent own placement that is not a tombstone and has
    /// not been reverted yet.
    pub async fn last_undoable_placement(
        &self,
        user_id: &str,
    ) -> Result<Option<placements::Model>> {
        let latest = placements::Entity::find()
            .filter(placements::Column::UserId.eq(user_id))
            .filter(placements::Column::UndoOf.is_null())
            .order_by_desc(placements::Column::Id)
            .one(&self.connection)
            .await?;

        let Some(placement) = latest else {
            return Ok(None);
        };
        let reverted = placements::Entity::find()
            .filter(placements::Column::UndoOf.eq(placement.id))
            .count(&self.connection)
            .await?
            > 0;
        Ok(if reverted { None } else { Some(placement) })
    }

    /// The color a cell shows once the given placement is taken away:
    /// last-write-wins over all earlier rows at that coordinate.
    pub async fn color_beneath(&self, placement: &placements::Model) -> Result<i32> {
        let prior = placements::Entity::find()
            .filter(placements::Column::X.eq(placement.x))
            .filter(placements::Column::Y.eq(placement.y))
            .filter(placements::Column::Id.lt(placement.id))
            .order_by_desc(placements::Column::PlacedAt)
            .order_by_desc(placements::Column::Id)
            .one(&self.connection)
            .await?;
        Ok(prior.map(|row| row.color_id).unwrap_or(EMPTY_COLOR))
    }

    // ------------------------------------------------------------------
    // Durable section-patch queue

    pub async fn enqueue_section_patch(&self, x: i32, y: i32, color_id: i32) -> Result<i64> {
        let row = section_queue::ActiveModel {
            x: Set(x),
            y: Set(y),
            color_id: Set(color_id),
            enqueued_at: Set(Utc::now()),
            done: Set(false),
            ..Default::default()
        };
        Ok(row.insert(&self.connection).await?.id)
    }

    pub async fn ack_section_patch(&self, id: i64) -> Result<()> {
        section_queue::Entity::update_many()
            .col_expr(section_queue::Column::Done, Expr::value(true))
            .filter(section_queue::Column::Id.eq(id))
            .exec(&self.connection)
            .await?;
        Ok(())
    }

    /// Unacknowledged patches in enqueue order, replayed on startup.
    pub async fn pending_section_patches(&self) -> Result<Vec<section_queue::Model>> {
        Ok(section_queue::Entity::find()
            .filter(section_queue::Column::Done.eq(false))
            .order_by_asc(section_queue::Column::Id)
            .all(&self.connection)
            .await?)
    }

    // ------------------------------------------------------------------
    // Presence registry

    pub async fn upsert_presence(&self, shard_id: &str, connections: i64) -> Result<()> {
        let row = presence::ActiveModel {
            shard_id: Set(shard_id.to_string()),
            connections: Set(connections),
            updated_at: Set(Utc::now()),
        };
        presence::Entity::insert(row)
            .on_conflict(
                OnConflict::column(presence::Column::ShardId)
                    .update_columns([presence::Column::Connections, presence::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.connection)
            .await?;
        Ok(())
    }

    /// Sum of all shard counts whose heartbeat is within the TTL window.
    pub async fn presence_total(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> Result<i64> {
        let rows = presence::Entity::find().all(&self.connection).await?;
        Ok(rows
            .into_iter()
            .filter(|row| now - row.updated_at <= ttl)
            .map(|row| row.connections)
            .sum())
    }
}
