use crate::config::Config;
use rusqlite::{params, Connection, OptionalExtension, Statement};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

mod counts;
pub mod models;
pub mod schema;

pub use models::*;

/// Shared handle to the single SQLite store. Cloning is cheap and every clone
/// talks to the same connection, one operation at a time.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(database_url: &str) -> anyhow::Result<Self> {
        if database_url != ":memory:" {
            if let Some(parent) = Path::new(database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(database_url)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::open(":memory:")
    }

    pub(crate) fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection mutex poisoned"))
    }

    /// Runs a synchronous database closure on tokio's blocking pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.lock()?;
        conn.execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    /// Writes `items` in transactions of at most `batch_size` rows.
    fn write_batched<T>(
        &self,
        sql: &str,
        items: &[T],
        batch_size: usize,
        bind: impl Fn(&mut Statement<'_>, &T) -> rusqlite::Result<usize>,
    ) -> anyhow::Result<usize> {
        let mut conn = self.lock()?;
        let mut written = 0usize;
        for chunk in items.chunks(batch_size.max(1)) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(sql)?;
                for item in chunk {
                    written += bind(&mut stmt, item)?;
                }
            }
            tx.commit()?;
        }
        Ok(written)
    }

    // --- Metadata ---

    pub fn upsert_guild(&self, guild: &GuildRecord) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO guild (id, name) VALUES (?1, ?2)",
            params![guild.id, guild.name],
        )?;
        Ok(())
    }

    pub fn upsert_channels(
        &self,
        channels: &[ChannelRecord],
        batch_size: usize,
    ) -> anyhow::Result<usize> {
        self.write_batched(
            "INSERT OR REPLACE INTO channel (id, name, guild_id) VALUES (?1, ?2, ?3)",
            channels,
            batch_size,
            |stmt, c| stmt.execute(params![c.id, c.name, c.guild_id]),
        )
    }

    pub fn upsert_members(
        &self,
        members: &[MemberRecord],
        batch_size: usize,
    ) -> anyhow::Result<usize> {
        self.write_batched(
            "INSERT OR REPLACE INTO member (id, name, discriminator) VALUES (?1, ?2, ?3)",
            members,
            batch_size,
            |stmt, m| stmt.execute(params![m.id, m.name, m.discriminator]),
        )
    }

    pub fn upsert_nicks(&self, nicks: &[NickRecord], batch_size: usize) -> anyhow::Result<usize> {
        self.write_batched(
            "INSERT OR REPLACE INTO nick (member_id, guild_id, nick) VALUES (?1, ?2, ?3)",
            nicks,
            batch_size,
            |stmt, n| stmt.execute(params![n.member_id, n.guild_id, n.nick]),
        )
    }

    pub fn list_guilds(&self) -> anyhow::Result<Vec<GuildRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name FROM guild ORDER BY name, id")?;
        let rows = stmt.query_map([], |row| {
            Ok(GuildRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_guild(&self, guild_id: u64) -> anyhow::Result<Option<GuildRecord>> {
        let conn = self.lock()?;
        let guild = conn
            .query_row(
                "SELECT id, name FROM guild WHERE id = ?1",
                [guild_id],
                |row| {
                    Ok(GuildRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(guild)
    }

    pub fn channels_for_guild(&self, guild_id: u64) -> anyhow::Result<Vec<ChannelRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, name, guild_id FROM channel WHERE guild_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([guild_id], |row| {
            Ok(ChannelRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                guild_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_channel(&self, channel_id: u64) -> anyhow::Result<Option<ChannelRecord>> {
        let conn = self.lock()?;
        let channel = conn
            .query_row(
                "SELECT id, name, guild_id FROM channel WHERE id = ?1",
                [channel_id],
                |row| {
                    Ok(ChannelRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        guild_id: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(channel)
    }

    pub fn get_member(&self, member_id: u64) -> anyhow::Result<Option<MemberRecord>> {
        let conn = self.lock()?;
        let member = conn
            .query_row(
                "SELECT id, name, discriminator FROM member WHERE id = ?1",
                [member_id],
                |row| {
                    Ok(MemberRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        discriminator: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(member)
    }

    pub fn get_nick(&self, member_id: u64, guild_id: u64) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        let nick = conn
            .query_row(
                "SELECT nick FROM nick WHERE member_id = ?1 AND guild_id = ?2",
                [member_id, guild_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(nick)
    }

    // --- Messages ---

    pub fn upsert_messages(
        &self,
        messages: &[MessageRecord],
        batch_size: usize,
    ) -> anyhow::Result<usize> {
        self.write_batched(
            "INSERT OR REPLACE INTO message (id, channel_id, author_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            messages,
            batch_size,
            |stmt, m| stmt.execute(params![m.id, m.channel_id, m.author_id, m.created_at]),
        )
    }

    pub fn last_message_timestamp(&self, channel_id: u64) -> anyhow::Result<Option<i64>> {
        let conn = self.lock()?;
        let ts = conn.query_row(
            "SELECT MAX(created_at) FROM message WHERE channel_id = ?1",
            [channel_id],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    /// Earliest message timestamp in a channel, optionally restricted to one author.
    pub fn earliest_message_timestamp(
        &self,
        channel_id: u64,
        author_id: Option<u64>,
    ) -> anyhow::Result<Option<i64>> {
        let conn = self.lock()?;
        let ts = match author_id {
            Some(author) => conn.query_row(
                "SELECT MIN(created_at) FROM message WHERE channel_id = ?1 AND author_id = ?2",
                [channel_id, author],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT MIN(created_at) FROM message WHERE channel_id = ?1",
                [channel_id],
                |row| row.get(0),
            )?,
        };
        Ok(ts)
    }

    /// Timestamps at or after `since`, ascending.
    pub fn message_timestamps_since(
        &self,
        channel_id: u64,
        author_id: Option<u64>,
        since: i64,
    ) -> anyhow::Result<Vec<i64>> {
        let conn = self.lock()?;
        let timestamps = match author_id {
            Some(author) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT created_at FROM message
                     WHERE channel_id = ?1 AND author_id = ?2 AND created_at >= ?3
                     ORDER BY created_at",
                )?;
                let rows = stmt.query_map(params![channel_id, author, since], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT created_at FROM message
                     WHERE channel_id = ?1 AND created_at >= ?2
                     ORDER BY created_at",
                )?;
                let rows = stmt.query_map(params![channel_id, since], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>()?
            }
        };
        Ok(timestamps)
    }

    pub fn channel_authors(&self, channel_id: u64) -> anyhow::Result<Vec<u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT author_id FROM message WHERE channel_id = ?1 ORDER BY author_id",
        )?;
        let rows = stmt.query_map([channel_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<u64>>>()?)
    }

    pub fn message_count(&self, channel_id: u64) -> anyhow::Result<i64> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM message WHERE channel_id = ?1",
            [channel_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.execute_init().unwrap();
        db
    }

    fn msg(id: u64, channel_id: u64, author_id: u64, created_at: i64) -> MessageRecord {
        MessageRecord {
            id,
            channel_id,
            author_id,
            created_at,
        }
    }

    #[test]
    fn test_db_init_is_idempotent() {
        let db = test_db();
        db.execute_init().unwrap();
        assert!(db.list_guilds().unwrap().is_empty());
    }

    #[test]
    fn test_metadata_upsert_replaces() {
        let db = test_db();
        db.upsert_guild(&GuildRecord {
            id: 1,
            name: "Old".to_string(),
        })
        .unwrap();
        db.upsert_guild(&GuildRecord {
            id: 1,
            name: "New".to_string(),
        })
        .unwrap();
        assert_eq!(db.get_guild(1).unwrap().unwrap().name, "New");

        let channels: Vec<_> = (0..5)
            .map(|i| ChannelRecord {
                id: 10 + i,
                name: format!("chan-{}", i),
                guild_id: 1,
            })
            .collect();
        // Batch size smaller than the input exercises several transactions.
        assert_eq!(db.upsert_channels(&channels, 2).unwrap(), 5);
        assert_eq!(db.channels_for_guild(1).unwrap().len(), 5);
        assert_eq!(db.get_channel(12).unwrap().unwrap().name, "chan-2");
    }

    #[test]
    fn test_nick_is_guild_scoped() {
        let db = test_db();
        db.upsert_members(
            &[MemberRecord {
                id: 7,
                name: "alice".to_string(),
                discriminator: Some("0420".to_string()),
            }],
            300,
        )
        .unwrap();
        db.upsert_nicks(
            &[
                NickRecord {
                    member_id: 7,
                    guild_id: 1,
                    nick: "Al".to_string(),
                },
                NickRecord {
                    member_id: 7,
                    guild_id: 2,
                    nick: "Ally".to_string(),
                },
            ],
            300,
        )
        .unwrap();

        assert_eq!(db.get_nick(7, 1).unwrap().as_deref(), Some("Al"));
        assert_eq!(db.get_nick(7, 2).unwrap().as_deref(), Some("Ally"));
        assert_eq!(db.get_nick(7, 3).unwrap(), None);
        assert_eq!(
            db.get_member(7).unwrap().unwrap().discriminator.as_deref(),
            Some("0420")
        );
    }

    #[test]
    fn test_message_upsert_is_idempotent() {
        let db = test_db();
        let batch = vec![msg(1, 10, 100, 1_000), msg(2, 10, 101, 2_000)];
        db.upsert_messages(&batch, 300).unwrap();
        db.upsert_messages(&batch, 300).unwrap();
        // Re-fetched overlap with an edited author id replaces the row.
        db.upsert_messages(&[msg(2, 10, 102, 2_000)], 300).unwrap();

        assert_eq!(db.message_count(10).unwrap(), 2);
        assert_eq!(db.channel_authors(10).unwrap(), vec![100, 102]);
        assert_eq!(db.last_message_timestamp(10).unwrap(), Some(2_000));
        assert_eq!(db.last_message_timestamp(11).unwrap(), None);
    }

    #[test]
    fn test_messages_do_not_require_channel_metadata() {
        let db = test_db();
        db.upsert_messages(&[msg(1, 10, 100, 1_000)], 300).unwrap();

        // Metadata arriving later, and being replaced, leaves messages alone.
        for name in ["general", "renamed"] {
            db.upsert_guild(&GuildRecord {
                id: 1,
                name: "Guild".to_string(),
            })
            .unwrap();
            db.upsert_channels(
                &[ChannelRecord {
                    id: 10,
                    name: name.to_string(),
                    guild_id: 1,
                }],
                300,
            )
            .unwrap();
        }
        assert_eq!(db.get_channel(10).unwrap().unwrap().name, "renamed");
        assert_eq!(db.message_count(10).unwrap(), 1);
        assert_eq!(db.channel_authors(10).unwrap(), vec![100]);
    }

    #[test]
    fn test_message_timestamp_queries() {
        let db = test_db();
        db.upsert_messages(
            &[
                msg(1, 10, 100, 500),
                msg(2, 10, 101, 100),
                msg(3, 10, 100, 300),
                msg(4, 11, 100, 50),
            ],
            300,
        )
        .unwrap();

        assert_eq!(db.earliest_message_timestamp(10, None).unwrap(), Some(100));
        assert_eq!(
            db.earliest_message_timestamp(10, Some(100)).unwrap(),
            Some(300)
        );
        assert_eq!(db.earliest_message_timestamp(12, None).unwrap(), None);
        assert_eq!(
            db.message_timestamps_since(10, None, 200).unwrap(),
            vec![300, 500]
        );
        assert_eq!(
            db.message_timestamps_since(10, Some(101), 0).unwrap(),
            vec![100]
        );
    }
}
