//! SQLite schema. Every statement is idempotent so `execute_init` can run on
//! each start.
//!
//! Tables carry no foreign keys: messages may be stored before (or without)
//! the metadata of their channel, and metadata rows are replaced in place.

pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS guild (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS channel (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        guild_id INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_channel_guild ON channel (guild_id);

    CREATE TABLE IF NOT EXISTS member (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        discriminator TEXT
    );

    -- Nicknames are guild scoped.
    CREATE TABLE IF NOT EXISTS nick (
        member_id INTEGER NOT NULL,
        guild_id INTEGER NOT NULL,
        nick TEXT NOT NULL,
        PRIMARY KEY (member_id, guild_id)
    );

    CREATE TABLE IF NOT EXISTS message (
        id INTEGER PRIMARY KEY,
        channel_id INTEGER NOT NULL,
        author_id INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_message_channel_time ON message (channel_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_message_channel_author_time
        ON message (channel_id, author_id, created_at);

    CREATE TABLE IF NOT EXISTS daily_channel_count (
        channel_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        count INTEGER NOT NULL CHECK (count >= 0),
        cumulative_count INTEGER NOT NULL CHECK (cumulative_count >= 0),
        PRIMARY KEY (channel_id, date)
    );

    CREATE TABLE IF NOT EXISTS daily_user_channel_count (
        author_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        count INTEGER NOT NULL CHECK (count >= 0),
        cumulative_count INTEGER NOT NULL CHECK (cumulative_count >= 0),
        PRIMARY KEY (author_id, channel_id, date)
    );
    CREATE INDEX IF NOT EXISTS idx_user_count_channel_date
        ON daily_user_channel_count (channel_id, date);
";
