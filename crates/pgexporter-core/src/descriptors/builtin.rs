//! Built-in query mappings.
//!
//! All of these read server-wide views, so they are master-only: scraping
//! them again through every discovered database would only duplicate series.

use super::ColumnUsage::{Counter, Discard, Duration, Gauge, Label};
use super::{MappingOrigin, QueryMapping, ServerVersion, VersionRange};

const fn v(major: u32, minor: u32) -> ServerVersion {
    ServerVersion::new(major, minor, 0)
}

pub fn mappings() -> Vec<QueryMapping> {
    vec![
        stat_bgwriter(),
        stat_database(),
        stat_database_conflicts(),
        locks(),
        stat_replication(),
        replication_slots(),
        stat_archiver(),
        stat_activity(),
        database(),
        postmaster(),
    ]
}

fn builtin(namespace: &str) -> QueryMapping {
    QueryMapping::new(namespace, MappingOrigin::Builtin).master(true)
}

/// PG 17 moved the checkpoint counters to `pg_stat_checkpointer` and dropped
/// the backend write counters.
fn stat_bgwriter() -> QueryMapping {
    builtin("pg_stat_bgwriter")
        .query(
            VersionRange::at_least(v(17, 0)),
            r#"
            SELECT
                c.num_timed AS checkpoints_timed,
                c.num_requested AS checkpoints_req,
                c.write_time AS checkpoint_write_time,
                c.sync_time AS checkpoint_sync_time,
                c.buffers_written AS buffers_checkpoint,
                b.buffers_clean,
                b.maxwritten_clean,
                b.buffers_alloc,
                EXTRACT(EPOCH FROM b.stats_reset) AS stats_reset
            FROM pg_stat_bgwriter b
            CROSS JOIN pg_stat_checkpointer c
            "#,
        )
        .query(
            VersionRange::any(),
            r#"
            SELECT
                checkpoints_timed,
                checkpoints_req,
                checkpoint_write_time,
                checkpoint_sync_time,
                buffers_checkpoint,
                buffers_clean,
                maxwritten_clean,
                buffers_backend,
                buffers_backend_fsync,
                buffers_alloc,
                EXTRACT(EPOCH FROM stats_reset) AS stats_reset
            FROM pg_stat_bgwriter
            "#,
        )
        .column("checkpoints_timed", Counter, "Number of scheduled checkpoints that have been performed")
        .column("checkpoints_req", Counter, "Number of requested checkpoints that have been performed")
        .column(
            "checkpoint_write_time",
            Counter,
            "Total amount of time that has been spent in the portion of checkpoint processing where files are written to disk, in milliseconds",
        )
        .column(
            "checkpoint_sync_time",
            Counter,
            "Total amount of time that has been spent in the portion of checkpoint processing where files are synchronized to disk, in milliseconds",
        )
        .column("buffers_checkpoint", Counter, "Number of buffers written during checkpoints")
        .column("buffers_clean", Counter, "Number of buffers written by the background writer")
        .column(
            "maxwritten_clean",
            Counter,
            "Number of times the background writer stopped a cleaning scan because it had written too many buffers",
        )
        .column("buffers_backend", Counter, "Number of buffers written directly by a backend")
        .column(
            "buffers_backend_fsync",
            Counter,
            "Number of times a backend had to execute its own fsync call",
        )
        .column("buffers_alloc", Counter, "Number of buffers allocated")
        .column("stats_reset", Counter, "Time at which these statistics were last reset")
}

fn stat_database() -> QueryMapping {
    builtin("pg_stat_database")
        .query(
            VersionRange::any(),
            r#"
            SELECT
                datid::text AS datid,
                datname,
                numbackends,
                xact_commit,
                xact_rollback,
                blks_read,
                blks_hit,
                tup_returned,
                tup_fetched,
                tup_inserted,
                tup_updated,
                tup_deleted,
                conflicts,
                temp_files,
                temp_bytes,
                deadlocks,
                blk_read_time,
                blk_write_time,
                EXTRACT(EPOCH FROM stats_reset) AS stats_reset
            FROM pg_stat_database
            WHERE datname IS NOT NULL
            "#,
        )
        .column("datid", Label, "OID of a database")
        .column("datname", Label, "Name of this database")
        .column("numbackends", Gauge, "Number of backends currently connected to this database")
        .column("xact_commit", Counter, "Number of transactions in this database that have been committed")
        .column("xact_rollback", Counter, "Number of transactions in this database that have been rolled back")
        .column("blks_read", Counter, "Number of disk blocks read in this database")
        .column(
            "blks_hit",
            Counter,
            "Number of times disk blocks were found already in the buffer cache",
        )
        .column("tup_returned", Counter, "Number of rows returned by queries in this database")
        .column("tup_fetched", Counter, "Number of rows fetched by queries in this database")
        .column("tup_inserted", Counter, "Number of rows inserted by queries in this database")
        .column("tup_updated", Counter, "Number of rows updated by queries in this database")
        .column("tup_deleted", Counter, "Number of rows deleted by queries in this database")
        .column(
            "conflicts",
            Counter,
            "Number of queries canceled due to conflicts with recovery in this database",
        )
        .column("temp_files", Counter, "Number of temporary files created by queries in this database")
        .column(
            "temp_bytes",
            Counter,
            "Total amount of data written to temporary files by queries in this database",
        )
        .column("deadlocks", Counter, "Number of deadlocks detected in this database")
        .column(
            "blk_read_time",
            Counter,
            "Time spent reading data file blocks by backends in this database, in milliseconds",
        )
        .column(
            "blk_write_time",
            Counter,
            "Time spent writing data file blocks by backends in this database, in milliseconds",
        )
        .column("stats_reset", Counter, "Time at which these statistics were last reset")
}

fn stat_database_conflicts() -> QueryMapping {
    builtin("pg_stat_database_conflicts")
        .query(
            VersionRange::any(),
            r#"
            SELECT
                datid::text AS datid,
                datname,
                confl_tablespace,
                confl_lock,
                confl_snapshot,
                confl_bufferpin,
                confl_deadlock
            FROM pg_stat_database_conflicts
            "#,
        )
        .column("datid", Label, "OID of a database")
        .column("datname", Label, "Name of this database")
        .column(
            "confl_tablespace",
            Counter,
            "Number of queries in this database that have been canceled due to dropped tablespaces",
        )
        .column(
            "confl_lock",
            Counter,
            "Number of queries in this database that have been canceled due to lock timeouts",
        )
        .column(
            "confl_snapshot",
            Counter,
            "Number of queries in this database that have been canceled due to old snapshots",
        )
        .column(
            "confl_bufferpin",
            Counter,
            "Number of queries in this database that have been canceled due to pinned buffers",
        )
        .column(
            "confl_deadlock",
            Counter,
            "Number of queries in this database that have been canceled due to deadlocks",
        )
}

fn locks() -> QueryMapping {
    builtin("pg_locks")
        .query(
            VersionRange::any(),
            r#"
            SELECT pg_database.datname, tmp.mode, COALESCE(count, 0) AS count
            FROM (
                VALUES ('accesssharelock'), ('rowsharelock'), ('rowexclusivelock'),
                       ('shareupdateexclusivelock'), ('sharelock'), ('sharerowexclusivelock'),
                       ('exclusivelock'), ('accessexclusivelock'), ('sireadlock')
            ) AS tmp(mode)
            CROSS JOIN pg_database
            LEFT JOIN (
                SELECT database, lower(mode) AS mode, count(*) AS count
                FROM pg_locks
                WHERE database IS NOT NULL
                GROUP BY database, lower(mode)
            ) AS tmp2 ON tmp.mode = tmp2.mode AND pg_database.oid = tmp2.database
            ORDER BY 1, 2
            "#,
        )
        .column("datname", Label, "Name of this database")
        .column("mode", Label, "Type of Lock")
        .column("count", Gauge, "Number of locks")
}

fn stat_replication() -> QueryMapping {
    builtin("pg_stat_replication")
        .query(
            VersionRange::at_least(v(10, 0)),
            r#"
            SELECT
                application_name,
                COALESCE(client_addr::text, '') AS client_addr,
                state,
                sync_state,
                sync_priority,
                CASE pg_is_in_recovery() WHEN 't' THEN NULL
                    ELSE pg_wal_lsn_diff(pg_current_wal_lsn(), pg_lsn('0/0'))::float END AS pg_current_wal_lsn_bytes,
                CASE pg_is_in_recovery() WHEN 't' THEN NULL
                    ELSE pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn)::float END AS pg_wal_lsn_diff,
                replay_lag
            FROM pg_stat_replication
            "#,
        )
        .query(
            VersionRange::between(v(9, 2), v(10, 0)),
            r#"
            SELECT
                application_name,
                COALESCE(client_addr::text, '') AS client_addr,
                state,
                sync_state,
                sync_priority,
                CASE pg_is_in_recovery() WHEN 't' THEN NULL
                    ELSE pg_xlog_location_diff(pg_current_xlog_location(), '0/0')::float END AS pg_current_wal_lsn_bytes,
                CASE pg_is_in_recovery() WHEN 't' THEN NULL
                    ELSE pg_xlog_location_diff(pg_current_xlog_location(), replay_location)::float END AS pg_wal_lsn_diff,
                NULL::interval AS replay_lag
            FROM pg_stat_replication
            "#,
        )
        .column("application_name", Label, "Name of the application that is connected to this WAL sender")
        .column("client_addr", Label, "IP address of the client connected to this WAL sender")
        .column("state", Label, "Current WAL sender state")
        .column("sync_state", Label, "Synchronous state of this standby server")
        .column("sync_priority", Discard, "Priority of this standby server for being chosen as the synchronous standby")
        .column(
            "pg_current_wal_lsn_bytes",
            Gauge,
            "WAL position in bytes",
        )
        .column("pg_wal_lsn_diff", Gauge, "Lag in bytes between master and slave")
        .column("replay_lag", Duration, "Time elapsed between flushing recent WAL locally and receiving notification that the standby applied it")
}

fn replication_slots() -> QueryMapping {
    builtin("pg_replication_slots")
        .query(
            VersionRange::at_least(v(10, 0)),
            r#"
            SELECT
                slot_name,
                COALESCE(database, '') AS database,
                active,
                CASE pg_is_in_recovery() WHEN 't' THEN NULL
                    ELSE pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn)::float END AS pg_wal_lsn_diff
            FROM pg_replication_slots
            "#,
        )
        .query(
            VersionRange::between(v(9, 4), v(10, 0)),
            r#"
            SELECT
                slot_name,
                COALESCE(database, '') AS database,
                active,
                CASE pg_is_in_recovery() WHEN 't' THEN NULL
                    ELSE pg_xlog_location_diff(pg_current_xlog_location(), restart_lsn)::float END AS pg_wal_lsn_diff
            FROM pg_replication_slots
            "#,
        )
        .column("slot_name", Label, "Name of the replication slot")
        .column("database", Label, "Name of the database")
        .column("active", Gauge, "Flag indicating if the slot is active")
        .column("pg_wal_lsn_diff", Gauge, "Replication lag in bytes")
}

fn stat_archiver() -> QueryMapping {
    builtin("pg_stat_archiver")
        .query(
            VersionRange::at_least(v(9, 4)),
            r#"
            SELECT
                archived_count,
                failed_count,
                EXTRACT(EPOCH FROM now() - last_archived_time) AS last_archive_age
            FROM pg_stat_archiver
            "#,
        )
        .column("archived_count", Counter, "Number of WAL files that have been successfully archived")
        .column("failed_count", Counter, "Number of failed attempts for archiving WAL files")
        .column("last_archive_age", Gauge, "Time in seconds since last WAL segment was successfully archived")
}

fn stat_activity() -> QueryMapping {
    builtin("pg_stat_activity")
        .query(
            VersionRange::at_least(v(9, 2)),
            r#"
            SELECT
                pg_database.datname,
                tmp.state,
                COALESCE(count, 0) AS count,
                COALESCE(max_tx_duration, 0) AS max_tx_duration
            FROM (
                VALUES ('active'), ('idle'), ('idle in transaction'),
                       ('idle in transaction (aborted)'), ('fastpath function call'), ('disabled')
            ) AS tmp(state)
            CROSS JOIN pg_database
            LEFT JOIN (
                SELECT
                    datname,
                    state,
                    count(*) AS count,
                    MAX(EXTRACT(EPOCH FROM now() - xact_start))::float AS max_tx_duration
                FROM pg_stat_activity
                GROUP BY datname, state
            ) AS tmp2 ON tmp.state = tmp2.state AND pg_database.datname = tmp2.datname
            ORDER BY 1, 2
            "#,
        )
        .column("datname", Label, "Name of this database")
        .column("state", Label, "Connection state")
        .column("count", Gauge, "Number of connections in this state")
        .column("max_tx_duration", Gauge, "Max duration in seconds any active transaction has been running")
}

fn database() -> QueryMapping {
    builtin("pg_database")
        .query(
            VersionRange::any(),
            "SELECT datname, pg_database_size(datname) AS size_bytes FROM pg_database WHERE datallowconn",
        )
        .column("datname", Label, "Name of the database")
        .column("size_bytes", Gauge, "Disk space used by the database")
}

fn postmaster() -> QueryMapping {
    builtin("pg_postmaster")
        .query(
            VersionRange::any(),
            "SELECT pg_postmaster_start_time() AS start_time_seconds",
        )
        .column("start_time_seconds", Gauge, "Time at which postmaster started")
}
