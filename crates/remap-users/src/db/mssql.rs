//! SQL Server backend built on tiberius with bb8 connection pooling.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::catalog::UserFkCatalogEntry;
use crate::config::{RemapPolicy, TargetConfig};
use crate::db::{ColumnDef, IsolationLevel, LoadSession, RemapDb, SqlLit};
use crate::error::{RemapError, Result};
use crate::mapper::{SourceUser, TargetUser, UserMappingEntry};
use crate::report::ColumnRewriteSummary;
use crate::schema::{SchemaForeignKey, SchemaTable};

/// Rows per multi-row INSERT statement (SQL Server caps VALUES at 1000).
const INSERT_CHUNK_ROWS: usize = 500;

/// Maximum audit rows recorded in ctl.UserKeyChanges per rewritten column.
const AUDIT_ROW_CAP: i64 = 1000;

/// Idempotent DDL for the ctl bookkeeping tables and the stg namespace.
const CONTROL_SCHEMA_DDL: &str = r#"
    IF SCHEMA_ID('ctl') IS NULL EXEC('CREATE SCHEMA ctl');
    IF SCHEMA_ID('stg') IS NULL EXEC('CREATE SCHEMA stg');
    IF OBJECT_ID('ctl.UserFkCatalog') IS NULL
    CREATE TABLE ctl.UserFkCatalog (
        TableSchema sysname NOT NULL,
        TableName sysname NOT NULL,
        ColumnName sysname NOT NULL,
        PathHint nvarchar(4000) NULL,
        CONSTRAINT PK_UserFkCatalog PRIMARY KEY (TableSchema, TableName, ColumnName)
    );
    IF OBJECT_ID('ctl.UserMap') IS NULL
    CREATE TABLE ctl.UserMap (
        SourceEnv nvarchar(64) NOT NULL,
        SourceUserId bigint NOT NULL,
        SourceEmail nvarchar(256) NULL,
        SourceUserName nvarchar(256) NULL,
        SourceEmpNo nvarchar(64) NULL,
        TargetUserId bigint NOT NULL,
        MatchReason nvarchar(64) NOT NULL,
        CONSTRAINT PK_UserMap PRIMARY KEY (SourceEnv, SourceUserId)
    );
    IF OBJECT_ID('ctl.UserKeyChanges') IS NULL
    CREATE TABLE ctl.UserKeyChanges (
        ChangeId bigint IDENTITY(1,1) NOT NULL PRIMARY KEY,
        SourceEnv nvarchar(64) NOT NULL,
        TableSchema sysname NOT NULL,
        TableName sysname NOT NULL,
        ColumnName sysname NOT NULL,
        OldUserId bigint NULL,
        NewUserId bigint NULL,
        ChangedAtUtc datetime2 NOT NULL
    );
"#;

type MssqlClient = Client<Compat<TcpStream>>;

fn quote(part: &str) -> String {
    format!("[{}]", part.replace(']', "]]"))
}

fn qualified(table: &SchemaTable) -> String {
    format!("{}.{}", quote(&table.schema), quote(&table.name))
}

/// Staging tables live flat under `stg`, prefixed with the source schema so
/// same-named tables in different schemas cannot collide.
fn staging_name(table: &SchemaTable) -> String {
    format!("[stg].{}", quote(&format!("{}_{}", table.schema, table.name)))
}

/// Audit INSERT for one column rewrite. The recorded NewUserId follows the
/// active policy: Reassign records the fallback an unmatched row will
/// receive, Prune records the bare map target so unmatched rows show NULL
/// whether they get nulled or deleted.
fn audit_insert_sql(
    entry: &UserFkCatalogEntry,
    policy: RemapPolicy,
    fallback_user_id: Option<i64>,
    env: &str,
    staged: &str,
    col: &str,
) -> String {
    let new_value = match policy {
        RemapPolicy::Reassign => format!(
            "COALESCE(m.TargetUserId, {})",
            fallback_user_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "NULL".to_string())
        ),
        RemapPolicy::Prune => "m.TargetUserId".to_string(),
    };
    format!(
        "INSERT INTO ctl.UserKeyChanges
            (SourceEnv, TableSchema, TableName, ColumnName, OldUserId, NewUserId, ChangedAtUtc)
         SELECT TOP ({cap}) {env}, {schema}, {tname}, {cname},
                s.{col}, {new_value}, SYSUTCDATETIME()
         FROM {staged} s
         LEFT JOIN ctl.UserMap m
            ON m.SourceEnv = {env} AND m.SourceUserId = s.{col}
         WHERE s.{col} IS NOT NULL
           AND (m.TargetUserId IS NULL OR m.TargetUserId <> s.{col})",
        cap = AUDIT_ROW_CAP,
        env = env,
        schema = SqlLit::Text(entry.table_schema.clone()).to_mssql_literal(),
        tname = SqlLit::Text(entry.table_name.clone()).to_mssql_literal(),
        cname = SqlLit::Text(entry.column_name.clone()).to_mssql_literal(),
        col = col,
        new_value = new_value,
        staged = staged,
    )
}

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: TargetConfig,
}

impl TiberiusConnectionManager {
    fn new(config: TargetConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pooled SQL Server implementation of [`RemapDb`].
pub struct MssqlDb {
    pool: Pool<TiberiusConnectionManager>,
    command_timeout: Duration,
}

impl MssqlDb {
    /// Connect to the target database and verify the connection.
    pub async fn connect(config: &TargetConfig, command_timeout: Duration) -> Result<Self> {
        Self::with_max_connections(config, command_timeout, 8).await
    }

    pub async fn with_max_connections(
        config: &TargetConfig,
        command_timeout: Duration,
        max_size: u32,
    ) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .build(manager)
            .await
            .map_err(|e| RemapError::pool(format!("failed to create pool: {}", e), "connect"))?;

        let db = Self {
            pool,
            command_timeout,
        };
        db.ping().await?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            pool_size = max_size,
            "connected to target"
        );
        Ok(db)
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| RemapError::pool(format!("failed to get connection: {}", e), "checkout"))
    }

    /// Execute a statement, discarding any result rows.
    async fn execute(&self, client: &mut MssqlClient, sql: &str) -> Result<u64> {
        let fut = client.execute(sql, &[]);
        match timeout(self.command_timeout, fut).await {
            Ok(res) => Ok(res?.total()),
            Err(_) => Err(RemapError::Timeout(self.command_timeout)),
        }
    }

    /// Run a query and collect its first result set.
    async fn query_first_result(
        &self,
        client: &mut MssqlClient,
        sql: &str,
    ) -> Result<Vec<tiberius::Row>> {
        let fut = async { client.simple_query(sql).await?.into_first_result().await };
        match timeout(self.command_timeout, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(RemapError::Timeout(self.command_timeout)),
        }
    }

    /// Single-column PK name for a table, used as the identity column.
    async fn primary_key_column(
        &self,
        client: &mut MssqlClient,
        table: &SchemaTable,
    ) -> Result<String> {
        let sql = r#"
            SELECT c.COLUMN_NAME
            FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
                ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
                AND c.TABLE_NAME = tc.TABLE_NAME
            WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
              AND tc.TABLE_SCHEMA = @P1
              AND tc.TABLE_NAME = @P2
            ORDER BY c.ORDINAL_POSITION
        "#;

        let mut query = Query::new(sql);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());

        let fut = async { query.query(client).await?.into_first_result().await };
        let rows = match timeout(self.command_timeout, fut).await {
            Ok(res) => res?,
            Err(_) => return Err(RemapError::Timeout(self.command_timeout)),
        };

        let mut pk: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get::<&str, _>(0).map(String::from))
            .collect();
        match (pk.len(), pk.pop()) {
            (1, Some(col)) => Ok(col),
            _ => Err(RemapError::Discovery(format!(
                "{} must have a single-column primary key",
                table.full_name()
            ))),
        }
    }

    /// SELECT list for the four identity attributes, substituting NULL for
    /// columns the table does not have.
    async fn user_select_list(&self, table: &SchemaTable, from: &str) -> Result<(String, String)> {
        let columns = self.fetch_columns(table).await?;
        let has = |name: &str| {
            columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(name))
        };

        let mut client = self.get_client().await?;
        let id_col = self.primary_key_column(&mut client, table).await?;

        let attr = |name: &str| {
            if has(name) {
                quote(name)
            } else {
                "CAST(NULL AS nvarchar(256))".to_string()
            }
        };
        let select = format!(
            "SELECT CAST({} AS BIGINT), {}, {}, {} FROM {}",
            quote(&id_col),
            attr("Email"),
            attr("UserName"),
            attr("EmployeeNumber"),
            from
        );
        Ok((select, id_col))
    }

    fn rows_to_users(rows: Vec<tiberius::Row>) -> Vec<SourceUser> {
        rows.into_iter()
            .map(|row| SourceUser {
                id: row.get::<i64, _>(0).unwrap_or(0),
                email: row.get::<&str, _>(1).map(String::from),
                user_name: row.get::<&str, _>(2).map(String::from),
                employee_number: row.get::<&str, _>(3).map(String::from),
            })
            .collect()
    }
}

#[async_trait]
impl RemapDb for MssqlDb {
    async fn fetch_tables(&self) -> Result<Vec<SchemaTable>> {
        let mut client = self.get_client().await?;

        let sql = r#"
            SELECT t.TABLE_SCHEMA, t.TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES t
            WHERE t.TABLE_TYPE = 'BASE TABLE'
              AND t.TABLE_SCHEMA NOT IN ('ctl', 'stg')
            ORDER BY t.TABLE_SCHEMA, t.TABLE_NAME
        "#;

        let rows = self.query_first_result(&mut client, sql).await?;
        let tables = rows
            .iter()
            .map(|row| SchemaTable {
                schema: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                name: row.get::<&str, _>(1).unwrap_or_default().to_string(),
            })
            .collect::<Vec<_>>();

        info!(tables = tables.len(), "discovered target tables");
        Ok(tables)
    }

    async fn fetch_foreign_keys(&self) -> Result<Vec<SchemaForeignKey>> {
        let mut client = self.get_client().await?;

        // Single-column foreign keys only; multi-column keys never carry a
        // lone user identity.
        let sql = r#"
            SELECT
                fk.name,
                ps.name AS parent_schema,
                pt.name AS parent_table,
                pc.name AS parent_column,
                rs.name AS ref_schema,
                rt.name AS ref_table,
                rc.name AS ref_column
            FROM sys.foreign_keys fk
            JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id
            JOIN sys.tables pt ON fk.parent_object_id = pt.object_id
            JOIN sys.schemas ps ON pt.schema_id = ps.schema_id
            JOIN sys.columns pc ON fkc.parent_object_id = pc.object_id
                AND fkc.parent_column_id = pc.column_id
            JOIN sys.tables rt ON fk.referenced_object_id = rt.object_id
            JOIN sys.schemas rs ON rt.schema_id = rs.schema_id
            JOIN sys.columns rc ON fkc.referenced_object_id = rc.object_id
                AND fkc.referenced_column_id = rc.column_id
            WHERE ps.name NOT IN ('ctl', 'stg')
              AND rs.name NOT IN ('ctl', 'stg')
              AND (SELECT COUNT(*) FROM sys.foreign_key_columns x
                   WHERE x.constraint_object_id = fk.object_id) = 1
            ORDER BY fk.name
        "#;

        let rows = self.query_first_result(&mut client, sql).await?;
        let fks = rows
            .iter()
            .map(|row| SchemaForeignKey {
                name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                table: SchemaTable {
                    schema: row.get::<&str, _>(1).unwrap_or_default().to_string(),
                    name: row.get::<&str, _>(2).unwrap_or_default().to_string(),
                },
                column: row.get::<&str, _>(3).unwrap_or_default().to_string(),
                ref_table: SchemaTable {
                    schema: row.get::<&str, _>(4).unwrap_or_default().to_string(),
                    name: row.get::<&str, _>(5).unwrap_or_default().to_string(),
                },
                ref_column: row.get::<&str, _>(6).unwrap_or_default().to_string(),
            })
            .collect::<Vec<_>>();

        debug!(foreign_keys = fks.len(), "discovered foreign keys");
        Ok(fks)
    }

    async fn fetch_columns(&self, table: &SchemaTable) -> Result<Vec<ColumnDef>> {
        let mut client = self.get_client().await?;

        let sql = r#"
            SELECT
                COLUMN_NAME,
                DATA_TYPE,
                CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
            ORDER BY ORDINAL_POSITION
        "#;

        let mut query = Query::new(sql);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());

        let fut = async { query.query(&mut client).await?.into_first_result().await };
        let rows = match timeout(self.command_timeout, fut).await {
            Ok(res) => res?,
            Err(_) => return Err(RemapError::Timeout(self.command_timeout)),
        };

        Ok(rows
            .iter()
            .map(|row| ColumnDef {
                name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                data_type: row.get::<&str, _>(1).unwrap_or_default().to_string(),
                is_nullable: row.get::<i32, _>(2).unwrap_or(0) == 1,
            })
            .collect())
    }

    async fn ensure_control_schema(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        self.execute(&mut client, CONTROL_SCHEMA_DDL).await?;
        debug!("control schema ensured");
        Ok(())
    }

    async fn ensure_staging_table(&self, table: &SchemaTable) -> Result<()> {
        let mut client = self.get_client().await?;
        let staged = staging_name(table);

        let sql = format!(
            "IF OBJECT_ID('{obj}') IS NULL
                SELECT TOP 0 * INTO {staged} FROM {src}
             ELSE
                TRUNCATE TABLE {staged}",
            obj = staged.replace(['[', ']'], "").replace('\'', "''"),
            staged = staged,
            src = qualified(table),
        );

        self.execute(&mut client, &sql).await?;
        debug!(table = %table.full_name(), "staging table ready");
        Ok(())
    }

    async fn replace_fk_catalog(&self, entries: &[UserFkCatalogEntry]) -> Result<()> {
        let mut client = self.get_client().await?;

        self.execute(&mut client, "DELETE FROM ctl.UserFkCatalog")
            .await?;

        for chunk in entries.chunks(INSERT_CHUNK_ROWS) {
            let values = chunk
                .iter()
                .map(|e| {
                    format!(
                        "({}, {}, {}, {})",
                        SqlLit::Text(e.table_schema.clone()).to_mssql_literal(),
                        SqlLit::Text(e.table_name.clone()).to_mssql_literal(),
                        SqlLit::Text(e.column_name.clone()).to_mssql_literal(),
                        e.path_hint()
                            .map(|h| SqlLit::Text(h).to_mssql_literal())
                            .unwrap_or_else(|| "NULL".to_string()),
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO ctl.UserFkCatalog (TableSchema, TableName, ColumnName, PathHint) VALUES {}",
                values
            );
            self.execute(&mut client, &sql).await?;
        }

        info!(entries = entries.len(), "published user FK catalog");
        Ok(())
    }

    async fn insert_staging_rows(
        &self,
        table: &SchemaTable,
        columns: &[String],
        rows: &[Vec<SqlLit>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut client = self.get_client().await?;
        let staged = staging_name(table);
        let column_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");

        let mut inserted = 0u64;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let values = chunk
                .iter()
                .map(|row| {
                    let literals = row
                        .iter()
                        .map(SqlLit::to_mssql_literal)
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({})", literals)
                })
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                staged, column_list, values
            );
            inserted += self.execute(&mut client, &sql).await?;
        }

        debug!(table = %table.full_name(), rows = inserted, "staged snapshot rows");
        Ok(inserted)
    }

    async fn fetch_staged_source_users(
        &self,
        user_table: &SchemaTable,
    ) -> Result<Vec<SourceUser>> {
        let (select, _) = self
            .user_select_list(user_table, &staging_name(user_table))
            .await?;
        let mut client = self.get_client().await?;
        let rows = self.query_first_result(&mut client, &select).await?;
        Ok(Self::rows_to_users(rows))
    }

    async fn fetch_target_users(&self, user_table: &SchemaTable) -> Result<Vec<TargetUser>> {
        let (select, _) = self
            .user_select_list(user_table, &qualified(user_table))
            .await?;
        let mut client = self.get_client().await?;
        let rows = self.query_first_result(&mut client, &select).await?;
        Ok(Self::rows_to_users(rows)
            .into_iter()
            .map(|u| TargetUser {
                id: u.id,
                email: u.email,
                user_name: u.user_name,
                employee_number: u.employee_number,
            })
            .collect())
    }

    async fn fetch_user_map(&self, source_env: &str) -> Result<Vec<UserMappingEntry>> {
        let mut client = self.get_client().await?;

        let sql = format!(
            "SELECT SourceUserId, SourceEmail, SourceUserName, SourceEmpNo,
                    TargetUserId, MatchReason
             FROM ctl.UserMap
             WHERE SourceEnv = {}
             ORDER BY SourceUserId",
            SqlLit::Text(source_env.to_string()).to_mssql_literal()
        );

        let rows = self.query_first_result(&mut client, &sql).await?;
        Ok(rows
            .iter()
            .map(|row| UserMappingEntry {
                source_user_id: row.get::<i64, _>(0).unwrap_or(0),
                source_email: row.get::<&str, _>(1).map(String::from),
                source_user_name: row.get::<&str, _>(2).map(String::from),
                source_employee_number: row.get::<&str, _>(3).map(String::from),
                target_user_id: row.get::<i64, _>(4).unwrap_or(0),
                match_reason: row.get::<&str, _>(5).unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn replace_user_map(
        &self,
        source_env: &str,
        entries: &[UserMappingEntry],
    ) -> Result<()> {
        let mut client = self.get_client().await?;
        let env = SqlLit::Text(source_env.to_string()).to_mssql_literal();

        self.execute(
            &mut client,
            &format!("DELETE FROM ctl.UserMap WHERE SourceEnv = {}", env),
        )
        .await?;

        for chunk in entries.chunks(INSERT_CHUNK_ROWS) {
            let opt = |v: &Option<String>| {
                v.as_ref()
                    .map(|s| SqlLit::Text(s.clone()).to_mssql_literal())
                    .unwrap_or_else(|| "NULL".to_string())
            };
            let values = chunk
                .iter()
                .map(|e| {
                    format!(
                        "({}, {}, {}, {}, {}, {}, {})",
                        env,
                        e.source_user_id,
                        opt(&e.source_email),
                        opt(&e.source_user_name),
                        opt(&e.source_employee_number),
                        e.target_user_id,
                        SqlLit::Text(e.match_reason.clone()).to_mssql_literal(),
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO ctl.UserMap (SourceEnv, SourceUserId, SourceEmail, SourceUserName,
                 SourceEmpNo, TargetUserId, MatchReason) VALUES {}",
                values
            );
            self.execute(&mut client, &sql).await?;
        }

        info!(entries = entries.len(), source_env, "persisted user map");
        Ok(())
    }

    async fn rewrite_staged_column(
        &self,
        entry: &UserFkCatalogEntry,
        policy: RemapPolicy,
        fallback_user_id: Option<i64>,
        source_env: &str,
    ) -> Result<ColumnRewriteSummary> {
        let table = entry.table();
        let staged = staging_name(&table);
        let col = quote(&entry.column_name);
        let env = SqlLit::Text(source_env.to_string()).to_mssql_literal();

        let column_nullable = self
            .fetch_columns(&table)
            .await?
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&entry.column_name))
            .map(|c| c.is_nullable)
            .ok_or_else(|| {
                RemapError::rewrite(
                    table.full_name(),
                    &entry.column_name,
                    "column not found in target schema",
                )
            })?;

        let mut client = self.get_client().await?;

        // Counters come from the pre-rewrite state; the updates below are
        // each single set-based statements, so the counts stay accurate.
        let count_sql = format!(
            "SELECT
                COUNT_BIG(s.{col}) AS total,
                SUM(CASE WHEN s.{col} IS NOT NULL AND m.SourceUserId IS NULL
                    THEN CAST(1 AS BIGINT) ELSE CAST(0 AS BIGINT) END) AS unmatched
             FROM {staged} s
             LEFT JOIN ctl.UserMap m
                ON m.SourceEnv = {env} AND m.SourceUserId = s.{col}",
            col = col,
            staged = staged,
            env = env,
        );
        let rows = self.query_first_result(&mut client, &count_sql).await?;
        let (total, unmatched) = rows
            .first()
            .map(|r| {
                (
                    r.get::<i64, _>(0).unwrap_or(0),
                    r.get::<i64, _>(1).unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));
        let matched = total - unmatched;

        // Audit sample before anything changes.
        let audit_sql = audit_insert_sql(entry, policy, fallback_user_id, &env, &staged, &col);
        self.execute(&mut client, &audit_sql).await?;

        let (remapped, reassigned, pruned, unmapped) = match policy {
            RemapPolicy::Reassign => {
                let fallback = fallback_user_id.ok_or_else(|| {
                    RemapError::rewrite(
                        table.full_name(),
                        &entry.column_name,
                        "reassign policy requires a fallback user id",
                    )
                })?;
                // One pass: mapped values take their target id, the rest
                // take the fallback. A second pass would re-read already
                // rewritten ids, so everything happens in this statement.
                let sql = format!(
                    "UPDATE s SET s.{col} = COALESCE(m.TargetUserId, {fallback})
                     FROM {staged} s
                     LEFT JOIN ctl.UserMap m
                        ON m.SourceEnv = {env} AND m.SourceUserId = s.{col}
                     WHERE s.{col} IS NOT NULL",
                    col = col,
                    fallback = fallback,
                    staged = staged,
                    env = env,
                );
                self.execute(&mut client, &sql).await?;
                (matched, unmatched, 0, 0)
            }
            RemapPolicy::Prune => {
                if column_nullable {
                    let null_sql = format!(
                        "UPDATE s SET s.{col} = NULL
                         FROM {staged} s
                         LEFT JOIN ctl.UserMap m
                            ON m.SourceEnv = {env} AND m.SourceUserId = s.{col}
                         WHERE s.{col} IS NOT NULL AND m.SourceUserId IS NULL",
                        col = col,
                        staged = staged,
                        env = env,
                    );
                    self.execute(&mut client, &null_sql).await?;
                } else {
                    let delete_sql = format!(
                        "DELETE s
                         FROM {staged} s
                         LEFT JOIN ctl.UserMap m
                            ON m.SourceEnv = {env} AND m.SourceUserId = s.{col}
                         WHERE s.{col} IS NOT NULL AND m.SourceUserId IS NULL",
                        col = col,
                        staged = staged,
                        env = env,
                    );
                    self.execute(&mut client, &delete_sql).await?;
                }
                // Remaining non-null values all have a map row.
                let remap_sql = format!(
                    "UPDATE s SET s.{col} = m.TargetUserId
                     FROM {staged} s
                     JOIN ctl.UserMap m
                        ON m.SourceEnv = {env} AND m.SourceUserId = s.{col}",
                    col = col,
                    staged = staged,
                    env = env,
                );
                self.execute(&mut client, &remap_sql).await?;
                (matched, 0, unmatched, 0)
            }
        };

        if unmatched > 0 {
            warn!(
                table = %table.full_name(),
                column = %entry.column_name,
                unmatched,
                policy = ?policy,
                "unmapped identities handled by policy"
            );
        }

        Ok(ColumnRewriteSummary {
            remapped_rows: remapped,
            reassigned_rows: reassigned,
            pruned_rows: pruned,
            unmapped_rows: unmapped,
            policy,
        })
    }

    async fn begin_load(&self, isolation: IsolationLevel) -> Result<Box<dyn LoadSession>> {
        let mut conn = self.pool.get_owned().await.map_err(|e| {
            RemapError::pool(format!("failed to get connection: {}", e), "begin_load")
        })?;

        let level = match isolation {
            IsolationLevel::Snapshot => "SNAPSHOT",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
        };
        let sql = format!(
            "SET TRANSACTION ISOLATION LEVEL {}; SET XACT_ABORT ON; BEGIN TRANSACTION;",
            level
        );
        let fut = conn.execute(&sql, &[]);
        match timeout(self.command_timeout, fut).await {
            Ok(res) => {
                res?;
            }
            Err(_) => return Err(RemapError::Timeout(self.command_timeout)),
        }

        // BEGIN TRANSACTION succeeds even when ALLOW_SNAPSHOT_ISOLATION is
        // OFF; error 3952 only fires at the first data access. Read inside
        // the transaction now so the caller can fall back to another
        // isolation level before any work happens.
        let first_read = async {
            conn.simple_query("SELECT TOP (1) 1 FROM sys.objects")
                .await?
                .into_row()
                .await
        };
        match timeout(self.command_timeout, first_read).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                conn.execute("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION", &[])
                    .await
                    .ok();
                return Err(e.into());
            }
            Err(_) => return Err(RemapError::Timeout(self.command_timeout)),
        }

        info!(isolation = level, "opened load transaction");
        Ok(Box::new(MssqlLoadSession {
            conn,
            command_timeout: self.command_timeout,
        }))
    }

    async fn count_disabled_foreign_keys(&self) -> Result<i64> {
        let mut client = self.get_client().await?;
        let rows = self
            .query_first_result(
                &mut client,
                "SELECT COUNT_BIG(*) FROM sys.foreign_keys WHERE is_disabled = 1",
            )
            .await?;
        Ok(rows.first().and_then(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    async fn count_untrusted_foreign_keys(&self) -> Result<i64> {
        let mut client = self.get_client().await?;
        let rows = self
            .query_first_result(
                &mut client,
                "SELECT COUNT_BIG(*) FROM sys.foreign_keys
                 WHERE is_disabled = 0 AND is_not_trusted = 1",
            )
            .await?;
        Ok(rows.first().and_then(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    async fn count_orphan_rows(&self, fk: &SchemaForeignKey) -> Result<i64> {
        let mut client = self.get_client().await?;
        let sql = format!(
            "SELECT COUNT_BIG(*)
             FROM {child} c
             LEFT JOIN {parent} p ON p.{ref_col} = c.{col}
             WHERE c.{col} IS NOT NULL AND p.{ref_col} IS NULL",
            child = qualified(&fk.table),
            parent = qualified(&fk.ref_table),
            col = quote(&fk.column),
            ref_col = quote(&fk.ref_column),
        );
        let rows = self.query_first_result(&mut client, &sql).await?;
        Ok(rows.first().and_then(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        self.query_first_result(&mut client, "SELECT 1").await?;
        Ok(())
    }

    async fn close(&self) {
        // bb8 drops pooled tiberius clients when the pool is dropped.
    }
}

/// One load transaction pinned to a single pooled connection.
struct MssqlLoadSession {
    conn: PooledConnection<'static, TiberiusConnectionManager>,
    command_timeout: Duration,
}

impl MssqlLoadSession {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let fut = self.conn.execute(sql, &[]);
        match timeout(self.command_timeout, fut).await {
            Ok(res) => Ok(res?.total()),
            Err(_) => Err(RemapError::Timeout(self.command_timeout)),
        }
    }

    async fn query_scalar_i64(&mut self, sql: &str) -> Result<i64> {
        let fut = async { self.conn.simple_query(sql).await?.into_row().await };
        match timeout(self.command_timeout, fut).await {
            Ok(res) => Ok(res?.and_then(|r| r.get::<i64, _>(0)).unwrap_or(0)),
            Err(_) => Err(RemapError::Timeout(self.command_timeout)),
        }
    }

    async fn query_strings(&mut self, sql: &str) -> Result<Vec<String>> {
        let fut = async { self.conn.simple_query(sql).await?.into_first_result().await };
        let rows = match timeout(self.command_timeout, fut).await {
            Ok(res) => res?,
            Err(_) => return Err(RemapError::Timeout(self.command_timeout)),
        };
        Ok(rows
            .iter()
            .filter_map(|r| r.get::<&str, _>(0).map(String::from))
            .collect())
    }
}

#[async_trait]
impl LoadSession for MssqlLoadSession {
    async fn disable_constraint(&mut self, fk: &SchemaForeignKey) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} NOCHECK CONSTRAINT {}",
            qualified(&fk.table),
            quote(&fk.name)
        );
        self.execute(&sql).await?;
        debug!(constraint = %fk.name, "constraint disabled");
        Ok(())
    }

    async fn swap_in_staged_rows(&mut self, table: &SchemaTable) -> Result<u64> {
        let target = qualified(table);
        let staged = staging_name(table);

        let columns_sql = format!(
            "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {}
             ORDER BY ORDINAL_POSITION",
            SqlLit::Text(table.schema.clone()).to_mssql_literal(),
            SqlLit::Text(table.name.clone()).to_mssql_literal(),
        );
        let columns = self.query_strings(&columns_sql).await?;
        if columns.is_empty() {
            return Err(RemapError::Load(format!(
                "no columns found for {}",
                table.full_name()
            )));
        }
        let column_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");

        let has_identity = self
            .query_scalar_i64(&format!(
                "SELECT CAST(ISNULL(OBJECTPROPERTY(OBJECT_ID({}), 'TableHasIdentity'), 0) AS BIGINT)",
                SqlLit::Text(table.full_name()).to_mssql_literal()
            ))
            .await?
            == 1;

        self.execute(&format!("DELETE FROM {}", target)).await?;

        let insert = format!(
            "INSERT INTO {target} ({cols}) SELECT {cols} FROM {staged}",
            target = target,
            cols = column_list,
            staged = staged,
        );
        let insert = if has_identity {
            format!(
                "SET IDENTITY_INSERT {target} ON; {insert}; SET IDENTITY_INSERT {target} OFF;",
                target = target,
                insert = insert,
            )
        } else {
            insert
        };
        self.execute(&insert).await?;

        let loaded = self
            .query_scalar_i64(&format!("SELECT COUNT_BIG(*) FROM {}", target))
            .await?;
        debug!(table = %table.full_name(), rows = loaded, "swapped staged rows in");
        Ok(loaded as u64)
    }

    async fn enable_constraint(&mut self, fk: &SchemaForeignKey) -> Result<()> {
        // WITH CHECK revalidates existing rows so the key comes back trusted.
        let sql = format!(
            "ALTER TABLE {} WITH CHECK CHECK CONSTRAINT {}",
            qualified(&fk.table),
            quote(&fk.name)
        );
        self.execute(&sql).await?;
        debug!(constraint = %fk.name, "constraint re-enabled and trusted");
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.execute("COMMIT TRANSACTION").await?;
        info!("load transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.execute("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await?;
        warn!("load transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> UserFkCatalogEntry {
        UserFkCatalogEntry {
            table_schema: "dbo".to_string(),
            table_name: "Order".to_string(),
            column_name: "CreatedBy".to_string(),
            path_segments: Vec::new(),
        }
    }

    #[test]
    fn test_bracket_quoting_escapes_closing_brackets() {
        assert_eq!(quote("Order"), "[Order]");
        assert_eq!(quote("Weird]Name"), "[Weird]]Name]");
        assert_eq!(qualified(&SchemaTable::parse("dbo.Order")), "[dbo].[Order]");
    }

    #[test]
    fn test_staging_name_carries_source_schema() {
        assert_eq!(
            staging_name(&SchemaTable::parse("sales.Order")),
            "[stg].[sales_Order]"
        );
    }

    #[test]
    fn test_control_schema_uses_user_map_column_names() {
        assert!(CONTROL_SCHEMA_DDL.contains("SourceEmpNo nvarchar(64) NULL"));
        assert!(!CONTROL_SCHEMA_DDL.contains("SourceEmployeeNumber"));
        assert!(CONTROL_SCHEMA_DDL.contains("PRIMARY KEY (SourceEnv, SourceUserId)"));
        assert!(CONTROL_SCHEMA_DDL.contains("PRIMARY KEY (TableSchema, TableName, ColumnName)"));
    }

    #[test]
    fn test_audit_new_user_id_follows_policy() {
        let reassign = audit_insert_sql(
            &entry(),
            RemapPolicy::Reassign,
            Some(999),
            "N'PROD'",
            "[stg].[dbo_Order]",
            "[CreatedBy]",
        );
        assert!(reassign.contains("COALESCE(m.TargetUserId, 999)"));

        // Under Prune an unmatched row ends up NULL or deleted, so the
        // audit must not invent a fallback id for it.
        let prune = audit_insert_sql(
            &entry(),
            RemapPolicy::Prune,
            Some(999),
            "N'PROD'",
            "[stg].[dbo_Order]",
            "[CreatedBy]",
        );
        assert!(!prune.contains("COALESCE"));
        assert!(!prune.contains("999"));
        assert!(prune.contains("s.[CreatedBy], m.TargetUserId, SYSUTCDATETIME()"));
    }
}
