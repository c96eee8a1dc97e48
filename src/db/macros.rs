//! Dispatch macros for the sqlx-backed session.
//!
//! The session holds one of three concrete sqlx connection types; these macros
//! generate the per-dialect match arms so each operation reads linearly.

/// Generate match arms over the `SqlxSession` variants.
///
/// # Example
///
/// ```ignore
/// impl_session_dispatch!(self, {
///     MySql(conn) => run_mysql(conn),
///     Postgres(conn) => run_postgres(conn),
///     Sqlite(conn) => run_sqlite(conn),
/// });
/// ```
macro_rules! impl_session_dispatch {
    ($session:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $session {
            $(
                $crate::db::sqlx_driver::SqlxSession::$variant($c) => $body,
            )+
        }
    };
}

/// Run `sql` on a concrete sqlx connection, binding `params` with `bind`.
///
/// Parameterless statements go through `raw_sql` so multi-statement scripts work;
/// everything else is prepared and bound.
macro_rules! run_statement {
    ($conn:expr, $sql:expr, $params:expr, $bind:ident, execute) => {{
        if $params.is_empty() {
            sqlx::Executor::execute(&mut *$conn, sqlx::raw_sql($sql))
                .await
                .map(|r| r.rows_affected())
        } else {
            let mut query = sqlx::query($sql);
            for param in $params {
                query = $bind(query, param);
            }
            query.execute(&mut *$conn).await.map(|r| r.rows_affected())
        }
    }};
    ($conn:expr, $sql:expr, $params:expr, $bind:ident, fetch) => {{
        if $params.is_empty() {
            sqlx::Executor::fetch_all(&mut *$conn, sqlx::raw_sql($sql))
                .await
                .map(|rows| rows.iter().map(RowToJson::to_row).collect::<Vec<_>>())
        } else {
            let mut query = sqlx::query($sql);
            for param in $params {
                query = $bind(query, param);
            }
            query
                .fetch_all(&mut *$conn)
                .await
                .map(|rows| rows.iter().map(RowToJson::to_row).collect::<Vec<_>>())
        }
    }};
}

pub(crate) use impl_session_dispatch;
pub(crate) use run_statement;
