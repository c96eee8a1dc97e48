//! `QueryParam` binding for the sqlx-backed sessions.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

/// Defines a binder for one database; only timestamps differ between them.
macro_rules! define_binder {
    ($name:ident<$lt:lifetime>, $db:ty, $args:ty, |$ts:ident| $bind_ts:expr) => {
        pub(crate) fn $name<$lt>(
            query: Query<$lt, $db, $args>,
            param: &$lt QueryParam,
        ) -> Query<$lt, $db, $args> {
            match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Bytes(v) => query.bind(v.as_slice()),
                QueryParam::Timestamp($ts) => query.bind($bind_ts),
            }
        }
    };
}

define_binder!(bind_mysql_param<'q>, MySql, MySqlArguments, |ts| *ts);
define_binder!(bind_postgres_param<'q>, Postgres, PgArguments, |ts| *ts);
// SQLite has no timestamp type; RFC 3339 text sorts and parses back cleanly
define_binder!(bind_sqlite_param<'q>, Sqlite, SqliteArguments<'q>, |ts| ts.to_rfc3339());
