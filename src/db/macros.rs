//! Declarative helpers for building statements and dispatching on backends.

/// Build a `Vec<QueryParam>` from heterogeneous values.
///
/// Every expression is converted with `QueryParam::from`.
///
/// # Example
///
/// ```ignore
/// let args = params![42, "O'Brien", None::<i64>];
/// db.exec(&ctx, &query, &args).await?;
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::models::QueryParam>::new()
    };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::models::QueryParam::from($value)),+]
    };
}

/// Macro for generating backend dispatch match arms.
///
/// Generates the match over the `DbPool` (or `DbTransaction`) variants so
/// that per-backend code stays linear.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbPool, pool, {
///     Postgres(p) => postgres::execute(p, sql, args).await,
///     SQLite(p) => sqlite::execute(p, sql, args).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($kind:ident, $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $crate::db::$kind::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
pub use params;
