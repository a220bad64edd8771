//! Engine dispatch macro.
//!
//! Pools, pooled connections and adapters are all closed enums with one
//! variant per driver family. The macro expands the same body once per
//! variant, so code that is generic over the driver reads linearly while each
//! arm is still monomorphized for its concrete sqlx type.

/// Match every driver-family variant of `$enum`, binding the payload to `$inner`.
///
/// # Example
///
/// ```ignore
/// dispatch!(DbPool, &self.pool, pool => pool.close().await)
/// ```
#[macro_export]
macro_rules! dispatch {
    ($enum:ident, $value:expr, $inner:ident => $body:expr) => {
        match $value {
            $enum::Postgres($inner) => $body,
            $enum::MySql($inner) => $body,
            $enum::Sqlite($inner) => $body,
        }
    };
}

pub use dispatch;
