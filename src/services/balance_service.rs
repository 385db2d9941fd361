//! Balance reads and the conditional point updates the exchange saga is built from.
//!
//! All statements bind their values; nothing is formatted into SQL.
//! Both stores are assumed to expose `users(tg_id BIGINT, points BIGINT)`.

use sqlx::PgConnection;

use crate::{db::DbPool, error::StoreError, models::balance::UserKey};

/// Fetch the user's points.
///
/// Returns `None` when no row matches, meaning the user is not registered or not
/// linked in that store. A missing record is never reported as zero points.
pub async fn get_balance(pool: &DbPool, user_key: UserKey) -> Result<Option<i64>, StoreError> {
    let mut conn = pool.acquire().await?;

    let points = sqlx::query_scalar::<_, i64>("SELECT points FROM users WHERE tg_id = $1")
        .bind(user_key)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(points)
}

/// Subtract `amount` from the user's points.
///
/// The `points >= $1` guard keeps the balance non-negative even against writers
/// outside this process. Zero affected rows means the user vanished or the balance
/// dropped below `amount` since it was read.
pub async fn debit_points(
    conn: &mut PgConnection,
    user_key: UserKey,
    amount: i64,
) -> Result<(), StoreError> {
    let updated_count = sqlx::query(
        r#"
        UPDATE users
        SET points = points - $1
        WHERE tg_id = $2 AND points >= $1
        "#,
    )
    .bind(amount)
    .bind(user_key)
    .execute(conn)
    .await?
    .rows_affected();

    expect_single_row(updated_count)
}

/// Add `amount` to the user's points.
pub async fn credit_points(
    conn: &mut PgConnection,
    user_key: UserKey,
    amount: i64,
) -> Result<(), StoreError> {
    let updated_count = sqlx::query(
        r#"
        UPDATE users
        SET points = points + $1
        WHERE tg_id = $2
        "#,
    )
    .bind(amount)
    .bind(user_key)
    .execute(conn)
    .await?
    .rows_affected();

    expect_single_row(updated_count)
}

fn expect_single_row(updated_count: u64) -> Result<(), StoreError> {
    if updated_count == 1 {
        Ok(())
    } else {
        Err(StoreError::RowCount(updated_count))
    }
}
