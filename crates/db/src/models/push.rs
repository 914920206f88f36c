use sqlx::SqlitePool;

/// Release membership, read from `push_pushcontents`. A request in a
/// selected state has at most one membership row.
pub struct Push;

impl Push {
    /// The push this request has been picked into, if any.
    pub async fn for_request(
        pool: &SqlitePool,
        request_id: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT push FROM push_pushcontents WHERE request = ?")
            .bind(request_id)
            .fetch_optional(pool)
            .await
    }

    /// All request ids picked into the given push, in membership order.
    pub async fn request_ids(pool: &SqlitePool, push_id: i64) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT request FROM push_pushcontents WHERE push = ? ORDER BY request",
        )
        .bind(push_id)
        .fetch_all(pool)
        .await
    }
}
