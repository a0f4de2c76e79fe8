use crate::cache::IndexError;

pub fn map_sqlx_error(err: sqlx::Error) -> IndexError {
    match err {
        sqlx::Error::PoolTimedOut => IndexError::Timeout,
        sqlx::Error::Database(db)
            if db.message().contains("canceling statement due to statement timeout")
                || db
                    .message()
                    .contains("canceling statement due to user request") =>
        {
            IndexError::Timeout
        }
        other => IndexError::from_persistence(other),
    }
}
