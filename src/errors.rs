/**
 * Error taxonomy for the survey core.
 *
 * Business conditions (already answered, invalid choice, missing rows) are ordinary variants
 * here so the callers can report them; only `StorageUnavailable` is ever retried.
 */
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("user {user_id} already answered question {question_id}")]
    AlreadyAnswered { user_id: i64, question_id: i64 },

    #[error("choice {choice_id} does not belong to question {question_id}")]
    InvalidChoice { question_id: i64, choice_id: i64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("choice {0} already has votes and cannot be deleted")]
    ChoiceHasVotes(i64),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(#[source] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// PostgreSQL `unique_violation`
const PG_UNIQUE_VIOLATION: &str = "23505";
/// SQLITE_CONSTRAINT_UNIQUE and SQLITE_CONSTRAINT_PRIMARYKEY
const SQLITE_UNIQUE_VIOLATIONS: [&str; 2] = ["2067", "1555"];

/// PostgreSQL `foreign_key_violation`
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";
/// SQLITE_CONSTRAINT_FOREIGNKEY
const SQLITE_FOREIGN_KEY_VIOLATION: &str = "787";

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

impl Error {
    pub fn not_found(what: &str, id: i64) -> Self {
        Error::NotFound(format!("{} {}", what, id))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if is_transient(&err) {
            Error::StorageUnavailable(err)
        } else {
            Error::Storage(err)
        }
    }
}

/**
 * Return true if the error is the database rejecting a duplicate key
 */
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match database_code(err) {
        Some(code) => code == PG_UNIQUE_VIOLATION || SQLITE_UNIQUE_VIOLATIONS.contains(&code.as_str()),
        None => false,
    }
}

/**
 * Return true if the error is a row still being referenced (or referencing nothing)
 */
pub fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match database_code(err) {
        Some(code) => code == PG_FOREIGN_KEY_VIOLATION || code == SQLITE_FOREIGN_KEY_VIOLATION,
        None => false,
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(_) => database_code(err)
            .map(|code| is_transient_code(&code))
            .unwrap_or(false),
        _ => false,
    }
}

fn is_transient_code(code: &str) -> bool {
    // PostgreSQL SQLSTATEs are always five characters
    if code.len() == 5 {
        return code.starts_with("08") || code == "40001" || code == "40P01" || code == "57P01";
    }
    // SQLite reports extended result codes; the primary code is the low byte
    match code.parse::<i64>() {
        Ok(n) => {
            let primary = n & 0xff;
            primary == SQLITE_BUSY || primary == SQLITE_LOCKED
        }
        Err(_) => false,
    }
}

fn database_code(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_retryable() {
        let err: Error = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn row_not_found_is_terminal() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(!err.is_retryable());
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn business_errors_are_terminal() {
        let err = Error::AlreadyAnswered { user_id: 1, question_id: 2 };
        assert!(!err.is_retryable());
        assert!(!Error::InvalidInput("x".into()).is_retryable());
    }

    #[test]
    fn transient_codes() {
        assert!(is_transient_code("08006"));
        assert!(is_transient_code("40001"));
        assert!(is_transient_code("5"));
        // SQLITE_BUSY_SNAPSHOT
        assert!(is_transient_code("517"));
        assert!(!is_transient_code("23505"));
        assert!(!is_transient_code("2067"));
        assert!(!is_transient_code("42501"));
    }

    #[test]
    fn not_found_message() {
        assert_eq!(Error::not_found("question", 7).to_string(), "question 7 not found");
    }
}
