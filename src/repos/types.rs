use failure::Error as FailureError;

pub type RepoResult<T> = Result<T, FailureError>;
