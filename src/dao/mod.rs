/// Storage error types shared by the token stores.
pub mod storage;
/// Persistence of the session access token.
pub mod token_store;
