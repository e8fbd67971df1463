//! Identity records repository.

use crate::error::MetadataResult;
use crate::models::{AuthTokenRow, NewAuthToken, NewUser, UserRow};
use crate::query::UserQuery;
use async_trait::async_trait;

/// Repository for users and their API tokens.
///
/// Authentication itself lives elsewhere; the store only persists the rows.
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Create a user. Fails with `Constraint` if the username is taken.
    async fn create_user(&self, user: &NewUser) -> MetadataResult<UserRow>;

    /// Get the first matching user, or `NotFound`.
    async fn get_user(&self, query: &UserQuery) -> MetadataResult<UserRow>;

    async fn count_users(&self, query: &UserQuery) -> MetadataResult<u64>;

    async fn user_exists(&self, query: &UserQuery) -> MetadataResult<bool> {
        Ok(self.count_users(query).await? > 0)
    }

    /// Delete matching users (and their tokens). `NotFound` if nothing matched.
    async fn expect_delete_users(&self, query: &UserQuery) -> MetadataResult<u64>;

    /// Issue a token. `DanglingReference` if the user does not exist.
    async fn create_auth_token(&self, token: &NewAuthToken) -> MetadataResult<AuthTokenRow>;

    /// Look up a token by its value.
    async fn get_auth_token(&self, token: &str) -> MetadataResult<Option<AuthTokenRow>>;
}
