use shared::{
    domain::{is_numeric_username, UserId},
    error::ApiError,
};
use storage::{NewUser, StoredUser};
use tracing::{info, warn};

use crate::{persistence, RelayContext};

#[derive(Debug, Clone, Default)]
pub struct SignupRequest {
    pub username: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

async fn hash_password(password: String, cost: u32) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|err| persistence(err.into()))?
        .map_err(|err| persistence(err.into()))
}

async fn verify_password(password: String, hash: String) -> Result<bool, ApiError> {
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|err| persistence(err.into()))?;
    match verified {
        Ok(matches) => Ok(matches),
        Err(error) => {
            // An unreadable stored hash can never match.
            warn!(%error, "stored password hash could not be verified");
            Ok(false)
        }
    }
}

pub async fn signup(ctx: &RelayContext, request: SignupRequest) -> Result<UserId, ApiError> {
    let username = request.username.trim();
    if username.is_empty() {
        return Err(ApiError::validation("username is required"));
    }
    if request.password.is_empty() {
        return Err(ApiError::validation("password is required"));
    }
    if request.first_name.trim().is_empty() {
        return Err(ApiError::validation("first name is required"));
    }
    if is_numeric_username(username) {
        return Err(ApiError::validation("username cannot be a number"));
    }

    let password_hash = hash_password(request.password.clone(), ctx.settings.bcrypt_cost).await?;
    let new_user = NewUser {
        username,
        first_name: request.first_name.trim(),
        last_name: request.last_name.trim(),
        password_hash: &password_hash,
    };

    let user_id = ctx
        .store
        .create_user(&new_user)
        .await
        .map_err(persistence)?
        .ok_or_else(|| ApiError::conflict("username is already taken"))?;
    info!(%user_id, username, "user signed up");
    Ok(user_id)
}

pub async fn signin(
    ctx: &RelayContext,
    username: &str,
    password: &str,
) -> Result<StoredUser, ApiError> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(ApiError::validation("username and password are required"));
    }

    let credential = ctx
        .store
        .load_credential(username)
        .await
        .map_err(persistence)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;

    if !verify_password(password.to_string(), credential.password_hash).await? {
        return Err(ApiError::auth_failure("invalid password"));
    }

    if let Err(error) = ctx.store.touch_last_login(credential.user.user_id).await {
        warn!(user_id = %credential.user.user_id, error = %format!("{error:#}"), "failed to record login");
    }
    Ok(credential.user)
}
